use std::process::ExitCode;
use std::sync::Arc;

use pato_plugin::{CredentialVault, HostConfig, PluginHost};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod relay;

use relay::HttpRelay;

const CREDENTIAL_PREFIX: &str = "PATO_CREDENTIAL_";

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = HostConfig::from_env();
    tracing::info!(plugin_dir = %config.plugin_dir.display(), "starting plugin host");

    // Credentials
    let vault = Arc::new(CredentialVault::new());
    for (key, secret) in std::env::vars() {
        let Some(service) = key.strip_prefix(CREDENTIAL_PREFIX) else {
            continue;
        };
        if service.is_empty() || secret.is_empty() {
            continue;
        }
        vault.insert(service.to_ascii_lowercase(), secret);
    }

    // Connection manager
    let relay = match HttpRelay::new(HttpRelay::endpoints_from_env(), config.call_timeout) {
        Ok(relay) => relay,
        Err(e) => {
            tracing::error!("failed to build relay client: {e}");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(services = ?relay.services(), "relay endpoints configured");
    for service in vault.services() {
        if !relay.services().contains(&service.as_str()) {
            tracing::warn!(service = %service, "credential has no relay endpoint");
        }
    }

    let host = PluginHost::new(config, vault, Arc::new(relay));
    let ui = match host.ui_bridge() {
        Ok(ui) => ui,
        Err(e) => {
            tracing::error!("failed to attach UI bridge: {e}");
            return ExitCode::FAILURE;
        }
    };

    let outcomes = host.load_plugin_dir().await;
    let started = outcomes.iter().filter(|(_, r)| r.is_ok()).count();
    tracing::info!(started, failed = outcomes.len() - started, "plugins loaded");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
            event = ui.next_event() => {
                let Some(event) = event else { break };
                tracing::info!(
                    event = %event.event_type,
                    source = %event.source,
                    sequence = event.sequence,
                    payload = %event.payload,
                    "ui event"
                );
            }
        }
    }

    host.teardown().await;
    ExitCode::SUCCESS
}
