//! The assembled plugin host.
//!
//! `PluginHost` constructs the long-lived collaborators (vault, bus,
//! resolver, gateway, lifecycle manager) once and tears them down
//! explicitly. Nothing here is global; everything is passed by `Arc`.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use crate::bus::{EventBus, PublishReport};
use crate::config::HostConfig;
use crate::connection::ConnectionManager;
use crate::error::PluginError;
use crate::events::EventSource;
use crate::gateway::CapabilityGateway;
use crate::lifecycle::{LifecycleManager, PluginTable};
use crate::manifest::{PluginId, PluginManifest};
use crate::resolver::InterPluginResolver;
use crate::sandbox::WasmSource;
use crate::ui::UiBridge;
use crate::vault::CredentialVault;

/// Version plugins' `min_host_version` is checked against.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Manifest file name inside a plugin directory.
pub const MANIFEST_FILE: &str = "plugin.toml";

pub struct PluginHost {
    config: HostConfig,
    vault: Arc<CredentialVault>,
    bus: Arc<EventBus>,
    resolver: Arc<InterPluginResolver>,
    gateway: Arc<CapabilityGateway>,
    lifecycle: LifecycleManager,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("config", &self.config)
            .field("vault", &self.vault)
            .finish_non_exhaustive()
    }
}

impl PluginHost {
    pub fn new(
        config: HostConfig,
        vault: Arc<CredentialVault>,
        connections: Arc<dyn ConnectionManager>,
    ) -> Self {
        let table = Arc::new(PluginTable::new());
        let bus = Arc::new(EventBus::new(config.queue_capacity));
        let resolver = Arc::new(InterPluginResolver::new());
        let gateway = Arc::new(CapabilityGateway::new(
            table.clone(),
            bus.clone(),
            vault.clone(),
            resolver.clone(),
            connections,
            config.call_timeout,
            config.ui_capabilities.clone(),
        ));
        let lifecycle = LifecycleManager::new(
            table,
            bus.clone(),
            resolver.clone(),
            gateway.clone(),
            config.lifecycle.clone(),
            HOST_VERSION,
        );
        tracing::info!(
            version = HOST_VERSION,
            queue_capacity = config.queue_capacity,
            services = ?vault.services(),
            "plugin host constructed"
        );
        Self {
            config,
            vault,
            bus,
            resolver,
            gateway,
            lifecycle,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn resolver(&self) -> &Arc<InterPluginResolver> {
        &self.resolver
    }

    pub fn gateway(&self) -> &Arc<CapabilityGateway> {
        &self.gateway
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Publish a normalized event from a connection manager (e.g.
    /// `twitch.chat.message`). The payload is redacted against the vault.
    pub fn publish_external(&self, event_type: &str, payload: Value) -> PublishReport {
        self.bus.publish(
            EventSource::Host,
            event_type,
            self.vault.redact(payload),
            None,
        )
    }

    /// Attach the UI. Fails with `AlreadyExists` while another bridge is alive.
    pub fn ui_bridge(&self) -> Result<UiBridge, PluginError> {
        UiBridge::new(
            self.bus.clone(),
            self.gateway.clone(),
            self.lifecycle.clone(),
            &self.config.ui_events,
        )
    }

    /// Load and start the plugin in `dir` (a `plugin.toml` plus its module).
    pub async fn load_wasm(&self, dir: &Path) -> Result<PluginId, PluginError> {
        let raw = tokio::fs::read_to_string(dir.join(MANIFEST_FILE)).await?;
        let manifest = PluginManifest::parse_and_validate(&raw)?;
        let source = WasmSource::from_dir(dir, &manifest, self.config.sandbox.clone())?;
        self.lifecycle.load_and_start(manifest, Arc::new(source)).await
    }

    /// Load every plugin directory under the configured plugin dir, in name
    /// order. Returns per-directory outcomes; one bad plugin never stops the
    /// rest.
    pub async fn load_plugin_dir(&self) -> Vec<(String, Result<PluginId, PluginError>)> {
        let root = &self.config.plugin_dir;
        let mut dirs = match std::fs::read_dir(root) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.join(MANIFEST_FILE).is_file())
                .collect::<Vec<_>>(),
            Err(e) => {
                tracing::warn!(dir = %root.display(), "cannot read plugin directory: {e}");
                return Vec::new();
            }
        };
        dirs.sort();

        let mut outcomes = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let result = self.load_wasm(&dir).await;
            match &result {
                Ok(id) => tracing::info!(plugin = %id, "plugin started"),
                Err(e) => tracing::error!(dir = %name, "failed to load plugin: {e}"),
            }
            outcomes.push((name, result));
        }
        outcomes
    }

    /// Shut down every plugin, close the bus, and clear the vault.
    pub async fn teardown(&self) {
        self.lifecycle.shutdown_all().await;
        self.bus.close();
        self.vault.clear();
        tracing::info!("plugin host torn down");
    }
}
