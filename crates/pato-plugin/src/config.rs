//! Host configuration, read from the environment.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::bus::DEFAULT_QUEUE_CAPACITY;
use crate::capability::{Capability, CapabilitySet, ServiceAction};
use crate::events::EventPattern;
use crate::lifecycle::LifecycleConfig;
use crate::sandbox::SandboxConfig;

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub sandbox: SandboxConfig,
    pub lifecycle: LifecycleConfig,
    /// Per-subscriber event queue capacity.
    pub queue_capacity: usize,
    /// Bound on network, service, and inter-plugin gateway calls.
    pub call_timeout: Duration,
    pub plugin_dir: PathBuf,
    /// The fixed grants the UI bridge acts under.
    pub ui_capabilities: CapabilitySet,
    /// Extra event patterns forwarded to the UI besides `plugin.*`, `ui.*`
    /// and `bus.*`.
    pub ui_events: Vec<EventPattern>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            lifecycle: LifecycleConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            call_timeout: Duration::from_millis(10_000),
            plugin_dir: PathBuf::from("./plugins"),
            ui_capabilities: default_ui_capabilities(Vec::new()),
            ui_events: Vec::new(),
        }
    }
}

impl HostConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let ui_services = list_var("PATO_UI_SERVICES");
        let ui_events = list_var("PATO_UI_EVENTS")
            .iter()
            .filter_map(|raw| match EventPattern::parse(raw) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    tracing::warn!(pattern = %raw, "ignoring PATO_UI_EVENTS entry: {e}");
                    None
                }
            })
            .collect();

        Self {
            sandbox: SandboxConfig::from_env(),
            lifecycle: LifecycleConfig {
                init_timeout: millis_var("PATO_INIT_TIMEOUT_MS", 5000),
                shutdown_timeout: millis_var("PATO_SHUTDOWN_TIMEOUT_MS", 2000),
                event_timeout: millis_var("PATO_EVENT_TIMEOUT_MS", 10_000),
                mailbox_capacity: parse_var("PATO_MAILBOX_CAPACITY", 16),
            },
            queue_capacity: parse_var("PATO_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY),
            call_timeout: millis_var("PATO_CALL_TIMEOUT_MS", 10_000),
            plugin_dir: std::env::var("PATO_PLUGIN_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./plugins")),
            ui_capabilities: default_ui_capabilities(ui_services),
            ui_events,
        }
    }
}

/// The UI may subscribe to anything, emit under `ui.`, and use both
/// service actions on the listed services.
pub fn default_ui_capabilities(services: Vec<String>) -> CapabilitySet {
    let mut grants = vec![
        Capability::EventSubscribe {
            pattern: EventPattern::Any,
        },
        Capability::EventEmit {
            pattern: EventPattern::Prefix("ui.".into()),
        },
    ];
    grants.extend(services.into_iter().map(|service| Capability::ServiceApi {
        service,
        actions: BTreeSet::from([ServiceAction::SendMessage, ServiceAction::SetStatus]),
    }));
    CapabilitySet::new(grants)
}

fn parse_var<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn millis_var(key: &str, default: u64) -> Duration {
    Duration::from_millis(parse_var(key, default))
}

fn list_var(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
