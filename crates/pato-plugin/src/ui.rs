//! UI bridge: the UI collaborator's view of the host.
//!
//! The bridge is an ordinary bus subscriber filtered to UI-relevant event
//! types, plus a gateway entry point scoped to the host's fixed UI grants.
//! One bridge per host at a time; dropping it detaches the UI from the bus
//! and lets a new one be created.

use std::sync::Arc;

use serde_json::Value;

use crate::bus::{EventBus, Subscriber, SubscriberQueue};
use crate::error::PluginError;
use crate::events::{Event, EventPattern};
use crate::gateway::{CapabilityGateway, HostCall};
use crate::lifecycle::{LifecycleManager, PluginSummary};
use crate::manifest::PluginId;

/// Event namespaces always forwarded to the UI.
pub const UI_EVENT_PATTERNS: &[&str] = &["plugin.*", "ui.*", "bus.*"];

pub struct UiBridge {
    bus: Arc<EventBus>,
    gateway: Arc<CapabilityGateway>,
    lifecycle: LifecycleManager,
    queue: Arc<SubscriberQueue>,
}

impl std::fmt::Debug for UiBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UiBridge")
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl UiBridge {
    pub fn new(
        bus: Arc<EventBus>,
        gateway: Arc<CapabilityGateway>,
        lifecycle: LifecycleManager,
        extra: &[EventPattern],
    ) -> Result<Self, PluginError> {
        let queue = bus
            .attach_new(Subscriber::Ui)
            .ok_or_else(|| PluginError::AlreadyExists("ui bridge".into()))?;
        // Built first so a failed subscribe detaches again on drop.
        let bridge = Self {
            bus,
            gateway,
            lifecycle,
            queue,
        };
        for raw in UI_EVENT_PATTERNS {
            bridge
                .bus
                .subscribe(&Subscriber::Ui, EventPattern::parse(raw)?)?;
        }
        for pattern in extra {
            bridge.bus.subscribe(&Subscriber::Ui, pattern.clone())?;
        }
        Ok(bridge)
    }

    /// Wait for the next UI-relevant event. `None` once the bus is closed.
    pub async fn next_event(&self) -> Option<Arc<Event>> {
        self.queue.next().await.map(|d| d.into_event())
    }

    pub fn try_next_event(&self) -> Option<Arc<Event>> {
        self.queue.try_next().map(|d| d.into_event())
    }

    /// Issue a gateway call under the UI grants.
    pub async fn invoke(&self, call: HostCall) -> Result<Value, PluginError> {
        self.gateway.invoke_as_ui(call).await
    }

    pub async fn plugin_states(&self) -> Vec<PluginSummary> {
        self.lifecycle.plugins().await
    }

    pub async fn ui_config(&self, plugin: &PluginId) -> Option<Value> {
        self.lifecycle.ui_config(plugin).await
    }
}

impl Drop for UiBridge {
    fn drop(&mut self) {
        self.bus.detach(&Subscriber::Ui);
    }
}
