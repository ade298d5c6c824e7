//! Pato Plugin Host
//!
//! WASM plugin runtime for a streaming assistant, built on Extism (wasmtime).
//! Plugins declare capabilities in a `plugin.toml`, run in isolated sandboxes
//! with memory and fuel limits, react to events from a bounded pub/sub bus,
//! and reach services, the network, and each other only through a
//! capability-checked gateway.

pub mod bus;
pub mod capability;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod gateway;
pub mod host;
pub mod lifecycle;
pub mod manifest;
pub mod resolver;
pub mod sandbox;
pub mod ui;
pub mod vault;

pub use bus::{Delivery, EventBus, PublishReport, Subscriber, SubscriberQueue, SubscriptionId};
pub use capability::{Capability, CapabilityKind, CapabilitySet, ServiceAction};
pub use config::HostConfig;
pub use connection::{ConnectionManager, OutboundMessage, OutboundReceipt, OutboundStatus};
pub use error::{ErrorKind, PluginError};
pub use events::{Event, EventPattern, EventSource};
pub use gateway::{CapabilityGateway, HostCall, HostHandle, LogLevel};
pub use host::{PluginHost, HOST_VERSION};
pub use lifecycle::{FailureReport, LifecycleConfig, LifecycleManager, PluginState, PluginSummary};
pub use manifest::{PluginId, PluginManifest};
pub use resolver::{InterPluginResolver, Route};
pub use sandbox::{Component, ComponentFault, ComponentSource, SandboxConfig, WasmSource};
pub use ui::UiBridge;
pub use vault::{CredentialToken, CredentialVault};
