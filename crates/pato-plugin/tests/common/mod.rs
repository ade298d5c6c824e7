// Shared test utilities for integration tests
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pato_plugin::{
    Component, ComponentFault, ComponentSource, ConnectionManager, CredentialToken,
    CredentialVault, ErrorKind, HostCall, HostConfig, HostHandle, OutboundMessage,
    OutboundReceipt, OutboundStatus, PluginError, PluginHost, PluginId, PluginManifest,
    PluginState,
};
use serde_json::{json, Value};

pub const TWITCH_TOKEN: &str = "oauth:twitch-secret-0123456789";
pub const DISCORD_TOKEN: &str = "discord-secret-abcdefghij";

type Handler = dyn Fn(&HostHandle, &str, &[u8]) -> Result<Vec<u8>, ComponentFault> + Send + Sync;

/// An in-process component driven by a closure. `handler` receives the
/// plugin's host handle, the export name and the raw input.
#[derive(Clone)]
pub struct TestPlugin {
    exports: BTreeSet<String>,
    handler: Arc<Handler>,
}

impl TestPlugin {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&HostHandle, &str, &[u8]) -> Result<Vec<u8>, ComponentFault> + Send + Sync + 'static,
    {
        Self {
            exports: BTreeSet::from(["init".to_string(), "handle_event".to_string()]),
            handler: Arc::new(handler),
        }
    }

    /// A plugin whose exports all succeed with no output.
    pub fn inert() -> Self {
        Self::new(|_, _, _| Ok(Vec::new()))
    }

    pub fn export(mut self, name: &str) -> Self {
        self.exports.insert(name.to_string());
        self
    }

    pub fn source(self) -> Arc<dyn ComponentSource> {
        Arc::new(self)
    }
}

impl ComponentSource for TestPlugin {
    fn instantiate(&self, host: HostHandle) -> Result<Box<dyn Component>, PluginError> {
        Ok(Box::new(TestComponent {
            host,
            exports: self.exports.clone(),
            handler: self.handler.clone(),
        }))
    }
}

struct TestComponent {
    host: HostHandle,
    exports: BTreeSet<String>,
    handler: Arc<Handler>,
}

impl Component for TestComponent {
    fn call(&mut self, export: &str, input: &[u8]) -> Result<Vec<u8>, ComponentFault> {
        if !self.exports.contains(export) {
            return Err(ComponentFault::MissingExport(export.to_string()));
        }
        (self.handler)(&self.host, export, input)
    }

    fn has_export(&self, export: &str) -> bool {
        self.exports.contains(export)
    }
}

/// Events a plugin saw through `handle_event`, in delivery order.
#[derive(Clone, Default)]
pub struct Inbox(Arc<Mutex<Vec<Value>>>);

impl Inbox {
    pub fn push(&self, event: Value) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Value> {
        self.0.lock().unwrap().clone()
    }

    pub fn of_type(&self, event_type: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|e| e["type"] == event_type)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// A plugin recording every delivered event into the returned inbox.
pub fn recording_plugin() -> (TestPlugin, Inbox) {
    let inbox = Inbox::default();
    let sink = inbox.clone();
    let plugin = TestPlugin::new(move |_, export, input| {
        if export == "handle_event" {
            sink.push(serde_json::from_slice(input).unwrap());
        }
        Ok(Vec::new())
    });
    (plugin, inbox)
}

pub fn reply_ok(value: Value) -> Result<Vec<u8>, ComponentFault> {
    Ok(serde_json::to_vec(&json!({ "ok": value })).unwrap())
}

/// An `ok` reply that also asks the host to perform `requests` afterwards.
pub fn reply_ok_with_requests(value: Value, requests: Value) -> Result<Vec<u8>, ComponentFault> {
    Ok(serde_json::to_vec(&json!({ "ok": value, "host_requests": requests })).unwrap())
}

/// One call the connection manager received.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCall {
    pub service: String,
    pub action: &'static str,
    pub body: String,
    pub credential: String,
}

/// Records every outbound action and answers with a receipt.
#[derive(Default)]
pub struct RecordingConnectionManager {
    calls: Mutex<Vec<OutboundCall>>,
    delay: Option<Duration>,
}

impl RecordingConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager that takes `delay` to answer each call.
    pub fn slow(delay: Duration) -> Self {
        Self {
            calls: Mutex::default(),
            delay: Some(delay),
        }
    }

    pub fn calls(&self) -> Vec<OutboundCall> {
        self.calls.lock().unwrap().clone()
    }

    async fn record(&self, call: OutboundCall) -> Result<OutboundReceipt, PluginError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut calls = self.calls.lock().unwrap();
        calls.push(call);
        Ok(OutboundReceipt {
            message_id: Some(format!("msg-{}", calls.len())),
            detail: Value::Null,
        })
    }
}

#[async_trait]
impl ConnectionManager for RecordingConnectionManager {
    async fn send_message(
        &self,
        credential: &CredentialToken,
        message: &OutboundMessage,
    ) -> Result<OutboundReceipt, PluginError> {
        self.record(OutboundCall {
            service: message.service.clone(),
            action: "send-message",
            body: message.message.clone(),
            credential: credential.expose_secret().to_string(),
        })
        .await
    }

    async fn set_status(
        &self,
        credential: &CredentialToken,
        status: &OutboundStatus,
    ) -> Result<OutboundReceipt, PluginError> {
        self.record(OutboundCall {
            service: status.service.clone(),
            action: "set-status",
            body: status.status.clone(),
            credential: credential.expose_secret().to_string(),
        })
        .await
    }
}

pub fn test_vault() -> Arc<CredentialVault> {
    let vault = Arc::new(CredentialVault::new());
    vault.insert("twitch", TWITCH_TOKEN);
    vault.insert("discord", DISCORD_TOKEN);
    vault
}

pub fn test_config() -> HostConfig {
    let mut config = HostConfig::default();
    config.lifecycle.init_timeout = Duration::from_millis(500);
    config.lifecycle.shutdown_timeout = Duration::from_millis(500);
    config.lifecycle.event_timeout = Duration::from_millis(500);
    config.call_timeout = Duration::from_millis(500);
    config
}

pub fn test_host(connections: Arc<RecordingConnectionManager>) -> PluginHost {
    PluginHost::new(test_config(), test_vault(), connections)
}

pub fn test_host_with(config: HostConfig, connections: Arc<RecordingConnectionManager>) -> PluginHost {
    PluginHost::new(config, test_vault(), connections)
}

/// Build a manifest for `name` with extra TOML appended after `[plugin]`.
pub fn manifest(name: &str, extra: &str) -> PluginManifest {
    let toml = format!(
        r#"
[plugin]
name = "{name}"
version = "1.0.0"
{extra}
"#
    );
    PluginManifest::parse_and_validate(&toml).unwrap()
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_state(host: &PluginHost, id: &PluginId, state: PluginState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let current = host.lifecycle().state(id).await;
        if current == Some(state) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("plugin {id} stuck in {current:?}, expected {state}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Outcomes of host calls a test plugin made, with errors reduced to kinds.
#[derive(Clone, Default)]
pub struct Results(Arc<Mutex<Vec<Result<Value, ErrorKind>>>>);

impl Results {
    pub fn push(&self, result: Result<Value, PluginError>) {
        self.0.lock().unwrap().push(result.map_err(|e| e.kind()));
    }

    pub fn all(&self) -> Vec<Result<Value, ErrorKind>> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// A plugin that performs `calls` in order every time it handles an event.
pub fn acting_plugin(calls: Vec<HostCall>) -> (TestPlugin, Results) {
    let results = Results::default();
    let sink = results.clone();
    let plugin = TestPlugin::new(move |host, export, _| {
        if export == "handle_event" {
            for call in &calls {
                sink.push(host.invoke(call.clone()));
            }
        }
        Ok(Vec::new())
    });
    (plugin, results)
}
