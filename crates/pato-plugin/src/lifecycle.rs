//! Plugin lifecycle manager: owns every plugin's state and supervises its
//! instance.
//!
//! ```text
//! Discovered -> Loaded -> Initialized -> Running <-> Suspended
//!                                          |             |
//!                                          +-> ShuttingDown -> ShutDown
//! any non-terminal state --(trap / init failure)--> Failed
//! ```
//!
//! Each started plugin gets one worker task. The worker owns the component
//! and serializes everything that runs inside it: queued bus events and
//! forwarded inter-plugin requests. Component calls run on the blocking pool
//! under a timeout; a trap or timeout moves the plugin to `Failed` in a
//! single step that also revokes its subscriptions, routes, and in-flight
//! gateway calls.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{Delivery, EventBus, Subscriber, SubscriberQueue};
use crate::capability::CapabilitySet;
use crate::error::{ErrorKind, PluginError};
use crate::events::{
    EventSource, PluginFailedPayload, StateChangedPayload, UiConfigPayload, EVENT_PLUGIN_FAILED,
    EVENT_STATE_CHANGED, EVENT_UI_CONFIG,
};
use crate::gateway::{CallRequest, CapabilityGateway, HostCall, HostHandle};
use crate::manifest::{PluginId, PluginManifest};
use crate::resolver::InterPluginResolver;
use crate::sandbox::{Component, ComponentFault, ComponentSource};

const EXPORT_INIT: &str = "init";
const EXPORT_SHUTDOWN: &str = "shutdown";
const EXPORT_HANDLE_EVENT: &str = "handle_event";
const EXPORT_UI_CONFIG: &str = "get_ui_config";

// ─── State ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Discovered,
    Loaded,
    Initialized,
    Running,
    Suspended,
    ShuttingDown,
    ShutDown,
    Failed,
}

impl PluginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Loaded => "loaded",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::ShuttingDown => "shutting_down",
            Self::ShutDown => "shut_down",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ShutDown | Self::Failed)
    }

    /// States in which a plugin may hold subscriptions and routes.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Initialized | Self::Running | Self::Suspended)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a plugin ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: ErrorKind,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// One row of [`LifecycleManager::plugins`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSummary {
    pub id: PluginId,
    pub version: String,
    pub state: PluginState,
}

// ─── Table ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct InstanceSlot {
    component: Option<Box<dyn Component>>,
    worker: Option<JoinHandle<Option<Box<dyn Component>>>>,
}

struct PluginRecord {
    manifest: Arc<PluginManifest>,
    capabilities: Arc<CapabilitySet>,
    state: PluginState,
    generation: u64,
    cancel: CancellationToken,
    host: Option<HostHandle>,
    slot: Mutex<InstanceSlot>,
    mailbox: Option<mpsc::Sender<CallRequest>>,
    paused: Option<watch::Sender<bool>>,
    failure: Option<FailureReport>,
    ui_config: Option<Value>,
}

impl PluginRecord {
    fn slot(&self) -> std::sync::MutexGuard<'_, InstanceSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What the gateway needs to know about a caller.
pub(crate) struct CallerView {
    pub(crate) state: PluginState,
    pub(crate) capabilities: Arc<CapabilitySet>,
    pub(crate) manifest: Arc<PluginManifest>,
    pub(crate) cancel: CancellationToken,
}

/// Every loaded plugin's state, owned by the lifecycle manager and read by
/// the gateway.
#[derive(Default)]
pub struct PluginTable {
    records: RwLock<HashMap<PluginId, PluginRecord>>,
}

impl fmt::Debug for PluginTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginTable").finish_non_exhaustive()
    }
}

impl PluginTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn caller(&self, id: &PluginId) -> Option<CallerView> {
        let records = self.records.read().await;
        records.get(id).map(|r| CallerView {
            state: r.state,
            capabilities: r.capabilities.clone(),
            manifest: r.manifest.clone(),
            cancel: r.cancel.clone(),
        })
    }

    pub(crate) async fn mailbox(
        &self,
        id: &PluginId,
    ) -> Option<(PluginState, Option<mpsc::Sender<CallRequest>>)> {
        let records = self.records.read().await;
        records.get(id).map(|r| (r.state, r.mailbox.clone()))
    }

    pub async fn state(&self, id: &PluginId) -> Option<PluginState> {
        self.records.read().await.get(id).map(|r| r.state)
    }
}

// ─── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub init_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Bound on `handle_event`, `get_ui_config`, and served interface calls.
    pub event_timeout: Duration,
    /// Pending inter-plugin requests per target before callers wait.
    pub mailbox_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_millis(5000),
            shutdown_timeout: Duration::from_millis(2000),
            event_timeout: Duration::from_millis(10_000),
            mailbox_capacity: 16,
        }
    }
}

// ─── Component calls ────────────────────────────────────────────────────

/// Outcome of one call into a component that did not return output.
#[derive(Debug)]
enum CallFailure {
    Fault(ComponentFault),
    Panicked(String),
    TimedOut(Duration),
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault(fault) => write!(f, "{fault}"),
            Self::Panicked(msg) => write!(f, "component panicked: {msg}"),
            Self::TimedOut(limit) => write!(f, "timed out after {} ms", limit.as_millis()),
        }
    }
}

/// Run `export` on the blocking pool. The component comes back unless the
/// call panicked or outlived `limit`; in both cases it is lost.
async fn run_component(
    mut component: Box<dyn Component>,
    export: impl Into<String>,
    input: Vec<u8>,
    limit: Duration,
) -> (Option<Box<dyn Component>>, Result<Vec<u8>, CallFailure>) {
    let export = export.into();
    let task = tokio::task::spawn_blocking(move || {
        let result = component.call(&export, &input);
        (component, result)
    });
    match tokio::time::timeout(limit, task).await {
        Ok(Ok((component, result))) => (Some(component), result.map_err(CallFailure::Fault)),
        Ok(Err(join)) => (None, Err(CallFailure::Panicked(join.to_string()))),
        Err(_) => (None, Err(CallFailure::TimedOut(limit))),
    }
}

/// What a plugin returns from an export, all fields optional.
#[derive(Debug, Default, Deserialize)]
struct PluginReply {
    #[serde(default)]
    ok: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    /// Host calls to perform after the export returns.
    #[serde(default)]
    host_requests: Vec<HostCall>,
}

fn parse_reply(output: &[u8]) -> Result<PluginReply, PluginError> {
    if output.iter().all(u8::is_ascii_whitespace) {
        return Ok(PluginReply::default());
    }
    Ok(serde_json::from_slice(output)?)
}

// ─── Manager ────────────────────────────────────────────────────────────

/// Drives plugins through their lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct LifecycleManager {
    table: Arc<PluginTable>,
    bus: Arc<EventBus>,
    resolver: Arc<InterPluginResolver>,
    gateway: Arc<CapabilityGateway>,
    config: LifecycleConfig,
    host_version: String,
    generations: Arc<AtomicU64>,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("config", &self.config)
            .field("host_version", &self.host_version)
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    pub fn new(
        table: Arc<PluginTable>,
        bus: Arc<EventBus>,
        resolver: Arc<InterPluginResolver>,
        gateway: Arc<CapabilityGateway>,
        config: LifecycleConfig,
        host_version: impl Into<String>,
    ) -> Self {
        Self {
            table,
            bus,
            resolver,
            gateway,
            config,
            host_version: host_version.into(),
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Register and instantiate a plugin. A terminal record with the same
    /// name is replaced; restart is always an explicit new load.
    pub async fn load(
        &self,
        manifest: PluginManifest,
        source: Arc<dyn ComponentSource>,
    ) -> Result<PluginId, PluginError> {
        manifest.validate()?;
        manifest.check_host_compatibility(&self.host_version)?;
        let capabilities = manifest.declared_capabilities()?;
        let id = manifest.id();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;

        {
            let mut records = self.table.records.write().await;
            if let Some(existing) = records.get(&id) {
                if !existing.state.is_terminal() {
                    return Err(PluginError::AlreadyExists(format!("plugin {id}")));
                }
            }
            records.insert(
                id.clone(),
                PluginRecord {
                    manifest: Arc::new(manifest),
                    capabilities: Arc::new(capabilities),
                    state: PluginState::Discovered,
                    generation,
                    cancel: CancellationToken::new(),
                    host: None,
                    slot: Mutex::new(InstanceSlot::default()),
                    mailbox: None,
                    paused: None,
                    failure: None,
                    ui_config: None,
                },
            );
        }
        tracing::info!(plugin = %id, generation, "plugin discovered");

        let host = HostHandle::new(
            id.clone(),
            self.gateway.clone(),
            tokio::runtime::Handle::current(),
        );
        let instantiated = {
            let host = host.clone();
            tokio::task::spawn_blocking(move || source.instantiate(host)).await
        };
        let component = match instantiated {
            Ok(Ok(component)) => component,
            Ok(Err(err)) => {
                self.fail(&id, generation, &err).await;
                return Err(err);
            }
            Err(join) => {
                let err = PluginError::Sandbox(format!("instantiation panicked: {join}"));
                self.fail(&id, generation, &err).await;
                return Err(err);
            }
        };

        let mut records = self.table.records.write().await;
        let record = current(&mut records, &id, generation)?;
        check_transition(&id, record.state, &[PluginState::Discovered], PluginState::Loaded)?;
        record.slot().component = Some(component);
        record.host = Some(host);
        self.set_state(&id, record, PluginState::Loaded);
        Ok(id)
    }

    /// Run `init` under the init timeout. Any failure is final: the plugin
    /// goes straight to `Failed`.
    pub async fn initialize(&self, id: &PluginId) -> Result<(), PluginError> {
        let (generation, component) = {
            let mut records = self.table.records.write().await;
            let record = lookup(&mut records, id)?;
            check_transition(id, record.state, &[PluginState::Loaded], PluginState::Initialized)?;
            let component = record.slot().component.take();
            (record.generation, component)
        };
        let component = component
            .ok_or_else(|| PluginError::Sandbox(format!("plugin {id} has no instance")))?;

        let (component, outcome) = if component.has_export(EXPORT_INIT) {
            let (component, result) = run_component(
                component,
                EXPORT_INIT,
                b"{}".to_vec(),
                self.config.init_timeout,
            )
            .await;
            let outcome = match result {
                Ok(output) => match parse_reply(&output) {
                    Ok(PluginReply { error: Some(reason), .. }) => Err(reason),
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("malformed init reply: {err}")),
                },
                Err(failure) => Err(failure.to_string()),
            };
            (component, outcome)
        } else {
            (Some(component), Ok(()))
        };

        if let Err(reason) = outcome {
            let err = PluginError::InitFailure {
                plugin: id.to_string(),
                reason,
            };
            self.fail(id, generation, &err).await;
            return Err(err);
        }

        let mut records = self.table.records.write().await;
        let record = current(&mut records, id, generation)?;
        check_transition(id, record.state, &[PluginState::Loaded], PluginState::Initialized)?;
        record.slot().component = component;

        let subscriber = Subscriber::Plugin(id.clone());
        self.bus.attach(subscriber.clone());
        for pattern in record.manifest.initial_subscriptions()? {
            self.bus.subscribe(&subscriber, pattern)?;
        }
        let manifest = record.manifest.clone();
        self.set_state(id, record, PluginState::Initialized);

        let peers: Vec<Arc<PluginManifest>> = records
            .values()
            .filter(|r| r.state.is_active())
            .map(|r| r.manifest.clone())
            .collect();
        self.resolver
            .resolve(&manifest, peers.iter().map(|m| m.as_ref()));
        Ok(())
    }

    /// Spawn the plugin's worker and begin delivering events.
    pub async fn start(&self, id: &PluginId) -> Result<(), PluginError> {
        let mut records = self.table.records.write().await;
        let record = lookup(&mut records, id)?;
        check_transition(id, record.state, &[PluginState::Initialized], PluginState::Running)?;

        let component = record
            .slot()
            .component
            .take()
            .ok_or_else(|| PluginError::Sandbox(format!("plugin {id} has no instance")))?;
        let host = record
            .host
            .clone()
            .ok_or_else(|| PluginError::Sandbox(format!("plugin {id} has no host handle")))?;

        let (mailbox, calls) = mpsc::channel(self.config.mailbox_capacity.max(1));
        let (paused, paused_rx) = watch::channel(false);
        let queue = self.bus.attach(Subscriber::Plugin(id.clone()));

        let worker = Worker {
            manager: self.clone(),
            id: id.clone(),
            generation: record.generation,
            host,
            queue,
            calls,
            paused: paused_rx,
            cancel: record.cancel.clone(),
        };
        record.slot().worker = Some(tokio::spawn(worker.run(component)));
        record.mailbox = Some(mailbox);
        record.paused = Some(paused);
        self.set_state(id, record, PluginState::Running);
        Ok(())
    }

    /// Pause event delivery. Events keep queueing (bounded) while suspended.
    pub async fn suspend(&self, id: &PluginId) -> Result<(), PluginError> {
        let mut records = self.table.records.write().await;
        let record = lookup(&mut records, id)?;
        check_transition(id, record.state, &[PluginState::Running], PluginState::Suspended)?;
        if let Some(paused) = &record.paused {
            paused.send_replace(true);
        }
        self.set_state(id, record, PluginState::Suspended);
        Ok(())
    }

    pub async fn resume(&self, id: &PluginId) -> Result<(), PluginError> {
        let mut records = self.table.records.write().await;
        let record = lookup(&mut records, id)?;
        check_transition(id, record.state, &[PluginState::Suspended], PluginState::Running)?;
        if let Some(paused) = &record.paused {
            paused.send_replace(false);
        }
        self.set_state(id, record, PluginState::Running);
        Ok(())
    }

    /// Stop a plugin. Subscriptions, routes, and in-flight gateway calls are
    /// revoked on entering `ShuttingDown`; `shutdown` then runs best effort.
    /// Idempotent for plugins that are already stopping or stopped.
    pub async fn shutdown(&self, id: &PluginId) -> Result<(), PluginError> {
        let (generation, worker, component) = {
            let mut records = self.table.records.write().await;
            let record = lookup(&mut records, id)?;
            match record.state {
                PluginState::ShuttingDown | PluginState::ShutDown | PluginState::Failed => {
                    return Ok(())
                }
                _ => {}
            }
            self.revoke(id, record);
            let (worker, component) = {
                let mut slot = record.slot();
                (slot.worker.take(), slot.component.take())
            };
            self.set_state(id, record, PluginState::ShuttingDown);
            (record.generation, worker, component)
        };

        let component = match worker {
            Some(mut worker) => {
                let limit = self.config.shutdown_timeout + self.config.event_timeout;
                match tokio::time::timeout(limit, &mut worker).await {
                    Ok(Ok(component)) => component,
                    Ok(Err(join)) => {
                        tracing::warn!(plugin = %id, "worker ended abnormally: {join}");
                        None
                    }
                    Err(_) => {
                        worker.abort();
                        tracing::warn!(plugin = %id, "worker did not stop in time, aborted");
                        None
                    }
                }
            }
            None => component,
        };

        if let Some(component) = component {
            if component.has_export(EXPORT_SHUTDOWN) {
                let (_, result) = run_component(
                    component,
                    EXPORT_SHUTDOWN,
                    b"{}".to_vec(),
                    self.config.shutdown_timeout,
                )
                .await;
                if let Err(failure) = result {
                    tracing::warn!(plugin = %id, "shutdown export failed: {failure}");
                }
            }
        }

        let mut records = self.table.records.write().await;
        let record = current(&mut records, id, generation)?;
        if record.state == PluginState::ShuttingDown {
            record.host = None;
            self.set_state(id, record, PluginState::ShutDown);
        }
        Ok(())
    }

    /// Load, initialize and start in one go.
    pub async fn load_and_start(
        &self,
        manifest: PluginManifest,
        source: Arc<dyn ComponentSource>,
    ) -> Result<PluginId, PluginError> {
        let id = self.load(manifest, source).await?;
        self.initialize(&id).await?;
        self.start(&id).await?;
        Ok(id)
    }

    pub async fn state(&self, id: &PluginId) -> Option<PluginState> {
        self.table.state(id).await
    }

    pub async fn failure(&self, id: &PluginId) -> Option<FailureReport> {
        let records = self.table.records.read().await;
        records.get(id).and_then(|r| r.failure.clone())
    }

    pub async fn ui_config(&self, id: &PluginId) -> Option<Value> {
        let records = self.table.records.read().await;
        records.get(id).and_then(|r| r.ui_config.clone())
    }

    pub async fn manifest(&self, id: &PluginId) -> Option<Arc<PluginManifest>> {
        let records = self.table.records.read().await;
        records.get(id).map(|r| r.manifest.clone())
    }

    /// Every known plugin, sorted by id.
    pub async fn plugins(&self) -> Vec<PluginSummary> {
        let records = self.table.records.read().await;
        let mut plugins: Vec<PluginSummary> = records
            .iter()
            .map(|(id, r)| PluginSummary {
                id: id.clone(),
                version: r.manifest.plugin.version.clone(),
                state: r.state,
            })
            .collect();
        plugins.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        plugins
    }

    /// Shut down every non-terminal plugin. Failures are logged, not returned.
    pub async fn shutdown_all(&self) {
        let ids: Vec<PluginId> = self
            .plugins()
            .await
            .into_iter()
            .filter(|p| !p.state.is_terminal())
            .map(|p| p.id)
            .collect();
        for id in ids {
            if let Err(e) = self.shutdown(&id).await {
                tracing::error!(plugin = %id, "shutdown failed: {e}");
            }
        }
    }

    /// Move a plugin to `Failed`, revoking everything it holds in the same
    /// step. No-op for a stale generation or an already-terminal plugin.
    async fn fail(&self, id: &PluginId, generation: u64, err: &PluginError) {
        let mut records = self.table.records.write().await;
        let Some(record) = records.get_mut(id) else {
            return;
        };
        if record.generation != generation || record.state.is_terminal() {
            return;
        }

        self.revoke(id, record);
        {
            let mut slot = record.slot();
            slot.component = None;
            slot.worker = None;
        }
        record.host = None;
        let reason = self.redact_text(err.to_string());
        record.failure = Some(FailureReport {
            kind: err.kind(),
            reason: reason.clone(),
            at: Utc::now(),
        });
        tracing::error!(plugin = %id, kind = ?err.kind(), "plugin failed: {reason}");

        let payload = PluginFailedPayload {
            plugin: id.clone(),
            kind: err.kind(),
            reason,
        };
        self.bus.publish(
            EventSource::Host,
            EVENT_PLUGIN_FAILED,
            serde_json::to_value(payload).unwrap_or_default(),
            None,
        );
        self.set_state(id, record, PluginState::Failed);
    }

    /// Cancel in-flight calls, close the mailbox, drop subscriptions and
    /// routes. Caller holds the table write lock.
    fn revoke(&self, id: &PluginId, record: &mut PluginRecord) {
        record.cancel.cancel();
        record.mailbox = None;
        record.paused = None;
        let removed = self.bus.detach(&Subscriber::Plugin(id.clone()));
        self.resolver.remove(id);
        tracing::debug!(plugin = %id, subscriptions = removed, "plugin grants revoked");
    }

    fn set_state(&self, id: &PluginId, record: &mut PluginRecord, to: PluginState) {
        let from = record.state;
        record.state = to;
        tracing::info!(plugin = %id, from = %from, to = %to, "plugin state changed");
        let payload = StateChangedPayload {
            plugin: id.clone(),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        };
        self.bus.publish(
            EventSource::Host,
            EVENT_STATE_CHANGED,
            serde_json::to_value(payload).unwrap_or_default(),
            None,
        );
    }

    /// Plugin-supplied text is scrubbed of vault secrets before it becomes
    /// observable.
    fn redact_text(&self, text: String) -> String {
        match self.gateway.vault().redact(Value::String(text)) {
            Value::String(text) => text,
            other => other.to_string(),
        }
    }

    async fn store_ui_config(&self, id: &PluginId, generation: u64, config: Value) {
        let config = self.gateway.vault().redact(config);
        {
            let mut records = self.table.records.write().await;
            match records.get_mut(id) {
                Some(record) if record.generation == generation => {
                    record.ui_config = Some(config.clone());
                }
                _ => return,
            }
        }
        let payload = UiConfigPayload {
            plugin: id.clone(),
            config,
        };
        self.bus.publish(
            EventSource::Host,
            EVENT_UI_CONFIG,
            serde_json::to_value(payload).unwrap_or_default(),
            None,
        );
    }
}

fn lookup<'a>(
    records: &'a mut HashMap<PluginId, PluginRecord>,
    id: &PluginId,
) -> Result<&'a mut PluginRecord, PluginError> {
    records
        .get_mut(id)
        .ok_or_else(|| PluginError::NotFound(id.to_string()))
}

/// Like [`lookup`], but rejects a record that was replaced meanwhile.
fn current<'a>(
    records: &'a mut HashMap<PluginId, PluginRecord>,
    id: &PluginId,
    generation: u64,
) -> Result<&'a mut PluginRecord, PluginError> {
    match records.get_mut(id) {
        Some(record) if record.generation == generation => Ok(record),
        _ => Err(PluginError::NotFound(id.to_string())),
    }
}

fn check_transition(
    id: &PluginId,
    from: PluginState,
    allowed: &[PluginState],
    to: PluginState,
) -> Result<(), PluginError> {
    if allowed.contains(&from) {
        Ok(())
    } else {
        Err(PluginError::InvalidTransition {
            plugin: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────

struct Worker {
    manager: LifecycleManager,
    id: PluginId,
    generation: u64,
    host: HostHandle,
    queue: Arc<SubscriberQueue>,
    calls: mpsc::Receiver<CallRequest>,
    paused: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl Worker {
    /// Returns the component when stopped cleanly, `None` once it was lost
    /// to a trap or timeout.
    async fn run(mut self, component: Box<dyn Component>) -> Option<Box<dyn Component>> {
        let mut component = self.publish_ui_config(component).await?;

        loop {
            let paused = *self.paused.borrow();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(request) = self.calls.recv() => {
                    component = self.serve(component, request).await?;
                }
                delivery = self.queue.next(), if !paused => {
                    let Some(delivery) = delivery else { break };
                    component = self.deliver(component, delivery).await?;
                }
            }
        }

        tracing::debug!(plugin = %self.id, "worker stopped");
        Some(component)
    }

    async fn publish_ui_config(&self, component: Box<dyn Component>) -> Option<Box<dyn Component>> {
        if !component.has_export(EXPORT_UI_CONFIG) {
            return Some(component);
        }
        let (component, result) = run_component(
            component,
            EXPORT_UI_CONFIG,
            b"{}".to_vec(),
            self.manager.config.event_timeout,
        )
        .await;
        match result {
            Ok(output) => {
                let config = parse_reply(&output)
                    .ok()
                    .and_then(|reply| reply.ok)
                    .filter(|v| !v.is_null());
                if let Some(config) = config {
                    self.manager
                        .store_ui_config(&self.id, self.generation, config)
                        .await;
                }
                component
            }
            Err(failure) => {
                self.trap(EXPORT_UI_CONFIG, failure).await;
                None
            }
        }
    }

    async fn deliver(
        &self,
        component: Box<dyn Component>,
        delivery: Delivery,
    ) -> Option<Box<dyn Component>> {
        if !component.has_export(EXPORT_HANDLE_EVENT) {
            return Some(component);
        }

        let event = delivery.into_event();
        let input = match serde_json::to_vec(event.as_ref()) {
            Ok(input) => input,
            Err(e) => {
                tracing::error!(plugin = %self.id, "failed to serialize event: {e}");
                return Some(component);
            }
        };

        let started = std::time::Instant::now();
        let (component, result) = run_component(
            component,
            EXPORT_HANDLE_EVENT,
            input,
            self.manager.config.event_timeout,
        )
        .await;

        match result {
            Ok(output) => {
                tracing::debug!(
                    plugin = %self.id,
                    event = %event.event_type,
                    sequence = event.sequence,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "event handled"
                );
                self.after_export(EXPORT_HANDLE_EVENT, &output).await;
                component
            }
            Err(failure) => {
                self.trap(EXPORT_HANDLE_EVENT, failure).await;
                None
            }
        }
    }

    async fn serve(
        &self,
        component: Box<dyn Component>,
        request: CallRequest,
    ) -> Option<Box<dyn Component>> {
        if request.reply.is_closed() {
            return Some(component);
        }
        if *self.paused.borrow() {
            let _ = request
                .reply
                .send(Err(PluginError::NotRunning(self.id.to_string())));
            return Some(component);
        }
        let interface = request.interface.clone();
        if !component.has_export(&interface) {
            let _ = request.reply.send(Err(PluginError::NoRoute {
                target: self.id.to_string(),
                interface,
            }));
            return Some(component);
        }

        let input = json!({ "caller": request.caller, "args": request.args });
        let input = serde_json::to_vec(&input).unwrap_or_default();
        let mut chain = request.chain.clone();
        chain.push(self.id.clone());

        self.host.enter_call(&request.chain);
        let (component, result) = run_component(
            component,
            interface.clone(),
            input,
            self.manager.config.event_timeout,
        )
        .await;
        self.host.leave_call();

        match result {
            Ok(output) => {
                let reply = match parse_reply(&output) {
                    Ok(reply) => {
                        let answer = match reply.error {
                            Some(message) => Err(PluginError::PluginReturned {
                                plugin: self.id.to_string(),
                                message: self.manager.redact_text(message),
                            }),
                            None => Ok(reply.ok.unwrap_or(Value::Null)),
                        };
                        self.run_host_requests(&interface, reply.host_requests, &chain)
                            .await;
                        answer
                    }
                    Err(err) => Err(PluginError::HostFunction(format!(
                        "malformed reply from {}::{interface}: {err}",
                        self.id
                    ))),
                };
                let _ = request.reply.send(reply);
                component
            }
            Err(failure) => {
                let _ = request.reply.send(Err(PluginError::RuntimeTrap {
                    plugin: self.id.to_string(),
                    reason: failure.to_string(),
                }));
                self.trap(&interface, failure).await;
                None
            }
        }
    }

    /// Handle a successful export's reply: log explicit errors and perform
    /// deferred host requests.
    async fn after_export(&self, export: &str, output: &[u8]) {
        match parse_reply(output) {
            Ok(reply) => {
                if let Some(error) = reply.error {
                    tracing::warn!(plugin = %self.id, export, "plugin reported error: {error}");
                }
                self.run_host_requests(export, reply.host_requests, &[self.id.clone()])
                    .await;
            }
            Err(e) => {
                tracing::warn!(plugin = %self.id, export, "ignoring malformed plugin reply: {e}");
            }
        }
    }

    /// Deferred requests run under `chain`, the synchronous call chain the
    /// export was serving, so a call back into a blocked caller is
    /// rejected as reentrant.
    async fn run_host_requests(&self, export: &str, requests: Vec<HostCall>, chain: &[PluginId]) {
        if requests.is_empty() {
            return;
        }
        tracing::debug!(
            plugin = %self.id,
            export,
            count = requests.len(),
            "processing host requests"
        );
        for call in requests {
            let function = call.name();
            let result = self
                .manager
                .gateway
                .dispatch(&self.id, call, chain.to_vec())
                .await;
            if let Err(e) = result {
                tracing::warn!(plugin = %self.id, function, "host request failed: {e}");
            }
        }
    }

    async fn trap(&self, export: &str, failure: CallFailure) {
        let err = PluginError::RuntimeTrap {
            plugin: self.id.to_string(),
            reason: format!("{export}: {failure}"),
        };
        self.manager.fail(&self.id, self.generation, &err).await;
    }
}
