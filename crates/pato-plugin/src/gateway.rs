//! Capability gateway: the single entry point for every privileged action.
//!
//! Plugins (through their [`HostHandle`]) and the UI bridge issue
//! [`HostCall`]s. Each call goes through the same four steps: the caller
//! must be `Running`, the call's required [`Capability`] is resolved, the
//! caller's grants are checked, and only then is the call dispatched.
//! Service actions run through the [`ConnectionManager`] with the vault
//! session, which never leaves the host. Every result is redacted against
//! the vault before it is returned.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::bus::{EventBus, Subscriber};
use crate::capability::{Capability, CapabilityKind, CapabilitySet, ServiceAction};
use crate::connection::{self, ConnectionManager, OutboundMessage, OutboundStatus, ServiceRequest};
use crate::error::{ErrorBody, ErrorKind, PluginError};
use crate::events::{is_reserved, EventPattern, EventSource};
use crate::lifecycle::{PluginState, PluginTable};
use crate::manifest::PluginId;
use crate::resolver::InterPluginResolver;
use crate::vault::CredentialVault;

/// Maximum HTTP response body size (10 MB).
const MAX_HTTP_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Maximum log message length from plugins.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

/// Strip control characters (except newline/tab) and truncate.
fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.chars().count() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

// ─── Calls ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Every function the gateway exposes. Closed set: no string dispatch past
/// deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "kebab-case")]
pub enum HostCall {
    SubscribeToEvent {
        event_type: String,
    },
    EmitEvent {
        event_type: String,
        #[serde(default)]
        data: Value,
    },
    SendMessage {
        service: String,
        channel: String,
        message: String,
    },
    SetStatus {
        service: String,
        status: String,
    },
    CallPlugin {
        target: PluginId,
        interface: String,
        #[serde(default)]
        args: Value,
    },
    HttpGet {
        url: String,
    },
    Log {
        #[serde(default)]
        level: LogLevel,
        message: String,
    },
}

impl HostCall {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SubscribeToEvent { .. } => "subscribe-to-event",
            Self::EmitEvent { .. } => "emit-event",
            Self::SendMessage { .. } => "send-message",
            Self::SetStatus { .. } => "set-status",
            Self::CallPlugin { .. } => "call-plugin",
            Self::HttpGet { .. } => "http-get",
            Self::Log { .. } => "log",
        }
    }

    /// The kind of grant a caller must hold, known without looking at the
    /// arguments. `None` only for `Log`.
    pub fn capability_kind(&self) -> Option<CapabilityKind> {
        match self {
            Self::SubscribeToEvent { .. } => Some(CapabilityKind::EventSubscribe),
            Self::EmitEvent { .. } => Some(CapabilityKind::EventEmit),
            Self::SendMessage { .. } => Some(CapabilityKind::ServiceApi(ServiceAction::SendMessage)),
            Self::SetStatus { .. } => Some(CapabilityKind::ServiceApi(ServiceAction::SetStatus)),
            Self::CallPlugin { .. } => Some(CapabilityKind::InterPlugin),
            Self::HttpGet { .. } => Some(CapabilityKind::Network),
            Self::Log { .. } => None,
        }
    }

    /// The capability a caller must hold. `None` only for `Log`.
    pub fn required_capability(&self) -> Result<Option<Capability>, PluginError> {
        let capability = match self {
            Self::SubscribeToEvent { event_type } => Capability::EventSubscribe {
                pattern: EventPattern::parse(event_type)?,
            },
            Self::EmitEvent { event_type, .. } => match EventPattern::parse(event_type)? {
                pattern @ EventPattern::Exact(_) => Capability::EventEmit { pattern },
                _ => {
                    return Err(PluginError::HostFunction(format!(
                        "cannot emit a wildcard event type: '{event_type}'"
                    )))
                }
            },
            Self::SendMessage { service, .. } => service_capability(service, ServiceAction::SendMessage),
            Self::SetStatus { service, .. } => service_capability(service, ServiceAction::SetStatus),
            Self::CallPlugin {
                target, interface, ..
            } => Capability::InterPlugin {
                target: target.clone(),
                interface: interface.clone(),
            },
            Self::HttpGet { url } => Capability::Network {
                scope: url_host(url)?,
            },
            Self::Log { .. } => return Ok(None),
        };
        Ok(Some(capability))
    }
}

fn service_capability(service: &str, action: ServiceAction) -> Capability {
    Capability::ServiceApi {
        service: service.to_string(),
        actions: BTreeSet::from([action]),
    }
}

fn url_host(url_str: &str) -> Result<String, PluginError> {
    let url = url::Url::parse(url_str)
        .map_err(|_| PluginError::HostFunction(format!("invalid URL: {url_str}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(PluginError::HostFunction(format!(
            "unsupported URL scheme '{}'",
            url.scheme()
        )));
    }
    url.host_str()
        .map(str::to_string)
        .ok_or_else(|| PluginError::HostFunction(format!("URL has no host: {url_str}")))
}

/// Block requests to private/reserved addresses, even under a `*` grant.
fn check_private_host(host: &str) -> Result<(), PluginError> {
    let blocked = [
        "localhost",
        "127.0.0.1",
        "0.0.0.0",
        "[::1]",
        "169.254.169.254",
        "metadata.google.internal",
    ];
    if blocked.contains(&host) {
        return Err(PluginError::PermissionDenied(format!(
            "HTTP requests to '{host}' are blocked (private/reserved address)"
        )));
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        let is_private = match ip {
            IpAddr::V4(v4) => {
                v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
            }
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        };
        if is_private {
            return Err(PluginError::PermissionDenied(format!(
                "HTTP requests to private IP '{host}' are blocked"
            )));
        }
    }
    Ok(())
}

/// Envelope returned across the sandbox boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostReply {
    Ok(Value),
    Error(ErrorBody),
}

impl HostReply {
    pub fn from_result(result: Result<Value, PluginError>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(err) => Self::Error(ErrorBody::from(&err)),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"error":{"kind":"invalid_call","message":"unserializable reply"}}"#.to_string()
        })
    }
}

/// A forwarded inter-plugin request, served by the target's worker.
#[derive(Debug)]
pub struct CallRequest {
    pub caller: Option<PluginId>,
    pub interface: String,
    pub args: Value,
    /// Plugins already blocked in this synchronous call chain.
    pub chain: Vec<PluginId>,
    pub reply: oneshot::Sender<Result<Value, PluginError>>,
}

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Plugin(PluginId),
    Ui,
}

impl Principal {
    fn source(&self) -> EventSource {
        match self {
            Self::Plugin(id) => EventSource::Plugin(id.clone()),
            Self::Ui => EventSource::Host,
        }
    }

    fn subscriber(&self) -> Subscriber {
        match self {
            Self::Plugin(id) => Subscriber::Plugin(id.clone()),
            Self::Ui => Subscriber::Ui,
        }
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plugin(id) => write!(f, "{id}"),
            Self::Ui => f.write_str("ui"),
        }
    }
}

// ─── Gateway ────────────────────────────────────────────────────────────

pub struct CapabilityGateway {
    table: Arc<PluginTable>,
    bus: Arc<EventBus>,
    vault: Arc<CredentialVault>,
    resolver: Arc<InterPluginResolver>,
    connections: Arc<dyn ConnectionManager>,
    http_client: reqwest::Client,
    call_timeout: Duration,
    ui_capabilities: CapabilitySet,
}

impl std::fmt::Debug for CapabilityGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityGateway")
            .field("call_timeout", &self.call_timeout)
            .field("ui_capabilities", &self.ui_capabilities)
            .finish_non_exhaustive()
    }
}

impl CapabilityGateway {
    pub fn new(
        table: Arc<PluginTable>,
        bus: Arc<EventBus>,
        vault: Arc<CredentialVault>,
        resolver: Arc<InterPluginResolver>,
        connections: Arc<dyn ConnectionManager>,
        call_timeout: Duration,
        ui_capabilities: CapabilitySet,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(call_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            table,
            bus,
            vault,
            resolver,
            connections,
            http_client,
            call_timeout,
            ui_capabilities,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub(crate) fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    /// Perform `call` on behalf of `plugin`.
    pub async fn invoke(&self, plugin: &PluginId, call: HostCall) -> Result<Value, PluginError> {
        self.dispatch(plugin, call, vec![plugin.clone()]).await
    }

    /// Perform `call` on behalf of the UI, scoped to the host-level UI grants.
    pub async fn invoke_as_ui(&self, call: HostCall) -> Result<Value, PluginError> {
        let principal = Principal::Ui;
        if let Some(kind) = call.capability_kind() {
            if !self.ui_capabilities.holds_kind(kind) {
                return Err(self.denied(&principal, &call, &kind));
            }
        }
        if let Some(required) = call.required_capability()? {
            if !self.ui_capabilities.grants(&required) {
                return Err(self.denied(&principal, &call, &required));
            }
        }
        let result = self.perform(&principal, call, Vec::new()).await;
        result.map(|value| self.vault.redact(value))
    }

    /// Plugin entry point carrying the synchronous call chain.
    pub(crate) async fn dispatch(
        &self,
        plugin: &PluginId,
        call: HostCall,
        chain: Vec<PluginId>,
    ) -> Result<Value, PluginError> {
        let caller = self
            .table
            .caller(plugin)
            .await
            .ok_or_else(|| PluginError::NotFound(plugin.to_string()))?;
        if caller.state != PluginState::Running {
            return Err(PluginError::NotRunning(plugin.to_string()));
        }

        let principal = Principal::Plugin(plugin.clone());
        // Refuse on the kind alone first, so a caller without the grant is
        // denied whatever its arguments look like.
        if let Some(kind) = call.capability_kind() {
            let held = match kind {
                CapabilityKind::InterPlugin => !caller.manifest.imports.is_empty(),
                kind => caller.capabilities.holds_kind(kind),
            };
            if !held {
                return Err(self.denied(&principal, &call, &kind));
            }
        }
        if let Some(required) = call.required_capability()? {
            self.authorize(&principal, &caller.capabilities, &caller.manifest, &call, &required)?;
        }

        let result = tokio::select! {
            biased;
            _ = caller.cancel.cancelled() => Err(PluginError::Cancelled(plugin.to_string())),
            result = self.perform(&principal, call, chain) => result,
        };
        result.map(|value| self.vault.redact(value))
    }

    fn authorize(
        &self,
        principal: &Principal,
        grants: &CapabilitySet,
        manifest: &crate::manifest::PluginManifest,
        call: &HostCall,
        required: &Capability,
    ) -> Result<(), PluginError> {
        match (call, required) {
            (HostCall::EmitEvent { event_type, .. }, _) if is_reserved(event_type) => {
                Err(self.denied(principal, call, required))
            }
            (_, Capability::InterPlugin { target, interface }) => {
                let Principal::Plugin(source) = principal else {
                    return Err(self.denied(principal, call, required));
                };
                if !manifest.imports_from(target, interface) {
                    return Err(self.denied(principal, call, required));
                }
                if !self.resolver.has_route(source, target, interface) {
                    return Err(PluginError::NoRoute {
                        target: target.to_string(),
                        interface: interface.clone(),
                    });
                }
                Ok(())
            }
            _ if grants.grants(required) => Ok(()),
            _ => Err(self.denied(principal, call, required)),
        }
    }

    fn denied(
        &self,
        principal: &Principal,
        call: &HostCall,
        required: &dyn std::fmt::Display,
    ) -> PluginError {
        tracing::warn!(
            audit = true,
            principal = %principal,
            function = call.name(),
            capability = %required,
            "permission denied"
        );
        PluginError::PermissionDenied(format!("{principal} lacks {required}"))
    }

    async fn perform(
        &self,
        principal: &Principal,
        call: HostCall,
        chain: Vec<PluginId>,
    ) -> Result<Value, PluginError> {
        match call {
            HostCall::SubscribeToEvent { event_type } => {
                let pattern = EventPattern::parse(&event_type)?;
                let id = self.bus.subscribe(&principal.subscriber(), pattern)?;
                Ok(json!({ "subscription_id": id.0 }))
            }
            HostCall::EmitEvent { event_type, data } => {
                let report = self.bus.publish(
                    principal.source(),
                    event_type,
                    self.vault.redact(data),
                    None,
                );
                Ok(json!({
                    "sequence": report.event.sequence,
                    "correlation_id": report.event.correlation_id,
                    "delivered": report.delivered,
                }))
            }
            HostCall::SendMessage {
                service,
                channel,
                message,
            } => {
                let request = ServiceRequest::SendMessage(OutboundMessage {
                    service,
                    channel,
                    message,
                });
                self.service_call(principal, request).await
            }
            HostCall::SetStatus { service, status } => {
                let request = ServiceRequest::SetStatus(OutboundStatus { service, status });
                self.service_call(principal, request).await
            }
            HostCall::CallPlugin {
                target,
                interface,
                args,
            } => self.call_plugin(principal, target, interface, args, chain).await,
            HostCall::HttpGet { url } => self.http_get(&url).await,
            HostCall::Log { level, message } => {
                let msg = sanitize_log_message(&message);
                match level {
                    LogLevel::Debug => tracing::debug!(plugin = %principal, "{msg}"),
                    LogLevel::Info => tracing::info!(plugin = %principal, "{msg}"),
                    LogLevel::Warn => tracing::warn!(plugin = %principal, "{msg}"),
                    LogLevel::Error => tracing::error!(plugin = %principal, "{msg}"),
                }
                Ok(Value::Null)
            }
        }
    }

    async fn service_call(
        &self,
        principal: &Principal,
        request: ServiceRequest,
    ) -> Result<Value, PluginError> {
        let service = request.service().to_string();
        let session = self.vault.session(&service).ok_or_else(|| {
            PluginError::Service(format!("no authenticated session for service '{service}'"))
        })?;

        let started = std::time::Instant::now();
        let receipt = tokio::time::timeout(
            self.call_timeout,
            connection::perform(self.connections.as_ref(), &session, &request),
        )
        .await
        .map_err(|_| {
            tracing::warn!(
                principal = %principal,
                service = %service,
                action = %request.action(),
                "service call timed out"
            );
            PluginError::Timeout(self.call_timeout.as_millis() as u64)
        })??;

        tracing::debug!(
            principal = %principal,
            service = %service,
            action = %request.action(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "service call completed"
        );
        Ok(serde_json::to_value(receipt)?)
    }

    async fn call_plugin(
        &self,
        principal: &Principal,
        target: PluginId,
        interface: String,
        args: Value,
        chain: Vec<PluginId>,
    ) -> Result<Value, PluginError> {
        if chain.contains(&target) {
            tracing::warn!(
                principal = %principal,
                target = %target,
                interface = %interface,
                "reentrant inter-plugin call rejected"
            );
            return Err(PluginError::Reentrant(target.to_string()));
        }

        let (state, mailbox) = self
            .table
            .mailbox(&target)
            .await
            .ok_or_else(|| PluginError::NotFound(target.to_string()))?;
        let Some(mailbox) = mailbox.filter(|_| state == PluginState::Running) else {
            return Err(PluginError::NotRunning(target.to_string()));
        };

        let caller = match principal {
            Principal::Plugin(id) => Some(id.clone()),
            Principal::Ui => None,
        };
        let (reply, response) = oneshot::channel();
        let request = CallRequest {
            caller,
            interface,
            args,
            chain,
            reply,
        };

        let exchange = async {
            mailbox
                .send(request)
                .await
                .map_err(|_| PluginError::NotRunning(target.to_string()))?;
            response
                .await
                .map_err(|_| PluginError::NotRunning(target.to_string()))?
        };
        tokio::time::timeout(self.call_timeout, exchange)
            .await
            .map_err(|_| PluginError::Timeout(self.call_timeout.as_millis() as u64))?
    }

    async fn http_get(&self, url: &str) -> Result<Value, PluginError> {
        let host = url_host(url)?;
        check_private_host(&host)?;

        let resp = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PluginError::Timeout(self.call_timeout.as_millis() as u64)
                } else {
                    PluginError::Http(e.to_string())
                }
            })?;

        let status = resp.status().as_u16();
        let headers: HashMap<String, String> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| PluginError::Http(e.to_string()))?;
        if body.len() > MAX_HTTP_RESPONSE_BYTES {
            return Err(PluginError::Http(format!(
                "response body too large: {} bytes (max: {MAX_HTTP_RESPONSE_BYTES} bytes)",
                body.len()
            )));
        }

        Ok(json!({
            "status": status,
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
        }))
    }
}

// ─── Host handle ────────────────────────────────────────────────────────

/// A plugin-scoped view of the gateway, handed to its component.
///
/// Calls block the current thread until the gateway answers, so they must
/// be made from the component's own (blocking) thread, never from inside an
/// async task.
#[derive(Clone)]
pub struct HostHandle {
    plugin: PluginId,
    gateway: Arc<CapabilityGateway>,
    runtime: tokio::runtime::Handle,
    chain: Arc<Mutex<Vec<PluginId>>>,
}

impl std::fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHandle")
            .field("plugin", &self.plugin)
            .finish_non_exhaustive()
    }
}

impl HostHandle {
    pub(crate) fn new(
        plugin: PluginId,
        gateway: Arc<CapabilityGateway>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            chain: Arc::new(Mutex::new(vec![plugin.clone()])),
            plugin,
            gateway,
            runtime,
        }
    }

    pub fn plugin(&self) -> &PluginId {
        &self.plugin
    }

    pub fn invoke(&self, call: HostCall) -> Result<Value, PluginError> {
        let chain = self.chain();
        self.runtime
            .block_on(self.gateway.dispatch(&self.plugin, call, chain))
    }

    /// JSON form used by the sandbox: `request` holds the call's arguments
    /// and the reply is an `{"ok": ..}` / `{"error": ..}` envelope.
    pub fn invoke_json(&self, function: &str, request: &str) -> String {
        let reply = match parse_call(function, request) {
            Ok(call) => HostReply::from_result(self.invoke(call)),
            Err(err) => {
                tracing::debug!(plugin = %self.plugin, function, "malformed host call: {err}");
                HostReply::Error(ErrorBody {
                    kind: ErrorKind::InvalidCall,
                    message: err.to_string(),
                })
            }
        };
        reply.to_json()
    }

    /// Mark this plugin as serving a forwarded call from `chain`.
    pub(crate) fn enter_call(&self, chain: &[PluginId]) {
        let mut current = self.chain.lock().unwrap_or_else(PoisonError::into_inner);
        current.clear();
        current.extend(chain.iter().cloned());
        current.push(self.plugin.clone());
    }

    pub(crate) fn leave_call(&self) {
        let mut current = self.chain.lock().unwrap_or_else(PoisonError::into_inner);
        current.clear();
        current.push(self.plugin.clone());
    }

    fn chain(&self) -> Vec<PluginId> {
        self.chain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn parse_call(function: &str, request: &str) -> Result<HostCall, PluginError> {
    let mut args = if request.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(request)?
    };
    let Value::Object(ref mut map) = args else {
        return Err(PluginError::HostFunction(format!(
            "arguments for '{function}' must be a JSON object"
        )));
    };
    map.insert("function".into(), Value::String(function.to_string()));
    Ok(serde_json::from_value(args)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_log_message() {
        assert_eq!(sanitize_log_message("hello world"), "hello world");
        assert_eq!(sanitize_log_message("line1\nline2"), "line1\nline2");
        assert_eq!(sanitize_log_message("bad\x00\x01\x02chars"), "badchars");
        let long = "x".repeat(3000);
        let result = sanitize_log_message(&long);
        assert!(result.starts_with(&"x".repeat(MAX_LOG_MESSAGE_LEN)));
        assert!(result.ends_with("(truncated)"));
    }

    #[test]
    fn test_host_call_wire_format() {
        let call: HostCall = serde_json::from_str(
            r##"{"function":"send-message","service":"twitch","channel":"#chan","message":"hi"}"##,
        )
        .unwrap();
        assert_eq!(
            call,
            HostCall::SendMessage {
                service: "twitch".into(),
                channel: "#chan".into(),
                message: "hi".into(),
            }
        );
        assert_eq!(call.name(), "send-message");

        let call: HostCall =
            serde_json::from_str(r#"{"function":"log","message":"m"}"#).unwrap();
        assert_eq!(
            call,
            HostCall::Log {
                level: LogLevel::Info,
                message: "m".into()
            }
        );
    }

    #[test]
    fn test_required_capabilities() {
        let send = HostCall::SendMessage {
            service: "twitch".into(),
            channel: "c".into(),
            message: "m".into(),
        };
        assert_eq!(
            send.required_capability().unwrap(),
            Some(service_capability("twitch", ServiceAction::SendMessage))
        );

        let http = HostCall::HttpGet {
            url: "https://api.example.com/v1".into(),
        };
        assert_eq!(
            http.required_capability().unwrap(),
            Some(Capability::Network {
                scope: "api.example.com".into()
            })
        );

        let log = HostCall::Log {
            level: LogLevel::Warn,
            message: "x".into(),
        };
        assert_eq!(log.required_capability().unwrap(), None);

        let wildcard_emit = HostCall::EmitEvent {
            event_type: "chat.*".into(),
            data: Value::Null,
        };
        assert!(wildcard_emit.required_capability().is_err());

        let bad_scheme = HostCall::HttpGet {
            url: "file:///etc/passwd".into(),
        };
        assert!(bad_scheme.required_capability().is_err());
    }

    #[test]
    fn test_capability_kind_needs_no_valid_arguments() {
        let bad_url = HostCall::HttpGet {
            url: "not a url".into(),
        };
        assert!(bad_url.required_capability().is_err());
        assert_eq!(bad_url.capability_kind(), Some(CapabilityKind::Network));

        let set_status = HostCall::SetStatus {
            service: String::new(),
            status: String::new(),
        };
        assert_eq!(
            set_status.capability_kind(),
            Some(CapabilityKind::ServiceApi(ServiceAction::SetStatus))
        );
        let log = HostCall::Log {
            level: LogLevel::Debug,
            message: String::new(),
        };
        assert_eq!(log.capability_kind(), None);
    }

    #[test]
    fn test_private_hosts_blocked() {
        for host in [
            "localhost",
            "127.0.0.1",
            "127.0.0.2",
            "10.0.0.1",
            "172.16.0.1",
            "192.168.1.1",
            "169.254.169.254",
            "169.254.1.1",
            "metadata.google.internal",
            "[::1]",
            "0.0.0.0",
        ] {
            assert!(
                matches!(check_private_host(host), Err(PluginError::PermissionDenied(_))),
                "{host} should be blocked"
            );
        }
        assert!(check_private_host("8.8.8.8").is_ok());
        assert!(check_private_host("api.example.com").is_ok());
    }

    #[test]
    fn test_parse_call_injects_function() {
        let call = parse_call("subscribe-to-event", r#"{"event_type":"twitch.*"}"#).unwrap();
        assert_eq!(
            call,
            HostCall::SubscribeToEvent {
                event_type: "twitch.*".into()
            }
        );
        assert!(parse_call("log", "[1,2]").is_err());
        assert!(parse_call("nope", "{}").is_err());
        assert!(parse_call("log", "{not json").is_err());
    }

    #[test]
    fn test_host_reply_envelope() {
        let ok = HostReply::from_result(Ok(json!({"a": 1})));
        assert_eq!(ok.to_json(), r#"{"ok":{"a":1}}"#);

        let err = HostReply::from_result(Err(PluginError::PermissionDenied("x".into())));
        let value: Value = serde_json::from_str(&err.to_json()).unwrap();
        assert_eq!(value["error"]["kind"], "permission_denied");
    }
}
