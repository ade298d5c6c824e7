//! Credential vault: the host-only store of authenticated-session handles.
//!
//! Tokens are never serialized and never handed to plugins. Only
//! [`ConnectionManager`](crate::connection::ConnectionManager)
//! implementations receive a borrowed token while performing an action.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

const REDACTED: &str = "[redacted]";

/// An opaque authenticated session for one service.
///
/// Not `Serialize` or `Clone`; `Debug` never prints the secret.
pub struct CredentialToken {
    service: String,
    secret: String,
}

impl CredentialToken {
    pub fn new(service: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            secret: secret.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Raw session secret, for connection managers only.
    pub fn expose_secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for CredentialToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialToken")
            .field("service", &self.service)
            .field("secret", &REDACTED)
            .finish()
    }
}

/// Process-lifetime map of service name to session token.
#[derive(Default)]
pub struct CredentialVault {
    sessions: RwLock<HashMap<String, Arc<CredentialToken>>>,
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault")
            .field("services", &self.services())
            .finish()
    }
}

impl CredentialVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) the session for `service`.
    pub fn insert(&self, service: impl Into<String>, secret: impl Into<String>) {
        let service = service.into();
        let token = Arc::new(CredentialToken::new(service.clone(), secret));
        tracing::info!(service = %service, "credential stored in vault");
        self.write().insert(service, token);
    }

    pub fn revoke(&self, service: &str) -> bool {
        let removed = self.write().remove(service).is_some();
        if removed {
            tracing::info!(service = %service, "credential revoked");
        }
        removed
    }

    pub fn contains(&self, service: &str) -> bool {
        self.read().contains_key(service)
    }

    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.read().keys().cloned().collect();
        services.sort();
        services
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub(crate) fn session(&self, service: &str) -> Option<Arc<CredentialToken>> {
        self.read().get(service).cloned()
    }

    /// Whether any stored secret occurs inside `text`.
    pub fn leaks_into(&self, text: &str) -> bool {
        self.read()
            .values()
            .any(|t| !t.secret.is_empty() && text.contains(&t.secret))
    }

    /// Copy of `value` with every stored secret replaced in string leaves.
    pub fn redact(&self, value: Value) -> Value {
        let sessions = self.read();
        let secrets: Vec<&str> = sessions
            .values()
            .map(|t| t.secret.as_str())
            .filter(|s| !s.is_empty())
            .collect();
        if secrets.is_empty() {
            return value;
        }
        redact_value(value, &secrets)
    }

    /// Drop every session. Called once on host teardown.
    pub fn clear(&self) {
        let mut sessions = self.write();
        let count = sessions.len();
        sessions.clear();
        tracing::info!(count, "credential vault cleared");
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<CredentialToken>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<CredentialToken>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn redact_value(value: Value, secrets: &[&str]) -> Value {
    match value {
        Value::String(s) => {
            let mut out = s;
            for secret in secrets {
                if out.contains(secret) {
                    out = out.replace(secret, REDACTED);
                }
            }
            Value::String(out)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| redact_value(v, secrets)).collect())
        }
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, redact_value(v, secrets)))
                .collect(),
        ),
        other => other,
    }
}
