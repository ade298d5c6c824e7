//! Capability model: declarative grants attached to a plugin manifest.
//!
//! Pure data. A capability is granted at load time and never escalated;
//! the gateway asks a [`CapabilitySet`] whether it satisfies the capability
//! a call requires.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::events::EventPattern;
use crate::manifest::PluginId;

/// Closed set of vault-backed actions a service grant can cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceAction {
    SendMessage,
    SetStatus,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendMessage => "send-message",
            Self::SetStatus => "set-status",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Capability {
    /// Outbound HTTP to a host, `*`, or `*.domain`.
    Network { scope: String },
    /// A directory under the plugin's data dir, exposed to the sandbox.
    Filesystem { scope: String },
    ServiceApi {
        service: String,
        actions: BTreeSet<ServiceAction>,
    },
    InterPlugin { target: PluginId, interface: String },
    EventSubscribe { pattern: EventPattern },
    EventEmit { pattern: EventPattern },
}

/// The kind of a capability, without its scope. Used to refuse a call
/// before its arguments are looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Network,
    Filesystem,
    ServiceApi(ServiceAction),
    InterPlugin,
    EventSubscribe,
    EventEmit,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => f.write_str("network"),
            Self::Filesystem => f.write_str("filesystem"),
            Self::ServiceApi(action) => write!(f, "service({action})"),
            Self::InterPlugin => f.write_str("inter-plugin"),
            Self::EventSubscribe => f.write_str("subscribe"),
            Self::EventEmit => f.write_str("emit"),
        }
    }
}

impl Capability {
    /// Whether some scope of this grant could cover a call of `kind`.
    pub fn is_kind(&self, kind: CapabilityKind) -> bool {
        match (self, kind) {
            (Self::ServiceApi { actions, .. }, CapabilityKind::ServiceApi(action)) => {
                actions.contains(&action)
            }
            (Self::Network { .. }, CapabilityKind::Network)
            | (Self::Filesystem { .. }, CapabilityKind::Filesystem)
            | (Self::InterPlugin { .. }, CapabilityKind::InterPlugin)
            | (Self::EventSubscribe { .. }, CapabilityKind::EventSubscribe)
            | (Self::EventEmit { .. }, CapabilityKind::EventEmit) => true,
            _ => false,
        }
    }

    /// Whether holding `self` is enough for a call that requires `required`.
    pub fn satisfies(&self, required: &Capability) -> bool {
        match (self, required) {
            (Self::Network { scope }, Self::Network { scope: host }) => {
                network_scope_matches(scope, host)
            }
            (Self::Filesystem { scope: granted }, Self::Filesystem { scope: wanted }) => {
                let granted = granted.trim_end_matches('/');
                wanted == granted || wanted.starts_with(&format!("{granted}/"))
            }
            (
                Self::ServiceApi { service, actions },
                Self::ServiceApi {
                    service: wanted_service,
                    actions: wanted_actions,
                },
            ) => service == wanted_service && wanted_actions.is_subset(actions),
            (
                Self::InterPlugin { target, interface },
                Self::InterPlugin {
                    target: wanted_target,
                    interface: wanted_interface,
                },
            ) => target == wanted_target && interface == wanted_interface,
            (Self::EventSubscribe { pattern }, Self::EventSubscribe { pattern: wanted }) => {
                pattern.covers(wanted)
            }
            (Self::EventEmit { pattern }, Self::EventEmit { pattern: wanted }) => {
                pattern.covers(wanted)
            }
            _ => false,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network { scope } => write!(f, "network({scope})"),
            Self::Filesystem { scope } => write!(f, "filesystem({scope})"),
            Self::ServiceApi { service, actions } => {
                let actions: Vec<&str> = actions.iter().map(ServiceAction::as_str).collect();
                write!(f, "service({service}: {})", actions.join(", "))
            }
            Self::InterPlugin { target, interface } => {
                write!(f, "inter-plugin({target}/{interface})")
            }
            Self::EventSubscribe { pattern } => write!(f, "subscribe({pattern})"),
            Self::EventEmit { pattern } => write!(f, "emit({pattern})"),
        }
    }
}

/// Match a host against a network scope: exact, `*`, or `*.suffix`.
pub fn network_scope_matches(scope: &str, host: &str) -> bool {
    if scope == "*" {
        return true;
    }
    if let Some(suffix) = scope.strip_prefix("*.") {
        return host == suffix || host.ends_with(&format!(".{suffix}"));
    }
    scope == host
}

/// The immutable set of grants a principal holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    grants: Vec<Capability>,
}

impl CapabilitySet {
    pub fn new(grants: Vec<Capability>) -> Self {
        Self { grants }
    }

    pub fn grants(&self, required: &Capability) -> bool {
        self.grants.iter().any(|g| g.satisfies(required))
    }

    /// Whether any grant is of `kind`, whatever its scope.
    pub fn holds_kind(&self, kind: CapabilityKind) -> bool {
        self.grants.iter().any(|g| g.is_kind(kind))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.grants.iter()
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn network_scopes(&self) -> Vec<String> {
        self.grants
            .iter()
            .filter_map(|g| match g {
                Capability::Network { scope } => Some(scope.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn filesystem_scopes(&self) -> Vec<String> {
        self.grants
            .iter()
            .filter_map(|g| match g {
                Capability::Filesystem { scope } => Some(scope.clone()),
                _ => None,
            })
            .collect()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
