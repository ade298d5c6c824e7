//! Plugin host error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("init failed for plugin {plugin}: {reason}")]
    InitFailure { plugin: String, reason: String },

    #[error("plugin {plugin} trapped: {reason}")]
    RuntimeTrap { plugin: String, reason: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("plugin {0} is not running")]
    NotRunning(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("reentrant call into plugin {0}")]
    Reentrant(String),

    #[error("no route to {target} for interface '{interface}'")]
    NoRoute { target: String, interface: String },

    #[error("plugin {plugin} returned an error: {message}")]
    PluginReturned { plugin: String, message: String },

    #[error("call cancelled: plugin {0} is stopping")]
    Cancelled(String),

    #[error("invalid transition for plugin {plugin}: {from} -> {to}")]
    InvalidTransition {
        plugin: String,
        from: String,
        to: String,
    },

    #[error("host function error: {0}")]
    HostFunction(String),

    #[error("service error: {0}")]
    Service(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),
}

impl PluginError {
    /// Stable tag for this error, carried to plugins inside error envelopes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Manifest(_) | Self::InvalidManifest(_) | Self::TomlParse(_) | Self::Semver(_) => {
                ErrorKind::InvalidManifest
            }
            Self::Sandbox(_) => ErrorKind::Sandbox,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InitFailure { .. } => ErrorKind::InitFailure,
            Self::RuntimeTrap { .. } => ErrorKind::RuntimeTrap,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::NotRunning(_) => ErrorKind::NotRunning,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Reentrant(_) => ErrorKind::Reentrant,
            Self::NoRoute { .. } => ErrorKind::NoRoute,
            Self::PluginReturned { .. } => ErrorKind::PluginError,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::HostFunction(_) | Self::Serialization(_) => ErrorKind::InvalidCall,
            Self::Service(_) | Self::Http(_) | Self::Io(_) => ErrorKind::Service,
        }
    }
}

/// Error tags as seen by plugins and the UI bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidManifest,
    Sandbox,
    NotFound,
    AlreadyExists,
    InitFailure,
    RuntimeTrap,
    PermissionDenied,
    NotRunning,
    Timeout,
    Reentrant,
    NoRoute,
    PluginError,
    Cancelled,
    InvalidTransition,
    InvalidCall,
    Service,
}

/// Error half of the JSON envelope returned across the sandbox boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PluginError> for ErrorBody {
    fn from(err: &PluginError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
