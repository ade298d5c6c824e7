//! Boundary to the API connection manager that owns the third-party
//! service connections.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capability::ServiceAction;
use crate::error::PluginError;
use crate::vault::CredentialToken;

/// A chat message to deliver through a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub service: String,
    pub channel: String,
    pub message: String,
}

/// A status/title update on a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundStatus {
    pub service: String,
    pub status: String,
}

/// What the connection manager reports back. Must not contain credentials;
/// the gateway redacts it against the vault regardless.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundReceipt {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub detail: serde_json::Value,
}

/// A vault-backed action, one variant per [`ServiceAction`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceRequest {
    SendMessage(OutboundMessage),
    SetStatus(OutboundStatus),
}

impl ServiceRequest {
    pub fn service(&self) -> &str {
        match self {
            Self::SendMessage(m) => &m.service,
            Self::SetStatus(s) => &s.service,
        }
    }

    pub fn action(&self) -> ServiceAction {
        match self {
            Self::SendMessage(_) => ServiceAction::SendMessage,
            Self::SetStatus(_) => ServiceAction::SetStatus,
        }
    }
}

/// Performs outbound actions on authenticated service connections.
///
/// Dropping a returned future cancels the request; the gateway relies on
/// this for timeouts and for cancelling calls of stopping plugins.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    async fn send_message(
        &self,
        credential: &CredentialToken,
        message: &OutboundMessage,
    ) -> Result<OutboundReceipt, PluginError>;

    async fn set_status(
        &self,
        credential: &CredentialToken,
        status: &OutboundStatus,
    ) -> Result<OutboundReceipt, PluginError>;
}

/// Route a request to the matching trait method.
pub(crate) async fn perform(
    connections: &dyn ConnectionManager,
    credential: &CredentialToken,
    request: &ServiceRequest,
) -> Result<OutboundReceipt, PluginError> {
    match request {
        ServiceRequest::SendMessage(message) => connections.send_message(credential, message).await,
        ServiceRequest::SetStatus(status) => connections.set_status(credential, status).await,
    }
}
