//! HTTP relay connection manager.
//!
//! Each service is reached through a relay endpoint configured with
//! `PATO_SERVICE_<NAME>_URL`. Messages are POSTed to `<endpoint>/messages`,
//! status updates to `<endpoint>/status`, authenticated with the vault
//! session as a bearer token.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use pato_plugin::{
    ConnectionManager, CredentialToken, OutboundMessage, OutboundReceipt, OutboundStatus,
    PluginError,
};
use serde::Serialize;
use url::Url;

const SERVICE_PREFIX: &str = "PATO_SERVICE_";
const SERVICE_SUFFIX: &str = "_URL";

pub struct HttpRelay {
    client: reqwest::Client,
    endpoints: HashMap<String, Url>,
}

impl HttpRelay {
    pub fn new(endpoints: HashMap<String, Url>, timeout: Duration) -> Result<Self, PluginError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PluginError::Service(format!("HTTP client error: {e}")))?;
        Ok(Self { client, endpoints })
    }

    /// Collect `PATO_SERVICE_<NAME>_URL` variables. Service names are
    /// lowercased; unparsable URLs are skipped with a warning.
    pub fn endpoints_from_env() -> HashMap<String, Url> {
        endpoints_from_vars(std::env::vars())
    }

    pub fn services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.endpoints.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    async fn post<T: Serialize>(
        &self,
        credential: &CredentialToken,
        service: &str,
        path: &str,
        body: &T,
    ) -> Result<OutboundReceipt, PluginError> {
        let endpoint = self.endpoints.get(service).ok_or_else(|| {
            PluginError::Service(format!("no relay endpoint configured for '{service}'"))
        })?;
        let url = endpoint
            .join(path)
            .map_err(|e| PluginError::Service(format!("bad relay URL for '{service}': {e}")))?;

        let resp = self
            .client
            .post(url)
            .bearer_auth(credential.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(service, error = %e, "relay request failed");
                PluginError::Service(format!("relay for '{service}' unreachable"))
            })?;

        let status = resp.status();
        if !status.is_success() {
            tracing::warn!(service, status = %status, "relay rejected request");
            return Err(PluginError::Service(format!(
                "relay for '{service}' answered {status}"
            )));
        }

        let text = resp.text().await.unwrap_or_default();
        if text.trim().is_empty() {
            return Ok(OutboundReceipt::default());
        }
        serde_json::from_str(&text).map_err(|e| {
            PluginError::Service(format!("relay for '{service}' sent a malformed receipt: {e}"))
        })
    }
}

fn endpoints_from_vars(vars: impl Iterator<Item = (String, String)>) -> HashMap<String, Url> {
    vars.filter_map(|(key, value)| {
        let name = key
            .strip_prefix(SERVICE_PREFIX)?
            .strip_suffix(SERVICE_SUFFIX)?
            .to_ascii_lowercase();
        if name.is_empty() {
            return None;
        }
        // A trailing slash keeps `join` from replacing the last path segment.
        let value = if value.ends_with('/') {
            value
        } else {
            format!("{value}/")
        };
        match Url::parse(&value) {
            Ok(url) => Some((name, url)),
            Err(e) => {
                tracing::warn!(variable = %key, "ignoring relay endpoint: {e}");
                None
            }
        }
    })
    .collect()
}

#[async_trait]
impl ConnectionManager for HttpRelay {
    async fn send_message(
        &self,
        credential: &CredentialToken,
        message: &OutboundMessage,
    ) -> Result<OutboundReceipt, PluginError> {
        self.post(credential, &message.service, "messages", message)
            .await
    }

    async fn set_status(
        &self,
        credential: &CredentialToken,
        status: &OutboundStatus,
    ) -> Result<OutboundReceipt, PluginError> {
        self.post(credential, &status.service, "status", status).await
    }
}
