//! One-shot registration handshake: exchanges a [`RegistrationRequest`]
//! for a signed configuration and persists it as the on-disk
//! [`ConfigFile`].
//!
//! A single timed-out, bearer-authenticated POST against the control
//! plane's registration endpoint.

use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::ConfigFile;
use crate::identity::RegistrationRequest;

#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("failed to serialize registration payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("registration request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("registration rejected (HTTP {status}): {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("registration response reported ok=false: {0}")]
    NotOk(String),

    #[error("failed to persist configuration to {path}: {source}")]
    Persist {
        path: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Serialize)]
struct RegistrationEnvelope {
    key: String,
}

/// Response body the control plane returns on a successful registration
/// (spec.md §6).
#[derive(Debug, Deserialize)]
pub struct RegistrationResponse {
    pub ok: bool,
    #[serde(rename = "environmentId")]
    pub environment_id: Option<String>,
    #[serde(rename = "hostId")]
    pub host_id: String,
    #[serde(rename = "orgId")]
    pub org_id: String,
    #[serde(rename = "tunnelHost")]
    pub tunnel_host: String,
    #[serde(rename = "trustedCa")]
    pub trusted_ca: String,
}

/// POSTs a base64-encoded [`RegistrationRequest`] to the control plane and
/// persists what it hands back.
pub struct Registrar {
    http: Client,
}

impl Registrar {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    /// Registers this host against `url`, authenticating the request with
    /// a bootstrap `token` (a short-lived JWT minted the same way as the
    /// tunnel's bearer auth). On success, writes a merged [`ConfigFile`] to
    /// `config_path` and returns it.
    pub async fn register(
        &self,
        url: &str,
        token: &str,
        request: &RegistrationRequest,
        key_path: &str,
        config_path: &std::path::Path,
    ) -> Result<ConfigFile, RegistrarError> {
        let payload = serde_json::to_vec(request)?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(payload);

        info!(url, host_id = %request.host_id, "registering with control plane");

        let resp = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {token}"))
            .json(&RegistrationEnvelope { key: encoded })
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(RegistrarError::Rejected { status, body });
        }

        let body: RegistrationResponse = resp.json().await?;
        if !body.ok {
            return Err(RegistrarError::NotOk(format!(
                "control plane returned ok=false for host {}",
                body.host_id
            )));
        }

        let file = ConfigFile::with_registration_defaults(
            body.org_id,
            body.host_id,
            body.tunnel_host,
            body.trusted_ca,
            key_path.to_string(),
        );
        file.save(config_path).map_err(|source| RegistrarError::Persist {
            path: config_path.display().to_string(),
            source,
        })?;

        info!(path = %config_path.display(), "registration complete, configuration written");
        Ok(file)
    }
}

impl Default for Registrar {
    fn default() -> Self {
        Self::new()
    }
}
