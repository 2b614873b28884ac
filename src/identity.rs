//! Collects the facts the one-shot registration handshake reports about
//! this host: hostname, best-effort public IP, SSH host-key fingerprint,
//! and the agent's own public JWK.
//!
//! Grounded on `aether-proxy`'s hardware/network collection shape
//! (`net::detect_public_ip`, `hardware::collect`): a handful of
//! best-effort probes folded into one snapshot struct, gathered once at
//! startup and handed to the registration client.

use std::collections::HashMap;
use std::process::Command;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::keystore::KeyStore;

/// Ordered list of external services queried for this host's public IP.
/// First one to return a parseable IPv4/IPv6 address wins.
const PUBLIC_IP_ENDPOINTS: &[&str] = &[
    "https://api.ipify.org",
    "https://ifconfig.me/ip",
    "https://icanhazip.com",
];

const PUBLIC_IP_TIMEOUT: Duration = Duration::from_secs(5);
const PUBLIC_IP_MAX_BYTES: usize = 64;

/// SSH host key files checked in order when deriving the fingerprint;
/// the first one `ssh-keygen -lE sha256` can read wins.
const HOST_KEY_FILES: &[&str] = &[
    "/etc/ssh/ssh_host_ed25519_key.pub",
    "/etc/ssh/ssh_host_rsa_key.pub",
    "/etc/ssh/ssh_host_ecdsa_key.pub",
];

/// Payload POSTed (base64-encoded) to the control plane's registration
/// endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationRequest {
    #[serde(rename = "hostId")]
    pub host_id: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub hostname: String,
    #[serde(rename = "publicIp")]
    pub public_ip: String,
    pub fingerprint: String,
    #[serde(rename = "fingerprintPublicKey")]
    pub fingerprint_public_key: String,
    #[serde(rename = "jwkPublicKey")]
    pub jwk_public_key: HashMap<String, serde_json::Value>,
    #[serde(rename = "environmentId", skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    #[serde(rename = "orgId")]
    pub org_id: String,
    pub labels: Vec<String>,
    pub timestamp: String,
}

/// Collects a [`RegistrationRequest`] snapshot for this host. Stateless —
/// every call re-probes the network and re-reads host keys, since this
/// only ever runs once at registration time.
pub struct HostIdentity;

impl HostIdentity {
    /// Failure to collect any individual fact (public IP, host key
    /// fingerprint) is non-fatal: each has a documented fallback per
    /// spec.md §4.8, so this never returns `Err`.
    pub async fn collect_for(
        org_id: &str,
        host_id: &str,
        labels: &[String],
        environment: Option<String>,
        keystore: &KeyStore,
    ) -> RegistrationRequest {
        let hostname = gethostname::gethostname()
            .into_string()
            .unwrap_or_else(|_| "unknown-host".to_string());

        let public_ip = detect_public_ip().await.unwrap_or_default();
        let (fingerprint, fingerprint_public_key) = detect_host_fingerprint(&hostname);

        let jwk_public_key = match keystore.signer().public_jwk().as_object() {
            Some(obj) => obj
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
            None => HashMap::new(),
        };

        RegistrationRequest {
            host_id: host_id.to_string(),
            client_id: format!("{org_id}:{host_id}:ssh"),
            hostname,
            public_ip,
            fingerprint,
            fingerprint_public_key,
            jwk_public_key,
            environment_id: environment,
            org_id: org_id.to_string(),
            labels: labels.to_vec(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

async fn detect_public_ip() -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(PUBLIC_IP_TIMEOUT)
        .build()
        .ok()?;

    for endpoint in PUBLIC_IP_ENDPOINTS {
        match client.get(*endpoint).send().await {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => {
                    let candidate: String = body.chars().take(PUBLIC_IP_MAX_BYTES).collect();
                    let candidate = candidate.trim();
                    if let Ok(addr) = candidate.parse::<std::net::IpAddr>() {
                        return Some(addr.to_string());
                    }
                }
                Err(e) => debug!(endpoint, error = %e, "public IP probe body read failed"),
            },
            Ok(resp) => debug!(endpoint, status = %resp.status(), "public IP probe non-success"),
            Err(e) => debug!(endpoint, error = %e, "public IP probe failed"),
        }
    }
    warn!("unable to determine public IP from any probe endpoint");
    None
}

/// Returns `(fingerprint, fingerprint_public_key)`. Prefers
/// `ssh-keygen -lE sha256` over the first readable host key in
/// [`HOST_KEY_FILES`] order; falls back to a synthetic fingerprint
/// derived from the hostname (and, ideally, non-loopback MACs) when no
/// host key is readable.
fn detect_host_fingerprint(hostname: &str) -> (String, String) {
    for path in HOST_KEY_FILES {
        let Ok(public_key) = std::fs::read_to_string(path) else {
            continue;
        };
        let output = Command::new("ssh-keygen")
            .args(["-lE", "sha256", "-f", path])
            .output();
        if let Ok(output) = output {
            if output.status.success() {
                let fingerprint = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !fingerprint.is_empty() {
                    return (fingerprint, public_key.trim().to_string());
                }
            }
        }
    }

    debug!("no readable SSH host key, falling back to synthetic fingerprint");
    let macs = non_loopback_macs().join("");
    let seed = format!("{hostname}{macs}");
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    let fingerprint = hex::encode(digest)[..32].to_string();

    use base64::Engine;
    let mut fallback_hasher = Sha256::new();
    fallback_hasher.update(format!("machine-public-key-{hostname}").as_bytes());
    let fingerprint_public_key =
        base64::engine::general_purpose::STANDARD.encode(fallback_hasher.finalize());

    (fingerprint, fingerprint_public_key)
}

/// Best-effort MAC collection, skipping loopback and Docker-managed
/// interfaces, used only as fallback-fingerprint entropy.
fn non_loopback_macs() -> Vec<String> {
    let networks = sysinfo::Networks::new_with_refreshed_list();
    networks
        .iter()
        .filter(|(name, _)| *name != "lo" && !name.starts_with("docker") && !name.starts_with("br-"))
        .map(|(_, data)| data.mac_address().to_string())
        .filter(|mac| mac != "00:00:00:00:00:00")
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_fingerprint_is_deterministic_for_same_hostname() {
        let (a, _) = detect_host_fingerprint("host-with-no-ssh-keys-in-test-env");
        let (b, _) = detect_host_fingerprint("host-with-no-ssh-keys-in-test-env");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }
}
