//! Runtime configuration: CLI/env overrides via `clap`, on-disk persistence
//! via YAML. `Config` (a `clap::Parser`) holds the process's actual knobs;
//! `ConfigFile` is what gets written to / read from disk and injected as
//! env defaults before `clap` parses argv.

use std::path::Path;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const ENV_PREFIX: &str = "KD_AGENT";

/// Host-resident SSH-access provisioning agent.
///
/// Maintains a persistent authenticated tunnel to the control plane and
/// executes just-in-time SSH access mutations (user/key/sudo/session) on
/// this host.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Organization identifier assigned by the control plane
    #[arg(long, env = "KD_AGENT_ORG_ID")]
    pub org_id: String,

    /// Host identifier assigned by the control plane
    #[arg(long, env = "KD_AGENT_HOST_ID")]
    pub host_id: String,

    /// Control-plane tunnel URL, must be ws:// or wss://
    #[arg(long, env = "KD_AGENT_TUNNEL_HOST")]
    pub tunnel_host: String,

    /// Tunnel identifier embedded in the JWT's `tunnel-id` claim,
    /// letting the control plane correlate concurrent connections
    /// from the same host
    #[arg(long, env = "KD_AGENT_TUNNEL_ID", default_value = "my-tunnel-id")]
    pub tunnel_id: String,

    /// Directory holding jwk.private.json / jwk.public.json
    #[arg(long, env = "KD_AGENT_KEY_PATH", default_value = "/etc/kd-agent/keys")]
    pub key_path: String,

    /// Heartbeat interval in seconds, must be > 0
    #[arg(long, env = "KD_AGENT_HEARTBEAT_INTERVAL", default_value_t = 60)]
    pub heartbeat_interval_seconds: u64,

    /// Free-form labels reported at registration time (key=value,key=value)
    #[arg(long, env = "KD_AGENT_LABELS", value_delimiter = ',')]
    pub labels: Vec<String>,

    /// Environment identifier reported at registration time
    #[arg(long, env = "KD_AGENT_ENVIRONMENT")]
    pub environment: Option<String>,

    /// Log intended provisioning mutations without touching the host
    #[arg(long, env = "KD_AGENT_DRY_RUN", default_value_t = false)]
    pub dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "KD_AGENT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "KD_AGENT_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    /// `"{orgId}:{hostId}:ssh"`, presented in every JWT `sub` and in every
    /// heartbeat `setClientId` call.
    pub fn client_id(&self) -> String {
        format!("{}:{}:ssh", self.org_id, self.host_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.org_id.trim().is_empty() {
            return Err(ConfigError::MissingField("orgId"));
        }
        if self.host_id.trim().is_empty() {
            return Err(ConfigError::MissingField("hostId"));
        }
        let scheme_ok = self.tunnel_host.starts_with("ws://") || self.tunnel_host.starts_with("wss://");
        if !scheme_ok {
            return Err(ConfigError::InvalidTunnelScheme(self.tunnel_host.clone()));
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(ConfigError::InvalidHeartbeatInterval);
        }
        Ok(())
    }
}

/// On-disk YAML configuration, written by [`crate::registrar::Registrar`]
/// after a successful registration handshake and reloaded on every
/// subsequent `start`. Field names mirror [`Config`]; everything here is
/// optional so the file can be merged as env-var defaults the same way
/// env defaults the same way the process config is injected before
/// `clap` parses argv, preserving the precedence CLI > env > file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trusted_ca: Option<String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Defaults applied when [`crate::registrar::Registrar`] writes a
    /// fresh config after registration (spec.md §4.9: `heartbeatIntervalSeconds
    /// = 60`, `dryRun = false`).
    pub fn with_registration_defaults(
        org_id: String,
        host_id: String,
        tunnel_host: String,
        trusted_ca: String,
        key_path: String,
    ) -> Self {
        Self {
            org_id: Some(org_id),
            host_id: Some(host_id),
            tunnel_host: Some(tunnel_host),
            key_path: Some(key_path),
            heartbeat_interval_seconds: Some(60),
            labels: None,
            environment: None,
            dry_run: Some(false),
            trusted_ca: Some(trusted_ca),
        }
    }

    /// Inject values as environment variables so `clap` picks them up.
    /// Only sets variables not already present, preserving precedence
    /// CLI > env > file.
    pub fn inject_env(&self) {
        self.inject_env_inner(false);
    }

    /// Inject values, overriding any existing env vars. Used after
    /// registration writes a fresh file so the freshly-saved config takes
    /// effect before the next parse.
    pub fn inject_env_override(&self) {
        self.inject_env_inner(true);
    }

    fn inject_env_inner(&self, force: bool) {
        macro_rules! set {
            ($env:expr, $val:expr) => {
                if let Some(ref v) = $val {
                    if force || std::env::var($env).is_err() {
                        std::env::set_var($env, v.to_string());
                    }
                }
            };
        }
        set!(concat_env("ORG_ID"), self.org_id);
        set!(concat_env("HOST_ID"), self.host_id);
        set!(concat_env("TUNNEL_HOST"), self.tunnel_host);
        set!(concat_env("KEY_PATH"), self.key_path);
        set!(
            concat_env("HEARTBEAT_INTERVAL"),
            self.heartbeat_interval_seconds
        );
        set!(concat_env("ENVIRONMENT"), self.environment);
        set!(concat_env("DRY_RUN"), self.dry_run);

        if let Some(ref labels) = self.labels {
            let env = concat_env("LABELS");
            if force || std::env::var(env).is_err() {
                std::env::set_var(env, labels.join(","));
            }
        }
    }
}

/// Builds a `KD_AGENT_<SUFFIX>` env var name without allocating a `String`
/// literal per call site.
fn concat_env(suffix: &str) -> String {
    format!("{ENV_PREFIX}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            org_id: "org1".into(),
            host_id: "host1".into(),
            tunnel_host: "wss://tunnel.example.com".into(),
            tunnel_id: "my-tunnel-id".into(),
            key_path: "/tmp/keys".into(),
            heartbeat_interval_seconds: 60,
            labels: vec![],
            environment: None,
            dry_run: false,
            log_level: "info".into(),
            log_json: false,
        }
    }

    #[test]
    fn client_id_is_org_host_ssh() {
        assert_eq!(base_config().client_id(), "org1:host1:ssh");
    }

    #[test]
    fn rejects_non_ws_tunnel_scheme() {
        let mut cfg = base_config();
        cfg.tunnel_host = "https://tunnel.example.com".into();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidTunnelScheme(_))
        ));
    }

    #[test]
    fn rejects_zero_heartbeat_interval() {
        let mut cfg = base_config();
        cfg.heartbeat_interval_seconds = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidHeartbeatInterval)
        ));
    }

    #[test]
    fn accepts_ws_scheme() {
        let mut cfg = base_config();
        cfg.tunnel_host = "ws://tunnel.example.com".into();
        assert!(cfg.validate().is_ok());
    }
}
