//! Top-level error taxonomy.
//!
//! Each subsystem owns a `thiserror` enum; `AgentError` composes them so
//! `main` has one `Result` to match on for exit-code selection.

use thiserror::Error;

use crate::keystore::KeyStoreError;
use crate::provisioning::ProvisioningError;
use crate::registrar::RegistrarError;
use crate::tunnel::TunnelError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("tunnelHost must use ws:// or wss://, got {0:?}")]
    InvalidTunnelScheme(String),

    #[error("heartbeatIntervalSeconds must be > 0")]
    InvalidHeartbeatInterval,

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Process exit codes, distinguished so a supervising service manager can
/// apply its own restart rate-limiting to authentication failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Ok = 0,
    StartupError = 1,
    AuthenticationFatal = 77,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Registrar(#[from] RegistrarError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    /// Maps this error onto the process exit code the CLI contract
    /// promises: authentication failures get a distinguished code so the
    /// service supervisor can rate-limit restarts differently from a
    /// plain startup error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            AgentError::Tunnel(TunnelError::Authentication(_)) => ExitCode::AuthenticationFatal,
            _ => ExitCode::StartupError,
        }
    }
}
