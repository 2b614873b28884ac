//! Idempotent provisioning engine: the four JIT SSH-access mutations the
//! control plane can request over the tunnel (spec.md §4.6). Registered
//! as the handler for the inbound `call` JSON-RPC method; every operation
//! validates its input before touching the host and is safe to retry with
//! the same `requestId`.

pub mod executor;
pub mod file_mutator;
pub mod os_adaptor;

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sysinfo::{Pid, System};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::rpc::RpcError;
use executor::PrivilegedExecutor;
use file_mutator::FileMutator;
use os_adaptor::OsAdaptor;

const USERNAME_PATTERN: &str = r"^[a-z][-a-z0-9_]*$";
const UID_RANGE_START: u32 = 65536;
const UID_RANGE_END: u32 = 90000;
const SUDOERS_P0_PATH: &str = "/etc/sudoers-p0";
const SUDOERS_PATH: &str = "/etc/sudoers";
const SUDOERS_INCLUDE_LINE: &str = "#include sudoers-p0";

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("invalid userName: must match {USERNAME_PATTERN}")]
    InvalidUserName,

    #[error("invalid action: must be \"grant\" or \"revoke\"")]
    InvalidAction,

    #[error("grant is not supported for provisionSession")]
    SessionGrantUnsupported,

    #[error("unknown provisioning command: {0}")]
    UnknownCommand(String),

    #[error("user {0} not found")]
    UserNotFound(String),

    #[error(transparent)]
    FileMutate(#[from] file_mutator::FileMutateError),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("no free uid available in range {UID_RANGE_START}..={UID_RANGE_END}")]
    UidExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Grant,
    Revoke,
}

impl Action {
    fn parse(s: &str) -> Result<Self, ProvisioningError> {
        match s {
            "grant" => Ok(Action::Grant),
            "revoke" => Ok(Action::Revoke),
            _ => Err(ProvisioningError::InvalidAction),
        }
    }
}

/// The `data` payload of an inbound `call` RPC (spec.md §3/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    #[serde(rename = "userName")]
    pub user_name: String,
    pub action: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "publicKey", default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub sudo: bool,
    pub command: String,
}

/// Wire envelope for the inbound `call` method (spec.md §6).
#[derive(Debug, Deserialize)]
pub struct ForwardedRequest {
    #[serde(default)]
    pub headers: Value,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub params: Value,
    pub data: ProvisioningRequest,
    #[serde(default)]
    pub options: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProvisioningResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
        }
    }

    fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
        }
    }
}

/// Executes the four provisioning operations. One instance is shared
/// across every tunnel connection and registered under the `call` method
/// name after each reconnect.
pub struct ProvisioningEngine {
    client_id: String,
    dry_run: bool,
    executor: Arc<dyn PrivilegedExecutor>,
    os_adaptor: Arc<dyn OsAdaptor>,
    username_re: Regex,
}

impl ProvisioningEngine {
    pub fn new(
        client_id: String,
        dry_run: bool,
        executor: Arc<dyn PrivilegedExecutor>,
        os_adaptor: Arc<dyn OsAdaptor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            dry_run,
            executor,
            os_adaptor,
            username_re: Regex::new(USERNAME_PATTERN).expect("static regex is valid"),
        })
    }

    /// Entry point registered on the [`crate::rpc::RpcEngine`] as the
    /// `call` method handler. Parses the `ForwardedRequest` envelope,
    /// dispatches by `data.command`, and shapes the response exactly as
    /// spec.md §6 describes: `status` 200 on success, 500 on handler
    /// failure, body always carrying `client_id`/`command`/`timestamp`.
    ///
    /// `cancel` fires when the tunnel that carried this request tears
    /// down; the blocking dispatch itself can't be killed mid-syscall, but
    /// racing it against cancellation means a torn-down connection never
    /// leaves this task waiting on a response no one will read.
    pub async fn handle_call(
        self: Arc<Self>,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<Value, RpcError> {
        let forwarded: ForwardedRequest = serde_json::from_value(params)
            .map_err(|e| RpcError::InvalidParams(format!("malformed ForwardedRequest: {e}")))?;

        let command = forwarded.data.command.clone();
        let engine = Arc::clone(&self);
        let result = tokio::select! {
            joined = tokio::task::spawn_blocking(move || engine.dispatch(&forwarded.data)) => {
                joined.unwrap_or_else(|e| ProvisioningResult::err(format!("handler task panicked: {e}")))
            }
            _ = cancel.cancelled() => {
                ProvisioningResult::err("cancelled: connection closed before provisioning completed")
            }
        };

        let status: u16 = if result.success { 200 } else { 500 };
        let status_text = if result.success {
            "OK"
        } else {
            "Internal Server Error"
        };

        let mut data = json!({
            "success": result.success,
            "client_id": self.client_id,
            "command": command,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "status": if result.success { "completed" } else { "failed" },
        });
        if let Some(message) = result.message {
            data["message"] = json!(message);
        }
        if let Some(error) = result.error {
            data["error"] = json!(error);
        }

        Ok(json!({
            "headers": {},
            "status": status,
            "statusText": status_text,
            "data": data,
        }))
    }

    /// Runs on the blocking thread pool: validates, then routes to the
    /// matching operation. Every path here is synchronous `std::fs` /
    /// `Command` work, never `.await`.
    fn dispatch(&self, request: &ProvisioningRequest) -> ProvisioningResult {
        if !self.username_re.is_match(&request.user_name) {
            return ProvisioningResult::err(ProvisioningError::InvalidUserName.to_string());
        }
        let action = match Action::parse(&request.action) {
            Ok(a) => a,
            Err(e) => return ProvisioningResult::err(e.to_string()),
        };

        let outcome = match request.command.as_str() {
            "provisionUser" => self.provision_user(request, action),
            "provisionAuthorizedKeys" => self.provision_authorized_keys(request, action),
            "provisionSudo" => self.provision_sudo(request, action),
            "provisionSession" => self.provision_session(request, action),
            other => Err(ProvisioningError::UnknownCommand(other.to_string())),
        };

        match outcome {
            Ok(message) => ProvisioningResult::ok(message),
            Err(e) => ProvisioningResult::err(e.to_string()),
        }
    }

    fn dry_run_note(&self, action: &str, request: &ProvisioningRequest) -> Option<String> {
        if !self.dry_run {
            return None;
        }
        Some(format!(
            "DRY-RUN: would {action} for user {} (requestId {})",
            request.user_name, request.request_id
        ))
    }

    // -- provisionUser --------------------------------------------------

    fn provision_user(
        &self,
        request: &ProvisioningRequest,
        action: Action,
    ) -> Result<String, ProvisioningError> {
        if action == Action::Revoke {
            return Ok(
                "revoke is a no-op: the account is not deleted, preserving audit and file ownership"
                    .to_string(),
            );
        }

        if let Some(note) = self.dry_run_note("create user", request) {
            return Ok(note);
        }

        if user_exists(&request.user_name) {
            return Ok(format!("user {} already exists", request.user_name));
        }

        let uid = next_free_uid()?;
        self.os_adaptor
            .create_group(self.executor.as_ref(), &request.user_name)?;
        self.os_adaptor
            .create_user(self.executor.as_ref(), &request.user_name, uid)?;

        info!(user = %request.user_name, uid, request_id = %request.request_id, "provisioned JIT user");
        Ok(format!("created user {} (uid {uid})", request.user_name))
    }

    // -- provisionAuthorizedKeys -----------------------------------------

    fn provision_authorized_keys(
        &self,
        request: &ProvisioningRequest,
        action: Action,
    ) -> Result<String, ProvisioningError> {
        let path = authorized_keys_path(&request.user_name);

        match action {
            Action::Grant => {
                let Some(public_key) = normalized_public_key(&request.public_key) else {
                    return Ok("no public key supplied, nothing to grant".to_string());
                };

                if let Some(note) = self.dry_run_note("append authorized_keys block", request) {
                    return Ok(note);
                }

                if !user_exists(&request.user_name) {
                    return Err(ProvisioningError::UserNotFound(request.user_name.clone()));
                }

                FileMutator::ensure_tagged_block(
                    &path,
                    &request.request_id,
                    &public_key,
                    0o600,
                    Some((&request.user_name, self.executor.as_ref())),
                )?;
                Ok(format!(
                    "granted authorized_keys entry for {} (requestId {})",
                    request.user_name, request.request_id
                ))
            }
            Action::Revoke => {
                if !path.exists() {
                    return Ok("authorized_keys file absent, nothing to revoke".to_string());
                }
                if let Some(note) = self.dry_run_note("remove authorized_keys block", request) {
                    return Ok(note);
                }
                FileMutator::remove_tagged_block(&path, &request.request_id)?;
                Ok(format!(
                    "revoked authorized_keys entry for {} (requestId {})",
                    request.user_name, request.request_id
                ))
            }
        }
    }

    // -- provisionSudo ----------------------------------------------------

    fn provision_sudo(
        &self,
        request: &ProvisioningRequest,
        action: Action,
    ) -> Result<String, ProvisioningError> {
        let path = std::path::Path::new(SUDOERS_P0_PATH);

        match action {
            Action::Grant => {
                if !request.sudo {
                    return Ok("sudo not requested, nothing to grant".to_string());
                }
                if let Some(note) = self.dry_run_note("grant passwordless sudo", request) {
                    return Ok(note);
                }

                let payload = format!("{} ALL=(ALL) NOPASSWD: ALL", request.user_name);
                FileMutator::ensure_tagged_block(path, &request.request_id, &payload, 0o440, None)?;
                FileMutator::ensure_line(std::path::Path::new(SUDOERS_PATH), SUDOERS_INCLUDE_LINE)?;
                Ok(format!(
                    "granted passwordless sudo to {} (requestId {})",
                    request.user_name, request.request_id
                ))
            }
            Action::Revoke => {
                if let Some(note) = self.dry_run_note("revoke sudo grant", request) {
                    return Ok(note);
                }
                FileMutator::remove_tagged_block(path, &request.request_id)?;
                Ok(format!(
                    "revoked sudo grant for {} (requestId {})",
                    request.user_name, request.request_id
                ))
            }
        }
    }

    // -- provisionSession --------------------------------------------------

    fn provision_session(
        &self,
        request: &ProvisioningRequest,
        action: Action,
    ) -> Result<String, ProvisioningError> {
        if action == Action::Grant {
            return Err(ProvisioningError::SessionGrantUnsupported);
        }

        if let Some(note) = self.dry_run_note("terminate SSH sessions", request) {
            return Ok(note);
        }

        let pids = matching_sshd_pids(&request.user_name);
        if pids.is_empty() {
            return Ok("No active SSH connections for this user".to_string());
        }

        let mut killed = 0usize;
        for pid in &pids {
            if terminate_pid(*pid, self.executor.as_ref()) {
                killed += 1;
            } else {
                warn!(pid = %pid, user = %request.user_name, "failed to terminate SSH session");
            }
        }

        if killed == pids.len() {
            Ok(format!(
                "terminated {killed} active SSH session(s) for {}",
                request.user_name
            ))
        } else {
            Err(ProvisioningError::Execution(format!(
                "killed {killed} of {} SSH session(s) for {}",
                pids.len(),
                request.user_name
            )))
        }
    }
}

fn normalized_public_key(key: &Option<String>) -> Option<String> {
    match key {
        Some(k) if !k.trim().is_empty() && k.trim() != "N/A" => Some(k.trim().to_string()),
        _ => None,
    }
}

fn authorized_keys_path(user: &str) -> std::path::PathBuf {
    home_dir(user).join(".ssh").join("authorized_keys")
}

fn home_dir(user: &str) -> std::path::PathBuf {
    nix::unistd::User::from_name(user)
        .ok()
        .flatten()
        .map(|u| u.dir)
        .unwrap_or_else(|| std::path::PathBuf::from(format!("/home/{user}")))
}

fn user_exists(name: &str) -> bool {
    nix::unistd::User::from_name(name).ok().flatten().is_some()
}

fn next_free_uid() -> Result<u32, ProvisioningError> {
    for uid in UID_RANGE_START..=UID_RANGE_END {
        if nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()
            .is_none()
        {
            return Ok(uid);
        }
    }
    Err(ProvisioningError::UidExhausted)
}

/// Enumerates live processes for `sshd: <user>@...` lines, mirroring what
/// `ps` would show for an established SSH session owned by `user`.
fn matching_sshd_pids(user: &str) -> Vec<Pid> {
    let mut system = System::new_all();
    system.refresh_all();

    let needle = format!("{user}@");
    system
        .processes()
        .iter()
        .filter(|(_, process)| {
            let cmd = process
                .cmd()
                .iter()
                .map(|s| s.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");
            let name = process.name().to_string_lossy();
            (cmd.contains("sshd:") || name.contains("sshd")) && cmd.contains(&needle)
        })
        .map(|(pid, _)| *pid)
        .collect()
}

/// SIGTERM first; SIGKILL if the process survives the grace period.
fn terminate_pid(pid: Pid, _executor: &dyn PrivilegedExecutor) -> bool {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;

    let nix_pid = NixPid::from_raw(pid.as_u32() as i32);
    if signal::kill(nix_pid, Signal::SIGTERM).is_err() {
        return signal::kill(nix_pid, Signal::SIGKILL).is_ok();
    }

    std::thread::sleep(std::time::Duration::from_millis(200));
    if signal::kill(nix_pid, None::<Signal>).is_err() {
        // Process is gone: SIGTERM succeeded.
        return true;
    }
    signal::kill(nix_pid, Signal::SIGKILL).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use executor::mock::MockExecutor;
    use os_adaptor::GenericLinux;

    fn engine(dry_run: bool) -> Arc<ProvisioningEngine> {
        ProvisioningEngine::new(
            "org1:host1:ssh".to_string(),
            dry_run,
            Arc::new(MockExecutor::new().with_existing("useradd")),
            Arc::new(GenericLinux),
        )
    }

    fn request(command: &str, user: &str, action: &str) -> ProvisioningRequest {
        ProvisioningRequest {
            user_name: user.to_string(),
            action: action.to_string(),
            request_id: "r1".to_string(),
            public_key: None,
            sudo: false,
            command: command.to_string(),
        }
    }

    #[test]
    fn invalid_username_blocks_every_command() {
        let engine = engine(false);
        let req = request("provisionUser", "Alice", "grant");
        let result = engine.dispatch(&req);
        assert!(!result.success);
        assert!(result.error.unwrap().contains("userName"));
    }

    #[test]
    fn session_grant_is_rejected() {
        let engine = engine(false);
        let req = request("provisionSession", "carol", "grant");
        let result = engine.dispatch(&req);
        assert!(!result.success);
    }

    #[test]
    fn session_revoke_with_no_matches_reports_no_active_connections() {
        let engine = engine(false);
        let req = request("provisionSession", "carol-no-such-session", "revoke");
        let result = engine.dispatch(&req);
        assert!(result.success);
        assert!(result
            .message
            .unwrap()
            .contains("No active SSH connections"));
    }

    #[test]
    fn dry_run_never_mutates_and_prefixes_message() {
        let engine = engine(true);
        let req = ProvisioningRequest {
            public_key: Some("ssh-ed25519 AAAA".into()),
            ..request("provisionAuthorizedKeys", "zdryrun", "grant")
        };
        let result = engine.dispatch(&req);
        assert!(result.success);
        assert!(result.message.unwrap().starts_with("DRY-RUN:"));
        assert!(!authorized_keys_path("zdryrun").exists());
    }
}
