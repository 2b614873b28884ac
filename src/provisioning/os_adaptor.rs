//! OS-specific pieces of `provisionUser`: which shell a freshly created
//! account gets, and how to invoke user creation. Spec.md §9 calls this
//! out as a seam — "no global plugin registry... an interface passed to
//! the ProvisioningEngine at construction" — so it is a trait object the
//! CLI picks once at startup, not a runtime-dispatched enum sprinkled
//! through the engine.

use std::sync::Arc;

use super::executor::PrivilegedExecutor;
use super::ProvisioningError;

/// Distro-specific knobs for account creation. Variants named directly in
/// spec.md §4.6 / §9: `Generic` (useradd/adduser-based distros) and
/// `Nix-managed host` (binaries live under the Nix store).
pub trait OsAdaptor: Send + Sync {
    /// Login shell assigned to newly created JIT users.
    fn shell(&self) -> &'static str;

    /// Create `name`'s primary group. A pre-existing group of the same
    /// name is treated as success (idempotent alongside user creation).
    fn create_group(&self, executor: &dyn PrivilegedExecutor, name: &str) -> Result<(), ProvisioningError>;

    /// Create the user account with the given uid, home directory, and
    /// [`OsAdaptor::shell`]. Tries `useradd` first, falling back to
    /// `adduser` when `useradd` isn't on `PATH` (spec.md §4.6).
    fn create_user(
        &self,
        executor: &dyn PrivilegedExecutor,
        name: &str,
        uid: u32,
    ) -> Result<(), ProvisioningError>;
}

fn map_exec_err(action: &str, e: super::executor::ExecError) -> ProvisioningError {
    ProvisioningError::Execution(format!("{action}: {e}"))
}

/// Generic systemd/sysvinit Linux distro: standard `/bin/bash`,
/// `useradd`/`groupadd`/`adduser` from shadow-utils.
pub struct GenericLinux;

impl OsAdaptor for GenericLinux {
    fn shell(&self) -> &'static str {
        "/bin/bash"
    }

    fn create_group(&self, executor: &dyn PrivilegedExecutor, name: &str) -> Result<(), ProvisioningError> {
        match executor.run_checked("groupadd", &[name]) {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("already exists") => Ok(()),
            Err(e) => Err(map_exec_err("groupadd", e)),
        }
    }

    fn create_user(
        &self,
        executor: &dyn PrivilegedExecutor,
        name: &str,
        uid: u32,
    ) -> Result<(), ProvisioningError> {
        let uid_str = uid.to_string();
        if executor.command_exists("useradd") {
            executor
                .run_checked(
                    "useradd",
                    &[
                        "-u",
                        &uid_str,
                        "-g",
                        name,
                        "-m",
                        "-s",
                        self.shell(),
                        name,
                    ],
                )
                .map_err(|e| map_exec_err("useradd", e))
        } else {
            executor
                .run_checked(
                    "adduser",
                    &[
                        "--uid",
                        &uid_str,
                        "--ingroup",
                        name,
                        "--home",
                        &format!("/home/{name}"),
                        "--shell",
                        self.shell(),
                        "--disabled-password",
                        "--gecos",
                        "",
                        name,
                    ],
                )
                .map_err(|e| map_exec_err("adduser", e))
        }
    }
}

/// NixOS host: binaries resolve through the Nix store wrapper path
/// instead of the FHS locations `GenericLinux` assumes.
pub struct NixManaged;

impl OsAdaptor for NixManaged {
    fn shell(&self) -> &'static str {
        "/run/current-system/sw/bin/bash"
    }

    fn create_group(&self, executor: &dyn PrivilegedExecutor, name: &str) -> Result<(), ProvisioningError> {
        match executor.run_checked("groupadd", &[name]) {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("already exists") => Ok(()),
            Err(e) => Err(map_exec_err("groupadd", e)),
        }
    }

    fn create_user(
        &self,
        executor: &dyn PrivilegedExecutor,
        name: &str,
        uid: u32,
    ) -> Result<(), ProvisioningError> {
        let uid_str = uid.to_string();
        executor
            .run_checked(
                "useradd",
                &["-u", &uid_str, "-g", name, "-m", "-s", self.shell(), name],
            )
            .map_err(|e| map_exec_err("useradd", e))
    }
}

/// Marker file present on every NixOS install; absent everywhere else.
/// The same probe NixOS-aware tooling (e.g. `nixos-rebuild`) uses to
/// detect whether it's running on a Nix-managed host.
const NIXOS_MARKER: &str = "/etc/NIXOS";

/// Picks the [`OsAdaptor`] by a cheap filesystem probe rather than a
/// `--os-adaptor` flag, so a host's identity doesn't drift out of sync
/// with a config value someone forgot to flip after an OS migration.
pub fn detect() -> Arc<dyn OsAdaptor> {
    if std::path::Path::new(NIXOS_MARKER).exists() {
        Arc::new(NixManaged)
    } else {
        Arc::new(GenericLinux)
    }
}
