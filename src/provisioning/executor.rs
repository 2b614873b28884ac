//! Injectable privilege-escalation capability (spec.md §9
//! "privilege escalation by shelling out becomes an injectable
//! `PrivilegedExecutor`"). Production binds it straight to
//! `std::process::Command` — the agent already runs as root — so there is
//! no literal `sudo` prefix to inject; tests bind it to a recorder that
//! never touches the real host.

use std::process::{Command, Output};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {code}: {stderr}")]
    NonZeroExit {
        program: String,
        code: i32,
        stderr: String,
    },
}

/// Runs host-mutating commands (`useradd`, `chown`, ...) behind a seam so
/// tests can assert on intended mutations instead of performing them.
pub trait PrivilegedExecutor: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<Output, ExecError>;

    /// Convenience wrapper that also maps a non-zero exit into an error.
    fn run_checked(&self, program: &str, args: &[&str]) -> Result<(), ExecError> {
        let output = self.run(program, args)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ExecError::NonZeroExit {
                program: program.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Whether `program` can be found on `PATH` at all, used to decide
    /// between `useradd` and the `adduser` fallback.
    fn command_exists(&self, program: &str) -> bool {
        self.run("sh", &["-c", &format!("command -v {program}")])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }
}

/// Production executor: runs commands directly. The agent is already
/// root-privileged, so no escalation prefix is needed.
pub struct SystemExecutor;

impl PrivilegedExecutor for SystemExecutor {
    fn run(&self, program: &str, args: &[&str]) -> Result<Output, ExecError> {
        Command::new(program)
            .args(args)
            .output()
            .map_err(|source| ExecError::Spawn {
                program: program.to_string(),
                source,
            })
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::Mutex;

    /// Records every invocation instead of running it; tests configure a
    /// canned response per program name.
    pub struct MockExecutor {
        pub calls: Mutex<Vec<(String, Vec<String>)>>,
        pub exists: Vec<String>,
    }

    impl MockExecutor {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                exists: Vec::new(),
            }
        }

        pub fn with_existing(mut self, program: &str) -> Self {
            self.exists.push(program.to_string());
            self
        }

        pub fn calls(&self) -> Vec<(String, Vec<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl PrivilegedExecutor for MockExecutor {
        fn run(&self, program: &str, args: &[&str]) -> Result<Output, ExecError> {
            self.calls.lock().unwrap().push((
                program.to_string(),
                args.iter().map(|s| s.to_string()).collect(),
            ));
            Ok(Output {
                status: ExitStatus::from_raw(0),
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }

        fn command_exists(&self, program: &str) -> bool {
            self.exists.iter().any(|p| p == program)
        }
    }
}
