//! Tagged-block primitives: the system's only persistence idiom for
//! mutations (spec.md §4.7/§9). Preserved exactly so already-deployed
//! agents stay compatible — two lines, a `# RequestID: <id>` comment and
//! its payload, appended once and removed as a unit.
//!
//! No direct corpus analogue exists for sudoers/authorized_keys mutation
//! (spec.md's own §4 implementation notes say so); this is `std::fs` +
//! `regex` for the scan/remove primitives, serialized per path with a
//! small in-process lock registry, plus the injectable
//! [`PrivilegedExecutor`] for the one external-command step (chown).

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;
use thiserror::Error;

use super::executor::{ExecError, PrivilegedExecutor};

#[derive(Debug, Error)]
pub enum FileMutateError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create parent directory for {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to chown {path}: {source}")]
    Chown {
        path: String,
        #[source]
        source: ExecError,
    },
}

fn lock_registry() -> &'static Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Per-path lock so two concurrent mutations of the same file never
/// interleave within this process (spec.md §4.7 invariant). Cross-process
/// safety relies on this agent being the sole writer of tagged blocks.
fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    let mut map = lock_registry().lock().expect("file-lock registry poisoned");
    map.entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

fn comment_line(request_id: &str) -> String {
    format!("# RequestID: {request_id}")
}

/// Append-only, idempotent text-file mutator for the tagged-block
/// convention. Every primitive is synchronous (`std::fs`); callers invoke
/// it from async code via `spawn_blocking`.
pub struct FileMutator;

impl FileMutator {
    /// Ensures `path` contains a `# RequestID: <id>` block whose payload is
    /// exactly `payload`. A no-op (no write) when the block is already
    /// present with the identical payload; invariant from spec.md §3:
    /// two blocks sharing a `requestId` must have identical payloads.
    pub fn ensure_tagged_block(
        path: &Path,
        request_id: &str,
        payload: &str,
        mode: u32,
        owner: Option<(&str, &dyn PrivilegedExecutor)>,
    ) -> Result<(), FileMutateError> {
        let lock = lock_for(path);
        let _guard = lock.lock().expect("file lock poisoned");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| FileMutateError::CreateParent {
                path: path.display().to_string(),
                source,
            })?;
        }

        let existing = fs::read_to_string(path).unwrap_or_default();
        let comment = comment_line(request_id);
        if block_matches(&existing, &comment, payload) {
            return Ok(());
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| FileMutateError::Write {
                path: path.display().to_string(),
                source,
            })?;
        writeln!(file, "{comment}\n{payload}").map_err(|source| FileMutateError::Write {
            path: path.display().to_string(),
            source,
        })?;
        drop(file);

        set_mode(path, mode).map_err(|source| FileMutateError::Write {
            path: path.display().to_string(),
            source,
        })?;

        if let Some((user, executor)) = owner {
            if let Some(dir) = path.parent() {
                executor
                    .run_checked("chown", &["-R", &format!("{user}:{user}"), &dir.display().to_string()])
                    .map_err(|source| FileMutateError::Chown {
                        path: dir.display().to_string(),
                        source,
                    })?;
            }
        }

        Ok(())
    }

    /// No-op if `path` doesn't exist. Otherwise deletes every line from
    /// the `# RequestID: <id>` comment through the next blank line.
    pub fn remove_tagged_block(path: &Path, request_id: &str) -> Result<(), FileMutateError> {
        let lock = lock_for(path);
        let _guard = lock.lock().expect("file lock poisoned");

        let Ok(content) = fs::read_to_string(path) else {
            return Ok(());
        };

        let pattern = Regex::new(&format!("^# RequestID: {}$", regex::escape(request_id)))
            .expect("comment pattern is always valid regex");

        let mut out = String::with_capacity(content.len());
        let mut in_block = false;
        for line in content.lines() {
            if in_block {
                // Blank line or the start of the next tagged block both
                // terminate the deletion range (sed `/start/,/^$/` stops
                // at a blank line; blocks appended back-to-back with no
                // separating blank line are bounded by the next comment
                // instead, so an unrelated block never gets swallowed).
                if line.trim().is_empty() {
                    in_block = false;
                    continue;
                }
                if line.starts_with("# RequestID: ") {
                    in_block = false;
                } else {
                    continue;
                }
            }
            if pattern.is_match(line) {
                in_block = true;
                continue;
            }
            out.push_str(line);
            out.push('\n');
        }

        fs::write(path, out).map_err(|source| FileMutateError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    /// Appends `line` if it isn't already present verbatim.
    pub fn ensure_line(path: &Path, line: &str) -> Result<(), FileMutateError> {
        let lock = lock_for(path);
        let _guard = lock.lock().expect("file lock poisoned");

        let existing = fs::read_to_string(path).unwrap_or_default();
        if existing.lines().any(|l| l == line) {
            return Ok(());
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| FileMutateError::Write {
                path: path.display().to_string(),
                source,
            })?;
        writeln!(file, "{line}").map_err(|source| FileMutateError::Write {
            path: path.display().to_string(),
            source,
        })
    }
}

fn block_matches(content: &str, comment: &str, payload: &str) -> bool {
    let mut lines = content.lines();
    while let Some(line) = lines.next() {
        if line == comment {
            return lines.next() == Some(payload);
        }
    }
    false
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_then_revoke_restores_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        fs::write(&path, "").unwrap();

        FileMutator::ensure_tagged_block(&path, "r1", "ssh-ed25519 AAAA...", 0o600, None).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "# RequestID: r1\nssh-ed25519 AAAA...\n"
        );

        FileMutator::remove_tagged_block(&path, "r1").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn double_grant_with_identical_payload_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sudoers-p0");

        FileMutator::ensure_tagged_block(&path, "r2", "bob ALL=(ALL) NOPASSWD: ALL", 0o440, None)
            .unwrap();
        let first = fs::read_to_string(&path).unwrap();

        FileMutator::ensure_tagged_block(&path, "r2", "bob ALL=(ALL) NOPASSWD: ALL", 0o440, None)
            .unwrap();
        let second = fs::read_to_string(&path).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.matches("# RequestID: r2").count(), 1);
    }

    #[test]
    fn ensure_line_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sudoers");
        fs::write(&path, "Defaults env_reset\n").unwrap();

        FileMutator::ensure_line(&path, "#include sudoers-p0").unwrap();
        FileMutator::ensure_line(&path, "#include sudoers-p0").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("#include sudoers-p0").count(), 1);
    }

    #[test]
    fn remove_on_missing_file_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist");
        assert!(FileMutator::remove_tagged_block(&path, "r1").is_ok());
    }

    #[test]
    fn remove_only_deletes_matching_request_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        fs::write(&path, "# RequestID: r1\nkey-one\n\n# RequestID: r2\nkey-two\n").unwrap();

        FileMutator::remove_tagged_block(&path, "r1").unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "# RequestID: r2\nkey-two\n"
        );
    }
}
