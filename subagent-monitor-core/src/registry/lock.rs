//! Advisory file lock guarding the registry state document
//!
//! The lock lives in a sidecar `<state>.lock` file so the state document itself
//! can be replaced by rename while the lock is held. The OS releases the lock
//! if the holding process dies.

use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct RegistryLock {
    file: File,
    mode: LockMode,
}

impl RegistryLock {
    /// Acquire the lock at `path`, retrying non-blocking attempts every
    /// `retry` until `timeout` has elapsed.
    pub fn acquire(path: &Path, mode: LockMode, timeout: Duration, retry: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let start = Instant::now();
        loop {
            // Fully qualified: newer std `File` has inherent methods of the same name.
            let attempt = match mode {
                LockMode::Shared => fs2::FileExt::try_lock_shared(&file),
                LockMode::Exclusive => fs2::FileExt::try_lock_exclusive(&file),
            };

            match attempt {
                Ok(()) => {
                    tracing::trace!(path = %path.display(), ?mode, "Acquired registry lock");
                    return Ok(Self { file, mode });
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    let waited = start.elapsed();
                    if waited >= timeout {
                        tracing::warn!(
                            path = %path.display(),
                            waited_ms = waited.as_millis() as u64,
                            "Timed out waiting for registry lock"
                        );
                        return Err(Error::LockTimeout {
                            path: path.to_path_buf(),
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(retry.min(timeout - waited));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Sidecar lock path for a state document: `<state>.lock`.
pub fn lock_path_for(state_path: &Path) -> PathBuf {
    let mut name = state_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    state_path.with_file_name(name)
}
