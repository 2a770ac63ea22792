//! Backing stores for the active-invocation registry

use super::lock::{lock_path_for, LockMode, RegistryLock};
use super::RegistryState;
use crate::config::RegistryConfig;
use crate::error::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Shared state behind the registry.
///
/// Implementations must make [`RegistryStore::modify`] atomic with respect to
/// every other caller on the same store: the read, the closure and the write
/// happen under one exclusive hold.
pub trait RegistryStore: Send + Sync {
    /// Snapshot of the current state.
    fn load(&self) -> Result<RegistryState>;

    /// Read-modify-write cycle. `apply` returns whether it changed anything;
    /// the state is only written back when it did. Returns that flag.
    fn modify(&self, apply: &mut dyn FnMut(&mut RegistryState) -> bool) -> Result<bool>;
}

/// JSON document on disk, guarded by a sidecar advisory lock.
#[derive(Debug, Clone)]
pub struct FileRegistryStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    lock_retry: Duration,
}

impl FileRegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let defaults = RegistryConfig::default();
        Self {
            lock_path: lock_path_for(&path),
            path,
            lock_timeout: Duration::from_millis(defaults.lock_timeout_ms),
            lock_retry: Duration::from_millis(defaults.lock_retry_ms),
        }
    }

    pub fn with_lock_timing(mut self, timeout: Duration, retry: Duration) -> Self {
        self.lock_timeout = timeout;
        self.lock_retry = retry;
        self
    }

    pub fn from_config(path: impl Into<PathBuf>, config: &RegistryConfig) -> Self {
        Self::new(path).with_lock_timing(
            Duration::from_millis(config.lock_timeout_ms),
            Duration::from_millis(config.lock_retry_ms),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self, mode: LockMode) -> Result<RegistryLock> {
        RegistryLock::acquire(&self.lock_path, mode, self.lock_timeout, self.lock_retry)
    }

    /// Read the document; missing or empty means empty state. A corrupt
    /// document is logged and treated as empty so the next write repairs it.
    fn read_state(&self) -> Result<RegistryState> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistryState::default())
            }
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(RegistryState::default());
        }
        match serde_json::from_str(&content) {
            Ok(state) => Ok(state),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Registry state is corrupt, starting from empty state"
                );
                Ok(RegistryState::default())
            }
        }
    }

    /// Write via temp file + rename so readers never observe a partial document.
    fn write_state(&self, state: &RegistryState) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        tmp_name.push(format!(".{}.tmp", std::process::id()));
        let tmp_path = self.path.with_file_name(tmp_name);

        let json = serde_json::to_vec_pretty(state)?;
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl RegistryStore for FileRegistryStore {
    fn load(&self) -> Result<RegistryState> {
        let _lock = self.lock(LockMode::Shared)?;
        self.read_state()
    }

    fn modify(&self, apply: &mut dyn FnMut(&mut RegistryState) -> bool) -> Result<bool> {
        let _lock = self.lock(LockMode::Exclusive)?;
        let mut state = self.read_state()?;
        let changed = apply(&mut state);
        if changed {
            self.write_state(&state)?;
        }
        Ok(changed)
    }
}

/// In-process store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryRegistryStore {
    state: Mutex<RegistryState>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: RegistryState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> RegistryState {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl RegistryStore for MemoryRegistryStore {
    fn load(&self) -> Result<RegistryState> {
        Ok(self.snapshot())
    }

    fn modify(&self, apply: &mut dyn FnMut(&mut RegistryState) -> bool) -> Result<bool> {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(apply(&mut *guard))
    }
}

impl<T: RegistryStore + ?Sized> RegistryStore for std::sync::Arc<T> {
    fn load(&self) -> Result<RegistryState> {
        (**self).load()
    }

    fn modify(&self, apply: &mut dyn FnMut(&mut RegistryState) -> bool) -> Result<bool> {
        (**self).modify(apply)
    }
}
