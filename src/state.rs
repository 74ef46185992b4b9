//! Instance state that survives restarts, and the single-instance lock.
use crate::error::{Result, RotationError};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Field order is alphabetical so the JSON keys come out sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pid: Option<u32>,
    #[serde(default)]
    pub last_sa: String,
}

pub trait InstanceStateStore: Send + Sync {
    fn load(&self) -> Result<InstanceState>;
    fn save(&self, state: &InstanceState) -> Result<()>;
}

/// JSON file store, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state_error(&self, reason: impl ToString) -> RotationError {
        RotationError::State {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

impl InstanceStateStore for JsonStateStore {
    fn load(&self) -> Result<InstanceState> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(InstanceState::default())
            }
            Err(e) => return Err(self.state_error(e)),
        };
        info!("Instance config {:?} exists, loading it", self.path);
        match serde_json::from_str(&raw) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(
                    "Ignoring unreadable instance config {:?}: {}",
                    self.path, e
                );
                Ok(InstanceState::default())
            }
        }
    }

    fn save(&self, state: &InstanceState) -> Result<()> {
        let body = serde_json::to_vec(state).map_err(|e| self.state_error(e))?;
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| self.state_error(e))?;
        tmp.write_all(&body).map_err(|e| self.state_error(e))?;
        tmp.persist(&self.path)
            .map_err(|e| self.state_error(e.error))?;
        Ok(())
    }
}

pub trait ProcessLock: Send {
    /// Non-blocking. `Ok(false)` when another holder has it.
    fn try_acquire(&mut self) -> Result<bool>;
    fn release(&mut self);
}

/// Exclusive `flock` on a lock file, released on drop.
#[cfg(unix)]
pub struct FileLock {
    path: PathBuf,
    held: Option<nix::fcntl::Flock<File>>,
}

#[cfg(unix)]
impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
impl ProcessLock for FileLock {
    fn try_acquire(&mut self) -> Result<bool> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};
        use std::os::unix::fs::OpenOptionsExt;

        if self.held.is_some() {
            return Ok(true);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&self.path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                self.held = Some(lock);
                Ok(true)
            }
            Err((_file, Errno::EWOULDBLOCK)) => Ok(false),
            Err((_file, e)) => Err(RotationError::LockHeld {
                path: self.path.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn release(&mut self) {
        if let Some(lock) = self.held.take() {
            if let Err((_, e)) = lock.unlock() {
                warn!("Failed to unlock {:?}: {}", self.path, e);
            }
        }
    }
}
