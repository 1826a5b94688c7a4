//! SF-013: State store with atomic saves and a single-writer lease.
//!
//! The executor only talks to [`StateStore`]. [`FileStateStore`] keeps
//! `state.yaml` and `state.lease` in a state directory;
//! [`MemoryStateStore`] backs tests and embedding.

use super::error::{Error, Result};
use super::types::StateFile;
use crate::tripwire::eventlog::now_iso8601;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Who holds the lease, as written to the lease file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: String,
    pub pid: u32,
    pub acquired_at: String,
}

impl LeaseRecord {
    fn new(holder: &str) -> Self {
        Self {
            holder: holder.to_string(),
            pid: std::process::id(),
            acquired_at: now_iso8601(),
        }
    }
}

/// An exclusive claim on a state store. Released on drop.
pub struct Lease {
    record: LeaseRecord,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Lease {
    pub fn holder(&self) -> &str {
        &self.record.holder
    }

    pub fn record(&self) -> &LeaseRecord {
        &self.record
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("record", &self.record).finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            tracing::debug!(holder = %self.record.holder, "lease released");
        }
    }
}

/// Persistent mapping of resource ID to state, guarded by a lease.
pub trait StateStore: Send + Sync {
    /// Current state; an empty state if nothing was ever saved.
    fn load(&self) -> Result<StateFile>;

    /// Replace the stored state.
    fn save(&self, state: &StateFile) -> Result<()>;

    /// Claim the single-writer lease, failing with `LockHeld` if taken.
    fn acquire_lease(&self, holder: &str) -> Result<Lease>;

    /// Where the state lives, for messages.
    fn location(&self) -> String;
}

/// Create a new empty state.
pub fn new_state() -> StateFile {
    StateFile {
        schema: "1.0".to_string(),
        generated_at: now_iso8601(),
        generator: format!("siteform {}", env!("CARGO_PKG_VERSION")),
        resources: indexmap::IndexMap::new(),
    }
}

/// Default lease holder name for this process.
pub fn default_holder() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    format!("{}@pid{}", user, std::process::id())
}

// ============================================================================
// File store
// ============================================================================

/// State persisted as YAML in a directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn state_path(&self) -> PathBuf {
        state_file_path(&self.dir)
    }

    pub fn lease_path(&self) -> PathBuf {
        lease_file_path(&self.dir)
    }

    fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| Error::state(&self.dir, e))
    }
}

/// Derive the state file path within a state directory.
pub fn state_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join("state.yaml")
}

/// Derive the lease file path within a state directory.
pub fn lease_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join("state.lease")
}

/// Read the current lease holder, if any.
pub fn read_lease(state_dir: &Path) -> Result<Option<LeaseRecord>> {
    let path = lease_file_path(state_dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).map_err(|e| Error::state(&path, e))?;
    let record = serde_yaml_ng::from_str(&content)
        .map_err(|e| Error::state(&path, format!("invalid lease file: {}", e)))?;
    Ok(Some(record))
}

/// Remove a lease left behind by a crashed run. Returns whether one existed.
pub fn force_unlock(state_dir: &Path) -> Result<bool> {
    let path = lease_file_path(state_dir);
    match std::fs::remove_file(&path) {
        Ok(()) => {
            tracing::warn!(path = %path.display(), "lease forcibly removed");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::state(&path, e)),
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<StateFile> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(new_state());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| Error::state(&path, e))?;
        serde_yaml_ng::from_str(&content)
            .map_err(|e| Error::state(&path, format!("invalid state file: {}", e)))
    }

    fn save(&self, state: &StateFile) -> Result<()> {
        self.ensure_dir()?;
        let path = self.state_path();
        let yaml = serde_yaml_ng::to_string(state)
            .map_err(|e| Error::state(&path, format!("serialize error: {}", e)))?;

        // Atomic write: temp file + rename
        let tmp_path = path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, &yaml).map_err(|e| Error::state(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &path).map_err(|e| Error::state(&path, e))?;
        Ok(())
    }

    fn acquire_lease(&self, holder: &str) -> Result<Lease> {
        self.ensure_dir()?;
        let path = self.lease_path();
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let current = read_lease(&self.dir).ok().flatten();
                return Err(Error::LockHeld {
                    holder: current
                        .as_ref()
                        .map(|r| r.holder.clone())
                        .unwrap_or_else(|| "unknown".to_string()),
                    acquired_at: current
                        .map(|r| r.acquired_at)
                        .unwrap_or_else(|| "unknown".to_string()),
                    path,
                });
            }
            Err(e) => return Err(Error::state(&path, e)),
        };

        let record = LeaseRecord::new(holder);
        let yaml = serde_yaml_ng::to_string(&record)
            .map_err(|e| Error::state(&path, format!("serialize error: {}", e)))?;
        if let Err(e) = file.write_all(yaml.as_bytes()) {
            let _ = std::fs::remove_file(&path);
            return Err(Error::state(&path, e));
        }
        tracing::debug!(holder, path = %path.display(), "lease acquired");

        let release_path = path.clone();
        Ok(Lease {
            record,
            release: Some(Box::new(move || {
                if let Err(e) = std::fs::remove_file(&release_path) {
                    tracing::warn!(path = %release_path.display(), error = %e, "cannot remove lease file");
                }
            })),
        })
    }

    fn location(&self) -> String {
        self.state_path().display().to_string()
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    state: Option<StateFile>,
    lease: Option<LeaseRecord>,
    saves: usize,
}

/// State kept in process memory. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.lock().saves
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<StateFile> {
        Ok(self.lock().state.clone().unwrap_or_else(new_state))
    }

    fn save(&self, state: &StateFile) -> Result<()> {
        let mut inner = self.lock();
        inner.state = Some(state.clone());
        inner.saves += 1;
        Ok(())
    }

    fn acquire_lease(&self, holder: &str) -> Result<Lease> {
        let mut inner = self.lock();
        if let Some(current) = &inner.lease {
            return Err(Error::LockHeld {
                holder: current.holder.clone(),
                acquired_at: current.acquired_at.clone(),
                path: PathBuf::from(self.location()),
            });
        }
        let record = LeaseRecord::new(holder);
        inner.lease = Some(record.clone());

        let shared = Arc::clone(&self.inner);
        Ok(Lease {
            record,
            release: Some(Box::new(move || {
                shared.lock().unwrap_or_else(PoisonError::into_inner).lease = None;
            })),
        })
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
