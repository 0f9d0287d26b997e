//! Persisted baseline - the last successfully processed snapshot
//!
//! The driver loads the state before a cycle and replaces it as a whole
//! afterwards; it is never mutated in place.

use crate::error::{CollectorError, Result, StateError};
use crate::record::Snapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Versioned last known state. Version 0 is the empty first-run baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u64,
    pub saved_at: DateTime<Utc>,
    pub snapshot: Snapshot,
}

impl PersistedState {
    pub fn initial() -> Self {
        Self {
            version: 0,
            saved_at: DateTime::<Utc>::UNIX_EPOCH,
            snapshot: Snapshot::empty(),
        }
    }

    /// The state that supersedes `self` once `snapshot` has been processed.
    pub fn succeed(&self, snapshot: Snapshot) -> Self {
        Self {
            version: self.version + 1,
            saved_at: Utc::now(),
            snapshot,
        }
    }
}

/// State capability.
pub trait StateStore: Send + Sync {
    /// `None` when no cycle has completed yet.
    fn load(&self) -> std::result::Result<Option<PersistedState>, StateError>;

    /// Atomically supersede the stored state.
    fn replace(&self, state: &PersistedState) -> std::result::Result<(), StateError>;
}

/// JSON side file, replaced via write-to-temp + fsync + rename.
pub struct JsonStateFile {
    path: PathBuf,
}

impl JsonStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

impl StateStore for JsonStateFile {
    fn load(&self) -> std::result::Result<Option<PersistedState>, StateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("State file {} not found, starting from empty baseline", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(StateError::Load(format!("{}: {}", self.path.display(), e))),
        };

        let state: PersistedState = serde_json::from_str(&content)
            .map_err(|e| StateError::Load(format!("Failed to parse {}: {}", self.path.display(), e)))?;
        debug!(
            "Loaded state v{} with {} records",
            state.version,
            state.snapshot.len()
        );
        Ok(Some(state))
    }

    fn replace(&self, state: &PersistedState) -> std::result::Result<(), StateError> {
        let failure = |e: std::io::Error| StateError::Replace(format!("{}: {}", self.path.display(), e));

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(failure)?;
            }
        }

        let json = serde_json::to_vec(state)
            .map_err(|e| StateError::Replace(format!("Failed to serialize state: {}", e)))?;

        let tmp_path = self.tmp_path();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(failure)?;
        file.write_all(&json).map_err(failure)?;
        file.sync_all().map_err(failure)?;
        fs::rename(&tmp_path, &self.path).map_err(failure)?;

        info!("Baseline replaced with state v{}", state.version);
        Ok(())
    }
}

/// Exclusive advisory lock (`flock`) preventing overlapping cycles on the same
/// state. The OS releases it when the holder exits or is killed, so a lock
/// file left on disk never blocks later cycles by itself.
#[derive(Debug)]
pub struct CycleLock {
    path: PathBuf,
    _file: File,
}

impl CycleLock {
    /// `Ok(None)` when another cycle holds the lock.
    pub fn try_acquire(path: impl Into<PathBuf>) -> Result<Option<Self>> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_error = |e: std::io::Error| CollectorError::Lock(format!("{}: {}", path.display(), e));

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(lock_error)?;

        if !try_lock_exclusive(&file).map_err(lock_error)? {
            return Ok(None);
        }

        // Holder pid, informational only.
        file.set_len(0).map_err(lock_error)?;
        writeln!(file, "{}", std::process::id()).map_err(lock_error)?;
        debug!("Acquired cycle lock {}", path.display());
        Ok(Some(Self { path, _file: file }))
    }

    /// Lock file path used for a given state file.
    pub fn path_for(state_path: &Path) -> PathBuf {
        let mut lock = state_path.as_os_str().to_os_string();
        lock.push(".lock");
        PathBuf::from(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Non-blocking `flock(LOCK_EX)`. `Ok(false)` when another open file holds it.
#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> std::io::Result<bool> {
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CanonicalRecord, IdentityKey};
    use tempfile::TempDir;

    fn state_with(records: usize) -> PersistedState {
        let records = (0..records)
            .map(|i| {
                CanonicalRecord::new(IdentityKey::new([format!("2021-03-{:02}", i + 1)]))
                    .with_value("Fallzahl", i as i64)
            })
            .collect();
        PersistedState::initial().succeed(Snapshot::new(Utc::now(), records))
    }

    #[test]
    fn test_missing_file_loads_as_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonStateFile::new(temp_dir.path().join("cached_state.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_replace_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonStateFile::new(temp_dir.path().join("state").join("cached_state.json"));
        let state = state_with(3);

        store.replace(&state).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.version, 1);
        assert!(!store.tmp_path().exists());
    }

    #[test]
    fn test_replace_supersedes() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonStateFile::new(temp_dir.path().join("cached_state.json"));
        let first = state_with(3);
        let second = first.succeed(Snapshot::new(Utc::now(), Vec::new()));

        store.replace(&first).unwrap();
        store.replace(&second).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert!(loaded.snapshot.is_empty());
    }

    #[test]
    fn test_corrupt_state_is_a_load_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cached_state.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(JsonStateFile::new(path).load(), Err(StateError::Load(_))));
    }

    #[test]
    fn test_cycle_lock_is_exclusive() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = CycleLock::path_for(&temp_dir.path().join("cached_state.json"));

        let held = CycleLock::try_acquire(&lock_path).unwrap();
        assert!(held.is_some());
        assert!(CycleLock::try_acquire(&lock_path).unwrap().is_none());

        drop(held);
        assert!(CycleLock::try_acquire(&lock_path).unwrap().is_some());
    }

    #[test]
    fn test_lock_file_left_by_dead_process_is_reclaimed() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = CycleLock::path_for(&temp_dir.path().join("cached_state.json"));
        // A killed cycle leaves its file behind, but no process holds the lock.
        fs::write(&lock_path, "4242\n").unwrap();

        let lock = CycleLock::try_acquire(&lock_path).unwrap().unwrap();
        assert_eq!(lock.path(), lock_path.as_path());
        let pid = fs::read_to_string(&lock_path).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());
    }
}
