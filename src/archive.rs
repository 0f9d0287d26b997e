//! Archive & Change Logger - raw payload archive and JSON-lines change log

use crate::detector::{ChangeKind, Delta, FieldDiff};
use crate::error::ArchiveError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Archive capability: write-once storage of named blobs.
pub trait ArchiveStore: Send + Sync {
    fn store(&self, name: &str, bytes: &[u8]) -> Result<(), ArchiveError>;
}

/// Stores payloads as files in one directory. Existing files are never overwritten.
pub struct FsArchive {
    dir: PathBuf,
}

impl FsArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ArchiveStore for FsArchive {
    fn store(&self, name: &str, bytes: &[u8]) -> Result<(), ArchiveError> {
        let failure = |message: String| ArchiveError::Store {
            name: name.to_string(),
            message,
        };

        fs::create_dir_all(&self.dir).map_err(|e| failure(e.to_string()))?;
        let path = self.dir.join(name);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Archive {} already exists, skipping", path.display());
                return Ok(());
            }
            Err(e) => return Err(failure(e.to_string())),
        };

        file.write_all(bytes).map_err(|e| failure(e.to_string()))?;
        file.sync_all().map_err(|e| failure(e.to_string()))?;
        info!("Archived raw payload to {}", path.display());
        Ok(())
    }
}

/// Timestamped archive name, e.g. `dresden_official_20210301T120000.000Z.json`.
pub fn archive_name(series: &str, fetched_at: DateTime<Utc>) -> String {
    format!("{}_{}.json", series, fetched_at.format("%Y%m%dT%H%M%S%.3fZ"))
}

/// One line of the change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub run_id: String,
    pub logged_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub key: String,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diffs: Vec<FieldDiff>,
}

/// Appends New/Changed/Removed entries to a JSON-lines file and to the tracing log.
pub struct ChangeLogger {
    log_file: Option<PathBuf>,
}

impl ChangeLogger {
    pub fn new(log_file: Option<PathBuf>) -> Self {
        Self { log_file }
    }

    /// Build the log entries for a delta. Unchanged records are never logged.
    pub fn entries(run_id: &str, fetched_at: DateTime<Utc>, delta: &Delta) -> Vec<ChangeLogEntry> {
        let logged_at = Utc::now();
        delta
            .entries
            .iter()
            .filter(|e| e.kind != ChangeKind::Unchanged)
            .map(|e| ChangeLogEntry {
                run_id: run_id.to_string(),
                logged_at,
                fetched_at,
                key: e.key().to_string(),
                kind: e.kind,
                diffs: e.diffs.clone(),
            })
            .collect()
    }

    /// Log every change; returns the number of entries written.
    pub fn log_changes(
        &self,
        run_id: &str,
        fetched_at: DateTime<Utc>,
        delta: &Delta,
    ) -> Result<usize, ArchiveError> {
        let entries = Self::entries(run_id, fetched_at, delta);
        for entry in &entries {
            match entry.kind {
                ChangeKind::Changed => {
                    let diffs: Vec<String> = entry
                        .diffs
                        .iter()
                        .map(|d| format!("{}: {} -> {}", d.field, d.old, d.new))
                        .collect();
                    info!("changed {} [{}]", entry.key, diffs.join(", "));
                }
                kind => info!("{} {}", kind, entry.key),
            }
        }

        if entries.is_empty() {
            debug!("No changes to log");
            return Ok(0);
        }

        if let Some(ref log_file) = self.log_file {
            self.append(log_file, &entries)?;
        }
        Ok(entries.len())
    }

    fn append(&self, log_file: &Path, entries: &[ChangeLogEntry]) -> Result<(), ArchiveError> {
        if let Some(parent) = log_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| ArchiveError::ChangeLog(format!("Failed to create log directory: {}", e)))?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| ArchiveError::ChangeLog(format!("Failed to open log file: {}", e)))?;

        let mut buffer = String::new();
        for entry in entries {
            let json = serde_json::to_string(entry)
                .map_err(|e| ArchiveError::ChangeLog(format!("Failed to serialize log: {}", e)))?;
            buffer.push_str(&json);
            buffer.push('\n');
        }

        file.write_all(buffer.as_bytes())
            .map_err(|e| ArchiveError::ChangeLog(format!("Failed to write log: {}", e)))?;
        Ok(())
    }
}
