//! Collection cycle driver
//!
//! One cycle: fetch → archive → normalize → detect → {persist, log} →
//! baseline replacement. The baseline is loaded before and replaced after the
//! cycle; a fetch failure leaves it untouched.

use crate::archive::{archive_name, ArchiveStore, ChangeLogger, FsArchive};
use crate::config::CollectorConfig;
use crate::detector::{detect, ChangeKind};
use crate::error::{CycleError, Result};
use crate::fetcher::{Fetcher, SnapshotFetcher};
use crate::normalizer::Normalizer;
use crate::sink::PersistenceSink;
use crate::state::{CycleLock, JsonStateFile, PersistedState, StateStore};
use crate::store::SqliteTimeSeriesStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Summary of one collection cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleResult {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub fetched_count: usize,
    pub new_count: usize,
    pub changed_count: usize,
    pub unchanged_count: usize,
    pub removed_count: usize,
    /// Records excluded by normalization.
    pub skipped_records: usize,
    pub points_written: usize,
    /// Version of the baseline in effect after the cycle.
    pub baseline_version: u64,
    /// Another cycle held the lock; nothing was done.
    pub skipped: bool,
    pub errors: Vec<CycleError>,
}

impl CycleResult {
    fn start(run_id: String, baseline_version: u64) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            fetched_count: 0,
            new_count: 0,
            changed_count: 0,
            unchanged_count: 0,
            removed_count: 0,
            skipped_records: 0,
            points_written: 0,
            baseline_version,
            skipped: false,
            errors: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Result of a cycle against an explicit baseline.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub result: CycleResult,
    /// The state superseding the baseline; `None` when the fetch failed.
    pub next_state: Option<PersistedState>,
}

pub struct Collector {
    fetcher: SnapshotFetcher,
    normalizer: Normalizer,
    sink: Option<PersistenceSink>,
    archive: Option<Arc<dyn ArchiveStore>>,
    change_log: ChangeLogger,
    state: Box<dyn StateStore>,
    lock_path: Option<PathBuf>,
    series_name: String,
}

impl Collector {
    /// A collector with persistence, archiving and the change-log file disabled.
    pub fn new(fetcher: SnapshotFetcher, normalizer: Normalizer, state: Box<dyn StateStore>) -> Self {
        Self {
            fetcher,
            normalizer,
            sink: None,
            archive: None,
            change_log: ChangeLogger::new(None),
            state,
            lock_path: None,
            series_name: "dresden_official".to_string(),
        }
    }

    pub fn with_sink(mut self, sink: PersistenceSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_archive(mut self, archive: Arc<dyn ArchiveStore>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_change_log(mut self, change_log: ChangeLogger) -> Self {
        self.change_log = change_log;
        self
    }

    pub fn with_lock(mut self, lock_path: impl Into<PathBuf>) -> Self {
        self.lock_path = Some(lock_path.into());
        self
    }

    /// Name prefix of archived payloads.
    pub fn with_series_name(mut self, series_name: impl Into<String>) -> Self {
        self.series_name = series_name.into();
        self
    }

    /// Wire up the shipped implementations from a resolved configuration.
    pub fn from_config(config: &CollectorConfig, fetcher: Box<dyn Fetcher>) -> Result<Self> {
        config.validate()?;

        let normalizer = Normalizer::new(config.key_fields.clone())
            .with_date_fields(config.date_fields.iter().cloned())
            .with_ignore_fields(config.ignore_fields.iter().cloned());

        let mut collector = Self::new(
            SnapshotFetcher::new(fetcher, config.source_url.clone(), config.query.clone()),
            normalizer,
            Box::new(JsonStateFile::new(config.state_path.clone())),
        )
        .with_change_log(ChangeLogger::new(config.change_log_path.clone()))
        .with_lock(CycleLock::path_for(&config.state_path))
        .with_series_name(config.series_name.clone());

        if config.persistence_enabled {
            let store = SqliteTimeSeriesStore::open(&config.db_path)?;
            collector = collector.with_sink(PersistenceSink::new(
                Arc::new(store),
                config.key_fields.clone(),
                config.sink_options(),
            ));
        } else {
            info!("Persistence disabled, changes will only be logged");
        }

        if config.archive_enabled {
            collector = collector.with_archive(Arc::new(FsArchive::new(config.archive_dir.clone())));
        }

        Ok(collector)
    }

    /// Run one cycle: take the lock, load the baseline, collect, replace the
    /// baseline. A held lock yields a skipped result.
    pub async fn run_cycle(&self) -> Result<CycleResult> {
        let run_id = Uuid::new_v4().to_string();

        let _lock = match self.lock_path {
            Some(ref path) => match CycleLock::try_acquire(path)? {
                Some(lock) => Some(lock),
                None => {
                    warn!("Another cycle holds {}, skipping", path.display());
                    let mut result = CycleResult::start(run_id, 0);
                    result.skipped = true;
                    return Ok(result);
                }
            },
            None => None,
        };

        let baseline = match self.state.load() {
            Ok(state) => state.unwrap_or_else(PersistedState::initial),
            Err(e) => {
                error!("Cycle {} aborted: {}", run_id, e);
                let mut result = CycleResult::start(run_id, 0);
                result.errors.push(e.into());
                return Ok(result);
            }
        };

        let CycleOutcome { mut result, next_state } = self.run_cycle_with(&baseline, run_id).await;

        if let Some(next_state) = next_state {
            match self.state.replace(&next_state) {
                Ok(()) => result.baseline_version = next_state.version,
                Err(e) => {
                    error!("Baseline not replaced: {}", e);
                    result.errors.push(e.into());
                }
            }
        }

        info!(
            "Cycle {} finished: {} new, {} changed, {} unchanged, {} removed, {} points, {} errors",
            result.run_id,
            result.new_count,
            result.changed_count,
            result.unchanged_count,
            result.removed_count,
            result.points_written,
            result.errors.len()
        );
        Ok(result)
    }

    /// Collect against an explicit baseline without touching the state store.
    pub async fn run_cycle_with(&self, baseline: &PersistedState, run_id: String) -> CycleOutcome {
        let mut result = CycleResult::start(run_id, baseline.version);

        let payload = match self.fetcher.fetch().await {
            Ok(payload) => payload,
            Err(e) => {
                error!("Fetch from {} failed: {}", self.fetcher.url(), e);
                result.errors.push(e.into());
                return CycleOutcome {
                    result,
                    next_state: None,
                };
            }
        };
        result.fetched_count = payload.records.len();

        if let Some(ref archive) = self.archive {
            let name = archive_name(&self.series_name, payload.fetched_at);
            if let Err(e) = archive.store(&name, &payload.raw) {
                warn!("{}", e);
                result.errors.push(e.into());
            }
        }

        let (snapshot, rejected) = self
            .normalizer
            .normalize_snapshot(payload.fetched_at, &payload.records);
        result.skipped_records = rejected.len();
        result.errors.extend(rejected.into_iter().map(CycleError::from));

        let delta = detect(&baseline.snapshot, &snapshot);
        result.new_count = delta.count(ChangeKind::New);
        result.changed_count = delta.count(ChangeKind::Changed);
        result.unchanged_count = delta.count(ChangeKind::Unchanged);
        result.removed_count = delta.count(ChangeKind::Removed);
        if delta.is_quiet() {
            debug!("No changes since baseline v{} ({} unchanged)", baseline.version, result.unchanged_count);
        }

        if let Some(ref sink) = self.sink {
            let persisted = sink.persist(&delta);
            result.points_written = persisted.points_written;
            if let Some(e) = persisted.into_error() {
                warn!("{}", e);
                result.errors.push(e.into());
            }
        }

        if let Err(e) = self
            .change_log
            .log_changes(&result.run_id, payload.fetched_at, &delta)
        {
            warn!("{}", e);
            result.errors.push(e.into());
        }

        CycleOutcome {
            result,
            next_state: Some(baseline.succeed(snapshot)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FetchError, StateError};
    use crate::fetcher::FileFetcher;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct MemoryState(Mutex<Option<PersistedState>>);

    impl StateStore for MemoryState {
        fn load(&self) -> std::result::Result<Option<PersistedState>, StateError> {
            Ok(self.0.lock().unwrap().clone())
        }

        fn replace(&self, state: &PersistedState) -> std::result::Result<(), StateError> {
            *self.0.lock().unwrap() = Some(state.clone());
            Ok(())
        }
    }

    fn collector(payload: &std::path::Path) -> Collector {
        Collector::new(
            SnapshotFetcher::new(Box::new(FileFetcher::new(payload)), "file", Vec::new()),
            Normalizer::new(vec!["Datum".to_string()]).with_date_fields(["Datum"]),
            Box::new(MemoryState(Mutex::new(None))),
        )
    }

    #[tokio::test]
    async fn test_first_cycle_classifies_everything_new() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("query.json");
        std::fs::write(
            &path,
            r#"{"features": [
                {"attributes": {"Datum": "01.03.2021", "Fallzahl": 100}},
                {"attributes": {"Datum": "02.03.2021", "Fallzahl": 110}}
            ]}"#,
        )
        .unwrap();

        let outcome = collector(&path)
            .run_cycle_with(&PersistedState::initial(), "run-1".to_string())
            .await;
        assert!(outcome.result.is_success());
        assert_eq!(outcome.result.new_count, 2);
        assert_eq!(outcome.next_state.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_baseline() {
        let temp_dir = TempDir::new().unwrap();
        let outcome = collector(&temp_dir.path().join("missing.json"))
            .run_cycle_with(&PersistedState::initial(), "run-1".to_string())
            .await;

        assert!(outcome.next_state.is_none());
        assert_eq!(outcome.result.errors.len(), 1);
        assert!(matches!(
            outcome.result.errors[0],
            CycleError::Fetch(FetchError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_run_cycle_advances_version() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("query.json");
        std::fs::write(&path, r#"{"features": [{"attributes": {"Datum": "01.03.2021"}}]}"#).unwrap();
        let collector = collector(&path).with_lock(temp_dir.path().join("state.lock"));

        assert_eq!(collector.run_cycle().await.unwrap().baseline_version, 1);
        let second = collector.run_cycle().await.unwrap();
        assert_eq!(second.baseline_version, 2);
        assert_eq!(second.unchanged_count, 1);
        assert!(CycleLock::try_acquire(temp_dir.path().join("state.lock")).unwrap().is_some());
    }
}
