//! Incremental collector for municipal infection statistics.
//!
//! Fetches a feature-layer JSON feed, normalizes it into canonical records,
//! diffs it against the last known snapshot and persists the accepted changes
//! as time-series points.

pub mod archive;
pub mod config;
pub mod detector;
pub mod error;
pub mod fetcher;
pub mod normalizer;
pub mod pipeline;
pub mod record;
pub mod sink;
pub mod state;
pub mod store;
pub mod value;

pub use archive::{archive_name, ArchiveStore, ChangeLogEntry, ChangeLogger, FsArchive};
pub use config::CollectorConfig;
pub use detector::{detect, ChangeEntry, ChangeKind, Delta, FieldDiff};
pub use error::{
    ArchiveError, CollectorError, CycleError, FetchError, NormalizationError, PersistError,
    Result, StateError, StoreError,
};
pub use fetcher::{FetchedPayload, Fetcher, FileFetcher, HttpFetcher, SnapshotFetcher};
pub use normalizer::Normalizer;
pub use pipeline::{Collector, CycleOutcome, CycleResult};
pub use record::{CanonicalRecord, IdentityKey, RawRecord, Snapshot};
pub use sink::{PersistResult, PersistenceSink, SinkOptions};
pub use state::{CycleLock, JsonStateFile, PersistedState, StateStore};
pub use store::{Point, SqliteTimeSeriesStore, TimeSeriesStore};
pub use value::FieldValue;
