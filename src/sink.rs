//! Persistence Sink - turns accepted changes into time-series points

use crate::detector::{ChangeEntry, ChangeKind, Delta};
use crate::error::PersistError;
use crate::normalizer::parse_date;
use crate::store::{Point, TimeSeriesStore};
use crate::value::FieldValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const TOMBSTONE_FIELD: &str = "tombstone";

/// Outcome of one `persist` call. Never escalated to a fatal error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistResult {
    pub points_written: usize,
    pub failed_keys: Vec<String>,
    pub errors: Vec<String>,
}

impl PersistResult {
    pub fn is_success(&self) -> bool {
        self.failed_keys.is_empty()
    }

    pub fn into_error(self) -> Option<PersistError> {
        if self.failed_keys.is_empty() {
            return None;
        }
        Some(PersistError {
            failed_keys: self.failed_keys,
            message: self.errors.join("; "),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkOptions {
    pub series_name: String,
    /// Key field holding the observation date.
    pub time_field: Option<String>,
    pub tombstones: bool,
    pub batch_size: usize,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            series_name: "dresden_official".to_string(),
            time_field: Some("Datum".to_string()),
            tombstones: false,
            batch_size: 500,
        }
    }
}

pub struct PersistenceSink {
    store: Arc<dyn TimeSeriesStore>,
    key_fields: Vec<String>,
    options: SinkOptions,
}

impl PersistenceSink {
    pub fn new(store: Arc<dyn TimeSeriesStore>, key_fields: Vec<String>, options: SinkOptions) -> Self {
        Self {
            store,
            key_fields,
            options,
        }
    }

    /// Write one point per New/Changed entry (and per Removed entry when
    /// tombstones are enabled).
    pub fn persist(&self, delta: &Delta) -> PersistResult {
        let pending: Vec<(String, Point)> = delta
            .entries
            .iter()
            .filter_map(|entry| self.to_point(entry).map(|point| (entry.key().to_string(), point)))
            .collect();

        let mut result = PersistResult::default();
        if pending.is_empty() {
            debug!("Nothing to persist");
            return result;
        }

        for batch in pending.chunks(self.options.batch_size.max(1)) {
            let points: Vec<Point> = batch.iter().map(|(_, p)| p.clone()).collect();
            match self.store.write(&self.options.series_name, &points) {
                Ok(()) => result.points_written += points.len(),
                Err(e) => {
                    warn!("Failed to write {} points: {}", points.len(), e);
                    result.failed_keys.extend(batch.iter().map(|(key, _)| key.clone()));
                    result.errors.push(e.to_string());
                }
            }
        }

        debug!(
            "Persisted {} points to {} ({} failed)",
            result.points_written,
            self.options.series_name,
            result.failed_keys.len()
        );
        result
    }

    /// The point for one entry, or `None` when the entry produces no write.
    /// Time and tags depend on the identity key only, so a rewrite of the same
    /// entity always lands on the same stored point.
    pub fn to_point(&self, entry: &ChangeEntry) -> Option<Point> {
        let fields = match entry.kind {
            ChangeKind::New | ChangeKind::Changed => entry.record.values.clone(),
            ChangeKind::Removed if self.options.tombstones => {
                BTreeMap::from([(TOMBSTONE_FIELD.to_string(), FieldValue::Bool(true))])
            }
            ChangeKind::Removed | ChangeKind::Unchanged => return None,
        };

        let tags = self
            .key_fields
            .iter()
            .cloned()
            .zip(entry.key().parts().iter().cloned())
            .collect();

        Some(Point {
            time: self.point_time(entry).unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            tags,
            fields,
        })
    }

    /// The parsed `time_field` key part; `None` for undated identities.
    fn point_time(&self, entry: &ChangeEntry) -> Option<DateTime<Utc>> {
        let field = self.options.time_field.as_deref()?;
        let i = self.key_fields.iter().position(|f| f == field)?;
        let part = entry.key().parts().get(i)?;
        parse_date(&Value::String(part.clone())).map(|dt| dt.and_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::detect;
    use crate::error::StoreError;
    use crate::record::{CanonicalRecord, IdentityKey, Snapshot};
    use crate::store::SqliteTimeSeriesStore;
    use chrono::TimeZone;

    struct FailingStore;

    impl TimeSeriesStore for FailingStore {
        fn write(&self, _series: &str, _points: &[Point]) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    fn record(date: &str, cases: i64) -> CanonicalRecord {
        CanonicalRecord::new(IdentityKey::new([date])).with_value("Fallzahl", cases)
    }

    fn snapshot(records: Vec<CanonicalRecord>) -> Snapshot {
        Snapshot::new(Utc::now(), records)
    }

    fn sink(store: Arc<dyn TimeSeriesStore>, tombstones: bool) -> PersistenceSink {
        PersistenceSink::new(
            store,
            vec!["Datum".to_string()],
            SinkOptions {
                tombstones,
                batch_size: 2,
                ..SinkOptions::default()
            },
        )
    }

    #[test]
    fn test_new_and_changed_become_points() {
        let store = Arc::new(SqliteTimeSeriesStore::in_memory().unwrap());
        let previous = snapshot(vec![record("2021-03-01", 100), record("2021-03-02", 5)]);
        let current = snapshot(vec![
            record("2021-03-01", 105),
            record("2021-03-02", 5),
            record("2021-03-03", 10),
        ]);
        let delta = detect(&previous, &current);

        let result = sink(store.clone(), false).persist(&delta);
        assert!(result.is_success());
        assert_eq!(result.points_written, 2);

        let points = store.read_series("dresden_official").unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].time, Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(points[0].tags["Datum"], "2021-03-01");
        assert_eq!(points[0].fields["Fallzahl"], FieldValue::Integer(105));
    }

    #[test]
    fn test_persist_twice_is_idempotent() {
        let store = Arc::new(SqliteTimeSeriesStore::in_memory().unwrap());
        let delta = detect(
            &Snapshot::empty(),
            &snapshot(vec![record("2021-03-01", 1), record("2021-03-02", 2), record("2021-03-03", 3)]),
        );
        let sink = sink(store.clone(), false);

        sink.persist(&delta);
        let once = store.point_count("dresden_official").unwrap();
        sink.persist(&delta);
        assert_eq!(store.point_count("dresden_official").unwrap(), once);
        assert_eq!(once, 3);
    }

    #[test]
    fn test_removed_without_tombstones_writes_nothing() {
        let store = Arc::new(SqliteTimeSeriesStore::in_memory().unwrap());
        let delta = detect(&snapshot(vec![record("2021-03-01", 1)]), &snapshot(vec![]));

        let result = sink(store.clone(), false).persist(&delta);
        assert_eq!(result.points_written, 0);
        assert_eq!(store.point_count("dresden_official").unwrap(), 0);
    }

    #[test]
    fn test_removed_with_tombstones() {
        let store = Arc::new(SqliteTimeSeriesStore::in_memory().unwrap());
        let delta = detect(&snapshot(vec![record("2021-03-01", 1)]), &snapshot(vec![]));

        let result = sink(store.clone(), true).persist(&delta);
        assert_eq!(result.points_written, 1);
        let points = store.read_series("dresden_official").unwrap();
        assert_eq!(points[0].fields[TOMBSTONE_FIELD], FieldValue::Bool(true));
    }

    #[test]
    fn test_write_failure_reports_keys() {
        let delta = detect(
            &Snapshot::empty(),
            &snapshot(vec![record("2021-03-01", 1), record("2021-03-02", 2), record("2021-03-03", 3)]),
        );
        let result = sink(Arc::new(FailingStore), false).persist(&delta);

        assert_eq!(result.points_written, 0);
        assert_eq!(result.failed_keys, vec!["2021-03-01", "2021-03-02", "2021-03-03"]);
        let err = result.into_error().unwrap();
        assert_eq!(err.failed_keys.len(), 3);
    }

    #[test]
    fn test_undated_records_overwrite_by_identity() {
        let store = Arc::new(SqliteTimeSeriesStore::in_memory().unwrap());
        let sink = PersistenceSink::new(store.clone(), vec!["Stadtteil".to_string()], SinkOptions::default());
        let district = |cases: i64| CanonicalRecord::new(IdentityKey::new(["Altstadt"])).with_value("Fallzahl", cases);

        let first = detect(&Snapshot::empty(), &snapshot(vec![district(100)]));
        let changed = detect(&snapshot(vec![district(100)]), &snapshot(vec![district(105)]));
        sink.persist(&first);
        sink.persist(&changed);
        sink.persist(&changed);

        let points = store.read_series("dresden_official").unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].time, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(points[0].fields["Fallzahl"], FieldValue::Integer(105));
    }

    #[test]
    fn test_unparseable_key_date_is_undated() {
        let store = Arc::new(SqliteTimeSeriesStore::in_memory().unwrap());
        let delta = detect(&Snapshot::empty(), &snapshot(vec![record("district-7", 1)]));

        sink(store.clone(), false).persist(&delta);
        assert_eq!(store.read_series("dresden_official").unwrap()[0].time, DateTime::<Utc>::UNIX_EPOCH);
    }
}
