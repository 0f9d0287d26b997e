//! Time-series storage - upsert-by-time-and-tags point store
//!
//! Architecture: SQLite, one row per (series, time, tags)
//! - tags are stored as canonical JSON (sorted keys), so equal tag sets
//!   always collide on the primary key
//! - a repeated write replaces the stored fields instead of duplicating the point

use crate::error::StoreError;
use crate::value::FieldValue;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// One observation in a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub time: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
}

/// Storage capability. Implementations must upsert on (series, time, tags).
pub trait TimeSeriesStore: Send + Sync {
    fn write(&self, series: &str, points: &[Point]) -> Result<(), StoreError>;
}

/// SQLite-backed point store.
pub struct SqliteTimeSeriesStore {
    path: PathBuf,
    db: Mutex<Connection>,
}

impl SqliteTimeSeriesStore {
    /// Open or create the database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("Failed to create {}: {}", parent.display(), e)))?;
            }
        }

        let db = Connection::open(&path)
            .map_err(|e| StoreError::Unavailable(format!("Failed to open database: {}", e)))?;
        let store = Self {
            path,
            db: Mutex::new(db),
        };
        store.init_schema()?;
        info!("Opened time-series store at {}", store.path.display());
        Ok(store)
    }

    /// In-memory database, used by tests and dry runs.
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(format!("Failed to open database: {}", e)))?;
        let store = Self {
            path: PathBuf::from(":memory:"),
            db: Mutex::new(db),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.db
            .lock()
            .map_err(|_| StoreError::Unavailable("Database mutex poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let db = self.connection()?;
        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS points (
                series TEXT NOT NULL,
                time TEXT NOT NULL,
                tags TEXT NOT NULL,
                fields TEXT NOT NULL,
                written_at TEXT NOT NULL,
                PRIMARY KEY (series, time, tags)
            )
            "#,
            [],
        )
        .map_err(|e| StoreError::Unavailable(format!("Failed to create table: {}", e)))?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_points_series_time ON points(series, time)",
            [],
        )
        .map_err(|e| StoreError::Unavailable(format!("Failed to create index: {}", e)))?;

        Ok(())
    }

    /// Number of stored points in `series`.
    pub fn point_count(&self, series: &str) -> Result<u64, StoreError> {
        let db = self.connection()?;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM points WHERE series = ?1",
            params![series],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// All points of `series`, ordered by time.
    pub fn read_series(&self, series: &str) -> Result<Vec<Point>, StoreError> {
        let db = self.connection()?;
        let mut stmt = db.prepare(
            "SELECT time, tags, fields FROM points WHERE series = ?1 ORDER BY time, tags",
        )?;
        let rows = stmt.query_map(params![series], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut points = Vec::new();
        for row in rows {
            let (time, tags, fields) = row?;
            let time = DateTime::parse_from_rfc3339(&time)
                .map_err(|e| StoreError::Rejected(format!("Bad stored time '{}': {}", time, e)))?
                .with_timezone(&Utc);
            let tags = serde_json::from_str(&tags)
                .map_err(|e| StoreError::Rejected(format!("Bad stored tags: {}", e)))?;
            let fields = serde_json::from_str(&fields)
                .map_err(|e| StoreError::Rejected(format!("Bad stored fields: {}", e)))?;
            points.push(Point { time, tags, fields });
        }
        Ok(points)
    }
}

impl TimeSeriesStore for SqliteTimeSeriesStore {
    fn write(&self, series: &str, points: &[Point]) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }

        let mut db = self.connection()?;
        let tx = db.transaction()?;
        let written_at = Utc::now().to_rfc3339();

        for point in points {
            let tags = serde_json::to_string(&point.tags)
                .map_err(|e| StoreError::Rejected(format!("Failed to encode tags: {}", e)))?;
            let fields = serde_json::to_string(&point.fields)
                .map_err(|e| StoreError::Rejected(format!("Failed to encode fields: {}", e)))?;
            tx.execute(
                r#"
                INSERT INTO points (series, time, tags, fields, written_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(series, time, tags) DO UPDATE SET
                    fields = excluded.fields,
                    written_at = excluded.written_at
                "#,
                params![
                    series,
                    point.time.to_rfc3339_opts(SecondsFormat::Secs, true),
                    tags,
                    fields,
                    written_at,
                ],
            )?;
        }

        tx.commit()?;
        debug!("Wrote {} points to series {}", points.len(), series);
        Ok(())
    }
}
