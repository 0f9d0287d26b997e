//! Collector configuration
//!
//! Resolved before a cycle starts: JSON file (every field optional), then
//! environment overrides, then command-line flags in the binary.

use crate::error::{CollectorError, Result};
use crate::sink::SinkOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_SOURCE_URL: &str = "https://services.arcgis.com/ORpvigFPJUhb8RDF/arcgis/rest/services/corona_DD_7_Sicht/FeatureServer/0/query";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Feature-layer query endpoint.
    pub source_url: String,
    /// Fixed query: all records, all fields.
    pub query: Vec<(String, String)>,
    pub request_timeout_secs: u64,

    /// Fields forming the identity key, in order.
    pub key_fields: Vec<String>,
    /// Fields parsed as dates and rendered canonically.
    pub date_fields: Vec<String>,
    /// Fields dropped before diffing.
    pub ignore_fields: Vec<String>,
    /// Key field holding the observation time of a point. Points of
    /// identities without a parseable date are stamped at the Unix epoch.
    pub time_field: Option<String>,

    pub persistence_enabled: bool,
    pub db_path: PathBuf,
    pub series_name: String,
    pub tombstones: bool,
    pub batch_size: usize,

    pub archive_enabled: bool,
    pub archive_dir: PathBuf,
    /// JSON-lines change log; `None` logs changes to tracing only.
    pub change_log_path: Option<PathBuf>,

    /// Side file holding the last known snapshot.
    pub state_path: PathBuf,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            query: vec![
                ("f".to_string(), "json".to_string()),
                ("where".to_string(), "ObjectId>=0".to_string()),
                ("outFields".to_string(), "*".to_string()),
            ],
            request_timeout_secs: 30,
            key_fields: vec!["Datum".to_string()],
            date_fields: vec!["Datum".to_string()],
            ignore_fields: Vec::new(),
            time_field: Some("Datum".to_string()),
            persistence_enabled: true,
            db_path: PathBuf::from("corona_dd.db"),
            series_name: "dresden_official".to_string(),
            tombstones: false,
            batch_size: 500,
            archive_enabled: false,
            archive_dir: PathBuf::from("archive"),
            change_log_path: Some(PathBuf::from("changes.jsonl")),
            state_path: PathBuf::from("cached_state.json"),
        }
    }
}

impl CollectorConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CollectorError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            CollectorError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply `COLLECTOR_*` environment overrides.
    pub fn apply_env(mut self) -> Self {
        self.apply_vars(|name| std::env::var(name).ok());
        self
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("COLLECTOR_SOURCE_URL") {
            self.source_url = url;
        }
        if let Some(path) = var("COLLECTOR_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(path) = var("COLLECTOR_STATE_PATH") {
            self.state_path = PathBuf::from(path);
        }
        if let Some(dir) = var("COLLECTOR_ARCHIVE_DIR") {
            self.archive_dir = PathBuf::from(dir);
            self.archive_enabled = true;
        }
        if let Some(series) = var("COLLECTOR_SERIES") {
            self.series_name = series;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_fields.is_empty() {
            return Err(CollectorError::Config("key_fields must not be empty".to_string()));
        }
        if self.key_fields.iter().any(|f| f.trim().is_empty()) {
            return Err(CollectorError::Config("key_fields must not contain blank names".to_string()));
        }
        if let Some(ref time_field) = self.time_field {
            if !self.key_fields.contains(time_field) {
                return Err(CollectorError::Config(format!(
                    "time_field '{}' must be one of the key_fields",
                    time_field
                )));
            }
        }
        if self.batch_size == 0 {
            return Err(CollectorError::Config("batch_size must be at least 1".to_string()));
        }
        if self.series_name.trim().is_empty() {
            return Err(CollectorError::Config("series_name must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn sink_options(&self) -> SinkOptions {
        SinkOptions {
            series_name: self.series_name.clone(),
            time_field: self.time_field.clone(),
            tombstones: self.tombstones,
            batch_size: self.batch_size,
        }
    }
}
