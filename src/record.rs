//! Raw and canonical record shapes, identity keys and snapshots

use crate::value::FieldValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// One feature's `attributes` object, exactly as delivered upstream.
pub type RawRecord = Map<String, Value>;

/// Stable identity of one logical entity across fetches, one part per key field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(pub Vec<String>);

impl IdentityKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub key: IdentityKey,
    pub values: BTreeMap<String, FieldValue>,
}

impl CanonicalRecord {
    pub fn new(key: IdentityKey) -> Self {
        Self {
            key,
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    /// Field value, or `Null` when the field is absent.
    pub fn value(&self, field: &str) -> &FieldValue {
        static NULL: FieldValue = FieldValue::Null;
        self.values.get(field).unwrap_or(&NULL)
    }
}

/// One fetched, normalized view of the full dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub fetched_at: DateTime<Utc>,
    pub records: Vec<CanonicalRecord>,
}

impl Snapshot {
    pub fn new(fetched_at: DateTime<Utc>, records: Vec<CanonicalRecord>) -> Self {
        Self {
            fetched_at,
            records,
        }
    }

    /// The first-run baseline.
    pub fn empty() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
