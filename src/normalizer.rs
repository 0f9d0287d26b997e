//! Record Normalizer - raw feed attributes into canonical, comparable records

use crate::error::NormalizationError;
use crate::record::{CanonicalRecord, IdentityKey, RawRecord, Snapshot};
use crate::value::FieldValue;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

const DATE_FORMATS: &[&str] = &["%d.%m.%Y", "%Y-%m-%d"];
const DATETIME_FORMATS: &[&str] = &[
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// Turns raw records into canonical records using the configured key fields.
#[derive(Debug, Clone)]
pub struct Normalizer {
    key_fields: Vec<String>,
    date_fields: HashSet<String>,
    ignore_fields: HashSet<String>,
}

impl Normalizer {
    pub fn new(key_fields: Vec<String>) -> Self {
        Self {
            key_fields,
            date_fields: HashSet::new(),
            ignore_fields: HashSet::new(),
        }
    }

    pub fn with_date_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.date_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ignore_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    /// Normalize one raw record. Pure: the same input always yields the same output.
    pub fn normalize(&self, raw: &RawRecord) -> Result<CanonicalRecord, NormalizationError> {
        let mut parts = Vec::with_capacity(self.key_fields.len());
        for field in &self.key_fields {
            let value = raw.get(field).ok_or_else(|| NormalizationError::MissingKeyField {
                field: field.clone(),
            })?;
            parts.push(self.key_part(field, value)?);
        }

        let mut values = BTreeMap::new();
        for (field, value) in raw {
            if self.key_fields.contains(field) || self.ignore_fields.contains(field) {
                continue;
            }
            values.insert(field.clone(), self.coerce(field, value)?);
        }

        Ok(CanonicalRecord {
            key: IdentityKey(parts),
            values,
        })
    }

    /// Map a canonical record back onto the raw shape it would have been parsed from.
    pub fn denormalize(&self, record: &CanonicalRecord) -> RawRecord {
        let mut raw = RawRecord::new();
        for (field, part) in self.key_fields.iter().zip(record.key.parts()) {
            raw.insert(field.clone(), Value::String(part.clone()));
        }
        for (field, value) in &record.values {
            raw.insert(field.clone(), value.to_json());
        }
        raw
    }

    /// Normalize a whole fetch. Failing records and repeated identity keys are
    /// excluded from the snapshot and reported; the first occurrence of a key wins.
    pub fn normalize_snapshot(
        &self,
        fetched_at: DateTime<Utc>,
        raw_records: &[RawRecord],
    ) -> (Snapshot, Vec<NormalizationError>) {
        let mut records = Vec::with_capacity(raw_records.len());
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for raw in raw_records {
            match self.normalize(raw) {
                Ok(record) => {
                    if seen.insert(record.key.clone()) {
                        records.push(record);
                    } else {
                        warn!("Duplicate identity key {} in snapshot, keeping first", record.key);
                        errors.push(NormalizationError::DuplicateKey {
                            key: record.key.to_string(),
                        });
                    }
                }
                Err(e) => {
                    warn!("Skipping record: {}", e);
                    errors.push(e);
                }
            }
        }

        debug!(
            "Normalized {} of {} records ({} skipped)",
            records.len(),
            raw_records.len(),
            errors.len()
        );
        (Snapshot::new(fetched_at, records), errors)
    }

    /// Key parts keep their textual form (`"01067"` stays `"01067"`); only
    /// date fields are parsed and rendered.
    fn key_part(&self, field: &str, value: &Value) -> Result<String, NormalizationError> {
        let missing = || NormalizationError::MissingKeyField {
            field: field.to_string(),
        };
        if self.date_fields.contains(field) {
            return match coerce_date(field, value)? {
                FieldValue::Text(s) => Ok(s),
                _ => Err(missing()),
            };
        }
        match value {
            Value::Null => Err(missing()),
            Value::String(s) if s.trim().is_empty() => Err(missing()),
            Value::String(s) => Ok(s.trim().to_string()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(NormalizationError::TypeCoercionFailure {
                field: field.to_string(),
                reason: format!("expected a scalar key, got {}", json_kind(other)),
            }),
        }
    }

    fn coerce(&self, field: &str, value: &Value) -> Result<FieldValue, NormalizationError> {
        if self.date_fields.contains(field) {
            return coerce_date(field, value);
        }
        FieldValue::from_json(value).ok_or_else(|| NormalizationError::TypeCoercionFailure {
            field: field.to_string(),
            reason: format!("expected a scalar, got {}", json_kind(value)),
        })
    }
}

fn coerce_date(field: &str, value: &Value) -> Result<FieldValue, NormalizationError> {
    let failure = |reason: String| NormalizationError::TypeCoercionFailure {
        field: field.to_string(),
        reason,
    };
    match value {
        Value::Null => Ok(FieldValue::Null),
        Value::String(s) if s.trim().is_empty() => Ok(FieldValue::Null),
        Value::String(_) | Value::Number(_) => parse_date(value)
            .map(|dt| FieldValue::Text(render_date(&dt)))
            .ok_or_else(|| failure(format!("unrecognized date '{}'", value_text(value)))),
        other => Err(failure(format!("expected a date, got {}", json_kind(other)))),
    }
}

/// Parse a feed date: day-first `dd.mm.yyyy`, ISO dates and date-times,
/// RFC 3339, or epoch milliseconds when the value is a JSON number.
pub fn parse_date(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::Number(n) => n.as_i64().and_then(from_epoch_millis),
        Value::String(s) => parse_date_str(s.trim()),
        _ => None,
    }
}

fn parse_date_str(s: &str) -> Option<NaiveDateTime> {
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return Some(date.and_time(NaiveTime::MIN));
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.naive_utc())
}

fn from_epoch_millis(millis: i64) -> Option<NaiveDateTime> {
    DateTime::<Utc>::from_timestamp_millis(millis).map(|dt| dt.naive_utc())
}

/// `YYYY-MM-DD` for midnight, `YYYY-MM-DDTHH:MM:SS` otherwise.
pub fn render_date(dt: &NaiveDateTime) -> String {
    if dt.time() == NaiveTime::MIN {
        dt.format("%Y-%m-%d").to_string()
    } else {
        dt.format("%Y-%m-%dT%H:%M:%S").to_string()
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    fn dresden() -> Normalizer {
        Normalizer::new(vec!["Datum".to_string()]).with_date_fields(["Datum"])
    }

    #[test]
    fn test_key_and_value_set() {
        let record = dresden()
            .normalize(&raw(json!({
                "Datum": "01.03.2021",
                "Fallzahl": 100,
                "Inzidenz": "43.7",
                "Anzeige_Indikator": ""
            })))
            .unwrap();

        assert_eq!(record.key.to_string(), "2021-03-01");
        assert!(!record.values.contains_key("Datum"));
        assert_eq!(record.value("Fallzahl"), &FieldValue::Integer(100));
        assert_eq!(record.value("Inzidenz"), &FieldValue::Float(43.7));
        assert!(record.value("Anzeige_Indikator").is_null());
    }

    #[test]
    fn test_composite_key() {
        let normalizer = Normalizer::new(vec!["Datum".to_string(), "Stadtteil".to_string()])
            .with_date_fields(["Datum"]);
        let record = normalizer
            .normalize(&raw(json!({"Datum": "2021-01-01", "Stadtteil": "dresden", "cases": 5})))
            .unwrap();
        assert_eq!(record.key, IdentityKey::new(["2021-01-01", "dresden"]));
    }

    #[test]
    fn test_missing_key_field() {
        let err = dresden().normalize(&raw(json!({"Fallzahl": 1}))).unwrap_err();
        assert_eq!(
            err,
            NormalizationError::MissingKeyField {
                field: "Datum".to_string()
            }
        );

        let err = dresden()
            .normalize(&raw(json!({"Datum": null, "Fallzahl": 1})))
            .unwrap_err();
        assert!(matches!(err, NormalizationError::MissingKeyField { .. }));
    }

    #[test]
    fn test_coercion_failures() {
        let err = dresden()
            .normalize(&raw(json!({"Datum": "yesterday"})))
            .unwrap_err();
        assert!(matches!(err, NormalizationError::TypeCoercionFailure { ref field, .. } if field == "Datum"));

        let err = dresden()
            .normalize(&raw(json!({"Datum": "01.03.2021", "nested": {"a": 1}})))
            .unwrap_err();
        assert!(matches!(err, NormalizationError::TypeCoercionFailure { ref field, .. } if field == "nested"));
    }

    #[test]
    fn test_epoch_millis_dates() {
        let record = dresden()
            .normalize(&raw(json!({"Datum": 1614556800000i64})))
            .unwrap();
        assert_eq!(record.key.to_string(), "2021-03-01");
    }

    #[test]
    fn test_digit_strings_are_not_epoch_millis() {
        let err = dresden()
            .normalize(&raw(json!({"Datum": "20210301"})))
            .unwrap_err();
        assert!(matches!(err, NormalizationError::TypeCoercionFailure { ref field, .. } if field == "Datum"));
    }

    #[test]
    fn test_key_parts_keep_leading_zeros() {
        let normalizer = Normalizer::new(vec!["PLZ".to_string()]);
        let padded = normalizer.normalize(&raw(json!({"PLZ": "01067", "Fallzahl": 1}))).unwrap();
        let plain = normalizer.normalize(&raw(json!({"PLZ": "1067", "Fallzahl": 1}))).unwrap();
        assert_eq!(padded.key.to_string(), "01067");
        assert_ne!(padded.key, plain.key);

        let (snapshot, errors) = normalizer.normalize_snapshot(
            Utc::now(),
            &[raw(json!({"PLZ": " 01067 "})), raw(json!({"PLZ": 1067}))],
        );
        assert_eq!(snapshot.len(), 2);
        assert!(errors.is_empty());

        let err = normalizer.normalize(&raw(json!({"PLZ": "  "}))).unwrap_err();
        assert!(matches!(err, NormalizationError::MissingKeyField { .. }));
    }

    #[test]
    fn test_ignore_fields() {
        let record = dresden()
            .with_ignore_fields(["ObjectId"])
            .normalize(&raw(json!({"Datum": "01.03.2021", "ObjectId": 7, "Fallzahl": 1})))
            .unwrap();
        assert!(!record.values.contains_key("ObjectId"));
        assert_eq!(record.values.len(), 1);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let normalizer = dresden().with_date_fields(["Datum", "Meldedatum"]);
        let input = raw(json!({
            "Datum": "02.03.2021",
            "Meldedatum": "2021-03-02T14:30:00Z",
            "Fallzahl": "105",
            "Inzidenz": 43.7,
            "Anzeige_Indikator": "x",
            "BelegteBetten": null,
            "Flag": true
        }));
        let once = normalizer.normalize(&input).unwrap();
        let twice = normalizer.normalize(&normalizer.denormalize(&once)).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.value("Meldedatum"), &FieldValue::Text("2021-03-02T14:30:00".to_string()));
    }

    #[test]
    fn test_snapshot_skips_bad_and_duplicate_records() {
        let records = vec![
            raw(json!({"Datum": "01.03.2021", "Fallzahl": 1})),
            raw(json!({"Fallzahl": 2})),
            raw(json!({"Datum": "2021-03-01", "Fallzahl": 3})),
            raw(json!({"Datum": "02.03.2021", "Fallzahl": 4})),
        ];
        let (snapshot, errors) = dresden().normalize_snapshot(Utc::now(), &records);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.records[0].value("Fallzahl"), &FieldValue::Integer(1));
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0], NormalizationError::MissingKeyField { .. }));
        assert_eq!(
            errors[1],
            NormalizationError::DuplicateKey {
                key: "2021-03-01".to_string()
            }
        );
    }
}
