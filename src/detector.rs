//! Change Detector - classifies every identity key across two snapshots

use crate::record::{CanonicalRecord, IdentityKey, Snapshot};
use crate::value::FieldValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    New,
    Changed,
    Unchanged,
    Removed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChangeKind::New => "new",
            ChangeKind::Changed => "changed",
            ChangeKind::Unchanged => "unchanged",
            ChangeKind::Removed => "removed",
        };
        write!(f, "{}", label)
    }
}

/// One differing field of a Changed record. Absent fields read as `Null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub old: FieldValue,
    pub new: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub kind: ChangeKind,
    /// Current record, or the previous one for Removed entries.
    pub record: CanonicalRecord,
    /// Non-empty only for Changed entries.
    pub diffs: Vec<FieldDiff>,
}

impl ChangeEntry {
    pub fn key(&self) -> &IdentityKey {
        &self.record.key
    }
}

/// Classified differences for one collection cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub entries: Vec<ChangeEntry>,
}

impl Delta {
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    pub fn of_kind(&self, kind: ChangeKind) -> impl Iterator<Item = &ChangeEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    /// True when nothing was added, changed or removed.
    pub fn is_quiet(&self) -> bool {
        self.entries.iter().all(|e| e.kind == ChangeKind::Unchanged)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compare `current` against `previous`.
///
/// Output order: `current` in fetch order (New / Changed / Unchanged), then
/// Removed records in the order they appeared in `previous`.
pub fn detect(previous: &Snapshot, current: &Snapshot) -> Delta {
    let previous_by_key: HashMap<&IdentityKey, &CanonicalRecord> =
        previous.records.iter().map(|r| (&r.key, r)).collect();
    let current_keys: HashSet<&IdentityKey> = current.records.iter().map(|r| &r.key).collect();

    let mut entries = Vec::with_capacity(current.len());

    for record in &current.records {
        let entry = match previous_by_key.get(&record.key) {
            None => ChangeEntry {
                kind: ChangeKind::New,
                record: record.clone(),
                diffs: Vec::new(),
            },
            Some(old) => {
                let diffs = diff_values(old, record);
                let kind = if diffs.is_empty() {
                    ChangeKind::Unchanged
                } else {
                    ChangeKind::Changed
                };
                ChangeEntry {
                    kind,
                    record: record.clone(),
                    diffs,
                }
            }
        };
        entries.push(entry);
    }

    for record in &previous.records {
        if !current_keys.contains(&record.key) {
            entries.push(ChangeEntry {
                kind: ChangeKind::Removed,
                record: record.clone(),
                diffs: Vec::new(),
            });
        }
    }

    Delta { entries }
}

/// Field-by-field comparison over the union of field names, sorted by name.
pub fn diff_values(old: &CanonicalRecord, new: &CanonicalRecord) -> Vec<FieldDiff> {
    let fields: BTreeSet<&String> = old.values.keys().chain(new.values.keys()).collect();
    fields
        .into_iter()
        .filter_map(|field| {
            let before = old.value(field);
            let after = new.value(field);
            (before != after).then(|| FieldDiff {
                field: field.clone(),
                old: before.clone(),
                new: after.clone(),
            })
        })
        .collect()
}
