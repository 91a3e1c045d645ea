//! Records and pending changes
//!
//! Records are JSON objects addressed by `(entity, id)`. A `ChangeSet` is
//! what a working context stages until it is saved into its parent or into
//! the store.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Address of a record
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub entity: String,
    pub id: String,
}

impl RecordKey {
    pub fn new(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity, self.id)
    }
}

/// A stored or staged record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub entity: String,
    pub id: String,
    pub body: Value,
}

/// One pending change to a record
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Insert or replace the record body
    Upsert(Value),
    /// Remove the record
    Delete,
}

/// Pending changes, at most one per record
///
/// Later changes to the same key replace earlier ones, so merging a child's
/// set into its parent's is last-writer-wins per record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    changes: BTreeMap<RecordKey, Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, key: RecordKey, body: Value) {
        self.changes.insert(key, Change::Upsert(body));
    }

    pub fn delete(&mut self, key: RecordKey) {
        self.changes.insert(key, Change::Delete);
    }

    pub fn get(&self, key: &RecordKey) -> Option<&Change> {
        self.changes.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RecordKey, &Change)> {
        self.changes.iter()
    }

    /// Changes touching one entity, in id order
    pub fn for_entity<'a>(
        &'a self,
        entity: &'a str,
    ) -> impl Iterator<Item = (&'a RecordKey, &'a Change)> + 'a {
        self.changes.iter().filter(move |(key, _)| key.entity == entity)
    }

    /// Fold `other` into this set; `other` wins on conflicting keys
    pub fn merge(&mut self, other: ChangeSet) {
        self.changes.extend(other.changes);
    }

    pub fn clear(&mut self) {
        self.changes.clear();
    }

    /// Apply this set on top of `records` (id → body) for one entity
    pub fn overlay(&self, entity: &str, records: &mut BTreeMap<String, Value>) {
        for (key, change) in self.for_entity(entity) {
            match change {
                Change::Upsert(body) => {
                    records.insert(key.id.clone(), body.clone());
                }
                Change::Delete => {
                    records.remove(&key.id);
                }
            }
        }
    }
}
