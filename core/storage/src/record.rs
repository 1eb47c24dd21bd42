//! Record model stored for each user document.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use parcelsync_common::{Error, RecordKey, Result};

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Why the last sync attempt for a record failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub error: String,
    pub attempts: u32,
    /// Epoch millis of the failure.
    pub at: i64,
}

/// Collection-scoped document plus its sync bookkeeping.
///
/// Stored as JSON in the record's collection; filters passed to
/// [`crate::WriteCache::get_all`] address these field names (camelCase),
/// with document fields under `data.`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub collection: String,
    pub id: String,
    pub data: Value,
    /// Last server revision the local copy is based on.
    #[serde(default)]
    pub sync_version: u64,
    pub updated_at: i64,
    #[serde(default)]
    pub last_synced: Option<i64>,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default)]
    pub essential: bool,
    #[serde(default)]
    pub pending_delete: bool,
    #[serde(default)]
    pub conflicted: bool,
    #[serde(default)]
    pub failure: Option<SyncFailure>,
}

impl Record {
    /// New clean record at `sync_version`.
    pub fn new(key: &RecordKey, data: Value, sync_version: u64) -> Self {
        Self {
            collection: key.collection.clone(),
            id: key.id.clone(),
            data,
            sync_version,
            updated_at: now_millis(),
            last_synced: None,
            dirty: false,
            essential: false,
            pending_delete: false,
            conflicted: false,
            failure: None,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::from_parts(self.collection.clone(), self.id.clone())
    }

    /// Whether the record is visible to readers.
    pub fn is_live(&self) -> bool {
        !self.pending_delete
    }

    /// Whether the reclaimer may drop the record.
    pub fn is_evictable(&self) -> bool {
        !(self.dirty || self.pending_delete || self.conflicted || self.essential)
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Rough in-memory footprint used by the memory probe.
    pub fn estimated_size(&self) -> usize {
        self.data.to_string().len() + self.collection.len() + self.id.len() + 96
    }
}
