//! Orchestrator state and counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use parcelsync_codec::CodecStats;

/// Lifecycle of the orchestrator.
///
/// `Syncing` is entered by every pass. `Conflict` is transient and returns to
/// `Idle` when the pass ends; `Error` persists until the next pass starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Conflict,
    Error,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Conflict => "conflict",
            SyncState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub generated: u64,
    pub applied: u64,
    pub compressed: u64,
    pub conflicts: u64,
    pub errors: u64,
    pub sent: u64,
    pub manual_reviews: u64,
    pub passes: u64,
    pub last_pass_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub(crate) struct SyncCounters {
    pub conflicts: AtomicU64,
    pub errors: AtomicU64,
    pub sent: AtomicU64,
    pub manual_reviews: AtomicU64,
    pub passes: AtomicU64,
    last_pass_at: Mutex<Option<DateTime<Utc>>>,
}

impl SyncCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish_pass(&self) {
        Self::bump(&self.passes);
        let mut last = self.last_pass_at.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(Utc::now());
    }

    pub fn snapshot(&self, codec: CodecStats) -> SyncStats {
        SyncStats {
            generated: codec.generated,
            applied: codec.applied,
            compressed: codec.compressed,
            conflicts: self.conflicts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            manual_reviews: self.manual_reviews.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            last_pass_at: *self.last_pass_at.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}
