//! Persistent queue of deltas awaiting transmission.
//!
//! Entries live in the internal `_sync_queue` collection and carry a
//! monotonic sequence number so that deltas of one document are always
//! replayed in the order they were produced.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parcelsync_codec::Delta;
use parcelsync_common::{Error, RecordKey, Result};

use crate::filter::Filter;
use crate::record::now_millis;
use crate::store::{LocalStore, StoreOp};

/// Internal collection holding queue entries.
pub const QUEUE_COLLECTION: &str = "_sync_queue";

/// One queued local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueEntry {
    pub id: String,
    pub sequence: u64,
    pub collection: String,
    pub document_id: String,
    pub deltas: Vec<Delta>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub synced_at: Option<i64>,
    /// Retries exhausted; waits for manual intervention.
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    pub enqueued_at: i64,
    /// Backoff deadline (epoch millis) after a failed attempt.
    #[serde(default)]
    pub next_attempt_at: Option<i64>,
}

impl SyncQueueEntry {
    pub fn key(&self) -> RecordKey {
        RecordKey::from_parts(self.collection.clone(), self.document_id.clone())
    }

    /// Still waiting to be sent.
    pub fn is_pending(&self) -> bool {
        !self.synced && !self.failed
    }

    fn to_op(&self) -> Result<StoreOp> {
        Ok(StoreOp::Put {
            collection: QUEUE_COLLECTION.to_string(),
            id: self.id.clone(),
            value: serde_json::to_value(self)?,
        })
    }
}

/// Pending entries of one document in sequence order.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentBatch {
    pub collection: String,
    pub document_id: String,
    pub entries: Vec<SyncQueueEntry>,
}

impl DocumentBatch {
    pub fn key(&self) -> RecordKey {
        RecordKey::from_parts(self.collection.clone(), self.document_id.clone())
    }

    /// All deltas of the batch in enqueue order.
    pub fn deltas(&self) -> Vec<Delta> {
        self.entries
            .iter()
            .flat_map(|entry| entry.deltas.iter().cloned())
            .collect()
    }

    /// Highest attempt count among the entries.
    pub fn attempts(&self) -> u32 {
        self.entries.iter().map(|e| e.attempts).max().unwrap_or(0)
    }

    /// Holds an entry whose retries are exhausted. Later entries of the
    /// document wait behind it until [`SyncQueue::reset_failed`].
    pub fn is_blocked(&self) -> bool {
        self.entries.iter().any(|e| e.failed)
    }

    /// Whether the backoff deadline has passed at `now`.
    pub fn is_due(&self, now: i64) -> bool {
        self.entries
            .iter()
            .all(|e| e.next_attempt_at.map_or(true, |at| at <= now))
    }
}

/// Entry counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub pending: usize,
    pub synced: usize,
    pub failed: usize,
}

/// Sequence-ordered sync queue.
pub struct SyncQueue {
    store: Arc<dyn LocalStore>,
    next_sequence: AtomicU64,
}

impl SyncQueue {
    /// Open the queue, resuming the sequence after the highest stored entry.
    pub async fn open(store: Arc<dyn LocalStore>) -> Result<Self> {
        let queue = Self {
            store,
            next_sequence: AtomicU64::new(1),
        };
        let last = queue
            .entries(None)
            .await?
            .last()
            .map(|entry| entry.sequence)
            .unwrap_or(0);
        queue.next_sequence.store(last + 1, Ordering::SeqCst);
        debug!(next_sequence = last + 1, "sync queue opened");
        Ok(queue)
    }

    /// Build a new entry and the store operation persisting it.
    ///
    /// The caller commits the operation, usually together with the record
    /// write it belongs to.
    pub fn stage(&self, delta: Delta) -> Result<(SyncQueueEntry, StoreOp)> {
        let entry = SyncQueueEntry {
            id: Uuid::new_v4().to_string(),
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            collection: delta.collection.clone(),
            document_id: delta.document_id.clone(),
            deltas: vec![delta],
            attempts: 0,
            synced: false,
            synced_at: None,
            failed: false,
            last_error: None,
            enqueued_at: now_millis(),
            next_attempt_at: None,
        };
        let op = entry.to_op()?;
        Ok((entry, op))
    }

    /// Stage and persist a new entry.
    pub async fn enqueue(&self, delta: Delta) -> Result<SyncQueueEntry> {
        let (entry, op) = self.stage(delta)?;
        self.store.transaction(vec![op]).await?;
        Ok(entry)
    }

    /// Entries in sequence order, optionally limited to one collection.
    pub async fn entries(&self, collection: Option<&str>) -> Result<Vec<SyncQueueEntry>> {
        let filter = match collection {
            Some(collection) => Filter::eq("collection", collection),
            None => Filter::All,
        };
        self.load(&filter).await
    }

    /// Entries still waiting to be sent for `collection`.
    pub async fn pending(&self, collection: &str) -> Result<Vec<SyncQueueEntry>> {
        self.load(&Filter::eq("collection", collection).and(pending_filter()))
            .await
    }

    /// Entries of one record the server has not confirmed, failed ones
    /// included, in sequence order.
    pub async fn unsynced_for(&self, key: &RecordKey) -> Result<Vec<SyncQueueEntry>> {
        let filter = Filter::eq("collection", key.collection.as_str())
            .and(Filter::eq("documentId", key.id.as_str()))
            .and(Filter::eq("synced", false));
        self.load(&filter).await
    }

    /// Unsynced entries grouped by document, ordered by each group's first
    /// sequence number. A group holding a failed entry is
    /// [blocked](DocumentBatch::is_blocked).
    pub async fn pending_by_document(&self, collection: &str) -> Result<Vec<DocumentBatch>> {
        let filter = Filter::eq("collection", collection).and(Filter::eq("synced", false));
        let mut groups: BTreeMap<String, Vec<SyncQueueEntry>> = BTreeMap::new();
        for entry in self.load(&filter).await? {
            groups.entry(entry.document_id.clone()).or_default().push(entry);
        }

        let mut batches: Vec<DocumentBatch> = groups
            .into_iter()
            .map(|(document_id, entries)| DocumentBatch {
                collection: collection.to_string(),
                document_id,
                entries,
            })
            .collect();
        batches.sort_by_key(|batch| batch.entries.first().map(|e| e.sequence).unwrap_or(0));
        Ok(batches)
    }

    /// Collections with at least one pending entry, sorted.
    pub async fn collections_with_pending(&self) -> Result<Vec<String>> {
        let mut collections: Vec<String> = self
            .load(&pending_filter())
            .await?
            .into_iter()
            .map(|entry| entry.collection)
            .collect();
        collections.sort();
        collections.dedup();
        Ok(collections)
    }

    /// Store operations marking `entries` synced.
    pub fn stage_synced(&self, entries: &[SyncQueueEntry]) -> Result<Vec<StoreOp>> {
        let now = now_millis();
        entries
            .iter()
            .map(|entry| {
                SyncQueueEntry {
                    synced: true,
                    synced_at: Some(now),
                    last_error: None,
                    next_attempt_at: None,
                    ..entry.clone()
                }
                .to_op()
            })
            .collect()
    }

    /// Mark entries as accepted by the server.
    pub async fn mark_synced(&self, entries: &[SyncQueueEntry]) -> Result<()> {
        let ops = self.stage_synced(entries)?;
        self.store.transaction(ops).await
    }

    /// Record a failed attempt for every entry of a document.
    ///
    /// Entries reaching `max_retries` attempts are flagged failed and stop
    /// being retried; the others wait until `next_attempt_at`.
    ///
    /// # Returns
    /// The new attempt count and whether the entries are now failed.
    pub async fn record_failure(
        &self,
        entries: &[SyncQueueEntry],
        error: &str,
        max_retries: u32,
        next_attempt_at: i64,
    ) -> Result<(u32, bool)> {
        let attempts = entries.iter().map(|e| e.attempts).max().unwrap_or(0) + 1;
        let failed = attempts >= max_retries;

        let ops = entries
            .iter()
            .map(|entry| {
                SyncQueueEntry {
                    attempts,
                    failed,
                    last_error: Some(error.to_string()),
                    next_attempt_at: (!failed).then_some(next_attempt_at),
                    ..entry.clone()
                }
                .to_op()
            })
            .collect::<Result<Vec<_>>>()?;
        self.store.transaction(ops).await?;

        if failed {
            warn!(attempts, error, "sync entries exhausted retries");
        }
        Ok((attempts, failed))
    }

    /// Store operations removing `entries`.
    pub fn stage_removal(&self, entries: &[SyncQueueEntry]) -> Vec<StoreOp> {
        entries
            .iter()
            .map(|entry| StoreOp::Delete {
                collection: QUEUE_COLLECTION.to_string(),
                id: entry.id.clone(),
            })
            .collect()
    }

    /// Store operations moving the deltas of `entries` onto server revision
    /// `sync_version`.
    pub fn stage_rebase(&self, entries: &[SyncQueueEntry], sync_version: u64) -> Result<Vec<StoreOp>> {
        entries
            .iter()
            .map(|entry| {
                let mut rebased = entry.clone();
                for delta in &mut rebased.deltas {
                    delta.sync_version = sync_version;
                }
                rebased.to_op()
            })
            .collect()
    }

    /// Build the entry replacing `entries` with one entry carrying `delta`,
    /// keeping the earliest sequence so ordering against later mutations
    /// is preserved.
    ///
    /// # Errors
    /// - `Error::InvalidInput` if `entries` is empty
    pub fn stage_replace(
        &self,
        entries: &[SyncQueueEntry],
        delta: Delta,
    ) -> Result<(SyncQueueEntry, Vec<StoreOp>)> {
        let first = entries
            .iter()
            .min_by_key(|e| e.sequence)
            .ok_or_else(|| Error::InvalidInput("no queue entries to replace".to_string()))?;

        let replacement = SyncQueueEntry {
            id: Uuid::new_v4().to_string(),
            deltas: vec![delta],
            attempts: 0,
            synced: false,
            synced_at: None,
            failed: false,
            last_error: None,
            next_attempt_at: None,
            ..first.clone()
        };

        let mut ops = self.stage_removal(entries);
        ops.push(replacement.to_op()?);
        Ok((replacement, ops))
    }

    /// Stage and persist a replacement; see [`Self::stage_replace`].
    pub async fn replace(&self, entries: &[SyncQueueEntry], delta: Delta) -> Result<SyncQueueEntry> {
        let (replacement, ops) = self.stage_replace(entries, delta)?;
        self.store.transaction(ops).await?;
        Ok(replacement)
    }

    /// Delete synced entries, all of them or those synced before `older_than`.
    pub async fn purge_synced(&self, older_than: Option<i64>) -> Result<usize> {
        let mut filter = Filter::eq("synced", true);
        if let Some(cutoff) = older_than {
            filter = filter.and(Filter::lt("syncedAt", cutoff));
        }
        let entries = self.load(&filter).await?;
        if entries.is_empty() {
            return Ok(0);
        }

        self.store.transaction(self.stage_removal(&entries)).await?;
        info!(count = entries.len(), "synced queue entries purged");
        Ok(entries.len())
    }

    /// Give failed entries another round of attempts.
    pub async fn reset_failed(&self, collection: Option<&str>) -> Result<usize> {
        let mut filter = Filter::eq("failed", true);
        if let Some(collection) = collection {
            filter = filter.and(Filter::eq("collection", collection));
        }
        let entries = self.load(&filter).await?;

        let ops = entries
            .iter()
            .map(|entry| {
                SyncQueueEntry {
                    attempts: 0,
                    failed: false,
                    next_attempt_at: None,
                    ..entry.clone()
                }
                .to_op()
            })
            .collect::<Result<Vec<_>>>()?;
        self.store.transaction(ops).await?;
        Ok(entries.len())
    }

    /// Entry counts by state.
    pub async fn summary(&self) -> Result<QueueSummary> {
        let mut summary = QueueSummary::default();
        for entry in self.entries(None).await? {
            if entry.synced {
                summary.synced += 1;
            } else if entry.failed {
                summary.failed += 1;
            } else {
                summary.pending += 1;
            }
        }
        Ok(summary)
    }

    async fn load(&self, filter: &Filter) -> Result<Vec<SyncQueueEntry>> {
        let mut entries = self
            .store
            .get_all(QUEUE_COLLECTION, filter)
            .await?
            .into_iter()
            .map(|(_, value)| serde_json::from_value::<SyncQueueEntry>(value).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.sequence);
        Ok(entries)
    }
}

fn pending_filter() -> Filter {
    Filter::eq("synced", false).and(Filter::eq("failed", false))
}
