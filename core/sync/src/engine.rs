//! Sync orchestrator.
//!
//! [`SyncEngine`] owns both halves of offline-first sync:
//! - the local mutation API: every write is applied optimistically to the
//!   write cache and its delta is enqueued in the same store transaction
//! - the sync pass: pending deltas are merged per document, sent to the
//!   remote API, and the outcome (accepted, conflict, transport failure)
//!   is folded back into the cache and the queue
//!
//! At most one pass runs at a time; a trigger arriving while a pass is in
//! flight is rejected, not queued. Mutations made during a pass are picked
//! up by the next one.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

use parcelsync_codec::{
    apply_delta, invert_delta, merge_deltas, Delta, DeltaCodec, DeltaContext, DeltaOptions,
};
use parcelsync_common::config::millis;
use parcelsync_common::{is_internal_collection, ClientId, ConfigHandle, Error, RecordKey, Result};
use parcelsync_reclaim::CleanupTask;
use parcelsync_storage::{
    load_cursor, load_or_create_client_id, now_millis, save_cursor, ConflictRecord, DocumentBatch,
    Filter, LocalStore, QueueSummary, Record, ReviewStore, StoreOp, SyncQueue, SyncQueueEntry,
    WriteCache,
};

use crate::config::{SyncConfig, SyncConfigUpdate};
use crate::conflict::{resolve_conflict, ResolutionOrigin};
use crate::connectivity::Connectivity;
use crate::events::{EventBus, SyncEvent};
use crate::remote::{PushOutcome, PushRequest, RemoteApi, RemoteChange};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::state::{SyncCounters, SyncState, SyncStats};

/// Why a pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    InProgress,
    Offline,
}

/// Per-collection tally of a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionReport {
    pub sent: usize,
    pub applied: usize,
    pub conflicts: usize,
    pub errors: usize,
    /// Documents left for later (open review, backoff pending, or blocked
    /// behind an entry that exhausted its retries).
    pub skipped: usize,
}

impl CollectionReport {
    fn record(&mut self, outcome: &DocumentOutcome) {
        match outcome {
            DocumentOutcome::Synced { .. } => self.sent += 1,
            DocumentOutcome::Resolved(_) => {
                self.conflicts += 1;
                self.applied += 1;
            }
            DocumentOutcome::ManualReview { .. } => self.conflicts += 1,
            DocumentOutcome::Failed { .. } | DocumentOutcome::Dropped | DocumentOutcome::Errored(_) => {
                self.errors += 1
            }
            DocumentOutcome::Applied | DocumentOutcome::Cancelled => self.applied += 1,
            DocumentOutcome::Ignored => self.skipped += 1,
        }
    }

    fn add(&mut self, other: &CollectionReport) {
        self.sent += other.sent;
        self.applied += other.applied;
        self.conflicts += other.conflicts;
        self.errors += other.errors;
        self.skipped += other.skipped;
    }
}

/// Result of [`SyncEngine::perform_incremental_sync`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub collections: BTreeMap<String, CollectionReport>,
    /// Set when the pass did not run at all.
    pub skipped: Option<SkipReason>,
    /// Due work remained when the pass ended.
    pub more_work: bool,
    #[serde(with = "millis")]
    pub duration: Duration,
}

impl SyncReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    /// Sum over all collections.
    pub fn totals(&self) -> CollectionReport {
        let mut totals = CollectionReport::default();
        for report in self.collections.values() {
            totals.add(report);
        }
        totals
    }
}

/// What happened to one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentOutcome {
    /// Server accepted the pending deltas.
    Synced { sync_version: u64 },
    /// Conflict resolved automatically.
    Resolved(ResolutionOrigin),
    /// Conflict parked for manual review; entries stay queued.
    ManualReview { conflict_id: String },
    /// Transport failure; entries retried after backoff unless `failed`.
    Failed { attempts: u32, failed: bool },
    /// Invalid deltas were dropped.
    Dropped,
    /// Created and deleted locally before reaching the server.
    Cancelled,
    /// Remote change applied locally.
    Applied,
    /// Remote change already known.
    Ignored,
    /// Local storage failed while handling the document.
    Errored(String),
}

/// Decision for a conflict under manual review.
#[derive(Debug, Clone, PartialEq)]
pub enum ManualChoice {
    /// Keep the local copy and send it on the next pass.
    KeepLocal,
    /// Adopt the server copy, discarding pending local changes.
    KeepServer,
    /// Replace the document with a hand-merged one.
    Replace(Value),
}

impl ManualChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManualChoice::KeepLocal => "keep-local",
            ManualChoice::KeepServer => "keep-server",
            ManualChoice::Replace(_) => "replace",
        }
    }
}

/// Where the settled document comes from.
enum Canonical {
    /// Document as the server has it (`None` when deleted).
    Server(Option<Value>),
    /// Server accepted without echoing; the local copy is canonical.
    Local,
}

enum Consume {
    Synced,
    Removed,
}

/// Final local state of a document after the server answered.
struct Settlement {
    key: RecordKey,
    consumed: Vec<SyncQueueEntry>,
    consume: Consume,
    canonical: Canonical,
    sync_version: u64,
    /// Resolution still to be sent, relative to the canonical document.
    unsent: Option<Delta>,
    extra_ops: Vec<StoreOp>,
    clear_conflict: bool,
}

impl Settlement {
    fn new(key: RecordKey, consumed: Vec<SyncQueueEntry>, canonical: Canonical, sync_version: u64) -> Self {
        Self {
            key,
            consumed,
            consume: Consume::Removed,
            canonical,
            sync_version,
            unsent: None,
            extra_ops: Vec::new(),
            clear_conflict: false,
        }
    }
}

/// Releases the single-pass gate on drop.
struct PassGate<'a>(&'a AtomicBool);

impl<'a> PassGate<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGate<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Offline-first sync engine.
pub struct SyncEngine {
    store: Arc<dyn LocalStore>,
    cache: Arc<WriteCache>,
    queue: Arc<SyncQueue>,
    reviews: ReviewStore,
    remote: Arc<dyn RemoteApi>,
    codec: DeltaCodec,
    config: ConfigHandle<SyncConfig>,
    client_id: ClientId,
    connectivity: Connectivity,
    events: EventBus,
    state: watch::Sender<SyncState>,
    in_flight: AtomicBool,
    counters: SyncCounters,
    storage_retry: RetryExecutor,
    /// Serializes read-modify-write of records and their queue entries.
    record_lock: Mutex<()>,
}

impl SyncEngine {
    /// Open the engine over `store`.
    ///
    /// Loads (or generates) the client id and resumes the queue sequence.
    ///
    /// # Errors
    /// - `Error::Config` if `config` is invalid
    /// - Storage errors while loading engine metadata
    pub async fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        connectivity: Connectivity,
        events: EventBus,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        let client_id = load_or_create_client_id(store.as_ref()).await?;
        let queue = Arc::new(SyncQueue::open(Arc::clone(&store)).await?);
        let cache = Arc::new(WriteCache::new(Arc::clone(&store)));
        let reviews = ReviewStore::new(Arc::clone(&store));
        let codec = DeltaCodec::new(config.codec_config());
        let (state, _) = watch::channel(SyncState::Idle);

        info!(
            client = %client_id,
            remote = remote.name(),
            store = store.name(),
            "sync engine ready"
        );

        Ok(Self {
            store,
            cache,
            queue,
            reviews,
            remote,
            codec,
            config: ConfigHandle::new(config),
            client_id,
            connectivity,
            events,
            state,
            in_flight: AtomicBool::new(false),
            counters: SyncCounters::default(),
            storage_retry: RetryExecutor::new(
                RetryConfig::new(2).with_initial_delay(Duration::from_millis(25)),
            ),
            record_lock: Mutex::new(()),
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn cache(&self) -> Arc<WriteCache> {
        Arc::clone(&self.cache)
    }

    pub fn queue(&self) -> Arc<SyncQueue> {
        Arc::clone(&self.queue)
    }

    pub fn store(&self) -> Arc<dyn LocalStore> {
        Arc::clone(&self.store)
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Read-only view of the orchestrator state.
    pub fn state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn config(&self) -> Arc<SyncConfig> {
        self.config.snapshot()
    }

    /// Merge `update` into the configuration and swap it in.
    ///
    /// # Errors
    /// - `Error::Config` if the result is invalid; the old config stays
    pub fn update_config(&self, update: SyncConfigUpdate) -> Result<Arc<SyncConfig>> {
        let updated = self.config.update(|config| update.apply_to(config))?;
        self.codec.set_config(updated.codec_config());
        info!(
            strategy = %updated.conflict_strategy,
            batch_size = updated.batch_size,
            max_retries = updated.max_retries,
            "sync configuration updated"
        );
        Ok(updated)
    }

    pub fn stats(&self) -> SyncStats {
        self.counters.snapshot(self.codec.stats())
    }

    pub async fn queue_summary(&self) -> Result<QueueSummary> {
        self.queue.summary().await
    }

    // ---- local mutation API ----

    /// Live record, `None` if absent or deleted locally.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        self.cache.get(collection, id).await
    }

    /// Live records of `collection` matching `filter`; document fields are
    /// addressed under `data.`.
    pub async fn get_all(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>> {
        self.cache.get_all(collection, filter).await
    }

    /// Create or replace a document.
    ///
    /// The record is visible immediately and marked dirty; its delta is
    /// queued in the same transaction.
    ///
    /// # Errors
    /// - `Error::InvalidInput` if `data` is not a JSON object or the
    ///   collection is internal
    pub async fn write(&self, collection: &str, id: &str, data: Value) -> Result<Record> {
        let key = RecordKey::new(collection, id)?;
        ensure_object(&data)?;
        let config = self.config.snapshot();

        let guard = self.record_lock.lock().await;
        let current = self.cache.get_any(&key).await?;
        let old = live_data(current.as_ref());
        let base_version = current.as_ref().map_or(0, |r| r.sync_version);

        let delta = self.codec.create(
            old.as_ref(),
            Some(&data),
            &DeltaContext::client(&key, self.client_id.as_str(), base_version),
            &config.delta_options(),
        )?;

        let Some(delta) = delta else {
            // Only excluded fields changed (or nothing did): store locally.
            let record = current.ok_or_else(|| Error::NotFound(key.to_string()))?;
            if record.data == data {
                return Ok(record);
            }
            let updated = Record {
                data,
                updated_at: now_millis(),
                ..record
            };
            self.commit(vec![WriteCache::put_op(&updated)?]).await?;
            return Ok(updated);
        };

        let (record, record_op) = self.cache.stage_write(&key, data, current.as_ref())?;
        let (entry, queue_op) = self.queue.stage(delta)?;
        self.commit(vec![queue_op, record_op]).await?;
        drop(guard);

        debug!(record = %key, sequence = entry.sequence, "local write queued");
        self.events.publish(SyncEvent::LocalMutation { key });
        Ok(record)
    }

    /// Delete a document locally; it stays as a tombstone until the server
    /// confirms.
    ///
    /// # Returns
    /// `false` if there was no live record.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let key = RecordKey::new(collection, id)?;
        let config = self.config.snapshot();

        let guard = self.record_lock.lock().await;
        let Some(current) = self.cache.get_any(&key).await?.filter(Record::is_live) else {
            return Ok(false);
        };

        let delta = self
            .codec
            .create(
                Some(&current.data),
                None,
                &DeltaContext::client(&key, self.client_id.as_str(), current.sync_version),
                &config.delta_options(),
            )?
            .ok_or_else(|| Error::InvalidInput(format!("no delete delta for {}", key)))?;

        let (_, record_op) = self.cache.stage_delete(&current)?;
        let (entry, queue_op) = self.queue.stage(delta)?;
        self.commit(vec![queue_op, record_op]).await?;
        drop(guard);

        debug!(record = %key, sequence = entry.sequence, "local delete queued");
        self.events.publish(SyncEvent::LocalMutation { key });
        Ok(true)
    }

    /// Exempt a record from eviction, or make it evictable again.
    pub async fn set_essential(&self, collection: &str, id: &str, essential: bool) -> Result<Record> {
        let key = RecordKey::new(collection, id)?;
        let _guard = self.record_lock.lock().await;
        self.cache.set_essential(&key, essential).await
    }

    // ---- sync pass ----

    /// Run one sync pass.
    ///
    /// `collections` defaults to the configured collections, or every
    /// collection with pending work. Per-document failures are recorded on
    /// the queue entries and in the report; they never fail the pass.
    ///
    /// # Errors
    /// - `Error::InvalidInput` for an internal or empty collection name
    /// - Local storage failures while listing pending work
    pub async fn perform_incremental_sync(&self, collections: Option<&[String]>) -> Result<SyncReport> {
        if !self.connectivity.is_online() {
            debug!("offline, sync pass skipped");
            return Ok(SyncReport::skipped(SkipReason::Offline));
        }
        let Some(_gate) = PassGate::acquire(&self.in_flight) else {
            debug!("sync pass already in flight");
            return Ok(SyncReport::skipped(SkipReason::InProgress));
        };

        let started = Instant::now();
        self.set_state(SyncState::Syncing);
        let result = self.run_pass(collections).await;
        self.counters.finish_pass();

        match result {
            Ok(mut report) => {
                report.duration = started.elapsed();
                let totals = report.totals();
                self.set_state(if totals.errors > 0 {
                    SyncState::Error
                } else {
                    SyncState::Idle
                });
                info!(
                    sent = totals.sent,
                    applied = totals.applied,
                    conflicts = totals.conflicts,
                    errors = totals.errors,
                    skipped = totals.skipped,
                    more_work = report.more_work,
                    duration = ?report.duration,
                    "sync pass finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!("sync pass failed: {}", e);
                self.set_state(SyncState::Error);
                Err(e)
            }
        }
    }

    async fn run_pass(&self, collections: Option<&[String]>) -> Result<SyncReport> {
        let config = self.config.snapshot();
        let targets = match collections {
            Some(collections) => collections.to_vec(),
            None if !config.collections.is_empty() => config.collections.clone(),
            None => self.queue.collections_with_pending().await?,
        };

        let mut report = SyncReport::default();
        let now = now_millis();

        for collection in targets {
            if collection.is_empty() || is_internal_collection(&collection) {
                return Err(Error::InvalidInput(format!(
                    "'{}' is not a user collection",
                    collection
                )));
            }

            let mut tally = CollectionReport::default();
            let mut ready = Vec::new();
            for batch in self.queue.pending_by_document(&collection).await? {
                if batch.is_blocked()
                    || !batch.is_due(now)
                    || self.reviews.open_for(&batch.key()).await?.is_some()
                {
                    tally.skipped += 1;
                    continue;
                }
                ready.push(batch);
            }

            for chunk in ready.chunks(config.batch_size) {
                let outcomes = join_all(chunk.iter().cloned().map(|batch| self.sync_document_logged(batch))).await;
                for outcome in &outcomes {
                    tally.record(outcome);
                }
            }
            report.collections.insert(collection, tally);
        }

        let touched: Vec<String> = report.collections.keys().cloned().collect();
        report.more_work = self.has_due_work(&touched).await?;
        Ok(report)
    }

    async fn sync_document_logged(&self, batch: DocumentBatch) -> DocumentOutcome {
        let key = batch.key();
        match self.sync_document(batch).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(record = %key, "sync failed locally: {}", e);
                SyncCounters::bump(&self.counters.errors);
                DocumentOutcome::Errored(e.to_string())
            }
        }
    }

    async fn has_due_work(&self, collections: &[String]) -> Result<bool> {
        let now = now_millis();
        for collection in collections {
            for batch in self.queue.pending_by_document(collection).await? {
                if !batch.is_blocked()
                    && batch.is_due(now)
                    && self.reviews.open_for(&batch.key()).await?.is_none()
                {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Send one document's pending entries and fold the answer back in.
    ///
    /// # Errors
    /// Local storage failures only; transport failures are recorded on the
    /// entries and reported as [`DocumentOutcome::Failed`].
    pub async fn sync_document(&self, batch: DocumentBatch) -> Result<DocumentOutcome> {
        let key = batch.key();
        let config = self.config.snapshot();

        if batch.is_blocked() {
            debug!(record = %key, "document waits for its failed entries to be retried");
            return Ok(DocumentOutcome::Failed {
                attempts: batch.attempts(),
                failed: true,
            });
        }

        let (valid, invalid): (Vec<SyncQueueEntry>, Vec<SyncQueueEntry>) = batch
            .entries
            .into_iter()
            .partition(|entry| entry.deltas.iter().all(|d| self.codec.validate(d)));

        if !invalid.is_empty() {
            error!(record = %key, count = invalid.len(), "dropping queue entries with invalid deltas");
            SyncCounters::bump(&self.counters.errors);
            let _guard = self.record_lock.lock().await;
            self.commit(self.queue.stage_removal(&invalid)).await?;
            if valid.is_empty() {
                self.cache.mark_failed(&key, "invalid delta dropped", 0).await?;
                return Ok(DocumentOutcome::Dropped);
            }
        }

        let deltas: Vec<Delta> = valid.iter().flat_map(|e| e.deltas.iter().cloned()).collect();
        let Some(merged) = merge_deltas(&deltas)? else {
            let _guard = self.record_lock.lock().await;
            let version = self.cache.get_any(&key).await?.map_or(0, |r| r.sync_version);
            self.settle(Settlement::new(key.clone(), valid, Canonical::Server(None), version))
                .await?;
            debug!(record = %key, "created and deleted offline, nothing to send");
            return Ok(DocumentOutcome::Cancelled);
        };

        let request = PushRequest {
            collection: key.collection.clone(),
            document_id: key.id.clone(),
            delta: self.codec.compress(&merged)?,
            client_id: self.client_id.to_string(),
            sync_version: merged.sync_version,
            timestamp: merged.timestamp,
        };

        debug!(record = %key, entries = valid.len(), base = merged.sync_version, "sending delta");
        match self.push(request, config.request_timeout).await {
            Ok(PushOutcome::Accepted { document, sync_version }) => {
                SyncCounters::bump(&self.counters.sent);
                let canonical = match document {
                    _ if merged.is_delete() => Canonical::Server(None),
                    Some(document) => Canonical::Server(Some(document)),
                    None => Canonical::Local,
                };

                let _guard = self.record_lock.lock().await;
                let mut settlement = Settlement::new(key.clone(), valid, canonical, sync_version);
                settlement.consume = Consume::Synced;
                self.settle(settlement).await?;

                debug!(record = %key, version = sync_version, "document synced");
                self.events.publish(SyncEvent::DocumentSynced { key, sync_version });
                Ok(DocumentOutcome::Synced { sync_version })
            }
            Ok(PushOutcome::Conflict {
                server_delta,
                sync_version,
            }) => {
                let entries = valid.clone();
                match self
                    .reconcile(key.clone(), valid, merged, server_delta, sync_version)
                    .await
                {
                    Err(e) if is_server_data_error(&e) => {
                        error!(record = %key, "server answer unusable: {}", e);
                        self.record_failure(&key, &entries, &e, &config).await
                    }
                    outcome => outcome,
                }
            }
            Err(e) => self.record_failure(&key, &valid, &e, &config).await,
        }
    }

    /// Record a failed attempt on `entries`, parking them as failed once
    /// `max_retries` is reached.
    async fn record_failure(
        &self,
        key: &RecordKey,
        entries: &[SyncQueueEntry],
        error: &Error,
        config: &SyncConfig,
    ) -> Result<DocumentOutcome> {
        SyncCounters::bump(&self.counters.errors);
        let message = error.to_string();
        let next_attempts = entries.iter().map(|e| e.attempts).max().unwrap_or(0) + 1;
        let next_attempt_at = config.retry.next_attempt_at(next_attempts, now_millis());

        let _guard = self.record_lock.lock().await;
        let (attempts, failed) = self
            .queue
            .record_failure(entries, &message, config.max_retries, next_attempt_at)
            .await?;
        self.cache.mark_failed(key, &message, attempts).await?;

        if failed {
            warn!(record = %key, attempts, "giving up on document until retried manually: {}", message);
        } else {
            warn!(record = %key, attempts, "sync attempt failed, will retry: {}", message);
        }
        Ok(DocumentOutcome::Failed { attempts, failed })
    }

    /// Resolve a conflict between queued local changes and the server.
    ///
    /// `merged` is the local delta and `server_delta` the server's changes;
    /// both are relative to the same base revision.
    async fn reconcile(
        &self,
        key: RecordKey,
        entries: Vec<SyncQueueEntry>,
        merged: Delta,
        server_delta: Delta,
        server_version: u64,
    ) -> Result<DocumentOutcome> {
        SyncCounters::bump(&self.counters.conflicts);
        self.set_state(SyncState::Conflict);
        let config = self.config.snapshot();
        let resolution = resolve_conflict(&merged, &server_delta, &config.resolve_options(&key.collection))?;

        if resolution.requires_manual_review {
            let reason = resolution
                .reason
                .unwrap_or_else(|| "manual review required".to_string());
            let _guard = self.record_lock.lock().await;
            let review = self
                .reviews
                .record(merged, server_delta, server_version, &reason)
                .await?;
            self.cache.mark_conflicted(&key, true).await?;
            SyncCounters::bump(&self.counters.manual_reviews);

            warn!(record = %key, conflict = %review.id, reason = %reason, "conflict needs manual review");
            self.events.publish(SyncEvent::ManualReviewRequired {
                key,
                conflict_id: review.id.clone(),
            });
            return Ok(DocumentOutcome::ManualReview {
                conflict_id: review.id,
            });
        }

        let origin = resolution.origin;
        let (server_doc, resolved_doc) = {
            let _guard = self.record_lock.lock().await;
            let base = self.local_base(&key, &entries, &merged).await?;
            let server_doc = self.codec.apply(base.as_ref(), &server_delta)?;
            let resolved_doc = match (&resolution.resolved, origin) {
                (_, ResolutionOrigin::Server) | (None, _) => server_doc.clone(),
                (Some(resolved), _) => self.codec.apply(base.as_ref(), resolved)?,
            };
            (server_doc, resolved_doc)
        };

        let rebased = match origin {
            ResolutionOrigin::Server => None,
            _ => self.codec.create(
                server_doc.as_ref(),
                resolved_doc.as_ref(),
                &DeltaContext::client(&key, self.client_id.as_str(), server_version),
                &config.delta_options(),
            )?,
        };

        let settlement = match rebased {
            None => Settlement::new(key.clone(), entries, Canonical::Server(server_doc), server_version),
            Some(rebased) => {
                let request = PushRequest {
                    collection: key.collection.clone(),
                    document_id: key.id.clone(),
                    delta: self.codec.compress(&rebased)?,
                    client_id: self.client_id.to_string(),
                    sync_version: server_version,
                    timestamp: rebased.timestamp,
                };
                match self.push(request, config.request_timeout).await {
                    Ok(PushOutcome::Accepted { document, sync_version }) => {
                        SyncCounters::bump(&self.counters.sent);
                        let canonical = if rebased.is_delete() {
                            None
                        } else {
                            document.or(resolved_doc)
                        };
                        Settlement::new(key.clone(), entries, Canonical::Server(canonical), sync_version)
                    }
                    other => {
                        match other {
                            Err(e) => warn!(record = %key, "resolved value not sent, queued: {}", e),
                            Ok(_) => warn!(record = %key, "server changed again, resolved value queued"),
                        }
                        let mut settlement =
                            Settlement::new(key.clone(), entries, Canonical::Server(server_doc), server_version);
                        settlement.unsent = Some(rebased);
                        settlement
                    }
                }
            }
        };

        {
            let _guard = self.record_lock.lock().await;
            self.settle(settlement).await?;
        }

        info!(record = %key, ?origin, reason = ?resolution.reason, "conflict resolved");
        self.events.publish(SyncEvent::ConflictResolved { key, origin });
        Ok(DocumentOutcome::Resolved(origin))
    }

    /// Server document that `entries` were based on. Caller holds
    /// `record_lock`.
    async fn local_base(
        &self,
        key: &RecordKey,
        entries: &[SyncQueueEntry],
        merged: &Delta,
    ) -> Result<Option<Value>> {
        let current = self.cache.get_any(key).await?;
        let later = self.later_entries(key, entries).await?;
        let local = unwind(live_data(current.as_ref()), &deltas_of(&later))?;
        unwind(local, std::slice::from_ref(merged))
    }

    /// Unsynced entries of `key` other than `consumed`, failed ones
    /// included: they are local state the server has not seen.
    async fn later_entries(&self, key: &RecordKey, consumed: &[SyncQueueEntry]) -> Result<Vec<SyncQueueEntry>> {
        let consumed: HashSet<&str> = consumed.iter().map(|e| e.id.as_str()).collect();
        Ok(self
            .queue
            .unsynced_for(key)
            .await?
            .into_iter()
            .filter(|e| !consumed.contains(e.id.as_str()))
            .collect())
    }

    /// Write the settled record and queue state in one transaction.
    ///
    /// Entries enqueued after `consumed` are replayed on top of the
    /// canonical document and moved onto the new server revision. Caller
    /// holds `record_lock`.
    async fn settle(&self, settlement: Settlement) -> Result<Option<Record>> {
        let Settlement {
            key,
            consumed,
            consume,
            canonical,
            sync_version,
            unsent,
            extra_ops,
            clear_conflict,
        } = settlement;

        let current = self.cache.get_any(&key).await?;
        let later = self.later_entries(&key, &consumed).await?;
        let later_deltas = deltas_of(&later);

        let mut doc = match canonical {
            Canonical::Server(doc) => doc,
            Canonical::Local => unwind(live_data(current.as_ref()), &later_deltas)?,
        };

        let mut ops = match consume {
            Consume::Synced => self.queue.stage_synced(&consumed)?,
            Consume::Removed => self.queue.stage_removal(&consumed),
        };
        let dirty = unsent.is_some() || !later.is_empty();

        if let Some(delta) = unsent {
            doc = apply_delta(doc.as_ref(), &delta)?;
            if consumed.is_empty() {
                ops.push(self.queue.stage(delta)?.1);
            } else {
                ops = self.queue.stage_replace(&consumed, delta)?.1;
            }
        }
        for delta in &later_deltas {
            doc = apply_delta(doc.as_ref(), delta)?;
        }
        ops.extend(self.queue.stage_rebase(&later, sync_version)?);

        let now = now_millis();
        let base = current.unwrap_or_else(|| Record::new(&key, Value::Object(Default::default()), sync_version));
        let record = match doc {
            None if !dirty => None,
            None => Some(Record {
                sync_version,
                dirty: true,
                pending_delete: true,
                updated_at: now,
                failure: None,
                ..base
            }),
            Some(data) => Some(Record {
                data,
                sync_version,
                dirty,
                pending_delete: false,
                updated_at: now,
                last_synced: Some(now),
                failure: None,
                ..base
            }),
        };

        let record = record.map(|mut r| {
            if clear_conflict {
                r.conflicted = false;
            }
            r
        });

        match &record {
            Some(record) => ops.push(WriteCache::put_op(record)?),
            None => ops.push(StoreOp::Delete {
                collection: key.collection.clone(),
                id: key.id.clone(),
            }),
        }
        ops.extend(extra_ops);

        self.commit(ops).await?;
        Ok(record)
    }

    // ---- remote changes ----

    /// Apply a change made on the server by someone else.
    ///
    /// Without pending local changes the server document replaces the local
    /// copy. Otherwise the change goes through conflict resolution exactly
    /// like a conflict reported by a push.
    ///
    /// # Errors
    /// - `Error::Validation` if the change carries a non-object document
    pub async fn handle_remote_change(&self, collection: &str, change: RemoteChange) -> Result<DocumentOutcome> {
        let key = RecordKey::new(collection, change.document_id.as_str())?;
        if let Some(document) = &change.document {
            ensure_object(document).map_err(|e| Error::Validation(e.to_string()))?;
        }

        let guard = self.record_lock.lock().await;
        let current = self.cache.get_any(&key).await?;
        if current
            .as_ref()
            .is_some_and(|record| change.sync_version <= record.sync_version)
        {
            debug!(record = %key, version = change.sync_version, "remote change already known");
            return Ok(DocumentOutcome::Ignored);
        }

        let pending = self.queue.unsynced_for(&key).await?;
        let merged = merge_deltas(&deltas_of(&pending))?;
        let Some(merged) = merged else {
            self.settle(Settlement::new(
                key.clone(),
                pending,
                Canonical::Server(change.document),
                change.sync_version,
            ))
            .await?;
            drop(guard);
            debug!(record = %key, version = change.sync_version, "remote change applied");
            self.events.publish(SyncEvent::RemoteApplied {
                key,
                sync_version: change.sync_version,
            });
            return Ok(DocumentOutcome::Applied);
        };

        let base = self.local_base(&key, &pending, &merged).await?;
        let server_delta = self.codec.create(
            base.as_ref(),
            change.document.as_ref(),
            &DeltaContext::server(&key, change.sync_version),
            &DeltaOptions::default(),
        )?;

        let Some(mut server_delta) = server_delta else {
            // Server content still matches our base; only the revision moved.
            let mut ops = self.queue.stage_rebase(&pending, change.sync_version)?;
            if let Some(record) = current {
                ops.push(WriteCache::put_op(&Record {
                    sync_version: change.sync_version,
                    ..record
                })?);
            }
            self.commit(ops).await?;
            return Ok(DocumentOutcome::Ignored);
        };
        server_delta.timestamp = change.timestamp;
        drop(guard);

        self.reconcile(key, pending, merged, server_delta, change.sync_version)
            .await
    }

    /// Poll the server change feed of `collection` from the stored cursor.
    ///
    /// # Returns
    /// Number of changes applied or reconciled locally.
    pub async fn pull_remote_changes(&self, collection: &str) -> Result<usize> {
        if !self.connectivity.is_online() {
            debug!(collection, "offline, pull skipped");
            return Ok(0);
        }

        let since = load_cursor(self.store.as_ref(), collection).await?;
        let timeout = self.config.snapshot().request_timeout;
        let changes = match tokio::time::timeout(timeout, self.remote.fetch_changes(collection, since)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout(format!("fetching changes of '{}'", collection))),
        };

        let mut cursor = since;
        let mut applied = 0;
        for change in changes {
            cursor = cursor.max(change.sequence);
            let document_id = change.document_id.clone();
            match self.handle_remote_change(collection, change).await {
                Ok(DocumentOutcome::Ignored) => {}
                Ok(_) => applied += 1,
                Err(e) => {
                    SyncCounters::bump(&self.counters.errors);
                    warn!(collection, document = %document_id, "remote change not applied: {}", e);
                }
            }
        }

        if cursor != since {
            save_cursor(self.store.as_ref(), collection, cursor).await?;
        }
        info!(collection, applied, cursor, "remote changes pulled");
        Ok(applied)
    }

    // ---- manual review ----

    /// Open conflicts, oldest first.
    pub async fn conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.reviews.list(false).await
    }

    /// Settle a conflict under manual review.
    ///
    /// # Returns
    /// The record after resolution, `None` if it ends up deleted.
    ///
    /// # Errors
    /// - `Error::NotFound` for an unknown conflict id
    /// - `Error::InvalidInput` if the conflict is already resolved or the
    ///   replacement is not a JSON object
    pub async fn resolve_manually(&self, conflict_id: &str, choice: ManualChoice) -> Result<Option<Record>> {
        let review = self
            .reviews
            .get(conflict_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {}", conflict_id)))?;
        if review.resolved {
            return Err(Error::InvalidInput(format!(
                "conflict {} is already resolved",
                conflict_id
            )));
        }
        if let ManualChoice::Replace(value) = &choice {
            ensure_object(value)?;
        }

        let key = review.key();
        let config = self.config.snapshot();

        let guard = self.record_lock.lock().await;
        let current = self.cache.get_any(&key).await?;
        let pending = self.queue.unsynced_for(&key).await?;
        let local = live_data(current.as_ref());
        let base = unwind(local.clone(), &deltas_of(&pending))?;
        let server_doc = self.codec.apply(base.as_ref(), &review.remote_delta)?;

        let label = choice.as_str();
        let target = match choice {
            ManualChoice::KeepServer => server_doc.clone(),
            ManualChoice::KeepLocal => local,
            ManualChoice::Replace(value) => Some(value),
        };
        let unsent = self.codec.create(
            server_doc.as_ref(),
            target.as_ref(),
            &DeltaContext::client(&key, self.client_id.as_str(), review.remote_sync_version),
            &config.delta_options(),
        )?;
        let queued = unsent.is_some();

        let mut settlement = Settlement::new(
            key.clone(),
            pending,
            Canonical::Server(server_doc),
            review.remote_sync_version,
        );
        settlement.unsent = unsent;
        settlement.extra_ops = vec![self.reviews.stage_resolved(&review, label)?];
        settlement.clear_conflict = true;
        let record = self.settle(settlement).await?;
        drop(guard);

        info!(record = %key, conflict = %review.id, choice = label, "conflict resolved manually");
        if queued {
            self.events.publish(SyncEvent::LocalMutation { key });
        }
        Ok(record)
    }

    /// Give failed entries another round of attempts.
    pub async fn retry_failed(&self, collection: Option<&str>) -> Result<usize> {
        let reset = self.queue.reset_failed(collection).await?;
        if reset > 0 {
            info!(count = reset, "failed entries reset for retry");
        }
        Ok(reset)
    }

    /// Reclaimer participant purging synced queue entries.
    pub fn cleanup_participant(&self) -> Arc<dyn CleanupTask> {
        Arc::new(QueueCleanup {
            queue: Arc::clone(&self.queue),
        })
    }

    // ---- helpers ----

    async fn push(&self, request: PushRequest, timeout: Duration) -> Result<PushOutcome> {
        match tokio::time::timeout(timeout, self.remote.push_delta(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("push exceeded {:?}", timeout))),
        }
    }

    /// Commit through the cache, retrying transient storage failures.
    async fn commit(&self, ops: Vec<StoreOp>) -> Result<()> {
        let cache = Arc::clone(&self.cache);
        self.storage_retry
            .execute(|| {
                let cache = Arc::clone(&cache);
                let ops = ops.clone();
                async move { cache.commit(ops).await }
            })
            .await
    }

    fn set_state(&self, state: SyncState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(%state, "sync state changed");
            self.events.publish(SyncEvent::StateChanged(state));
        }
    }
}

struct QueueCleanup {
    queue: Arc<SyncQueue>,
}

#[async_trait]
impl CleanupTask for QueueCleanup {
    async fn cleanup(&self) -> Result<usize> {
        self.queue.purge_synced(None).await
    }
}

fn ensure_object(data: &Value) -> Result<()> {
    if data.is_object() {
        Ok(())
    } else {
        Err(Error::InvalidInput("documents must be JSON objects".to_string()))
    }
}

/// Failures caused by what the server sent rather than by local state.
fn is_server_data_error(error: &Error) -> bool {
    matches!(
        error,
        Error::Validation(_) | Error::Serialization(_) | Error::Compression(_)
    )
}

fn live_data(record: Option<&Record>) -> Option<Value> {
    record.filter(|r| r.is_live()).map(|r| r.data.clone())
}

fn deltas_of(entries: &[SyncQueueEntry]) -> Vec<Delta> {
    entries.iter().flat_map(|e| e.deltas.iter().cloned()).collect()
}

/// Undo `deltas` (given in enqueue order) on top of `doc`.
fn unwind(mut doc: Option<Value>, deltas: &[Delta]) -> Result<Option<Value>> {
    for delta in deltas.iter().rev() {
        doc = apply_delta(doc.as_ref(), &invert_delta(delta)?)?;
    }
    Ok(doc)
}
