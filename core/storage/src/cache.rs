//! Local write cache.
//!
//! Every read and write of user records goes through [`WriteCache`]. Writes
//! are applied optimistically: the record is visible at once and tagged
//! dirty until the server confirms it. A small in-memory hot index keeps
//! recently touched records and its estimated footprint feeds the memory
//! probe of the reclaimer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info};

use parcelsync_common::{is_internal_collection, Error, RecordKey, Result};

use crate::filter::Filter;
use crate::record::{now_millis, Record, SyncFailure};
use crate::store::{LocalStore, StoreOp};

#[derive(Debug, Clone)]
struct HotEntry {
    record: Record,
    touched_at: i64,
    size: usize,
}

/// Size of the hot index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotFootprint {
    pub entries: usize,
    pub bytes: usize,
}

/// Child records whose parent no longer exists are orphans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanRule {
    pub child_collection: String,
    /// Document field holding the parent id.
    pub parent_field: String,
    pub parent_collection: String,
}

/// Optimistic record layer over a [`LocalStore`].
pub struct WriteCache {
    store: Arc<dyn LocalStore>,
    hot: RwLock<HashMap<RecordKey, HotEntry>>,
    /// Serializes commits with eviction so a record cannot be dirtied
    /// between an eviction's final check and its delete.
    commit_lock: Mutex<()>,
}

impl WriteCache {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            hot: RwLock::new(HashMap::new()),
            commit_lock: Mutex::new(()),
        }
    }

    /// Underlying store.
    pub fn store(&self) -> Arc<dyn LocalStore> {
        Arc::clone(&self.store)
    }

    /// Live record, `None` if absent or pending deletion.
    ///
    /// # Errors
    /// - `Error::InvalidInput` for an empty or internal collection name
    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        let key = RecordKey::new(collection, id)?;
        Ok(self.get_any(&key).await?.filter(Record::is_live))
    }

    /// Record including tombstones.
    pub async fn get_any(&self, key: &RecordKey) -> Result<Option<Record>> {
        if let Some(record) = self.hot_get(key) {
            return Ok(Some(record));
        }

        let Some(value) = self.store.get(&key.collection, &key.id).await? else {
            return Ok(None);
        };
        let record = Record::from_value(value)?;
        self.hot_insert(record.clone());
        Ok(Some(record))
    }

    /// Live records of a collection matching `filter`, ordered by id.
    ///
    /// Filter paths address record fields; document fields live under `data.`.
    pub async fn get_all(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>> {
        if collection.is_empty() || is_internal_collection(collection) {
            return Err(Error::InvalidInput(format!(
                "'{}' is not a user collection",
                collection
            )));
        }
        let filter = filter.clone().and(Filter::eq("pendingDelete", false));
        self.load_records(collection, &filter).await
    }

    /// Build the dirty record for a local write.
    ///
    /// Sync bookkeeping (`sync_version`, `essential`, open conflict) carries
    /// over from `current`.
    pub fn stage_write(
        &self,
        key: &RecordKey,
        data: Value,
        current: Option<&Record>,
    ) -> Result<(Record, StoreOp)> {
        let mut record = match current {
            Some(current) => Record {
                data,
                pending_delete: false,
                ..current.clone()
            },
            None => Record::new(key, data, 0),
        };
        record.dirty = true;
        record.updated_at = now_millis();
        let op = Self::put_op(&record)?;
        Ok((record, op))
    }

    /// Build the tombstone for a local delete.
    pub fn stage_delete(&self, current: &Record) -> Result<(Record, StoreOp)> {
        let record = Record {
            dirty: true,
            pending_delete: true,
            updated_at: now_millis(),
            ..current.clone()
        };
        let op = Self::put_op(&record)?;
        Ok((record, op))
    }

    /// Store operation persisting `record`.
    pub fn put_op(record: &Record) -> Result<StoreOp> {
        Ok(StoreOp::Put {
            collection: record.collection.clone(),
            id: record.id.clone(),
            value: record.to_value()?,
        })
    }

    /// Run `ops` in one store transaction and refresh the hot index.
    pub async fn commit(&self, ops: Vec<StoreOp>) -> Result<()> {
        let _guard = self.commit_lock.lock().await;
        self.apply(ops).await
    }

    /// Caller holds `commit_lock`.
    async fn apply(&self, ops: Vec<StoreOp>) -> Result<()> {
        self.store.transaction(ops.clone()).await?;

        for op in ops {
            match op {
                StoreOp::Put {
                    collection,
                    id,
                    value,
                } if !is_internal_collection(&collection) => {
                    match Record::from_value(value) {
                        Ok(record) => self.hot_insert(record),
                        Err(_) => self.hot_remove(&RecordKey::from_parts(collection, id)),
                    }
                }
                StoreOp::Delete { collection, id } if !is_internal_collection(&collection) => {
                    self.hot_remove(&RecordKey::from_parts(collection, id));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Persist one record.
    pub async fn put(&self, record: &Record) -> Result<()> {
        self.commit(vec![Self::put_op(record)?]).await
    }

    /// Replace the local copy with the server's canonical version.
    ///
    /// A `None` canonical document confirms a delete and removes the record.
    ///
    /// # Returns
    /// The confirmed record, or `None` after a delete.
    pub async fn confirm(
        &self,
        key: &RecordKey,
        canonical: Option<Value>,
        sync_version: u64,
    ) -> Result<Option<Record>> {
        let Some(data) = canonical else {
            self.remove(key).await?;
            return Ok(None);
        };

        let current = self.get_any(key).await?;
        let now = now_millis();
        let record = Record {
            data,
            sync_version,
            updated_at: now,
            last_synced: Some(now),
            dirty: false,
            pending_delete: false,
            failure: None,
            ..current.unwrap_or_else(|| Record::new(key, Value::Null, sync_version))
        };
        self.put(&record).await?;
        debug!(record = %key, version = sync_version, "record confirmed");
        Ok(Some(record))
    }

    /// Keep the record and note why its sync failed.
    ///
    /// A record that no longer exists is left alone.
    pub async fn mark_failed(&self, key: &RecordKey, error: &str, attempts: u32) -> Result<()> {
        let Some(mut record) = self.get_any(key).await? else {
            return Ok(());
        };
        record.failure = Some(SyncFailure {
            error: error.to_string(),
            attempts,
            at: now_millis(),
        });
        self.put(&record).await
    }

    /// Flag or clear an open manual review on the record.
    pub async fn mark_conflicted(&self, key: &RecordKey, conflicted: bool) -> Result<()> {
        let Some(mut record) = self.get_any(key).await? else {
            return Ok(());
        };
        if record.conflicted != conflicted {
            record.conflicted = conflicted;
            self.put(&record).await?;
        }
        Ok(())
    }

    /// Exempt the record from eviction, or make it evictable again.
    ///
    /// # Errors
    /// - `Error::NotFound` if the record does not exist
    pub async fn set_essential(&self, key: &RecordKey, essential: bool) -> Result<Record> {
        let mut record = self
            .get_any(key)
            .await?
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        record.essential = essential;
        self.put(&record).await?;
        Ok(record)
    }

    /// Hard-delete a record.
    pub async fn remove(&self, key: &RecordKey) -> Result<bool> {
        let removed = self.store.delete(&key.collection, &key.id).await?;
        self.hot_remove(key);
        Ok(removed)
    }

    /// User collections present in the store.
    pub async fn collections(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .collections()
            .await?
            .into_iter()
            .filter(|c| !is_internal_collection(c))
            .collect())
    }

    /// Drop settled records not touched since `cutoff` (epoch millis).
    pub async fn evict_expired(&self, cutoff: i64) -> Result<usize> {
        let mut candidates = Vec::new();
        for collection in self.collections().await? {
            for record in self.load_records(&collection, &evictable()).await? {
                let last_touched = record.updated_at.max(record.last_synced.unwrap_or(0));
                if last_touched < cutoff {
                    candidates.push(record);
                }
            }
        }
        self.evict(candidates, "expired").await
    }

    /// Cap each collection at `max_per_collection` records, oldest settled first.
    ///
    /// Dirty, queued, conflicted and essential records count toward the cap
    /// but are never removed, so a collection may stay above it.
    pub async fn evict_over_capacity(&self, max_per_collection: usize) -> Result<usize> {
        let mut evicted = Vec::new();
        for collection in self.collections().await? {
            let all = self.load_records(&collection, &Filter::All).await?;
            if all.len() <= max_per_collection {
                continue;
            }
            let excess = all.len() - max_per_collection;
            let mut candidates: Vec<Record> = all.into_iter().filter(Record::is_evictable).collect();
            candidates.sort_by_key(|r| (r.updated_at, r.id.clone()));
            evicted.extend(candidates.into_iter().take(excess));
        }
        self.evict(evicted, "over capacity").await
    }

    /// Drop settled child records whose parent record is gone.
    pub async fn remove_orphans(&self, rule: &OrphanRule) -> Result<usize> {
        let children = self
            .load_records(&rule.child_collection, &evictable())
            .await?;

        let mut orphans = Vec::new();
        for child in children {
            let Some(parent_id) = child.data.get(&rule.parent_field).and_then(Value::as_str) else {
                continue;
            };
            if self
                .store
                .get(&rule.parent_collection, parent_id)
                .await?
                .is_none()
            {
                orphans.push(child);
            }
        }
        self.evict(orphans, "orphaned").await
    }

    /// Forget clean hot entries last touched before `cutoff`.
    pub fn trim_hot_index(&self, cutoff: i64) -> usize {
        let mut hot = self.hot.write().unwrap_or_else(|e| e.into_inner());
        let before = hot.len();
        hot.retain(|_, entry| entry.record.dirty || entry.touched_at >= cutoff);
        before - hot.len()
    }

    /// Forget every clean hot entry.
    pub fn clear_hot_index(&self) -> usize {
        let mut hot = self.hot.write().unwrap_or_else(|e| e.into_inner());
        let before = hot.len();
        hot.retain(|_, entry| entry.record.dirty);
        before - hot.len()
    }

    /// Current hot index size.
    pub fn hot_footprint(&self) -> HotFootprint {
        let hot = self.hot.read().unwrap_or_else(|e| e.into_inner());
        HotFootprint {
            entries: hot.len(),
            bytes: hot.values().map(|entry| entry.size).sum(),
        }
    }

    async fn load_records(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>> {
        self.store
            .get_all(collection, filter)
            .await?
            .into_iter()
            .map(|(_, value)| Record::from_value(value))
            .collect()
    }

    /// Delete `candidates` that are unchanged since they were selected.
    ///
    /// Each candidate is re-read under `commit_lock`; one written in the
    /// meantime (dirty, pinned, or just touched) is kept.
    async fn evict(&self, candidates: Vec<Record>, reason: &str) -> Result<usize> {
        if candidates.is_empty() {
            return Ok(0);
        }

        let _guard = self.commit_lock.lock().await;
        let mut ops = Vec::new();
        for candidate in &candidates {
            let current = self
                .store
                .get(&candidate.collection, &candidate.id)
                .await?
                .map(Record::from_value)
                .transpose()?;
            match current {
                Some(record) if record.is_evictable() && record.updated_at == candidate.updated_at => {
                    ops.push(delete_op(&record));
                }
                _ => debug!(record = %candidate.key(), "eviction candidate changed, kept"),
            }
        }

        let count = ops.len();
        if count == 0 {
            return Ok(0);
        }
        self.apply(ops).await?;
        info!(count, reason, "records evicted");
        Ok(count)
    }

    fn hot_get(&self, key: &RecordKey) -> Option<Record> {
        let mut hot = self.hot.write().unwrap_or_else(|e| e.into_inner());
        hot.get_mut(key).map(|entry| {
            entry.touched_at = now_millis();
            entry.record.clone()
        })
    }

    fn hot_insert(&self, record: Record) {
        let size = record.estimated_size();
        let mut hot = self.hot.write().unwrap_or_else(|e| e.into_inner());
        hot.insert(
            record.key(),
            HotEntry {
                record,
                touched_at: now_millis(),
                size,
            },
        );
    }

    fn hot_remove(&self, key: &RecordKey) {
        let mut hot = self.hot.write().unwrap_or_else(|e| e.into_inner());
        hot.remove(key);
    }
}

fn evictable() -> Filter {
    Filter::And(vec![
        Filter::eq("dirty", false),
        Filter::eq("pendingDelete", false),
        Filter::eq("conflicted", false),
        Filter::eq("essential", false),
    ])
}

fn delete_op(record: &Record) -> StoreOp {
    StoreOp::Delete {
        collection: record.collection.clone(),
        id: record.id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    fn cache() -> WriteCache {
        WriteCache::new(Arc::new(MemoryStore::new()))
    }

    fn key(id: &str) -> RecordKey {
        RecordKey::new("parcels", id).unwrap()
    }

    async fn write(cache: &WriteCache, id: &str, data: Value) -> Record {
        let current = cache.get_any(&key(id)).await.unwrap();
        let (record, op) = cache.stage_write(&key(id), data, current.as_ref()).unwrap();
        cache.commit(vec![op]).await.unwrap();
        record
    }

    async fn settled(cache: &WriteCache, id: &str, updated_at: i64) {
        let mut record = Record::new(&key(id), json!({"id": id}), 1);
        record.updated_at = updated_at;
        cache.put(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_optimistic_write_is_visible_and_dirty() {
        let cache = cache();
        write(&cache, "P-1", json!({"zone": "R1"})).await;

        let record = cache.get("parcels", "P-1").await.unwrap().unwrap();
        assert!(record.dirty);
        assert_eq!(record.data["zone"], "R1");
    }

    #[tokio::test]
    async fn test_tombstone_hidden_until_confirmed() {
        let cache = cache();
        let record = write(&cache, "P-1", json!({"zone": "R1"})).await;
        let (_, op) = cache.stage_delete(&record).unwrap();
        cache.commit(vec![op]).await.unwrap();

        assert!(cache.get("parcels", "P-1").await.unwrap().is_none());
        assert!(cache.get_all("parcels", &Filter::All).await.unwrap().is_empty());
        assert!(cache.get_any(&key("P-1")).await.unwrap().unwrap().pending_delete);

        cache.confirm(&key("P-1"), None, 2).await.unwrap();
        assert!(cache.get_any(&key("P-1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_confirm_clears_dirty_and_failure() {
        let cache = cache();
        write(&cache, "P-1", json!({"zone": "R1"})).await;
        cache.mark_failed(&key("P-1"), "offline", 1).await.unwrap();
        assert!(cache.get("parcels", "P-1").await.unwrap().unwrap().failure.is_some());

        let confirmed = cache
            .confirm(&key("P-1"), Some(json!({"zone": "R1", "rev": 3})), 3)
            .await
            .unwrap()
            .unwrap();
        assert!(!confirmed.dirty);
        assert!(confirmed.failure.is_none());
        assert_eq!(confirmed.sync_version, 3);
        assert!(confirmed.last_synced.is_some());
    }

    #[tokio::test]
    async fn test_internal_collections_rejected() {
        let cache = cache();
        assert!(cache.get("_sync_queue", "x").await.is_err());
        assert!(cache.get_all("_meta", &Filter::All).await.is_err());
    }

    #[tokio::test]
    async fn test_get_all_filters_on_document_fields() {
        let cache = cache();
        write(&cache, "P-1", json!({"zone": "R1"})).await;
        write(&cache, "P-2", json!({"zone": "C2"})).await;

        let residential = cache
            .get_all("parcels", &Filter::eq("data.zone", "R1"))
            .await
            .unwrap();
        assert_eq!(residential.len(), 1);
        assert_eq!(residential[0].id, "P-1");
    }

    #[tokio::test]
    async fn test_evict_expired_spares_protected_records() {
        let cache = cache();
        settled(&cache, "old", 10).await;
        settled(&cache, "fresh", now_millis()).await;
        settled(&cache, "pinned", 10).await;
        cache.set_essential(&key("pinned"), true).await.unwrap();
        let mut dirty = write(&cache, "dirty", json!({})).await;
        dirty.updated_at = 10;
        cache.put(&dirty).await.unwrap();

        let evicted = cache.evict_expired(now_millis() - 1_000).await.unwrap();
        assert_eq!(evicted, 1);
        assert!(cache.get("parcels", "old").await.unwrap().is_none());
        assert!(cache.get("parcels", "fresh").await.unwrap().is_some());
        assert!(cache.get("parcels", "pinned").await.unwrap().is_some());
        assert!(cache.get("parcels", "dirty").await.unwrap().is_some());
    }

    /// Store whose collection scans take a while.
    struct SlowScan(MemoryStore);

    #[async_trait::async_trait]
    impl LocalStore for SlowScan {
        fn name(&self) -> &str {
            "slow-scan"
        }

        async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
            self.0.get(collection, id).await
        }

        async fn get_all(&self, collection: &str, filter: &Filter) -> Result<Vec<(String, Value)>> {
            if collection == "parcels" {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            self.0.get_all(collection, filter).await
        }

        async fn put(&self, collection: &str, id: &str, value: Value) -> Result<()> {
            self.0.put(collection, id, value).await
        }

        async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
            self.0.delete(collection, id).await
        }

        async fn transaction(&self, ops: Vec<StoreOp>) -> Result<()> {
            self.0.transaction(ops).await
        }

        async fn collections(&self) -> Result<Vec<String>> {
            self.0.collections().await
        }

        async fn stats(&self) -> Result<crate::store::StoreStats> {
            self.0.stats().await
        }
    }

    #[tokio::test]
    async fn test_eviction_spares_record_written_during_scan() {
        let cache = WriteCache::new(Arc::new(SlowScan(MemoryStore::new())));
        settled(&cache, "P-1", 1_000).await;

        let evicting = cache.evict_expired(now_millis() + 60_000);
        let writing = async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            write(&cache, "P-1", json!({"zone": "R9"})).await
        };
        let (evicted, _) = tokio::join!(evicting, writing);

        assert_eq!(evicted.unwrap(), 0);
        let record = cache.get("parcels", "P-1").await.unwrap().unwrap();
        assert!(record.dirty);
        assert_eq!(record.data, json!({"zone": "R9"}));
    }

    #[tokio::test]
    async fn test_evict_over_capacity_removes_oldest() {
        let cache = cache();
        settled(&cache, "a", 1).await;
        settled(&cache, "b", 2).await;
        settled(&cache, "c", 3).await;

        assert_eq!(cache.evict_over_capacity(2).await.unwrap(), 1);
        assert!(cache.get("parcels", "a").await.unwrap().is_none());
        assert!(cache.get("parcels", "c").await.unwrap().is_some());
        assert_eq!(cache.evict_over_capacity(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_orphans() {
        let cache = cache();
        let owner = RecordKey::new("owners", "O-1").unwrap();
        cache.put(&Record::new(&owner, json!({}), 1)).await.unwrap();
        let kept = RecordKey::new("assessments", "A-1").unwrap();
        let orphan = RecordKey::new("assessments", "A-2").unwrap();
        cache.put(&Record::new(&kept, json!({"ownerId": "O-1"}), 1)).await.unwrap();
        cache.put(&Record::new(&orphan, json!({"ownerId": "O-9"}), 1)).await.unwrap();

        let rule = OrphanRule {
            child_collection: "assessments".into(),
            parent_field: "ownerId".into(),
            parent_collection: "owners".into(),
        };
        assert_eq!(cache.remove_orphans(&rule).await.unwrap(), 1);
        assert!(cache.get_any(&kept).await.unwrap().is_some());
        assert!(cache.get_any(&orphan).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hot_index_trimming_keeps_dirty() {
        let cache = cache();
        write(&cache, "dirty", json!({"a": 1})).await;
        settled(&cache, "clean", 1).await;
        assert_eq!(cache.hot_footprint().entries, 2);
        assert!(cache.hot_footprint().bytes > 0);

        assert_eq!(cache.clear_hot_index(), 1);
        assert_eq!(cache.hot_footprint().entries, 1);
        assert_eq!(cache.trim_hot_index(i64::MAX), 0);
    }

    #[tokio::test]
    async fn test_set_essential_missing_record() {
        let cache = cache();
        let err = cache.set_essential(&key("nope"), true).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
