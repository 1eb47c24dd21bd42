//! In-memory store for testing.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use parcelsync_common::{Error, Result};

use crate::filter::Filter;
use crate::store::{LocalStore, StoreOp, StoreStats};

type Collections = HashMap<String, BTreeMap<String, Value>>;

/// In-memory store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Writes can be made to fail on demand to exercise
/// storage error paths.
#[derive(Clone, Default)]
pub struct MemoryStore {
    collections: Arc<RwLock<Collections>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `Error::Storage` until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Collections>> {
        self.collections
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Collections>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("simulated write failure".to_string()));
        }
        self.collections
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn apply(collections: &mut Collections, op: StoreOp) {
        match op {
            StoreOp::Put {
                collection,
                id,
                value,
            } => {
                collections.entry(collection).or_default().insert(id, value);
            }
            StoreOp::Delete { collection, id } => {
                if let Some(docs) = collections.get_mut(&collection) {
                    docs.remove(&id);
                    if docs.is_empty() {
                        collections.remove(&collection);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let collections = self.read()?;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn get_all(&self, collection: &str, filter: &Filter) -> Result<Vec<(String, Value)>> {
        let collections = self.read()?;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .iter()
            .filter(|(_, doc)| filter.matches(doc))
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect())
    }

    async fn put(&self, collection: &str, id: &str, value: Value) -> Result<()> {
        let mut collections = self.write()?;
        Self::apply(
            &mut collections,
            StoreOp::Put {
                collection: collection.to_string(),
                id: id.to_string(),
                value,
            },
        );
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let mut collections = self.write()?;
        let existed = collections
            .get(collection)
            .is_some_and(|docs| docs.contains_key(id));
        Self::apply(
            &mut collections,
            StoreOp::Delete {
                collection: collection.to_string(),
                id: id.to_string(),
            },
        );
        Ok(existed)
    }

    async fn transaction(&self, ops: Vec<StoreOp>) -> Result<()> {
        // Single write guard, so readers never observe a partial batch.
        let mut collections = self.write()?;
        for op in ops {
            Self::apply(&mut collections, op);
        }
        Ok(())
    }

    async fn collections(&self) -> Result<Vec<String>> {
        let collections = self.read()?;
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let collections = self.read()?;
        let mut stats = StoreStats {
            collections: collections.len(),
            ..StoreStats::default()
        };
        for docs in collections.values() {
            stats.documents += docs.len();
            stats.approx_bytes += docs
                .values()
                .map(|doc| doc.to_string().len() as u64)
                .sum::<u64>();
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get() {
        let store = MemoryStore::new();
        store.put("parcels", "P-1", json!({"value": 1})).await.unwrap();

        let doc = store.get("parcels", "P-1").await.unwrap();
        assert_eq!(doc, Some(json!({"value": 1})));
        assert!(store.get("parcels", "P-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        store.put("parcels", "P-1", json!({})).await.unwrap();

        assert!(store.delete("parcels", "P-1").await.unwrap());
        assert!(!store.delete("parcels", "P-1").await.unwrap());
        assert!(store.collections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_all_filters_and_orders() {
        let store = MemoryStore::new();
        store.put("parcels", "b", json!({"zone": "R1"})).await.unwrap();
        store.put("parcels", "a", json!({"zone": "R1"})).await.unwrap();
        store.put("parcels", "c", json!({"zone": "C2"})).await.unwrap();

        let docs = store
            .get_all("parcels", &Filter::eq("zone", "R1"))
            .await
            .unwrap();
        let ids: Vec<_> = docs.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_transaction_is_all_or_nothing() {
        let store = MemoryStore::new();
        store
            .transaction(vec![
                StoreOp::Put {
                    collection: "parcels".into(),
                    id: "P-1".into(),
                    value: json!({"v": 1}),
                },
                StoreOp::Put {
                    collection: "_sync_queue".into(),
                    id: "q1".into(),
                    value: json!({"seq": 1}),
                },
            ])
            .await
            .unwrap();
        assert_eq!(store.stats().await.unwrap().documents, 2);

        store.set_fail_writes(true);
        let result = store
            .transaction(vec![StoreOp::Delete {
                collection: "parcels".into(),
                id: "P-1".into(),
            }])
            .await;
        assert!(matches!(result, Err(Error::Storage(_))));
        store.set_fail_writes(false);
        assert!(store.get("parcels", "P-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stats() {
        let store = MemoryStore::new();
        store.put("a", "1", json!({"x": 1})).await.unwrap();
        store.put("b", "1", json!({"x": 2})).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.collections, 2);
        assert_eq!(stats.documents, 2);
        assert!(stats.approx_bytes > 0);
    }
}
