//! Conflicts awaiting manual review.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use parcelsync_codec::Delta;
use parcelsync_common::{Error, RecordKey, Result};

use crate::filter::Filter;
use crate::record::now_millis;
use crate::store::{LocalStore, StoreOp};

/// Internal collection holding conflict records.
pub const CONFLICT_COLLECTION: &str = "_conflicts";

/// A conflict the resolver could not settle automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub collection: String,
    pub document_id: String,
    pub local_delta: Delta,
    pub remote_delta: Delta,
    pub remote_sync_version: u64,
    pub reason: String,
    pub detected_at: i64,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub resolved_at: Option<i64>,
    /// How the conflict was settled (e.g., "keep-local").
    #[serde(default)]
    pub resolution: Option<String>,
}

impl ConflictRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::from_parts(self.collection.clone(), self.document_id.clone())
    }
}

/// Review queue backed by the `_conflicts` collection.
pub struct ReviewStore {
    store: Arc<dyn LocalStore>,
}

impl ReviewStore {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Record a conflict for review.
    ///
    /// A document has at most one open review; a newer conflict for the
    /// same document updates it in place.
    pub async fn record(
        &self,
        local_delta: Delta,
        remote_delta: Delta,
        remote_sync_version: u64,
        reason: &str,
    ) -> Result<ConflictRecord> {
        let key = local_delta.record_key();
        let id = match self.open_for(&key).await? {
            Some(existing) => existing.id,
            None => Uuid::new_v4().to_string(),
        };

        let record = ConflictRecord {
            id,
            collection: key.collection.clone(),
            document_id: key.id.clone(),
            local_delta,
            remote_delta,
            remote_sync_version,
            reason: reason.to_string(),
            detected_at: now_millis(),
            resolved: false,
            resolved_at: None,
            resolution: None,
        };
        self.save(&record).await?;
        info!(record = %key, reason, "conflict queued for manual review");
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ConflictRecord>> {
        self.store
            .get(CONFLICT_COLLECTION, id)
            .await?
            .map(|value| serde_json::from_value(value).map_err(Error::from))
            .transpose()
    }

    /// Open review for a document, if any.
    pub async fn open_for(&self, key: &RecordKey) -> Result<Option<ConflictRecord>> {
        let filter = Filter::eq("collection", key.collection.as_str())
            .and(Filter::eq("documentId", key.id.as_str()))
            .and(Filter::eq("resolved", false));
        Ok(self.load(&filter).await?.into_iter().next())
    }

    /// Reviews ordered by detection time.
    pub async fn list(&self, include_resolved: bool) -> Result<Vec<ConflictRecord>> {
        let filter = if include_resolved {
            Filter::All
        } else {
            Filter::eq("resolved", false)
        };
        self.load(&filter).await
    }

    /// Store operation closing a review.
    pub fn stage_resolved(&self, record: &ConflictRecord, resolution: &str) -> Result<StoreOp> {
        let resolved = ConflictRecord {
            resolved: true,
            resolved_at: Some(now_millis()),
            resolution: Some(resolution.to_string()),
            ..record.clone()
        };
        Ok(StoreOp::Put {
            collection: CONFLICT_COLLECTION.to_string(),
            id: resolved.id.clone(),
            value: serde_json::to_value(&resolved)?,
        })
    }

    /// Delete resolved reviews, all of them or those resolved before `older_than`.
    pub async fn purge_resolved(&self, older_than: Option<i64>) -> Result<usize> {
        let mut filter = Filter::eq("resolved", true);
        if let Some(cutoff) = older_than {
            filter = filter.and(Filter::lt("resolvedAt", cutoff));
        }
        let records = self.load(&filter).await?;
        let ops = records
            .iter()
            .map(|record| StoreOp::Delete {
                collection: CONFLICT_COLLECTION.to_string(),
                id: record.id.clone(),
            })
            .collect::<Vec<_>>();
        if !ops.is_empty() {
            self.store.transaction(ops).await?;
            info!(count = records.len(), "resolved conflicts purged");
        }
        Ok(records.len())
    }

    async fn save(&self, record: &ConflictRecord) -> Result<()> {
        self.store
            .put(CONFLICT_COLLECTION, &record.id, serde_json::to_value(record)?)
            .await
    }

    async fn load(&self, filter: &Filter) -> Result<Vec<ConflictRecord>> {
        let mut records = self
            .store
            .get_all(CONFLICT_COLLECTION, filter)
            .await?
            .into_iter()
            .map(|(_, value)| serde_json::from_value::<ConflictRecord>(value).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(|a, b| a.detected_at.cmp(&b.detected_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use parcelsync_codec::{create_delta, DeltaContext, DeltaOptions};
    use serde_json::json;

    fn pair() -> (Delta, Delta) {
        let key = RecordKey::new("parcels", "P-1").unwrap();
        let base = json!({"owner": "Ada"});
        let local = create_delta(
            Some(&base),
            Some(&json!({"owner": "Bo"})),
            &DeltaContext::client(&key, "client-a", 1),
            &DeltaOptions::default(),
        )
        .unwrap()
        .unwrap();
        let remote = create_delta(
            Some(&base),
            None,
            &DeltaContext::server(&key, 2),
            &DeltaOptions::default(),
        )
        .unwrap()
        .unwrap();
        (local, remote)
    }

    #[tokio::test]
    async fn test_one_open_review_per_document() {
        let reviews = ReviewStore::new(Arc::new(MemoryStore::new()));
        let (local, remote) = pair();

        let first = reviews
            .record(local.clone(), remote.clone(), 2, "delete vs update")
            .await
            .unwrap();
        let second = reviews.record(local, remote, 3, "delete vs update").await.unwrap();
        assert_eq!(first.id, second.id);

        let open = reviews.list(false).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].remote_sync_version, 3);
        assert!(reviews.open_for(&first.key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_resolve_and_purge() {
        let store = Arc::new(MemoryStore::new());
        let reviews = ReviewStore::new(store.clone());
        let (local, remote) = pair();
        let record = reviews.record(local, remote, 2, "both deleted").await.unwrap();

        let op = reviews.stage_resolved(&record, "keep-server").unwrap();
        store.transaction(vec![op]).await.unwrap();

        let stored = reviews.get(&record.id).await.unwrap().unwrap();
        assert!(stored.resolved);
        assert_eq!(stored.resolution.as_deref(), Some("keep-server"));
        assert!(reviews.open_for(&record.key()).await.unwrap().is_none());

        assert_eq!(reviews.purge_resolved(None).await.unwrap(), 1);
        assert!(reviews.list(true).await.unwrap().is_empty());
    }
}
