//! In-process remote server for testing and simulation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use parcelsync_codec::{apply_delta, create_delta, DeltaContext, DeltaOptions};
use parcelsync_common::{Error, RecordKey, Result};

use super::{PushOutcome, PushRequest, RemoteApi, RemoteChange};

#[derive(Debug, Clone)]
struct Revision {
    version: u64,
    document: Option<Value>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ServerState {
    documents: HashMap<RecordKey, Vec<Revision>>,
    feed: Vec<(String, RemoteChange)>,
}

/// Remote server kept in memory.
///
/// Every accepted change creates a new document revision. A push based on
/// an older revision is answered with a conflict carrying the server's
/// changes since that revision. Connectivity, failures and latency can be
/// simulated.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<ServerState>,
    offline: AtomicBool,
    fail_next: AtomicU32,
    latency_ms: AtomicU64,
    pushes: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every push by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
        self
    }

    /// Refuse every request with a network error while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` pushes with a network error.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Pushes received, including failed ones.
    pub fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::SeqCst)
    }

    /// Highest number of pushes observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Current server copy.
    pub fn document(&self, collection: &str, id: &str) -> Option<Value> {
        let state = self.lock().ok()?;
        state
            .documents
            .get(&RecordKey::from_parts(collection, id))
            .and_then(|revisions| revisions.last())
            .and_then(|revision| revision.document.clone())
    }

    /// Current revision number, 0 if the document never existed.
    pub fn version(&self, collection: &str, id: &str) -> u64 {
        self.lock()
            .ok()
            .and_then(|state| {
                state
                    .documents
                    .get(&RecordKey::from_parts(collection, id))
                    .and_then(|revisions| revisions.last())
                    .map(|revision| revision.version)
            })
            .unwrap_or(0)
    }

    /// Change a document on the server as another client would.
    ///
    /// # Returns
    /// The new revision number.
    pub fn server_edit(&self, collection: &str, id: &str, document: Option<Value>) -> Result<u64> {
        self.server_edit_at(collection, id, document, Utc::now())
    }

    /// [`Self::server_edit`] with an explicit edit time.
    pub fn server_edit_at(
        &self,
        collection: &str,
        id: &str,
        document: Option<Value>,
        timestamp: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.lock()?;
        let key = RecordKey::from_parts(collection, id);
        Ok(Self::commit(&mut state, &key, document, timestamp, None))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ServerState>> {
        self.state
            .lock()
            .map_err(|_| Error::Storage("memory remote lock poisoned".to_string()))
    }

    fn commit(
        state: &mut ServerState,
        key: &RecordKey,
        document: Option<Value>,
        timestamp: DateTime<Utc>,
        client_id: Option<String>,
    ) -> u64 {
        let revisions = state.documents.entry(key.clone()).or_default();
        let version = revisions.last().map(|r| r.version).unwrap_or(0) + 1;
        revisions.push(Revision {
            version,
            document: document.clone(),
            timestamp,
        });

        let sequence = state.feed.len() as u64 + 1;
        state.feed.push((
            key.collection.clone(),
            RemoteChange {
                document_id: key.id.clone(),
                sequence,
                sync_version: version,
                document,
                client_id,
                timestamp,
            },
        ));
        version
    }

    fn handle_push(&self, request: PushRequest) -> Result<PushOutcome> {
        let mut state = self.lock()?;
        let key = RecordKey::from_parts(request.collection.clone(), request.document_id.clone());

        let (current_version, current, current_at) = match state
            .documents
            .get(&key)
            .and_then(|revisions| revisions.last())
        {
            Some(r) => (r.version, r.document.clone(), r.timestamp),
            None => (0, None, request.timestamp),
        };

        if request.sync_version != current_version {
            let base = state
                .documents
                .get(&key)
                .and_then(|revisions| revisions.iter().find(|r| r.version == request.sync_version))
                .and_then(|r| r.document.clone());

            let server_delta = create_delta(
                base.as_ref(),
                current.as_ref(),
                &DeltaContext::server(&key, current_version),
                &DeltaOptions::default(),
            )?;

            if let Some(mut server_delta) = server_delta {
                server_delta.timestamp = current_at;
                debug!(record = %key, base = request.sync_version, current = current_version, "push conflicts");
                return Ok(PushOutcome::Conflict {
                    server_delta,
                    sync_version: current_version,
                });
            }
        }

        let document = apply_delta(current.as_ref(), &request.delta)
            .map_err(|e| Error::Validation(format!("server rejected delta: {}", e)))?;
        let sync_version = Self::commit(
            &mut state,
            &key,
            document.clone(),
            request.timestamp,
            Some(request.client_id),
        );
        Ok(PushOutcome::Accepted {
            document,
            sync_version,
        })
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn push_delta(&self, request: PushRequest) -> Result<PushOutcome> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let result = if self.offline.load(Ordering::SeqCst) {
            Err(Error::Network("server unreachable".to_string()))
        } else if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(Error::Network("simulated server failure".to_string()))
        } else {
            self.handle_push(request)
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn fetch_changes(&self, collection: &str, since: u64) -> Result<Vec<RemoteChange>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network("server unreachable".to_string()));
        }
        let state = self.lock()?;
        Ok(state
            .feed
            .iter()
            .filter(|(c, change)| c == collection && change.sequence > since)
            .map(|(_, change)| change.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parcelsync_codec::Delta;
    use serde_json::json;

    fn push(key: &RecordKey, old: Option<&Value>, new: Option<&Value>, version: u64) -> PushRequest {
        let delta: Delta = create_delta(
            old,
            new,
            &DeltaContext::client(key, "client-a", version),
            &DeltaOptions::default(),
        )
        .unwrap()
        .unwrap();
        PushRequest {
            collection: key.collection.clone(),
            document_id: key.id.clone(),
            client_id: "client-a".into(),
            sync_version: version,
            timestamp: delta.timestamp,
            delta,
        }
    }

    #[tokio::test]
    async fn test_accepts_push_on_current_version() {
        let remote = MemoryRemote::new();
        let key = RecordKey::new("parcels", "P-1").unwrap();

        let outcome = remote
            .push_delta(push(&key, None, Some(&json!({"zone": "R1"})), 0))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PushOutcome::Accepted {
                document: Some(json!({"zone": "R1"})),
                sync_version: 1
            }
        );
        assert_eq!(remote.version("parcels", "P-1"), 1);
    }

    #[tokio::test]
    async fn test_stale_push_gets_server_delta() {
        let remote = MemoryRemote::new();
        let key = RecordKey::new("parcels", "P-1").unwrap();
        remote.server_edit("parcels", "P-1", Some(json!({"zone": "R1"}))).unwrap();
        remote.server_edit("parcels", "P-1", Some(json!({"zone": "C2"}))).unwrap();

        let outcome = remote
            .push_delta(push(&key, Some(&json!({"zone": "R1"})), Some(&json!({"zone": "I1"})), 1))
            .await
            .unwrap();
        let PushOutcome::Conflict { server_delta, sync_version } = outcome else {
            panic!("expected conflict");
        };
        assert_eq!(sync_version, 2);
        assert_eq!(
            apply_delta(Some(&json!({"zone": "R1"})), &server_delta).unwrap(),
            Some(json!({"zone": "C2"}))
        );
    }

    #[tokio::test]
    async fn test_offline_and_injected_failures() {
        let remote = MemoryRemote::new();
        let key = RecordKey::new("parcels", "P-1").unwrap();

        remote.set_offline(true);
        assert!(remote.push_delta(push(&key, None, Some(&json!({})), 0)).await.is_err());
        remote.set_offline(false);

        remote.fail_next(1);
        assert!(remote.push_delta(push(&key, None, Some(&json!({"a": 1})), 0)).await.is_err());
        assert!(remote.push_delta(push(&key, None, Some(&json!({"a": 1})), 0)).await.is_ok());
        assert_eq!(remote.push_count(), 3);
    }

    #[tokio::test]
    async fn test_change_feed_since_cursor() {
        let remote = MemoryRemote::new();
        remote.server_edit("parcels", "P-1", Some(json!({"v": 1}))).unwrap();
        remote.server_edit("permits", "B-1", Some(json!({"v": 1}))).unwrap();
        remote.server_edit("parcels", "P-1", None).unwrap();

        let all = remote.fetch_changes("parcels", 0).await.unwrap();
        assert_eq!(all.len(), 2);
        let later = remote.fetch_changes("parcels", all[0].sequence).await.unwrap();
        assert_eq!(later.len(), 1);
        assert!(later[0].document.is_none());
    }
}
