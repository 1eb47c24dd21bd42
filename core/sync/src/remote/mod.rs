//! Remote API the orchestrator talks to.
//!
//! - [`HttpRemote`]: JSON over HTTP with reqwest
//! - [`MemoryRemote`]: in-process server with version history, for tests and
//!   offline simulation

mod http;
mod memory;

pub use http::HttpRemote;
pub use memory::MemoryRemote;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use parcelsync_codec::Delta;
use parcelsync_common::Result;

/// One document's pending changes, sent as a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub collection: String,
    pub document_id: String,
    pub delta: Delta,
    pub client_id: String,
    /// Server revision the delta was computed against.
    pub sync_version: u64,
    pub timestamp: DateTime<Utc>,
}

/// Server verdict on a push.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Applied. `document` is the canonical result when the server returns it
    /// (absent after a delete).
    Accepted {
        document: Option<Value>,
        sync_version: u64,
    },
    /// Someone else changed the document since `PushRequest::sync_version`.
    /// `server_delta` goes from that revision to the server's current one.
    Conflict {
        server_delta: Delta,
        sync_version: u64,
    },
}

/// Entry of the server change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub document_id: String,
    /// Feed position; the pull cursor.
    pub sequence: u64,
    /// Document revision after the change.
    pub sync_version: u64,
    /// Document after the change, `None` when deleted.
    #[serde(default)]
    pub document: Option<Value>,
    /// Client that produced the change, if known.
    #[serde(default)]
    pub client_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Server endpoint for deltas.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    fn name(&self) -> &str;

    /// Send one document's merged delta.
    ///
    /// # Errors
    /// - `Error::Network` for transport or unexpected server failures
    /// - `Error::Timeout` when the request timed out
    async fn push_delta(&self, request: PushRequest) -> Result<PushOutcome>;

    /// Changes to `collection` after feed position `since`.
    async fn fetch_changes(&self, _collection: &str, _since: u64) -> Result<Vec<RemoteChange>> {
        Ok(Vec::new())
    }
}
