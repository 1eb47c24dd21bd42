//! Local store trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use parcelsync_common::Result;

use crate::filter::Filter;

/// One write inside a store transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Put {
        collection: String,
        id: String,
        value: Value,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl StoreOp {
    /// Collection the operation writes to.
    pub fn collection(&self) -> &str {
        match self {
            StoreOp::Put { collection, .. } | StoreOp::Delete { collection, .. } => collection,
        }
    }
}

/// Size information used by the storage probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub collections: usize,
    pub documents: usize,
    /// Approximate serialized size of all documents.
    pub approx_bytes: u64,
}

/// Persistent document store with named collections.
///
/// All operations are async and may suspend on I/O. Implementations must make
/// `transaction` atomic: either every operation is applied or none is.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Get one document.
    ///
    /// # Returns
    /// `None` if the document does not exist.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Get all documents of a collection matching `filter`, ordered by id.
    async fn get_all(&self, collection: &str, filter: &Filter) -> Result<Vec<(String, Value)>>;

    /// Insert or replace a document.
    async fn put(&self, collection: &str, id: &str, value: Value) -> Result<()>;

    /// Delete a document.
    ///
    /// # Returns
    /// Whether a document was removed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    /// Apply several writes atomically.
    ///
    /// # Errors
    /// - Any failure leaves the store unchanged
    async fn transaction(&self, ops: Vec<StoreOp>) -> Result<()>;

    /// Names of collections that currently hold documents.
    async fn collections(&self) -> Result<Vec<String>>;

    /// Size information.
    async fn stats(&self) -> Result<StoreStats>;

    /// Reclaim space after large deletions. Default is a no-op.
    async fn compact(&self) -> Result<()> {
        Ok(())
    }
}
