//! Common types used throughout ParcelSync.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix reserved for engine-owned collections (queue, conflicts, metadata).
pub const INTERNAL_PREFIX: char = '_';

/// Check whether a collection name is reserved for engine bookkeeping.
pub fn is_internal_collection(collection: &str) -> bool {
    collection.starts_with(INTERNAL_PREFIX)
}

/// Stable identifier of this client installation.
///
/// Generated once and persisted by the local store; the remote API uses it
/// to attribute deltas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Create a ClientId from an existing string.
    ///
    /// # Preconditions
    /// - `id` must be non-empty
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "ClientId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Generate a fresh random client id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one record: a document id scoped to a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub collection: String,
    pub id: String,
}

impl RecordKey {
    /// Create a key for a user record.
    ///
    /// # Preconditions
    /// - `collection` and `id` must be non-empty
    /// - `collection` must not use the internal prefix
    ///
    /// # Errors
    /// - Returns error if either part is empty or the collection is reserved
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> crate::Result<Self> {
        let collection = collection.into();
        let id = id.into();
        if collection.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Collection name cannot be empty".to_string(),
            ));
        }
        if is_internal_collection(&collection) {
            return Err(crate::Error::InvalidInput(format!(
                "Collection '{}' is reserved",
                collection
            )));
        }
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Record id cannot be empty".to_string(),
            ));
        }
        Ok(Self { collection, id })
    }

    /// Build a key without validation, for keys read back from the store.
    pub fn from_parts(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}
