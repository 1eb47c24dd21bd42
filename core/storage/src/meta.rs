//! Engine metadata kept in the store: client identity and pull cursors.

use serde_json::{json, Value};
use tracing::info;

use parcelsync_common::{ClientId, Result};

use crate::store::LocalStore;

/// Internal collection holding engine metadata.
pub const META_COLLECTION: &str = "_meta";

const CLIENT_ID_KEY: &str = "client_id";

/// Load the persisted client id, generating and storing one on first use.
pub async fn load_or_create_client_id(store: &dyn LocalStore) -> Result<ClientId> {
    if let Some(value) = store.get(META_COLLECTION, CLIENT_ID_KEY).await? {
        if let Some(id) = value.get("value").and_then(Value::as_str) {
            return ClientId::new(id);
        }
    }

    let id = ClientId::generate();
    store
        .put(META_COLLECTION, CLIENT_ID_KEY, json!({ "value": id.as_str() }))
        .await?;
    info!(client = %id, "generated client id");
    Ok(id)
}

/// Last server revision pulled for `collection`.
pub async fn load_cursor(store: &dyn LocalStore, collection: &str) -> Result<u64> {
    Ok(store
        .get(META_COLLECTION, &cursor_key(collection))
        .await?
        .and_then(|value| value.get("value").and_then(Value::as_u64))
        .unwrap_or(0))
}

pub async fn save_cursor(store: &dyn LocalStore, collection: &str, cursor: u64) -> Result<()> {
    store
        .put(META_COLLECTION, &cursor_key(collection), json!({ "value": cursor }))
        .await
}

fn cursor_key(collection: &str) -> String {
    format!("cursor:{}", collection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn test_client_id_is_stable() {
        let store = MemoryStore::new();
        let first = load_or_create_client_id(&store).await.unwrap();
        let second = load_or_create_client_id(&store).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_cursor_defaults_to_zero() {
        let store = MemoryStore::new();
        assert_eq!(load_cursor(&store, "parcels").await.unwrap(), 0);

        save_cursor(&store, "parcels", 42).await.unwrap();
        assert_eq!(load_cursor(&store, "parcels").await.unwrap(), 42);
        assert_eq!(load_cursor(&store, "permits").await.unwrap(), 0);
    }
}
