//! SQLite-backed store.
//!
//! Documents are stored as JSON text keyed by `(collection, id)`. Calls run on
//! the blocking pool so the async runtime never waits on disk I/O.

use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use parcelsync_common::{Error, Result};

use crate::filter::Filter;
use crate::store::{LocalStore, StoreOp, StoreStats};

/// Store persisted in a single SQLite database file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open a database.
    ///
    /// # Errors
    /// - Database creation or schema setup failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage_error)?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_error)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );
            "#,
        )
        .map_err(storage_error)?;

        info!("Local store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| Error::Storage("sqlite connection lock poisoned".to_string()))?;
            f(&mut *conn).map_err(storage_error)
        })
        .await
        .map_err(|e| Error::Storage(format!("sqlite task failed: {}", e)))?
    }
}

fn storage_error(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

fn parse_body(body: &str) -> rusqlite::Result<Value> {
    serde_json::from_str(body).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[async_trait]
impl LocalStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.with_conn(move |conn| {
            let body = conn.query_row(
                "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get::<_, String>(0),
            );
            match body {
                Ok(body) => parse_body(&body).map(Some),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn get_all(&self, collection: &str, filter: &Filter) -> Result<Vec<(String, Value)>> {
        let collection = collection.to_string();
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT id, body FROM documents WHERE collection = ?1 ORDER BY id")?;
            let rows = stmt.query_map([collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut docs = Vec::new();
            for row in rows {
                let (id, body) = row?;
                let doc = parse_body(&body)?;
                if filter.matches(&doc) {
                    docs.push((id, doc));
                }
            }
            Ok(docs)
        })
        .await
    }

    async fn put(&self, collection: &str, id: &str, value: Value) -> Result<()> {
        self.transaction(vec![StoreOp::Put {
            collection: collection.to_string(),
            id: id.to_string(),
            value,
        }])
        .await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn transaction(&self, ops: Vec<StoreOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let count = ops.len();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for op in ops {
                match op {
                    StoreOp::Put {
                        collection,
                        id,
                        value,
                    } => {
                        tx.execute(
                            "INSERT OR REPLACE INTO documents (collection, id, body) VALUES (?1, ?2, ?3)",
                            params![collection, id, value.to_string()],
                        )?;
                    }
                    StoreOp::Delete { collection, id } => {
                        tx.execute(
                            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                            params![collection, id],
                        )?;
                    }
                }
            }
            tx.commit()
        })
        .await?;
        debug!(ops = count, "transaction committed");
        Ok(())
    }

    async fn collections(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT collection FROM documents ORDER BY collection")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(names)
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(DISTINCT collection), COUNT(*), COALESCE(SUM(LENGTH(body)), 0) FROM documents",
                [],
                |row| {
                    Ok(StoreStats {
                        collections: row.get::<_, i64>(0)? as usize,
                        documents: row.get::<_, i64>(1)? as usize,
                        approx_bytes: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
        })
        .await
    }

    async fn compact(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch("VACUUM")).await?;
        info!("Local store compacted");
        Ok(())
    }
}
