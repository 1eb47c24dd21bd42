//! Local persistence for ParcelSync.
//!
//! This module provides the local store abstraction and everything the sync
//! engine keeps in it:
//! - `LocalStore` trait with in-memory and SQLite backends
//! - `WriteCache`, the optimistic record layer all reads and writes go through
//! - `SyncQueue`, the ordered queue of pending deltas
//! - `ReviewStore`, conflicts awaiting manual resolution
//!
//! # Design Principles
//! - Records and pending work live in separate collections
//! - Multi-record changes are committed in one store transaction
//! - Eviction never touches dirty, queued or conflicted records

pub mod cache;
pub mod filter;
pub mod memory;
pub mod meta;
pub mod queue;
pub mod record;
pub mod review;
pub mod sqlite;
pub mod store;

pub use cache::{HotFootprint, OrphanRule, WriteCache};
pub use filter::Filter;
pub use memory::MemoryStore;
pub use meta::{load_cursor, load_or_create_client_id, save_cursor, META_COLLECTION};
pub use queue::{DocumentBatch, QueueSummary, SyncQueue, SyncQueueEntry, QUEUE_COLLECTION};
pub use record::{now_millis, Record, SyncFailure};
pub use review::{ConflictRecord, ReviewStore, CONFLICT_COLLECTION};
pub use sqlite::SqliteStore;
pub use store::{LocalStore, StoreOp, StoreStats};
