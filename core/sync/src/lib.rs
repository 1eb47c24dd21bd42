//! ParcelSync sync engine
//!
//! Offline-first synchronization of JSON documents, including:
//! - Optimistic local writes with a persistent delta queue
//! - Incremental sync passes with per-document batching
//! - Conflict detection and resolution (automatic or manual review)
//! - Retry strategy with exponential backoff
//! - Debounced, connectivity-aware and periodic scheduling

pub mod background;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod engine;
pub mod events;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use background::{BackgroundExecutor, PeriodicTask, TokioBackground};
pub use config::{SchedulerConfig, SchedulerConfigUpdate, SyncConfig, SyncConfigUpdate};
pub use conflict::{
    resolve_conflict, ConflictResolution, ConflictStrategy, FieldOwner, ResolutionOrigin,
    ResolveOptions,
};
pub use connectivity::Connectivity;
pub use engine::{
    CollectionReport, DocumentOutcome, ManualChoice, SkipReason, SyncEngine, SyncReport,
};
pub use events::{EventBus, SyncEvent};
pub use remote::{HttpRemote, MemoryRemote, PushOutcome, PushRequest, RemoteApi, RemoteChange};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SyncScheduler, SyncSchedulerHandle};
pub use state::{SyncState, SyncStats};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = SyncConfig::default();
        let _scheduler = SchedulerConfig::default();
        let _retry_config = RetryConfig::default();
        let _options = ResolveOptions::new(ConflictStrategy::MergeFields);
        assert_eq!(SyncState::default(), SyncState::Idle);
    }
}
