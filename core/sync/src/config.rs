//! Runtime configuration of the orchestrator and the scheduler.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use parcelsync_codec::{CodecConfig, DeltaOptions, DEFAULT_COMPRESSION_THRESHOLD};
use parcelsync_common::config::millis;
use parcelsync_common::{Error, Result};

use crate::conflict::{ConflictStrategy, FieldOwner, ResolveOptions};
use crate::retry::RetryConfig;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enable_compression: bool,
    /// Serialized delta size in bytes above which compression kicks in.
    pub compression_threshold: usize,
    /// Documents transmitted concurrently per chunk.
    pub batch_size: usize,
    /// Failed attempts before a queue entry is flagged failed.
    pub max_retries: u32,
    pub conflict_strategy: ConflictStrategy,
    /// Owner of a field under `merge-fields`, by dotted path or top-level name.
    pub field_priorities: BTreeMap<String, FieldOwner>,
    /// Fields never diffed or transmitted.
    pub exclude_fields: Vec<String>,
    /// Per-collection strategy overrides.
    pub collection_strategies: BTreeMap<String, ConflictStrategy>,
    /// Collections synced by default; empty means every collection with
    /// pending work.
    pub collections: Vec<String>,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Backoff between failed attempts of one document.
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enable_compression: true,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            batch_size: 10,
            max_retries: 5,
            conflict_strategy: ConflictStrategy::TimestampWins,
            field_priorities: BTreeMap::new(),
            exclude_fields: Vec::new(),
            collection_strategies: BTreeMap::new(),
            collections: Vec::new(),
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn with_collection_strategy(
        mut self,
        collection: impl Into<String>,
        strategy: ConflictStrategy,
    ) -> Self {
        self.collection_strategies.insert(collection.into(), strategy);
        self
    }

    pub fn with_field_priority(mut self, field: impl Into<String>, owner: FieldOwner) -> Self {
        self.field_priorities.insert(field.into(), owner);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_collections(mut self, collections: Vec<String>) -> Self {
        self.collections = collections;
        self
    }

    pub fn with_exclude_fields(mut self, fields: Vec<String>) -> Self {
        self.exclude_fields = fields;
        self
    }

    pub fn with_compression(mut self, enabled: bool, threshold: usize) -> Self {
        self.enable_compression = enabled;
        self.compression_threshold = threshold;
        self
    }

    /// Check invariants the engine relies on.
    ///
    /// # Errors
    /// - `Error::Config` naming the offending setting
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request_timeout must be positive".to_string()));
        }
        self.retry.validate()
    }

    /// Strategy for `collection`, honoring overrides.
    pub fn strategy_for(&self, collection: &str) -> ConflictStrategy {
        self.collection_strategies
            .get(collection)
            .copied()
            .unwrap_or(self.conflict_strategy)
    }

    pub fn resolve_options(&self, collection: &str) -> ResolveOptions {
        ResolveOptions {
            strategy: self.strategy_for(collection),
            field_priorities: self.field_priorities.clone(),
        }
    }

    pub fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            enable_compression: self.enable_compression,
            compression_threshold: self.compression_threshold,
        }
    }

    pub fn delta_options(&self) -> DeltaOptions {
        DeltaOptions::default().with_exclude_fields(self.exclude_fields.clone())
    }
}

/// Partial update merged into the current [`SyncConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfigUpdate {
    pub enable_compression: Option<bool>,
    pub compression_threshold: Option<usize>,
    pub batch_size: Option<usize>,
    pub max_retries: Option<u32>,
    pub conflict_strategy: Option<ConflictStrategy>,
    pub field_priorities: Option<BTreeMap<String, FieldOwner>>,
    pub exclude_fields: Option<Vec<String>>,
    pub collection_strategies: Option<BTreeMap<String, ConflictStrategy>>,
    pub collections: Option<Vec<String>>,
    pub request_timeout_ms: Option<u64>,
    pub retry: Option<RetryConfig>,
}

impl SyncConfigUpdate {
    /// Merge into `config`, validating the result.
    pub fn apply_to(self, config: &mut SyncConfig) -> Result<()> {
        if let Some(v) = self.enable_compression {
            config.enable_compression = v;
        }
        if let Some(v) = self.compression_threshold {
            config.compression_threshold = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = self.conflict_strategy {
            config.conflict_strategy = v;
        }
        if let Some(v) = self.field_priorities {
            config.field_priorities = v;
        }
        if let Some(v) = self.exclude_fields {
            config.exclude_fields = v;
        }
        if let Some(v) = self.collection_strategies {
            config.collection_strategies = v;
        }
        if let Some(v) = self.collections {
            config.collections = v;
        }
        if let Some(ms) = self.request_timeout_ms {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = self.retry {
            config.retry = v;
        }
        config.validate()
    }
}

/// Scheduler timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Quiet period after the last trigger for a collection.
    #[serde(with = "millis")]
    pub debounce: Duration,
    /// Delay before the catch-up pass after reconnecting.
    #[serde(with = "millis")]
    pub reconnect_settle: Duration,
    /// Interval of the full periodic pass.
    #[serde(with = "millis")]
    pub periodic_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            reconnect_settle: Duration::from_secs(2),
            periodic_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl SchedulerConfig {
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_reconnect_settle(mut self, settle: Duration) -> Self {
        self.reconnect_settle = settle;
        self
    }

    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval = interval;
        self
    }

    /// # Errors
    /// - `Error::Config` if the periodic interval is zero
    pub fn validate(&self) -> Result<()> {
        if self.periodic_interval.is_zero() {
            return Err(Error::Config("periodic_interval must be positive".to_string()));
        }
        Ok(())
    }
}

/// Partial update merged into the current [`SchedulerConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfigUpdate {
    pub debounce_ms: Option<u64>,
    pub reconnect_settle_ms: Option<u64>,
    pub periodic_interval_ms: Option<u64>,
}

impl SchedulerConfigUpdate {
    pub fn apply_to(self, config: &mut SchedulerConfig) -> Result<()> {
        if let Some(ms) = self.debounce_ms {
            config.debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = self.reconnect_settle_ms {
            config.reconnect_settle = Duration::from_millis(ms);
        }
        if let Some(ms) = self.periodic_interval_ms {
            config.periodic_interval = Duration::from_millis(ms);
        }
        config.validate()
    }
}
