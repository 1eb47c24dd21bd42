//! Resource utilisation probes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use parcelsync_common::Result;
use parcelsync_storage::WriteCache;

use crate::thresholds::ResourceThresholds;

/// Utilisation sample, in percent of the configured budgets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_percent: f64,
    pub storage_percent: f64,
}

impl ResourceUsage {
    pub fn new(memory_percent: f64, storage_percent: f64) -> Self {
        Self {
            memory_percent,
            storage_percent,
        }
    }

    /// Higher of the two utilisations.
    pub fn peak(&self) -> f64 {
        self.memory_percent.max(self.storage_percent)
    }
}

/// Source of utilisation samples.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn sample(&self, thresholds: &ResourceThresholds) -> Result<ResourceUsage>;
}

/// Measures the write cache: hot index footprint against the memory budget
/// and store size against the storage quota.
pub struct CacheProbe {
    cache: Arc<WriteCache>,
}

impl CacheProbe {
    pub fn new(cache: Arc<WriteCache>) -> Self {
        Self { cache }
    }
}

fn percent(used: u64, budget: u64) -> f64 {
    if budget == 0 {
        return 100.0;
    }
    used as f64 * 100.0 / budget as f64
}

#[async_trait]
impl ResourceProbe for CacheProbe {
    fn name(&self) -> &str {
        "cache"
    }

    async fn sample(&self, thresholds: &ResourceThresholds) -> Result<ResourceUsage> {
        let hot = self.cache.hot_footprint();
        let stats = self.cache.store().stats().await?;
        Ok(ResourceUsage {
            memory_percent: percent(hot.bytes as u64, thresholds.memory_budget_bytes),
            storage_percent: percent(stats.approx_bytes, thresholds.storage_quota_bytes),
        })
    }
}

/// Probe returning whatever it was last told.
#[derive(Debug, Default)]
pub struct FixedProbe {
    usage: Mutex<ResourceUsage>,
}

impl FixedProbe {
    pub fn new(memory_percent: f64, storage_percent: f64) -> Self {
        Self {
            usage: Mutex::new(ResourceUsage::new(memory_percent, storage_percent)),
        }
    }

    pub fn set(&self, memory_percent: f64, storage_percent: f64) {
        let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        *usage = ResourceUsage::new(memory_percent, storage_percent);
    }
}

#[async_trait]
impl ResourceProbe for FixedProbe {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn sample(&self, _thresholds: &ResourceThresholds) -> Result<ResourceUsage> {
        Ok(*self.usage.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parcelsync_common::RecordKey;
    use parcelsync_storage::{MemoryStore, Record};
    use serde_json::json;

    #[tokio::test]
    async fn test_cache_probe_reports_against_budgets() {
        let cache = Arc::new(WriteCache::new(Arc::new(MemoryStore::new())));
        let probe = CacheProbe::new(cache.clone());
        let thresholds = ResourceThresholds::default().with_budgets(1_000_000, 1_000_000);

        let empty = probe.sample(&thresholds).await.unwrap();
        assert_eq!(empty, ResourceUsage::default());

        let key = RecordKey::new("parcels", "P-1").unwrap();
        cache
            .put(&Record::new(&key, json!({"notes": "x".repeat(5_000)}), 1))
            .await
            .unwrap();

        let usage = probe.sample(&thresholds).await.unwrap();
        assert!(usage.memory_percent > 0.4);
        assert!(usage.storage_percent > 0.4);
    }

    #[tokio::test]
    async fn test_fixed_probe() {
        let probe = FixedProbe::new(10.0, 20.0);
        let thresholds = ResourceThresholds::default();
        assert_eq!(probe.sample(&thresholds).await.unwrap().peak(), 20.0);

        probe.set(95.0, 5.0);
        assert_eq!(probe.sample(&thresholds).await.unwrap().peak(), 95.0);
    }
}
