//! Limits that drive sampling and cleanup.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use parcelsync_common::config::millis;
use parcelsync_common::{Error, Result};
use parcelsync_storage::OrphanRule;

/// Resource limits and cleanup cadence.
///
/// Percentages are utilisation of the configured budgets, in `0..=100`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceThresholds {
    /// Memory utilisation that triggers a routine cleanup.
    pub memory_threshold: f64,
    /// Storage utilisation that triggers a routine cleanup.
    pub storage_threshold: f64,
    /// Utilisation of either resource that triggers an aggressive cleanup.
    pub aggressive_cleanup_threshold: f64,
    #[serde(with = "millis")]
    pub sample_interval: Duration,
    #[serde(with = "millis")]
    pub cleanup_interval: Duration,
    /// Settled records untouched for longer are evicted.
    #[serde(with = "millis")]
    pub max_cache_age: Duration,
    /// Records kept per collection.
    pub max_cache_size: usize,
    /// How long synced queue entries and resolved conflicts are kept.
    #[serde(with = "millis")]
    pub retention: Duration,
    /// Hot index size considered 100% memory utilisation.
    pub memory_budget_bytes: u64,
    /// Store size considered 100% storage utilisation.
    pub storage_quota_bytes: u64,
    pub orphan_rules: Vec<OrphanRule>,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            memory_threshold: 80.0,
            storage_threshold: 85.0,
            aggressive_cleanup_threshold: 90.0,
            sample_interval: Duration::from_secs(15),
            cleanup_interval: Duration::from_secs(5 * 60),
            max_cache_age: Duration::from_secs(24 * 60 * 60),
            max_cache_size: 1000,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            memory_budget_bytes: 64 * 1024 * 1024,
            storage_quota_bytes: 512 * 1024 * 1024,
            orphan_rules: Vec::new(),
        }
    }
}

impl ResourceThresholds {
    pub fn with_memory_threshold(mut self, percent: f64) -> Self {
        self.memory_threshold = percent;
        self
    }

    pub fn with_storage_threshold(mut self, percent: f64) -> Self {
        self.storage_threshold = percent;
        self
    }

    pub fn with_aggressive_threshold(mut self, percent: f64) -> Self {
        self.aggressive_cleanup_threshold = percent;
        self
    }

    pub fn with_max_cache_age(mut self, age: Duration) -> Self {
        self.max_cache_age = age;
        self
    }

    pub fn with_max_cache_size(mut self, size: usize) -> Self {
        self.max_cache_size = size;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_budgets(mut self, memory_bytes: u64, storage_bytes: u64) -> Self {
        self.memory_budget_bytes = memory_bytes;
        self.storage_quota_bytes = storage_bytes;
        self
    }

    pub fn with_orphan_rule(mut self, rule: OrphanRule) -> Self {
        self.orphan_rules.push(rule);
        self
    }

    /// # Errors
    /// - `Error::Config` naming the offending setting
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("memory_threshold", self.memory_threshold),
            ("storage_threshold", self.storage_threshold),
            ("aggressive_cleanup_threshold", self.aggressive_cleanup_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(Error::Config(format!(
                    "{} must be a percentage, got {}",
                    name, value
                )));
            }
        }
        if self.sample_interval.is_zero() || self.cleanup_interval.is_zero() {
            return Err(Error::Config("intervals must be positive".to_string()));
        }
        if self.max_cache_size == 0 {
            return Err(Error::Config("max_cache_size must be at least 1".to_string()));
        }
        if self.memory_budget_bytes == 0 || self.storage_quota_bytes == 0 {
            return Err(Error::Config("resource budgets must be positive".to_string()));
        }
        Ok(())
    }
}

/// Partial update merged into the current thresholds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdsUpdate {
    pub memory_threshold: Option<f64>,
    pub storage_threshold: Option<f64>,
    pub aggressive_cleanup_threshold: Option<f64>,
    pub sample_interval_ms: Option<u64>,
    pub cleanup_interval_ms: Option<u64>,
    pub max_cache_age_ms: Option<u64>,
    pub max_cache_size: Option<usize>,
    pub retention_ms: Option<u64>,
    pub memory_budget_bytes: Option<u64>,
    pub storage_quota_bytes: Option<u64>,
    pub orphan_rules: Option<Vec<OrphanRule>>,
}

impl ThresholdsUpdate {
    /// Merge into `thresholds`, validating the result.
    pub fn apply_to(self, thresholds: &mut ResourceThresholds) -> Result<()> {
        if let Some(v) = self.memory_threshold {
            thresholds.memory_threshold = v;
        }
        if let Some(v) = self.storage_threshold {
            thresholds.storage_threshold = v;
        }
        if let Some(v) = self.aggressive_cleanup_threshold {
            thresholds.aggressive_cleanup_threshold = v;
        }
        if let Some(ms) = self.sample_interval_ms {
            thresholds.sample_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.cleanup_interval_ms {
            thresholds.cleanup_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_cache_age_ms {
            thresholds.max_cache_age = Duration::from_millis(ms);
        }
        if let Some(v) = self.max_cache_size {
            thresholds.max_cache_size = v;
        }
        if let Some(ms) = self.retention_ms {
            thresholds.retention = Duration::from_millis(ms);
        }
        if let Some(v) = self.memory_budget_bytes {
            thresholds.memory_budget_bytes = v;
        }
        if let Some(v) = self.storage_quota_bytes {
            thresholds.storage_quota_bytes = v;
        }
        if let Some(v) = self.orphan_rules {
            thresholds.orphan_rules = v;
        }
        thresholds.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_are_valid() {
        let thresholds = ResourceThresholds::default();
        assert!(thresholds.validate().is_ok());
        assert_eq!(thresholds.sample_interval, Duration::from_secs(15));
        assert_eq!(thresholds.max_cache_size, 1000);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let thresholds: ResourceThresholds =
            serde_json::from_value(json!({"memory_threshold": 70.0, "retention": 1000})).unwrap();
        assert_eq!(thresholds.memory_threshold, 70.0);
        assert_eq!(thresholds.retention, Duration::from_secs(1));
        assert_eq!(thresholds.storage_threshold, 85.0);
    }

    #[test]
    fn test_update_rejects_bad_percentage() {
        let mut thresholds = ResourceThresholds::default();
        let update = ThresholdsUpdate {
            memory_threshold: Some(140.0),
            ..Default::default()
        };
        assert!(matches!(update.apply_to(&mut thresholds), Err(Error::Config(_))));
    }

    #[test]
    fn test_update_merges_fields() {
        let mut thresholds = ResourceThresholds::default();
        ThresholdsUpdate {
            max_cache_size: Some(10),
            cleanup_interval_ms: Some(60_000),
            ..Default::default()
        }
        .apply_to(&mut thresholds)
        .unwrap();
        assert_eq!(thresholds.max_cache_size, 10);
        assert_eq!(thresholds.cleanup_interval, Duration::from_secs(60));
    }
}
