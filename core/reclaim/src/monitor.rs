//! Resource monitor: samples utilisation and reclaims local resources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parcelsync_common::{ConfigHandle, Result};
use parcelsync_storage::{now_millis, ReviewStore, SyncQueue, WriteCache};

use crate::probe::{ResourceProbe, ResourceUsage};
use crate::registry::{CleanupRegistry, ParticipantReport};
use crate::thresholds::{ResourceThresholds, ThresholdsUpdate};

/// Pressure level derived from a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pressure {
    Normal,
    /// Memory or storage above its threshold.
    Elevated,
    /// Either resource above the aggressive threshold.
    Critical,
}

/// What one cleanup released.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub aggressive: bool,
    pub expired: usize,
    pub over_capacity: usize,
    pub orphans: usize,
    pub queue_entries: usize,
    pub conflicts: usize,
    pub hot_entries: usize,
    pub compacted: bool,
    pub participants: Vec<ParticipantReport>,
}

impl CleanupReport {
    /// Records evicted from the cache.
    pub fn records_evicted(&self) -> usize {
        self.expired + self.over_capacity + self.orphans
    }
}

/// Monitor counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReclaimStats {
    pub samples: u64,
    pub routine_cleanups: u64,
    pub aggressive_cleanups: u64,
    pub records_evicted: u64,
    pub last_usage: Option<ResourceUsage>,
    pub last_cleanup_at: Option<DateTime<Utc>>,
}

/// Samples resource usage and evicts settled data under pressure.
pub struct ResourceMonitor {
    cache: Arc<WriteCache>,
    queue: Arc<SyncQueue>,
    reviews: ReviewStore,
    probe: Arc<dyn ResourceProbe>,
    registry: Arc<CleanupRegistry>,
    thresholds: ConfigHandle<ResourceThresholds>,
    stats: Mutex<ReclaimStats>,
    cleaning: tokio::sync::Mutex<()>,
}

impl ResourceMonitor {
    /// Create a monitor over the engine's cache and queue.
    ///
    /// # Errors
    /// - `Error::Config` if `thresholds` are invalid
    pub fn new(
        cache: Arc<WriteCache>,
        queue: Arc<SyncQueue>,
        probe: Arc<dyn ResourceProbe>,
        registry: Arc<CleanupRegistry>,
        thresholds: ResourceThresholds,
    ) -> Result<Self> {
        thresholds.validate()?;
        let reviews = ReviewStore::new(cache.store());
        Ok(Self {
            cache,
            queue,
            reviews,
            probe,
            registry,
            thresholds: ConfigHandle::new(thresholds),
            stats: Mutex::new(ReclaimStats::default()),
            cleaning: tokio::sync::Mutex::new(()),
        })
    }

    pub fn registry(&self) -> Arc<CleanupRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn thresholds(&self) -> Arc<ResourceThresholds> {
        self.thresholds.snapshot()
    }

    /// Merge `update` into the thresholds and swap them in.
    ///
    /// # Errors
    /// - `Error::Config` if the result is invalid; the old thresholds stay
    pub fn update_thresholds(&self, update: ThresholdsUpdate) -> Result<Arc<ResourceThresholds>> {
        let updated = self.thresholds.update(|t| update.apply_to(t))?;
        info!(
            memory = updated.memory_threshold,
            storage = updated.storage_threshold,
            aggressive = updated.aggressive_cleanup_threshold,
            "resource thresholds updated"
        );
        Ok(updated)
    }

    pub fn stats(&self) -> ReclaimStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Take one utilisation sample.
    pub async fn sample(&self) -> Result<(ResourceUsage, Pressure)> {
        let thresholds = self.thresholds.snapshot();
        let usage = self.probe.sample(&thresholds).await?;
        let pressure = classify(&usage, &thresholds);

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.samples += 1;
        stats.last_usage = Some(usage);
        debug!(
            memory = usage.memory_percent,
            storage = usage.storage_percent,
            ?pressure,
            "resource sample"
        );
        Ok((usage, pressure))
    }

    /// Sample and clean up if the sample calls for it.
    ///
    /// # Returns
    /// The cleanup report, or `None` under normal pressure.
    pub async fn handle_pressure(&self) -> Result<Option<CleanupReport>> {
        let (usage, pressure) = self.sample().await?;
        match pressure {
            Pressure::Normal => Ok(None),
            Pressure::Elevated => {
                info!(peak = usage.peak(), "resource pressure, running routine cleanup");
                self.routine_cleanup().await.map(Some)
            }
            Pressure::Critical => {
                warn!(peak = usage.peak(), "critical resource pressure, running aggressive cleanup");
                self.aggressive_cleanup().await.map(Some)
            }
        }
    }

    /// Evict expired and excess records, apply retention, drop orphans and
    /// trim the hot index.
    pub async fn routine_cleanup(&self) -> Result<CleanupReport> {
        let _cleaning = self.cleaning.lock().await;
        let thresholds = self.thresholds.snapshot();
        let now = now_millis();
        let retention_cutoff = now - millis(thresholds.retention);

        let mut report = CleanupReport {
            expired: step("expire", self.cache.evict_expired(now - millis(thresholds.max_cache_age))).await,
            over_capacity: step("cap", self.cache.evict_over_capacity(thresholds.max_cache_size)).await,
            queue_entries: step("queue retention", self.queue.purge_synced(Some(retention_cutoff))).await,
            conflicts: step("conflict retention", self.reviews.purge_resolved(Some(retention_cutoff))).await,
            ..CleanupReport::default()
        };
        for rule in &thresholds.orphan_rules {
            report.orphans += step("orphans", self.cache.remove_orphans(rule)).await;
        }
        report.hot_entries = self
            .cache
            .trim_hot_index(now - millis(thresholds.cleanup_interval));

        self.finish(&report);
        Ok(report)
    }

    /// Routine cleanup with halved age limit, full hot index clear, no
    /// retention, store compaction and every cleanup participant.
    pub async fn aggressive_cleanup(&self) -> Result<CleanupReport> {
        let _cleaning = self.cleaning.lock().await;
        let thresholds = self.thresholds.snapshot();
        let now = now_millis();

        let mut report = CleanupReport {
            aggressive: true,
            expired: step("expire", self.cache.evict_expired(now - millis(thresholds.max_cache_age) / 2)).await,
            over_capacity: step("cap", self.cache.evict_over_capacity(thresholds.max_cache_size)).await,
            queue_entries: step("queue purge", self.queue.purge_synced(None)).await,
            conflicts: step("conflict purge", self.reviews.purge_resolved(None)).await,
            ..CleanupReport::default()
        };
        for rule in &thresholds.orphan_rules {
            report.orphans += step("orphans", self.cache.remove_orphans(rule)).await;
        }
        report.hot_entries = self.cache.clear_hot_index();

        match self.cache.store().compact().await {
            Ok(()) => report.compacted = true,
            Err(e) => warn!("store compaction failed: {}", e),
        }

        report.participants = self.registry.run_all().await;

        self.finish(&report);
        Ok(report)
    }

    /// Sample and clean until `cancel` fires.
    ///
    /// Interval changes made through [`Self::update_thresholds`] take effect
    /// on the next tick.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("resource monitor started");
        let mut current = self.thresholds.snapshot();
        let (mut sample_tick, mut cleanup_tick) = tickers(&current);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sample_tick.tick() => {
                    if let Err(e) = self.handle_pressure().await {
                        warn!("resource sample failed: {}", e);
                    }
                }
                _ = cleanup_tick.tick() => {
                    if let Err(e) = self.routine_cleanup().await {
                        warn!("routine cleanup failed: {}", e);
                    }
                }
            }

            let latest = self.thresholds.snapshot();
            if latest.sample_interval != current.sample_interval
                || latest.cleanup_interval != current.cleanup_interval
            {
                (sample_tick, cleanup_tick) = tickers(&latest);
            }
            current = latest;
        }
        info!("resource monitor stopped");
    }

    fn finish(&self, report: &CleanupReport) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        if report.aggressive {
            stats.aggressive_cleanups += 1;
        } else {
            stats.routine_cleanups += 1;
        }
        stats.records_evicted += report.records_evicted() as u64;
        stats.last_cleanup_at = Some(Utc::now());

        info!(
            aggressive = report.aggressive,
            evicted = report.records_evicted(),
            queue_entries = report.queue_entries,
            conflicts = report.conflicts,
            hot_entries = report.hot_entries,
            "cleanup finished"
        );
    }
}

fn classify(usage: &ResourceUsage, thresholds: &ResourceThresholds) -> Pressure {
    if usage.peak() >= thresholds.aggressive_cleanup_threshold {
        Pressure::Critical
    } else if usage.memory_percent >= thresholds.memory_threshold
        || usage.storage_percent >= thresholds.storage_threshold
    {
        Pressure::Elevated
    } else {
        Pressure::Normal
    }
}

fn millis(duration: Duration) -> i64 {
    duration.as_millis().min(i64::MAX as u128) as i64
}

fn tickers(thresholds: &ResourceThresholds) -> (tokio::time::Interval, tokio::time::Interval) {
    let mut sample = interval_at(Instant::now() + thresholds.sample_interval, thresholds.sample_interval);
    let mut cleanup = interval_at(Instant::now() + thresholds.cleanup_interval, thresholds.cleanup_interval);
    sample.set_missed_tick_behavior(MissedTickBehavior::Delay);
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
    (sample, cleanup)
}

/// Run one cleanup step; a failure is logged and counts as nothing reclaimed.
async fn step(name: &str, fut: impl Future<Output = Result<usize>>) -> usize {
    match fut.await {
        Ok(count) => count,
        Err(e) => {
            warn!(step = name, "cleanup step failed: {}", e);
            0
        }
    }
}
