//! Sync scheduling: debounced, connectivity-aware and periodic passes.
//!
//! [`SyncScheduler`] is the cheap, cloneable front used to request passes;
//! [`SyncSchedulerHandle::run`] is the loop deciding when they run. Local
//! mutations reported on the event bus and explicit `schedule` calls are
//! debounced per collection. While offline every trigger is dropped; after
//! reconnecting a full pass runs once the connection has settled.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use parcelsync_common::{is_internal_collection, ConfigHandle, Error, Result};

use crate::background::{BackgroundExecutor, PeriodicTask};
use crate::config::{SchedulerConfig, SchedulerConfigUpdate};
use crate::engine::{SkipReason, SyncEngine};
use crate::events::SyncEvent;

const PERIODIC_TASK: &str = "parcelsync-periodic-sync";

/// Collection to sync; `None` means all of them.
type Target = Option<String>;

#[derive(Debug)]
enum Command {
    Trigger(Target),
    SyncNow,
    Shutdown,
}

/// Front end for requesting sync passes.
#[derive(Clone)]
pub struct SyncScheduler {
    tx: mpsc::Sender<Command>,
    config: ConfigHandle<SchedulerConfig>,
}

impl SyncScheduler {
    /// Create a scheduler driving `engine`.
    ///
    /// The returned handle must be run (usually spawned) for anything to
    /// happen. Event and connectivity subscriptions are taken here, so
    /// mutations made before the loop starts are not missed.
    pub fn new(engine: Arc<SyncEngine>, config: SchedulerConfig) -> (Self, SyncSchedulerHandle) {
        let (tx, rx) = mpsc::channel(100);
        let config = ConfigHandle::new(config);

        let handle = SyncSchedulerHandle {
            events: engine.subscribe(),
            online: engine.connectivity().subscribe(),
            engine,
            executor: None,
            config: config.clone(),
            tx: tx.clone(),
            rx,
        };
        (Self { tx, config }, handle)
    }

    /// Debounce a pass over `collection`.
    ///
    /// # Errors
    /// - `Error::InvalidInput` for an internal collection or a stopped scheduler
    pub async fn schedule(&self, collection: &str) -> Result<()> {
        if collection.is_empty() || is_internal_collection(collection) {
            return Err(Error::InvalidInput(format!(
                "'{}' is not a user collection",
                collection
            )));
        }
        self.send(Command::Trigger(Some(collection.to_string()))).await
    }

    /// Run a full pass without waiting for the debounce.
    pub async fn sync_now(&self) -> Result<()> {
        self.send(Command::SyncNow).await
    }

    /// Stop the scheduler loop. A pass already running inline completes first.
    pub async fn shutdown(&self) {
        if self.tx.send(Command::Shutdown).await.is_err() {
            debug!("scheduler already stopped");
        }
    }

    pub fn config(&self) -> Arc<SchedulerConfig> {
        self.config.snapshot()
    }

    /// Merge `update` into the timing configuration.
    ///
    /// Takes effect for timers armed afterwards. A periodic pass registered
    /// with a background executor keeps its original interval.
    pub fn update_config(&self, update: SchedulerConfigUpdate) -> Result<Arc<SchedulerConfig>> {
        let updated = self.config.update(|config| update.apply_to(config))?;
        info!(
            debounce = ?updated.debounce,
            settle = ?updated.reconnect_settle,
            periodic = ?updated.periodic_interval,
            "scheduler configuration updated"
        );
        Ok(updated)
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::InvalidInput("sync scheduler is not running".to_string()))
    }
}

/// The scheduler loop; see [`SyncSchedulerHandle::run`].
pub struct SyncSchedulerHandle {
    engine: Arc<SyncEngine>,
    executor: Option<Arc<dyn BackgroundExecutor>>,
    config: ConfigHandle<SchedulerConfig>,
    tx: mpsc::Sender<Command>,
    rx: mpsc::Receiver<Command>,
    events: broadcast::Receiver<SyncEvent>,
    online: watch::Receiver<bool>,
}

impl SyncSchedulerHandle {
    /// Dispatch passes through `executor` instead of running them inline.
    pub fn with_executor(mut self, executor: Arc<dyn BackgroundExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Run until [`SyncScheduler::shutdown`].
    pub async fn run(mut self) {
        let mut deadlines: HashMap<Target, Instant> = HashMap::new();
        let mut reconnect_at: Option<Instant> = None;
        let mut periodic_every = self.config.snapshot().periodic_interval;
        let mut periodic = self.start_periodic(periodic_every);
        let mut events_open = true;
        let mut online_open = true;

        info!(
            executor = self.executor.as_ref().map(|e| e.name()).unwrap_or("inline"),
            "sync scheduler started"
        );

        loop {
            let wake = deadlines.values().copied().chain(reconnect_at).min();

            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(Command::Trigger(target)) => self.debounce(&mut deadlines, target),
                    Some(Command::SyncNow) => {
                        deadlines.clear();
                        self.dispatch(None).await;
                    }
                    Some(Command::Shutdown) | None => break,
                },

                event = self.events.recv(), if events_open => match event {
                    Ok(SyncEvent::LocalMutation { key }) => {
                        self.debounce(&mut deadlines, Some(key.collection))
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "scheduler lagged behind events, scheduling a full pass");
                        self.debounce(&mut deadlines, None);
                    }
                    Err(RecvError::Closed) => events_open = false,
                },

                changed = self.online.changed(), if online_open => {
                    if changed.is_err() {
                        online_open = false;
                        continue;
                    }
                    if *self.online.borrow_and_update() {
                        let settle = self.config.snapshot().reconnect_settle;
                        debug!(?settle, "back online, catch-up pass pending");
                        reconnect_at = Some(Instant::now() + settle);
                    } else {
                        if !deadlines.is_empty() || reconnect_at.is_some() {
                            info!(dropped = deadlines.len(), "offline, pending sync triggers dropped");
                        }
                        deadlines.clear();
                        reconnect_at = None;
                    }
                }

                _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
                    let now = Instant::now();
                    if reconnect_at.is_some_and(|at| at <= now) {
                        reconnect_at = None;
                        deadlines.clear();
                        info!("connection settled, running catch-up pass");
                        self.dispatch(None).await;
                    }

                    let due: Vec<Target> = deadlines
                        .iter()
                        .filter(|(_, at)| **at <= now)
                        .map(|(target, _)| target.clone())
                        .collect();
                    for target in due {
                        deadlines.remove(&target);
                        self.dispatch(target).await;
                    }
                }

                _ = tick(&mut periodic) => {
                    debug!("periodic sync pass");
                    self.dispatch(None).await;
                }
            }

            let every = self.config.snapshot().periodic_interval;
            if periodic.is_some() && every != periodic_every {
                periodic_every = every;
                periodic = Some(own_interval(every));
            }
        }

        info!("sync scheduler stopped");
    }

    /// Register the periodic pass with the executor, falling back to an
    /// own interval.
    fn start_periodic(&self, every: Duration) -> Option<Interval> {
        if let Some(executor) = &self.executor {
            let tx = self.tx.clone();
            let task: PeriodicTask = Arc::new(move || {
                let tx = tx.clone();
                async move {
                    if tx.send(Command::SyncNow).await.is_err() {
                        debug!("scheduler stopped, periodic pass dropped");
                    }
                }
                .boxed()
            });

            match executor.register_periodic(PERIODIC_TASK, every, task) {
                Ok(()) => {
                    info!(executor = executor.name(), ?every, "periodic sync registered");
                    return None;
                }
                Err(e) => warn!(
                    executor = executor.name(),
                    "periodic sync not registered, using own timer: {}", e
                ),
            }
        }
        Some(own_interval(every))
    }

    fn debounce(&self, deadlines: &mut HashMap<Target, Instant>, target: Target) {
        if !*self.online.borrow() {
            debug!(collection = ?target, "offline, sync trigger dropped");
            return;
        }
        let deadline = Instant::now() + self.config.snapshot().debounce;
        debug!(collection = ?target, "sync pass debounced");
        deadlines.insert(target, deadline);
    }

    async fn dispatch(&self, target: Target) {
        let task = pass_task(Arc::clone(&self.engine), target, self.tx.clone());
        match &self.executor {
            Some(executor) => {
                if let Err(task) = executor.submit(task) {
                    debug!(executor = executor.name(), "executor refused the pass, running inline");
                    task.await;
                }
            }
            None => task.await,
        }
    }
}

/// One pass; re-triggers itself when it was rejected or left work behind.
fn pass_task(engine: Arc<SyncEngine>, target: Target, tx: mpsc::Sender<Command>) -> BoxFuture<'static, ()> {
    async move {
        let collections = target.clone().map(|c| vec![c]);
        match engine.perform_incremental_sync(collections.as_deref()).await {
            Ok(report) if report.skipped == Some(SkipReason::InProgress) || report.more_work => {
                debug!(collection = ?target, "sync pass will run again");
                if tx.try_send(Command::Trigger(target)).is_err() {
                    warn!("scheduler queue full, follow-up pass dropped");
                }
            }
            Ok(_) => {}
            Err(e) => error!(collection = ?target, "scheduled sync pass failed: {}", e),
        }
    }
    .boxed()
}

fn own_interval(every: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + every, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
