//! Background execution facility.
//!
//! The scheduler hands sync passes to a [`BackgroundExecutor`] when one is
//! configured. An executor may refuse work, in which case the caller runs it
//! inline.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use parcelsync_common::{Error, Result};

/// Factory producing one run of a periodic task.
pub type PeriodicTask = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Executes work outside the caller's task.
pub trait BackgroundExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// Run `task` in the background.
    ///
    /// # Errors
    /// Returns the task back when the executor refuses it.
    fn submit(&self, task: BoxFuture<'static, ()>) -> std::result::Result<(), BoxFuture<'static, ()>>;

    /// Run `task` every `interval`, first run after one interval.
    ///
    /// # Errors
    /// - The executor does not support periodic work
    fn register_periodic(&self, name: &str, interval: Duration, task: PeriodicTask) -> Result<()>;
}

/// Executor backed by the Tokio runtime.
pub struct TokioBackground {
    handle: Handle,
    accepting: AtomicBool,
    periodic: Mutex<Vec<JoinHandle<()>>>,
}

impl TokioBackground {
    /// Executor on the runtime the caller runs in.
    ///
    /// # Errors
    /// - `Error::Config` when called outside a Tokio runtime
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Config(format!("no tokio runtime: {}", e)))?;
        Ok(Self::new(handle))
    }

    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            accepting: AtomicBool::new(true),
            periodic: Mutex::new(Vec::new()),
        }
    }

    /// Stop accepting one-off tasks (they are handed back to the caller).
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }
}

impl BackgroundExecutor for TokioBackground {
    fn name(&self) -> &str {
        "tokio"
    }

    fn submit(&self, task: BoxFuture<'static, ()>) -> std::result::Result<(), BoxFuture<'static, ()>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(task);
        }
        self.handle.spawn(task);
        Ok(())
    }

    fn register_periodic(&self, name: &str, interval: Duration, task: PeriodicTask) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::Config(format!(
                "periodic task '{}' needs a positive interval",
                name
            )));
        }

        let name = name.to_string();
        let join = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                debug!(task = %name, "running periodic task");
                task().await;
            }
        });

        let mut periodic = self.periodic.lock().unwrap_or_else(|e| e.into_inner());
        periodic.push(join);
        Ok(())
    }
}

impl Drop for TokioBackground {
    fn drop(&mut self) {
        let periodic = self.periodic.get_mut().unwrap_or_else(|e| e.into_inner());
        for join in periodic.drain(..) {
            join.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_submit_runs_task() {
        let executor = TokioBackground::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        executor
            .submit(async move {
                let _ = tx.send(7);
            }.boxed())
            .map_err(|_| "refused")
            .unwrap();
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_refused_task_is_returned() {
        let executor = TokioBackground::current().unwrap();
        executor.set_accepting(false);

        let returned = executor.submit(async {}.boxed());
        assert!(returned.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_repeats() {
        let executor = TokioBackground::current().unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();

        executor
            .register_periodic(
                "count",
                Duration::from_secs(60),
                Arc::new(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    .boxed()
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let executor = TokioBackground::new(runtime.handle().clone());
        let result = executor.register_periodic("never", Duration::ZERO, Arc::new(|| async {}.boxed()));
        assert!(result.is_err());
    }
}
