//! Registry of cleanup participants.
//!
//! Components that hold reclaimable resources register a [`CleanupTask`]
//! under a unique name. Aggressive cleanup runs every participant in
//! priority order; a failing or panicking participant is logged and the
//! rest still run.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info};

use parcelsync_common::{Error, Result};

/// Order in which participants run; `High` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPriority {
    High,
    Normal,
    Low,
}

/// Something that can release resources on request.
#[async_trait]
pub trait CleanupTask: Send + Sync {
    /// Release what can be released.
    ///
    /// # Returns
    /// Number of items reclaimed.
    async fn cleanup(&self) -> Result<usize>;
}

/// Result of running one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantReport {
    pub name: String,
    pub reclaimed: usize,
    pub error: Option<String>,
}

struct Participant {
    name: String,
    priority: CleanupPriority,
    order: u64,
    task: Arc<dyn CleanupTask>,
}

/// Named cleanup participants.
#[derive(Default)]
pub struct CleanupRegistry {
    participants: RwLock<Vec<Participant>>,
    next_order: AtomicU64,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant.
    ///
    /// # Preconditions
    /// - `name` must be unique within the registry
    ///
    /// # Errors
    /// - `Error::AlreadyExists` if the name is taken
    pub fn register(
        &self,
        name: impl Into<String>,
        priority: CleanupPriority,
        task: Arc<dyn CleanupTask>,
    ) -> Result<()> {
        let name = name.into();
        let mut participants = self.participants.write().unwrap_or_else(|e| e.into_inner());
        if participants.iter().any(|p| p.name == name) {
            return Err(Error::AlreadyExists(format!(
                "Cleanup participant '{}' is already registered",
                name
            )));
        }

        debug!(participant = %name, ?priority, "cleanup participant registered");
        participants.push(Participant {
            name,
            priority,
            order: self.next_order.fetch_add(1, Ordering::Relaxed),
            task,
        });
        Ok(())
    }

    /// Remove a participant. Returns whether it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let mut participants = self.participants.write().unwrap_or_else(|e| e.into_inner());
        let before = participants.len();
        participants.retain(|p| p.name != name);
        participants.len() != before
    }

    /// Participant names in run order.
    pub fn names(&self) -> Vec<String> {
        self.ordered().into_iter().map(|(name, _)| name).collect()
    }

    pub fn len(&self) -> usize {
        self.participants.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every participant: by priority, then registration order.
    pub async fn run_all(&self) -> Vec<ParticipantReport> {
        let mut reports = Vec::new();

        for (name, task) in self.ordered() {
            let outcome = AssertUnwindSafe(task.cleanup()).catch_unwind().await;
            let report = match outcome {
                Ok(Ok(reclaimed)) => {
                    debug!(participant = %name, reclaimed, "cleanup participant finished");
                    ParticipantReport {
                        name,
                        reclaimed,
                        error: None,
                    }
                }
                Ok(Err(e)) => {
                    error!(participant = %name, "cleanup participant failed: {}", e);
                    ParticipantReport {
                        name,
                        reclaimed: 0,
                        error: Some(e.to_string()),
                    }
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(participant = %name, "cleanup participant panicked: {}", message);
                    ParticipantReport {
                        name,
                        reclaimed: 0,
                        error: Some(format!("panicked: {}", message)),
                    }
                }
            };
            reports.push(report);
        }

        if !reports.is_empty() {
            info!(participants = reports.len(), "cleanup participants ran");
        }
        reports
    }

    fn ordered(&self) -> Vec<(String, Arc<dyn CleanupTask>)> {
        let participants = self.participants.read().unwrap_or_else(|e| e.into_inner());
        let mut ordered: Vec<&Participant> = participants.iter().collect();
        ordered.sort_by_key(|p| (p.priority, p.order));
        ordered
            .into_iter()
            .map(|p| (p.name.clone(), Arc::clone(&p.task)))
            .collect()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
