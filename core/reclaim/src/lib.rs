//! Resource monitoring and reclamation for ParcelSync.
//!
//! The monitor samples memory and storage utilisation and frees local
//! resources when they run short:
//! - routine cleanup on a fixed interval (expired records, capacity caps,
//!   retention of synced queue entries and resolved conflicts, orphans)
//! - aggressive cleanup under critical pressure, followed by every
//!   registered cleanup participant
//!
//! Records that are dirty, queued, conflicted or essential are never
//! evicted.

pub mod monitor;
pub mod probe;
pub mod registry;
pub mod thresholds;

pub use monitor::{CleanupReport, Pressure, ReclaimStats, ResourceMonitor};
pub use probe::{CacheProbe, FixedProbe, ResourceProbe, ResourceUsage};
pub use registry::{CleanupPriority, CleanupRegistry, CleanupTask, ParticipantReport};
pub use thresholds::{ResourceThresholds, ThresholdsUpdate};
