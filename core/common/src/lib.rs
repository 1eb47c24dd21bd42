//! Common utilities and types shared across ParcelSync modules.
//!
//! This module provides the error taxonomy, record identifiers and the
//! atomically replaceable configuration handle used by every other crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::ConfigHandle;
pub use error::{Error, Result};
pub use types::{ClientId, RecordKey, is_internal_collection};
