//! Stateful codec front end with configuration and counters.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error};

use parcelsync_common::{ConfigHandle, Error, Result};

use crate::compress::{compress_delta, decompress_delta, DEFAULT_COMPRESSION_THRESHOLD};
use crate::delta::{Delta, DeltaContext};
use crate::diff::{apply_delta, create_delta, DeltaOptions};
use crate::validate::check_delta;

/// Compression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    pub enable_compression: bool,
    /// Serialized size in bytes above which deltas are compressed.
    pub compression_threshold: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            enable_compression: true,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecStats {
    pub generated: u64,
    pub applied: u64,
    pub compressed: u64,
    pub invalid: u64,
}

/// Delta codec shared by the write path and the orchestrator.
pub struct DeltaCodec {
    config: ConfigHandle<CodecConfig>,
    generated: AtomicU64,
    applied: AtomicU64,
    compressed: AtomicU64,
    invalid: AtomicU64,
}

impl DeltaCodec {
    /// Create a codec with the given settings.
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config: ConfigHandle::new(config),
            generated: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            compressed: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
        }
    }

    /// Replace the settings.
    pub fn set_config(&self, config: CodecConfig) {
        self.config.replace(config);
    }

    /// Current settings.
    pub fn config(&self) -> CodecConfig {
        (*self.config.snapshot()).clone()
    }

    /// Diff two document versions; see [`create_delta`].
    ///
    /// When `options.compress_values` is set and compression is enabled,
    /// large deltas come back compressed.
    pub fn create(
        &self,
        old: Option<&Value>,
        new: Option<&Value>,
        ctx: &DeltaContext,
        options: &DeltaOptions,
    ) -> Result<Option<Delta>> {
        let Some(delta) = create_delta(old, new, ctx, options)? else {
            debug!(
                collection = %ctx.collection,
                document = %ctx.document_id,
                "no changes, delta skipped"
            );
            return Ok(None);
        };
        self.generated.fetch_add(1, Ordering::Relaxed);

        if options.compress_values {
            return self.compress(&delta).map(Some);
        }
        Ok(Some(delta))
    }

    /// Validate then replay; see [`apply_delta`].
    ///
    /// # Errors
    /// - `Error::Validation` if the delta is malformed (counted as invalid)
    pub fn apply(&self, base: Option<&Value>, delta: &Delta) -> Result<Option<Value>> {
        self.check(delta)?;
        let result = apply_delta(base, delta)?;
        self.applied.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    /// Compress according to the current settings.
    pub fn compress(&self, delta: &Delta) -> Result<Delta> {
        let config = self.config.snapshot();
        if !config.enable_compression || delta.compressed {
            return Ok(delta.clone());
        }
        let packed = compress_delta(delta, config.compression_threshold)?;
        if packed.compressed {
            self.compressed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(packed)
    }

    /// Expand a compressed delta.
    pub fn decompress(&self, delta: &Delta) -> Result<Delta> {
        decompress_delta(delta)
    }

    /// Validate, counting failures.
    pub fn check(&self, delta: &Delta) -> Result<()> {
        check_delta(delta).map_err(|e| {
            self.invalid.fetch_add(1, Ordering::Relaxed);
            error!(delta = %delta.id, document = %delta.document_id, "dropping invalid delta: {}", e);
            match e {
                Error::Validation(_) => e,
                other => Error::Validation(other.to_string()),
            }
        })
    }

    /// Whether `delta` passes validation (failures are counted).
    pub fn validate(&self, delta: &Delta) -> bool {
        self.check(delta).is_ok()
    }

    /// Current counters.
    pub fn stats(&self) -> CodecStats {
        CodecStats {
            generated: self.generated.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            compressed: self.compressed.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
        }
    }
}

impl Default for DeltaCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}
