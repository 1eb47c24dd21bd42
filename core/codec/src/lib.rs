//! ParcelSync delta codec.
//!
//! Computes minimal field-level differences between two versions of a
//! document, replays them, and packs them for transmission:
//! - Shallow-per-field diff with recursive descent into nested objects
//! - Arrays are opaque and replaced wholesale
//! - Optional zstd compression above a size threshold
//! - Structural validation before a delta is trusted

pub mod codec;
pub mod compress;
pub mod delta;
pub mod diff;
pub mod merge;
pub mod validate;

pub use codec::{CodecConfig, CodecStats, DeltaCodec};
pub use compress::{compress_delta, decompress_delta, DEFAULT_COMPRESSION_THRESHOLD};
pub use delta::{
    ChangeKind, Delta, DeltaContext, DeltaMetadata, DeltaOperation, DeltaSource, FieldChange,
};
pub use diff::{apply_delta, create_delta, DeltaOptions};
pub use merge::{effective_changes, invert_delta, merge_deltas};
pub use validate::{check_delta, validate_delta};
