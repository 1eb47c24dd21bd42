//! Delta compression.
//!
//! The change list is serialized to compact JSON, compressed with zstd and
//! carried base64-encoded in `Delta::payload`, so the wire format stays JSON.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::io::Cursor;

use parcelsync_common::{Error, Result};

use crate::delta::{Delta, FieldChange};

/// Serialized change lists at or below this size are sent uncompressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// zstd level 0 selects the library default.
const ZSTD_LEVEL: i32 = 0;

/// Compress the change list if it is larger than `threshold` bytes.
///
/// Already-compressed deltas and small deltas are returned unchanged.
pub fn compress_delta(delta: &Delta, threshold: usize) -> Result<Delta> {
    if delta.compressed {
        return Ok(delta.clone());
    }

    let json = serde_json::to_vec(&delta.changes)?;
    if json.len() <= threshold {
        return Ok(delta.clone());
    }

    let original_size = json.len();
    let compressed = zstd::stream::encode_all(Cursor::new(json), ZSTD_LEVEL)
        .map_err(|e| Error::Compression(format!("zstd encode failed: {}", e)))?;

    tracing::debug!(
        delta = %delta.id,
        original_size,
        compressed_size = compressed.len(),
        "compressed delta"
    );

    let mut packed = delta.clone();
    packed.changes = Vec::new();
    packed.payload = Some(STANDARD.encode(compressed));
    packed.compressed = true;
    Ok(packed)
}

/// Expand a compressed delta. Uncompressed deltas are returned unchanged.
pub fn decompress_delta(delta: &Delta) -> Result<Delta> {
    if !delta.compressed {
        return Ok(delta.clone());
    }

    let mut expanded = delta.clone();
    expanded.changes = decode_payload(delta)?;
    expanded.payload = None;
    expanded.compressed = false;
    Ok(expanded)
}

pub(crate) fn decode_payload(delta: &Delta) -> Result<Vec<FieldChange>> {
    let payload = delta
        .payload
        .as_deref()
        .ok_or_else(|| Error::Compression("compressed delta has no payload".to_string()))?;

    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| Error::Compression(format!("invalid base64 payload: {}", e)))?;

    let json = zstd::stream::decode_all(Cursor::new(bytes))
        .map_err(|e| Error::Compression(format!("zstd decode failed: {}", e)))?;

    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{create_delta, DeltaOptions};
    use crate::delta::DeltaContext;
    use crate::diff::tests::document;
    use parcelsync_common::RecordKey;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn large_delta() -> Delta {
        let key = RecordKey::new("assessments", "A-9").unwrap();
        let ctx = DeltaContext::client(&key, "client-a", 1);
        let notes: String = "land valuation notes ".repeat(200);
        create_delta(
            Some(&json!({"notes": ""})),
            Some(&json!({"notes": notes, "value": 250_000})),
            &ctx,
            &DeltaOptions::default(),
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn test_small_delta_is_not_compressed() {
        let key = RecordKey::new("permits", "X").unwrap();
        let ctx = DeltaContext::client(&key, "c", 0);
        let delta = create_delta(
            Some(&json!({"a": 1})),
            Some(&json!({"a": 2})),
            &ctx,
            &DeltaOptions::default(),
        )
        .unwrap()
        .unwrap();

        let packed = compress_delta(&delta, DEFAULT_COMPRESSION_THRESHOLD).unwrap();
        assert!(!packed.compressed);
        assert_eq!(packed, delta);
    }

    #[test]
    fn test_compression_transparency() {
        let delta = large_delta();
        let packed = compress_delta(&delta, DEFAULT_COMPRESSION_THRESHOLD).unwrap();

        assert!(packed.compressed);
        assert!(packed.changes.is_empty());
        assert!(packed.payload.as_ref().unwrap().len() < serde_json::to_vec(&delta.changes).unwrap().len());

        let restored = decompress_delta(&packed).unwrap();
        assert_eq!(restored, delta);
    }

    #[test]
    fn test_compress_and_decompress_are_idempotent() {
        let delta = large_delta();
        let once = compress_delta(&delta, 16).unwrap();
        let twice = compress_delta(&once, 16).unwrap();
        assert_eq!(once, twice);

        let plain = decompress_delta(&delta).unwrap();
        assert_eq!(plain, delta);
    }

    #[test]
    fn test_corrupt_payload_is_rejected() {
        let mut packed = compress_delta(&large_delta(), 16).unwrap();
        packed.payload = Some("not base64 at all!".to_string());
        assert!(matches!(decompress_delta(&packed), Err(Error::Compression(_))));

        packed.payload = Some(STANDARD.encode(b"plain bytes, not zstd"));
        assert!(decompress_delta(&packed).is_err());
    }

    #[test]
    fn test_null_values_survive_compression() {
        let key = RecordKey::new("permits", "N").unwrap();
        let ctx = DeltaContext::client(&key, "c", 0);
        let delta = create_delta(
            Some(&json!({"inspector": "Lee"})),
            Some(&json!({"inspector": Value::Null})),
            &ctx,
            &DeltaOptions::default(),
        )
        .unwrap()
        .unwrap();

        let restored = decompress_delta(&compress_delta(&delta, 0).unwrap()).unwrap();
        assert_eq!(restored.changes[0].new, Some(Value::Null));
    }

    proptest! {
        #[test]
        fn prop_compression_is_transparent(a in document(), b in document()) {
            let key = RecordKey::new("parcels", "P-1").unwrap();
            let ctx = DeltaContext::client(&key, "client-a", 1);
            if let Some(delta) = create_delta(Some(&a), Some(&b), &ctx, &DeltaOptions::default()).unwrap() {
                let packed = compress_delta(&delta, 0).unwrap();
                prop_assert!(packed.compressed);
                prop_assert_eq!(decompress_delta(&packed).unwrap(), delta);
            }
        }
    }
}
