//! Structural validation of deltas.

use parcelsync_common::{Error, Result};

use crate::compress::decode_payload;
use crate::delta::{ChangeKind, Delta, DeltaOperation, FieldChange};

/// Whether `delta` is well-formed enough to transmit or apply.
pub fn validate_delta(delta: &Delta) -> bool {
    check_delta(delta).is_ok()
}

/// Validate `delta`, reporting the first problem found.
///
/// # Errors
/// - `Error::Validation` describing the defect
pub fn check_delta(delta: &Delta) -> Result<()> {
    require_non_empty("id", &delta.id)?;
    require_non_empty("collection", &delta.collection)?;
    require_non_empty("documentId", &delta.document_id)?;
    require_non_empty("clientId", &delta.client_id)?;

    let decoded;
    let changes: &[FieldChange] = if delta.compressed {
        if !delta.changes.is_empty() {
            return Err(invalid(delta, "compressed delta carries inline changes"));
        }
        decoded = decode_payload(delta)
            .map_err(|e| invalid(delta, &format!("payload unreadable: {}", e)))?;
        &decoded
    } else {
        if delta.payload.is_some() {
            return Err(invalid(delta, "uncompressed delta carries a payload"));
        }
        &delta.changes
    };

    if changes.is_empty() && delta.operation == DeltaOperation::Update {
        return Err(invalid(delta, "update without changes"));
    }

    for change in changes {
        check_change(delta, change)?;
    }

    if let Some(metadata) = delta.metadata {
        let expected = Delta::compute_metadata(changes)?;
        if metadata.change_count != expected.change_count {
            return Err(invalid(
                delta,
                &format!(
                    "change count {} does not match {} changes",
                    metadata.change_count, expected.change_count
                ),
            ));
        }
        if metadata.checksum != expected.checksum {
            return Err(invalid(delta, "checksum mismatch"));
        }
    }

    Ok(())
}

fn check_change(delta: &Delta, change: &FieldChange) -> Result<()> {
    if change.path.is_empty() || change.path.iter().any(|segment| segment.is_empty()) {
        return Err(invalid(delta, "change with empty path"));
    }

    let well_formed = match change.kind {
        ChangeKind::Added => change.old.is_none() && change.new.is_some(),
        ChangeKind::Modified => change.old.is_some() && change.new.is_some(),
        ChangeKind::Removed => change.old.is_some() && change.new.is_none(),
    };

    if !well_formed {
        return Err(invalid(
            delta,
            &format!("{:?} change to '{}' is malformed", change.kind, change.dotted_path()),
        ));
    }
    Ok(())
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("delta field '{}' is empty", field)));
    }
    Ok(())
}

fn invalid(delta: &Delta, reason: &str) -> Error {
    Error::Validation(format!("delta {}: {}", delta.id, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::compress_delta;
    use crate::delta::DeltaContext;
    use crate::diff::{create_delta, DeltaOptions};
    use parcelsync_common::RecordKey;
    use serde_json::json;

    fn sample() -> Delta {
        let key = RecordKey::new("parcels", "P-7").unwrap();
        create_delta(
            Some(&json!({"value": 1})),
            Some(&json!({"value": 2, "zone": "C2"})),
            &DeltaContext::client(&key, "client-a", 1),
            &DeltaOptions::default(),
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn test_fresh_delta_is_valid() {
        assert!(validate_delta(&sample()));
    }

    #[test]
    fn test_missing_identity_is_invalid() {
        let mut delta = sample();
        delta.document_id.clear();
        assert!(!validate_delta(&delta));
    }

    #[test]
    fn test_malformed_change_is_invalid() {
        let mut delta = sample();
        delta.metadata = None;
        delta.changes[0].new = None;
        let err = check_delta(&delta).unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn test_tampered_change_fails_checksum() {
        let mut delta = sample();
        delta.changes[0].new = Some(json!(999));
        assert!(check_delta(&delta).unwrap_err().to_string().contains("checksum"));
    }

    #[test]
    fn test_empty_update_is_invalid() {
        let mut delta = sample();
        delta.changes.clear();
        delta.metadata = None;
        assert!(!validate_delta(&delta));
    }

    #[test]
    fn test_compressed_delta_is_validated_through_payload() {
        let packed = compress_delta(&sample(), 0).unwrap();
        assert!(validate_delta(&packed));

        let mut broken = packed.clone();
        broken.payload = Some("AAAA".to_string());
        assert!(!validate_delta(&broken));

        let mut mixed = packed;
        mixed.changes = sample().changes;
        assert!(!validate_delta(&mixed));
    }
}
