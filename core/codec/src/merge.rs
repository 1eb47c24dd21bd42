//! Combining and reversing deltas.

use std::collections::BTreeMap;
use uuid::Uuid;

use parcelsync_common::{Error, Result};

use crate::compress::decompress_delta;
use crate::delta::{Delta, DeltaOperation, FieldChange};

/// Reverse a delta: replaying the result undoes the original.
///
/// A create becomes a delete and vice versa. Metadata is recomputed for the
/// reversed change list.
pub fn invert_delta(delta: &Delta) -> Result<Delta> {
    let delta = decompress_delta(delta)?;
    let changes: Vec<FieldChange> = delta.changes.iter().rev().map(FieldChange::inverted).collect();
    let operation = match delta.operation {
        DeltaOperation::Create => DeltaOperation::Delete,
        DeltaOperation::Delete => DeltaOperation::Create,
        DeltaOperation::Update => DeltaOperation::Update,
    };
    let metadata = match delta.metadata {
        Some(_) => Some(Delta::compute_metadata(&changes)?),
        None => None,
    };

    Ok(Delta {
        changes,
        operation,
        metadata,
        ..delta
    })
}

/// Merge same-document deltas given in enqueue order.
///
/// Field changes are concatenated chronologically, so replaying the merged
/// delta lets the later change to a field win. Returns `Ok(None)` when the
/// sequence cancels out (created and deleted before ever reaching the
/// server) or when `deltas` is empty.
///
/// # Errors
/// - Deltas target different documents
/// - A compressed payload cannot be decoded
pub fn merge_deltas(deltas: &[Delta]) -> Result<Option<Delta>> {
    let (Some(first), Some(last)) = (deltas.first(), deltas.last()) else {
        return Ok(None);
    };

    if deltas
        .iter()
        .any(|d| d.collection != first.collection || d.document_id != first.document_id)
    {
        return Err(Error::InvalidInput(format!(
            "cannot merge deltas of different documents into {}/{}",
            first.collection, first.document_id
        )));
    }

    if deltas.len() == 1 {
        return Ok(Some(decompress_delta(first)?));
    }

    let operation = match (first.operation, last.operation) {
        (DeltaOperation::Create, DeltaOperation::Delete) => return Ok(None),
        (_, DeltaOperation::Delete) => DeltaOperation::Delete,
        (DeltaOperation::Create, _) => DeltaOperation::Create,
        _ => DeltaOperation::Update,
    };

    let mut changes = Vec::new();
    for delta in deltas {
        changes.extend(decompress_delta(delta)?.changes);
    }

    let metadata = if deltas.iter().any(|d| d.metadata.is_some()) {
        Some(Delta::compute_metadata(&changes)?)
    } else {
        None
    };

    Ok(Some(Delta {
        id: Uuid::new_v4().to_string(),
        collection: first.collection.clone(),
        document_id: first.document_id.clone(),
        client_id: first.client_id.clone(),
        sync_version: first.sync_version,
        source: last.source,
        operation,
        changes,
        compressed: false,
        payload: None,
        metadata,
        timestamp: last.timestamp,
    }))
}

/// Last-wins view of a delta, keyed by dotted path in sorted order.
pub fn effective_changes(delta: &Delta) -> Result<BTreeMap<String, FieldChange>> {
    let delta = decompress_delta(delta)?;
    let mut effective = BTreeMap::new();
    for change in delta.changes {
        effective.insert(change.dotted_path(), change);
    }
    Ok(effective)
}
