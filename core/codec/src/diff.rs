//! Field-level diff and replay.

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use uuid::Uuid;

use parcelsync_common::{Error, Result};

use crate::compress::decompress_delta;
use crate::delta::{ChangeKind, Delta, DeltaContext, DeltaOperation, FieldChange};

/// Documents nested deeper than this are rejected.
const MAX_DIFF_DEPTH: usize = 100;

/// Options for [`create_delta`].
#[derive(Debug, Clone)]
pub struct DeltaOptions {
    /// Attach change count and checksum.
    pub include_metadata: bool,
    /// Ask for compression; the caller's codec decides based on size.
    pub compress_values: bool,
    /// Dotted paths never diffed. A top-level name excludes its subtree.
    pub exclude_fields: Vec<String>,
}

impl Default for DeltaOptions {
    fn default() -> Self {
        Self {
            include_metadata: true,
            compress_values: false,
            exclude_fields: Vec::new(),
        }
    }
}

impl DeltaOptions {
    /// Set excluded field paths.
    pub fn with_exclude_fields(mut self, fields: Vec<String>) -> Self {
        self.exclude_fields = fields;
        self
    }

    /// Enable or disable metadata.
    pub fn with_metadata(mut self, include: bool) -> Self {
        self.include_metadata = include;
        self
    }

    /// Request compression.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress_values = compress;
        self
    }

    fn is_excluded(&self, path: &[String]) -> bool {
        if self.exclude_fields.is_empty() {
            return false;
        }
        let dotted = path.join(".");
        self.exclude_fields.iter().any(|excluded| {
            dotted == *excluded
                || (dotted.len() > excluded.len()
                    && dotted.starts_with(excluded.as_str())
                    && dotted.as_bytes()[excluded.len()] == b'.')
        })
    }
}

/// Compute the delta turning `old` into `new`.
///
/// - `old == None` describes a creation, `new == None` a deletion.
/// - Returns `Ok(None)` when the documents are equal after exclusions, or
///   when both sides are absent.
/// - Compression is not applied here; see [`crate::DeltaCodec::create`].
///
/// # Errors
/// - Either document is not a JSON object
/// - Nesting exceeds the maximum depth
pub fn create_delta(
    old: Option<&Value>,
    new: Option<&Value>,
    ctx: &DeltaContext,
    options: &DeltaOptions,
) -> Result<Option<Delta>> {
    let empty = Map::new();
    let (operation, old_obj, new_obj) = match (old, new) {
        (None, None) => return Ok(None),
        (None, Some(new)) => (DeltaOperation::Create, &empty, as_object(new)?),
        (Some(old), None) => (DeltaOperation::Delete, as_object(old)?, &empty),
        (Some(old), Some(new)) => (DeltaOperation::Update, as_object(old)?, as_object(new)?),
    };

    let mut changes = Vec::new();
    let mut path = Vec::new();
    diff_objects(old_obj, new_obj, &mut path, options, &mut changes, 0)?;

    // Creations and deletions are meaningful even for an empty document.
    if changes.is_empty() && operation == DeltaOperation::Update {
        return Ok(None);
    }

    let metadata = if options.include_metadata {
        Some(Delta::compute_metadata(&changes)?)
    } else {
        None
    };

    Ok(Some(Delta {
        id: Uuid::new_v4().to_string(),
        collection: ctx.collection.clone(),
        document_id: ctx.document_id.clone(),
        client_id: ctx.client_id.clone(),
        sync_version: ctx.sync_version,
        source: ctx.source,
        operation,
        changes,
        compressed: false,
        payload: None,
        metadata,
        timestamp: Utc::now(),
    }))
}

/// Replay `delta` on top of `base`.
///
/// Returns `Ok(None)` when the delta deletes the document; the caller must
/// then delete rather than upsert. A missing base is treated as an empty
/// document. Replaying the same delta twice yields the same document.
///
/// # Errors
/// - Base is not a JSON object
/// - Compressed payload cannot be decoded
pub fn apply_delta(base: Option<&Value>, delta: &Delta) -> Result<Option<Value>> {
    if delta.is_delete() {
        return Ok(None);
    }

    let expanded;
    let delta = if delta.compressed {
        expanded = decompress_delta(delta)?;
        &expanded
    } else {
        delta
    };

    let mut doc = match base {
        Some(value) => Value::Object(as_object(value)?.clone()),
        None => Value::Object(Map::new()),
    };

    for change in &delta.changes {
        match change.kind {
            ChangeKind::Added | ChangeKind::Modified => {
                let value = change.new.clone().ok_or_else(|| {
                    Error::Validation(format!(
                        "change to '{}' has no new value",
                        change.dotted_path()
                    ))
                })?;
                set_path(&mut doc, &change.path, value);
            }
            ChangeKind::Removed => remove_path(&mut doc, &change.path),
        }
    }

    Ok(Some(doc))
}

fn as_object(value: &Value) -> Result<&Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| Error::InvalidInput("documents must be JSON objects".to_string()))
}

fn diff_objects(
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    path: &mut Vec<String>,
    options: &DeltaOptions,
    changes: &mut Vec<FieldChange>,
    depth: usize,
) -> Result<()> {
    if depth > MAX_DIFF_DEPTH {
        return Err(Error::InvalidInput(format!(
            "document nesting exceeds {} levels",
            MAX_DIFF_DEPTH
        )));
    }

    // Sorted union keeps the change order independent of map internals.
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();

    for key in keys {
        path.push(key.clone());
        if !options.is_excluded(path) {
            match (old.get(key), new.get(key)) {
                (Some(Value::Object(o)), Some(Value::Object(n))) => {
                    diff_objects(o, n, path, options, changes, depth + 1)?;
                }
                (Some(o), Some(n)) => {
                    if o != n {
                        changes.push(FieldChange::modified(path.clone(), o.clone(), n.clone()));
                    }
                }
                (Some(o), None) => changes.push(FieldChange::removed(path.clone(), o.clone())),
                (None, Some(n)) => changes.push(FieldChange::added(path.clone(), n.clone())),
                (None, None) => {}
            }
        }
        path.pop();
    }

    Ok(())
}

fn set_path(doc: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut current = doc;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.clone(), value);
    }
}

fn remove_path(doc: &mut Value, path: &[String]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut current = doc;
    for segment in parents {
        match current.get_mut(segment.as_str()) {
            Some(next) => current = next,
            None => return,
        }
    }

    if let Value::Object(map) = current {
        map.remove(last);
    }
}
