//! Delta and field change types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use parcelsync_common::RecordKey;

/// Who produced a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaSource {
    Client,
    Server,
}

/// Document-level effect of a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaOperation {
    /// The document did not exist before.
    Create,
    /// Fields of an existing document changed.
    Update,
    /// The document is removed; replaying yields no document.
    Delete,
}

/// Kind of change recorded for one field path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Field absent before, present after.
    Added,
    /// Field present on both sides with different values.
    Modified,
    /// Field present before, absent after.
    Removed,
}

/// One field-level change.
///
/// `old` and `new` keep JSON `null` distinct from "absent": a field set to
/// `null` is `Some(Value::Null)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Path segments from the document root.
    pub path: Vec<String>,
    pub kind: ChangeKind,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub old: Option<Value>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub new: Option<Value>,
}

fn present_value<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl FieldChange {
    /// A field that did not exist before.
    pub fn added(path: Vec<String>, new: Value) -> Self {
        Self {
            path,
            kind: ChangeKind::Added,
            old: None,
            new: Some(new),
        }
    }

    /// A field whose value changed.
    pub fn modified(path: Vec<String>, old: Value, new: Value) -> Self {
        Self {
            path,
            kind: ChangeKind::Modified,
            old: Some(old),
            new: Some(new),
        }
    }

    /// A field that no longer exists.
    pub fn removed(path: Vec<String>, old: Value) -> Self {
        Self {
            path,
            kind: ChangeKind::Removed,
            old: Some(old),
            new: None,
        }
    }

    /// Dotted form of the path (`owner.address.city`).
    pub fn dotted_path(&self) -> String {
        self.path.join(".")
    }

    /// First path segment, the field this change belongs to.
    pub fn top_level_field(&self) -> &str {
        self.path.first().map(String::as_str).unwrap_or_default()
    }

    /// The same change played backwards.
    pub fn inverted(&self) -> Self {
        let kind = match self.kind {
            ChangeKind::Added => ChangeKind::Removed,
            ChangeKind::Removed => ChangeKind::Added,
            ChangeKind::Modified => ChangeKind::Modified,
        };
        Self {
            path: self.path.clone(),
            kind,
            old: self.new.clone(),
            new: self.old.clone(),
        }
    }
}

/// Integrity information attached when a delta is created with metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaMetadata {
    /// Number of field changes (uncompressed).
    pub change_count: usize,
    /// CRC32 of the serialized, uncompressed change list.
    pub checksum: u32,
}

/// Identity of the document a delta is produced for.
#[derive(Debug, Clone)]
pub struct DeltaContext {
    pub collection: String,
    pub document_id: String,
    pub client_id: String,
    /// Server revision the old document is based on.
    pub sync_version: u64,
    pub source: DeltaSource,
}

impl DeltaContext {
    /// Context for a local (client) mutation.
    pub fn client(key: &RecordKey, client_id: impl Into<String>, sync_version: u64) -> Self {
        Self {
            collection: key.collection.clone(),
            document_id: key.id.clone(),
            client_id: client_id.into(),
            sync_version,
            source: DeltaSource::Client,
        }
    }

    /// Context for a server-side change.
    pub fn server(key: &RecordKey, sync_version: u64) -> Self {
        Self {
            collection: key.collection.clone(),
            document_id: key.id.clone(),
            client_id: "server".to_string(),
            sync_version,
            source: DeltaSource::Server,
        }
    }
}

/// Minimal description of the difference between two document versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub id: String,
    pub collection: String,
    pub document_id: String,
    pub client_id: String,
    pub sync_version: u64,
    pub source: DeltaSource,
    pub operation: DeltaOperation,
    #[serde(default)]
    pub changes: Vec<FieldChange>,
    #[serde(default)]
    pub compressed: bool,
    /// Base64 zstd frame of the change list when `compressed` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DeltaMetadata>,
    pub timestamp: DateTime<Utc>,
}

impl Delta {
    /// Key of the record this delta targets.
    pub fn record_key(&self) -> RecordKey {
        RecordKey::from_parts(self.collection.clone(), self.document_id.clone())
    }

    /// Whether replaying this delta removes the document.
    pub fn is_delete(&self) -> bool {
        self.operation == DeltaOperation::Delete
    }

    /// Compute integrity metadata over the current (uncompressed) changes.
    pub fn compute_metadata(changes: &[FieldChange]) -> parcelsync_common::Result<DeltaMetadata> {
        let bytes = serde_json::to_vec(changes)?;
        Ok(DeltaMetadata {
            change_count: changes.len(),
            checksum: crc32fast::hash(&bytes),
        })
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> parcelsync_common::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> parcelsync_common::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_survives_serialization() {
        let change = FieldChange::modified(vec!["owner".into()], json!("Ada"), Value::Null);
        let json = serde_json::to_string(&change).unwrap();
        let restored: FieldChange = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.new, Some(Value::Null));
        assert_eq!(restored, change);
    }

    #[test]
    fn test_absent_side_is_omitted() {
        let change = FieldChange::added(vec!["zone".into()], json!("R1"));
        let json = serde_json::to_value(&change).unwrap();
        assert!(json.get("old").is_none());
        assert_eq!(json["kind"], "added");
    }

    #[test]
    fn test_inverted_swaps_sides() {
        let change = FieldChange::removed(vec!["a".into(), "b".into()], json!(3));
        let inverted = change.inverted();
        assert_eq!(inverted.kind, ChangeKind::Added);
        assert_eq!(inverted.new, Some(json!(3)));
        assert!(inverted.old.is_none());
        assert_eq!(inverted.dotted_path(), "a.b");
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let delta = Delta {
            id: "d1".into(),
            collection: "parcels".into(),
            document_id: "P-1".into(),
            client_id: "c1".into(),
            sync_version: 4,
            source: DeltaSource::Client,
            operation: DeltaOperation::Update,
            changes: vec![],
            compressed: false,
            payload: None,
            metadata: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["documentId"], "P-1");
        assert_eq!(json["syncVersion"], 4);
        assert_eq!(json["source"], "client");
    }
}
