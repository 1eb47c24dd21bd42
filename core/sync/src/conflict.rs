//! Conflict detection and resolution.
//!
//! Both deltas handed to the resolver describe edits of the same base
//! document: the local one is what this client queued, the remote one is
//! what the server applied since the client's `sync_version`. The resolved
//! delta is expressed against that same base.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use parcelsync_codec::{decompress_delta, Delta, DeltaOperation, DeltaSource, FieldChange};
use parcelsync_common::{Error, Result};

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// The later edit wins wholesale; ties go to the server.
    #[default]
    TimestampWins,
    /// The local edit always wins.
    ClientWins,
    /// The server edit always wins.
    ServerWins,
    /// Arbitrate per field path; edits of unrelated paths are all kept.
    MergeFields,
}

impl ConflictStrategy {
    pub const ALL: [ConflictStrategy; 4] = [
        ConflictStrategy::TimestampWins,
        ConflictStrategy::ClientWins,
        ConflictStrategy::ServerWins,
        ConflictStrategy::MergeFields,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::TimestampWins => "timestamp-wins",
            ConflictStrategy::ClientWins => "client-wins",
            ConflictStrategy::ServerWins => "server-wins",
            ConflictStrategy::MergeFields => "merge-fields",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    /// Accepts kebab, snake and camel case spellings.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "timestampwins" => Ok(ConflictStrategy::TimestampWins),
            "clientwins" => Ok(ConflictStrategy::ClientWins),
            "serverwins" => Ok(ConflictStrategy::ServerWins),
            "mergefields" => Ok(ConflictStrategy::MergeFields),
            _ => Err(Error::Config(format!("unknown conflict strategy '{}'", s))),
        }
    }
}

/// Side that owns a field under `MergeFields`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldOwner {
    Client,
    Server,
}

/// Which side the resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionOrigin {
    Client,
    Server,
    Merged,
}

/// Inputs that steer resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub strategy: ConflictStrategy,
    /// Dotted path (or an enclosing path) to owning side.
    pub field_priorities: BTreeMap<String, FieldOwner>,
}

impl ResolveOptions {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self {
            strategy,
            field_priorities: BTreeMap::new(),
        }
    }

    pub fn with_priority(mut self, field: impl Into<String>, owner: FieldOwner) -> Self {
        self.field_priorities.insert(field.into(), owner);
        self
    }
}

/// Outcome of resolving one conflict.
///
/// When `requires_manual_review` is set, `resolved` is `None` and `origin`
/// is `Server`: the server copy stays authoritative until someone decides.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolution {
    pub resolved: Option<Delta>,
    pub requires_manual_review: bool,
    pub origin: ResolutionOrigin,
    pub reason: Option<String>,
}

impl ConflictResolution {
    fn client(local: Delta, reason: &str) -> Self {
        Self {
            resolved: Some(local),
            requires_manual_review: false,
            origin: ResolutionOrigin::Client,
            reason: Some(reason.to_string()),
        }
    }

    fn server(remote: Delta, reason: &str) -> Self {
        Self {
            resolved: Some(remote),
            requires_manual_review: false,
            origin: ResolutionOrigin::Server,
            reason: Some(reason.to_string()),
        }
    }

    fn manual(reason: String) -> Self {
        Self {
            resolved: None,
            requires_manual_review: true,
            origin: ResolutionOrigin::Server,
            reason: Some(reason),
        }
    }
}

/// Resolve a conflict between a local and a remote delta.
///
/// # Errors
/// - A compressed delta cannot be decoded
pub fn resolve_conflict(
    local: &Delta,
    remote: &Delta,
    options: &ResolveOptions,
) -> Result<ConflictResolution> {
    let local = decompress_delta(local)?;
    let remote = decompress_delta(remote)?;

    if local.is_delete() && remote.is_delete() {
        return Ok(ConflictResolution::manual(
            "record deleted on both sides".to_string(),
        ));
    }

    let resolution = match options.strategy {
        ConflictStrategy::TimestampWins => {
            if local.timestamp > remote.timestamp {
                ConflictResolution::client(local, "local edit is newer")
            } else {
                ConflictResolution::server(remote, "server edit is newer")
            }
        }
        ConflictStrategy::ClientWins => ConflictResolution::client(local, "client wins"),
        ConflictStrategy::ServerWins => ConflictResolution::server(remote, "server wins"),
        ConflictStrategy::MergeFields => merge_fields(local, remote, &options.field_priorities)?,
    };
    Ok(resolution)
}

/// Changes whose paths are equal or nested in one another, by side.
/// Entries carry the change's position in its delta.
#[derive(Default)]
struct PathGroup {
    paths: Vec<String>,
    mine: Vec<(usize, FieldChange)>,
    theirs: Vec<(usize, FieldChange)>,
}

impl PathGroup {
    fn relates_to(&self, path: &str) -> bool {
        self.paths.iter().any(|p| paths_overlap(p, path))
    }

    fn absorb(&mut self, other: PathGroup) {
        self.paths.extend(other.paths);
        self.mine.extend(other.mine);
        self.theirs.extend(other.theirs);
    }

    /// Shortest path of the group, lexicographically first among equals.
    fn name(&self) -> &str {
        self.paths
            .iter()
            .min_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
            .map(String::as_str)
            .unwrap_or("")
    }
}

fn paths_overlap(a: &str, b: &str) -> bool {
    let nested = |outer: &str, inner: &str| {
        inner.len() > outer.len()
            && inner.starts_with(outer)
            && inner.as_bytes()[outer.len()] == b'.'
    };
    a == b || nested(a, b) || nested(b, a)
}

/// Partition both sides' changes into groups of overlapping paths, keyed by
/// group name.
fn group_changes(local: &[FieldChange], remote: &[FieldChange]) -> BTreeMap<String, PathGroup> {
    let mut groups: Vec<PathGroup> = Vec::new();
    let tagged = local
        .iter()
        .enumerate()
        .map(|(i, c)| (true, i, c))
        .chain(remote.iter().enumerate().map(|(i, c)| (false, i, c)));

    for (is_local, index, change) in tagged {
        let path = change.dotted_path();
        let mut group = PathGroup::default();
        let mut rest = Vec::with_capacity(groups.len());
        for existing in groups {
            if existing.relates_to(&path) {
                group.absorb(existing);
            } else {
                rest.push(existing);
            }
        }
        if is_local {
            group.mine.push((index, change.clone()));
        } else {
            group.theirs.push((index, change.clone()));
        }
        group.paths.push(path);
        rest.push(group);
        groups = rest;
    }

    groups
        .into_iter()
        .map(|mut group| {
            group.mine.sort_by_key(|(i, _)| *i);
            group.theirs.sort_by_key(|(i, _)| *i);
            (group.name().to_string(), group)
        })
        .collect()
}

fn merge_fields(
    local: Delta,
    remote: Delta,
    priorities: &BTreeMap<String, FieldOwner>,
) -> Result<ConflictResolution> {
    if local.is_delete() || remote.is_delete() {
        return Ok(ConflictResolution::manual(
            "delete conflicts with a concurrent update".to_string(),
        ));
    }

    // Changes keep their chronological order inside each group.
    let groups = group_changes(&local.changes, &remote.changes);

    let local_newer = local.timestamp > remote.timestamp;
    let mut changes = Vec::new();
    let (mut took_local, mut took_remote) = (false, false);

    for (field, group) in groups {
        let mine: Vec<FieldChange> = group.mine.into_iter().map(|(_, c)| c).collect();
        let theirs: Vec<FieldChange> = group.theirs.into_iter().map(|(_, c)| c).collect();
        let winner = if theirs.is_empty() {
            FieldOwner::Client
        } else if mine.is_empty() {
            FieldOwner::Server
        } else {
            match priority_for(&mine, &theirs, priorities) {
                Some(owner) => owner,
                None if touches_array(&mine) && touches_array(&theirs) => {
                    return Ok(ConflictResolution::manual(format!(
                        "array field '{}' changed on both sides",
                        field
                    )));
                }
                None if local_newer => FieldOwner::Client,
                None => FieldOwner::Server,
            }
        };

        match winner {
            FieldOwner::Client => {
                took_local = true;
                changes.extend(mine);
            }
            FieldOwner::Server => {
                took_remote = true;
                changes.extend(theirs);
            }
        }
    }

    let origin = match (took_local, took_remote) {
        (true, false) => ResolutionOrigin::Client,
        (false, true) => ResolutionOrigin::Server,
        _ => ResolutionOrigin::Merged,
    };

    let operation = if local.operation == DeltaOperation::Create
        && remote.operation == DeltaOperation::Create
    {
        DeltaOperation::Create
    } else {
        DeltaOperation::Update
    };
    let metadata = if local.metadata.is_some() || remote.metadata.is_some() {
        Some(Delta::compute_metadata(&changes)?)
    } else {
        None
    };
    let timestamp: DateTime<Utc> = local.timestamp.max(remote.timestamp);

    let merged = Delta {
        id: Uuid::new_v4().to_string(),
        collection: local.collection.clone(),
        document_id: local.document_id.clone(),
        client_id: local.client_id.clone(),
        sync_version: remote.sync_version,
        source: DeltaSource::Client,
        operation,
        changes,
        compressed: false,
        payload: None,
        metadata,
        timestamp,
    };

    Ok(ConflictResolution {
        resolved: Some(merged),
        requires_manual_review: false,
        origin,
        reason: Some("fields merged".to_string()),
    })
}

/// Explicit owner for a group: full dotted paths first (in sorted order),
/// then their enclosing paths, nearest first.
fn priority_for(
    mine: &[FieldChange],
    theirs: &[FieldChange],
    priorities: &BTreeMap<String, FieldOwner>,
) -> Option<FieldOwner> {
    let mut paths: Vec<String> = mine
        .iter()
        .chain(theirs)
        .map(FieldChange::dotted_path)
        .collect();
    paths.sort();
    paths.dedup();

    paths
        .iter()
        .find_map(|path| priorities.get(path).copied())
        .or_else(|| {
            paths.iter().find_map(|path| {
                path.rmatch_indices('.')
                    .find_map(|(at, _)| priorities.get(&path[..at]).copied())
            })
        })
}

fn touches_array(changes: &[FieldChange]) -> bool {
    changes.iter().any(|change| {
        matches!(change.old, Some(Value::Array(_))) || matches!(change.new, Some(Value::Array(_)))
    })
}
