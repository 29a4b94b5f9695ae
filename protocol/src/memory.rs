//! Long-term memory items and change requests.
//!
//! Memory mutations are two-phase: a change request is *proposed* into a
//! server-minted batch, and only a milestone token can flip the batch to
//! *committed*.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SCHEMA_VERSION;

/// What kind of knowledge an item records.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Fact,
    Preference,
    Skill,
    Other,
}

/// Visibility domain of a memory item.
///
/// `global` items are visible to every run of the namespace; the other
/// scopes restrict visibility to the exact-match identifier of the run
/// that proposed them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    Global,
    Run,
    Task,
    Thread,
}

/// Lifecycle state. Transitions form a DAG:
/// `proposed → committed → retracted`, never backwards.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    Proposed,
    Committed,
    Retracted,
}

/// One long-term memory record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryItem {
    #[serde(rename = "_schema_version")]
    pub schema_version: String,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MemoryType,
    pub scope: MemoryScope,
    pub content: String,
    /// In `[0, 1]`; part of the search tie-break order.
    pub confidence: f64,
    pub rationale: String,
    /// Opaque ids pointing at whatever produced this memory.
    #[serde(default)]
    pub source_refs: Vec<String>,
    pub status: MemoryStatus,
    /// The propose batch this item belongs to.
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<DateTime<Utc>>,
}

impl MemoryItem {
    pub fn schema_version_ok(&self) -> bool {
        self.schema_version == SCHEMA_VERSION
    }
}

/// Operation carried by a change request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McrOp {
    Add,
    Update,
    Retract,
}

/// Memory Change Request: a proposed mutation of long-term memory.
///
/// For `add`, the item fields are required; for `update` they are field
/// overrides on `target_id`; for `retract` only `target_id` matters. The
/// op-specific requirements are enforced by the memory store's validator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryChange {
    pub op: McrOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MemoryType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<MemoryScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_refs: Vec<String>,
}

impl Default for McrOp {
    fn default() -> Self {
        Self::Add
    }
}

impl MemoryChange {
    /// A well-formed `add` request.
    pub fn add(kind: MemoryType, scope: MemoryScope, content: impl Into<String>) -> Self {
        Self {
            op: McrOp::Add,
            kind: Some(kind),
            scope: Some(scope),
            content: Some(content.into()),
            confidence: Some(1.0),
            rationale: Some(String::new()),
            ..Self::default()
        }
    }

    /// A `retract` request against an existing item.
    pub fn retract(target_id: impl Into<String>) -> Self {
        Self {
            op: McrOp::Retract,
            target_id: Some(target_id.into()),
            ..Self::default()
        }
    }
}
