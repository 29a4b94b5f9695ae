//! Working-set document and patch types.
//!
//! The working set is the live, mutable task-state document for one run.
//! It is versioned by `_update_seq` and mutated only through [`WsPatch`]
//! compare-and-swap patches applied by the working-set manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SCHEMA_VERSION;

/// Execution status of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Freshly created, nothing executed yet.
    Boot,
    /// Actively working a step.
    Busy,
    /// Waiting between steps.
    Idle,
    /// Terminal: objective met.
    Done,
    /// Terminal: gave up.
    Failed,
}

/// One unit of context carried by the working set.
///
/// Items live either in `pinned_context` (never evicted) or
/// `sliding_context` (evicted deterministically under token pressure).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextItem {
    /// Unique within the working set, across both pinned and sliding.
    pub id: String,
    pub content: String,
    /// ISO-8601 UTC creation time; part of the eviction total order.
    pub timestamp: DateTime<Utc>,
    /// Higher priority is retained longer.
    pub priority: i64,
    /// Precomputed token estimate; recomputed from `content` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
}

/// The live, mutable task-state document for one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkingSet {
    #[serde(rename = "_schema_version")]
    pub schema_version: String,
    pub run_id: String,
    pub task_id: String,
    pub thread_id: String,
    /// Strictly increasing by +1 per successful patch; starts at 0.
    #[serde(rename = "_update_seq")]
    pub update_seq: u64,
    pub objective: String,
    pub acceptance_criteria: Vec<String>,
    pub constraints: Vec<String>,
    pub status: RunStatus,
    pub current_stage: String,
    pub next_action: String,
    pub pinned_context: Vec<ContextItem>,
    pub sliding_context: Vec<ContextItem>,
}

impl WorkingSet {
    /// Construct the `_update_seq = 0` document for a newly booted run.
    pub fn initial(
        run_id: String,
        task_id: String,
        thread_id: String,
        objective: String,
        acceptance_criteria: Vec<String>,
        constraints: Vec<String>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id,
            task_id,
            thread_id,
            update_seq: 0,
            objective,
            acceptance_criteria,
            constraints,
            status: RunStatus::Boot,
            current_stage: "BOOT".to_string(),
            next_action: String::new(),
            pinned_context: Vec::new(),
            sliding_context: Vec::new(),
        }
    }

    /// Look up a context item by id in either region.
    pub fn find_item(&self, id: &str) -> Option<&ContextItem> {
        self.pinned_context
            .iter()
            .chain(self.sliding_context.iter())
            .find(|item| item.id == id)
    }
}

/// Shallow field overrides carried by a patch's `set` directive.
///
/// Only the task-envelope and execution-state fields are settable; identity
/// and versioning fields are managed by the engine.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WsSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_criteria: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<String>,
}

impl WsSet {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// A compare-and-swap mutation of the working set.
///
/// Directives are applied in a fixed order: `set`, `pinned_remove`,
/// `pinned_append`, `sliding_remove`, `sliding_append`. The patch only
/// applies when `expected_seq` equals the document's current `_update_seq`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WsPatch {
    #[serde(rename = "_schema_version")]
    pub schema_version: String,
    pub expected_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<WsSet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pinned_append: Vec<ContextItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pinned_remove: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sliding_append: Vec<ContextItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sliding_remove: Vec<String>,
    /// Convenience shorthand for `set.status`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
}

impl WsPatch {
    /// An empty patch against the given sequence number.
    pub fn against(expected_seq: u64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            expected_seq,
            ..Self::default()
        }
    }

    /// Counts of each directive, recorded in `WS_UPDATE_APPLIED` payloads.
    pub fn directives_summary(&self) -> DirectivesSummary {
        DirectivesSummary {
            set_fields: self.set.as_ref().map_or(0, |s| {
                [
                    s.objective.is_some(),
                    s.acceptance_criteria.is_some(),
                    s.constraints.is_some(),
                    s.status.is_some(),
                    s.current_stage.is_some(),
                    s.next_action.is_some(),
                ]
                .iter()
                .filter(|present| **present)
                .count() as u64
            }) + u64::from(self.status.is_some()),
            pinned_append: self.pinned_append.len() as u64,
            pinned_remove: self.pinned_remove.len() as u64,
            sliding_append: self.sliding_append.len() as u64,
            sliding_remove: self.sliding_remove.len() as u64,
        }
    }
}

/// Per-directive counts for ledger payloads.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectivesSummary {
    pub set_fields: u64,
    pub pinned_append: u64,
    pub pinned_remove: u64,
    pub sliding_append: u64,
    pub sliding_remove: u64,
}
