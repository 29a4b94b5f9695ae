//! Sealed episode checkpoints.
//!
//! An episode is an immutable record of a milestone: the working set before
//! and after (copied by value, never shared), the ledger span the episode
//! covers, and the memory ids committed under its token.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inclusive range of ledger sequence ids covered by an episode.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerSpan {
    pub from_seq: u64,
    pub to_seq: u64,
}

/// Deterministic digest of the ledger tail at seal time.
///
/// `event_counts` is keyed by wire tag in a sorted map so serialization is
/// byte-stable; `tail` holds the last N raw ledger lines.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EpisodeSummary {
    pub event_counts: BTreeMap<String, u64>,
    pub tail: Vec<String>,
}

/// Immutable checkpoint written to `episodes/<episode_id>.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Episode {
    #[serde(rename = "_schema_version")]
    pub schema_version: String,
    pub episode_id: String,
    pub run_id: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub ws_before: crate::working_set::WorkingSet,
    pub ws_after: crate::working_set::WorkingSet,
    pub ledger_span: LedgerSpan,
    pub committed_memory_ids: Vec<String>,
    pub next_entry_point: String,
    pub summary: EpisodeSummary,
}
