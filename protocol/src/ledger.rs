//! Run-ledger event records.
//!
//! One JSON object per line in `ledger/run.jsonl`. Sequence ids are dense
//! and monotonic within a run; lines are never rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::SCHEMA_VERSION;
use crate::working_set::DirectivesSummary;

/// Everything that can happen to a run, as recorded in its ledger.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Boot,
    WsUpdateApplied,
    WsUpdateRejected,
    MemoryProposed,
    MemoryCommitted,
    EpisodeSealed,
    ResumeSnapshot,
    ResumeLoaded,
}

impl EventType {
    /// The wire tag, e.g. `WS_UPDATE_APPLIED`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boot => "BOOT",
            Self::WsUpdateApplied => "WS_UPDATE_APPLIED",
            Self::WsUpdateRejected => "WS_UPDATE_REJECTED",
            Self::MemoryProposed => "MEMORY_PROPOSED",
            Self::MemoryCommitted => "MEMORY_COMMITTED",
            Self::EpisodeSealed => "EPISODE_SEALED",
            Self::ResumeSnapshot => "RESUME_SNAPSHOT",
            Self::ResumeLoaded => "RESUME_LOADED",
        }
    }
}

/// One append-only ledger record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerEvent {
    #[serde(rename = "_schema_version")]
    pub schema_version: String,
    /// Dense, strictly increasing by +1 within a run. Assigned by the
    /// ledger on append when left at `u64::MAX` by a constructor.
    pub sequence_id: u64,
    pub event_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

/// Sentinel for "ledger assigns the sequence on append".
pub const SEQ_UNASSIGNED: u64 = u64::MAX;

impl LedgerEvent {
    /// A new event with a minted id and an unassigned sequence.
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            sequence_id: SEQ_UNASSIGNED,
            event_id: Uuid::new_v4().to_string(),
            event_type,
            timestamp: Utc::now(),
            payload,
        }
    }
}

// ── Typed payloads ───────────────────────────────────────────────────────
//
// Payloads travel as `Value` inside the event; these records give the
// subsystems a checked shape to build and read them with.

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WsUpdateAppliedPayload {
    pub before_seq: u64,
    pub after_seq: u64,
    pub directives_summary: DirectivesSummary,
}

/// Why a patch (or a seal-time commit) was rejected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WsUpdateRejectedPayload {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryProposedPayload {
    pub batch_id: String,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryCommittedPayload {
    pub batch_id: String,
    pub ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EpisodeSealedPayload {
    pub episode_id: String,
    pub ledger_from: u64,
    pub ledger_to: u64,
    pub committed_ids: Vec<String>,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResumeSnapshotPayload {
    pub pack_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResumeLoadedPayload {
    pub source_pack_id: String,
    pub prior_run_id: String,
}
