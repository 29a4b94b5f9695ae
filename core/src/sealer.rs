//! Episode sealing: atomic checkpoints that mint one-shot milestone tokens.
//!
//! A seal snapshots the working set by value, captures the ledger span it
//! covers, optionally commits a staged memory batch under the freshly
//! minted token, and writes the episode document atomically before the
//! `EPISODE_SEALED` event lands in the ledger. At most one pending token
//! exists per run; sealing again invalidates an unconsumed one.

use std::path::{Path, PathBuf};

use runstate_protocol::ledger::{
    EpisodeSealedPayload, MemoryCommittedPayload, WsUpdateRejectedPayload,
};
use runstate_protocol::{Episode, EpisodeSummary, EventType, LedgerEvent, LedgerSpan,
    SCHEMA_VERSION};
use uuid::Uuid;

use crate::error::Result;
use crate::fsio::write_atomic;
use crate::ledger::RunLedger;
use crate::memory::MemoryBackend;
use crate::schema::{SchemaKind, SchemaSet};
use crate::working_set::WorkingSetManager;

/// Raw ledger lines carried in an episode summary.
const SUMMARY_TAIL_LINES: usize = 10;

/// Inputs for one seal.
#[derive(Clone, Debug, Default)]
pub struct SealRequest {
    pub reason: String,
    /// When present, the sealer commits this batch and consumes the token
    /// itself; otherwise the token is returned for a later commit.
    pub memory_batch_id: Option<String>,
    pub next_entry_point: Option<String>,
}

/// What a successful seal produced.
#[derive(Clone, Debug)]
pub struct MilestoneOutcome {
    pub episode_id: String,
    pub path: PathBuf,
    pub committed_ids: Vec<String>,
    /// Present only when the sealer was not asked to commit.
    pub milestone_token: Option<String>,
}

/// Mint an opaque one-shot token.
pub fn mint_token() -> String {
    let nonce: u128 = rand::random();
    format!("mtk-{nonce:032x}")
}

/// Seal a milestone for one run. The caller holds the per-run mutex and
/// owns `pending_token`, the single slot for this run's live token.
pub fn seal_milestone(
    ws_manager: &mut WorkingSetManager,
    ledger: &mut RunLedger,
    pending_token: &mut Option<String>,
    episodes_dir: &Path,
    memory: &dyn MemoryBackend,
    schemas: &SchemaSet,
    request: SealRequest,
) -> Result<MilestoneOutcome> {
    let ws_before = ws_manager.load()?;
    // The episode covers everything since the prior seal: its span starts
    // right after the previous EPISODE_SEALED event (or at 0), and is
    // captured before this seal's own commit events land.
    let ledger_from = last_sealed_to(ledger)?.map_or(0, |to| to + 1);

    // A fresh token per seal; any prior unconsumed token dies here.
    let token = mint_token();
    *pending_token = Some(token.clone());

    let mut committed_ids = Vec::new();
    let inline_commit = request.memory_batch_id.is_some();
    if let Some(batch_id) = &request.memory_batch_id {
        // The sealer consumes its own token.
        *pending_token = None;
        match memory.commit(&ws_before.run_id, batch_id) {
            Ok(ids) => {
                ledger.append(LedgerEvent::new(
                    EventType::MemoryCommitted,
                    serde_json::to_value(MemoryCommittedPayload {
                        batch_id: batch_id.clone(),
                        ids: ids.clone(),
                    })?,
                ))?;
                committed_ids = ids;
            }
            Err(e) => {
                tracing::warn!(
                    run_id = %ws_before.run_id,
                    batch_id = %batch_id,
                    error = %e,
                    "seal aborted: memory commit failed"
                );
                ledger.append(LedgerEvent::new(
                    EventType::WsUpdateRejected,
                    serde_json::to_value(WsUpdateRejectedPayload {
                        reason: "episode_commit_failed".to_string(),
                        current_seq: None,
                        detail: Some(e.to_string()),
                    })?,
                ))?;
                return Err(e);
            }
        }
    }

    let summary = summarize(ledger)?;
    let episode_id = format!("ep-{}", Uuid::new_v4());
    // The EPISODE_SEALED event is the last one the span covers; its
    // sequence id is known before it is appended.
    let ledger_to = ledger.next_sequence();

    let episode = Episode {
        schema_version: SCHEMA_VERSION.to_string(),
        episode_id: episode_id.clone(),
        run_id: ws_before.run_id.clone(),
        reason: request.reason.clone(),
        created_at: chrono::Utc::now(),
        ws_after: ws_before.clone(),
        ws_before,
        ledger_span: LedgerSpan {
            from_seq: ledger_from,
            to_seq: ledger_to,
        },
        committed_memory_ids: committed_ids.clone(),
        next_entry_point: request.next_entry_point.unwrap_or_default(),
        summary,
    };

    let value = serde_json::to_value(&episode)?;
    schemas.validate(SchemaKind::Episode, &value)?;
    let path = episodes_dir.join(format!("{episode_id}.json"));
    write_atomic(&path, &serde_json::to_vec_pretty(&value)?)?;

    ledger.append(LedgerEvent::new(
        EventType::EpisodeSealed,
        serde_json::to_value(EpisodeSealedPayload {
            episode_id: episode_id.clone(),
            ledger_from,
            ledger_to,
            committed_ids: committed_ids.clone(),
            reason: request.reason,
        })?,
    ))?;

    tracing::info!(
        run_id = %episode.run_id,
        episode_id = %episode_id,
        ledger_from,
        ledger_to,
        "episode sealed"
    );

    Ok(MilestoneOutcome {
        episode_id,
        path,
        committed_ids,
        milestone_token: if inline_commit { None } else { Some(token) },
    })
}

/// `ledger_to` of the most recent `EPISODE_SEALED` event, if any.
fn last_sealed_to(ledger: &RunLedger) -> Result<Option<u64>> {
    let mut last = None;
    for event in ledger.iter()? {
        let event = event?;
        if event.event_type == EventType::EpisodeSealed {
            if let Ok(payload) =
                serde_json::from_value::<EpisodeSealedPayload>(event.payload.clone())
            {
                last = Some(payload.ledger_to);
            }
        }
    }
    Ok(last)
}

/// Deterministic digest of the ledger at seal time: per-type event counts
/// plus the last few raw lines.
fn summarize(ledger: &RunLedger) -> Result<EpisodeSummary> {
    let mut summary = EpisodeSummary::default();
    for event in ledger.iter()? {
        let event = event?;
        *summary
            .event_counts
            .entry(event.event_type.as_str().to_string())
            .or_insert(0) += 1;
    }
    summary.tail = ledger.tail_lines(SUMMARY_TAIL_LINES)?;
    Ok(summary)
}
