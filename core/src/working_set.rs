//! Working-set lifecycle: creation, loading, and compare-and-swap patching
//! with deterministic eviction.
//!
//! The document lives at `state/working_set.json` and is only ever replaced
//! atomically. Every successful patch bumps `_update_seq` by exactly one and
//! is recorded in the run ledger; conflicts and schema failures are recorded
//! as rejections. Callers above this type hold the per-run mutex.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use runstate_protocol::ledger::{WsUpdateAppliedPayload, WsUpdateRejectedPayload};
use runstate_protocol::{ContextItem, EventType, LedgerEvent, WorkingSet, WsPatch};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::fsio::write_atomic;
use crate::ledger::RunLedger;
use crate::schema::{SchemaKind, SchemaSet};
use crate::tokens;

/// Working-set filename within a run's `state/` directory.
pub const WS_FILENAME: &str = "working_set.json";

/// Inputs for booting a fresh working set.
#[derive(Clone, Debug)]
pub struct BootParams {
    pub run_id: String,
    pub task_id: String,
    pub thread_id: String,
    pub objective: String,
    pub acceptance_criteria: Vec<String>,
    pub constraints: Vec<String>,
}

/// Raised (as a warning, not an error) when the ledger records applied
/// updates beyond the on-disk document, the signature of a crash between
/// the atomic rename and the ledger append.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LedgerAhead {
    pub ws_seq: u64,
    pub ledger_seq: u64,
}

/// Manager for one run's working-set document.
pub struct WorkingSetManager {
    state_path: PathBuf,
    schemas: Arc<SchemaSet>,
    token_budget: u64,
    pinned_max: usize,
    cached: Option<WorkingSet>,
}

impl WorkingSetManager {
    pub fn new(
        state_dir: &Path,
        schemas: Arc<SchemaSet>,
        token_budget: u64,
        pinned_max: usize,
    ) -> Self {
        Self {
            state_path: state_dir.join(WS_FILENAME),
            schemas,
            token_budget,
            pinned_max,
            cached: None,
        }
    }

    pub fn exists(&self) -> bool {
        self.state_path.exists()
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Create the `_update_seq = 0` document, persist it atomically, and
    /// record `BOOT`. Refuses to overwrite an existing working set.
    pub fn create_initial(
        &mut self,
        ledger: &mut RunLedger,
        params: BootParams,
    ) -> Result<WorkingSet> {
        if self.exists() {
            return Err(CoreError::AlreadyExists {
                what: "working set",
                id: params.run_id,
            });
        }
        let ws = WorkingSet::initial(
            params.run_id,
            params.task_id,
            params.thread_id,
            params.objective,
            params.acceptance_criteria,
            params.constraints,
        );
        self.persist(&ws)?;
        ledger.append(LedgerEvent::new(
            EventType::Boot,
            serde_json::json!({
                "run_id": ws.run_id,
                "task_id": ws.task_id,
                "thread_id": ws.thread_id,
            }),
        ))?;
        self.cached = Some(ws.clone());
        Ok(ws)
    }

    /// Read, schema-validate, and cache the on-disk document.
    pub fn load(&mut self) -> Result<WorkingSet> {
        let raw = std::fs::read_to_string(&self.state_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::NotFound {
                    what: "working set",
                    id: self.state_path.display().to_string(),
                }
            } else {
                CoreError::io(&self.state_path, e)
            }
        })?;
        let value: Value = serde_json::from_str(&raw)?;
        self.schemas.validate(SchemaKind::WorkingSet, &value)?;
        let ws: WorkingSet = serde_json::from_value(value)?;
        self.cached = Some(ws.clone());
        Ok(ws)
    }

    /// Compare the on-disk document against the ledger's record of applied
    /// updates. The document is trusted either way; a ledger that is ahead
    /// is flagged, never auto-repaired, since the extra entries may be
    /// phantoms from a crash mid-transaction.
    pub fn reconcile(&self, ledger: &RunLedger, ws: &WorkingSet) -> Result<Option<LedgerAhead>> {
        let mut max_applied: Option<u64> = None;
        for event in ledger.iter()? {
            let event = event?;
            if event.event_type == EventType::WsUpdateApplied {
                if let Ok(payload) =
                    serde_json::from_value::<WsUpdateAppliedPayload>(event.payload.clone())
                {
                    max_applied = Some(max_applied.map_or(payload.after_seq, |m| {
                        m.max(payload.after_seq)
                    }));
                }
            }
        }
        match max_applied {
            Some(ledger_seq) if ws.update_seq < ledger_seq => {
                tracing::warn!(
                    ws_seq = ws.update_seq,
                    ledger_seq,
                    "ledger is ahead of working set; trusting the document"
                );
                Ok(Some(LedgerAhead {
                    ws_seq: ws.update_seq,
                    ledger_seq,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Apply one CAS patch under the caller's per-run mutex.
    ///
    /// The sequence check runs first (against a fresh read of the document),
    /// then schema validation, then the directives in their fixed order.
    /// Conflict and schema failures are recorded as `WS_UPDATE_REJECTED`;
    /// directive-level failures (duplicate id, pinned overflow) fail the
    /// call without mutating anything.
    pub fn apply_patch(&mut self, ledger: &mut RunLedger, patch: &Value) -> Result<WorkingSet> {
        // Re-read for re-entrancy safety; the cache may be stale if a prior
        // transaction died between rename and ledger append.
        let current = self.load()?;

        let expected_seq = match patch.get("expected_seq").and_then(Value::as_u64) {
            Some(seq) => seq,
            None => {
                let err = CoreError::schema("/expected_seq", "missing or non-integer");
                self.append_rejection(ledger, "schema", None, Some(err.to_string()));
                return Err(err);
            }
        };
        if expected_seq != current.update_seq {
            self.append_rejection(ledger, "conflict", Some(current.update_seq), None);
            return Err(CoreError::Conflict {
                current_seq: current.update_seq,
            });
        }

        if let Err(err) = self.schemas.validate(SchemaKind::WsPatch, patch) {
            self.append_rejection(ledger, "schema", None, Some(err.to_string()));
            return Err(err);
        }
        let patch: WsPatch = match serde_json::from_value(patch.clone()) {
            Ok(patch) => patch,
            Err(e) => {
                let err = CoreError::Serde { source: e };
                self.append_rejection(ledger, "schema", None, Some(err.to_string()));
                return Err(err);
            }
        };

        let mut next = current.clone();
        apply_directives(&mut next, &patch)?;
        enforce_pinned_cap(&next, self.pinned_max)?;
        let evicted = evict_to_budget(&mut next, self.token_budget)?;
        if !evicted.is_empty() {
            tracing::debug!(
                run_id = %next.run_id,
                evicted = evicted.len(),
                "evicted sliding context to honor token budget"
            );
        }

        next.update_seq = current.update_seq + 1;
        self.persist(&next)?;
        self.cached = Some(next.clone());

        let applied = LedgerEvent::new(
            EventType::WsUpdateApplied,
            serde_json::to_value(WsUpdateAppliedPayload {
                before_seq: current.update_seq,
                after_seq: next.update_seq,
                directives_summary: patch.directives_summary(),
            })?,
        );
        if let Err(e) = ledger.append(applied) {
            // The document is durable; the missing ledger entry is flagged
            // on the next open (see `reconcile`).
            tracing::warn!(
                run_id = %next.run_id,
                after_seq = next.update_seq,
                error = %e,
                "working set persisted but ledger append failed"
            );
        }
        Ok(next)
    }

    fn persist(&self, ws: &WorkingSet) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(ws)?;
        write_atomic(&self.state_path, &bytes)
    }

    fn append_rejection(
        &self,
        ledger: &mut RunLedger,
        reason: &str,
        current_seq: Option<u64>,
        detail: Option<String>,
    ) {
        let payload = WsUpdateRejectedPayload {
            reason: reason.to_string(),
            current_seq,
            detail,
        };
        let event = match serde_json::to_value(payload) {
            Ok(value) => LedgerEvent::new(EventType::WsUpdateRejected, value),
            Err(_) => return,
        };
        if let Err(e) = ledger.append(event) {
            tracing::warn!(reason, error = %e, "failed to ledger a patch rejection");
        }
    }
}

/// Apply directives in the fixed order:
/// `set → pinned_remove → pinned_append → sliding_remove → sliding_append`.
fn apply_directives(ws: &mut WorkingSet, patch: &WsPatch) -> Result<()> {
    if let Some(set) = &patch.set {
        if let Some(objective) = &set.objective {
            ws.objective = objective.clone();
        }
        if let Some(criteria) = &set.acceptance_criteria {
            ws.acceptance_criteria = criteria.clone();
        }
        if let Some(constraints) = &set.constraints {
            ws.constraints = constraints.clone();
        }
        if let Some(status) = set.status {
            ws.status = status;
        }
        if let Some(stage) = &set.current_stage {
            ws.current_stage = stage.clone();
        }
        if let Some(action) = &set.next_action {
            ws.next_action = action.clone();
        }
    }
    if let Some(status) = patch.status {
        ws.status = status;
    }

    // Removing an unknown id is a no-op by contract.
    ws.pinned_context
        .retain(|item| !patch.pinned_remove.contains(&item.id));
    for item in &patch.pinned_append {
        insert_unique(ws, item.clone(), true)?;
    }
    ws.sliding_context
        .retain(|item| !patch.sliding_remove.contains(&item.id));
    for item in &patch.sliding_append {
        insert_unique(ws, item.clone(), false)?;
    }
    Ok(())
}

fn insert_unique(ws: &mut WorkingSet, item: ContextItem, pinned: bool) -> Result<()> {
    if ws.find_item(&item.id).is_some() {
        return Err(CoreError::DuplicateItem { id: item.id });
    }
    if pinned {
        ws.pinned_context.push(item);
    } else {
        ws.sliding_context.push(item);
    }
    Ok(())
}

fn enforce_pinned_cap(ws: &WorkingSet, pinned_max: usize) -> Result<()> {
    if ws.pinned_context.len() > pinned_max {
        return Err(CoreError::PinnedOverflow {
            count: ws.pinned_context.len(),
            pinned_max,
        });
    }
    Ok(())
}

/// Deterministic eviction: drop sliding items in `(priority ASC,
/// timestamp ASC, id ASC)` order until the combined estimate fits the
/// budget. Pinned items are never touched. Surviving sliding items keep
/// their document order. Returns the evicted ids.
fn evict_to_budget(ws: &mut WorkingSet, token_budget: u64) -> Result<Vec<String>> {
    let mut total =
        tokens::total_tokens(ws.pinned_context.iter().chain(ws.sliding_context.iter()));
    if total <= token_budget {
        return Ok(Vec::new());
    }

    let mut order: Vec<&ContextItem> = ws.sliding_context.iter().collect();
    order.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut evicted: Vec<String> = Vec::new();
    for item in order {
        if total <= token_budget {
            break;
        }
        total -= tokens::item_tokens(item);
        evicted.push(item.id.clone());
    }
    if total > token_budget {
        return Err(CoreError::BudgetUnsatisfiable {
            token_budget,
            pinned_tokens: tokens::total_tokens(ws.pinned_context.iter()),
        });
    }
    ws.sliding_context.retain(|item| !evicted.contains(&item.id));
    Ok(evicted)
}
