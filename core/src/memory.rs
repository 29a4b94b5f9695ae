//! Long-term memory: two-phase propose/commit staging with deterministic
//! search.
//!
//! Proposals stage intents into a server-minted batch; nothing observable
//! changes until the batch is committed. The milestone gate itself (token
//! checks, test-mode bypass) is enforced by the service layer before any
//! commit or retract reaches the backend; the backend's contract is
//! staging, transition legality, and search ordering.
//!
//! The in-memory baseline here is the substitution boundary for a vector
//! store: an alternative backend must keep the same filters, `top_k`
//! semantics, and deterministic ordering for identical scores.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::Arc;

use chrono::Utc;
use runstate_protocol::{
    MemoryChange, MemoryItem, MemoryScope, MemoryStatus, MemoryType, McrOp, SCHEMA_VERSION,
};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::schema::{SchemaKind, SchemaSet};

/// The identity a run searches and proposes under. Non-global scopes are
/// visible only on an exact match against the proposing run's key.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScopeKey {
    pub run_id: String,
    pub task_id: String,
    pub thread_id: String,
}

/// Search parameters. `status` defaults to committed-only when absent.
#[derive(Clone, Debug)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub top_k: usize,
    pub scope: Option<MemoryScope>,
    pub status: Option<MemoryStatus>,
    pub kind: Option<MemoryType>,
}

impl SearchQuery {
    pub fn keyword(q: impl Into<String>, top_k: usize) -> Self {
        Self {
            q: Some(q.into()),
            top_k,
            scope: None,
            status: None,
            kind: None,
        }
    }
}

/// Receipt for one propose call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProposeReceipt {
    pub batch_id: String,
    /// Ids minted for `add` changes plus the targets of staged
    /// `update`/`retract` intents, in submission order.
    pub proposed_ids: Vec<String>,
}

/// Storage contract behind the memory front-end.
///
/// Callers (service, sealer) enforce the milestone gate before invoking
/// `commit` or `retract`; implementations enforce batch integrity, status
/// transition legality, and the deterministic search order.
pub trait MemoryBackend: Send + Sync {
    fn propose(
        &self,
        origin: &ScopeKey,
        changes: &[MemoryChange],
        scope_filters: Option<&[MemoryScope]>,
    ) -> Result<ProposeReceipt>;

    /// Atomically apply every staged intent in `batch_id`. The batch is
    /// consumed whether or not the caller later asks again.
    fn commit(&self, run_id: &str, batch_id: &str) -> Result<Vec<String>>;

    fn search(&self, caller: &ScopeKey, query: &SearchQuery) -> Result<Vec<MemoryItem>>;

    /// Direct retraction of a committed item.
    fn retract(&self, id: &str, reason: &str) -> Result<()>;
}

struct Stored {
    item: MemoryItem,
    origin: ScopeKey,
}

enum StagedOp {
    Add { item_id: String },
    Update { target_id: String, change: MemoryChange },
    Retract { target_id: String },
}

struct Batch {
    run_id: String,
    ops: Vec<StagedOp>,
}

#[derive(Default)]
struct Inner {
    /// BTreeMap keeps iteration deterministic for equal-score ties.
    items: BTreeMap<String, Stored>,
    batches: HashMap<String, Batch>,
    /// Prior versions of updated items, newest last.
    versions: HashMap<String, Vec<MemoryItem>>,
}

/// In-memory baseline backend.
pub struct MemoryStore {
    schemas: Arc<SchemaSet>,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(schemas: Arc<SchemaSet>) -> Self {
        Self {
            schemas,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Prior versions recorded for an updated item, oldest first.
    pub fn versions(&self, id: &str) -> Vec<MemoryItem> {
        let inner = self.lock();
        inner.versions.get(id).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Mutex poisoning only happens if a holder panicked; the store map
        // is still structurally valid, so keep serving.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn validate_change(
        &self,
        index: usize,
        change: &MemoryChange,
        scope_filters: Option<&[MemoryScope]>,
    ) -> Result<()> {
        let pointer = |field: &str| format!("/mcrs/{index}/{field}");
        let value = serde_json::to_value(change)?;
        self.schemas.validate(SchemaKind::MemoryChange, &value)?;

        match change.op {
            McrOp::Add => {
                if change.target_id.is_some() {
                    return Err(CoreError::schema(
                        pointer("target_id"),
                        "add must not carry target_id",
                    ));
                }
                if change.kind.is_none() {
                    return Err(CoreError::schema(pointer("type"), "required for add"));
                }
                if change.scope.is_none() {
                    return Err(CoreError::schema(pointer("scope"), "required for add"));
                }
                if change.content.is_none() {
                    return Err(CoreError::schema(pointer("content"), "required for add"));
                }
                if change.confidence.is_none() {
                    return Err(CoreError::schema(pointer("confidence"), "required for add"));
                }
            }
            McrOp::Update | McrOp::Retract => {
                if change.target_id.is_none() {
                    return Err(CoreError::schema(
                        pointer("target_id"),
                        "required for update/retract",
                    ));
                }
            }
        }

        // Advisory pre-check: a disallowed scope fails before staging.
        if let (Some(filters), Some(scope)) = (scope_filters, change.scope) {
            if !filters.contains(&scope) {
                return Err(CoreError::schema(
                    pointer("scope"),
                    "scope disallowed by scope_filters",
                ));
            }
        }
        Ok(())
    }
}

impl MemoryBackend for MemoryStore {
    fn propose(
        &self,
        origin: &ScopeKey,
        changes: &[MemoryChange],
        scope_filters: Option<&[MemoryScope]>,
    ) -> Result<ProposeReceipt> {
        for (index, change) in changes.iter().enumerate() {
            self.validate_change(index, change, scope_filters)?;
        }

        let mut inner = self.lock();
        // Existence checks after validation so the error order is stable.
        for change in changes {
            if let Some(target_id) = &change.target_id {
                if !inner.items.contains_key(target_id) {
                    return Err(CoreError::NotFound {
                        what: "memory item",
                        id: target_id.clone(),
                    });
                }
            }
        }

        let batch_id = format!("batch-{}", Uuid::new_v4());
        let mut ops = Vec::with_capacity(changes.len());
        let mut proposed_ids = Vec::with_capacity(changes.len());

        for change in changes {
            match change.op {
                McrOp::Add => {
                    let item_id = format!("mem-{}", Uuid::new_v4());
                    let item = MemoryItem {
                        schema_version: SCHEMA_VERSION.to_string(),
                        id: item_id.clone(),
                        kind: change.kind.unwrap_or(MemoryType::Other),
                        scope: change.scope.unwrap_or(MemoryScope::Run),
                        content: change.content.clone().unwrap_or_default(),
                        confidence: change.confidence.unwrap_or(1.0),
                        rationale: change.rationale.clone().unwrap_or_default(),
                        source_refs: change.source_refs.clone(),
                        status: MemoryStatus::Proposed,
                        batch_id: batch_id.clone(),
                        created_at: Utc::now(),
                        committed_at: None,
                    };
                    inner.items.insert(
                        item_id.clone(),
                        Stored {
                            item,
                            origin: origin.clone(),
                        },
                    );
                    proposed_ids.push(item_id.clone());
                    ops.push(StagedOp::Add { item_id });
                }
                McrOp::Update => {
                    let target_id = change.target_id.clone().unwrap_or_default();
                    proposed_ids.push(target_id.clone());
                    ops.push(StagedOp::Update {
                        target_id,
                        change: change.clone(),
                    });
                }
                McrOp::Retract => {
                    let target_id = change.target_id.clone().unwrap_or_default();
                    proposed_ids.push(target_id.clone());
                    ops.push(StagedOp::Retract { target_id });
                }
            }
        }

        inner.batches.insert(
            batch_id.clone(),
            Batch {
                run_id: origin.run_id.clone(),
                ops,
            },
        );
        tracing::debug!(
            run_id = %origin.run_id,
            batch_id = %batch_id,
            count = changes.len(),
            "memory batch proposed"
        );
        Ok(ProposeReceipt {
            batch_id,
            proposed_ids,
        })
    }

    fn commit(&self, run_id: &str, batch_id: &str) -> Result<Vec<String>> {
        let mut inner = self.lock();
        let batch = match inner.batches.remove(batch_id) {
            Some(batch) if batch.run_id == run_id => batch,
            Some(foreign) => {
                // A batch is bound to the run that proposed it; put it back.
                inner.batches.insert(batch_id.to_string(), foreign);
                return Err(CoreError::UnknownBatch {
                    batch_id: batch_id.to_string(),
                });
            }
            None => {
                return Err(CoreError::UnknownBatch {
                    batch_id: batch_id.to_string(),
                });
            }
        };

        let now = Utc::now();
        let mut committed_ids = Vec::with_capacity(batch.ops.len());
        for op in &batch.ops {
            match op {
                StagedOp::Add { item_id } => {
                    let Some(stored) = inner.items.get_mut(item_id) else {
                        debug_assert!(false, "staged add lost its item");
                        continue;
                    };
                    stored.item.status = MemoryStatus::Committed;
                    stored.item.committed_at = Some(now);
                    committed_ids.push(item_id.clone());
                }
                StagedOp::Update { target_id, change } => {
                    let prior = match inner.items.get(target_id) {
                        Some(stored) => stored.item.clone(),
                        None => {
                            return Err(CoreError::NotFound {
                                what: "memory item",
                                id: target_id.clone(),
                            });
                        }
                    };
                    if prior.status != MemoryStatus::Committed {
                        return Err(CoreError::schema(
                            "/op",
                            format!("update target {target_id} is not committed"),
                        ));
                    }
                    inner
                        .versions
                        .entry(target_id.clone())
                        .or_default()
                        .push(prior);
                    let Some(stored) = inner.items.get_mut(target_id) else {
                        unreachable!("checked above");
                    };
                    if let Some(kind) = change.kind {
                        stored.item.kind = kind;
                    }
                    if let Some(scope) = change.scope {
                        stored.item.scope = scope;
                    }
                    if let Some(content) = &change.content {
                        stored.item.content = content.clone();
                    }
                    if let Some(confidence) = change.confidence {
                        stored.item.confidence = confidence;
                    }
                    if let Some(rationale) = &change.rationale {
                        stored.item.rationale = rationale.clone();
                    }
                    if !change.source_refs.is_empty() {
                        stored.item.source_refs = change.source_refs.clone();
                    }
                    stored.item.committed_at = Some(now);
                    committed_ids.push(target_id.clone());
                }
                StagedOp::Retract { target_id } => {
                    let Some(stored) = inner.items.get_mut(target_id) else {
                        return Err(CoreError::NotFound {
                            what: "memory item",
                            id: target_id.clone(),
                        });
                    };
                    if stored.item.status != MemoryStatus::Committed {
                        return Err(CoreError::schema(
                            "/op",
                            format!("retract target {target_id} is not committed"),
                        ));
                    }
                    stored.item.status = MemoryStatus::Retracted;
                    committed_ids.push(target_id.clone());
                }
            }
        }

        tracing::info!(
            run_id,
            batch_id,
            committed = committed_ids.len(),
            "memory batch committed"
        );
        Ok(committed_ids)
    }

    fn search(&self, caller: &ScopeKey, query: &SearchQuery) -> Result<Vec<MemoryItem>> {
        let wanted_status = query.status.unwrap_or(MemoryStatus::Committed);
        let needle = query.q.as_ref().map(|q| q.to_lowercase());

        let inner = self.lock();
        let mut hits: Vec<MemoryItem> = inner
            .items
            .values()
            .filter(|stored| stored.item.status == wanted_status)
            .filter(|stored| query.kind.is_none_or(|kind| stored.item.kind == kind))
            .filter(|stored| query.scope.is_none_or(|scope| stored.item.scope == scope))
            .filter(|stored| match stored.item.scope {
                MemoryScope::Global => true,
                MemoryScope::Run => stored.origin.run_id == caller.run_id,
                MemoryScope::Task => stored.origin.task_id == caller.task_id,
                MemoryScope::Thread => stored.origin.thread_id == caller.thread_id,
            })
            .filter(|stored| {
                needle
                    .as_ref()
                    .is_none_or(|needle| stored.item.content.to_lowercase().contains(needle))
            })
            .map(|stored| stored.item.clone())
            .collect();

        hits.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(query.top_k);
        Ok(hits)
    }

    fn retract(&self, id: &str, reason: &str) -> Result<()> {
        let mut inner = self.lock();
        let Some(stored) = inner.items.get_mut(id) else {
            return Err(CoreError::NotFound {
                what: "memory item",
                id: id.to_string(),
            });
        };
        if stored.item.status != MemoryStatus::Committed {
            return Err(CoreError::schema(
                "/status",
                format!("cannot retract item in status {:?}", stored.item.status),
            ));
        }
        stored.item.status = MemoryStatus::Retracted;
        tracing::info!(id, reason, "memory item retracted");
        Ok(())
    }
}
