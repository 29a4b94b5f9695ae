//! The service facade: one owned value binding working sets, ledgers,
//! memory, episodes, and resume packs behind the ten public operations.
//!
//! There is no process-wide state. A [`StateService`] owns the
//! configuration, the shared memory backend, and a registry mapping
//! `run_id → RunHandle`. Each handle is guarded by its own mutex; the
//! memory store's internal mutex is always taken after a per-run mutex,
//! never before, so lock order cannot cycle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use runstate_protocol::ledger::{MemoryCommittedPayload, MemoryProposedPayload,
    ResumeLoadedPayload, ResumeSnapshotPayload};
use runstate_protocol::{Episode, EventType, LedgerEvent, MemoryChange, MemoryItem, MemoryScope,
    WorkingSet};
use serde_json::Value;
use uuid::Uuid;

use crate::brief;
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::ledger::RunLedger;
use crate::memory::{MemoryBackend, MemoryStore, ProposeReceipt, ScopeKey, SearchQuery};
use crate::resume::{self, LoadOutcome, SnapshotOutcome};
use crate::schema::SchemaSet;
use crate::sealer::{self, MilestoneOutcome, SealRequest};
use crate::working_set::{BootParams, WorkingSetManager};

/// Inputs for `boot`.
#[derive(Clone, Debug, Default)]
pub struct BootRequest {
    pub objective: String,
    pub acceptance_criteria: Vec<String>,
    pub constraints: Vec<String>,
    pub task_id: Option<String>,
    pub thread_id: Option<String>,
}

/// A successful `apply_patch`.
#[derive(Clone, Debug)]
pub struct ApplyOutcome {
    pub ws: WorkingSet,
    pub context_brief: String,
}

/// `health` response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
}

/// Everything owned by one live run: its working-set manager, its ledger
/// append handle, and the single slot for a pending milestone token.
pub struct RunHandle {
    run_id: String,
    run_dir: PathBuf,
    ws: WorkingSetManager,
    ledger: RunLedger,
    pending_token: Option<String>,
}

impl RunHandle {
    fn scope_key(&mut self) -> Result<ScopeKey> {
        let ws = self.ws.load()?;
        Ok(ScopeKey {
            run_id: ws.run_id,
            task_id: ws.task_id,
            thread_id: ws.thread_id,
        })
    }
}

/// How a gated memory mutation was authorized.
enum GateMode {
    /// A matching milestone token; consumed after the mutation succeeds.
    Token,
    /// Test-mode `allow_outside_milestone` bypass.
    Bypass,
}

/// The state manager service.
pub struct StateService {
    config: Config,
    schemas: Arc<SchemaSet>,
    memory: Arc<dyn MemoryBackend>,
    runs: Mutex<HashMap<String, Arc<Mutex<RunHandle>>>>,
}

impl StateService {
    /// Build a service with the in-memory baseline memory backend.
    pub fn new(config: Config) -> Result<Self> {
        let schemas = Arc::new(SchemaSet::new()?);
        let memory = Arc::new(MemoryStore::new(Arc::clone(&schemas)));
        Self::with_memory_backend(config, schemas, memory)
    }

    /// Build a service with a substituted memory backend (e.g. a vector
    /// store honoring the [`MemoryBackend`] contract).
    pub fn with_memory_backend(
        config: Config,
        schemas: Arc<SchemaSet>,
        memory: Arc<dyn MemoryBackend>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.runs_root)
            .map_err(|e| CoreError::io(&config.runs_root, e))?;
        tracing::info!(
            runs_root = %config.runs_root.display(),
            test_mode = config.test_mode,
            "state service initialized"
        );
        Ok(Self {
            config,
            schemas,
            memory,
            runs: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ── The ten operations ───────────────────────────────────────────────

    /// Create a run: directories, initial working set, `BOOT` event.
    pub fn boot(&self, request: BootRequest) -> Result<(String, WorkingSet)> {
        let run_id = format!("run-{}", Uuid::new_v4());
        let run_dir = self.config.runs_root.join(&run_id);
        for sub in ["state", "ledger", "episodes", "resume"] {
            let dir = run_dir.join(sub);
            std::fs::create_dir_all(&dir).map_err(|e| CoreError::io(&dir, e))?;
        }

        let mut handle = self.make_handle(&run_id, &run_dir)?;
        let ws = handle.ws.create_initial(
            &mut handle.ledger,
            BootParams {
                run_id: run_id.clone(),
                task_id: request
                    .task_id
                    .unwrap_or_else(|| format!("task-{}", Uuid::new_v4())),
                thread_id: request
                    .thread_id
                    .unwrap_or_else(|| format!("thread-{}", Uuid::new_v4())),
                objective: request.objective,
                acceptance_criteria: request.acceptance_criteria,
                constraints: request.constraints,
            },
        )?;

        self.lock_registry()
            .insert(run_id.clone(), Arc::new(Mutex::new(handle)));
        tracing::info!(run_id = %run_id, "run booted");
        Ok((run_id, ws))
    }

    /// Current working set.
    pub fn get_ws(&self, run_id: &str) -> Result<WorkingSet> {
        let handle = self.open_run(run_id)?;
        let mut handle = lock_handle(&handle);
        handle.ws.load()
    }

    /// Apply a CAS patch; returns the new document plus a context brief.
    pub fn apply_patch(&self, run_id: &str, patch: &Value) -> Result<ApplyOutcome> {
        let handle = self.open_run(run_id)?;
        let mut handle = lock_handle(&handle);
        let RunHandle { ws, ledger, .. } = &mut *handle;
        let next = ws.apply_patch(ledger, patch)?;
        let context_brief = brief::render(&next, None, None);
        Ok(ApplyOutcome {
            ws: next,
            context_brief,
        })
    }

    /// Stage memory change requests into a fresh batch.
    pub fn propose_memory(
        &self,
        run_id: &str,
        changes: &[MemoryChange],
        scope_filters: Option<&[MemoryScope]>,
    ) -> Result<ProposeReceipt> {
        let handle = self.open_run(run_id)?;
        let mut handle = lock_handle(&handle);
        let origin = handle.scope_key()?;
        let receipt = self.memory.propose(&origin, changes, scope_filters)?;
        handle.ledger.append(LedgerEvent::new(
            EventType::MemoryProposed,
            serde_json::to_value(MemoryProposedPayload {
                batch_id: receipt.batch_id.clone(),
                count: changes.len() as u64,
            })?,
        ))?;
        Ok(receipt)
    }

    /// Commit a proposed batch under the milestone gate.
    pub fn commit_memory(
        &self,
        run_id: &str,
        batch_id: &str,
        milestone_token: Option<&str>,
        allow_outside_milestone: bool,
    ) -> Result<Vec<String>> {
        let handle = self.open_run(run_id)?;
        let mut handle = lock_handle(&handle);
        let mode = self.check_gate(&handle, milestone_token, allow_outside_milestone)?;

        let ids = self.memory.commit(run_id, batch_id)?;
        if matches!(mode, GateMode::Token) {
            handle.pending_token = None;
        }
        handle.ledger.append(LedgerEvent::new(
            EventType::MemoryCommitted,
            serde_json::to_value(MemoryCommittedPayload {
                batch_id: batch_id.to_string(),
                ids: ids.clone(),
            })?,
        ))?;
        Ok(ids)
    }

    /// Search visible committed memory.
    pub fn search_memory(&self, run_id: &str, query: &SearchQuery) -> Result<Vec<MemoryItem>> {
        let handle = self.open_run(run_id)?;
        let mut handle = lock_handle(&handle);
        let caller = handle.scope_key()?;
        self.memory.search(&caller, query)
    }

    /// Directly retract a committed item, still under the milestone gate.
    pub fn retract_memory(
        &self,
        run_id: &str,
        id: &str,
        reason: &str,
        milestone_token: Option<&str>,
        allow_outside_milestone: bool,
    ) -> Result<()> {
        let handle = self.open_run(run_id)?;
        let mut handle = lock_handle(&handle);
        let mode = self.check_gate(&handle, milestone_token, allow_outside_milestone)?;
        self.memory.retract(id, reason)?;
        if matches!(mode, GateMode::Token) {
            handle.pending_token = None;
        }
        Ok(())
    }

    /// Seal an episode, optionally committing a staged batch inline.
    pub fn milestone(&self, run_id: &str, request: SealRequest) -> Result<MilestoneOutcome> {
        let handle = self.open_run(run_id)?;
        let mut handle = lock_handle(&handle);
        let episodes_dir = handle.run_dir.join("episodes");
        let RunHandle {
            ws,
            ledger,
            pending_token,
            ..
        } = &mut *handle;
        sealer::seal_milestone(
            ws,
            ledger,
            pending_token,
            &episodes_dir,
            self.memory.as_ref(),
            &self.schemas,
            request,
        )
    }

    /// Snapshot the run into a relocatable pack.
    pub fn resume_snapshot(
        &self,
        run_id: &str,
        zip_pack: bool,
        pointers: Option<Value>,
    ) -> Result<SnapshotOutcome> {
        let handle = self.open_run(run_id)?;
        let mut handle = lock_handle(&handle);
        let outcome = resume::snapshot(
            &handle.run_dir,
            run_id,
            zip_pack,
            pointers.unwrap_or_else(|| serde_json::json!({})),
            &self.schemas,
        )?;
        handle.ledger.append(LedgerEvent::new(
            EventType::ResumeSnapshot,
            serde_json::to_value(ResumeSnapshotPayload {
                pack_id: outcome.pack_id.clone(),
            })?,
        ))?;
        Ok(outcome)
    }

    /// Reconstitute a pack into a fresh run.
    pub fn resume_load(
        &self,
        pack_path: &Path,
        new_run_id: Option<String>,
    ) -> Result<(String, WorkingSet)> {
        let LoadOutcome {
            run_id,
            prior_run_id,
            pack_id,
            ws,
        } = resume::load(
            pack_path,
            &self.config.runs_root,
            new_run_id,
            &self.schemas,
        )?;

        // Reopen through the registry: this revalidates the ledger and
        // recomputes its last sequence before the synthetic event lands.
        let handle = self.open_run(&run_id)?;
        let mut handle = lock_handle(&handle);
        handle.ledger.append(LedgerEvent::new(
            EventType::ResumeLoaded,
            serde_json::to_value(ResumeLoadedPayload {
                source_pack_id: pack_id,
                prior_run_id,
            })?,
        ))?;
        Ok((run_id, ws))
    }

    /// Liveness + version.
    pub fn health(&self) -> Health {
        Health {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    // ── Supplements ──────────────────────────────────────────────────────

    /// Run ids present under `runs_root`, sorted.
    pub fn list_runs(&self) -> Result<Vec<String>> {
        let mut runs = Vec::new();
        let entries = std::fs::read_dir(&self.config.runs_root)
            .map_err(|e| CoreError::io(&self.config.runs_root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| CoreError::io(&self.config.runs_root, e))?;
            let path = entry.path();
            if path.join("state").join("working_set.json").exists() {
                if let Some(name) = path.file_name().and_then(std::ffi::OsStr::to_str) {
                    runs.push(name.to_string());
                }
            }
        }
        runs.sort();
        Ok(runs)
    }

    /// Newest sealed episode for a run, if any.
    pub fn latest_episode(&self, run_id: &str) -> Result<Option<Episode>> {
        let handle = self.open_run(run_id)?;
        let handle = lock_handle(&handle);
        resume::latest_episode(&handle.run_dir.join("episodes"), &self.schemas)
    }

    /// Drop every run handle, closing (already per-line-synced) append
    /// handles deterministically.
    pub fn shutdown(self) {
        let count = self.lock_registry().len();
        self.lock_registry().clear();
        tracing::info!(runs = count, "state service shut down");
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn make_handle(&self, run_id: &str, run_dir: &Path) -> Result<RunHandle> {
        let ws = WorkingSetManager::new(
            &run_dir.join("state"),
            Arc::clone(&self.schemas),
            self.config.token_budget,
            self.config.pinned_max,
        );
        let ledger = RunLedger::open(
            &run_dir.join("ledger"),
            self.config.ledger_lock_mode,
            Arc::clone(&self.schemas),
        )?;
        Ok(RunHandle {
            run_id: run_id.to_string(),
            run_dir: run_dir.to_path_buf(),
            ws,
            ledger,
            pending_token: None,
        })
    }

    /// Registry hit, or lazily reopen a run that exists on disk. Reopening
    /// reconciles the document against the ledger and logs (never repairs)
    /// a ledger that ran ahead.
    fn open_run(&self, run_id: &str) -> Result<Arc<Mutex<RunHandle>>> {
        if let Some(handle) = self.lock_registry().get(run_id) {
            return Ok(Arc::clone(handle));
        }

        let run_dir = self.config.runs_root.join(run_id);
        if !run_dir.join("state").join("working_set.json").exists() {
            return Err(CoreError::NotFound {
                what: "run",
                id: run_id.to_string(),
            });
        }
        let mut handle = self.make_handle(run_id, &run_dir)?;
        let ws = handle.ws.load()?;
        handle.ws.reconcile(&handle.ledger, &ws)?;

        let handle = Arc::new(Mutex::new(handle));
        // Another thread may have raced the open; first insert wins.
        let mut registry = self.lock_registry();
        let entry = registry
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::clone(&handle));
        Ok(Arc::clone(entry))
    }

    fn check_gate(
        &self,
        handle: &MutexGuard<'_, RunHandle>,
        milestone_token: Option<&str>,
        allow_outside_milestone: bool,
    ) -> Result<GateMode> {
        if allow_outside_milestone {
            if self.config.test_mode {
                tracing::warn!(run_id = %handle.run_id, "outside-milestone commit bypass used");
                return Ok(GateMode::Bypass);
            }
            return Err(CoreError::Gate {
                reason: "allow_outside_milestone requires test_mode".into(),
            });
        }
        match (milestone_token, handle.pending_token.as_deref()) {
            (Some(provided), Some(pending)) if provided == pending => Ok(GateMode::Token),
            (Some(_), Some(_)) => Err(CoreError::Gate {
                reason: "milestone token does not match the pending token".into(),
            }),
            (Some(_), None) => Err(CoreError::Gate {
                reason: "no pending milestone token for this run".into(),
            }),
            (None, _) => Err(CoreError::Gate {
                reason: "milestone token required".into(),
            }),
        }
    }

    fn lock_registry(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<RunHandle>>>> {
        match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn lock_handle(handle: &Arc<Mutex<RunHandle>>) -> MutexGuard<'_, RunHandle> {
    match handle.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
