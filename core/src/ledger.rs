//! Append-only run ledger.
//!
//! One JSON object per line in `ledger/run.jsonl`. Sequence ids are dense
//! starting at 0; every append is validated, serialized as a single line,
//! and fsynced before the call returns. Lines are never rewritten. Readers
//! stop at the first malformed line and report its byte offset.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use runstate_protocol::LedgerEvent;
use runstate_protocol::ledger::SEQ_UNASSIGNED;

use crate::config::LedgerLockMode;
use crate::error::{CoreError, Result};
use crate::fsio::AppendHandle;
use crate::schema::{SchemaKind, SchemaSet};

/// Ledger filename within a run's `ledger/` directory.
pub const LEDGER_FILENAME: &str = "run.jsonl";

/// Append handle plus cached sequence counter for one run's ledger.
///
/// In-process writers are serialized by the per-run mutex above this type;
/// cross-process writers by the advisory lock on the append handle.
pub struct RunLedger {
    path: PathBuf,
    handle: AppendHandle,
    last_seq: Option<u64>,
    schemas: Arc<SchemaSet>,
}

impl RunLedger {
    /// Open (creating if needed) `<ledger_dir>/run.jsonl` and prime the
    /// sequence counter by replaying the file.
    pub fn open(
        ledger_dir: &Path,
        lock_mode: LedgerLockMode,
        schemas: Arc<SchemaSet>,
    ) -> Result<Self> {
        let path = ledger_dir.join(LEDGER_FILENAME);
        let handle = AppendHandle::open(&path, lock_mode)?;

        let mut last_seq = None;
        for event in LedgerIter::open(&path, Arc::clone(&schemas))? {
            last_seq = Some(event?.sequence_id);
        }

        Ok(Self {
            path,
            handle,
            last_seq,
            schemas,
        })
    }

    /// Highest sequence id written, if any.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_seq
    }

    /// Sequence id the next append will receive.
    pub fn next_sequence(&self) -> u64 {
        self.last_seq.map_or(0, |seq| seq + 1)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate, serialize, and durably append one event. Assigns the next
    /// sequence id when the caller left it unassigned; a caller-supplied id
    /// must equal the next id, keeping sequences dense.
    pub fn append(&mut self, mut event: LedgerEvent) -> Result<u64> {
        let next = self.next_sequence();
        if event.sequence_id == SEQ_UNASSIGNED {
            event.sequence_id = next;
        } else if event.sequence_id != next {
            return Err(CoreError::schema(
                "/sequence_id",
                format!(
                    "out-of-order sequence_id {} (next is {next})",
                    event.sequence_id
                ),
            ));
        }

        let value = serde_json::to_value(&event)?;
        self.schemas.validate(SchemaKind::LedgerEvent, &value)?;

        let line = serde_json::to_string(&value)?;
        self.handle.append_line(&line)?;
        self.last_seq = Some(event.sequence_id);

        tracing::debug!(
            sequence_id = event.sequence_id,
            event_type = event.event_type.as_str(),
            "ledger append"
        );
        Ok(event.sequence_id)
    }

    /// Stream every event from the start of the file.
    pub fn iter(&self) -> Result<LedgerIter> {
        LedgerIter::open(&self.path, Arc::clone(&self.schemas))
    }

    /// All events, failing on the first malformed line.
    pub fn read_all(&self) -> Result<Vec<LedgerEvent>> {
        self.iter()?.collect()
    }

    /// Events with `from_seq <= sequence_id <= to_seq`.
    pub fn read_range(&self, from_seq: u64, to_seq: u64) -> Result<Vec<LedgerEvent>> {
        let mut events = Vec::new();
        for event in self.iter()? {
            let event = event?;
            if event.sequence_id > to_seq {
                break;
            }
            if event.sequence_id >= from_seq {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Last `n` raw lines, for episode summaries. The ledger must already
    /// parse cleanly (callers pair this with `read_all`).
    pub fn tail_lines(&self, n: usize) -> Result<Vec<String>> {
        let content =
            std::fs::read_to_string(&self.path).map_err(|e| CoreError::io(&self.path, e))?;
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].iter().map(|line| (*line).to_string()).collect())
    }
}

/// Streaming reader: parses and validates line by line, tracking byte
/// offsets so corruption is reported precisely. Fuses after the first error.
pub struct LedgerIter {
    path: PathBuf,
    reader: BufReader<std::fs::File>,
    offset: u64,
    next_expected: u64,
    schemas: Arc<SchemaSet>,
    failed: bool,
}

impl LedgerIter {
    fn open(path: &Path, schemas: Arc<SchemaSet>) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| CoreError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            offset: 0,
            next_expected: 0,
            schemas,
            failed: false,
        })
    }

    fn corruption(&mut self, byte_offset: u64) -> CoreError {
        self.failed = true;
        CoreError::LedgerCorruption {
            path: self.path.clone(),
            byte_offset,
        }
    }
}

impl Iterator for LedgerIter {
    type Item = Result<LedgerEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let mut line = String::new();
        let line_start = self.offset;
        match self.reader.read_line(&mut line) {
            Ok(0) => return None,
            Ok(n) => self.offset += n as u64,
            Err(e) => {
                self.failed = true;
                return Some(Err(CoreError::io(&self.path, e)));
            }
        }
        let trimmed = line.trim_end_matches('\n');
        if trimmed.is_empty() {
            // A bare trailing newline is not an event.
            return self.next();
        }

        let value: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(_) => return Some(Err(self.corruption(line_start))),
        };
        if self.schemas.validate(SchemaKind::LedgerEvent, &value).is_err() {
            return Some(Err(self.corruption(line_start)));
        }
        let event: LedgerEvent = match serde_json::from_value(value) {
            Ok(event) => event,
            Err(_) => return Some(Err(self.corruption(line_start))),
        };
        if event.sequence_id != self.next_expected {
            return Some(Err(self.corruption(line_start)));
        }
        self.next_expected = event.sequence_id + 1;
        Some(Ok(event))
    }
}
