//! Error taxonomy for the state engine.
//!
//! Every public operation fails with a [`CoreError`]; the envelope mapping
//! in [`CoreError::kind`] is the uniform classification surfaced to callers.
//! Nothing here is retried internally; recovery is always caller-driven.

use std::path::PathBuf;

use runstate_protocol::{ErrorEnvelope, ErrorKind};
use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Engine error taxonomy.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("schema violation at {pointer}: {message}")]
    Schema { pointer: String, message: String },

    #[error("stale patch: expected_seq does not match current _update_seq {current_seq}")]
    Conflict { current_seq: u64 },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("{what} already exists: {id}")]
    AlreadyExists { what: &'static str, id: String },

    #[error("milestone gate: {reason}")]
    Gate { reason: String },

    #[error("unknown or consumed batch: {batch_id}")]
    UnknownBatch { batch_id: String },

    #[error("pinned context overflow: {count} items exceeds pinned_max {pinned_max}")]
    PinnedOverflow { count: usize, pinned_max: usize },

    #[error("token budget {token_budget} unsatisfiable: pinned context alone estimates {pinned_tokens} tokens")]
    BudgetUnsatisfiable {
        token_budget: u64,
        pinned_tokens: u64,
    },

    #[error("duplicate context item id: {id}")]
    DuplicateItem { id: String },

    #[error("ledger corrupted at byte offset {byte_offset} in {path}")]
    LedgerCorruption { path: PathBuf, byte_offset: u64 },

    #[error("resume pack corrupted: {path}")]
    PackCorruption { path: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Convenience constructor for I/O failures.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Convenience constructor for schema violations found in code paths
    /// that run after (or instead of) JSON Schema validation.
    pub fn schema(pointer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            pointer: pointer.into(),
            message: message.into(),
        }
    }

    /// The envelope classification for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Schema { .. } | Self::DuplicateItem { .. } | Self::Serde { .. } => {
                ErrorKind::Schema
            }
            Self::Conflict { .. } | Self::AlreadyExists { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Gate { .. } => ErrorKind::Gate,
            Self::UnknownBatch { .. } => ErrorKind::UnknownBatch,
            Self::PinnedOverflow { .. } | Self::BudgetUnsatisfiable { .. } => ErrorKind::Overflow,
            Self::LedgerCorruption { .. } | Self::PackCorruption { .. } => ErrorKind::Corruption,
            Self::Io { .. } => ErrorKind::Io,
            Self::Config(_) => ErrorKind::Schema,
        }
    }

    /// Render as the uniform `{ok: false, error, kind, details?}` envelope.
    pub fn envelope(&self) -> ErrorEnvelope {
        let envelope = ErrorEnvelope::new(self.kind(), self.to_string());
        match self {
            Self::Conflict { current_seq } => {
                envelope.with_details(serde_json::json!({ "current_seq": current_seq }))
            }
            Self::Schema { pointer, .. } => {
                envelope.with_details(serde_json::json!({ "pointer": pointer }))
            }
            Self::LedgerCorruption { byte_offset, .. } => {
                envelope.with_details(serde_json::json!({ "byte_offset": byte_offset }))
            }
            Self::PackCorruption { path } => {
                envelope.with_details(serde_json::json!({ "path": path }))
            }
            _ => envelope,
        }
    }
}
