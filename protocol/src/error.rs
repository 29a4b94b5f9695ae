//! Uniform error envelope for the request/response surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse classification carried by every error response.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input; not retryable.
    Schema,
    /// `_update_seq` mismatch; refetch and retry with a fresh sequence.
    Conflict,
    /// Unknown run, item, episode, or pack.
    NotFound,
    /// Memory commit attempted without a valid milestone token.
    Gate,
    /// Ledger or pack integrity failure; operator action required.
    Corruption,
    /// Underlying filesystem failure.
    Io,
    /// Pinned-count cap exceeded.
    Overflow,
    /// Batch id the store does not recognize (or already consumed).
    UnknownBatch,
}

/// The `{ok: false, ...}` envelope returned by every failed operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub error: String,
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorEnvelope {
    pub fn new(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: error.into(),
            kind,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}
