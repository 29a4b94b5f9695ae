//! Crash-safe, transactional state management for long-running agent runs.
//!
//! Five subsystems share one transactional discipline:
//!
//! - [`working_set`]: optimistic concurrency on a versioned document with
//!   deterministic eviction under a token budget
//! - [`ledger`]: append-only, sequence-numbered JSONL event log
//! - [`sealer`]: atomic episode checkpoints that mint one-shot milestone
//!   tokens
//! - [`memory`]: propose/commit two-phase long-term memory, gated behind
//!   milestone tokens
//! - [`resume`]: content-addressed, relocatable resume packs
//!
//! [`service::StateService`] binds them behind the ten public operations.
//! Everything is synchronous; each run is serialized by a per-run mutex and
//! durability comes from fsync + rename, not cooperative scheduling.

pub mod brief;
pub mod config;
pub mod error;
pub mod fsio;
pub mod ledger;
pub mod memory;
pub mod resume;
pub mod schema;
pub mod sealer;
pub mod service;
pub mod tokens;
pub mod working_set;

pub use config::{Config, LedgerLockMode};
pub use error::CoreError;
pub use service::StateService;
