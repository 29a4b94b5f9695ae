//! Engine configuration.
//!
//! Two layers, in precedence order: hardcoded defaults, then values from a
//! TOML document. Unknown keys are rejected rather than ignored so typos
//! fail loudly. `test_mode` is an ordinary field: never read from the
//! environment, and the only way to enable the outside-milestone commit
//! bypass.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// How ledger append handles guard against cross-process writers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerLockMode {
    /// Take a best-effort `fs2` advisory lock on the ledger file.
    #[default]
    Advisory,
    /// Single-writer assumption; no file lock.
    None,
}

/// Service configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Root directory holding one subdirectory per run.
    pub runs_root: PathBuf,
    /// Combined estimated-token ceiling for pinned + sliding context.
    pub token_budget: u64,
    /// Maximum number of pinned context items.
    pub pinned_max: usize,
    pub ledger_lock_mode: LedgerLockMode,
    /// Enables the `allow_outside_milestone` commit bypass. Not for
    /// production configurations.
    pub test_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runs_root: PathBuf::from("./runs"),
            token_budget: 8192,
            pinned_max: 32,
            ledger_lock_mode: LedgerLockMode::Advisory,
            test_mode: false,
        }
    }
}

impl Config {
    /// Parse a TOML document layered over the defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(raw).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.token_budget == 0 {
            return Err(CoreError::Config("token_budget must be positive".into()));
        }
        if self.pinned_max == 0 {
            return Err(CoreError::Config("pinned_max must be positive".into()));
        }
        Ok(())
    }
}
