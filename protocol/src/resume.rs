//! Resume-pack manifest types.
//!
//! A resume pack is a relocatable bundle: working set, ledger, latest
//! episode, and a manifest that content-addresses every file. Manifest
//! paths are always relative to the pack root.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Content address of one packed file.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileDigest {
    /// Lowercase hex SHA-256 of the file bytes.
    pub sha256: String,
    pub size: u64,
}

/// `manifest.json` at the pack root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackManifest {
    #[serde(rename = "_schema_version")]
    pub schema_version: String,
    pub pack_id: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    /// Relative path → digest, in sorted order for stable serialization.
    pub files: BTreeMap<String, FileDigest>,
    /// Free-form opaque pointers (e.g. external ledger offsets).
    #[serde(default)]
    pub pointers: Value,
}
