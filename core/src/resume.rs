//! Resume packs: content-addressed snapshots of a run, and their restore.
//!
//! A pack is a directory or zip holding the working set, the ledger, the
//! most recent episode, and a manifest hashing every file. Manifest paths
//! are relative to the pack root; packs are self-contained and relocate
//! freely. Restore re-hashes everything before trusting a single byte.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use runstate_protocol::{Episode, FileDigest, PackManifest, SCHEMA_VERSION, WorkingSet};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zip::write::FileOptions;

use crate::error::{CoreError, Result};
use crate::schema::{SchemaKind, SchemaSet};

/// Relative paths inside every pack.
pub const PACK_WS_PATH: &str = "state/working_set.json";
pub const PACK_LEDGER_PATH: &str = "ledger/run.jsonl";
pub const PACK_EPISODE_PATH: &str = "episodes/latest.json";
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// What `snapshot` produced.
#[derive(Clone, Debug)]
pub struct SnapshotOutcome {
    pub pack_id: String,
    pub path: PathBuf,
    pub manifest: PackManifest,
}

/// What `load` reconstituted.
#[derive(Clone, Debug)]
pub struct LoadOutcome {
    pub run_id: String,
    pub prior_run_id: String,
    pub pack_id: String,
    pub ws: WorkingSet,
}

/// Newest sealed episode in `episodes_dir`, by `(created_at, episode_id)`.
pub fn latest_episode(episodes_dir: &Path, schemas: &SchemaSet) -> Result<Option<Episode>> {
    if !episodes_dir.exists() {
        return Ok(None);
    }
    let mut latest: Option<Episode> = None;
    let entries =
        std::fs::read_dir(episodes_dir).map_err(|e| CoreError::io(episodes_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| CoreError::io(episodes_dir, e))?;
        let path = entry.path();
        if path.extension().map(|ext| ext == "json") != Some(true) {
            continue;
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| CoreError::io(&path, e))?;
        let value: Value = serde_json::from_str(&raw)?;
        schemas.validate(SchemaKind::Episode, &value)?;
        let episode: Episode = serde_json::from_value(value)?;
        let newer = match &latest {
            None => true,
            Some(current) => {
                (episode.created_at, &episode.episode_id)
                    > (current.created_at, &current.episode_id)
            }
        };
        if newer {
            latest = Some(episode);
        }
    }
    Ok(latest)
}

/// Snapshot a run directory into `resume/pack_<id>` (or `.zip`).
///
/// The caller holds the per-run mutex so the working set and ledger cannot
/// move under the copy. The `RESUME_SNAPSHOT` ledger event is appended by
/// the caller after materialization, so the packed ledger never contains
/// its own snapshot event.
pub fn snapshot(
    run_dir: &Path,
    run_id: &str,
    zip_pack: bool,
    pointers: Value,
    schemas: &SchemaSet,
) -> Result<SnapshotOutcome> {
    let ws_path = run_dir.join(PACK_WS_PATH);
    let ws_bytes = std::fs::read(&ws_path).map_err(|e| CoreError::io(&ws_path, e))?;
    let ws_value: Value = serde_json::from_slice(&ws_bytes)?;
    schemas.validate(SchemaKind::WorkingSet, &ws_value)?;

    let ledger_path = run_dir.join(PACK_LEDGER_PATH);
    let ledger_bytes =
        std::fs::read(&ledger_path).map_err(|e| CoreError::io(&ledger_path, e))?;

    let episode = latest_episode(&run_dir.join("episodes"), schemas)?;
    let episode_bytes = match &episode {
        Some(episode) => Some(serde_json::to_vec_pretty(episode)?),
        None => None,
    };

    let mut entries: Vec<(&str, &[u8])> = vec![
        (PACK_WS_PATH, ws_bytes.as_slice()),
        (PACK_LEDGER_PATH, ledger_bytes.as_slice()),
    ];
    if let Some(bytes) = &episode_bytes {
        entries.push((PACK_EPISODE_PATH, bytes.as_slice()));
    }

    let mut files = BTreeMap::new();
    for (rel, bytes) in &entries {
        files.insert(
            (*rel).to_string(),
            FileDigest {
                sha256: sha256_hex(bytes),
                size: bytes.len() as u64,
            },
        );
    }

    let pack_id = Uuid::new_v4().to_string();
    let manifest = PackManifest {
        schema_version: SCHEMA_VERSION.to_string(),
        pack_id: pack_id.clone(),
        run_id: run_id.to_string(),
        created_at: chrono::Utc::now(),
        files,
        pointers,
    };
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;

    let resume_dir = run_dir.join("resume");
    std::fs::create_dir_all(&resume_dir).map_err(|e| CoreError::io(&resume_dir, e))?;

    let path = if zip_pack {
        materialize_zip(&resume_dir, &pack_id, &entries, &manifest_bytes)?
    } else {
        materialize_dir(&resume_dir, &pack_id, &entries, &manifest_bytes)?
    };

    tracing::info!(run_id, pack_id = %pack_id, path = %path.display(), "resume pack written");
    Ok(SnapshotOutcome {
        pack_id,
        path,
        manifest,
    })
}

/// Write the pack as a directory: staged under a dot-prefixed sibling, then
/// renamed into place so a crash never leaves a half-built `pack_<id>/`.
fn materialize_dir(
    resume_dir: &Path,
    pack_id: &str,
    entries: &[(&str, &[u8])],
    manifest_bytes: &[u8],
) -> Result<PathBuf> {
    let staging = resume_dir.join(format!(".{pack_id}.tmp"));
    let target = resume_dir.join(format!("pack_{pack_id}"));
    if staging.exists() {
        std::fs::remove_dir_all(&staging).map_err(|e| CoreError::io(&staging, e))?;
    }

    for &(rel, bytes) in entries
        .iter()
        .chain(std::iter::once(&(MANIFEST_FILENAME, manifest_bytes)))
    {
        let dest = staging.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
        }
        let mut file = std::fs::File::create(&dest).map_err(|e| CoreError::io(&dest, e))?;
        file.write_all(bytes).map_err(|e| CoreError::io(&dest, e))?;
        file.sync_all().map_err(|e| CoreError::io(&dest, e))?;
    }

    std::fs::rename(&staging, &target).map_err(|e| CoreError::io(&target, e))?;
    Ok(target)
}

/// Write the pack as a zip via a temp sibling + rename.
fn materialize_zip(
    resume_dir: &Path,
    pack_id: &str,
    entries: &[(&str, &[u8])],
    manifest_bytes: &[u8],
) -> Result<PathBuf> {
    let staging = resume_dir.join(format!(".{pack_id}.zip.tmp"));
    let target = resume_dir.join(format!("pack_{pack_id}.zip"));

    let file = std::fs::File::create(&staging).map_err(|e| CoreError::io(&staging, e))?;
    let mut writer = zip::ZipWriter::new(file);
    let options: FileOptions = FileOptions::default();

    for &(rel, bytes) in entries
        .iter()
        .chain(std::iter::once(&(MANIFEST_FILENAME, manifest_bytes)))
    {
        writer
            .start_file(rel, options)
            .map_err(|e| CoreError::io(&staging, std::io::Error::other(e)))?;
        writer
            .write_all(bytes)
            .map_err(|e| CoreError::io(&staging, e))?;
    }
    let file = writer
        .finish()
        .map_err(|e| CoreError::io(&staging, std::io::Error::other(e)))?;
    file.sync_all().map_err(|e| CoreError::io(&staging, e))?;

    std::fs::rename(&staging, &target).map_err(|e| CoreError::io(&target, e))?;
    Ok(target)
}

/// Restore a pack into a fresh run directory under `runs_root`.
///
/// Every manifest entry is re-hashed before anything is written; a mismatch
/// or unreadable entry fails with the offending relative path. The caller
/// appends `RESUME_LOADED` after reopening the run.
pub fn load(
    pack_path: &Path,
    runs_root: &Path,
    new_run_id: Option<String>,
    schemas: &SchemaSet,
) -> Result<LoadOutcome> {
    let mut reader = PackReader::open(pack_path)?;

    let manifest_bytes = reader.read(MANIFEST_FILENAME)?;
    let manifest_value: Value = serde_json::from_slice(&manifest_bytes)?;
    schemas.validate(SchemaKind::PackManifest, &manifest_value)?;
    let manifest: PackManifest = serde_json::from_value(manifest_value)?;

    // Verify every file against the manifest before trusting any of them.
    let mut contents: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for (rel, digest) in &manifest.files {
        check_relative(rel)?;
        let bytes = reader.read(rel)?;
        if sha256_hex(&bytes) != digest.sha256 || bytes.len() as u64 != digest.size {
            return Err(CoreError::PackCorruption { path: rel.clone() });
        }
        contents.insert(rel.clone(), bytes);
    }

    let ws_bytes = contents
        .get(PACK_WS_PATH)
        .ok_or_else(|| CoreError::PackCorruption {
            path: PACK_WS_PATH.to_string(),
        })?;
    let ws_value: Value = serde_json::from_slice(ws_bytes)?;
    schemas.validate(SchemaKind::WorkingSet, &ws_value)?;
    let mut ws: WorkingSet = serde_json::from_value(ws_value)?;

    let run_id = new_run_id.unwrap_or_else(|| format!("run-{}", Uuid::new_v4()));
    let run_dir = runs_root.join(&run_id);
    if run_dir.exists() {
        return Err(CoreError::AlreadyExists {
            what: "run directory",
            id: run_id,
        });
    }

    // Reconstituted runs answer to their new id; everything else in the
    // document is carried over byte-for-byte semantics.
    let prior_run_id = std::mem::replace(&mut ws.run_id, run_id.clone());

    for sub in ["state", "ledger", "episodes", "resume"] {
        let dir = run_dir.join(sub);
        std::fs::create_dir_all(&dir).map_err(|e| CoreError::io(&dir, e))?;
    }

    crate::fsio::write_atomic(&run_dir.join(PACK_WS_PATH), &serde_json::to_vec_pretty(&ws)?)?;
    crate::fsio::write_atomic(
        &run_dir.join(PACK_LEDGER_PATH),
        contents
            .get(PACK_LEDGER_PATH)
            .ok_or_else(|| CoreError::PackCorruption {
                path: PACK_LEDGER_PATH.to_string(),
            })?,
    )?;

    if let Some(episode_bytes) = contents.get(PACK_EPISODE_PATH) {
        let episode_value: Value = serde_json::from_slice(episode_bytes)?;
        schemas.validate(SchemaKind::Episode, &episode_value)?;
        let episode: Episode = serde_json::from_value(episode_value)?;
        // Episodes are immutable history; they keep their original ids and
        // run references.
        crate::fsio::write_atomic(
            &run_dir.join("episodes").join(format!("{}.json", episode.episode_id)),
            episode_bytes,
        )?;
    }

    tracing::info!(
        pack_id = %manifest.pack_id,
        prior_run_id = %manifest.run_id,
        run_id = %run_id,
        "resume pack loaded"
    );

    Ok(LoadOutcome {
        run_id,
        prior_run_id,
        pack_id: manifest.pack_id,
        ws,
    })
}

/// Manifest paths must stay inside the pack.
fn check_relative(rel: &str) -> Result<()> {
    let path = Path::new(rel);
    if path.is_absolute()
        || rel.starts_with('/')
        || path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir | std::path::Component::Prefix(_)))
    {
        return Err(CoreError::schema(
            format!("/files/{rel}"),
            "manifest paths must be relative to the pack root",
        ));
    }
    Ok(())
}

/// Uniform reader over the two pack layouts.
enum PackReader {
    Dir(PathBuf),
    Zip(Box<zip::ZipArchive<std::fs::File>>),
}

impl PackReader {
    fn open(pack_path: &Path) -> Result<Self> {
        if pack_path.is_dir() {
            return Ok(Self::Dir(pack_path.to_path_buf()));
        }
        let file = std::fs::File::open(pack_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::NotFound {
                    what: "resume pack",
                    id: pack_path.display().to_string(),
                }
            } else {
                CoreError::io(pack_path, e)
            }
        })?;
        let archive = zip::ZipArchive::new(file).map_err(|e| CoreError::PackCorruption {
            path: format!("{} ({e})", pack_path.display()),
        })?;
        Ok(Self::Zip(Box::new(archive)))
    }

    fn read(&mut self, rel: &str) -> Result<Vec<u8>> {
        match self {
            Self::Dir(root) => {
                let path = root.join(rel);
                std::fs::read(&path).map_err(|_| CoreError::PackCorruption {
                    path: rel.to_string(),
                })
            }
            Self::Zip(archive) => {
                let mut entry = archive.by_name(rel).map_err(|_| CoreError::PackCorruption {
                    path: rel.to_string(),
                })?;
                let mut bytes = Vec::with_capacity(entry.size() as usize);
                entry
                    .read_to_end(&mut bytes)
                    .map_err(|_| CoreError::PackCorruption {
                        path: rel.to_string(),
                    })?;
                Ok(bytes)
            }
        }
    }
}
