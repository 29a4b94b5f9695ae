//! Crash-safe file primitives: atomic whole-file writes and durable
//! line-oriented appends.
//!
//! `write_atomic` uses the temp-file + fsync + rename pattern, then syncs
//! the parent directory so the rename itself is durable. `AppendHandle`
//! fsyncs after every line and can hold a best-effort advisory lock.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::config::LedgerLockMode;
use crate::error::{CoreError, Result};

/// Write `bytes` to `path` so a reader sees either the prior content or the
/// new content, never a partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CoreError::io(path, std::io::Error::other("path has no parent")))?;
    std::fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;

    let file_name = path
        .file_name()
        .and_then(std::ffi::OsStr::to_str)
        .ok_or_else(|| CoreError::io(path, std::io::Error::other("path has no file name")))?;
    let nonce: u64 = rand::random();
    let tmp = parent.join(format!(".{file_name}.tmp.{nonce:016x}"));

    let mut file = File::create(&tmp).map_err(|e| CoreError::io(&tmp, e))?;
    file.write_all(bytes).map_err(|e| CoreError::io(&tmp, e))?;
    file.sync_all().map_err(|e| CoreError::io(&tmp, e))?;
    drop(file);

    std::fs::rename(&tmp, path).map_err(|e| CoreError::io(path, e))?;
    sync_dir(parent);
    Ok(())
}

/// Fsync a directory so a completed rename survives power loss. Best-effort:
/// some filesystems refuse to open directories for sync.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        if let Err(e) = handle.sync_all() {
            tracing::debug!(dir = %dir.display(), error = %e, "directory fsync unavailable");
        }
    }
}

/// Append-only handle with per-line fsync.
///
/// Lines are written whole (payload + `\n`) and synced before `append_line`
/// returns, so a crash can truncate at most the line in flight.
pub struct AppendHandle {
    file: File,
    path: PathBuf,
    offset: u64,
    locked: bool,
}

impl AppendHandle {
    /// Open (creating if needed) for appending. With
    /// [`LedgerLockMode::Advisory`] an exclusive `fs2` lock is taken; a lock
    /// held elsewhere is an error, while platforms without advisory locking
    /// degrade to the single-writer assumption.
    pub fn open(path: &Path, lock_mode: LedgerLockMode) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .map_err(|e| CoreError::io(path, e))?;

        let locked = match lock_mode {
            LedgerLockMode::None => false,
            LedgerLockMode::Advisory => match file.try_lock_exclusive() {
                Ok(()) => true,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Err(CoreError::io(
                        path,
                        std::io::Error::new(
                            std::io::ErrorKind::WouldBlock,
                            "append handle is locked by another writer",
                        ),
                    ));
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "advisory lock unavailable; falling back to single-writer assumption"
                    );
                    false
                }
            },
        };

        let offset = file
            .metadata()
            .map_err(|e| CoreError::io(path, e))?
            .len();

        Ok(Self {
            file,
            path: path.to_path_buf(),
            offset,
            locked,
        })
    }

    /// Append one line and fsync. Returns the byte offset the line began at.
    pub fn append_line(&mut self, line: &str) -> Result<u64> {
        debug_assert!(!line.contains('\n'), "ledger lines must be single-line");
        let started_at = self.offset;
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.file
            .write_all(&buf)
            .map_err(|e| CoreError::io(&self.path, e))?;
        self.file
            .sync_all()
            .map_err(|e| CoreError::io(&self.path, e))?;
        self.offset += buf.len() as u64;
        Ok(started_at)
    }

    /// Current end-of-file offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the advisory lock was actually acquired.
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for AppendHandle {
    fn drop(&mut self) {
        if self.locked {
            // Released on close anyway; unlocking explicitly keeps the
            // window deterministic.
            let _ = fs2::FileExt::unlock(&self.file);
        }
    }
}
