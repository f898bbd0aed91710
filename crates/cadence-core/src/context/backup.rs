use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::store::{ContextStore, Snapshot};
use crate::error::ContextError;

const ENVELOPE_FORMAT: u32 = 1;
const FILE_PREFIX: &str = "context.";
const FILE_SUFFIX: &str = ".json";

/// On-disk wrapper around a store snapshot.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    format: u32,
    /// Hex SHA-256 of `payload`.
    checksum: String,
    created_at: DateTime<Utc>,
    /// Snapshot JSON, kept as a string so the checksum covers exact bytes.
    payload: String,
}

/// A backup that passed every integrity check.
#[derive(Debug, Clone)]
pub struct Backup {
    pub path: PathBuf,
    pub sequence: u64,
    pub snapshot: Snapshot,
}

/// One file found in the backup directory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub path: PathBuf,
    pub sequence: u64,
    pub size_bytes: u64,
    /// `None` when the file is intact, otherwise why it was rejected.
    pub problem: Option<String>,
}

fn checksum(payload: &[u8]) -> String {
    Sha256::digest(payload)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn corruption(path: &Path, detail: impl Into<String>) -> ContextError {
    ContextError::StateCorruption {
        source_name: path.display().to_string(),
        detail: detail.into(),
    }
}

fn sequence_from_name(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse()
        .ok()
}

/// Rotating set of checksummed snapshot files.
///
/// Files are named `context.<sequence>.json`; the newest valid one wins.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
    keep: usize,
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            dir: dir.into(),
            keep: keep.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the store's current state as a new backup and prune old ones.
    pub fn export(&self, store: &ContextStore) -> Result<PathBuf, ContextError> {
        let snapshot = store.to_snapshot()?;
        let payload = String::from_utf8(snapshot.encode()?)
            .map_err(|e| corruption(&self.dir, format!("snapshot is not UTF-8: {e}")))?;
        let envelope = Envelope {
            format: ENVELOPE_FORMAT,
            checksum: checksum(payload.as_bytes()),
            created_at: Utc::now(),
            payload,
        };

        std::fs::create_dir_all(&self.dir)?;
        let path = self
            .dir
            .join(format!("{FILE_PREFIX}{:08}{FILE_SUFFIX}", snapshot.sequence));
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&envelope)?)?;
        std::fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), sequence = snapshot.sequence, "Context backup written");

        self.prune()?;
        Ok(path)
    }

    /// Backup files, newest first.
    fn files(&self) -> Result<Vec<(u64, PathBuf)>, ContextError> {
        let read_dir = match std::fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files: Vec<(u64, PathBuf)> = read_dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter_map(|path| sequence_from_name(&path).map(|seq| (seq, path)))
            .collect();
        files.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(files)
    }

    fn prune(&self) -> Result<(), ContextError> {
        for (_, path) in self.files()?.into_iter().skip(self.keep) {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), "Failed to remove old backup: {e}");
            }
        }
        Ok(())
    }

    /// Read and verify a single backup file.
    pub fn read(&self, path: &Path) -> Result<Backup, ContextError> {
        let bytes = std::fs::read(path)?;
        let envelope: Envelope = serde_json::from_slice(&bytes)
            .map_err(|e| corruption(path, format!("unreadable envelope: {e}")))?;
        if envelope.format != ENVELOPE_FORMAT {
            return Err(corruption(
                path,
                format!("unsupported envelope format {}", envelope.format),
            ));
        }
        if checksum(envelope.payload.as_bytes()) != envelope.checksum {
            return Err(corruption(path, "checksum mismatch"));
        }
        let snapshot = Snapshot::decode(envelope.payload.as_bytes()).map_err(|e| match e {
            ContextError::StateCorruption { detail, .. } => corruption(path, detail),
            other => corruption(path, other.to_string()),
        })?;
        Ok(Backup {
            path: path.to_path_buf(),
            sequence: snapshot.sequence,
            snapshot,
        })
    }

    /// Newest backup that passes verification. Corrupt files are skipped
    /// with a warning; `None` if nothing usable exists.
    pub fn load_latest_valid(&self) -> Result<Option<Backup>, ContextError> {
        for (_, path) in self.files()? {
            match self.read(&path) {
                Ok(backup) => return Ok(Some(backup)),
                Err(e) => warn!("Skipping backup: {e}"),
            }
        }
        Ok(None)
    }

    /// Restore `store` from the newest valid backup. Returns whether one was found.
    pub fn restore_latest(&self, store: &ContextStore) -> Result<bool, ContextError> {
        match self.load_latest_valid()? {
            Some(backup) => {
                info!(path = %backup.path.display(), sequence = backup.sequence, "Restoring context from backup");
                store.restore_snapshot(backup.snapshot)?;
                Ok(true)
            }
            None => {
                warn!(dir = %self.dir.display(), "No valid context backup found, starting empty");
                Ok(false)
            }
        }
    }

    pub fn list(&self) -> Result<Vec<BackupInfo>, ContextError> {
        self.files()?
            .into_iter()
            .map(|(sequence, path)| {
                let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                let problem = self.read(&path).err().map(|e| e.to_string());
                Ok(BackupInfo {
                    path,
                    sequence,
                    size_bytes,
                    problem,
                })
            })
            .collect()
    }
}
