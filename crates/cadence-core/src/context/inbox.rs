use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ContextError;

const FILE_PREFIX: &str = "response.";
const FILE_SUFFIX: &str = ".json";

/// An answer to a suggestion, written by one process for the running pipeline to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedResponse {
    pub suggestion_id: String,
    pub accepted: bool,
    pub submitted_at: DateTime<Utc>,
}

/// Directory of queued responses, one JSON file each.
///
/// Files are named `response.<submitted>.<uuid>.json` so name order is
/// submission order. Writers go through a dot-prefixed temp file and a
/// rename, so readers never see a partial response.
#[derive(Debug, Clone)]
pub struct ResponseInbox {
    dir: PathBuf,
}

fn is_response_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
}

impl ResponseInbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Queue `response` and return the file it was written to.
    pub fn submit(&self, response: &QueuedResponse) -> Result<PathBuf, ContextError> {
        std::fs::create_dir_all(&self.dir)?;
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let name = format!(
            "{FILE_PREFIX}{}.{unique}{FILE_SUFFIX}",
            response.submitted_at.format("%Y%m%dT%H%M%S%.6f")
        );
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!(".{unique}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec(response)?)?;
        std::fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), id = %response.suggestion_id, "Response queued");
        Ok(path)
    }

    fn files(&self) -> Result<Vec<PathBuf>, ContextError> {
        let read_dir = match std::fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files: Vec<PathBuf> = read_dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| is_response_file(path))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Remove and return every queued response, oldest first.
    ///
    /// Unreadable files are logged and discarded.
    pub fn take(&self) -> Result<Vec<QueuedResponse>, ContextError> {
        let mut taken = Vec::new();
        for path in self.files()? {
            let parsed = std::fs::read(&path)
                .map_err(ContextError::from)
                .and_then(|bytes| serde_json::from_slice::<QueuedResponse>(&bytes).map_err(ContextError::from));
            match parsed {
                Ok(response) => taken.push(response),
                Err(e) => warn!(path = %path.display(), "Discarding unreadable queued response: {e}"),
            }
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), "Failed to remove queued response: {e}");
            }
        }
        Ok(taken)
    }

    pub fn is_empty(&self) -> Result<bool, ContextError> {
        Ok(self.files()?.is_empty())
    }
}
