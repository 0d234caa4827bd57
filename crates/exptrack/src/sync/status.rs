use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::descriptor::now_timestamp;
use crate::error::Result;
use crate::fsutil::atomic_write_json_pretty;
use crate::settings::{experiment_dir, StorageKind};

pub const SYNC_STATUS_FILE: &str = "remote_sync_stat.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Upload,
    Download,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Processing,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusRecord {
    pub remote_bucket_name: String,
    pub storage_kind: StorageKind,
    pub action: SyncAction,
    pub state: SyncState,
    pub timestamp: String,
}

impl SyncStatusRecord {
    pub fn new(bucket: &str, kind: StorageKind, action: SyncAction, state: SyncState) -> Self {
        Self {
            remote_bucket_name: bucket.to_string(),
            storage_kind: kind,
            action,
            state,
            timestamp: now_timestamp(),
        }
    }

    pub fn with_state(&self, state: SyncState) -> Self {
        Self {
            state,
            timestamp: now_timestamp(),
            ..self.clone()
        }
    }
}

/// `remote_sync_stat.json` files, one per experiment directory.
#[derive(Debug, Clone)]
pub struct SyncStatusStore {
    output_root: PathBuf,
}

impl SyncStatusStore {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
        }
    }

    pub fn path(&self, workspace_id: &str, experiment_id: &str) -> PathBuf {
        status_path(&experiment_dir(&self.output_root, workspace_id, experiment_id))
    }

    pub fn read(&self, workspace_id: &str, experiment_id: &str) -> Result<Option<SyncStatusRecord>> {
        let path = self.path(workspace_id, experiment_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable sync status");
                Ok(None)
            }
        }
    }

    pub fn write(&self, workspace_id: &str, experiment_id: &str, record: &SyncStatusRecord) -> Result<()> {
        atomic_write_json_pretty(&self.path(workspace_id, experiment_id), record)
    }

    /// True when the last remote operation finished successfully.
    pub fn is_synced(&self, workspace_id: &str, experiment_id: &str) -> Result<bool> {
        Ok(self
            .read(workspace_id, experiment_id)?
            .map(|r| r.state == SyncState::Success)
            .unwrap_or(false))
    }

    pub fn delete(&self, workspace_id: &str, experiment_id: &str) -> Result<bool> {
        match fs::remove_file(self.path(workspace_id, experiment_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

pub fn status_path(experiment_dir: &Path) -> PathBuf {
    experiment_dir.join(SYNC_STATUS_FILE)
}
