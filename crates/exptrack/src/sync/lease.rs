//! Advisory lock guarding an experiment's remote copy.
//!
//! The lock is a lease: it carries the time it was taken and stops counting
//! after a fixed TTL, so a crashed holder cannot block the experiment forever.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::descriptor::{now_timestamp, parse_timestamp};
use crate::error::{Error, Result};
use crate::fsutil::{atomic_write_json_pretty, ensure_dir};
use crate::settings::experiment_dir;

pub const SYNC_LOCK_FILE: &str = "remote_sync.json";
pub const SYNC_LOCK_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLockRecord {
    pub workspace_id: String,
    pub experiment_id: String,
    pub timestamp: String,
    /// Token identifying the holder; renew and release only act on a match.
    #[serde(default)]
    pub holder: String,
}

pub trait SyncLease: Send + Sync {
    /// Returns the holder token. Fails with [`Error::RemoteStorageLocked`]
    /// while another holder's lease is live.
    fn acquire(&self, workspace_id: &str, experiment_id: &str) -> Result<String>;
    /// Fails with [`Error::RemoteStorageLocked`] once the lease has passed to
    /// another holder.
    fn renew(&self, workspace_id: &str, experiment_id: &str, holder: &str) -> Result<()>;
    /// Leaves a lock taken over by another holder in place.
    fn release(&self, workspace_id: &str, experiment_id: &str, holder: &str) -> Result<()>;
    fn is_held(&self, workspace_id: &str, experiment_id: &str) -> Result<bool>;
}

/// Lease stored as `remote_sync.json` in the experiment directory.
#[derive(Debug, Clone)]
pub struct FileSyncLease {
    output_root: PathBuf,
    ttl: Duration,
}

impl FileSyncLease {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            ttl: SYNC_LOCK_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn path(&self, workspace_id: &str, experiment_id: &str) -> PathBuf {
        lock_path(&experiment_dir(&self.output_root, workspace_id, experiment_id))
    }

    fn locked(workspace_id: &str, experiment_id: &str) -> Error {
        Error::RemoteStorageLocked {
            workspace_id: workspace_id.to_string(),
            experiment_id: experiment_id.to_string(),
        }
    }

    fn read_record(path: &Path) -> Option<SyncLockRecord> {
        fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<SyncLockRecord>(&bytes).ok())
    }

    fn is_expired(&self, path: &Path) -> bool {
        let taken_at = Self::read_record(path)
            .and_then(|record| parse_timestamp(&record.timestamp))
            .and_then(|ts| ts.and_local_timezone(Local).single());
        let age = match taken_at {
            Some(ts) => (Local::now() - ts).to_std().unwrap_or(Duration::ZERO),
            None => fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                .unwrap_or(Duration::ZERO),
        };
        age >= self.ttl
    }

    /// Removes an expired lock file. Returns true while a live lock remains.
    fn check(&self, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        if self.is_expired(path) {
            warn!(lock = %path.display(), "removing expired remote sync lock");
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(false);
        }
        Ok(true)
    }
}

impl SyncLease for FileSyncLease {
    fn acquire(&self, workspace_id: &str, experiment_id: &str) -> Result<String> {
        let path = self.path(workspace_id, experiment_id);
        if self.check(&path)? {
            warn!(workspace_id, experiment_id, "remote storage is locked");
            return Err(Self::locked(workspace_id, experiment_id));
        }
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let record = SyncLockRecord {
            workspace_id: workspace_id.to_string(),
            experiment_id: experiment_id.to_string(),
            timestamp: now_timestamp(),
            holder: Uuid::new_v4().to_string(),
        };
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(workspace_id, experiment_id, "remote storage is locked");
                return Err(Self::locked(workspace_id, experiment_id));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&serde_json::to_vec_pretty(&record)?)?;
        file.sync_all()?;
        debug!(workspace_id, experiment_id, "remote sync lock acquired");
        Ok(record.holder)
    }

    fn renew(&self, workspace_id: &str, experiment_id: &str, holder: &str) -> Result<()> {
        let path = self.path(workspace_id, experiment_id);
        if !path.exists() {
            return Err(Error::NotFound(format!("remote sync lock {}", path.display())));
        }
        match Self::read_record(&path) {
            Some(record) if record.holder == holder => atomic_write_json_pretty(
                &path,
                &SyncLockRecord {
                    timestamp: now_timestamp(),
                    ..record
                },
            ),
            _ => {
                warn!(workspace_id, experiment_id, "remote sync lock taken over by another holder");
                Err(Self::locked(workspace_id, experiment_id))
            }
        }
    }

    fn release(&self, workspace_id: &str, experiment_id: &str, holder: &str) -> Result<()> {
        let path = self.path(workspace_id, experiment_id);
        match Self::read_record(&path) {
            Some(record) if record.holder == holder => {}
            Some(_) => {
                warn!(workspace_id, experiment_id, "remote sync lock taken over, leaving it in place");
                return Ok(());
            }
            None if !path.exists() => return Ok(()),
            None => {
                warn!(lock = %path.display(), "unreadable remote sync lock left in place");
                return Ok(());
            }
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(workspace_id, experiment_id, "remote sync lock released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_held(&self, workspace_id: &str, experiment_id: &str) -> Result<bool> {
        self.check(&self.path(workspace_id, experiment_id))
    }
}

pub fn lock_path(experiment_dir: &Path) -> PathBuf {
    experiment_dir.join(SYNC_LOCK_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_locked_until_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lease = FileSyncLease::new(dir.path());
        let holder = lease.acquire("ws", "e1").expect("first acquire");
        assert!(lease.is_held("ws", "e1").unwrap());

        let err = lease.acquire("ws", "e1").expect_err("second acquire");
        assert!(err.is_locked());
        // other experiments are independent
        lease.acquire("ws", "e2").expect("other experiment");

        lease.release("ws", "e1", &holder).expect("release");
        assert!(!lease.is_held("ws", "e1").unwrap());
        lease.acquire("ws", "e1").expect("re-acquire");
    }

    #[test]
    fn expired_lock_is_removed_by_next_reader() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lease = FileSyncLease::new(dir.path());
        let path = lease.path("ws", "e1");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let record = SyncLockRecord {
            workspace_id: "ws".to_string(),
            experiment_id: "e1".to_string(),
            timestamp: "2020-01-01 00:00:00".to_string(),
            holder: "crashed".to_string(),
        };
        fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

        assert!(!lease.is_held("ws", "e1").unwrap());
        assert!(!path.exists());
        lease.acquire("ws", "e1").expect("acquire after expiry");
    }

    #[test]
    fn renew_requires_existing_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lease = FileSyncLease::new(dir.path()).with_ttl(Duration::from_secs(5));
        assert!(matches!(lease.renew("ws", "e1", "nobody"), Err(Error::NotFound(_))));
        let holder = lease.acquire("ws", "e1").unwrap();
        lease.renew("ws", "e1", &holder).expect("renew");
        assert!(lease.is_held("ws", "e1").unwrap());
        assert!(lease.renew("ws", "e1", "someone-else").unwrap_err().is_locked());
    }

    #[test]
    fn release_after_takeover_keeps_the_new_holders_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lease = FileSyncLease::new(dir.path()).with_ttl(Duration::ZERO);
        let path = lease.path("ws", "e1");

        let stale = lease.acquire("ws", "e1").expect("first holder");
        // the zero TTL expires the first lease at once
        let current = lease.acquire("ws", "e1").expect("second holder");
        assert_ne!(stale, current);

        lease.release("ws", "e1", &stale).expect("stale release");
        assert!(path.exists());
        assert!(lease.renew("ws", "e1", &stale).unwrap_err().is_locked());

        lease.release("ws", "e1", &current).expect("release");
        assert!(!path.exists());
    }
}
