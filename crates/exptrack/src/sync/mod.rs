//! Mirroring experiment directories to and from remote storage.
//!
//! Every per-experiment operation runs inside a [`SyncSession`]: the remote
//! lease is taken and a `processing` status written before the backend is
//! called, and the final status is written and the lease released however
//! the call ends.

pub mod backend;
pub mod lease;
pub mod mock;
pub mod object;
pub mod status;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::settings::Settings;

pub use backend::{build_backend, is_sync_control_file, StorageBackend};
pub use lease::{FileSyncLease, SyncLease, SyncLockRecord, SYNC_LOCK_FILE, SYNC_LOCK_TTL};
pub use mock::MockStorageBackend;
pub use object::ObjectStorageBackend;
pub use status::{SyncAction, SyncState, SyncStatusRecord, SyncStatusStore, SYNC_STATUS_FILE};

/// How often a running operation renews its lease.
pub const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(20 * 60);

#[derive(Clone)]
pub struct RemoteSyncController {
    backend: Arc<dyn StorageBackend>,
    lease: Arc<dyn SyncLease>,
    status: SyncStatusStore,
    renew_interval: Duration,
}

impl RemoteSyncController {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        let root = backend.output_root().to_path_buf();
        Self {
            lease: Arc::new(FileSyncLease::new(&root)),
            status: SyncStatusStore::new(&root),
            backend,
            renew_interval: LEASE_RENEW_INTERVAL,
        }
    }

    /// `None` when remote storage is not in use.
    pub fn from_settings(settings: &Settings) -> Result<Option<Self>> {
        Ok(build_backend(settings)?.map(Self::new))
    }

    pub fn with_lease(mut self, lease: Arc<dyn SyncLease>) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = interval;
        self
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    pub fn lease(&self) -> &dyn SyncLease {
        self.lease.as_ref()
    }

    pub fn status(&self) -> &SyncStatusStore {
        &self.status
    }

    /// Fails with [`Error::RemoteStorageLocked`] while a remote operation
    /// holds the experiment.
    pub fn ensure_unlocked(&self, workspace_id: &str, experiment_id: &str) -> Result<()> {
        if self.lease.is_held(workspace_id, experiment_id)? {
            warn!(workspace_id, experiment_id, "remote storage is locked");
            return Err(Error::RemoteStorageLocked {
                workspace_id: workspace_id.to_string(),
                experiment_id: experiment_id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn download_experiment(&self, workspace_id: &str, experiment_id: &str) -> Result<bool> {
        self.run(
            workspace_id,
            experiment_id,
            SyncAction::Download,
            self.backend.download_experiment(workspace_id, experiment_id),
        )
        .await
    }

    pub async fn upload_experiment(
        &self,
        workspace_id: &str,
        experiment_id: &str,
        target_files: Option<&[String]>,
    ) -> Result<bool> {
        self.run(
            workspace_id,
            experiment_id,
            SyncAction::Upload,
            self.backend
                .upload_experiment(workspace_id, experiment_id, target_files),
        )
        .await
    }

    pub async fn delete_experiment(&self, workspace_id: &str, experiment_id: &str) -> Result<bool> {
        self.run(
            workspace_id,
            experiment_id,
            SyncAction::Delete,
            self.backend.delete_experiment(workspace_id, experiment_id),
        )
        .await
    }

    /// Spans many experiments, so it takes no per-experiment lease.
    pub async fn download_all_experiment_metas(&self, workspace_id: Option<&str>) -> Result<bool> {
        info!(workspace_id = workspace_id.unwrap_or("*"), "downloading experiment metas");
        let done = self.backend.download_all_metas(workspace_id).await?;
        info!("experiment metas downloaded");
        Ok(done)
    }

    async fn run<F>(
        &self,
        workspace_id: &str,
        experiment_id: &str,
        action: SyncAction,
        op: F,
    ) -> Result<bool>
    where
        F: Future<Output = Result<bool>>,
    {
        let mut session = SyncSession::begin(self, workspace_id, experiment_id, action)?;
        info!(
            workspace_id,
            experiment_id,
            action = ?action,
            bucket = %session.record.remote_bucket_name,
            "remote sync started"
        );
        let mut op = std::pin::pin!(op);
        let mut renew = tokio::time::interval(self.renew_interval);
        renew.tick().await;
        let outcome = loop {
            tokio::select! {
                outcome = &mut op => break outcome,
                _ = renew.tick() => session.renew(),
            }
        };
        match outcome {
            Ok(done) => {
                session.complete(SyncState::Success)?;
                info!(workspace_id, experiment_id, action = ?action, "remote sync finished");
                Ok(done)
            }
            Err(err) => {
                error!(workspace_id, experiment_id, action = ?action, error = %err, "remote sync failed");
                session.complete(SyncState::Error)?;
                Err(err)
            }
        }
    }
}

/// Holds the remote lease for one operation. Dropped without `complete`
/// (panic, cancelled future) it still records `error` and releases.
struct SyncSession<'a> {
    controller: &'a RemoteSyncController,
    workspace_id: String,
    experiment_id: String,
    holder: String,
    record: SyncStatusRecord,
    done: bool,
}

impl<'a> SyncSession<'a> {
    fn begin(
        controller: &'a RemoteSyncController,
        workspace_id: &str,
        experiment_id: &str,
        action: SyncAction,
    ) -> Result<Self> {
        let holder = controller.lease.acquire(workspace_id, experiment_id)?;
        let record = SyncStatusRecord::new(
            &controller.backend.bucket_name(),
            controller.backend.kind(),
            action,
            SyncState::Processing,
        );
        let session = Self {
            controller,
            workspace_id: workspace_id.to_string(),
            experiment_id: experiment_id.to_string(),
            holder,
            record,
            done: false,
        };
        controller
            .status
            .write(workspace_id, experiment_id, &session.record)?;
        Ok(session)
    }

    /// Long transfers keep the lease alive past its TTL.
    fn renew(&self) {
        if let Err(err) = self
            .controller
            .lease
            .renew(&self.workspace_id, &self.experiment_id, &self.holder)
        {
            warn!(
                workspace_id = %self.workspace_id,
                experiment_id = %self.experiment_id,
                error = %err,
                "failed to renew remote sync lock"
            );
        }
    }

    fn finish(&self, state: SyncState) -> Result<()> {
        let status = self.controller.status.write(
            &self.workspace_id,
            &self.experiment_id,
            &self.record.with_state(state),
        );
        let release = self
            .controller
            .lease
            .release(&self.workspace_id, &self.experiment_id, &self.holder);
        status.and(release)
    }

    fn complete(&mut self, state: SyncState) -> Result<()> {
        self.done = true;
        self.finish(state)
    }
}

impl Drop for SyncSession<'_> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.finish(SyncState::Error);
        }
    }
}
