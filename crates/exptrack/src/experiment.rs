//! Whole-experiment maintenance: delete, rename, copy.

use std::fs;
use std::path::Path;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::artifact::{find_node_artifact, rewrite_output_paths};
use crate::config_store::ConfigStore;
use crate::descriptor::{DescriptorPatch, ExperimentDescriptor, OutputRefs, RunStatus, DESCRIPTOR_FILE};
use crate::error::{Error, Result};
use crate::fsutil::copy_dir_filtered;
use crate::settings::Settings;
use crate::sync::{is_sync_control_file, RemoteSyncController};

const COPY_SUFFIX: &str = "_copy";
const NEW_ID_LEN: usize = 8;

pub fn new_experiment_id() -> String {
    Uuid::new_v4().simple().to_string()[..NEW_ID_LEN].to_string()
}

/// Replaces every `/`-separated segment equal to `old` with `new`.
pub fn replace_id_segment(path: &str, old: &str, new: &str) -> String {
    path.split('/')
        .map(|segment| if segment == old { new } else { segment })
        .collect::<Vec<_>>()
        .join("/")
}

fn rewrite_refs(refs: &mut Option<OutputRefs>, old: &str, new: &str) {
    if let Some(refs) = refs {
        for output in refs.values_mut() {
            output.path = replace_id_segment(&output.path, old, new);
        }
    }
}

pub struct ExperimentManager {
    store: ConfigStore,
    sync: Option<RemoteSyncController>,
}

impl ExperimentManager {
    pub fn new(store: ConfigStore, sync: Option<RemoteSyncController>) -> Self {
        Self { store, sync }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self::new(
            ConfigStore::from_settings(settings),
            RemoteSyncController::from_settings(settings)?,
        ))
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    fn ensure_unlocked(&self, workspace_id: &str, experiment_id: &str) -> Result<()> {
        match &self.sync {
            Some(sync) => sync.ensure_unlocked(workspace_id, experiment_id),
            None => Ok(()),
        }
    }

    /// Removes local and remote data. Running experiments are left alone and
    /// reported as `false`.
    pub async fn delete(&self, workspace_id: &str, experiment_id: &str) -> Result<bool> {
        let dir = self.store.experiment_dir(workspace_id, experiment_id);
        if self.store.exists(workspace_id, experiment_id) {
            let descriptor = self.store.read(workspace_id, experiment_id)?;
            if descriptor.status == RunStatus::Running {
                warn!(workspace_id, experiment_id, "refusing to delete a running experiment");
                return Ok(false);
            }
        } else if !dir.is_dir() && self.sync.is_none() {
            return Err(Error::NotFound(format!("experiment {}/{}", workspace_id, experiment_id)));
        }

        if let Some(sync) = &self.sync {
            sync.ensure_unlocked(workspace_id, experiment_id)?;
            sync.delete_experiment(workspace_id, experiment_id).await?;
        }
        if dir.is_dir() {
            fs::remove_dir_all(&dir)?;
        }
        info!(workspace_id, experiment_id, "experiment deleted");
        Ok(true)
    }

    pub async fn rename(
        &self,
        workspace_id: &str,
        experiment_id: &str,
        name: &str,
    ) -> Result<ExperimentDescriptor> {
        self.ensure_unlocked(workspace_id, experiment_id)?;
        let descriptor = self
            .store
            .overwrite(workspace_id, experiment_id, &DescriptorPatch::rename(name))?;
        if let Some(sync) = &self.sync {
            sync.upload_experiment(workspace_id, experiment_id, Some(&[DESCRIPTOR_FILE.to_string()]))
                .await?;
        }
        Ok(descriptor)
    }

    /// Copies an experiment under `new_id`. The copy's descriptor and result
    /// artifacts point at the new id and its name gets a `_copy` suffix.
    pub async fn copy(
        &self,
        workspace_id: &str,
        experiment_id: &str,
        new_id: &str,
    ) -> Result<ExperimentDescriptor> {
        self.ensure_unlocked(workspace_id, experiment_id)?;
        let source = self.store.experiment_dir(workspace_id, experiment_id);
        if !self.store.exists(workspace_id, experiment_id) {
            return Err(Error::NotFound(format!("experiment {}/{}", workspace_id, experiment_id)));
        }
        let target = self.store.experiment_dir(workspace_id, new_id);
        if target.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("experiment directory {} already exists", target.display()),
            )));
        }

        copy_dir_filtered(&source, &target, is_sync_control_file)?;
        let descriptor = self.rewrite_copied(workspace_id, experiment_id, new_id, &target)?;

        if let Some(sync) = &self.sync {
            sync.upload_experiment(workspace_id, new_id, None).await?;
        }
        info!(workspace_id, experiment_id, new_id, "experiment copied");
        Ok(descriptor)
    }

    fn rewrite_copied(
        &self,
        workspace_id: &str,
        old_id: &str,
        new_id: &str,
        target: &Path,
    ) -> Result<ExperimentDescriptor> {
        let mut descriptor = ConfigStore::read_from_path(&target.join(DESCRIPTOR_FILE))?;
        descriptor.experiment_id = new_id.to_string();
        descriptor.workspace_id = workspace_id.to_string();
        descriptor.name = format!("{}{}", descriptor.name, COPY_SUFFIX);
        for record in descriptor
            .nodes
            .values_mut()
            .chain(descriptor.post_process_nodes.values_mut())
        {
            rewrite_refs(&mut record.output_refs, old_id, new_id);
        }
        self.store.write(&descriptor)?;

        for node_id in descriptor.node_ids() {
            if let Some(artifact) = find_node_artifact(&target.join(&node_id)) {
                rewrite_output_paths(&artifact.path, |p| replace_id_segment(p, old_id, new_id))?;
            }
        }
        Ok(descriptor)
    }

    /// Copies each experiment under a fresh id. On the first failure every
    /// copy made so far is removed again.
    pub async fn copy_many(&self, workspace_id: &str, experiment_ids: &[String]) -> Result<Vec<String>> {
        let mut created: Vec<String> = Vec::new();
        for experiment_id in experiment_ids {
            let new_id = new_experiment_id();
            match self.copy(workspace_id, experiment_id, &new_id).await {
                Ok(_) => created.push(new_id),
                Err(err) => {
                    error!(workspace_id, experiment_id = %experiment_id, error = %err, "copy failed, rolling back");
                    created.push(new_id);
                    let cleaned_up = self.discard_copies(workspace_id, &created).await;
                    return Err(Error::CopyFailed {
                        failed_id: experiment_id.clone(),
                        cleaned_up,
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(created)
    }

    async fn discard_copies(&self, workspace_id: &str, ids: &[String]) -> Vec<String> {
        let mut cleaned = Vec::new();
        for id in ids {
            let dir = self.store.experiment_dir(workspace_id, id);
            // a copy that failed before creating its directory left nothing behind
            if !dir.exists() {
                continue;
            }
            let mut removed = false;
            if let Some(sync) = &self.sync {
                match sync.delete_experiment(workspace_id, id).await {
                    Ok(deleted) => removed |= deleted,
                    Err(err) => warn!(workspace_id, experiment_id = %id, error = %err, "failed to remove remote copy"),
                }
            }
            if dir.exists() {
                match fs::remove_dir_all(&dir) {
                    Ok(()) => removed = true,
                    Err(err) => warn!(dir = %dir.display(), error = %err, "failed to remove copy"),
                }
            }
            if removed {
                cleaned.push(id.clone());
            }
        }
        cleaned
    }
}
