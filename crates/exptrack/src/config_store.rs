//! Durable, concurrency-safe access to experiment descriptors.
//!
//! Every mutation runs read-merge-write while holding the descriptor lock
//! file, and lands on disk through a temp file renamed over the target, so
//! readers that skip the lock never see a torn document.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};

use crate::descriptor::{
    now_timestamp, parse_timestamp, DescriptorPatch, ExperimentDescriptor, NodeRecord, RunStatus,
    DESCRIPTOR_FILE, POST_PROCESS_LABEL, POST_PROCESS_NODE_ID,
};
use crate::error::{Error, Result};
use crate::fsutil::{atomic_write_bytes, LockFile};
use crate::settings::{experiment_dir, Settings};

pub const CONFIG_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Node entry used when a run (re)creates the descriptor.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub node_id: String,
    pub label: String,
    /// Input data nodes have nothing to compute and finish immediately.
    pub is_input: bool,
}

impl NodeSpec {
    pub fn algorithm(node_id: &str, label: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            label: label.to_string(),
            is_input: false,
        }
    }

    pub fn input(node_id: &str, label: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            label: label.to_string(),
            is_input: true,
        }
    }
}

/// Recursively merges `update` into `base`: nested mappings are merged
/// key-by-key, any other value present in `update` replaces the base value.
pub fn differential_deep_merge(base: &mut Value, update: Value) {
    match (base, update) {
        (Value::Mapping(base_map), Value::Mapping(update_map)) => {
            for (key, value) in update_map {
                match base_map.get_mut(&key) {
                    Some(existing) if existing.is_mapping() && value.is_mapping() => {
                        differential_deep_merge(existing, value);
                    }
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, update) => *base = update,
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    output_root: PathBuf,
    lock_timeout: Duration,
}

impl ConfigStore {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            lock_timeout: CONFIG_LOCK_TIMEOUT,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.output_root.clone())
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn experiment_dir(&self, workspace_id: &str, experiment_id: &str) -> PathBuf {
        experiment_dir(&self.output_root, workspace_id, experiment_id)
    }

    pub fn descriptor_path(&self, workspace_id: &str, experiment_id: &str) -> PathBuf {
        self.experiment_dir(workspace_id, experiment_id)
            .join(DESCRIPTOR_FILE)
    }

    pub fn exists(&self, workspace_id: &str, experiment_id: &str) -> bool {
        self.descriptor_path(workspace_id, experiment_id).is_file()
    }

    pub fn read(&self, workspace_id: &str, experiment_id: &str) -> Result<ExperimentDescriptor> {
        Self::read_from_path(&self.descriptor_path(workspace_id, experiment_id))
    }

    pub fn read_raw(&self, workspace_id: &str, experiment_id: &str) -> Result<Value> {
        read_raw_path(&self.descriptor_path(workspace_id, experiment_id))
    }

    pub fn read_from_path(path: &Path) -> Result<ExperimentDescriptor> {
        parse_descriptor(path, read_raw_path(path)?)
    }

    /// Replaces the whole document.
    pub fn write(&self, descriptor: &ExperimentDescriptor) -> Result<()> {
        let path = self.descriptor_path(&descriptor.workspace_id, &descriptor.experiment_id);
        let _lock = LockFile::acquire(&LockFile::path_for(&path), self.lock_timeout)?;
        write_descriptor(&path, descriptor)
    }

    /// Writes the descriptor for a new run. An existing descriptor keeps its
    /// identity, name and extra keys; its nodes are replaced and the run
    /// restarts.
    pub fn create(
        &self,
        workspace_id: &str,
        experiment_id: &str,
        name: &str,
        nodes: &[NodeSpec],
    ) -> Result<ExperimentDescriptor> {
        let path = self.descriptor_path(workspace_id, experiment_id);
        let _lock = LockFile::acquire(&LockFile::path_for(&path), self.lock_timeout)?;
        let now = now_timestamp();

        let mut descriptor = if path.is_file() {
            let mut existing = Self::read_from_path(&path)?;
            existing.finished_at = None;
            existing
        } else {
            ExperimentDescriptor {
                workspace_id: workspace_id.to_string(),
                experiment_id: experiment_id.to_string(),
                name: name.to_string(),
                started_at: now.clone(),
                finished_at: None,
                status: RunStatus::Running,
                has_combined_artifact: false,
                nodes: Default::default(),
                post_process_nodes: Default::default(),
                extra: Default::default(),
            }
        };
        descriptor.started_at = now.clone();
        descriptor.status = RunStatus::Running;

        descriptor.nodes = nodes
            .iter()
            .map(|spec| {
                let mut record = NodeRecord::running(&spec.node_id, &spec.label);
                if spec.is_input {
                    record.started_at = Some(now.clone());
                    record.finished_at = Some(now.clone());
                    record.status = RunStatus::Success;
                }
                (spec.node_id.clone(), record)
            })
            .collect();
        descriptor.post_process_nodes = [(
            POST_PROCESS_NODE_ID.to_string(),
            NodeRecord::running(POST_PROCESS_NODE_ID, POST_PROCESS_LABEL),
        )]
        .into_iter()
        .collect();

        write_descriptor(&path, &descriptor)?;
        Ok(descriptor)
    }

    pub fn overwrite(
        &self,
        workspace_id: &str,
        experiment_id: &str,
        patch: &DescriptorPatch,
    ) -> Result<ExperimentDescriptor> {
        let update = patch.to_value()?;
        self.merge_locked(workspace_id, experiment_id, |_| Ok(Some(update)))
    }

    /// Merges an untyped partial document.
    pub fn overwrite_value(
        &self,
        workspace_id: &str,
        experiment_id: &str,
        update: Value,
    ) -> Result<ExperimentDescriptor> {
        self.merge_locked(workspace_id, experiment_id, |_| Ok(Some(update)))
    }

    /// Computes a patch from the freshly read descriptor while holding the
    /// lock. Returning `None` leaves the document untouched.
    pub fn update<F>(
        &self,
        workspace_id: &str,
        experiment_id: &str,
        f: F,
    ) -> Result<ExperimentDescriptor>
    where
        F: FnOnce(&ExperimentDescriptor) -> Option<DescriptorPatch>,
    {
        self.merge_locked(workspace_id, experiment_id, |current| {
            f(current).map(|patch| patch.to_value()).transpose().map_err(Error::from)
        })
    }

    fn merge_locked<F>(
        &self,
        workspace_id: &str,
        experiment_id: &str,
        f: F,
    ) -> Result<ExperimentDescriptor>
    where
        F: FnOnce(&ExperimentDescriptor) -> Result<Option<Value>>,
    {
        let path = self.descriptor_path(workspace_id, experiment_id);
        if !path.is_file() {
            return Err(Error::NotFound(format!(
                "experiment config {}",
                path.display()
            )));
        }
        let _lock = LockFile::acquire(&LockFile::path_for(&path), self.lock_timeout)?;

        let mut raw = read_raw_path(&path)?;
        let current = parse_descriptor(&path, raw.clone())?;
        let update = match f(&current)? {
            Some(update) => update,
            None => return Ok(current),
        };
        differential_deep_merge(&mut raw, update);

        let mut merged = parse_descriptor(&path, raw)?;
        if merged.reconcile_status(&now_timestamp()) {
            debug!(
                workspace_id,
                experiment_id,
                status = merged.status.as_str(),
                "experiment status changed"
            );
        }
        write_descriptor(&path, &merged)?;
        Ok(merged)
    }

    /// Every readable descriptor in a workspace.
    pub fn list(&self, workspace_id: &str) -> Result<Vec<ExperimentDescriptor>> {
        let ws_dir = self.output_root.join(workspace_id);
        if !ws_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&ws_dir)? {
            let path = entry?.path().join(DESCRIPTOR_FILE);
            if !path.is_file() {
                continue;
            }
            match Self::read_from_path(&path) {
                Ok(descriptor) => out.push(descriptor),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable experiment config"),
            }
        }
        out.sort_by(|a, b| a.experiment_id.cmp(&b.experiment_id));
        Ok(out)
    }

    /// Most recently started experiment of a workspace.
    pub fn latest(&self, workspace_id: &str) -> Result<Option<ExperimentDescriptor>> {
        Ok(self
            .list(workspace_id)?
            .into_iter()
            .max_by_key(|d| parse_timestamp(&d.started_at)))
    }
}

fn read_raw_path(path: &Path) -> Result<Value> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(format!(
                "experiment config {}",
                path.display()
            )))
        }
        Err(e) => return Err(e.into()),
    };
    let value: Value = serde_yaml::from_str(&text).map_err(|e| Error::MalformedConfig {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !value.is_mapping() {
        return Err(Error::MalformedConfig {
            path: path.to_path_buf(),
            reason: "document is not a mapping".to_string(),
        });
    }
    Ok(value)
}

fn parse_descriptor(path: &Path, value: Value) -> Result<ExperimentDescriptor> {
    serde_yaml::from_value(value).map_err(|e| Error::MalformedConfig {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn write_descriptor(path: &Path, descriptor: &ExperimentDescriptor) -> Result<()> {
    let text = serde_yaml::to_string(descriptor)?;
    atomic_write_bytes(path, text.as_bytes())
}

/// Builds a one-key mapping, handy for ad-hoc raw updates.
pub fn single_key(key: &str, value: Value) -> Value {
    let mut map = Mapping::new();
    map.insert(Value::String(key.to_string()), value);
    Value::Mapping(map)
}
