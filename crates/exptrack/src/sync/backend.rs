use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::config_store::CONFIG_LOCK_TIMEOUT;
use crate::descriptor::{DESCRIPTOR_FILE, WORKFLOW_FILE};
use crate::error::{Error, Result};
use crate::fsutil::{atomic_write_bytes, ensure_dir, is_atomic_temp_file, LockFile};
use crate::settings::{Settings, StorageKind};
use crate::sync::lease::SYNC_LOCK_FILE;
use crate::sync::mock::MockStorageBackend;
use crate::sync::object::ObjectStorageBackend;
use crate::sync::status::SYNC_STATUS_FILE;

pub const REMOTE_OUTPUT_DIR: &str = "output";
pub const REMOTE_INPUT_DIR: &str = "input";
pub const META_FILES: [&str; 2] = [DESCRIPTOR_FILE, WORKFLOW_FILE];

/// Transfers one experiment directory between the output root and a remote
/// store. Sync-control files never leave the local side.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> StorageKind;

    fn bucket_name(&self) -> String;

    fn output_root(&self) -> &Path;

    fn local_path(&self, workspace_id: &str, experiment_id: &str) -> PathBuf {
        self.output_root().join(workspace_id).join(experiment_id)
    }

    fn remote_path(&self, workspace_id: &str, experiment_id: &str) -> String {
        format!("{}/{}/{}", REMOTE_OUTPUT_DIR, workspace_id, experiment_id)
    }

    /// Replaces local data with the remote copy. Returns false when the
    /// remote side holds nothing for the experiment.
    async fn download_experiment(&self, workspace_id: &str, experiment_id: &str) -> Result<bool>;

    /// Uploads the whole directory, or only `target_files` (paths relative to
    /// the experiment directory) when given.
    async fn upload_experiment(
        &self,
        workspace_id: &str,
        experiment_id: &str,
        target_files: Option<&[String]>,
    ) -> Result<bool>;

    async fn delete_experiment(&self, workspace_id: &str, experiment_id: &str) -> Result<bool>;

    /// Fetches `experiment.yml`/`workflow.yml` of every remote experiment,
    /// optionally limited to one workspace.
    async fn download_all_metas(&self, workspace_id: Option<&str>) -> Result<bool>;
}

pub fn build_backend(settings: &Settings) -> Result<Option<Arc<dyn StorageBackend>>> {
    let backend: Arc<dyn StorageBackend> = match settings.storage {
        StorageKind::Unused => return Ok(None),
        StorageKind::Mock => Arc::new(MockStorageBackend::new(
            &settings.output_root,
            &settings.mock_storage_dir,
        )?),
        StorageKind::ObjectStore => {
            let config = settings.object_store.as_ref().ok_or_else(|| {
                Error::Settings("object store backend selected without a bucket".to_string())
            })?;
            Arc::new(ObjectStorageBackend::from_settings(&settings.output_root, config)?)
        }
    };
    Ok(Some(backend))
}

pub fn is_sync_control_file(rel: &Path) -> bool {
    let name = match rel.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return false,
    };
    let descriptor_lock = descriptor_lock_path(Path::new(""));
    name == SYNC_STATUS_FILE
        || name == SYNC_LOCK_FILE
        || name == file_name(&descriptor_lock)
        || name == file_name(&LockFile::breaker_path_for(&descriptor_lock))
        || is_atomic_temp_file(name)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn descriptor_lock_path(experiment_dir: &Path) -> PathBuf {
    LockFile::path_for(&experiment_dir.join(DESCRIPTOR_FILE))
}

/// Resolves a `/`-separated path below `experiment_dir`. Absolute paths and
/// `..` segments are rejected.
pub fn resolve_relative(experiment_dir: &Path, relative: &str) -> Result<PathBuf> {
    if relative.starts_with(['/', '\\']) || Path::new(relative).is_absolute() {
        return Err(Error::RemoteOperation(format!(
            "path escapes the experiment directory: {}",
            relative
        )));
    }
    let mut resolved = experiment_dir.to_path_buf();
    let mut depth = 0usize;
    for part in relative.split(['/', '\\']) {
        for component in Path::new(part).components() {
            match component {
                Component::Normal(name) => {
                    resolved.push(name);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(Error::RemoteOperation(format!(
                        "path escapes the experiment directory: {}",
                        relative
                    )));
                }
            }
        }
    }
    if depth == 0 {
        return Err(Error::RemoteOperation(format!("empty relative path: {:?}", relative)));
    }
    Ok(resolved)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    /// Relative to the experiment directory, `/`-separated.
    pub relative: String,
    pub absolute: PathBuf,
    pub size: u64,
}

/// Files to upload from `experiment_dir`, control files excluded.
pub fn collect_upload_files(
    experiment_dir: &Path,
    target_files: Option<&[String]>,
) -> Result<Vec<UploadFile>> {
    if !experiment_dir.is_dir() {
        return Err(Error::NotFound(format!(
            "experiment directory {}",
            experiment_dir.display()
        )));
    }
    let mut files = Vec::new();
    match target_files {
        Some(targets) => {
            for relative in targets {
                let absolute = resolve_relative(experiment_dir, relative)?;
                if is_sync_control_file(&absolute) {
                    continue;
                }
                let meta = fs::metadata(&absolute)
                    .map_err(|_| Error::NotFound(format!("upload target {}", absolute.display())))?;
                files.push(UploadFile {
                    relative: relative.replace('\\', "/"),
                    absolute,
                    size: meta.len(),
                });
            }
        }
        None => {
            for entry in walkdir::WalkDir::new(experiment_dir).sort_by_file_name() {
                let entry = entry.map_err(|e| Error::Io(e.into()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = match entry.path().strip_prefix(experiment_dir) {
                    Ok(rel) => rel,
                    Err(_) => continue,
                };
                if is_sync_control_file(rel) {
                    continue;
                }
                files.push(UploadFile {
                    relative: rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/"),
                    absolute: entry.path().to_path_buf(),
                    size: entry.metadata().map(|m| m.len()).unwrap_or(0),
                });
            }
        }
    }
    Ok(files)
}

/// Empties `experiment_dir` ahead of a download, keeping sync-control files.
/// Contents are first moved into a hidden sibling directory and only then
/// deleted, so an interruption leaves the old data recoverable there.
///
/// With `keep_descriptor` the descriptor stays in place until the download
/// replaces it, so readers never find it missing.
pub fn clear_local_experiment(experiment_dir: &Path, keep_descriptor: bool) -> Result<()> {
    if !experiment_dir.is_dir() {
        return Ok(());
    }
    let name = experiment_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("experiment");
    let trash = experiment_dir.with_file_name(format!(
        ".{}.clearing.{}",
        name,
        Utc::now().timestamp_micros()
    ));
    ensure_dir(&trash)?;
    for entry in fs::read_dir(experiment_dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = Path::new(&entry.file_name()).to_path_buf();
        if is_sync_control_file(&name) || (keep_descriptor && name == Path::new(DESCRIPTOR_FILE)) {
            continue;
        }
        fs::rename(&path, trash.join(entry.file_name()))?;
    }
    fs::remove_dir_all(&trash)?;
    debug!(dir = %experiment_dir.display(), "cleared local experiment data");
    Ok(())
}

/// Writes downloaded bytes under the experiment directory through a temp
/// file and rename. The descriptor is replaced while holding its lock.
pub fn write_local_file(experiment_dir: &Path, relative: &str, bytes: &[u8]) -> Result<PathBuf> {
    let target = resolve_relative(experiment_dir, relative)?;
    if target == experiment_dir.join(DESCRIPTOR_FILE) {
        let _lock = LockFile::acquire(&descriptor_lock_path(experiment_dir), CONFIG_LOCK_TIMEOUT)?;
        atomic_write_bytes(&target, bytes)?;
    } else {
        atomic_write_bytes(&target, bytes)?;
    }
    Ok(target)
}

/// Runs blocking filesystem work off the async executor.
pub(crate) async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::RemoteOperation(format!("storage task failed: {}", e)))?
}
