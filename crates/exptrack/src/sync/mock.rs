//! Remote store emulated by a local directory tree, for development and tests.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::descriptor::DESCRIPTOR_FILE;
use crate::error::Result;
use crate::fsutil::ensure_dir;
use crate::settings::StorageKind;
use crate::sync::backend::{
    blocking, clear_local_experiment, collect_upload_files, write_local_file, StorageBackend,
    META_FILES, REMOTE_INPUT_DIR, REMOTE_OUTPUT_DIR,
};

#[derive(Debug, Clone)]
pub struct MockStorageBackend {
    output_root: PathBuf,
    mock_root: PathBuf,
}

impl MockStorageBackend {
    pub fn new(output_root: &Path, mock_root: &Path) -> Result<Self> {
        ensure_dir(&mock_root.join(REMOTE_INPUT_DIR))?;
        ensure_dir(&mock_root.join(REMOTE_OUTPUT_DIR))?;
        Ok(Self {
            output_root: output_root.to_path_buf(),
            mock_root: mock_root.to_path_buf(),
        })
    }

    pub fn remote_dir(&self, workspace_id: &str, experiment_id: &str) -> PathBuf {
        self.mock_root
            .join(REMOTE_OUTPUT_DIR)
            .join(workspace_id)
            .join(experiment_id)
    }
}

#[async_trait]
impl StorageBackend for MockStorageBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Mock
    }

    fn bucket_name(&self) -> String {
        self.mock_root.to_string_lossy().to_string()
    }

    fn output_root(&self) -> &Path {
        &self.output_root
    }

    async fn download_experiment(&self, workspace_id: &str, experiment_id: &str) -> Result<bool> {
        let remote = self.remote_dir(workspace_id, experiment_id);
        let local = self.local_path(workspace_id, experiment_id);
        debug!(remote = %remote.display(), local = %local.display(), "download from mock storage");
        blocking(move || {
            if !remote.is_dir() {
                return Ok(false);
            }
            let files = collect_upload_files(&remote, None)?;
            clear_local_experiment(&local, remote.join(DESCRIPTOR_FILE).is_file())?;
            let count = files.len();
            for (index, file) in files.iter().enumerate() {
                debug!(
                    index = index + 1,
                    count,
                    size = file.size,
                    path = %file.relative,
                    "download file from mock storage"
                );
                write_local_file(&local, &file.relative, &fs::read(&file.absolute)?)?;
            }
            Ok(true)
        })
        .await
    }

    async fn upload_experiment(
        &self,
        workspace_id: &str,
        experiment_id: &str,
        target_files: Option<&[String]>,
    ) -> Result<bool> {
        let local = self.local_path(workspace_id, experiment_id);
        let remote = self.remote_dir(workspace_id, experiment_id);
        let targets = target_files.map(|t| t.to_vec());
        debug!(local = %local.display(), remote = %remote.display(), "upload to mock storage");
        blocking(move || {
            let files = collect_upload_files(&local, targets.as_deref())?;
            if targets.is_none() && remote.is_dir() {
                fs::remove_dir_all(&remote)?;
            }
            let count = files.len();
            for (index, file) in files.iter().enumerate() {
                debug!(
                    index = index + 1,
                    count,
                    size = file.size,
                    path = %file.relative,
                    "upload file to mock storage"
                );
                let target = remote.join(&file.relative);
                if let Some(parent) = target.parent() {
                    ensure_dir(parent)?;
                }
                fs::copy(&file.absolute, &target)?;
            }
            Ok(true)
        })
        .await
    }

    async fn delete_experiment(&self, workspace_id: &str, experiment_id: &str) -> Result<bool> {
        let remote = self.remote_dir(workspace_id, experiment_id);
        debug!(remote = %remote.display(), "remove from mock storage");
        blocking(move || {
            if !remote.is_dir() {
                return Ok(false);
            }
            fs::remove_dir_all(&remote)?;
            Ok(true)
        })
        .await
    }

    async fn download_all_metas(&self, workspace_id: Option<&str>) -> Result<bool> {
        let remote_root = self.mock_root.join(REMOTE_OUTPUT_DIR);
        let output_root = self.output_root.clone();
        let filter = workspace_id.map(str::to_string);
        blocking(move || {
            let mut fetched = 0usize;
            for ws in fs::read_dir(&remote_root)? {
                let ws = ws?;
                let ws_name = ws.file_name().to_string_lossy().to_string();
                if !ws.path().is_dir() || filter.as_deref().map_or(false, |f| f != ws_name) {
                    continue;
                }
                for exp in fs::read_dir(ws.path())? {
                    let exp = exp?;
                    if !exp.path().is_dir() {
                        continue;
                    }
                    let local = output_root.join(&ws_name).join(exp.file_name());
                    for meta in META_FILES {
                        let source = exp.path().join(meta);
                        if source.is_file() {
                            write_local_file(&local, meta, &fs::read(&source)?)?;
                            fetched += 1;
                        }
                    }
                }
            }
            debug!(fetched, "downloaded experiment metas from mock storage");
            Ok(true)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(root: &Path) {
        let dir = root.join("ws").join("e1");
        fs::create_dir_all(dir.join("n1")).unwrap();
        fs::write(dir.join("experiment.yml"), "name: demo\n").unwrap();
        fs::write(dir.join("workflow.yml"), "nodes: {}\n").unwrap();
        fs::write(dir.join("n1/algo.result"), "{}").unwrap();
        fs::write(dir.join("remote_sync.json"), "{}").unwrap();
    }

    #[tokio::test]
    async fn upload_download_delete() {
        let out = tempfile::tempdir().expect("out");
        let mock = tempfile::tempdir().expect("mock");
        seed(out.path());
        let backend = MockStorageBackend::new(out.path(), mock.path()).unwrap();

        assert!(backend.upload_experiment("ws", "e1", None).await.unwrap());
        let remote = backend.remote_dir("ws", "e1");
        assert!(remote.join("n1/algo.result").is_file());
        assert!(!remote.join("remote_sync.json").exists());

        fs::write(out.path().join("ws/e1/experiment.yml"), "name: changed\n").unwrap();
        fs::write(out.path().join("ws/e1/stray.txt"), "x").unwrap();
        assert!(backend.download_experiment("ws", "e1").await.unwrap());
        let local = out.path().join("ws/e1");
        assert_eq!(fs::read_to_string(local.join("experiment.yml")).unwrap(), "name: demo\n");
        assert!(!local.join("stray.txt").exists());
        assert!(local.join("remote_sync.json").exists());

        assert!(backend.delete_experiment("ws", "e1").await.unwrap());
        assert!(!backend.delete_experiment("ws", "e1").await.unwrap());
        assert!(!backend.download_experiment("ws", "e1").await.unwrap());
    }

    #[tokio::test]
    async fn metas_are_fetched_per_workspace() {
        let out = tempfile::tempdir().expect("out");
        let mock = tempfile::tempdir().expect("mock");
        seed(out.path());
        let backend = MockStorageBackend::new(out.path(), mock.path()).unwrap();
        backend.upload_experiment("ws", "e1", None).await.unwrap();

        let fresh = tempfile::tempdir().expect("fresh");
        let reader = MockStorageBackend::new(fresh.path(), mock.path()).unwrap();
        reader.download_all_metas(Some("other")).await.unwrap();
        assert!(!fresh.path().join("ws").exists());

        reader.download_all_metas(None).await.unwrap();
        assert!(fresh.path().join("ws/e1/experiment.yml").is_file());
        assert!(fresh.path().join("ws/e1/workflow.yml").is_file());
        assert!(!fresh.path().join("ws/e1/n1").exists());
    }

    #[tokio::test]
    async fn download_replaces_files_without_leftovers() {
        let out = tempfile::tempdir().expect("out");
        let mock = tempfile::tempdir().expect("mock");
        seed(out.path());
        let backend = MockStorageBackend::new(out.path(), mock.path()).unwrap();
        backend.upload_experiment("ws", "e1", None).await.unwrap();

        assert!(backend.download_experiment("ws", "e1").await.unwrap());
        let local = out.path().join("ws/e1");
        let mut names: Vec<String> = fs::read_dir(&local)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["experiment.yml", "n1", "remote_sync.json", "workflow.yml"]);

        // a remote copy without a descriptor does not leave the local one behind
        fs::remove_file(backend.remote_dir("ws", "e1").join(DESCRIPTOR_FILE)).unwrap();
        assert!(backend.download_experiment("ws", "e1").await.unwrap());
        assert!(!local.join(DESCRIPTOR_FILE).exists());
        assert!(local.join("workflow.yml").is_file());
    }
}
