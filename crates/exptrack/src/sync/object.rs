//! S3-compatible object store backend.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore};
use tracing::debug;

use crate::descriptor::DESCRIPTOR_FILE;
use crate::error::{Error, Result};
use crate::settings::{ObjectStoreSettings, StorageKind};
use crate::sync::backend::{
    blocking, clear_local_experiment, collect_upload_files, write_local_file, StorageBackend,
    META_FILES, REMOTE_OUTPUT_DIR,
};

pub struct ObjectStorageBackend {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    output_root: PathBuf,
}

impl ObjectStorageBackend {
    /// Credentials come from the standard AWS environment variables.
    pub fn from_settings(output_root: &Path, settings: &ObjectStoreSettings) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&settings.bucket);
        if let Some(ref region) = settings.region {
            builder = builder.with_region(region);
        }
        if let Some(ref endpoint) = settings.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        let store = builder
            .build()
            .map_err(|e| Error::Settings(format!("failed to build S3 store: {}", e)))?;
        Ok(Self::with_store(Arc::new(store), &settings.bucket, output_root))
    }

    pub fn with_store(store: Arc<dyn ObjectStore>, bucket: &str, output_root: &Path) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
            output_root: output_root.to_path_buf(),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let prefix = ObjectPath::from(prefix);
        let mut objects: Vec<ObjectMeta> = self.store.list(Some(&prefix)).try_collect().await?;
        objects.sort_by(|a, b| a.location.as_ref().cmp(b.location.as_ref()));
        Ok(objects)
    }

    async fn fetch(&self, location: &ObjectPath) -> Result<Vec<u8>> {
        let bytes = self.store.get(location).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

fn relative_to<'a>(location: &'a ObjectPath, prefix: &str) -> Option<&'a str> {
    location
        .as_ref()
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|rest| !rest.is_empty())
}

#[async_trait]
impl StorageBackend for ObjectStorageBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::ObjectStore
    }

    fn bucket_name(&self) -> String {
        self.bucket.clone()
    }

    fn output_root(&self) -> &Path {
        &self.output_root
    }

    async fn download_experiment(&self, workspace_id: &str, experiment_id: &str) -> Result<bool> {
        let prefix = self.remote_path(workspace_id, experiment_id);
        let objects = self.list(&prefix).await?;
        if objects.is_empty() {
            debug!(prefix = %prefix, "nothing to download");
            return Ok(false);
        }

        let has_descriptor = objects
            .iter()
            .any(|meta| relative_to(&meta.location, &prefix) == Some(DESCRIPTOR_FILE));
        let local = self.local_path(workspace_id, experiment_id);
        let dir = local.clone();
        blocking(move || clear_local_experiment(&dir, has_descriptor)).await?;

        let count = objects.len();
        for (index, meta) in objects.iter().enumerate() {
            let relative = match relative_to(&meta.location, &prefix) {
                Some(relative) => relative,
                None => continue,
            };
            debug!(
                index = index + 1,
                count,
                size = meta.size,
                path = %meta.location,
                "download file from object store"
            );
            let bytes = self.fetch(&meta.location).await?;
            let (dir, relative) = (local.clone(), relative.to_string());
            blocking(move || write_local_file(&dir, &relative, &bytes)).await?;
        }
        Ok(true)
    }

    async fn upload_experiment(
        &self,
        workspace_id: &str,
        experiment_id: &str,
        target_files: Option<&[String]>,
    ) -> Result<bool> {
        let local = self.local_path(workspace_id, experiment_id);
        let prefix = self.remote_path(workspace_id, experiment_id);
        let files = collect_upload_files(&local, target_files)?;
        // A full upload leaves the remote side mirroring the local tree.
        let stale: Vec<ObjectMeta> = match target_files {
            Some(_) => Vec::new(),
            None => {
                let uploaded: BTreeSet<&str> = files.iter().map(|f| f.relative.as_str()).collect();
                self.list(&prefix)
                    .await?
                    .into_iter()
                    .filter(|meta| {
                        relative_to(&meta.location, &prefix).map_or(false, |rel| !uploaded.contains(rel))
                    })
                    .collect()
            }
        };

        let count = files.len();
        for (index, file) in files.iter().enumerate() {
            let location = ObjectPath::from(format!("{}/{}", prefix, file.relative));
            debug!(
                index = index + 1,
                count,
                size = file.size,
                path = %location,
                "upload file to object store"
            );
            let bytes = Bytes::from(tokio::fs::read(&file.absolute).await?);
            self.store.put(&location, bytes.into()).await?;
        }
        for meta in &stale {
            debug!(path = %meta.location, "delete stale file from object store");
            self.store.delete(&meta.location).await?;
        }
        Ok(true)
    }

    async fn delete_experiment(&self, workspace_id: &str, experiment_id: &str) -> Result<bool> {
        let prefix = self.remote_path(workspace_id, experiment_id);
        let objects = self.list(&prefix).await?;
        for meta in &objects {
            debug!(path = %meta.location, "delete file from object store");
            self.store.delete(&meta.location).await?;
        }
        Ok(!objects.is_empty())
    }

    async fn download_all_metas(&self, workspace_id: Option<&str>) -> Result<bool> {
        let prefix = match workspace_id {
            Some(ws) => format!("{}/{}", REMOTE_OUTPUT_DIR, ws),
            None => REMOTE_OUTPUT_DIR.to_string(),
        };
        let objects = self.list(&prefix).await?;
        let mut fetched = 0usize;
        for meta in &objects {
            // output/<ws>/<id>/<file>
            let parts: Vec<&str> = meta.location.as_ref().split('/').collect();
            if parts.len() != 4 || !META_FILES.contains(&parts[3]) {
                continue;
            }
            let bytes = self.fetch(&meta.location).await?;
            let dir = self.output_root.join(parts[1]).join(parts[2]);
            let name = parts[3].to_string();
            blocking(move || write_local_file(&dir, &name, &bytes)).await?;
            fetched += 1;
        }
        debug!(fetched, "downloaded experiment metas from object store");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use std::fs;

    fn seed(root: &Path) {
        let dir = root.join("ws").join("e1");
        fs::create_dir_all(dir.join("n1")).unwrap();
        fs::write(dir.join("experiment.yml"), "name: demo\n").unwrap();
        fs::write(dir.join("n1/algo.result"), "{\"x\": 1}").unwrap();
        fs::write(dir.join("remote_sync_stat.json"), "{}").unwrap();
    }

    #[tokio::test]
    async fn round_trip_through_memory_store() {
        let out = tempfile::tempdir().expect("out");
        seed(out.path());
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let backend = ObjectStorageBackend::with_store(store.clone(), "bucket", out.path());

        assert!(backend.upload_experiment("ws", "e1", None).await.unwrap());
        let keys: Vec<String> = backend
            .list("output")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.location.to_string())
            .collect();
        assert_eq!(
            keys,
            vec!["output/ws/e1/experiment.yml", "output/ws/e1/n1/algo.result"]
        );

        fs::remove_dir_all(out.path().join("ws/e1/n1")).unwrap();
        assert!(backend.download_experiment("ws", "e1").await.unwrap());
        assert_eq!(
            fs::read_to_string(out.path().join("ws/e1/n1/algo.result")).unwrap(),
            "{\"x\": 1}"
        );
        assert!(out.path().join("ws/e1/remote_sync_stat.json").exists());

        let fresh = tempfile::tempdir().expect("fresh");
        let reader = ObjectStorageBackend::with_store(store, "bucket", fresh.path());
        reader.download_all_metas(None).await.unwrap();
        assert!(fresh.path().join("ws/e1/experiment.yml").is_file());
        assert!(!fresh.path().join("ws/e1/n1").exists());

        assert!(backend.delete_experiment("ws", "e1").await.unwrap());
        assert!(!backend.download_experiment("ws", "e1").await.unwrap());
    }

    #[tokio::test]
    async fn full_upload_prunes_remote_files_gone_locally() {
        let out = tempfile::tempdir().expect("out");
        seed(out.path());
        let backend = ObjectStorageBackend::with_store(Arc::new(InMemory::new()), "bucket", out.path());
        backend.upload_experiment("ws", "e1", None).await.unwrap();

        fs::remove_dir_all(out.path().join("ws/e1/n1")).unwrap();
        backend
            .upload_experiment("ws", "e1", Some(&["experiment.yml".to_string()]))
            .await
            .unwrap();
        assert_eq!(backend.list("output/ws/e1").await.unwrap().len(), 2);

        backend.upload_experiment("ws", "e1", None).await.unwrap();
        let keys: Vec<String> = backend
            .list("output/ws/e1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.location.to_string())
            .collect();
        assert_eq!(keys, vec!["output/ws/e1/experiment.yml"]);
    }
}
