//! Process-level configuration.
//!
//! `Settings` is read once (usually from the environment at startup) and then
//! passed by reference into every component constructor. Nothing below this
//! module looks at environment variables.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_OUTPUT_DIR: &str = "./data/output";
pub const DEFAULT_MOCK_STORAGE_DIR: &str = "/tmp/studio/mock-storage";

/// Which remote storage backend, if any, mirrors experiment data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Unused,
    Mock,
    ObjectStore,
}

impl StorageKind {
    /// Parses the `REMOTE_STORAGE_TYPE` activation flag (`0`, `1`, `2`).
    pub fn from_flag(flag: &str) -> Result<Self> {
        match flag.trim() {
            "" | "0" => Ok(StorageKind::Unused),
            "1" => Ok(StorageKind::Mock),
            "2" => Ok(StorageKind::ObjectStore),
            other => Err(Error::Settings(format!(
                "unknown REMOTE_STORAGE_TYPE value: {}",
                other
            ))),
        }
    }

    pub fn as_flag(&self) -> &'static str {
        match self {
            StorageKind::Unused => "0",
            StorageKind::Mock => "1",
            StorageKind::ObjectStore => "2",
        }
    }

    pub fn is_used(&self) -> bool {
        !matches!(self, StorageKind::Unused)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreSettings {
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub output_root: PathBuf,
    pub storage: StorageKind,
    pub mock_storage_dir: PathBuf,
    pub object_store: Option<ObjectStoreSettings>,
}

impl Settings {
    /// Local-only settings rooted at `output_root`.
    pub fn local(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            storage: StorageKind::Unused,
            mock_storage_dir: PathBuf::from(DEFAULT_MOCK_STORAGE_DIR),
            object_store: None,
        }
    }

    pub fn with_mock_storage(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage = StorageKind::Mock;
        self.mock_storage_dir = dir.into();
        self
    }

    pub fn from_env() -> Result<Self> {
        let output_root = env::var("EXPTRACK_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_OUTPUT_DIR));
        let storage = StorageKind::from_flag(&env::var("REMOTE_STORAGE_TYPE").unwrap_or_default())?;
        let mock_storage_dir = env::var("MOCK_STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_MOCK_STORAGE_DIR));

        let object_store = match env::var("S3_STORAGE_URL") {
            Ok(url) => Some(ObjectStoreSettings {
                bucket: bucket_from_url(&url)?,
                endpoint: env::var("S3_ENDPOINT").ok(),
                region: env::var("S3_REGION").ok(),
            }),
            Err(_) => None,
        };
        if storage == StorageKind::ObjectStore && object_store.is_none() {
            return Err(Error::Settings(
                "S3_STORAGE_URL is required when REMOTE_STORAGE_TYPE=2".to_string(),
            ));
        }

        Ok(Self {
            output_root,
            storage,
            mock_storage_dir,
            object_store,
        })
    }

    /// Bucket name recorded in sync status files.
    pub fn remote_bucket_name(&self) -> String {
        match self.storage {
            StorageKind::ObjectStore => self
                .object_store
                .as_ref()
                .map(|s| s.bucket.clone())
                .unwrap_or_default(),
            StorageKind::Mock => self.mock_storage_dir.to_string_lossy().to_string(),
            StorageKind::Unused => String::new(),
        }
    }

    pub fn experiment_dir(&self, workspace_id: &str, experiment_id: &str) -> PathBuf {
        experiment_dir(&self.output_root, workspace_id, experiment_id)
    }
}

pub fn experiment_dir(output_root: &Path, workspace_id: &str, experiment_id: &str) -> PathBuf {
    output_root.join(workspace_id).join(experiment_id)
}

fn bucket_from_url(url: &str) -> Result<String> {
    let bucket = url
        .rsplit("//")
        .next()
        .unwrap_or_default()
        .trim_end_matches('/');
    if bucket.is_empty() {
        return Err(Error::Settings(format!("invalid S3_STORAGE_URL: {}", url)));
    }
    Ok(bucket.to_string())
}
