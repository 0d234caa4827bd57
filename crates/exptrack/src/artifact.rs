//! Per-node result artifacts written by the external worker.
//!
//! A node's outcome is signalled only by the presence of
//! `<node_dir>/<algo>.result`. The worker writes it through a `tmp_`-prefixed
//! file first, so anything carrying that prefix is still in progress.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{error, warn};

use crate::descriptor::{OutputRef, OutputRefs};
use crate::error::Result;
use crate::fsutil::{atomic_write_bytes, ensure_dir, is_atomic_temp_file};

pub const ARTIFACT_EXTENSION: &str = "result";
pub const TEMP_PREFIX: &str = "tmp_";
pub const COMBINED_ARTIFACT_EXTENSION: &str = "nwb";
pub const ERROR_LOG_FILE: &str = "error.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeArtifact {
    pub path: PathBuf,
    pub algo_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    Success {
        algo_name: String,
        outputs: OutputRefs,
    },
    Failure {
        message: String,
    },
}

impl NodeOutcome {
    fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.trim().is_empty() {
            NodeOutcome::Failure {
                message: "Invalid node result: empty error payload".to_string(),
            }
        } else {
            NodeOutcome::Failure { message }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, NodeOutcome::Success { .. })
    }

    pub fn message(&self) -> String {
        match self {
            NodeOutcome::Success { algo_name, .. } => format!("{} success", algo_name),
            NodeOutcome::Failure { message } => message.clone(),
        }
    }
}

/// Workflow-wide failure reported by the engine's error log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowError {
    pub message: String,
}

impl WorkflowError {
    pub fn no_process() -> Self {
        Self {
            message: "No workflow process found.".to_string(),
        }
    }
}

/// Present and non-blank `error.log` means the whole workflow failed.
pub fn read_workflow_error(experiment_dir: &Path) -> Option<WorkflowError> {
    let content = fs::read_to_string(experiment_dir.join(ERROR_LOG_FILE)).ok()?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(WorkflowError {
            message: trimmed.to_string(),
        })
    }
}

pub fn find_node_artifact(node_dir: &Path) -> Option<NodeArtifact> {
    let entries = fs::read_dir(node_dir).ok()?;
    let mut found: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(ARTIFACT_EXTENSION))
        .filter(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            !name.starts_with(TEMP_PREFIX) && !is_atomic_temp_file(name)
        })
        .collect();
    found.sort();
    if found.len() > 1 {
        warn!(node_dir = %node_dir.display(), count = found.len(), "multiple node results found, using the first");
    }
    let path = found.into_iter().next()?;
    let algo_name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    Some(NodeArtifact { path, algo_name })
}

/// Deserializes and classifies an artifact. Unreadable or corrupt files are
/// reported as failures, never as errors.
pub fn read_artifact(artifact: &NodeArtifact) -> NodeOutcome {
    let value = fs::read(&artifact.path)
        .map_err(|e| e.to_string())
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).map_err(|e| e.to_string()));
    match value {
        Ok(value) => classify(&artifact.algo_name, value),
        Err(detail) => {
            error!(path = %artifact.path.display(), error = %detail, "failed to read node result");
            NodeOutcome::failure(format!("Invalid node result: {}", detail))
        }
    }
}

/// A string or list payload is a failure; a map is a success whose entries
/// that parse as output references become the node outputs.
pub fn classify(algo_name: &str, value: Value) -> NodeOutcome {
    match value {
        Value::String(message) => NodeOutcome::failure(message),
        Value::Array(items) => NodeOutcome::failure(
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        Value::Null => NodeOutcome::failure("Invalid node result: null payload"),
        Value::Object(map) => NodeOutcome::Success {
            algo_name: algo_name.to_string(),
            outputs: map
                .into_iter()
                .filter_map(|(name, v)| {
                    serde_json::from_value::<OutputRef>(v)
                        .ok()
                        .map(|output| (name, output))
                })
                .collect(),
        },
        _ => NodeOutcome::Success {
            algo_name: algo_name.to_string(),
            outputs: OutputRefs::new(),
        },
    }
}

/// Writes an artifact the way the worker does: `tmp_` file, then rename.
pub fn write_artifact(node_dir: &Path, algo_name: &str, value: &Value) -> Result<PathBuf> {
    ensure_dir(node_dir)?;
    let file_name = format!("{}.{}", algo_name, ARTIFACT_EXTENSION);
    let tmp = node_dir.join(format!("{}{}", TEMP_PREFIX, file_name));
    let target = node_dir.join(file_name);
    atomic_write_bytes(&tmp, &serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, &target)?;
    Ok(target)
}

/// Rewrites the `path` of every output reference stored in a success
/// artifact. Returns whether the file changed.
pub fn rewrite_output_paths<F>(artifact_path: &Path, rewrite: F) -> Result<bool>
where
    F: Fn(&str) -> String,
{
    let mut value: Value = serde_json::from_slice(&fs::read(artifact_path)?)?;
    let mut changed = false;
    if let Value::Object(map) = &mut value {
        for entry in map.values_mut() {
            if serde_json::from_value::<OutputRef>(entry.clone()).is_err() {
                continue;
            }
            if let Some(Value::String(path)) = entry.get_mut("path") {
                let new_path = rewrite(path);
                if new_path != *path {
                    *path = new_path;
                    changed = true;
                }
            }
        }
    }
    if changed {
        atomic_write_bytes(artifact_path, &serde_json::to_vec_pretty(&value)?)?;
    }
    Ok(changed)
}

/// True when `dir` directly holds a combined (`*.nwb`) artifact.
pub fn has_combined_artifact(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|entries| {
            entries.filter_map(|e| e.ok()).any(|e| {
                let path = e.path();
                path.is_file()
                    && path.extension().and_then(|x| x.to_str())
                        == Some(COMBINED_ARTIFACT_EXTENSION)
            })
        })
        .unwrap_or(false)
}

/// One node's evidence for the current observation cycle.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub node_dir: PathBuf,
    pub artifact: Option<NodeArtifact>,
    outcome: Option<NodeOutcome>,
}

impl NodeResult {
    /// A workflow-wide error short-circuits artifact inspection.
    pub fn load(node_dir: &Path, workflow_error: Option<&WorkflowError>) -> Self {
        if let Some(err) = workflow_error {
            return Self {
                node_dir: node_dir.to_path_buf(),
                artifact: None,
                outcome: Some(NodeOutcome::failure(err.message.clone())),
            };
        }
        let artifact = find_node_artifact(node_dir);
        let outcome = artifact.as_ref().map(read_artifact);
        Self {
            node_dir: node_dir.to_path_buf(),
            artifact,
            outcome,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<&NodeOutcome> {
        self.outcome.as_ref()
    }

    pub fn has_artifact(&self) -> bool {
        has_combined_artifact(&self.node_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn find_ignores_in_progress_and_foreign_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("tmp_suite2p.result"), "{}").unwrap();
        fs::write(dir.path().join("fluorescence.json"), "{}").unwrap();
        assert!(find_node_artifact(dir.path()).is_none());

        fs::write(dir.path().join("suite2p.result"), "{}").unwrap();
        let found = find_node_artifact(dir.path()).expect("artifact");
        assert_eq!(found.algo_name, "suite2p");
        assert!(find_node_artifact(&dir.path().join("missing")).is_none());
    }

    #[test]
    fn classify_distinguishes_failure_payloads() {
        assert_eq!(
            classify("a", json!("Traceback: boom")),
            NodeOutcome::Failure {
                message: "Traceback: boom".to_string()
            }
        );
        assert_eq!(
            classify("a", json!(["line 1", "line 2"])).message(),
            "line 1\nline 2"
        );
        assert!(!classify("a", Value::Null).message().is_empty());
        assert!(!classify("a", json!("")).message().is_empty());
        assert!(classify("a", json!(42)).is_success());
    }

    #[test]
    fn classify_collects_output_references() {
        let outcome = classify(
            "suite2p",
            json!({
                "roi": {"path": "ws/e1/n1/roi.json", "type": "roi", "max_index": 10},
                "iscell": [1, 0, 1],
                "note": "not an output",
            }),
        );
        match outcome {
            NodeOutcome::Success { algo_name, outputs } => {
                assert_eq!(algo_name, "suite2p");
                assert_eq!(outputs.len(), 1);
                assert_eq!(outputs["roi"].kind, "roi");
                assert_eq!(outputs["roi"].max_index, Some(10));
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn corrupt_artifact_becomes_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("algo.result"), "{not json").unwrap();
        let artifact = find_node_artifact(dir.path()).expect("artifact");
        match read_artifact(&artifact) {
            NodeOutcome::Failure { message } => {
                assert!(message.starts_with("Invalid node result: "), "{}", message)
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn workflow_error_makes_node_ready_without_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pending = NodeResult::load(dir.path(), None);
        assert!(!pending.is_ready());

        let err = WorkflowError {
            message: "rule failed".to_string(),
        };
        let forced = NodeResult::load(dir.path(), Some(&err));
        assert!(forced.is_ready());
        assert_eq!(forced.outcome().unwrap().message(), "rule failed");
    }

    #[test]
    fn error_log_must_be_non_blank() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(read_workflow_error(dir.path()).is_none());
        fs::write(dir.path().join(ERROR_LOG_FILE), "  \n").unwrap();
        assert!(read_workflow_error(dir.path()).is_none());
        fs::write(dir.path().join(ERROR_LOG_FILE), "MissingOutputException\n").unwrap();
        assert_eq!(
            read_workflow_error(dir.path()).unwrap().message,
            "MissingOutputException"
        );
    }

    #[test]
    fn write_then_rewrite_output_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_artifact(
            dir.path(),
            "eta",
            &json!({"mean": {"path": "ws/old/n1/mean.json", "type": "timeseries"}}),
        )
        .expect("write");
        assert!(!dir.path().join("tmp_eta.result").exists());

        let changed = rewrite_output_paths(&path, |p| p.replace("/old/", "/new/")).unwrap();
        assert!(changed);
        let artifact = find_node_artifact(dir.path()).unwrap();
        match read_artifact(&artifact) {
            NodeOutcome::Success { outputs, .. } => {
                assert_eq!(outputs["mean"].path, "ws/new/n1/mean.json")
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn combined_artifact_detection() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(!has_combined_artifact(dir.path()));
        fs::write(dir.path().join("whole.nwb"), b"\x89HDF").unwrap();
        assert!(has_combined_artifact(dir.path()));
    }
}
