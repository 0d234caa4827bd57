//! Reconciles on-disk evidence with the experiment descriptor.
//!
//! One `observe` call is a short, self-contained unit of work; callers poll.
//! Concurrent observers of the same experiment are safe because each node
//! transition is committed through [`ConfigStore::update`], which re-checks
//! the node under the descriptor lock.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::artifact::{has_combined_artifact, read_workflow_error, NodeOutcome, NodeResult, WorkflowError};
use crate::config_store::ConfigStore;
use crate::descriptor::{
    now_timestamp, parse_timestamp, DescriptorPatch, ExperimentDescriptor, NodePatch, NodeRecord,
    OutputRefs, RunStatus, DESCRIPTOR_FILE,
};
use crate::error::Result;
use crate::process::{ProcessLookup, ProcessMonitor, ProcessTable, SystemProcessTable};
use crate::settings::Settings;
use crate::sync::{RemoteSyncController, SyncAction, SyncState, SyncStatusRecord};

/// What the caller learns about one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeMessage {
    pub status: RunStatus,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_refs: Option<OutputRefs>,
}

impl NodeMessage {
    fn from_outcome(outcome: &NodeOutcome) -> Self {
        match outcome {
            NodeOutcome::Success { outputs, .. } => Self {
                status: RunStatus::Success,
                message: Some(outcome.message()),
                output_refs: Some(outputs.clone()),
            },
            NodeOutcome::Failure { message } => Self {
                status: RunStatus::Error,
                message: Some(message.clone()),
                output_refs: None,
            },
        }
    }

    fn from_record(record: &NodeRecord) -> Self {
        Self {
            status: record.status,
            message: record.message.clone(),
            output_refs: record.output_refs.clone(),
        }
    }
}

pub type ObservedNodes = BTreeMap<String, NodeMessage>;

pub struct WorkflowObserver<T: ProcessTable = SystemProcessTable> {
    store: ConfigStore,
    monitor: ProcessMonitor<T>,
    sync: Option<RemoteSyncController>,
    workspace_id: String,
    experiment_id: String,
}

impl WorkflowObserver<SystemProcessTable> {
    pub fn from_settings(settings: &Settings, workspace_id: &str, experiment_id: &str) -> Result<Self> {
        let store = ConfigStore::from_settings(settings);
        let monitor = ProcessMonitor::new(store.clone())?;
        let sync = RemoteSyncController::from_settings(settings)?;
        Ok(Self::new(store, monitor, sync, workspace_id, experiment_id))
    }
}

impl<T: ProcessTable> WorkflowObserver<T> {
    pub fn new(
        store: ConfigStore,
        monitor: ProcessMonitor<T>,
        sync: Option<RemoteSyncController>,
        workspace_id: &str,
        experiment_id: &str,
    ) -> Self {
        Self {
            store,
            monitor,
            sync,
            workspace_id: workspace_id.to_string(),
            experiment_id: experiment_id.to_string(),
        }
    }

    /// Advances the requested nodes and reports the ones whose outcome is
    /// known. Nodes still running are absent from the result.
    pub async fn observe(&self, node_ids: &[String]) -> Result<ObservedNodes> {
        if node_ids.is_empty() {
            return Ok(ObservedNodes::new());
        }
        let requested: BTreeSet<&String> = node_ids.iter().collect();
        let dir = self
            .store
            .experiment_dir(&self.workspace_id, &self.experiment_id);
        let workflow_error = read_workflow_error(&dir);

        let results = self.observe_nodes(node_ids, workflow_error.as_ref()).await?;
        if results.len() >= requested.len() || workflow_error.is_some() {
            return Ok(results);
        }

        // Some nodes are undetermined: only a vanished worker turns that into an error.
        match self.monitor.search(&self.workspace_id, &self.experiment_id)? {
            ProcessLookup::Gone { .. } => {
                let no_process = WorkflowError::no_process();
                self.observe_nodes(node_ids, Some(&no_process)).await
            }
            ProcessLookup::Found { .. } | ProcessLookup::NotFoundYet { .. } => Ok(results),
        }
    }

    /// Observes every primary and post-process node.
    pub async fn observe_overall(&self) -> Result<ObservedNodes> {
        let descriptor = self.store.read(&self.workspace_id, &self.experiment_id)?;
        self.observe(&descriptor.node_ids()).await
    }

    async fn observe_nodes(
        &self,
        node_ids: &[String],
        workflow_error: Option<&WorkflowError>,
    ) -> Result<ObservedNodes> {
        let (ws, id) = (self.workspace_id.as_str(), self.experiment_id.as_str());
        let descriptor = self.store.read(ws, id)?;
        let dir = self.store.experiment_dir(ws, id);

        let mut results = ObservedNodes::new();
        for node_id in node_ids {
            let record = match descriptor.node(node_id) {
                Some(record) => record,
                None => {
                    warn!(workspace_id = ws, experiment_id = id, node_id = %node_id, "invalid node id");
                    continue;
                }
            };
            if record.status.is_terminal() {
                results.insert(node_id.clone(), NodeMessage::from_record(record));
                continue;
            }
            let node = NodeResult::load(&dir.join(node_id), workflow_error);
            if let Some(outcome) = node.outcome() {
                let message = self.commit_node(node_id, outcome, node.has_artifact())?;
                results.insert(node_id.clone(), message);
            }
        }

        let latest = if descriptor.is_all_finished() {
            descriptor
        } else {
            self.refresh_combined_artifact()?;
            self.store.read(ws, id)?
        };
        if latest.is_all_finished() {
            self.upload_descriptor(&latest).await;
        }
        Ok(results)
    }

    /// Commits a node's terminal state unless another observer already did,
    /// and reports the state as stored.
    fn commit_node(&self, node_id: &str, outcome: &NodeOutcome, has_artifact: bool) -> Result<NodeMessage> {
        let message = NodeMessage::from_outcome(outcome);
        let now = now_timestamp();
        let patch = NodePatch {
            status: Some(message.status),
            finished_at: Some(now),
            has_artifact: Some(has_artifact),
            message: message.message.clone(),
            output_refs: message.output_refs.clone(),
            ..Default::default()
        };

        let descriptor = self.store.update(&self.workspace_id, &self.experiment_id, |current| {
            let record = current.node(node_id)?;
            if record.status.is_terminal() {
                return None;
            }
            Some(DescriptorPatch::node(node_id, patch))
        })?;

        debug!(
            workspace_id = %self.workspace_id,
            experiment_id = %self.experiment_id,
            node_id,
            status = message.status.as_str(),
            "node observation completed"
        );
        Ok(descriptor
            .node(node_id)
            .map(NodeMessage::from_record)
            .unwrap_or(message))
    }

    fn refresh_combined_artifact(&self) -> Result<ExperimentDescriptor> {
        let dir = self
            .store
            .experiment_dir(&self.workspace_id, &self.experiment_id);
        let present = has_combined_artifact(&dir);
        self.store
            .update(&self.workspace_id, &self.experiment_id, |current| {
                (current.has_combined_artifact != present).then(|| DescriptorPatch {
                    has_combined_artifact: Some(present),
                    ..Default::default()
                })
            })
    }

    /// Pushes the finished descriptor unless a successful upload already
    /// happened after the run finished. A failure is logged and left for the
    /// next observe to retry; the node commits stand either way.
    async fn upload_descriptor(&self, descriptor: &ExperimentDescriptor) {
        let sync = match &self.sync {
            Some(sync) => sync,
            None => return,
        };
        let (ws, id) = (self.workspace_id.as_str(), self.experiment_id.as_str());
        match sync.status().read(ws, id) {
            Ok(Some(record)) if uploaded_since_finish(&record, descriptor) => return,
            Ok(_) => {}
            Err(err) => warn!(workspace_id = ws, experiment_id = id, error = %err, "unreadable sync status"),
        }
        info!(
            workspace_id = ws,
            experiment_id = id,
            status = descriptor.status.as_str(),
            "all nodes finished, uploading experiment config"
        );
        if let Err(err) = sync
            .upload_experiment(ws, id, Some(&[DESCRIPTOR_FILE.to_string()]))
            .await
        {
            warn!(
                workspace_id = ws,
                experiment_id = id,
                error = %err,
                "experiment config upload failed, retrying on next observe"
            );
        }
    }
}

fn uploaded_since_finish(record: &SyncStatusRecord, descriptor: &ExperimentDescriptor) -> bool {
    if record.action != SyncAction::Upload || record.state != SyncState::Success {
        return false;
    }
    let finished = descriptor.finished_at.as_deref().and_then(parse_timestamp);
    match (finished, parse_timestamp(&record.timestamp)) {
        (Some(finished), Some(uploaded)) => uploaded >= finished,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{write_artifact, ERROR_LOG_FILE};
    use crate::config_store::NodeSpec;
    use crate::descriptor::POST_PROCESS_NODE_ID;
    use crate::process::testing::{proc_started_ago, FakeProcessTable};
    use crate::process::ProcessMarker;
    use serde_json::json;
    use std::fs;
    use std::time::Duration;

    const WORKER: &str = "python /app/.snakemake/scripts/tmpab12.func.py";

    struct Fixture {
        _dir: tempfile::TempDir,
        store: ConfigStore,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let store = ConfigStore::new(dir.path());
            store
                .create(
                    "ws",
                    "e1",
                    "demo",
                    &[
                        NodeSpec::input("input_0", "image"),
                        NodeSpec::algorithm("n1", "suite2p"),
                        NodeSpec::algorithm("n2", "lccd"),
                    ],
                )
                .expect("create");
            Self { _dir: dir, store }
        }

        fn node_dir(&self, node_id: &str) -> std::path::PathBuf {
            self.store.experiment_dir("ws", "e1").join(node_id)
        }

        fn observer(&self, table: FakeProcessTable, wait: Duration) -> WorkflowObserver<FakeProcessTable> {
            self.observer_with_sync(table, wait, None)
        }

        fn observer_with_sync(
            &self,
            table: FakeProcessTable,
            wait: Duration,
            sync: Option<RemoteSyncController>,
        ) -> WorkflowObserver<FakeProcessTable> {
            let monitor = ProcessMonitor::with_table(self.store.clone(), table)
                .unwrap()
                .with_timeouts(wait, Duration::from_secs(3600));
            WorkflowObserver::new(self.store.clone(), monitor, sync, "ws", "e1")
        }
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn pending_node_is_absent_while_worker_runs() {
        let fx = Fixture::new();
        let worker = proc_started_ago(31337, "python", WORKER, Duration::from_secs(1));
        ProcessMarker {
            last_pid: worker.pid,
            func_name: "suite2p".to_string(),
            last_script_file: String::new(),
            create_time: worker.start_time as f64,
        }
        .write(&fx.store.experiment_dir("ws", "e1"))
        .unwrap();
        let observer = fx.observer(FakeProcessTable::with(vec![worker]), Duration::ZERO);
        let results = observer.observe(&ids(&["n1"])).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(fx.store.read("ws", "e1").unwrap().nodes["n1"].status, RunStatus::Running);
    }

    #[tokio::test]
    async fn success_and_failure_artifacts_are_committed() {
        let fx = Fixture::new();
        write_artifact(
            &fx.node_dir("n1"),
            "suite2p",
            &json!({"roi": {"path": "ws/e1/n1/roi.json", "type": "roi"}}),
        )
        .unwrap();
        write_artifact(&fx.node_dir("n2"), "lccd", &json!(["ValueError", "bad shape"])).unwrap();

        let observer = fx.observer(FakeProcessTable::default(), Duration::from_secs(3600));
        let results = observer.observe(&ids(&["n1", "n2"])).await.unwrap();

        assert_eq!(results["n1"].status, RunStatus::Success);
        assert_eq!(results["n1"].message.as_deref(), Some("suite2p success"));
        assert!(results["n1"].output_refs.as_ref().unwrap().contains_key("roi"));
        assert_eq!(results["n2"].status, RunStatus::Error);
        assert_eq!(results["n2"].message.as_deref(), Some("ValueError\nbad shape"));

        let stored = fx.store.read("ws", "e1").unwrap();
        assert!(stored.nodes["n1"].finished_at.is_some());
        // post-process still pending
        assert_eq!(stored.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn workflow_error_log_fails_pending_nodes() {
        let fx = Fixture::new();
        write_artifact(&fx.node_dir("n1"), "suite2p", &json!({})).unwrap();
        fs::write(
            fx.store.experiment_dir("ws", "e1").join(ERROR_LOG_FILE),
            "RuleException in rule n2\n",
        )
        .unwrap();

        let observer = fx.observer(FakeProcessTable::default(), Duration::from_secs(3600));
        let results = observer.observe_overall().await.unwrap();

        assert_eq!(results["input_0"].status, RunStatus::Success);
        assert_eq!(results["n1"].status, RunStatus::Error);
        assert_eq!(results["n2"].message.as_deref(), Some("RuleException in rule n2"));
        assert_eq!(results[POST_PROCESS_NODE_ID].status, RunStatus::Error);

        let stored = fx.store.read("ws", "e1").unwrap();
        assert_eq!(stored.status, RunStatus::Error);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn vanished_worker_fails_nodes_on_second_pass() {
        let fx = Fixture::new();
        let observer = fx.observer(FakeProcessTable::default(), Duration::ZERO);
        let results = observer.observe(&ids(&["n1"])).await.unwrap();
        assert_eq!(results["n1"].status, RunStatus::Error);
        assert_eq!(results["n1"].message.as_deref(), Some("No workflow process found."));
        assert_eq!(fx.store.read("ws", "e1").unwrap().nodes["n2"].status, RunStatus::Running);
    }

    #[tokio::test]
    async fn terminal_nodes_are_not_reevaluated() {
        let fx = Fixture::new();
        write_artifact(&fx.node_dir("n1"), "suite2p", &json!({})).unwrap();
        let observer = fx.observer(FakeProcessTable::default(), Duration::from_secs(3600));
        let first = observer.observe(&ids(&["n1"])).await.unwrap();
        let before = fx.store.read("ws", "e1").unwrap().nodes["n1"].clone();

        write_artifact(&fx.node_dir("n1"), "suite2p", &json!("late failure")).unwrap();
        let second = observer.observe(&ids(&["n1"])).await.unwrap();
        let after = fx.store.read("ws", "e1").unwrap().nodes["n1"].clone();

        assert_eq!(first, second);
        assert_eq!(before.finished_at, after.finished_at);
        assert_eq!(before.message, after.message);
    }

    #[tokio::test]
    async fn unknown_node_ids_are_skipped() {
        let fx = Fixture::new();
        let observer = fx.observer(FakeProcessTable::default(), Duration::from_secs(3600));
        assert!(observer.observe(&[]).await.unwrap().is_empty());
        let results = observer.observe(&ids(&["ghost"])).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn combined_artifact_flag_follows_disk() {
        let fx = Fixture::new();
        fs::write(fx.store.experiment_dir("ws", "e1").join("whole.nwb"), b"nwb").unwrap();
        let observer = fx.observer(FakeProcessTable::default(), Duration::from_secs(3600));
        observer.observe(&ids(&["n1"])).await.unwrap();
        assert!(fx.store.read("ws", "e1").unwrap().has_combined_artifact);
    }

    #[tokio::test]
    async fn finished_descriptor_upload_is_retried_after_lock_contention() {
        let fx = Fixture::new();
        let mock = tempfile::tempdir().expect("mock");
        let backend = std::sync::Arc::new(
            crate::sync::MockStorageBackend::new(fx.store.output_root(), mock.path()).unwrap(),
        );
        let sync = RemoteSyncController::new(backend.clone());
        for (node, algo) in [("n1", "suite2p"), ("n2", "lccd"), (POST_PROCESS_NODE_ID, "post_process")] {
            write_artifact(&fx.node_dir(node), algo, &json!({})).unwrap();
        }
        let observer = fx.observer_with_sync(
            FakeProcessTable::default(),
            Duration::from_secs(3600),
            Some(sync.clone()),
        );
        let remote_descriptor = backend.remote_dir("ws", "e1").join(DESCRIPTOR_FILE);

        let holder = sync.lease().acquire("ws", "e1").unwrap();
        let results = observer.observe_overall().await.expect("commits stand while remote is locked");
        assert_eq!(results.len(), 4);
        assert_eq!(fx.store.read("ws", "e1").unwrap().status, RunStatus::Success);
        assert!(!remote_descriptor.exists());
        sync.lease().release("ws", "e1", &holder).unwrap();

        observer.observe_overall().await.expect("observe");
        assert!(remote_descriptor.is_file());
        assert!(sync.status().is_synced("ws", "e1").unwrap());

        // already uploaded after the finish: no further upload
        fs::remove_file(&remote_descriptor).unwrap();
        observer.observe_overall().await.expect("observe");
        assert!(!remote_descriptor.exists());
    }
}
