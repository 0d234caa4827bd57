//! Persisted per-experiment state document.
//!
//! The descriptor is stored as YAML at `<root>/<ws>/<id>/experiment.yml` and
//! mutated only through [`crate::config_store::ConfigStore`]. Keys the model
//! does not know about (engine parameters, usage bookkeeping) are carried in
//! `extra` so rewrites never drop them.

use std::collections::BTreeMap;

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub const DESCRIPTOR_FILE: &str = "experiment.yml";
pub const WORKFLOW_FILE: &str = "workflow.yml";
pub const POST_PROCESS_NODE_ID: &str = "post_process";
pub const POST_PROCESS_LABEL: &str = "Post Process";

pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn now_timestamp() -> String {
    Local::now().format(DATE_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, DATE_FORMAT).ok()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Running,
    Success,
    Error,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }
}

/// Reference to one named output a node produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_shape: Option<Vec<u64>>,
}

pub type OutputRefs = BTreeMap<String, OutputRef>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub label: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub has_artifact: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub output_refs: Option<OutputRefs>,
}

impl NodeRecord {
    pub fn running(node_id: &str, label: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            label: label.to_string(),
            started_at: None,
            finished_at: None,
            status: RunStatus::Running,
            has_artifact: false,
            message: None,
            output_refs: None,
        }
    }
}

/// Which of the two node maps a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeGroup {
    Primary,
    PostProcess,
}

impl NodeGroup {
    pub fn of(node_id: &str) -> Self {
        if node_id == POST_PROCESS_NODE_ID {
            NodeGroup::PostProcess
        } else {
            NodeGroup::Primary
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDescriptor {
    pub workspace_id: String,
    pub experiment_id: String,
    pub name: String,
    pub started_at: String,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub has_combined_artifact: bool,
    pub nodes: BTreeMap<String, NodeRecord>,
    #[serde(default)]
    pub post_process_nodes: BTreeMap<String, NodeRecord>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl ExperimentDescriptor {
    pub fn node(&self, node_id: &str) -> Option<&NodeRecord> {
        match NodeGroup::of(node_id) {
            NodeGroup::Primary => self.nodes.get(node_id),
            NodeGroup::PostProcess => self.post_process_nodes.get(node_id),
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values().chain(self.post_process_nodes.values())
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes
            .keys()
            .chain(self.post_process_nodes.keys())
            .cloned()
            .collect()
    }

    pub fn is_all_finished(&self) -> bool {
        self.records().all(|r| r.status.is_terminal())
    }

    /// Status implied by the node records: running while any entry runs,
    /// otherwise error if any entry failed.
    pub fn aggregate_status(&self) -> RunStatus {
        let mut status = RunStatus::Success;
        for record in self.records() {
            match record.status {
                RunStatus::Running => return RunStatus::Running,
                RunStatus::Error => status = RunStatus::Error,
                RunStatus::Success => {}
            }
        }
        status
    }

    /// Brings `status`/`finished_at` in line with the node records.
    /// `finished_at` is stamped only on the running -> terminal transition.
    /// Returns true when anything changed.
    pub fn reconcile_status(&mut self, now: &str) -> bool {
        let aggregate = self.aggregate_status();
        if aggregate == self.status {
            if aggregate.is_terminal() && self.finished_at.is_none() {
                self.finished_at = Some(now.to_string());
                return true;
            }
            return false;
        }
        if aggregate.is_terminal() {
            if !self.status.is_terminal() || self.finished_at.is_none() {
                self.finished_at = Some(now.to_string());
            }
        } else {
            self.finished_at = None;
        }
        self.status = aggregate;
        true
    }
}

/// Partial update of one node record; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_artifact: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_refs: Option<OutputRefs>,
}

/// Partial descriptor update, serialized to a sparse YAML mapping and merged
/// key-by-key into the stored document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DescriptorPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_combined_artifact: Option<bool>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, NodePatch>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub post_process_nodes: BTreeMap<String, NodePatch>,
}

impl DescriptorPatch {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn node(node_id: &str, patch: NodePatch) -> Self {
        let mut out = Self::default();
        match NodeGroup::of(node_id) {
            NodeGroup::Primary => out.nodes.insert(node_id.to_string(), patch),
            NodeGroup::PostProcess => out.post_process_nodes.insert(node_id.to_string(), patch),
        };
        out
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn to_value(&self) -> serde_yaml::Result<serde_yaml::Value> {
        serde_yaml::to_value(self)
    }
}
