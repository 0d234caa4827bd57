//! Execution-state tracking for workflow experiments.
//!
//! An experiment lives in `<output_root>/<workspace>/<experiment>/`. The
//! external workflow engine writes per-node result artifacts and a process
//! marker there; this crate folds that evidence into the experiment
//! descriptor ([`observer`]), watches the engine process ([`process`]) and
//! mirrors the directory to remote storage ([`sync`]).

pub mod artifact;
pub mod config_store;
pub mod descriptor;
pub mod error;
pub mod experiment;
pub mod fsutil;
pub mod observer;
pub mod process;
pub mod settings;
pub mod sync;

pub use config_store::{ConfigStore, NodeSpec};
pub use descriptor::{
    DescriptorPatch, ExperimentDescriptor, NodePatch, NodeRecord, OutputRef, OutputRefs, RunStatus,
};
pub use error::{Error, Result};
pub use experiment::ExperimentManager;
pub use observer::{NodeMessage, ObservedNodes, WorkflowObserver};
pub use process::{ProcessLookup, ProcessMarker, ProcessMonitor, ProcessTable, SystemProcessTable};
pub use settings::{Settings, StorageKind};
pub use sync::{RemoteSyncController, StorageBackend, SyncStatusRecord};
