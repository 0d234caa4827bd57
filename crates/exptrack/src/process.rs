//! Liveness tracking for the external workflow process.
//!
//! The worker records the PID of the function it is executing in `pid.json`.
//! That PID belongs to a script launched under an environment activation
//! shell, so it may be stale, recycled, or not written yet while the engine is
//! still provisioning environments. [`ProcessMonitor::search`] resolves all of
//! that into a [`ProcessLookup`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, Signal, System};
use tracing::{debug, warn};

use crate::config_store::ConfigStore;
use crate::descriptor::parse_timestamp;
use crate::error::{Error, Result};
use crate::fsutil::atomic_write_json_pretty;

pub const MARKER_FILE: &str = "pid.json";
pub const WORKER_WAIT_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
pub const PROVISIONING_TIMEOUT: Duration = Duration::from_secs(60 * 60);

const WORKER_CMDLINE: &str = r"\b(?:python)\b.*/\.snakemake/scripts/";
const PROVISIONING_CMDLINE: &str =
    r"\b(?:conda)\b.*\b(?:env)\b.*\b(?:create)\b.*/\.snakemake/conda/";
const PROVISIONING_PROCESS_NAMES: [&str; 2] = ["python", "conda"];

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Contents of the marker file the worker writes when it starts a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMarker {
    pub last_pid: u32,
    pub func_name: String,
    pub last_script_file: String,
    /// Seconds since the unix epoch.
    pub create_time: f64,
}

impl ProcessMarker {
    pub fn path(experiment_dir: &Path) -> PathBuf {
        experiment_dir.join(MARKER_FILE)
    }

    /// Missing markers are `None`. A marker that cannot be parsed is logged
    /// and treated the same way, since the worker may rewrite it at any time.
    pub fn read(experiment_dir: &Path) -> Option<Self> {
        let path = Self::path(experiment_dir);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable process marker");
                None
            }
        }
    }

    pub fn write(&self, experiment_dir: &Path) -> Result<()> {
        atomic_write_json_pretty(&Self::path(experiment_dir), self)
    }

    /// Stand-in used before the worker has written a marker. Its creation time
    /// is the experiment start so the wait timeout still runs from there.
    pub fn placeholder(started_at: &str) -> Self {
        let create_time = parse_timestamp(started_at)
            .and_then(|ts| ts.and_local_timezone(chrono::Local).single())
            .map(|ts| ts.timestamp() as f64)
            .unwrap_or(0.0);
        Self {
            last_pid: 0,
            func_name: String::new(),
            last_script_file: String::new(),
            create_time,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.last_pid == 0
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64((epoch_now() - self.create_time).max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
    /// Seconds since the unix epoch.
    pub start_time: u64,
}

impl ProcessInfo {
    pub fn age(&self) -> Duration {
        Duration::from_secs_f64((epoch_now() - self.start_time as f64).max(0.0))
    }
}

/// Read access to the host process table plus the one signal we send.
pub trait ProcessTable: Send + Sync {
    fn process(&self, pid: u32) -> Option<ProcessInfo>;
    fn processes(&self) -> Vec<ProcessInfo>;
    /// Sends SIGTERM. Returns false when the process no longer exists.
    fn terminate(&self, pid: u32) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessTable;

fn process_info(pid: Pid, process: &sysinfo::Process) -> ProcessInfo {
    ProcessInfo {
        pid: pid.as_u32(),
        name: process.name().to_string(),
        cmdline: process.cmd().join(" "),
        start_time: process.start_time(),
    }
}

impl ProcessTable for SystemProcessTable {
    fn process(&self, pid: u32) -> Option<ProcessInfo> {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|p| process_info(pid, p))
    }

    fn processes(&self) -> Vec<ProcessInfo> {
        let mut system = System::new();
        system.refresh_processes();
        system
            .processes()
            .iter()
            .map(|(pid, p)| process_info(*pid, p))
            .collect()
    }

    fn terminate(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        if !system.refresh_process(pid) {
            return false;
        }
        system
            .process(pid)
            .and_then(|p| p.kill_with(Signal::Term))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessLookup {
    /// A live worker or provisioning process stands for the workflow.
    Found {
        marker: ProcessMarker,
        process: ProcessInfo,
    },
    /// Nothing observable yet, but still inside the wait timeout.
    NotFoundYet { marker: ProcessMarker },
    /// Nothing found and the wait timeout has elapsed.
    Gone { marker: ProcessMarker },
}

impl ProcessLookup {
    pub fn is_gone(&self) -> bool {
        matches!(self, ProcessLookup::Gone { .. })
    }

    pub fn marker(&self) -> &ProcessMarker {
        match self {
            ProcessLookup::Found { marker, .. }
            | ProcessLookup::NotFoundYet { marker }
            | ProcessLookup::Gone { marker } => marker,
        }
    }
}

pub struct ProcessMonitor<T: ProcessTable = SystemProcessTable> {
    store: ConfigStore,
    table: T,
    worker_pattern: Regex,
    provisioning_pattern: Regex,
    worker_wait_timeout: Duration,
    provisioning_timeout: Duration,
}

impl ProcessMonitor<SystemProcessTable> {
    pub fn new(store: ConfigStore) -> Result<Self> {
        Self::with_table(store, SystemProcessTable)
    }
}

impl<T: ProcessTable> ProcessMonitor<T> {
    pub fn with_table(store: ConfigStore, table: T) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| Error::Settings(format!("invalid process pattern {}: {}", pattern, e)))
        };
        Ok(Self {
            store,
            table,
            worker_pattern: compile(WORKER_CMDLINE)?,
            provisioning_pattern: compile(PROVISIONING_CMDLINE)?,
            worker_wait_timeout: WORKER_WAIT_TIMEOUT,
            provisioning_timeout: PROVISIONING_TIMEOUT,
        })
    }

    pub fn with_timeouts(mut self, worker_wait: Duration, provisioning: Duration) -> Self {
        self.worker_wait_timeout = worker_wait;
        self.provisioning_timeout = provisioning;
        self
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    pub fn search(&self, workspace_id: &str, experiment_id: &str) -> Result<ProcessLookup> {
        let dir = self.store.experiment_dir(workspace_id, experiment_id);
        let marker = match ProcessMarker::read(&dir) {
            Some(marker) => marker,
            None => {
                let descriptor = self.store.read(workspace_id, experiment_id)?;
                ProcessMarker::placeholder(&descriptor.started_at)
            }
        };

        if let Some(process) = self.marked_worker(&marker) {
            return Ok(ProcessLookup::Found { marker, process });
        }
        if let Some(process) = self.provisioning_process() {
            return Ok(ProcessLookup::Found { marker, process });
        }

        if marker.elapsed() < self.worker_wait_timeout {
            debug!(workspace_id, experiment_id, "no workflow process yet, still within wait timeout");
            Ok(ProcessLookup::NotFoundYet { marker })
        } else {
            warn!(
                workspace_id,
                experiment_id,
                last_pid = marker.last_pid,
                func_name = %marker.func_name,
                "no workflow process found at all"
            );
            Ok(ProcessLookup::Gone { marker })
        }
    }

    fn marked_worker(&self, marker: &ProcessMarker) -> Option<ProcessInfo> {
        if marker.is_placeholder() {
            return None;
        }
        let process = self.table.process(marker.last_pid)?;
        if !self.worker_pattern.is_match(&process.cmdline) {
            warn!(
                pid = process.pid,
                cmdline = %process.cmdline,
                "pid collision, process is not a workflow worker"
            );
            return None;
        }
        Some(process)
    }

    fn provisioning_process(&self) -> Option<ProcessInfo> {
        self.table
            .processes()
            .into_iter()
            .filter(|p| PROVISIONING_PROCESS_NAMES.iter().any(|n| p.name.contains(n)))
            .filter(|p| self.provisioning_pattern.is_match(&p.cmdline))
            .find(|p| {
                let age = p.age();
                if age < self.provisioning_timeout {
                    debug!(pid = p.pid, age_secs = age.as_secs(), "environment provisioning in progress");
                    true
                } else {
                    warn!(pid = p.pid, age_secs = age.as_secs(), "ignoring stale provisioning process");
                    false
                }
            })
    }

    /// Removes the worker's run script and sends SIGTERM. Does not wait for
    /// the process to exit.
    pub fn cancel(&self, workspace_id: &str, experiment_id: &str) -> Result<bool> {
        let (marker, process) = match self.search(workspace_id, experiment_id)? {
            ProcessLookup::Found { marker, process } => (marker, process),
            _ => return Err(Error::NotFound("Current process not found".to_string())),
        };

        let script = Path::new(&marker.last_script_file);
        if !marker.last_script_file.is_empty() && script.exists() {
            fs::remove_file(script)?;
        } else {
            warn!(script = %marker.last_script_file, "run script has not started yet");
        }

        let sent = self.table.terminate(process.pid);
        debug!(pid = process.pid, sent, "sent termination signal");
        Ok(sent)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::config_store::NodeSpec;

    const WORKER: &str = "python /app/.snakemake/scripts/tmpab12.suite2p.py";
    const CONDA: &str =
        "/opt/conda/bin/python /opt/conda/bin/conda env create --file /app/.snakemake/conda/abc_.yaml";

    fn setup(marker_age: Option<Duration>) -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path());
        store
            .create("ws", "e1", "demo", &[NodeSpec::algorithm("n1", "suite2p")])
            .expect("create");
        if let Some(age) = marker_age {
            let script = store.experiment_dir("ws", "e1").join("run.py");
            fs::write(&script, "print()").unwrap();
            ProcessMarker {
                last_pid: 4242,
                func_name: "suite2p".to_string(),
                last_script_file: script.to_string_lossy().to_string(),
                create_time: epoch_now() - age.as_secs_f64(),
            }
            .write(&store.experiment_dir("ws", "e1"))
            .expect("marker");
        }
        (dir, store)
    }

    #[test]
    fn matching_worker_is_found() {
        let (_dir, store) = setup(Some(Duration::from_secs(10)));
        let table = FakeProcessTable::with(vec![proc_started_ago(4242, "python", WORKER, Duration::from_secs(5))]);
        let monitor = ProcessMonitor::with_table(store, table).unwrap();
        match monitor.search("ws", "e1").unwrap() {
            ProcessLookup::Found { process, .. } => assert_eq!(process.pid, 4242),
            other => panic!("expected found, got {:?}", other),
        }
    }

    #[test]
    fn pid_collision_counts_as_not_found() {
        let (_dir, store) = setup(Some(Duration::from_secs(10)));
        let table = FakeProcessTable::with(vec![proc_started_ago(4242, "nginx", "nginx: worker", Duration::from_secs(5))]);
        let monitor = ProcessMonitor::with_table(store, table).unwrap();
        assert!(matches!(
            monitor.search("ws", "e1").unwrap(),
            ProcessLookup::NotFoundYet { .. }
        ));
    }

    #[test]
    fn provisioning_process_stands_in_until_timeout() {
        let (_dir, store) = setup(Some(Duration::from_secs(3 * 60 * 60)));
        let fresh = FakeProcessTable::with(vec![proc_started_ago(77, "python3", CONDA, Duration::from_secs(60))]);
        let monitor = ProcessMonitor::with_table(store.clone(), fresh).unwrap();
        assert!(matches!(monitor.search("ws", "e1").unwrap(), ProcessLookup::Found { .. }));

        let stale = FakeProcessTable::with(vec![proc_started_ago(77, "python3", CONDA, Duration::from_secs(2 * 60 * 60))]);
        let monitor = ProcessMonitor::with_table(store.clone(), stale).unwrap();
        assert!(monitor.search("ws", "e1").unwrap().is_gone());

        let unrelated = FakeProcessTable::with(vec![proc_started_ago(77, "bash", CONDA, Duration::from_secs(60))]);
        let monitor = ProcessMonitor::with_table(store, unrelated).unwrap();
        assert!(monitor.search("ws", "e1").unwrap().is_gone());
    }

    #[test]
    fn missing_marker_uses_experiment_start() {
        let (_dir, store) = setup(None);
        let monitor = ProcessMonitor::with_table(store.clone(), FakeProcessTable::default()).unwrap();
        let lookup = monitor.search("ws", "e1").unwrap();
        assert!(matches!(lookup, ProcessLookup::NotFoundYet { .. }));
        assert!(lookup.marker().is_placeholder());

        let monitor = ProcessMonitor::with_table(store, FakeProcessTable::default())
            .unwrap()
            .with_timeouts(Duration::ZERO, PROVISIONING_TIMEOUT);
        assert!(monitor.search("ws", "e1").unwrap().is_gone());
    }

    #[test]
    fn unparsable_start_falls_back_to_epoch() {
        let marker = ProcessMarker::placeholder("not a date");
        assert_eq!(marker.create_time, 0.0);
        assert!(marker.elapsed() > WORKER_WAIT_TIMEOUT);
    }

    #[test]
    fn cancel_removes_script_and_signals() {
        let (_dir, store) = setup(Some(Duration::from_secs(10)));
        let script = store.experiment_dir("ws", "e1").join("run.py");
        let table = FakeProcessTable::with(vec![proc_started_ago(4242, "python", WORKER, Duration::from_secs(5))]);
        let monitor = ProcessMonitor::with_table(store, table).unwrap();

        assert!(monitor.cancel("ws", "e1").expect("cancel"));
        assert!(!script.exists());
        assert_eq!(*monitor.table().terminated.lock().unwrap(), vec![4242]);
    }

    #[test]
    fn cancel_without_process_is_not_found() {
        let (_dir, store) = setup(Some(Duration::from_secs(10)));
        let monitor = ProcessMonitor::with_table(store, FakeProcessTable::default()).unwrap();
        let err = monitor.cancel("ws", "e1").expect_err("nothing to cancel");
        assert!(matches!(err, Error::NotFound(_)));
    }
}
