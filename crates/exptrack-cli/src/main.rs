use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use exptrack::{
    ConfigStore, ExperimentDescriptor, ExperimentManager, ProcessMonitor, RemoteSyncController,
    Settings, WorkflowObserver,
};

#[derive(Parser)]
#[command(name = "exptrack", version = "0.3.0", about = "Workflow experiment tracking CLI")]
struct Cli {
    /// Overrides EXPTRACK_OUTPUT_DIR.
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Advance the given nodes and print their known outcomes.
    Observe {
        workspace_id: String,
        experiment_id: String,
        #[arg(required = true)]
        node_ids: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    ObserveAll {
        workspace_id: String,
        experiment_id: String,
        #[arg(long)]
        json: bool,
    },
    Cancel {
        workspace_id: String,
        experiment_id: String,
        #[arg(long)]
        json: bool,
    },
    Show {
        workspace_id: String,
        experiment_id: String,
        #[arg(long)]
        json: bool,
    },
    Latest {
        workspace_id: String,
        #[arg(long)]
        json: bool,
    },
    Upload {
        workspace_id: String,
        experiment_id: String,
        /// Only these files, relative to the experiment directory.
        #[arg(long = "file")]
        files: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    Download {
        workspace_id: String,
        experiment_id: String,
        #[arg(long)]
        json: bool,
    },
    DeleteRemote {
        workspace_id: String,
        experiment_id: String,
        #[arg(long)]
        json: bool,
    },
    DownloadMetas {
        #[arg(long)]
        workspace_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    SyncStatus {
        workspace_id: String,
        experiment_id: String,
        #[arg(long)]
        json: bool,
    },
    Rename {
        workspace_id: String,
        experiment_id: String,
        name: String,
        #[arg(long)]
        json: bool,
    },
    Copy {
        workspace_id: String,
        #[arg(required = true)]
        experiment_ids: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    Delete {
        workspace_id: String,
        experiment_id: String,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.output_dir, cli.command).await;
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = match err.downcast_ref::<exptrack::Error>() {
                    Some(e) if e.is_locked() => "remote_storage_locked",
                    _ => "command_failed",
                };
                emit_json(&json_error(code, err.to_string(), error_details(&err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn load_settings(output_dir: Option<PathBuf>) -> Result<Settings> {
    let mut settings = Settings::from_env()?;
    if let Some(dir) = output_dir {
        settings.output_root = dir;
    }
    Ok(settings)
}

fn require_sync(settings: &Settings) -> Result<RemoteSyncController> {
    RemoteSyncController::from_settings(settings)?
        .ok_or_else(|| anyhow!("remote storage is not in use (REMOTE_STORAGE_TYPE=0)"))
}

async fn run_command(output_dir: Option<PathBuf>, command: Commands) -> Result<Option<Value>> {
    let settings = load_settings(output_dir)?;
    tracing::debug!(
        output_root = %settings.output_root.display(),
        storage = settings.storage.as_flag(),
        "settings loaded"
    );
    match command {
        Commands::Observe {
            workspace_id,
            experiment_id,
            node_ids,
            json,
        } => {
            let observer = WorkflowObserver::from_settings(&settings, &workspace_id, &experiment_id)?;
            let results = observer.observe(&node_ids).await?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "observe",
                    "nodes": results
                })));
            }
            print_nodes(&results);
        }
        Commands::ObserveAll {
            workspace_id,
            experiment_id,
            json,
        } => {
            let observer = WorkflowObserver::from_settings(&settings, &workspace_id, &experiment_id)?;
            let results = observer.observe_overall().await?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "observe-all",
                    "nodes": results
                })));
            }
            print_nodes(&results);
        }
        Commands::Cancel {
            workspace_id,
            experiment_id,
            json,
        } => {
            let monitor = ProcessMonitor::new(ConfigStore::from_settings(&settings))?;
            let signalled = monitor.cancel(&workspace_id, &experiment_id)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "cancel",
                    "signalled": signalled
                })));
            }
            println!("cancel requested: {}/{}", workspace_id, experiment_id);
        }
        Commands::Show {
            workspace_id,
            experiment_id,
            json,
        } => {
            let descriptor = ConfigStore::from_settings(&settings).read(&workspace_id, &experiment_id)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "show",
                    "experiment": serde_json::to_value(&descriptor)?
                })));
            }
            print_descriptor(&descriptor);
        }
        Commands::Latest { workspace_id, json } => {
            let latest = ConfigStore::from_settings(&settings).latest(&workspace_id)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "latest",
                    "experiment": latest.map(|d| serde_json::to_value(&d)).transpose()?
                })));
            }
            match latest {
                Some(d) => print_descriptor(&d),
                None => println!("no experiments in workspace {}", workspace_id),
            }
        }
        Commands::Upload {
            workspace_id,
            experiment_id,
            files,
            json,
        } => {
            let sync = require_sync(&settings)?;
            let targets = (!files.is_empty()).then_some(files.as_slice());
            let done = sync.upload_experiment(&workspace_id, &experiment_id, targets).await?;
            return sync_result("upload", done, json);
        }
        Commands::Download {
            workspace_id,
            experiment_id,
            json,
        } => {
            let sync = require_sync(&settings)?;
            let done = sync.download_experiment(&workspace_id, &experiment_id).await?;
            return sync_result("download", done, json);
        }
        Commands::DeleteRemote {
            workspace_id,
            experiment_id,
            json,
        } => {
            let sync = require_sync(&settings)?;
            let done = sync.delete_experiment(&workspace_id, &experiment_id).await?;
            return sync_result("delete-remote", done, json);
        }
        Commands::DownloadMetas { workspace_id, json } => {
            let sync = require_sync(&settings)?;
            let done = sync
                .download_all_experiment_metas(workspace_id.as_deref())
                .await?;
            return sync_result("download-metas", done, json);
        }
        Commands::SyncStatus {
            workspace_id,
            experiment_id,
            json,
        } => {
            let sync = require_sync(&settings)?;
            let record = sync.status().read(&workspace_id, &experiment_id)?;
            let locked = sync.lease().is_held(&workspace_id, &experiment_id)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "sync-status",
                    "status": record,
                    "locked": locked
                })));
            }
            match record {
                Some(r) => println!(
                    "action: {:?}\nstate: {:?}\nbucket: {}\ntimestamp: {}",
                    r.action, r.state, r.remote_bucket_name, r.timestamp
                ),
                None => println!("never synced"),
            }
            println!("locked: {}", locked);
        }
        Commands::Rename {
            workspace_id,
            experiment_id,
            name,
            json,
        } => {
            let manager = ExperimentManager::from_settings(&settings)?;
            let descriptor = manager.rename(&workspace_id, &experiment_id, &name).await?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "rename",
                    "experiment_id": descriptor.experiment_id,
                    "name": descriptor.name
                })));
            }
            println!("renamed {} to {}", descriptor.experiment_id, descriptor.name);
        }
        Commands::Copy {
            workspace_id,
            experiment_ids,
            json,
        } => {
            let manager = ExperimentManager::from_settings(&settings)?;
            let created = manager.copy_many(&workspace_id, &experiment_ids).await?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "copy",
                    "created": created
                })));
            }
            for (source, copy) in experiment_ids.iter().zip(&created) {
                println!("{} -> {}", source, copy);
            }
        }
        Commands::Delete {
            workspace_id,
            experiment_id,
            json,
        } => {
            let manager = ExperimentManager::from_settings(&settings)?;
            let deleted = manager.delete(&workspace_id, &experiment_id).await?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "delete",
                    "deleted": deleted
                })));
            }
            if deleted {
                println!("deleted {}/{}", workspace_id, experiment_id);
            } else {
                println!("not deleted: {}/{} is still running", workspace_id, experiment_id);
            }
        }
    }
    Ok(None)
}

fn sync_result(command: &str, done: bool, json: bool) -> Result<Option<Value>> {
    if json {
        return Ok(Some(json!({
            "ok": true,
            "command": command,
            "done": done
        })));
    }
    println!("{}: {}", command, if done { "done" } else { "nothing to do" });
    Ok(None)
}

fn print_nodes(results: &exptrack::ObservedNodes) {
    if results.is_empty() {
        println!("no node outcome determined yet");
        return;
    }
    for (node_id, message) in results {
        println!(
            "{}: {} {}",
            node_id,
            message.status.as_str(),
            message.message.as_deref().unwrap_or("")
        );
    }
}

fn print_descriptor(descriptor: &ExperimentDescriptor) {
    println!("experiment: {}/{}", descriptor.workspace_id, descriptor.experiment_id);
    println!("name: {}", descriptor.name);
    println!("status: {}", descriptor.status.as_str());
    println!("started_at: {}", descriptor.started_at);
    println!(
        "finished_at: {}",
        descriptor.finished_at.as_deref().unwrap_or("-")
    );
    for record in descriptor.records() {
        println!("  {} ({}): {}", record.node_id, record.label, record.status.as_str());
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_details(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<exptrack::Error>() {
        Some(exptrack::Error::CopyFailed {
            failed_id,
            cleaned_up,
            ..
        }) => json!({ "failed_id": failed_id, "cleaned_up": cleaned_up }),
        Some(e) => json!({ "kind": e.code(), "http_status": e.http_status() }),
        None => json!({}),
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Observe { json, .. }
        | Commands::ObserveAll { json, .. }
        | Commands::Cancel { json, .. }
        | Commands::Show { json, .. }
        | Commands::Latest { json, .. }
        | Commands::Upload { json, .. }
        | Commands::Download { json, .. }
        | Commands::DeleteRemote { json, .. }
        | Commands::DownloadMetas { json, .. }
        | Commands::SyncStatus { json, .. }
        | Commands::Rename { json, .. }
        | Commands::Copy { json, .. }
        | Commands::Delete { json, .. } => *json,
    }
}
