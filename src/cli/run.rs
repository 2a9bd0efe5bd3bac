use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;
use tokio::signal;
use tracing::{info, warn};

use autoflow_core_types::{ExecutionStatus, Workflow};
use autoflow_event_bus::FlowEvent;

use crate::config::Settings;

use super::runtime::build_manager;

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Workflow file to execute
    pub workflow: PathBuf,
}

pub fn load_workflow(path: &Path) -> Result<Workflow> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid workflow {}", path.display()))
}

pub async fn cmd_run(args: RunArgs, settings: &Settings) -> Result<ExitCode> {
    let workflow = load_workflow(&args.workflow)?;
    let manager = build_manager(settings)?;
    let mut events = manager.subscribe();

    let id = manager
        .start_single(workflow)
        .await
        .context("failed to start execution")?;
    info!(execution = %id, "execution started");

    let status = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(FlowEvent::NodeStarted { execution, node, kind }) if execution == id => {
                    info!(node = %node, kind = %kind, "node started");
                }
                Ok(FlowEvent::NodePaused { execution, node, reason }) if execution == id => {
                    warn!(node = %node, reason = %reason, "execution paused; stop with Ctrl-C");
                }
                Ok(FlowEvent::ExecutionFinished { execution, status, error, .. }) if execution == id => {
                    if let Some(error) = error {
                        warn!(%error, "execution failed");
                    }
                    break status;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(?err, "event stream closed");
                    break ExecutionStatus::Error;
                }
            },
            _ = signal::ctrl_c() => {
                warn!("interrupt received, stopping");
                manager.stop_execution(&id).await;
            }
        }
    };

    println!("{id}: {status}");
    Ok(match status {
        ExecutionStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}
