use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Args;
use tokio::signal;
use tracing::{info, warn};

use autoflow_core_types::BatchStatus;
use autoflow_event_bus::FlowEvent;
use autoflow_scheduler::{BatchEntry, BatchOptions};
use autoflow_state_store::BatchSource;

use crate::config::Settings;

use super::run::load_workflow;
use super::runtime::build_manager;

#[derive(Args, Clone, Debug)]
pub struct BatchArgs {
    /// Folder of workflow .json files
    #[arg(long, conflicts_with = "files")]
    pub folder: Option<PathBuf>,

    /// Explicit workflow files
    pub files: Vec<PathBuf>,

    /// Worker cap for this batch (defaults to the global limit)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Higher priority batches dispatch first
    #[arg(short, long, default_value_t = 0)]
    pub priority: i32,

    /// Where to write batch results
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

fn collect_folder(folder: &PathBuf) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(folder)
        .with_context(|| format!("failed to read {}", folder.display()))?
    {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

pub async fn cmd_batch(args: BatchArgs, settings: &Settings) -> Result<ExitCode> {
    let (paths, source) = match &args.folder {
        Some(folder) => (
            collect_folder(folder)?,
            BatchSource::Folder {
                path: folder.clone(),
            },
        ),
        None if !args.files.is_empty() => (
            args.files.clone(),
            BatchSource::Files {
                paths: args.files.clone(),
            },
        ),
        None => bail!("pass --folder or a list of workflow files"),
    };
    if paths.is_empty() {
        bail!("no workflow files found");
    }

    let entries: Vec<BatchEntry> = paths
        .into_iter()
        .map(|path| match load_workflow(&path) {
            Ok(workflow) => BatchEntry::Valid {
                workflow,
                path: Some(path),
            },
            Err(err) => BatchEntry::Invalid {
                path: Some(path),
                error: err.to_string(),
            },
        })
        .collect();

    let manager = build_manager(settings)?;
    let mut events = manager.subscribe();
    let id = manager
        .start_batch(
            entries,
            BatchOptions {
                workers: args.workers,
                priority: args.priority,
                source,
                output_path: args.output.clone(),
            },
        )
        .await
        .context("failed to start batch")?;
    info!(batch = %id, "batch started");

    let status = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(FlowEvent::ExecutionFinished { execution, batch, status, error })
                    if batch.as_ref() == Some(&id) =>
                {
                    match error {
                        Some(error) => warn!(execution = %execution, %error, "member failed"),
                        None => info!(execution = %execution, %status, "member finished"),
                    }
                }
                Ok(FlowEvent::BatchCompleted { batch, status, completed, failed })
                    if batch == id =>
                {
                    info!(completed, failed, "batch finished");
                    break status;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(?err, "event stream closed");
                    break BatchStatus::Error;
                }
            },
            _ = signal::ctrl_c() => {
                warn!("interrupt received, stopping batch");
                manager.stop_batch(&id).await?;
            }
        }
    };

    if let Some(record) = manager.batch_status(&id).await? {
        println!(
            "{id}: {status} ({} completed, {} failed, {} stopped, {} invalid)",
            record.progress.completed, record.progress.failed, record.progress.stopped,
            record.invalid
        );
    } else {
        println!("{id}: {status}");
    }
    Ok(match status {
        BatchStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}
