use anyhow::{bail, Result};
use clap::Args;

use autoflow_core_types::{BatchId, ExecutionId};
use autoflow_state_store::{ExecutionStore, JsonFileStore};

use crate::config::Settings;

#[derive(Args, Clone, Debug)]
pub struct StatusArgs {
    /// Batch id to inspect
    #[arg(long, conflicts_with = "execution")]
    pub batch: Option<String>,

    /// Execution id to inspect
    #[arg(long)]
    pub execution: Option<String>,
}

pub async fn cmd_status(args: StatusArgs, settings: &Settings) -> Result<()> {
    let store = JsonFileStore::new(settings.state_dir())?;

    if let Some(batch) = args.batch {
        let id = BatchId(batch);
        let Some(record) = store.get_batch(&id).await? else {
            bail!("no record for batch {id}");
        };
        println!(
            "batch {}: {} ({}/{} valid, {} completed, {} failed, {} stopped)",
            record.id,
            record.status,
            record.valid,
            record.total,
            record.progress.completed,
            record.progress.failed,
            record.progress.stopped,
        );
        for execution in store.get_batch_executions(&id).await? {
            let error = execution
                .last_error
                .map(|error| format!(" ({error})"))
                .unwrap_or_default();
            println!(
                "  {} {} [{}]{}",
                execution.id, execution.workflow_name, execution.status, error
            );
        }
        return Ok(());
    }

    if let Some(execution) = args.execution {
        let id = ExecutionId(execution);
        let Some(record) = store.get_execution(&id).await? else {
            bail!("no record for execution {id}");
        };
        println!(
            "execution {}: {} (workflow {})",
            record.id, record.status, record.workflow_id
        );
        if let Some(error) = record.last_error {
            println!("  last error: {error}");
        }
        return Ok(());
    }

    bail!("pass --batch or --execution")
}
