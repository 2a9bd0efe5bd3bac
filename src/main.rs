use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use autoflow::cli::{self, Cli, Commands};
use autoflow::config::Settings;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    cli::runtime::init_logging(&cli.log_level, cli.debug)?;
    let settings = Settings::load(cli.config.as_ref())?;

    match cli.command {
        Commands::Run(args) => cli::cmd_run(args, &settings).await,
        Commands::Batch(args) => cli::cmd_batch(args, &settings).await,
        Commands::Status(args) => {
            cli::cmd_status(args, &settings).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
