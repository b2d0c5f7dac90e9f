//! meshtune binary.
//!
//! Entry point for config-driven fine-tuning runs over a local device mesh.

use anyhow::{Context, Result};
use clap::Parser;
use meshtune_core::{
    cli::commands::{Commands, LoggingArgs},
    cli::{handle_checkpoints, handle_train, handle_validate, init_logging},
    config::RunConfig,
};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train(cmd) => {
            let config = RunConfig::load(&cmd.config)
                .with_context(|| format!("Invalid configuration {}", cmd.config.display()))?;
            let log_dir = cmd
                .log_file
                .then(|| config.trainer_config.base_dir.join("logs"));
            let _guard = init_logging(&cli.logging, log_dir.as_deref())?;
            info!("meshtune {} starting", env!("CARGO_PKG_VERSION"));
            handle_train(config, cmd.devices).await?;
        }
        Commands::Validate(cmd) => {
            let _guard = init_logging(&cli.logging, None)?;
            handle_validate(&cmd.config, cmd.devices)?;
        }
        Commands::Checkpoints(cmd) => {
            let _guard = init_logging(&cli.logging, None)?;
            handle_checkpoints(&cmd.dir, cmd.gc, cmd.json)?;
        }
    }

    Ok(())
}
