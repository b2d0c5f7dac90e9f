pub mod checkpoints;
pub mod train;

pub use checkpoints::CheckpointsCommand;
pub use train::{TrainCommand, ValidateCommand};

use clap::{Args, Subcommand};

#[derive(Subcommand)]
pub enum Commands {
    /// Run a training job described by a config file
    Train(TrainCommand),
    /// Load and validate a config file without training
    Validate(ValidateCommand),
    /// List durable checkpoints in a directory
    Checkpoints(CheckpointsCommand),
}

/// Logging flags shared by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct LoggingArgs {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Tracing filter directive, overrides RUST_LOG
    #[arg(long, value_name = "FILTER", global = true)]
    pub log_filter: Option<String>,
}

impl LoggingArgs {
    /// Filter directive in effect for these flags.
    pub fn filter(&self) -> String {
        if let Some(filter) = &self.log_filter {
            return filter.clone();
        }
        match self.verbose {
            0 => std::env::var("RUST_LOG").unwrap_or_else(|_| "meshtune_core=info".to_string()),
            1 => "meshtune_core=debug".to_string(),
            _ => "meshtune_core=trace".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(subcommand)]
        command: Commands,
        #[command(flatten)]
        logging: LoggingArgs,
    }

    #[test]
    fn test_parse_train() {
        let cli = TestCli::parse_from(["meshtune", "train", "--config", "run.toml", "--devices", "8", "-vv"]);
        assert_eq!(cli.logging.verbose, 2);
        assert_eq!(cli.logging.filter(), "meshtune_core=trace");
        match cli.command {
            Commands::Train(cmd) => {
                assert_eq!(cmd.devices, Some(8));
                assert!(!cmd.log_file);
            }
            _ => panic!("expected train"),
        }
    }

    #[test]
    fn test_explicit_filter_wins() {
        let cli = TestCli::parse_from(["meshtune", "checkpoints", "--dir", "/tmp/x", "--log-filter", "warn"]);
        assert_eq!(cli.logging.filter(), "warn");
        assert!(matches!(cli.command, Commands::Checkpoints(ref c) if !c.gc));
    }
}
