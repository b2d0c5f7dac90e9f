use clap::Args;
use std::path::PathBuf;

#[derive(Args, Debug, Clone)]
pub struct CheckpointsCommand {
    /// Checkpoint directory
    #[arg(short, long, value_name = "DIR")]
    pub dir: PathBuf,

    /// Remove step directories that never received a manifest
    #[arg(long)]
    pub gc: bool,

    /// Print the listing as JSON
    #[arg(long)]
    pub json: bool,
}
