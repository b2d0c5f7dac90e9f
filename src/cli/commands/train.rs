use clap::Args;
use std::path::PathBuf;

#[derive(Args, Debug, Clone)]
pub struct TrainCommand {
    /// Run configuration (TOML, YAML or JSON)
    #[arg(short, long, value_name = "FILE")]
    pub config: PathBuf,

    /// Number of local devices; defaults to trainer_config.num_tpus
    #[arg(long, value_name = "N")]
    pub devices: Option<usize>,

    /// Also write logs to <base_dir>/logs/meshtune.log
    #[arg(long)]
    pub log_file: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ValidateCommand {
    /// Run configuration (TOML, YAML or JSON)
    #[arg(short, long, value_name = "FILE")]
    pub config: PathBuf,

    /// Number of local devices to plan the mesh over
    #[arg(long, value_name = "N")]
    pub devices: Option<usize>,
}
