use crate::checkpoint::{list_checkpoints, remove_incomplete};
use crate::cli::commands::LoggingArgs;
use crate::config::RunConfig;
use crate::mesh::{DeviceSet, Mesh};
use crate::model::load_model;
use crate::sharding::ShardingRules;
use crate::training::{RunSummary, Trainer};
use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. With `log_dir`, events are also written to
/// `<log_dir>/meshtune.log`; keep the returned guard alive to flush it.
pub fn init_logging(logging: &LoggingArgs, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(logging.filter()).context("Invalid log filter")?;
    let console = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, "meshtune.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(guard)
}

fn device_set(config: &RunConfig, devices: Option<usize>) -> DeviceSet {
    DeviceSet::local(devices.unwrap_or(config.trainer_config.num_tpus))
}

/// Train until completion; Ctrl-C requests a stop at the next step boundary.
pub async fn handle_train(config: RunConfig, devices: Option<usize>) -> Result<RunSummary> {
    let devices = device_set(&config, devices);
    let mut trainer = Trainer::new(config, &devices)
        .await
        .context("Failed to initialize training run")?;

    let stop = trainer.stop_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next step boundary");
            stop.stop();
        }
    });

    let summary = trainer.run().await.context("Training failed")?;
    println!(
        "Completed at step {} (epoch {}, {:?})",
        summary.final_step, summary.epoch, summary.reason
    );
    if let Some(metrics) = &summary.last_metrics {
        println!("  last loss:  {:.4}  accuracy: {:.3}", metrics.loss, metrics.accuracy);
    }
    if let Some(eval) = &summary.last_eval {
        println!("  eval loss:  {:.4}  accuracy: {:.3}", eval.loss, eval.accuracy);
    }
    if !summary.checkpoints_saved.is_empty() {
        println!("  checkpoints: {:?}", summary.checkpoints_saved);
    }
    Ok(summary)
}

/// Check a config end to end without loading data or touching checkpoints.
pub fn handle_validate(path: &Path, devices: Option<usize>) -> Result<()> {
    let config = RunConfig::load(path)
        .with_context(|| format!("Invalid configuration {}", path.display()))?;
    let trainer = &config.trainer_config;

    let mesh = Mesh::from_config(trainer, &device_set(&config, devices)).context("Mesh planning failed")?;
    ShardingRules::from_config(trainer)
        .validate(&mesh)
        .context("Invalid sharding rules")?;
    let dp = mesh.degree(&trainer.data_parallel_axes)?;
    if config.data_config.batch_size % dp != 0 {
        anyhow::bail!(
            "batch size {} is not divisible by the data parallel degree {}",
            config.data_config.batch_size,
            dp
        );
    }
    let model = load_model(&trainer.model_name)?;

    info!("Configuration {} is valid", path.display());
    println!("model:        {}", model.name());
    println!("mesh:         {} ({} devices)", mesh, mesh.size());
    println!("data groups:  {}", dp);
    println!(
        "lora:         {}",
        if trainer.use_lora {
            format!("rank {}", trainer.lora_rank)
        } else {
            "disabled".to_string()
        }
    );
    println!("config hash:  {}", config.config_hash()?);
    Ok(())
}

/// Print durable checkpoints, optionally collecting incomplete ones first.
pub fn handle_checkpoints(dir: &Path, gc: bool, json: bool) -> Result<()> {
    if gc {
        let removed = remove_incomplete(dir)?;
        if !removed.is_empty() {
            info!("Removed incomplete checkpoints {:?}", removed);
        }
    }
    let checkpoints = list_checkpoints(dir)
        .with_context(|| format!("Failed to list checkpoints in {}", dir.display()))?;

    if json {
        let entries: Vec<serde_json::Value> = checkpoints
            .iter()
            .map(|c| {
                serde_json::json!({
                    "step": c.step,
                    "path": c.path,
                    "epoch": c.manifest.as_ref().map(|m| m.epoch),
                    "timestamp": c.manifest.as_ref().map(|m| m.timestamp),
                    "mesh": c.manifest.as_ref().map(|m| m.mesh_description()),
                    "adapter_rank": c.manifest.as_ref().and_then(|m| m.adapter_rank()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if checkpoints.is_empty() {
        println!("No durable checkpoints in {}", dir.display());
        return Ok(());
    }
    println!("{:>10}  {:>6}  {:<26}  {:<28}  ADAPTERS", "STEP", "EPOCH", "TIMESTAMP", "MESH");
    for c in &checkpoints {
        match &c.manifest {
            Some(m) => println!(
                "{:>10}  {:>6}  {:<26}  {:<28}  {}",
                c.step,
                m.epoch,
                m.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
                m.mesh_description(),
                m.adapter_rank().map(|r| format!("rank {}", r)).unwrap_or_else(|| "-".to_string())
            ),
            None => println!("{:>10}  (unreadable manifest)", c.step),
        }
    }
    Ok(())
}
