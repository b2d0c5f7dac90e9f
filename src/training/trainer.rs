//! The training loop.
//!
//! Each step is a barrier: the global batch is split across the
//! data-parallel groups of the mesh, every group runs forward/backward on its
//! micro-batch concurrently, gradients are averaged over loss-bearing tokens
//! and a single optimizer update is applied before the next batch is drawn.
//! Checkpoints receive a copy of the state, so the next step never races a
//! background write.

use super::metrics::{EvalMetrics, MetricsSink, StepMetrics, TracingSink};
use super::state::{CompletionReason, Phase, StopSignal, TrainState};
use crate::checkpoint::{check_config_hash, CheckpointManager, CheckpointRecord, RestoredCheckpoint};
use crate::config::RunConfig;
use crate::data::{self, eval_batches, train_test_split, Batch, BatchLoader, DatasetSource};
use crate::error::{Error, Result};
use crate::lora::{self, LoRAConfig};
use crate::mesh::{DeviceSet, Mesh};
use crate::model::{load_model, CausalModel, ModelOutput};
use crate::optim::{Adam, OptimizerState};
use crate::params::{ParamNode, ParameterTree};
use crate::sharding::{Shardable, ShardingRules};
use crate::tensor::{DType, Tensor};
use chrono::Utc;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Outcome of [`Trainer::run`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub final_step: u64,
    pub epoch: u64,
    pub reason: CompletionReason,
    pub last_metrics: Option<StepMetrics>,
    pub last_eval: Option<EvalMetrics>,
    /// Steps this run handed to the checkpointer
    pub checkpoints_saved: Vec<u64>,
}

/// Drives one configured training run.
pub struct Trainer {
    config: RunConfig,
    config_hash: String,
    mesh: Mesh,
    rules: ShardingRules,
    model: Arc<dyn CausalModel>,
    adam: Adam,
    state: TrainState,
    loader: BatchLoader,
    eval_set: Vec<Batch>,
    checkpointer: CheckpointManager,
    sink: Arc<dyn MetricsSink>,
    stop: StopSignal,
    dp_degree: usize,
}

impl Trainer {
    /// Build a trainer reading examples from `data_config.data_source`.
    pub async fn new(config: RunConfig, devices: &DeviceSet) -> Result<Self> {
        let source = data::source_for(&config.data_config);
        Self::with_source(config, devices, source.as_ref()).await
    }

    /// `Init` (and `Restoring` when requested): validate the config, build the
    /// mesh, the parameter tree and the optimizer state, load the data.
    pub async fn with_source(config: RunConfig, devices: &DeviceSet, source: &dyn DatasetSource) -> Result<Self> {
        config.validate()?;
        let trainer_cfg = &config.trainer_config;
        let data_cfg = &config.data_config;

        let mesh = Mesh::from_config(trainer_cfg, devices)?;
        let rules = ShardingRules::from_config(trainer_cfg);
        rules.validate(&mesh)?;
        let dp_degree = mesh.degree(&trainer_cfg.data_parallel_axes)?;
        if data_cfg.batch_size % dp_degree != 0 {
            return Err(Error::sharding(format!(
                "batch size {} is not divisible by the data parallel degree {} of mesh {}",
                data_cfg.batch_size, dp_degree, mesh
            )));
        }

        let model = load_model(&trainer_cfg.model_name)?;
        info!("Loaded model {} (vocab {})", model.name(), model.vocab_size());

        let examples = source.load(&data_cfg.split, data_cfg.max_examples).await?;
        info!("Loaded {} examples from {}", examples.len(), source.name());
        let split = train_test_split(examples, data_cfg.train_test_split, data_cfg.seed)?;
        let loader = BatchLoader::new(split.train, data_cfg, trainer_cfg.num_epochs)?;
        let eval_set = eval_batches(&split.test, data_cfg, trainer_cfg.eval_max_batches)?;
        info!(
            "{} batches per epoch, {} held-out batches",
            loader.batches_per_epoch(),
            eval_set.len()
        );

        let mut rng = ChaCha8Rng::seed_from_u64(trainer_cfg.seed);
        let base = model.init_parameters(&mut rng);
        let lora_config = LoRAConfig::from_trainer_config(trainer_cfg);

        let checkpointer = CheckpointManager::new(&config.checkpointer_config)?;
        let config_hash = config.config_hash()?;

        let mut restored = None;
        if trainer_cfg.restore_checkpoint {
            info!("Restoring from {}", checkpointer.directory().display());
            match checkpointer.restore(trainer_cfg.restore_step, &mesh, &rules).await {
                Ok(checkpoint) => restored = Some(checkpoint),
                Err(e) if e.is_restore_failure() && config.checkpointer_config.fallback_to_fresh_init => {
                    warn!("Restore failed ({}), starting from fresh weights", e);
                }
                Err(e) => return Err(e),
            }
        }

        let state = match restored {
            Some(checkpoint) => {
                let mut state = Self::resume_state(
                    checkpoint,
                    &base,
                    lora_config.as_ref(),
                    model.as_ref(),
                    &mesh,
                    &rules,
                    &config_hash,
                    &mut rng,
                )?;
                state.transition(Phase::Restoring);
                state
            }
            None => {
                let params = Self::fresh_params(
                    &base,
                    trainer_cfg.param_dtype,
                    lora_config.as_ref(),
                    model.as_ref(),
                    &mesh,
                    &rules,
                    &mut rng,
                )?;
                let opt_state = OptimizerState::zeros(&params, &mesh)?;
                TrainState::new(params, opt_state)
            }
        };

        info!(
            "{} parameters, {} trainable{}",
            state.params.num_parameters(),
            state.params.num_trainable(),
            if state.params.has_adapters() { " (adapters only)" } else { "" }
        );

        Ok(Self {
            adam: Adam::from_config(trainer_cfg),
            config_hash,
            mesh,
            rules,
            model,
            state,
            loader,
            eval_set,
            checkpointer,
            sink: Arc::new(TracingSink),
            stop: StopSignal::new(),
            dp_degree,
            config,
        })
    }

    fn fresh_params(
        base: &BTreeMap<String, Tensor>,
        dtype: DType,
        lora_config: Option<&LoRAConfig>,
        model: &dyn CausalModel,
        mesh: &Mesh,
        rules: &ShardingRules,
        rng: &mut ChaCha8Rng,
    ) -> Result<ParameterTree> {
        let tree = ParameterTree::from_tensors(base, mesh, rules, dtype, true)?;
        match lora_config {
            Some(lora_config) => lora::inject_adapters(&tree, &model.adaptable_layers(), lora_config, mesh, rules, rng),
            None => Ok(tree),
        }
    }

    /// Reconcile a restored checkpoint with the current adapter settings.
    #[allow(clippy::too_many_arguments)]
    fn resume_state(
        checkpoint: RestoredCheckpoint,
        base: &BTreeMap<String, Tensor>,
        lora_config: Option<&LoRAConfig>,
        model: &dyn CausalModel,
        mesh: &Mesh,
        rules: &ShardingRules,
        config_hash: &str,
        rng: &mut ChaCha8Rng,
    ) -> Result<TrainState> {
        check_config_hash(&checkpoint.manifest, config_hash);
        check_model_shapes(&checkpoint.params, base)?;

        let stored_rank = checkpoint.manifest.adapter_rank();
        let (params, opt_state) = match (stored_rank, lora_config) {
            (Some(rank), Some(lora_config)) => {
                if rank != lora_config.rank {
                    return Err(Error::config(format!(
                        "checkpoint at step {} has adapters of rank {}, configured rank is {}",
                        checkpoint.step, rank, lora_config.rank
                    )));
                }
                (checkpoint.params, checkpoint.opt_state)
            }
            (Some(rank), None) => {
                info!("Merging rank-{} adapters of step {} into base weights", rank, checkpoint.step);
                let params = lora::into_dense(&checkpoint.params, mesh)?;
                let opt_state = OptimizerState::zeros(&params, mesh)?;
                (params, opt_state)
            }
            (None, Some(lora_config)) => {
                info!(
                    "Checkpoint at step {} has no adapters, injecting fresh rank-{} adapters",
                    checkpoint.step, lora_config.rank
                );
                let params = lora::inject_adapters(
                    &checkpoint.params,
                    &model.adaptable_layers(),
                    lora_config,
                    mesh,
                    rules,
                    rng,
                )?;
                let opt_state = OptimizerState::zeros(&params, mesh)?;
                (params, opt_state)
            }
            (None, None) => (checkpoint.params, checkpoint.opt_state),
        };
        opt_state.check_matches(&params)?;

        let mut state = TrainState::new(params, opt_state);
        state.step = checkpoint.step;
        state.epoch = checkpoint.epoch;
        Ok(state)
    }

    /// Replace the default tracing sink.
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Handle that requests a stop at the next step boundary.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn state(&self) -> &TrainState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn params(&self) -> &ParameterTree {
        &self.state.params
    }

    pub fn rules(&self) -> &ShardingRules {
        &self.rules
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn checkpointer(&self) -> &CheckpointManager {
        &self.checkpointer
    }

    /// Dense weights with adapters folded in, for export.
    pub fn merged_weights(&self) -> Result<BTreeMap<String, Tensor>> {
        lora::merged_weights(&self.state.params)
    }

    /// Last step the run may reach.
    fn step_budget(&self) -> u64 {
        let batches = self.loader.total_batches();
        match self.config.trainer_config.num_steps {
            Some(steps) => steps.min(batches),
            None => batches,
        }
    }

    /// Run until the step or epoch budget is exhausted or a stop is requested.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let budget = self.step_budget();
        let trainer_cfg = self.config.trainer_config.clone();
        let save_interval = self.config.checkpointer_config.save_interval_steps;

        let mut summary = RunSummary {
            final_step: self.state.step,
            epoch: self.state.epoch,
            reason: CompletionReason::EpochBudget,
            last_metrics: None,
            last_eval: None,
            checkpoints_saved: Vec::new(),
        };

        let start = self.loader.position_for_step(self.state.step);
        let mut batches = self.loader.spawn(start);
        self.state.transition(Phase::Running);
        info!(
            "Training from step {} to {} on mesh {} ({} data parallel groups)",
            self.state.step, budget, self.mesh, self.dp_degree
        );

        let reason = loop {
            if self.state.step >= budget {
                break match trainer_cfg.num_steps {
                    Some(steps) if steps <= self.state.step => CompletionReason::StepBudget,
                    _ => CompletionReason::EpochBudget,
                };
            }
            if self.stop.is_stopped() {
                info!("Stop requested, halting after step {}", self.state.step);
                break CompletionReason::Stopped;
            }
            let loaded = match batches.recv().await {
                Some(item) => item,
                None => break CompletionReason::EpochBudget,
            };
            let loaded = match loaded {
                Ok(loaded) => loaded,
                Err(e) => return self.fail(e).await,
            };

            let step = self.state.step + 1;
            let metrics = match self.train_step(step, loaded.position.epoch, &loaded.batch) {
                Ok(metrics) => metrics,
                Err(e) => return self.fail(e).await,
            };
            self.state.step = step;
            self.state.epoch = loaded.position.epoch;
            self.state.tokens_seen += metrics.tokens as u64;
            debug!("step {} loss {:.4}", step, metrics.loss);

            if step % trainer_cfg.log_interval == 0 {
                self.sink.log_step(&metrics);
            }
            if step % trainer_cfg.eval_interval == 0 {
                self.state.transition(Phase::Evaluating);
                let eval = match self.evaluate(step) {
                    Ok(eval) => eval,
                    Err(e) => return self.fail(e).await,
                };
                self.sink.log_eval(&eval);
                summary.last_eval = Some(eval);
                self.state.transition(Phase::Running);
            }
            if step % save_interval == 0 {
                self.state.transition(Phase::Checkpointing);
                if let Err(e) = self.save(Some(metrics.clone())).await {
                    return self.fail(e).await;
                }
                summary.checkpoints_saved.push(step);
                self.state.transition(Phase::Running);
            }
            summary.last_metrics = Some(metrics);

            // Let the checkpoint worker make progress between barriers
            tokio::task::yield_now().await;
        };
        drop(batches);

        // An in-flight checkpoint is never abandoned
        if let Err(e) = self.checkpointer.wait_until_finished().await {
            self.state.transition(Phase::Failed);
            error!("Checkpoint persistence failed: {}", e);
            return Err(e);
        }
        self.state.transition(Phase::Completed);

        summary.final_step = self.state.step;
        summary.epoch = self.state.epoch;
        summary.reason = reason;
        info!(
            "Training completed at step {} ({:?}), {} tokens seen",
            self.state.step, reason, self.state.tokens_seen
        );
        Ok(summary)
    }

    /// Enter `Failed` after flushing whatever the checkpointer already holds.
    async fn fail<T>(&mut self, err: Error) -> Result<T> {
        self.state.transition(Phase::Failed);
        error!("Training failed at step {}: {}", self.state.step, err);
        if let Err(flush) = self.checkpointer.wait_until_finished().await {
            error!("Checkpoint flush after failure also failed: {}", flush);
        }
        Err(err)
    }

    /// Hand a snapshot of the current state to the checkpointer.
    pub async fn save(&mut self, metrics: Option<StepMetrics>) -> Result<()> {
        let record = CheckpointRecord {
            step: self.state.step,
            epoch: self.state.epoch,
            params: self.state.params.clone(),
            opt_state: self.state.opt_state.clone(),
            mesh: self.mesh.clone(),
            timestamp: Utc::now(),
            config_hash: self.config_hash.clone(),
            metrics,
        };
        self.checkpointer.save(record).await
    }

    /// One synchronous step over the whole mesh.
    fn train_step(&mut self, step: u64, epoch: u64, batch: &Batch) -> Result<StepMetrics> {
        let started = Instant::now();
        let dtype = self.config.trainer_config.compute_dtype;
        let weights = lora::effective_weights(&self.state.params, dtype)?;
        let shards = batch.split(self.dp_degree)?;
        let output = run_groups(self.model.as_ref(), &weights, &shards, dtype, true)?;

        let loss = output.mean_loss();
        if !loss.is_finite() {
            return Err(Error::numeric(step, format!("loss is {}", loss)));
        }
        let tokens = output.token_count;
        let accuracy = output.accuracy();
        let scale = output.grad_scale();
        let grads: BTreeMap<String, Tensor> = output
            .grads
            .into_iter()
            .map(|(path, grad)| (path, grad.scale(scale)))
            .collect();

        let routed = lora::route_gradients(&self.state.params, grads)?;
        let update = self
            .adam
            .apply(&mut self.state.params, &mut self.state.opt_state, &routed, &self.mesh, step)?;
        if update.clipped {
            debug!("step {}: clipped gradient norm {:.4}", step, update.grad_norm);
        }

        Ok(StepMetrics {
            step,
            epoch,
            loss: loss as f32,
            accuracy: accuracy as f32,
            learning_rate: self.adam.lr,
            grad_norm: update.grad_norm,
            tokens,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Forward-only pass over the held-out batches.
    pub fn evaluate(&self, step: u64) -> Result<EvalMetrics> {
        let started = Instant::now();
        let dtype = self.config.trainer_config.compute_dtype;
        let weights = lora::effective_weights(&self.state.params, dtype)?;

        let mut total = ModelOutput::default();
        for batch in &self.eval_set {
            // The trailing held-out batch may not split evenly
            let shards = match batch.split(self.dp_degree) {
                Ok(shards) => shards,
                Err(_) => vec![batch.clone()],
            };
            total.accumulate(run_groups(self.model.as_ref(), &weights, &shards, dtype, false)?)?;
        }
        let loss = total.mean_loss();
        if !loss.is_finite() {
            return Err(Error::numeric(step, format!("eval loss is {}", loss)));
        }
        Ok(EvalMetrics {
            step,
            loss: loss as f32,
            accuracy: total.accuracy() as f32,
            batches: self.eval_set.len(),
            tokens: total.token_count,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Run every micro-batch on its own thread and sum the results.
fn run_groups(
    model: &dyn CausalModel,
    weights: &BTreeMap<String, Tensor>,
    shards: &[Batch],
    dtype: DType,
    with_grads: bool,
) -> Result<ModelOutput> {
    let outputs: Vec<Result<ModelOutput>> = std::thread::scope(|scope| {
        let handles: Vec<_> = shards
            .iter()
            .map(|shard| {
                scope.spawn(move || {
                    if with_grads {
                        model.forward_backward(weights, shard, dtype)
                    } else {
                        model.forward(weights, shard, dtype)
                    }
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::Internal("data parallel worker panicked".to_string())))
            })
            .collect()
    });

    let mut total = ModelOutput::default();
    for output in outputs {
        total.accumulate(output?)?;
    }
    Ok(total)
}

/// Every model weight is present in `params` with the shape the model expects.
fn check_model_shapes(params: &ParameterTree, expected: &BTreeMap<String, Tensor>) -> Result<()> {
    for (path, tensor) in expected {
        let shape = match params.get(path) {
            Some(ParamNode::Dense(leaf)) => leaf.shape().to_vec(),
            Some(ParamNode::Adapted(adapted)) => adapted.base.shape().to_vec(),
            None => {
                return Err(Error::config(format!(
                    "checkpoint has no weight '{}' for the configured model",
                    path
                )))
            }
        };
        if shape != tensor.shape() {
            return Err(Error::config(format!(
                "checkpoint weight '{}' has shape {:?}, model expects {:?}",
                path,
                shape,
                tensor.shape()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::list_checkpoints;
    use crate::data::{Example, InMemorySource};

    fn config(dir: &std::path::Path) -> RunConfig {
        RunConfig::from_toml_str(&format!(
            r#"
            [data_config]
            data_source = "in-memory"
            batch_size = 2
            max_seq_length = 6

            [trainer_config]
            model_name = "tiny-causal-lm:16x8"
            num_tpus = 2
            mesh_shape = [1, 1, 2]
            num_steps = 4
            lora_rank = 2

            [checkpointer_config]
            checkpoint_dir = "{}"
            save_interval_steps = 1
            "#,
            dir.display()
        ))
        .unwrap()
    }

    async fn trainer(dir: &std::path::Path) -> Trainer {
        let examples = (0..12u32)
            .map(|i| Example::new(vec![i % 16], vec![(i + 1) % 16, (i + 2) % 16]))
            .collect();
        Trainer::with_source(config(dir), &DeviceSet::local(2), &InMemorySource::new(examples))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_non_finite_loss_fails_without_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = trainer(dir.path()).await;
        assert_eq!(trainer.phase(), Phase::Init);

        let mesh = trainer.mesh.clone();
        let leaf = trainer.state.params.leaf_mut(crate::model::tiny::EMBED).unwrap();
        let poisoned = leaf.value().map(|_| f32::NAN);
        leaf.set_value(&poisoned, &mesh).unwrap();

        let err = trainer.run().await.unwrap_err();
        assert!(matches!(err, Error::NumericFailure { step: 1, .. }), "{}", err);
        assert_eq!(trainer.phase(), Phase::Failed);
        assert_eq!(trainer.state().step, 0);
        assert!(list_checkpoints(dir.path()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_step_budget_and_every_step_saved() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = trainer(dir.path()).await;
        assert_eq!(trainer.step_budget(), 4);
        let summary = trainer.run().await.unwrap();
        assert_eq!(summary.checkpoints_saved, vec![1, 2, 3, 4]);
        assert_eq!(trainer.checkpointer().last_durable_step(), Some(4));
        let steps: Vec<u64> = list_checkpoints(dir.path()).unwrap().iter().map(|c| c.step).collect();
        assert_eq!(steps, vec![2, 3, 4]);
    }
}
