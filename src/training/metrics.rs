//! Metrics handed to the logging collaborator.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Statistics of one optimizer step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step: u64,
    pub epoch: u64,
    /// Mean masked cross-entropy over the global batch
    pub loss: f32,
    pub accuracy: f32,
    pub learning_rate: f64,
    /// Global gradient norm before clipping
    pub grad_norm: f64,
    /// Loss-bearing tokens in the batch
    pub tokens: usize,
    /// Wall clock of the step
    pub elapsed_ms: u64,
}

/// Aggregate over the held-out batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub step: u64,
    pub loss: f32,
    pub accuracy: f32,
    pub batches: usize,
    pub tokens: usize,
    pub elapsed_ms: u64,
}

/// Receives metrics at the configured intervals.
pub trait MetricsSink: Send + Sync {
    fn log_step(&self, metrics: &StepMetrics);

    fn log_eval(&self, metrics: &EvalMetrics);
}

/// Emits metrics as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn log_step(&self, m: &StepMetrics) {
        info!(
            step = m.step,
            epoch = m.epoch,
            "loss={:.4} acc={:.3} grad_norm={:.4} lr={:e} tokens={} ({} ms)",
            m.loss,
            m.accuracy,
            m.grad_norm,
            m.learning_rate,
            m.tokens,
            m.elapsed_ms
        );
    }

    fn log_eval(&self, m: &EvalMetrics) {
        info!(
            step = m.step,
            "eval loss={:.4} acc={:.3} over {} batches ({} ms)",
            m.loss,
            m.accuracy,
            m.batches,
            m.elapsed_ms
        );
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    steps: Mutex<Vec<StepMetrics>>,
    evals: Mutex<Vec<EvalMetrics>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> Vec<StepMetrics> {
        self.steps.lock().clone()
    }

    pub fn evals(&self) -> Vec<EvalMetrics> {
        self.evals.lock().clone()
    }
}

impl MetricsSink for MemorySink {
    fn log_step(&self, metrics: &StepMetrics) {
        self.steps.lock().push(metrics.clone());
    }

    fn log_eval(&self, metrics: &EvalMetrics) {
        self.evals.lock().push(metrics.clone());
    }
}
