//! Training state machine.

use crate::optim::OptimizerState;
use crate::params::ParameterTree;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Phase of a training run.
///
/// `Init → (Restoring) → Running ⇄ {Evaluating, Checkpointing} → Completed`,
/// with `Failed` reachable from any phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Restoring,
    Running,
    Evaluating,
    Checkpointing,
    Completed,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::Restoring => "restoring",
            Phase::Running => "running",
            Phase::Evaluating => "evaluating",
            Phase::Checkpointing => "checkpointing",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a run reached `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// `num_steps` reached
    StepBudget,
    /// Every epoch consumed
    EpochBudget,
    /// External stop signal observed at a step boundary
    Stopped,
}

/// Mutable state threaded through the training loop.
#[derive(Debug, Clone)]
pub struct TrainState {
    /// Completed optimizer steps
    pub step: u64,
    /// Epoch of the most recent batch
    pub epoch: u64,
    pub phase: Phase,
    pub params: ParameterTree,
    pub opt_state: OptimizerState,
    /// Loss-bearing tokens seen by this process
    pub tokens_seen: u64,
}

impl TrainState {
    pub fn new(params: ParameterTree, opt_state: OptimizerState) -> Self {
        Self {
            step: 0,
            epoch: 0,
            phase: Phase::Init,
            params,
            opt_state,
            tokens_seen: 0,
        }
    }

    pub(crate) fn transition(&mut self, next: Phase) {
        if self.phase != next {
            tracing::debug!("Phase {} -> {} at step {}", self.phase, next, self.step);
            self.phase = next;
        }
    }
}

/// Cooperative stop request, observed only between steps.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
