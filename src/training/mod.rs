//! Training loop, evaluation and run state.

pub mod metrics;
pub mod state;
pub mod trainer;

pub use metrics::{EvalMetrics, MemorySink, MetricsSink, StepMetrics, TracingSink};
pub use state::{CompletionReason, Phase, StopSignal, TrainState};
pub use trainer::{RunSummary, Trainer};
