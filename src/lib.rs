//! meshtune: configuration-driven fine-tuning over a sharded device mesh.
//!
//! The crate plans a device [`mesh`], shards a [`params::ParameterTree`]
//! across it, optionally wraps selected layers with low-rank adapters
//! ([`lora`]), drives the [`training`] loop and persists crash-consistent
//! [`checkpoint`]s in the background.

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod lora;
pub mod mesh;
pub mod model;
pub mod optim;
pub mod params;
pub mod sharding;
pub mod tensor;
pub mod training;

// Re-export commonly used types
pub use checkpoint::{CheckpointManager, CheckpointRecord, RestoredCheckpoint};
pub use config::{CheckpointerConfig, DataConfig, RunConfig, TrainerConfig};
pub use error::{Error, Result};
pub use mesh::{Device, DeviceSet, Mesh};
pub use params::{ParamNode, ParameterTree};
pub use sharding::{PartitionSpec, Shardable, ShardedArray, ShardingRules};
pub use training::{CompletionReason, Phase, RunSummary, StopSignal, Trainer};
