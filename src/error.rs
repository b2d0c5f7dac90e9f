//! Error types for the meshtune training orchestrator.

use thiserror::Error;

/// A specialized Result type for meshtune operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for meshtune operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mesh or shape mismatch while placing arrays
    #[error("Sharding error: {0}")]
    Sharding(String),

    /// Invalid adapter operation (double merge, bad rank, ...)
    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Checkpoint corrupt: {0}")]
    CheckpointCorrupt(String),

    /// A background checkpoint write exhausted its retries
    #[error("Checkpoint write failed: {0}")]
    CheckpointWrite(String),

    /// Non-finite loss or gradient; terminates the run
    #[error("Numeric failure at step {step}: {detail}")]
    NumericFailure { step: u64, detail: String },

    /// Dataset loading or batching errors
    #[error("Data error: {0}")]
    Data(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Create a sharding error
    pub fn sharding<S: Into<String>>(msg: S) -> Self {
        Error::Sharding(msg.into())
    }

    /// Create an adapter error
    pub fn adapter<S: Into<String>>(msg: S) -> Self {
        Error::Adapter(msg.into())
    }

    /// Create a corrupt-checkpoint error
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        Error::CheckpointCorrupt(msg.into())
    }

    /// Create a data error
    pub fn data<S: Into<String>>(msg: S) -> Self {
        Error::Data(msg.into())
    }

    pub fn numeric<S: Into<String>>(step: u64, detail: S) -> Self {
        Error::NumericFailure {
            step,
            detail: detail.into(),
        }
    }

    /// Errors that must abort a run before any compute begins.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Sharding(_))
    }

    /// Restore-time errors a caller may choose to recover from with a fresh init.
    pub fn is_restore_failure(&self) -> bool {
        matches!(
            self,
            Error::CheckpointNotFound(_) | Error::CheckpointCorrupt(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(format!("background task failed: {}", err))
    }
}
