//! Error types for the EMG experiment workspace.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for EMG experiments.
///
/// None of these are recovered from inside a cross-validation run: the first
/// error aborts the remaining folds and surfaces to the caller unchanged.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid fold count, too few groups, missing required parameters
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Sample index artifact missing or corrupt and no preparer available
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    /// The training driver failed during fit or test
    #[error("Training error: {0}")]
    Training(String),

    /// Persisting or reloading a checkpoint failed
    #[error("Checkpoint I/O error at {path}: {message}")]
    CheckpointIo { path: PathBuf, message: String },

    /// Model construction or shape mismatch
    #[error("Model error: {0}")]
    Model(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Builds a [`Error::CheckpointIo`] from any displayable cause
    pub fn checkpoint_io(path: impl Into<PathBuf>, cause: impl std::fmt::Display) -> Self {
        Error::CheckpointIo {
            path: path.into(),
            message: cause.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Specialized Result type for EMG experiment operations.
pub type Result<T> = std::result::Result<T, Error>;
