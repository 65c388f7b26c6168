//! Error types for autoencoder operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building, restoring or training the autoencoder.
#[derive(Debug, Error)]
pub enum AutoencoderError {
    /// Configuration validation or parsing failed.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Discriminator loss variant is not one of the recognised names.
    #[error("Unknown discriminator loss '{name}': expected 'hinge' or 'vanilla'")]
    UnknownDiscLoss { name: String },

    /// Two tensors that must agree on shape do not.
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Latent moments cannot be split into mean and log-variance halves.
    #[error("Latent moments must have an even channel count, got {channels}")]
    OddLatentChannels { channels: usize },

    /// Conditioning tensor presence disagrees with the conditional flag.
    #[error("Conditioning mismatch: discriminator conditional={conditional}, conditioning supplied={supplied}")]
    ConditioningMismatch { conditional: bool, supplied: bool },

    /// Optimizer phase index outside {0, 1}.
    #[error("Invalid optimizer phase index {index}: expected 0 (generator) or 1 (discriminator)")]
    InvalidPhase { index: usize },

    /// A loss has no differentiable path to the requested parameter.
    #[error("No gradient path from loss to '{target}'")]
    NoGradientPath { target: String },

    /// Snapshot exists but is malformed.
    #[error("Checkpoint error at {}: {message}", path.display())]
    CheckpointError { path: PathBuf, message: String },

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Tensor backend failure.
    #[error("Tensor operation failed: {message}")]
    TensorError { message: String },
}

impl From<candle_core::Error> for AutoencoderError {
    fn from(err: candle_core::Error) -> Self {
        AutoencoderError::TensorError {
            message: err.to_string(),
        }
    }
}

/// Result type for autoencoder operations.
pub type AutoencoderResult<T> = Result<T, AutoencoderError>;
