//! Root configuration for the autoencoder and its training objective.
//!
//! # TOML Structure
//!
//! ```toml
//! embed_dim = 4
//!
//! [ddconfig]
//! ch = 128
//! ch_mult = [1, 2, 4, 4]
//!
//! [loss]
//! disc_start = 50001
//! kl_weight = 0.000001
//! disc_weight = 0.5
//!
//! [optim]
//! learning_rate = 4.5e-6
//!
//! [checkpoint]
//! path = "model.safetensors"
//! ignore_keys = ["loss"]
//! ```
//!
//! Invalid values return an error from [`AutoencoderConfig::validate`];
//! nothing is silently clamped.

mod ddconfig;
mod loss;
mod optim;

pub use ddconfig::DdConfig;
pub use loss::LossConfig;
pub use optim::OptimConfig;

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AutoencoderError, AutoencoderResult};

/// Snapshot to restore at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Safetensors snapshot path.
    pub path: PathBuf,
    /// Parameter-name prefixes to skip while restoring.
    #[serde(default)]
    pub ignore_keys: Vec<String>,
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoencoderConfig {
    /// Channels of the latent code handed to downstream models.
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,

    /// Encoder/decoder architecture.
    #[serde(default)]
    pub ddconfig: DdConfig,

    /// Loss coordinator hyperparameters.
    #[serde(default)]
    pub loss: LossConfig,

    /// Optimizer settings.
    #[serde(default)]
    pub optim: OptimConfig,

    /// Optional snapshot to restore from.
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,

    /// Label count of segmentation inputs; enables the `colorize` buffer.
    #[serde(default)]
    pub colorize_nlabels: Option<usize>,

    /// Metric the outer driver monitors for checkpoint selection.
    #[serde(default)]
    pub monitor: Option<String>,
}

fn default_embed_dim() -> usize {
    4
}

impl Default for AutoencoderConfig {
    fn default() -> Self {
        Self {
            embed_dim: default_embed_dim(),
            ddconfig: DdConfig::default(),
            loss: LossConfig::default(),
            optim: OptimConfig::default(),
            checkpoint: None,
            colorize_nlabels: None,
            monitor: None,
        }
    }
}

impl AutoencoderConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// - `AutoencoderError::IoError` if the file cannot be read
    /// - `AutoencoderError::ConfigError` if TOML parsing fails
    pub fn from_file(path: impl AsRef<Path>) -> AutoencoderResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| AutoencoderError::ConfigError {
            message: format!("Failed to parse TOML in '{}': {}", path.display(), e),
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> AutoencoderResult<Self> {
        toml::from_str(contents).map_err(|e| AutoencoderError::ConfigError {
            message: format!("Failed to parse TOML: {}", e),
        })
    }

    /// Validate every section, returning the first error found.
    pub fn validate(&self) -> AutoencoderResult<()> {
        if self.embed_dim == 0 {
            return Err(AutoencoderError::ConfigError {
                message: "embed_dim must be greater than 0".into(),
            });
        }

        self.ddconfig
            .validate()
            .map_err(|e| AutoencoderError::ConfigError {
                message: format!("[ddconfig] {}", e),
            })?;

        self.loss
            .validate()
            .map_err(|e| AutoencoderError::ConfigError {
                message: format!("[loss] {}", e),
            })?;

        self.optim
            .validate()
            .map_err(|e| AutoencoderError::ConfigError {
                message: format!("[optim] {}", e),
            })?;

        if self.colorize_nlabels == Some(0) {
            return Err(AutoencoderError::ConfigError {
                message: "colorize_nlabels must be greater than 0 when set".into(),
            });
        }

        if !self.loss.disc_conditional && self.loss.disc_in_channels != self.ddconfig.out_ch {
            return Err(AutoencoderError::ConfigError {
                message: format!(
                    "[loss] disc_in_channels {} must equal ddconfig.out_ch {} for an unconditional discriminator",
                    self.loss.disc_in_channels, self.ddconfig.out_ch
                ),
            });
        }

        Ok(())
    }

    /// Apply environment variable overrides. Prefix: `AUTOENCODER_`
    ///
    /// | Variable | Config Path | Type |
    /// |----------|-------------|------|
    /// | `AUTOENCODER_LEARNING_RATE` | `optim.learning_rate` | f64 |
    /// | `AUTOENCODER_DISC_START` | `loss.disc_start` | usize |
    /// | `AUTOENCODER_KL_WEIGHT` | `loss.kl_weight` | f64 |
    /// | `AUTOENCODER_CKPT_PATH` | `checkpoint.path` | path |
    ///
    /// Unparsable values are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = env::var("AUTOENCODER_LEARNING_RATE") {
            if let Ok(lr) = val.parse::<f64>() {
                self.optim.learning_rate = lr;
            }
        }
        if let Ok(val) = env::var("AUTOENCODER_DISC_START") {
            if let Ok(step) = val.parse::<usize>() {
                self.loss.disc_start = step;
            }
        }
        if let Ok(val) = env::var("AUTOENCODER_KL_WEIGHT") {
            if let Ok(w) = val.parse::<f64>() {
                self.loss.kl_weight = w;
            }
        }
        if let Ok(val) = env::var("AUTOENCODER_CKPT_PATH") {
            match self.checkpoint.as_mut() {
                Some(ckpt) => ckpt.path = PathBuf::from(val),
                None => {
                    self.checkpoint = Some(CheckpointConfig {
                        path: PathBuf::from(val),
                        ignore_keys: Vec::new(),
                    })
                }
            }
        }
        self
    }
}
