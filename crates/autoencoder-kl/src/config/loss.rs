//! Loss coordinator hyperparameters.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::loss::DiscLossKind;

/// Hyperparameters of the reconstruction / KL / adversarial objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Global step at which the adversarial terms switch on.
    pub disc_start: usize,
    /// Initial value of the learnable NLL calibration scalar.
    pub logvar_init: f64,
    /// Weight of the KL term in the generator loss.
    pub kl_weight: f64,
    /// Number of stride-2 blocks in the discriminator.
    pub disc_num_layers: usize,
    /// Channels fed to the discriminator (image channels, plus conditioning if any).
    pub disc_in_channels: usize,
    /// Base filter width of the discriminator.
    pub disc_ndf: usize,
    /// Adversarial gate value once `disc_start` is reached.
    pub disc_factor: f64,
    /// Scale applied to the adaptive discriminator weight.
    pub disc_weight: f64,
    /// Discriminator sees a conditioning tensor concatenated on the channel axis.
    pub disc_conditional: bool,
    /// `hinge` or `vanilla`.
    pub disc_loss: String,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            disc_start: 50_001,
            logvar_init: 0.0,
            kl_weight: 1.0,
            disc_num_layers: 3,
            disc_in_channels: 3,
            disc_ndf: 64,
            disc_factor: 1.0,
            disc_weight: 1.0,
            disc_conditional: false,
            disc_loss: "hinge".to_string(),
        }
    }
}

impl LossConfig {
    /// Parsed discriminator loss variant.
    pub fn disc_loss_kind(&self) -> Result<DiscLossKind, String> {
        DiscLossKind::from_str(&self.disc_loss).map_err(|e| e.to_string())
    }

    pub fn validate(&self) -> Result<(), String> {
        self.disc_loss_kind()?;
        if self.disc_num_layers == 0 {
            return Err("disc_num_layers must be at least 1".into());
        }
        if self.disc_in_channels == 0 || self.disc_ndf == 0 {
            return Err("disc_in_channels and disc_ndf must be greater than 0".into());
        }
        if self.kl_weight < 0.0 || self.disc_factor < 0.0 || self.disc_weight < 0.0 {
            return Err("kl_weight, disc_factor and disc_weight must be non-negative".into());
        }
        if !self.logvar_init.is_finite() {
            return Err("logvar_init must be finite".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = LossConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.disc_loss_kind().unwrap(), DiscLossKind::Hinge);
    }

    #[test]
    fn test_rejects_unknown_loss() {
        let config = LossConfig {
            disc_loss: "least_squares".into(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("least_squares"));
    }

    #[test]
    fn test_rejects_negative_weight() {
        let config = LossConfig {
            kl_weight: -1e-6,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
