//! Optimizer settings shared by the generator and discriminator groups.

use serde::{Deserialize, Serialize};

/// Adam settings. Both parameter groups use the same values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            learning_rate: 4.5e-6,
            beta1: 0.5,
            beta2: 0.9,
            eps: 1e-8,
        }
    }
}

impl OptimConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.learning_rate > 0.0) {
            return Err(format!(
                "learning_rate must be greater than 0, got {}",
                self.learning_rate
            ));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(format!("{} must be in [0, 1), got {}", name, beta));
            }
        }
        if !(self.eps > 0.0) {
            return Err("eps must be greater than 0".into());
        }
        Ok(())
    }
}
