//! Adversarial VAE objective.
//!
//! [`LossCoordinator`] owns the discriminator and the learnable calibration
//! log-variance and computes either the generator (phase 0) or the
//! discriminator (phase 1) loss for one step.

mod coordinator;
mod disc_loss;
mod log;

pub use coordinator::{LossCoordinator, LossInputs, LossPhase, Split, ADAPTIVE_WEIGHT_MAX};
pub use disc_loss::{adopt_weight, hinge_d_loss, softplus, vanilla_d_loss, DiscLossKind};
pub use log::LossLog;
