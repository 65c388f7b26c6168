//! KL-regularised convolutional autoencoder trained against a PatchGAN
//! discriminator.
//!
//! - [`DiagonalGaussianDistribution`]: latent posterior with sampling, mode and KL
//! - [`AutoencoderKl`]: encoder/decoder pair with latent projections
//! - [`NLayerDiscriminator`]: patch-level real/fake classifier
//! - [`LossCoordinator`]: reconstruction + KL + adaptive adversarial objective
//! - [`AutoencoderModule`]: the [`TrainingModule`] an outer loop drives
//!
//! # Example
//!
//! ```no_run
//! use autoencoder_kl::{AutoencoderConfig, AutoencoderModule, TrainingModule};
//! use candle_core::{Device, Tensor};
//!
//! # fn main() -> autoencoder_kl::AutoencoderResult<()> {
//! let config = AutoencoderConfig::from_file("autoencoder.toml")?.with_env_overrides();
//! let mut module = AutoencoderModule::new(&config, &Device::Cpu)?;
//! let mut optimizers = module.configure_optimizers()?;
//!
//! let batch = Tensor::zeros((4, 256, 256, 3), candle_core::DType::F32, &Device::Cpu)?;
//! let report = module.train_batch(&batch, &mut optimizers)?;
//! println!("step {} ae {} disc {}", report.global_step, report.ae_loss, report.disc_loss);
//! # Ok(())
//! # }
//! ```

pub mod autoencoder;
pub mod checkpoint;
pub mod config;
pub mod discriminator;
pub mod distribution;
pub mod error;
pub mod loss;
pub mod module;
pub mod nn;

pub use autoencoder::{get_input, AutoencoderKl};
pub use checkpoint::{restore, RestoreReport, Snapshot, STATE_DICT_ROOT};
pub use config::{AutoencoderConfig, CheckpointConfig, DdConfig, LossConfig, OptimConfig};
pub use discriminator::NLayerDiscriminator;
pub use distribution::DiagonalGaussianDistribution;
pub use error::{AutoencoderError, AutoencoderResult};
pub use loss::{
    adopt_weight, hinge_d_loss, vanilla_d_loss, DiscLossKind, LossCoordinator, LossInputs,
    LossLog, LossPhase, Split,
};
pub use module::{AutoencoderModule, OptimizerPair, StepOutput, StepReport, TrainingModule};
