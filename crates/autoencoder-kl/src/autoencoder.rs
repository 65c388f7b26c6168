//! KL-regularised autoencoder: encoder → `quant_conv` → posterior, and
//! latent → `post_quant_conv` → decoder.

use std::fmt;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{conv2d, Conv2d, VarBuilder, VarMap};
use tracing::info;

use crate::checkpoint::{named_vars, restore, RestoreReport, Snapshot};
use crate::config::{AutoencoderConfig, DdConfig};
use crate::distribution::DiagonalGaussianDistribution;
use crate::error::{AutoencoderError, AutoencoderResult};
use crate::nn::{Decoder, Encoder};

/// Checkpoint name of the segmentation colour projection.
pub const COLORIZE_KEY: &str = "colorize";

/// Convert a channels-last batch `(B, H, W, C)` or `(B, H, W)` into a
/// contiguous `(B, C, H, W)` f32 tensor.
pub fn get_input(batch: &Tensor) -> AutoencoderResult<Tensor> {
    let x = match batch.rank() {
        3 => batch.unsqueeze(3)?,
        4 => batch.clone(),
        _ => {
            return Err(AutoencoderError::ShapeMismatch {
                context: "input batch (expected B,H,W[,C])".into(),
                expected: vec![0, 0, 0, 0],
                actual: batch.dims().to_vec(),
            })
        }
    };
    Ok(x.permute((0, 3, 1, 2))?.contiguous()?.to_dtype(DType::F32)?)
}

/// KL-regularized convolutional autoencoder.
///
/// Clones share parameter storage with the original.
#[derive(Clone)]
pub struct AutoencoderKl {
    encoder: Encoder,
    decoder: Decoder,
    quant_conv: Conv2d,
    post_quant_conv: Conv2d,
    embed_dim: usize,
    ddconfig: DdConfig,
    varmap: VarMap,
    /// `(3, nlabels, 1, 1)` projection for segmentation maps; a buffer, not trained.
    colorize: Option<Var>,
    monitor: Option<String>,
    device: Device,
}

impl fmt::Debug for AutoencoderKl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoencoderKl")
            .field("embed_dim", &self.embed_dim)
            .field("ddconfig", &self.ddconfig)
            .field("colorize", &self.colorize.is_some())
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}

impl AutoencoderKl {
    /// Build freshly initialised networks. Does not touch `config.checkpoint`.
    pub fn new(config: &AutoencoderConfig, device: &Device) -> AutoencoderResult<Self> {
        config.validate()?;
        let dd = &config.ddconfig;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let encoder = Encoder::new(dd, vb.pp("encoder"))?;
        let decoder = Decoder::new(dd, vb.pp("decoder"))?;
        let quant_conv = conv2d(
            2 * dd.z_channels,
            2 * config.embed_dim,
            1,
            Default::default(),
            vb.pp("quant_conv"),
        )?;
        let post_quant_conv = conv2d(
            config.embed_dim,
            dd.z_channels,
            1,
            Default::default(),
            vb.pp("post_quant_conv"),
        )?;

        let colorize = match config.colorize_nlabels {
            Some(n) => Some(Var::randn(0f32, 1f32, (3, n, 1, 1), device)?),
            None => None,
        };

        let model = Self {
            encoder,
            decoder,
            quant_conv,
            post_quant_conv,
            embed_dim: config.embed_dim,
            ddconfig: dd.clone(),
            varmap,
            colorize,
            monitor: config.monitor.clone(),
            device: device.clone(),
        };
        info!(
            target: "autoencoder_kl::autoencoder",
            embed_dim = model.embed_dim,
            downsample_factor = dd.downsample_factor(),
            parameters = model.num_parameters()?,
            "Built autoencoder"
        );
        Ok(model)
    }

    /// Posterior over latents for an NCHW image batch.
    pub fn encode(&self, x: &Tensor) -> AutoencoderResult<DiagonalGaussianDistribution> {
        let dims = x.dims();
        if dims.len() != 4 || dims[1] != self.ddconfig.in_channels {
            return Err(AutoencoderError::ShapeMismatch {
                context: "encoder input".into(),
                expected: vec![dims.first().copied().unwrap_or(0), self.ddconfig.in_channels],
                actual: dims.to_vec(),
            });
        }
        let h = self.encoder.forward(x)?;
        let moments = h.apply(&self.quant_conv)?;
        DiagonalGaussianDistribution::new(&moments, false)
    }

    pub fn decode(&self, z: &Tensor) -> AutoencoderResult<Tensor> {
        let dims = z.dims();
        if dims.len() != 4 || dims[1] != self.embed_dim {
            return Err(AutoencoderError::ShapeMismatch {
                context: "latent code".into(),
                expected: vec![dims.first().copied().unwrap_or(0), self.embed_dim],
                actual: dims.to_vec(),
            });
        }
        let z = z.apply(&self.post_quant_conv)?;
        self.decoder.forward(&z)
    }

    /// Encode, take a sample (or the mode), decode.
    pub fn forward(
        &self,
        x: &Tensor,
        sample_posterior: bool,
    ) -> AutoencoderResult<(Tensor, DiagonalGaussianDistribution)> {
        let posterior = self.encode(x)?;
        let z = if sample_posterior {
            posterior.sample()?
        } else {
            posterior.mode().clone()
        };
        let dec = self.decode(&z)?;
        Ok((dec, posterior))
    }

    /// Decoder final convolution weight.
    pub fn get_last_layer(&self) -> &Tensor {
        self.decoder.conv_out_weight()
    }

    /// Project an `nlabels`-channel segmentation map to RGB in [-1, 1].
    ///
    /// # Errors
    /// `ConfigError` if the model was built without `colorize_nlabels`.
    pub fn to_rgb(&self, x: &Tensor) -> AutoencoderResult<Tensor> {
        let colorize = self
            .colorize
            .as_ref()
            .ok_or_else(|| AutoencoderError::ConfigError {
                message: "to_rgb requires colorize_nlabels to be configured".into(),
            })?;
        let x = x.conv2d(colorize.as_tensor(), 0, 1, 1, 1)?;
        let flat = x.flatten_all()?;
        let min = flat.min(0)?;
        let max = flat.max(0)?;
        let range = (max - &min)?;
        let scaled = x.broadcast_sub(&min)?.broadcast_div(&range)?;
        Ok(scaled.affine(2.0, -1.0)?)
    }

    /// Trainable parameters, sorted by checkpoint name.
    pub fn named_parameters(&self) -> AutoencoderResult<Vec<(String, Var)>> {
        named_vars(&self.varmap)
    }

    /// Non-trainable tensors that still travel with checkpoints.
    pub fn named_buffers(&self) -> Vec<(String, Var)> {
        self.colorize
            .iter()
            .map(|c| (COLORIZE_KEY.to_string(), c.clone()))
            .collect()
    }

    /// The generator optimizer group.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn num_parameters(&self) -> AutoencoderResult<usize> {
        Ok(self
            .named_parameters()?
            .iter()
            .map(|(_, v)| v.as_tensor().elem_count())
            .sum())
    }

    /// Restore parameters and buffers from a snapshot, skipping keys that
    /// start with any of `ignore_keys`.
    pub fn init_from_ckpt(
        &self,
        path: impl AsRef<Path>,
        ignore_keys: &[String],
    ) -> AutoencoderResult<RestoreReport> {
        let snapshot = Snapshot::load(path, &self.device)?;
        let mut targets = self.named_parameters()?;
        targets.extend(self.named_buffers());
        restore(&snapshot, ignore_keys, &targets)
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn ddconfig(&self) -> &DdConfig {
        &self.ddconfig
    }

    pub fn colorize(&self) -> Option<&Tensor> {
        self.colorize.as_ref().map(|v| v.as_tensor())
    }

    pub fn monitor(&self) -> Option<&str> {
        self.monitor.as_deref()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}
