//! PatchGAN discriminator.
//!
//! Emits a spatial map of real/fake logits rather than one scalar per image,
//! so adversarial feedback stays local. Layer composition:
//!
//! ```text
//! conv(s=2) → lrelu
//! [conv(s=2, no bias) → batchnorm → lrelu] × (n_layers - 1)    width ×2, capped at 8·ndf
//! conv(s=1, no bias) → batchnorm → lrelu
//! conv(s=1) → 1 channel
//! ```
//!
//! Parameters are named `main.{k}.…` after their position in that sequence.

use std::fmt;

use candle_core::{DType, Device, ModuleT, Tensor, Var};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Init, VarBuilder, VarMap};
use tracing::info;

use crate::checkpoint::named_vars;
use crate::error::{AutoencoderError, AutoencoderResult};

const KERNEL: usize = 4;
const PADDING: usize = 1;
const LEAKY_SLOPE: f64 = 0.2;
const BN_EPS: f64 = 1e-5;
const MAX_WIDTH_MULT: usize = 8;

/// Convolution weights and BatchNorm scales are drawn with this std.
pub const INIT_STD: f64 = 0.02;

#[derive(Debug, Clone)]
enum Layer {
    Conv(Conv2d),
    Norm(BatchNorm),
    LeakyRelu,
}

impl Layer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        match self {
            Layer::Conv(conv) => xs.apply(conv),
            Layer::Norm(bn) => xs.apply_t(bn, train),
            Layer::LeakyRelu => candle_nn::ops::leaky_relu(xs, LEAKY_SLOPE),
        }
    }
}

/// Clones share parameter storage with the original.
#[derive(Clone)]
pub struct NLayerDiscriminator {
    layers: Vec<Layer>,
    in_channels: usize,
    varmap: VarMap,
}

impl fmt::Debug for NLayerDiscriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NLayerDiscriminator")
            .field("in_channels", &self.in_channels)
            .field("layers", &self.layers)
            .finish_non_exhaustive()
    }
}

fn conv(
    in_c: usize,
    out_c: usize,
    stride: usize,
    bias: bool,
    vb: VarBuilder,
) -> candle_core::Result<Conv2d> {
    let weight = vb.get_with_hints(
        (out_c, in_c, KERNEL, KERNEL),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: INIT_STD,
        },
    )?;
    let bias = if bias {
        let bound = 1.0 / ((in_c * KERNEL * KERNEL) as f64).sqrt();
        Some(vb.get_with_hints(
            out_c,
            "bias",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?)
    } else {
        None
    };
    let cfg = Conv2dConfig {
        padding: PADDING,
        stride,
        ..Default::default()
    };
    Ok(Conv2d::new(weight, bias, cfg))
}

fn batch_norm(channels: usize, vb: VarBuilder) -> candle_core::Result<BatchNorm> {
    let running_mean = vb.get_with_hints(channels, "running_mean", Init::Const(0.0))?;
    let running_var = vb.get_with_hints(channels, "running_var", Init::Const(1.0))?;
    let weight = vb.get_with_hints(
        channels,
        "weight",
        Init::Randn {
            mean: 1.0,
            stdev: INIT_STD,
        },
    )?;
    let bias = vb.get_with_hints(channels, "bias", Init::Const(0.0))?;
    BatchNorm::new(channels, running_mean, running_var, weight, bias, BN_EPS)
}

fn is_running_stat(name: &str) -> bool {
    name.ends_with("running_mean") || name.ends_with("running_var")
}

impl NLayerDiscriminator {
    /// Build a freshly initialised discriminator with its own parameter table.
    pub fn new(
        in_channels: usize,
        ndf: usize,
        n_layers: usize,
        device: &Device,
    ) -> AutoencoderResult<Self> {
        if in_channels == 0 || ndf == 0 || n_layers == 0 {
            return Err(AutoencoderError::ConfigError {
                message: format!(
                    "discriminator needs positive in_channels, ndf and n_layers, got {in_channels}, {ndf}, {n_layers}"
                ),
            });
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device).pp("main");
        let mut layers = Vec::with_capacity(3 * n_layers + 3);

        layers.push(Layer::Conv(conv(in_channels, ndf, 2, true, vb.pp(0))?));
        layers.push(Layer::LeakyRelu);

        let mut mult = 1;
        for n in 1..=n_layers {
            let prev = mult;
            mult = (1 << n).min(MAX_WIDTH_MULT);
            let stride = if n == n_layers { 1 } else { 2 };
            let idx = layers.len();
            layers.push(Layer::Conv(conv(
                ndf * prev,
                ndf * mult,
                stride,
                false,
                vb.pp(idx),
            )?));
            layers.push(Layer::Norm(batch_norm(ndf * mult, vb.pp(idx + 1))?));
            layers.push(Layer::LeakyRelu);
        }

        let idx = layers.len();
        layers.push(Layer::Conv(conv(ndf * mult, 1, 1, true, vb.pp(idx))?));

        let disc = Self {
            layers,
            in_channels,
            varmap,
        };
        info!(
            target: "autoencoder_kl::discriminator",
            in_channels,
            ndf,
            n_layers,
            parameters = disc.num_parameters()?,
            "Built patch discriminator"
        );
        Ok(disc)
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Per-patch logits `(B, 1, h, w)`.
    ///
    /// `train = true` normalises with batch statistics and updates the
    /// running estimates; `false` uses the running estimates.
    pub fn logits(&self, xs: &Tensor, train: bool) -> AutoencoderResult<Tensor> {
        let dims = xs.dims();
        if dims.len() != 4 || dims[1] != self.in_channels {
            return Err(AutoencoderError::ShapeMismatch {
                context: "discriminator input".into(),
                expected: vec![dims.first().copied().unwrap_or(0), self.in_channels],
                actual: dims.to_vec(),
            });
        }
        Ok(self.forward_t(xs, train)?)
    }

    /// Every tensor of the discriminator, running statistics included, sorted by name.
    pub fn named_parameters(&self) -> AutoencoderResult<Vec<(String, Var)>> {
        named_vars(&self.varmap)
    }

    /// The tensors an optimizer should update.
    pub fn trainable_vars(&self) -> AutoencoderResult<Vec<Var>> {
        Ok(self
            .named_parameters()?
            .into_iter()
            .filter(|(name, _)| !is_running_stat(name))
            .map(|(_, var)| var)
            .collect())
    }

    /// Count of trainable scalars.
    pub fn num_parameters(&self) -> AutoencoderResult<usize> {
        Ok(self
            .trainable_vars()?
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum())
    }
}

impl ModuleT for NLayerDiscriminator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut h = xs.clone();
        for layer in &self.layers {
            h = layer.forward_t(&h, train)?;
        }
        Ok(h)
    }
}
