use std::fmt;

use candle_core::{DType, Device, Tensor, Var};
use tracing::{debug, warn};

use super::disc_loss::{adopt_weight, DiscLossKind};
use super::log::LossLog;
use crate::config::LossConfig;
use crate::discriminator::NLayerDiscriminator;
use crate::distribution::DiagonalGaussianDistribution;
use crate::error::{AutoencoderError, AutoencoderResult};

/// Upper clamp for the adaptive discriminator weight.
pub const ADAPTIVE_WEIGHT_MAX: f64 = 1e4;

/// Guards the gradient-norm ratio against a vanishing adversarial gradient.
const GRAD_NORM_EPS: f64 = 1e-4;

/// Which optimizer the loss is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossPhase {
    /// Autoencoder update: reconstruction, KL and adversarial terms.
    Generator = 0,
    /// Discriminator update on detached real and reconstructed images.
    Discriminator = 1,
}

impl LossPhase {
    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<usize> for LossPhase {
    type Error = AutoencoderError;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        match index {
            0 => Ok(LossPhase::Generator),
            1 => Ok(LossPhase::Discriminator),
            _ => Err(AutoencoderError::InvalidPhase { index }),
        }
    }
}

/// Prefix for diagnostic keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Split {
    #[default]
    Train,
    Val,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }

    pub fn key(&self, name: &str) -> String {
        format!("{}/{}", self.as_str(), name)
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Borrowed tensors for one loss evaluation.
#[derive(Debug, Clone, Copy)]
pub struct LossInputs<'a> {
    pub inputs: &'a Tensor,
    pub reconstructions: &'a Tensor,
    pub posterior: &'a DiagonalGaussianDistribution,
    pub global_step: usize,
    /// Decoder final-layer weight; required for the adaptive weight in training.
    pub last_layer: Option<&'a Tensor>,
    /// Channel-concatenated onto discriminator inputs in conditional mode.
    pub cond: Option<&'a Tensor>,
    pub split: Split,
    /// Per-element multiplier on the NLL map, broadcast against it.
    pub weights: Option<&'a Tensor>,
}

impl<'a> LossInputs<'a> {
    pub fn new(
        inputs: &'a Tensor,
        reconstructions: &'a Tensor,
        posterior: &'a DiagonalGaussianDistribution,
        global_step: usize,
    ) -> Self {
        Self {
            inputs,
            reconstructions,
            posterior,
            global_step,
            last_layer: None,
            cond: None,
            split: Split::Train,
            weights: None,
        }
    }

    pub fn with_last_layer(mut self, last_layer: &'a Tensor) -> Self {
        self.last_layer = Some(last_layer);
        self
    }

    pub fn with_cond(mut self, cond: &'a Tensor) -> Self {
        self.cond = Some(cond);
        self
    }

    pub fn with_split(mut self, split: Split) -> Self {
        self.split = split;
        self
    }

    pub fn with_weights(mut self, weights: &'a Tensor) -> Self {
        self.weights = Some(weights);
        self
    }
}

/// Two-phase VAE-GAN objective.
///
/// Phase 0 returns
/// `weighted_nll + kl_weight * kl + d_weight * disc_factor * g_loss`, where
/// `d_weight` balances the NLL and adversarial gradient norms at the decoder's
/// last layer and `disc_factor` stays 0 until `disc_start`. Phase 1 returns
/// `disc_factor * disc_loss(real, fake)`.
///
/// Clones share `logvar` and the discriminator parameters with the original.
#[derive(Debug, Clone)]
pub struct LossCoordinator {
    logvar: Var,
    discriminator: NLayerDiscriminator,
    kl_weight: f64,
    disc_start: usize,
    disc_factor: f64,
    disc_weight: f64,
    disc_conditional: bool,
    disc_loss: DiscLossKind,
    training: bool,
}

impl LossCoordinator {
    /// # Errors
    /// `UnknownDiscLoss` if `disc_loss` is not `hinge` or `vanilla`.
    pub fn new(config: &LossConfig, device: &Device) -> AutoencoderResult<Self> {
        let disc_loss: DiscLossKind = config.disc_loss.parse()?;
        let discriminator = NLayerDiscriminator::new(
            config.disc_in_channels,
            config.disc_ndf,
            config.disc_num_layers,
            device,
        )?;
        let logvar = Var::new(config.logvar_init as f32, device)?;
        Ok(Self {
            logvar,
            discriminator,
            kl_weight: config.kl_weight,
            disc_start: config.disc_start,
            disc_factor: config.disc_factor,
            disc_weight: config.disc_weight,
            disc_conditional: config.disc_conditional,
            disc_loss,
            training: true,
        })
    }

    /// Learnable scalar calibrating the reconstruction NLL.
    pub fn logvar(&self) -> &Var {
        &self.logvar
    }

    pub fn discriminator(&self) -> &NLayerDiscriminator {
        &self.discriminator
    }

    pub fn disc_loss_kind(&self) -> DiscLossKind {
        self.disc_loss
    }

    pub fn is_conditional(&self) -> bool {
        self.disc_conditional
    }

    /// `logvar` plus every discriminator tensor under `discriminator.`.
    pub fn named_parameters(&self) -> AutoencoderResult<Vec<(String, Var)>> {
        let mut params = vec![("logvar".to_string(), self.logvar.clone())];
        params.extend(
            self.discriminator
                .named_parameters()?
                .into_iter()
                .map(|(name, var)| (format!("discriminator.{name}"), var)),
        );
        Ok(params)
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Adversarial gate at `global_step`.
    pub fn disc_factor_at(&self, global_step: usize) -> f64 {
        adopt_weight(self.disc_factor, global_step, self.disc_start, 0.0)
    }

    /// `clamp(|∇nll| / (|∇g| + 1e-4), 0, 1e4) * disc_weight`, gradients taken
    /// with respect to `last_layer`. The result is detached.
    ///
    /// # Errors
    /// `NoGradientPath` if either loss does not depend on `last_layer`.
    /// Candle records no gradient for a structurally zero path (for example
    /// a loss scaled by 0), so such a loss also reports `NoGradientPath`
    /// rather than a zero norm.
    pub fn calculate_adaptive_weight(
        &self,
        nll_loss: &Tensor,
        g_loss: &Tensor,
        last_layer: &Tensor,
    ) -> AutoencoderResult<Tensor> {
        let nll_norm = grad_norm(nll_loss, last_layer)?;
        let g_norm = grad_norm(g_loss, last_layer)?;
        let d_weight = (nll_norm / (g_norm + GRAD_NORM_EPS)?)?
            .clamp(0.0, ADAPTIVE_WEIGHT_MAX)?
            .detach();
        Ok((d_weight * self.disc_weight)?)
    }

    /// Loss for `phase` plus detached diagnostics.
    ///
    /// # Errors
    /// - `ConditioningMismatch` before any computation if `cond` presence
    ///   disagrees with the conditional flag
    /// - `ShapeMismatch` if inputs and reconstructions differ in shape
    /// - `NoGradientPath` in training mode when the adaptive weight cannot be formed
    pub fn forward(
        &self,
        inputs: &LossInputs<'_>,
        phase: LossPhase,
    ) -> AutoencoderResult<(Tensor, LossLog)> {
        if self.disc_conditional != inputs.cond.is_some() {
            return Err(AutoencoderError::ConditioningMismatch {
                conditional: self.disc_conditional,
                supplied: inputs.cond.is_some(),
            });
        }
        if inputs.inputs.dims() != inputs.reconstructions.dims() {
            return Err(AutoencoderError::ShapeMismatch {
                context: "reconstruction".into(),
                expected: inputs.inputs.dims().to_vec(),
                actual: inputs.reconstructions.dims().to_vec(),
            });
        }

        match phase {
            LossPhase::Generator => self.generator_loss(inputs),
            LossPhase::Discriminator => self.discriminator_loss(inputs),
        }
    }

    fn generator_loss(&self, inputs: &LossInputs<'_>) -> AutoencoderResult<(Tensor, LossLog)> {
        let split = inputs.split;
        let rec_loss = (inputs.inputs - inputs.reconstructions)?.abs()?;

        let logvar = self.logvar.as_tensor();
        let nll_map = rec_loss
            .broadcast_div(&logvar.exp()?)?
            .broadcast_add(logvar)?;
        let batch = inputs.inputs.dim(0)? as f64;
        let nll_loss = (nll_map.sum_all()? / batch)?;
        let weighted_nll_loss = match inputs.weights {
            Some(w) => (nll_map.broadcast_mul(w)?.sum_all()? / batch)?,
            None => nll_loss.clone(),
        };

        let kl = inputs.posterior.kl()?;
        let kl_loss = (kl.sum_all()? / kl.dim(0)? as f64)?;

        let fake_input = self.with_cond(inputs.reconstructions, inputs.cond)?;
        let logits_fake = self.discriminator.logits(&fake_input, self.training)?;
        let g_loss = logits_fake.mean_all()?.neg()?;

        let d_weight = if self.disc_factor > 0.0 {
            self.adaptive_weight_or_fallback(&nll_loss, &g_loss, inputs.last_layer)?
        } else {
            Tensor::new(0f32, g_loss.device())?
        };

        let disc_factor = self.disc_factor_at(inputs.global_step);
        let adversarial = ((&g_loss * &d_weight)? * disc_factor)?;
        let loss = ((&weighted_nll_loss + (&kl_loss * self.kl_weight)?)? + adversarial)?;

        let mut log = LossLog::new();
        log.insert_tensor(split.key("total_loss"), &loss)?;
        log.insert_tensor(split.key("logvar"), logvar)?;
        log.insert_tensor(split.key("kl_loss"), &kl_loss)?;
        log.insert_tensor(split.key("nll_loss"), &nll_loss)?;
        log.insert_tensor(split.key("rec_loss"), &rec_loss)?;
        log.insert_tensor(split.key("d_weight"), &d_weight)?;
        log.insert(split.key("disc_factor"), disc_factor as f32);
        log.insert_tensor(split.key("g_loss"), &g_loss)?;

        debug!(
            target: "autoencoder_kl::loss",
            split = %split,
            global_step = inputs.global_step,
            total = log.get(&split.key("total_loss")),
            g_loss = log.get(&split.key("g_loss")),
            d_weight = log.get(&split.key("d_weight")),
            disc_factor,
            "Generator loss"
        );
        Ok((loss, log))
    }

    fn discriminator_loss(&self, inputs: &LossInputs<'_>) -> AutoencoderResult<(Tensor, LossLog)> {
        let split = inputs.split;
        let real = self.with_cond(&inputs.inputs.detach(), inputs.cond)?;
        let fake = self.with_cond(&inputs.reconstructions.detach(), inputs.cond)?;
        let logits_real = self.discriminator.logits(&real, self.training)?;
        let logits_fake = self.discriminator.logits(&fake, self.training)?;

        let disc_factor = self.disc_factor_at(inputs.global_step);
        let d_loss = (self.disc_loss.compute(&logits_real, &logits_fake)? * disc_factor)?;

        let mut log = LossLog::new();
        log.insert_tensor(split.key("disc_loss"), &d_loss)?;
        log.insert_tensor(split.key("logits_real"), &logits_real)?;
        log.insert_tensor(split.key("logits_fake"), &logits_fake)?;

        debug!(
            target: "autoencoder_kl::loss",
            split = %split,
            global_step = inputs.global_step,
            disc_loss = log.get(&split.key("disc_loss")),
            disc_factor,
            "Discriminator loss"
        );
        Ok((d_loss, log))
    }

    /// Evaluation has no gradient path to the decoder, so the weight falls
    /// back to 0 there. In training the error propagates.
    fn adaptive_weight_or_fallback(
        &self,
        nll_loss: &Tensor,
        g_loss: &Tensor,
        last_layer: Option<&Tensor>,
    ) -> AutoencoderResult<Tensor> {
        let result = match last_layer {
            Some(layer) => self.calculate_adaptive_weight(nll_loss, g_loss, layer),
            None => Err(AutoencoderError::NoGradientPath {
                target: "decoder last layer (not supplied)".into(),
            }),
        };
        match result {
            Err(AutoencoderError::NoGradientPath { target }) if !self.training => {
                warn!(
                    target: "autoencoder_kl::loss",
                    %target,
                    "Adaptive weight unavailable outside training; using 0"
                );
                Ok(Tensor::new(0f32, g_loss.device())?)
            }
            other => other,
        }
    }

    fn with_cond(&self, xs: &Tensor, cond: Option<&Tensor>) -> AutoencoderResult<Tensor> {
        match cond {
            Some(c) => Ok(Tensor::cat(&[xs, c], 1)?),
            None => Ok(xs.clone()),
        }
    }
}

/// Frobenius norm of `d loss / d target`.
fn grad_norm(loss: &Tensor, target: &Tensor) -> AutoencoderResult<Tensor> {
    let grads = loss.backward()?;
    let grad = grads
        .get(target)
        .ok_or_else(|| AutoencoderError::NoGradientPath {
            target: format!("tensor of shape {:?}", target.dims()),
        })?;
    Ok(grad.to_dtype(DType::F32)?.sqr()?.sum_all()?.sqrt()?)
}
