//! Diagonal Gaussian posterior over latent codes.
//!
//! The encoder emits `2 * embed_dim` channels per spatial location; the first
//! half is the mean and the second half the log-variance. Only `mean` and the
//! clamped `logvar` are stored; `std` and `var` are always derived from
//! `logvar` on demand so the three can never drift apart.

use candle_core::Tensor;

use crate::error::{AutoencoderError, AutoencoderResult};

/// Lower clamp bound applied to the log-variance.
pub const LOGVAR_MIN: f32 = -30.0;
/// Upper clamp bound applied to the log-variance.
pub const LOGVAR_MAX: f32 = 20.0;

const LOG_TWO_PI: f64 = 1.837_877_066_409_345_3;

/// Per-element diagonal Gaussian `N(mean, exp(logvar))`.
#[derive(Debug, Clone)]
pub struct DiagonalGaussianDistribution {
    mean: Tensor,
    logvar: Tensor,
    deterministic: bool,
}

impl DiagonalGaussianDistribution {
    /// Split `moments` along the channel axis into mean and log-variance.
    ///
    /// # Errors
    /// - `OddLatentChannels` if the channel count cannot be halved
    /// - `ShapeMismatch` if `moments` has no channel axis
    pub fn new(moments: &Tensor, deterministic: bool) -> AutoencoderResult<Self> {
        let dims = moments.dims();
        if dims.len() < 2 {
            return Err(AutoencoderError::ShapeMismatch {
                context: "latent moments (expected batch and channel axes)".into(),
                expected: vec![0, 0],
                actual: dims.to_vec(),
            });
        }
        let channels = dims[1];
        if channels == 0 || channels % 2 != 0 {
            return Err(AutoencoderError::OddLatentChannels { channels });
        }
        let half = channels / 2;

        let mean = moments.narrow(1, 0, half)?;
        let logvar = if deterministic {
            mean.zeros_like()?
        } else {
            moments.narrow(1, half, half)?.clamp(LOGVAR_MIN, LOGVAR_MAX)?
        };

        Ok(Self {
            mean,
            logvar,
            deterministic,
        })
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    /// Clamped log-variance (zeros in deterministic mode).
    pub fn logvar(&self) -> &Tensor {
        &self.logvar
    }

    pub fn is_deterministic(&self) -> bool {
        self.deterministic
    }

    /// `exp(0.5 * logvar)`, or zeros in deterministic mode.
    pub fn std(&self) -> AutoencoderResult<Tensor> {
        if self.deterministic {
            return Ok(self.mean.zeros_like()?);
        }
        Ok((&self.logvar * 0.5)?.exp()?)
    }

    /// `exp(logvar)`, or zeros in deterministic mode.
    pub fn var(&self) -> AutoencoderResult<Tensor> {
        if self.deterministic {
            return Ok(self.mean.zeros_like()?);
        }
        Ok(self.logvar.exp()?)
    }

    /// Reparameterised draw `mean + std * eps`, `eps ~ N(0, I)` fresh per call.
    pub fn sample(&self) -> AutoencoderResult<Tensor> {
        let noise = self.mean.randn_like(0.0, 1.0)?;
        Ok((&self.mean + self.std()?.mul(&noise)?)?)
    }

    /// The distribution mode, i.e. the mean.
    pub fn mode(&self) -> &Tensor {
        &self.mean
    }

    /// KL divergence against `N(0, I)`, one value per batch entry.
    ///
    /// Element-wise `0.5 * (mean² + var - 1 - logvar)` summed over every
    /// non-batch axis. In deterministic mode this degenerates to
    /// `0.5 * Σ mean²`.
    pub fn kl(&self) -> AutoencoderResult<Tensor> {
        let mean_sq = self.mean.sqr()?;
        let per_element = if self.deterministic {
            mean_sq
        } else {
            ((mean_sq + self.var()?)? - 1.0)?.sub(&self.logvar)?
        };
        sum_non_batch(&(per_element * 0.5)?)
    }

    /// KL divergence against another diagonal Gaussian of the same shape.
    pub fn kl_to(&self, other: &DiagonalGaussianDistribution) -> AutoencoderResult<Tensor> {
        self.check_same_shape(&other.mean, "kl_to")?;
        if self.deterministic {
            return self.zeros_per_entry();
        }
        let other_var = other.var()?;
        let diff_sq = self.mean.sub(&other.mean)?.sqr()?;
        let per_element = ((diff_sq.div(&other_var)? + self.var()?.div(&other_var)?)? - 1.0)?
            .sub(&self.logvar)?
            .add(&other.logvar)?;
        sum_non_batch(&(per_element * 0.5)?)
    }

    /// Gaussian negative log-likelihood of `sample`, one value per batch entry.
    pub fn nll(&self, sample: &Tensor) -> AutoencoderResult<Tensor> {
        self.check_same_shape(sample, "nll")?;
        if self.deterministic {
            return self.zeros_per_entry();
        }
        let sq = sample.sub(&self.mean)?.sqr()?.div(&self.var()?)?;
        let per_element = ((&self.logvar + LOG_TWO_PI)? + sq)?;
        sum_non_batch(&(per_element * 0.5)?)
    }

    /// Same distribution with both parameters cut from the autograd graph.
    pub fn detach(&self) -> Self {
        Self {
            mean: self.mean.detach(),
            logvar: self.logvar.detach(),
            deterministic: self.deterministic,
        }
    }

    fn check_same_shape(&self, other: &Tensor, context: &str) -> AutoencoderResult<()> {
        if other.dims() != self.mean.dims() {
            return Err(AutoencoderError::ShapeMismatch {
                context: context.to_string(),
                expected: self.mean.dims().to_vec(),
                actual: other.dims().to_vec(),
            });
        }
        Ok(())
    }

    fn zeros_per_entry(&self) -> AutoencoderResult<Tensor> {
        let batch = self.mean.dim(0)?;
        Ok(Tensor::zeros(batch, self.mean.dtype(), self.mean.device())?)
    }
}

/// Sum every axis except the leading batch axis: `(B, ...) -> (B,)`.
fn sum_non_batch(t: &Tensor) -> AutoencoderResult<Tensor> {
    Ok(t.flatten_from(1)?.sum(1)?)
}
