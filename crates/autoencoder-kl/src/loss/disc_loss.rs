use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{AutoencoderError, AutoencoderResult};

/// Returns `value` while `global_step < threshold`, `weight` afterwards.
pub fn adopt_weight(weight: f64, global_step: usize, threshold: usize, value: f64) -> f64 {
    if global_step < threshold {
        value
    } else {
        weight
    }
}

/// `0.5 * (mean(relu(1 - real)) + mean(relu(1 + fake)))`
pub fn hinge_d_loss(logits_real: &Tensor, logits_fake: &Tensor) -> AutoencoderResult<Tensor> {
    let loss_real = logits_real.affine(-1.0, 1.0)?.relu()?.mean_all()?;
    let loss_fake = (logits_fake + 1.0)?.relu()?.mean_all()?;
    Ok(((loss_real + loss_fake)? * 0.5)?)
}

/// `0.5 * (mean(softplus(-real)) + mean(softplus(fake)))`
pub fn vanilla_d_loss(logits_real: &Tensor, logits_fake: &Tensor) -> AutoencoderResult<Tensor> {
    let loss_real = softplus(&logits_real.neg()?)?.mean_all()?;
    let loss_fake = softplus(logits_fake)?.mean_all()?;
    Ok(((loss_real + loss_fake)? * 0.5)?)
}

/// `log(1 + exp(x))`, evaluated as `relu(x) + log(1 + exp(-|x|))` so large
/// logits do not overflow.
pub fn softplus(xs: &Tensor) -> AutoencoderResult<Tensor> {
    let tail = (xs.abs()?.neg()?.exp()? + 1.0)?.log()?;
    Ok((xs.relu()? + tail)?)
}

/// Discriminator objective selected by the `disc_loss` config string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscLossKind {
    #[default]
    Hinge,
    Vanilla,
}

impl DiscLossKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscLossKind::Hinge => "hinge",
            DiscLossKind::Vanilla => "vanilla",
        }
    }

    pub fn compute(&self, logits_real: &Tensor, logits_fake: &Tensor) -> AutoencoderResult<Tensor> {
        match self {
            DiscLossKind::Hinge => hinge_d_loss(logits_real, logits_fake),
            DiscLossKind::Vanilla => vanilla_d_loss(logits_real, logits_fake),
        }
    }
}

impl FromStr for DiscLossKind {
    type Err = AutoencoderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hinge" => Ok(DiscLossKind::Hinge),
            "vanilla" => Ok(DiscLossKind::Vanilla),
            other => Err(AutoencoderError::UnknownDiscLoss {
                name: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for DiscLossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn t(values: &[f32]) -> Tensor {
        Tensor::from_slice(values, values.len(), &Device::Cpu).unwrap()
    }

    fn scalar(t: Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_adopt_weight_gate() {
        assert_eq!(adopt_weight(1.5, 9, 10, 0.0), 0.0);
        assert_eq!(adopt_weight(1.5, 10, 10, 0.0), 1.5);
        assert_eq!(adopt_weight(1.5, 0, 0, 0.0), 1.5);
        assert_eq!(adopt_weight(1.5, 3, 10, 0.25), 0.25);
    }

    #[test]
    fn test_hinge_zero_when_separated() {
        let loss = hinge_d_loss(&t(&[1.0, 2.5, 1.0]), &t(&[-1.0, -3.0, -1.0])).unwrap();
        assert_eq!(scalar(loss), 0.0);
    }

    #[test]
    fn test_hinge_values() {
        // real: relu(1 - 0) = 1, relu(1 - 2) = 0 → mean 0.5
        // fake: relu(1 + 0) = 1, relu(1 + 1) = 2 → mean 1.5
        let loss = hinge_d_loss(&t(&[0.0, 2.0]), &t(&[0.0, 1.0])).unwrap();
        assert!((scalar(loss) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_hinge_non_negative() {
        let real = Tensor::randn(0f32, 3f32, 64, &Device::Cpu).unwrap();
        let fake = Tensor::randn(0f32, 3f32, 64, &Device::Cpu).unwrap();
        assert!(scalar(hinge_d_loss(&real, &fake).unwrap()) >= 0.0);
    }

    #[test]
    fn test_vanilla_at_zero_logits() {
        let loss = vanilla_d_loss(&t(&[0.0, 0.0]), &t(&[0.0])).unwrap();
        assert!((scalar(loss) - std::f32::consts::LN_2).abs() < 1e-6);
    }

    #[test]
    fn test_softplus_is_stable() {
        let out = softplus(&t(&[-100.0, 0.0, 100.0])).unwrap().to_vec1::<f32>().unwrap();
        assert!(out[0] >= 0.0 && out[0] < 1e-6);
        assert!((out[1] - std::f32::consts::LN_2).abs() < 1e-6);
        assert!((out[2] - 100.0).abs() < 1e-4);
    }

    #[test]
    fn test_kind_parse_and_display() {
        assert_eq!("hinge".parse::<DiscLossKind>().unwrap(), DiscLossKind::Hinge);
        assert_eq!("vanilla".parse::<DiscLossKind>().unwrap(), DiscLossKind::Vanilla);
        assert_eq!(DiscLossKind::Vanilla.to_string(), "vanilla");
        assert!(matches!(
            "wgan".parse::<DiscLossKind>(),
            Err(AutoencoderError::UnknownDiscLoss { .. })
        ));
    }

    #[test]
    fn test_kind_dispatch() {
        let real = t(&[0.3, -0.2]);
        let fake = t(&[0.1, 0.4]);
        let via_kind = DiscLossKind::Vanilla.compute(&real, &fake).unwrap();
        let direct = vanilla_d_loss(&real, &fake).unwrap();
        assert_eq!(scalar(via_kind), scalar(direct));
    }
}
