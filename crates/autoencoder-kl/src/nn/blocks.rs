//! Residual, attention and resampling blocks shared by encoder and decoder.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{conv2d, group_norm, Activation, Conv2d, Conv2dConfig, GroupNorm, VarBuilder};

use super::NORM_EPS;

pub(crate) fn conv3x3(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    conv2d(in_c, out_c, 3, cfg, vb)
}

pub(crate) fn conv1x1(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    conv2d(in_c, out_c, 1, Default::default(), vb)
}

pub(crate) fn normalize(channels: usize, num_groups: usize, vb: VarBuilder) -> Result<GroupNorm> {
    group_norm(num_groups, channels, NORM_EPS, vb)
}

/// Pre-activation residual block: norm → swish → conv, twice, plus a 1×1
/// shortcut when the width changes.
#[derive(Debug, Clone)]
pub(crate) struct ResnetBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
    nin_shortcut: Option<Conv2d>,
}

impl ResnetBlock {
    pub(crate) fn new(
        in_channels: usize,
        out_channels: usize,
        num_groups: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let norm1 = normalize(in_channels, num_groups, vb.pp("norm1"))?;
        let conv1 = conv3x3(in_channels, out_channels, vb.pp("conv1"))?;
        let norm2 = normalize(out_channels, num_groups, vb.pp("norm2"))?;
        let conv2 = conv3x3(out_channels, out_channels, vb.pp("conv2"))?;
        let nin_shortcut = if in_channels != out_channels {
            Some(conv1x1(in_channels, out_channels, vb.pp("nin_shortcut"))?)
        } else {
            None
        };
        Ok(Self {
            norm1,
            conv1,
            norm2,
            conv2,
            nin_shortcut,
        })
    }
}

impl Module for ResnetBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = xs
            .apply(&self.norm1)?
            .apply(&Activation::Swish)?
            .apply(&self.conv1)?
            .apply(&self.norm2)?
            .apply(&Activation::Swish)?
            .apply(&self.conv2)?;
        match &self.nin_shortcut {
            Some(shortcut) => xs.apply(shortcut)? + h,
            None => xs + h,
        }
    }
}

/// Single-head spatial self-attention with 1×1 convolution projections.
#[derive(Debug, Clone)]
pub(crate) struct AttnBlock {
    norm: GroupNorm,
    q: Conv2d,
    k: Conv2d,
    v: Conv2d,
    proj_out: Conv2d,
}

impl AttnBlock {
    pub(crate) fn new(channels: usize, num_groups: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: normalize(channels, num_groups, vb.pp("norm"))?,
            q: conv1x1(channels, channels, vb.pp("q"))?,
            k: conv1x1(channels, channels, vb.pp("k"))?,
            v: conv1x1(channels, channels, vb.pp("v"))?,
            proj_out: conv1x1(channels, channels, vb.pp("proj_out"))?,
        })
    }
}

impl Module for AttnBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = xs.dims4()?;
        let normed = xs.apply(&self.norm)?;

        // (B, C, H, W) -> (B, HW, C) for queries, (B, C, HW) for keys/values
        let q = normed
            .apply(&self.q)?
            .reshape((b, c, h * w))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = normed.apply(&self.k)?.reshape((b, c, h * w))?;
        let v = normed.apply(&self.v)?.reshape((b, c, h * w))?;

        let scores = (q.matmul(&k)? * (c as f64).powf(-0.5))?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;

        // out[b, c, i] = sum_j v[b, c, j] * weights[b, i, j]
        let attended = v
            .matmul(&weights.transpose(1, 2)?.contiguous()?)?
            .reshape((b, c, h, w))?
            .apply(&self.proj_out)?;
        xs + attended
    }
}

/// Halves the resolution: pad right/bottom by one, then a stride-2 3×3 conv.
#[derive(Debug, Clone)]
pub(crate) struct Downsample {
    conv: Conv2d,
}

impl Downsample {
    pub(crate) fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            stride: 2,
            padding: 0,
            ..Default::default()
        };
        Ok(Self {
            conv: conv2d(channels, channels, 3, cfg, vb.pp("conv"))?,
        })
    }
}

impl Module for Downsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = xs.pad_with_zeros(D::Minus1, 0, 1)?;
        let xs = xs.pad_with_zeros(D::Minus2, 0, 1)?;
        xs.apply(&self.conv)
    }
}

/// Doubles the resolution: nearest-neighbour upsampling followed by a 3×3 conv.
#[derive(Debug, Clone)]
pub(crate) struct Upsample {
    conv: Conv2d,
}

impl Upsample {
    pub(crate) fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv: conv3x3(channels, channels, vb.pp("conv"))?,
        })
    }
}

impl Module for Upsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = xs.dims4()?;
        xs.upsample_nearest2d(h * 2, w * 2)?.apply(&self.conv)
    }
}
