//! Encoder/decoder architecture configuration.

use serde::{Deserialize, Serialize};

/// Shape of the convolutional encoder and decoder.
///
/// Field names follow the latent-diffusion `ddconfig` block so existing YAML/TOML
/// model descriptions translate one-to-one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DdConfig {
    /// Encoder emits `2 * z_channels` moments (mean and log-variance).
    pub double_z: bool,
    /// Latent channels seen by the decoder.
    pub z_channels: usize,
    /// Nominal input resolution; used to place attention blocks.
    pub resolution: usize,
    /// Image channels entering the encoder.
    pub in_channels: usize,
    /// Image channels leaving the decoder.
    pub out_ch: usize,
    /// Base channel width.
    pub ch: usize,
    /// Per-level width multipliers. Each level after the first halves the resolution.
    pub ch_mult: Vec<usize>,
    /// Residual blocks per encoder level (decoder uses one more).
    pub num_res_blocks: usize,
    /// Resolutions at which self-attention blocks are inserted.
    pub attn_resolutions: Vec<usize>,
    /// Group count for every GroupNorm.
    pub norm_num_groups: usize,
}

impl Default for DdConfig {
    fn default() -> Self {
        Self {
            double_z: true,
            z_channels: 4,
            resolution: 256,
            in_channels: 3,
            out_ch: 3,
            ch: 128,
            ch_mult: vec![1, 2, 4, 4],
            num_res_blocks: 2,
            attn_resolutions: Vec::new(),
            norm_num_groups: 32,
        }
    }
}

impl DdConfig {
    /// Spatial reduction between image and latent grid.
    pub fn downsample_factor(&self) -> usize {
        1 << self.ch_mult.len().saturating_sub(1)
    }

    /// Channel width at level `i`.
    pub fn level_channels(&self, i: usize) -> usize {
        self.ch * self.ch_mult[i]
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.double_z {
            return Err("double_z must be true: quant_conv expects 2*z_channels moments".into());
        }
        if self.z_channels == 0 || self.in_channels == 0 || self.out_ch == 0 {
            return Err("z_channels, in_channels and out_ch must be greater than 0".into());
        }
        if self.ch == 0 {
            return Err("ch must be greater than 0".into());
        }
        if self.ch_mult.is_empty() || self.ch_mult.contains(&0) {
            return Err("ch_mult must be non-empty with positive entries".into());
        }
        if self.num_res_blocks == 0 {
            return Err("num_res_blocks must be greater than 0".into());
        }
        if self.norm_num_groups == 0 {
            return Err("norm_num_groups must be greater than 0".into());
        }
        for i in 0..self.ch_mult.len() {
            let width = self.level_channels(i);
            if width % self.norm_num_groups != 0 {
                return Err(format!(
                    "level {} width {} is not divisible by norm_num_groups {}",
                    i, width, self.norm_num_groups
                ));
            }
        }
        if self.ch % self.norm_num_groups != 0 {
            return Err(format!(
                "ch {} is not divisible by norm_num_groups {}",
                self.ch, self.norm_num_groups
            ));
        }
        let factor = self.downsample_factor();
        if self.resolution == 0 || self.resolution % factor != 0 {
            return Err(format!(
                "resolution {} must be a positive multiple of the downsampling factor {}",
                self.resolution, factor
            ));
        }
        Ok(())
    }
}
