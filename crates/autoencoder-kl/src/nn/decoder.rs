use candle_core::{Module, Tensor};
use candle_nn::{Activation, Conv2d, GroupNorm, VarBuilder};

use super::blocks::{conv3x3, normalize, AttnBlock, ResnetBlock, Upsample};
use crate::config::DdConfig;
use crate::error::AutoencoderResult;

#[derive(Debug, Clone)]
struct UpLevel {
    blocks: Vec<ResnetBlock>,
    attns: Vec<AttnBlock>,
    upsample: Option<Upsample>,
}

/// Latent `(B, z_channels, h, w)` → image `(B, out_ch, h*f, w*f)`.
#[derive(Debug, Clone)]
pub struct Decoder {
    conv_in: Conv2d,
    mid_block_1: ResnetBlock,
    mid_attn_1: AttnBlock,
    mid_block_2: ResnetBlock,
    /// Indexed by level, as in the encoder; run in reverse.
    up: Vec<UpLevel>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Decoder {
    pub fn new(cfg: &DdConfig, vb: VarBuilder) -> AutoencoderResult<Self> {
        let groups = cfg.norm_num_groups;
        let num_levels = cfg.ch_mult.len();
        let mut block_in = cfg.level_channels(num_levels - 1);
        let mut curr_res = cfg.resolution / cfg.downsample_factor();

        let conv_in = conv3x3(cfg.z_channels, block_in, vb.pp("conv_in"))?;

        let vb_mid = vb.pp("mid");
        let mid_block_1 = ResnetBlock::new(block_in, block_in, groups, vb_mid.pp("block_1"))?;
        let mid_attn_1 = AttnBlock::new(block_in, groups, vb_mid.pp("attn_1"))?;
        let mid_block_2 = ResnetBlock::new(block_in, block_in, groups, vb_mid.pp("block_2"))?;

        let mut up = Vec::with_capacity(num_levels);
        for i_level in (0..num_levels).rev() {
            let vb_level = vb.pp(format!("up.{i_level}"));
            let block_out = cfg.level_channels(i_level);
            let mut blocks = Vec::with_capacity(cfg.num_res_blocks + 1);
            let mut attns = Vec::new();
            for i_block in 0..=cfg.num_res_blocks {
                blocks.push(ResnetBlock::new(
                    block_in,
                    block_out,
                    groups,
                    vb_level.pp(format!("block.{i_block}")),
                )?);
                block_in = block_out;
                if cfg.attn_resolutions.contains(&curr_res) {
                    attns.push(AttnBlock::new(
                        block_in,
                        groups,
                        vb_level.pp(format!("attn.{i_block}")),
                    )?);
                }
            }
            let upsample = if i_level != 0 {
                curr_res *= 2;
                Some(Upsample::new(block_in, vb_level.pp("upsample"))?)
            } else {
                None
            };
            up.push(UpLevel {
                blocks,
                attns,
                upsample,
            });
        }
        up.reverse();

        let norm_out = normalize(block_in, groups, vb.pp("norm_out"))?;
        let conv_out = conv3x3(block_in, cfg.out_ch, vb.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            mid_block_1,
            mid_attn_1,
            mid_block_2,
            up,
            norm_out,
            conv_out,
        })
    }

    pub fn forward(&self, z: &Tensor) -> AutoencoderResult<Tensor> {
        let mut h = z
            .apply(&self.conv_in)?
            .apply(&self.mid_block_1)?
            .apply(&self.mid_attn_1)?
            .apply(&self.mid_block_2)?;
        for level in self.up.iter().rev() {
            for (i, block) in level.blocks.iter().enumerate() {
                h = block.forward(&h)?;
                if let Some(attn) = level.attns.get(i) {
                    h = attn.forward(&h)?;
                }
            }
            if let Some(upsample) = &level.upsample {
                h = upsample.forward(&h)?;
            }
        }
        let h = h
            .apply(&self.norm_out)?
            .apply(&Activation::Swish)?
            .apply(&self.conv_out)?;
        Ok(h)
    }

    /// Weight of the final convolution, the target of the adaptive-weight
    /// gradient norms.
    pub fn conv_out_weight(&self) -> &Tensor {
        self.conv_out.weight()
    }
}
