use candle_core::{Module, Tensor};
use candle_nn::{Activation, Conv2d, GroupNorm, VarBuilder};

use super::blocks::{conv3x3, normalize, AttnBlock, Downsample, ResnetBlock};
use crate::config::DdConfig;
use crate::error::AutoencoderResult;

#[derive(Debug, Clone)]
struct DownLevel {
    blocks: Vec<ResnetBlock>,
    attns: Vec<AttnBlock>,
    downsample: Option<Downsample>,
}

/// Image → latent moments `(B, 2*z_channels, H/f, W/f)`.
#[derive(Debug, Clone)]
pub struct Encoder {
    conv_in: Conv2d,
    down: Vec<DownLevel>,
    mid_block_1: ResnetBlock,
    mid_attn_1: AttnBlock,
    mid_block_2: ResnetBlock,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Encoder {
    pub fn new(cfg: &DdConfig, vb: VarBuilder) -> AutoencoderResult<Self> {
        let groups = cfg.norm_num_groups;
        let conv_in = conv3x3(cfg.in_channels, cfg.ch, vb.pp("conv_in"))?;

        let num_levels = cfg.ch_mult.len();
        let mut curr_res = cfg.resolution;
        let mut block_in = cfg.ch;
        let mut down = Vec::with_capacity(num_levels);
        for i_level in 0..num_levels {
            let vb_level = vb.pp(format!("down.{i_level}"));
            let block_out = cfg.level_channels(i_level);
            let mut blocks = Vec::with_capacity(cfg.num_res_blocks);
            let mut attns = Vec::new();
            for i_block in 0..cfg.num_res_blocks {
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
            let downsample = if i_level + 1 != num_levels {
                curr_res /= 2;
                Some(Downsample::new(block_in, vb_level.pp("downsample"))?)
            } else {
                None
            };
            down.push(DownLevel {
                blocks,
                attns,
                downsample,
            });
        }

        let vb_mid = vb.pp("mid");
        let mid_block_1 = ResnetBlock::new(block_in, block_in, groups, vb_mid.pp("block_1"))?;
        let mid_attn_1 = AttnBlock::new(block_in, groups, vb_mid.pp("attn_1"))?;
        let mid_block_2 = ResnetBlock::new(block_in, block_in, groups, vb_mid.pp("block_2"))?;

        let norm_out = normalize(block_in, groups, vb.pp("norm_out"))?;
        let conv_out = conv3x3(block_in, 2 * cfg.z_channels, vb.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            down,
            mid_block_1,
            mid_attn_1,
            mid_block_2,
            norm_out,
            conv_out,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> AutoencoderResult<Tensor> {
        let mut h = xs.apply(&self.conv_in)?;
        for level in &self.down {
            for (i, block) in level.blocks.iter().enumerate() {
                h = block.forward(&h)?;
                if let Some(attn) = level.attns.get(i) {
                    h = attn.forward(&h)?;
                }
            }
            if let Some(downsample) = &level.downsample {
                h = downsample.forward(&h)?;
            }
        }
        let h = h
            .apply(&self.mid_block_1)?
            .apply(&self.mid_attn_1)?
            .apply(&self.mid_block_2)?
            .apply(&self.norm_out)?
            .apply(&Activation::Swish)?
            .apply(&self.conv_out)?;
        Ok(h)
    }
}
