//! Shared fixtures for autoencoder-kl tests.
//!
//! Configurations are small enough to run a full train step on CPU in
//! milliseconds; image batches come from a seeded ChaCha8 stream so a seed
//! always yields the same pixels.

mod images;

pub use images::{random_nchw, random_nhwc};

use std::path::Path;
use std::sync::Once;

use autoencoder_kl::{AutoencoderConfig, AutoencoderResult, DdConfig, LossConfig, Snapshot};
use candle_core::Tensor;

/// Spatial size of images produced for [`tiny_config`].
pub const TINY_RESOLUTION: usize = 16;

/// Two-level network (downsampling factor 2), 8 base channels, attention at
/// the latent resolution, 3-layer discriminator with 8 base filters.
pub fn tiny_config() -> AutoencoderConfig {
    AutoencoderConfig {
        embed_dim: 2,
        ddconfig: DdConfig {
            double_z: true,
            z_channels: 2,
            resolution: TINY_RESOLUTION,
            in_channels: 3,
            out_ch: 3,
            ch: 8,
            ch_mult: vec![1, 2],
            num_res_blocks: 1,
            attn_resolutions: vec![TINY_RESOLUTION / 2],
            norm_num_groups: 4,
        },
        loss: LossConfig {
            disc_start: 0,
            kl_weight: 1e-6,
            disc_num_layers: 2,
            disc_ndf: 8,
            disc_weight: 0.5,
            ..LossConfig::default()
        },
        ..AutoencoderConfig::default()
    }
}

/// [`tiny_config`] with the adversarial terms gated off until `disc_start`.
pub fn tiny_config_with_disc_start(disc_start: usize) -> AutoencoderConfig {
    let mut config = tiny_config();
    config.loss.disc_start = disc_start;
    config
}

/// Write `params` as a restorable snapshot.
pub fn write_snapshot(path: &Path, params: &[(&str, Tensor)]) -> AutoencoderResult<()> {
    let owned: Vec<(String, Tensor)> = params
        .iter()
        .map(|(name, t)| (name.to_string(), t.clone()))
        .collect();
    Snapshot::save(path, &owned)
}

static TRACING: Once = Once::new();

/// Route `tracing` output to the test harness. Safe to call from every test.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("autoencoder_kl=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}
