//! Convolutional encoder and decoder.
//!
//! These networks are opaque to the loss coordinator: it only needs the
//! decoder's final convolution weight. Parameter names follow the latent-diffusion
//! layout (`down.{i}.block.{j}.norm1.weight`, `mid.attn_1.q.weight`, ...) so
//! existing snapshots restore key-for-key.

mod blocks;
mod decoder;
mod encoder;

pub use decoder::Decoder;
pub use encoder::Encoder;

/// GroupNorm epsilon used throughout both networks.
pub(crate) const NORM_EPS: f64 = 1e-6;
