use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn pixels(seed: u64, n: usize) -> Vec<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

/// Channels-last batch `(b, h, w, c)` with pixels uniform in [-1, 1).
pub fn random_nhwc(seed: u64, b: usize, h: usize, w: usize, c: usize) -> Tensor {
    Tensor::from_vec(pixels(seed, b * h * w * c), (b, h, w, c), &Device::Cpu)
        .expect("pixel count matches shape")
}

/// Channels-first batch `(b, c, h, w)` with pixels uniform in [-1, 1).
pub fn random_nchw(seed: u64, b: usize, c: usize, h: usize, w: usize) -> Tensor {
    Tensor::from_vec(pixels(seed, b * c * h * w), (b, c, h, w), &Device::Cpu)
        .expect("pixel count matches shape")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_pixels() {
        let a = random_nhwc(7, 1, 4, 4, 3).flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = random_nhwc(7, 1, 4, 4, 3).flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let c = random_nhwc(8, 1, 4, 4, 3).flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().all(|v| (-1.0..1.0).contains(v)));
    }
}
