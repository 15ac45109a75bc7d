//! Latent layout helpers: noise, 2x2 patch packing and positional ids.

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

/// Rounds `dim` down to a multiple of `multiple`.
pub fn round_down(dim: usize, multiple: usize) -> usize {
    dim / multiple * multiple
}

/// Latent height or width for a pixel dimension: a multiple of 2 so that
/// it packs into 2x2 patches.
pub fn latent_dim(pixels: usize, vae_scale_factor: usize) -> usize {
    2 * (pixels / (vae_scale_factor * 2))
}

/// Standard-normal noise drawn on the CPU from a seeded RNG, so a seed
/// reproduces the same latents on every device.
pub fn seeded_noise(
    shape: (usize, usize, usize, usize),
    seed: u64,
    dtype: DType,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let (b, c, h, w) = shape;
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..b * c * h * w)
        .map(|_| StandardNormal.sample(&mut rng))
        .collect();
    Tensor::from_vec(data, shape, &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(device)
}

/// `(B, C, h, w)` to `(B, (h/2)(w/2), C*4)`.
pub fn pack_latents(latents: &Tensor) -> candle_core::Result<Tensor> {
    let (b, c, h, w) = latents.dims4()?;
    latents
        .reshape((b, c, h / 2, 2, w / 2, 2))?
        .permute((0, 2, 4, 1, 3, 5))?
        .reshape((b, (h / 2) * (w / 2), c * 4))
}

/// Inverse of [`pack_latents`] for an image of `height x width` pixels.
pub fn unpack_latents(
    latents: &Tensor,
    height: usize,
    width: usize,
    vae_scale_factor: usize,
) -> candle_core::Result<Tensor> {
    let (b, _, packed_channels) = latents.dims3()?;
    let h = latent_dim(height, vae_scale_factor);
    let w = latent_dim(width, vae_scale_factor);
    let c = packed_channels / 4;
    latents
        .reshape((b, h / 2, w / 2, c, 2, 2))?
        .permute((0, 3, 1, 4, 2, 5))?
        .reshape((b, c, h, w))
}

/// `(rows * cols, 3)` ids holding `[0, row, col]` for every packed token.
pub fn prepare_latent_image_ids(
    rows: usize,
    cols: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let mut ids = Vec::with_capacity(rows * cols * 3);
    for row in 0..rows {
        for col in 0..cols {
            ids.extend_from_slice(&[0f32, row as f32, col as f32]);
        }
    }
    Tensor::from_vec(ids, (rows * cols, 3), device)
}

/// Text tokens all share position zero.
pub fn prepare_text_ids(text_len: usize, device: &Device) -> candle_core::Result<Tensor> {
    Tensor::zeros((text_len, 3), DType::F32, device)
}

/// Repeats every row of `t` `n` times along the batch axis, keeping the
/// copies of one row adjacent.
pub fn repeat_per_prompt(t: &Tensor, n: usize) -> candle_core::Result<Tensor> {
    if n == 1 {
        return Ok(t.clone());
    }
    let mut reps = vec![1usize; t.rank() + 1];
    reps[1] = n;
    t.unsqueeze(1)?.repeat(reps)?.flatten(0, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;

    #[test]
    fn dims_round_to_packable_sizes() {
        assert_eq!(latent_dim(1024, 8), 128);
        assert_eq!(latent_dim(1000, 8), 124);
        assert_eq!(round_down(1000, 16), 992);
        assert_eq!(round_down(15, 16), 0);
    }

    #[test]
    fn pack_unpack_restores_layout() {
        let dev = Device::Cpu;
        let latents = Tensor::arange(0f32, 2.0 * 16.0 * 4.0 * 6.0, &dev)
            .unwrap()
            .reshape((2, 16, 4, 6))
            .unwrap();
        let packed = pack_latents(&latents).unwrap();
        assert_eq!(packed.dims(), &[2, 6, 64]);

        let restored = unpack_latents(&packed, 32, 48, 8).unwrap();
        let diff = (restored - &latents)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn packed_token_holds_one_patch() {
        let dev = Device::Cpu;
        let latents = Tensor::arange(0f32, 16.0, &dev)
            .unwrap()
            .reshape((1, 1, 4, 4))
            .unwrap();
        let packed = pack_latents(&latents).unwrap();
        let first: Vec<f32> = packed.i((0, 0)).unwrap().to_vec1().unwrap();
        assert_eq!(first, vec![0.0, 1.0, 4.0, 5.0]);
    }

    #[test]
    fn image_ids_enumerate_grid() {
        let ids = prepare_latent_image_ids(2, 3, &Device::Cpu).unwrap();
        let rows: Vec<Vec<f32>> = ids.to_vec2().unwrap();
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[0], vec![0.0, 0.0, 0.0]);
        assert_eq!(rows[4], vec![0.0, 1.0, 1.0]);
        assert_eq!(rows[5], vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn noise_is_deterministic_per_seed() {
        let a = seeded_noise((1, 2, 4, 4), 42, DType::F32, &Device::Cpu).unwrap();
        let b = seeded_noise((1, 2, 4, 4), 42, DType::F32, &Device::Cpu).unwrap();
        let c = seeded_noise((1, 2, 4, 4), 7, DType::F32, &Device::Cpu).unwrap();
        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        let c: Vec<f32> = c.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn repeat_keeps_copies_adjacent() {
        let t = Tensor::new(&[[1f32, 1.0], [2.0, 2.0]], &Device::Cpu).unwrap();
        let out: Vec<Vec<f32>> = repeat_per_prompt(&t, 2).unwrap().to_vec2().unwrap();
        assert_eq!(
            out,
            vec![vec![1.0, 1.0], vec![1.0, 1.0], vec![2.0, 2.0], vec![2.0, 2.0]]
        );
    }
}
