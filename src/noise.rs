//! Seeded gaussian noise.
//!
//! Samples are drawn on the host from a `ChaCha8Rng` and then moved to the
//! target device, so one seed gives the same latents on CPU, CUDA or Metal.

use candle_core::{DType, Device, Shape, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::Result;

/// Build the noise RNG, drawing a fresh seed when none is given.
pub fn noise_rng(seed: Option<u64>) -> (ChaCha8Rng, u64) {
    let seed = seed.unwrap_or_else(|| rand::rng().random());
    (ChaCha8Rng::seed_from_u64(seed), seed)
}

/// Standard-normal tensor of the given shape.
pub fn randn<S: Into<Shape>>(
    rng: &mut ChaCha8Rng,
    shape: S,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let shape = shape.into();
    let n = shape.elem_count();
    let mut values = Vec::with_capacity(n + 1);
    while values.len() < n {
        // Box–Muller: two uniforms give two independent normals.
        let u1 = 1.0 - rng.random::<f64>();
        let u2 = rng.random::<f64>();
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        values.push((radius * theta.cos()) as f32);
        values.push((radius * theta.sin()) as f32);
    }
    values.truncate(n);

    let tensor = Tensor::from_vec(values, shape, &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(device)?;
    Ok(tensor)
}
