//! Seeded Gaussian noise.
//!
//! MT19937 feeding a Box-Muller transform, laid out the way `torch.randn`
//! consumes its generator on the CPU. Noise is always drawn on the CPU and
//! moved afterwards, so a seed yields the same latents on every device.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand_mt::Mt;

#[derive(Debug, Clone)]
pub struct SeededNoise {
    rng: Mt,
    cached: Option<f32>,
}

impl SeededNoise {
    /// Only the low 32 bits of the seed reach the generator.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mt::new(seed as u32),
            cached: None,
        }
    }

    #[inline]
    fn uniform_f64(lo: u32, hi: u32) -> f64 {
        let combined = ((lo as u64) << 32) | (hi as u64);
        (combined & 0x001F_FFFF_FFFF_FFFF) as f64 / 9_007_199_254_740_992.0
    }

    #[inline]
    fn uniform_f32(value: u32) -> f32 {
        (value & 0x00FF_FFFF) as f32 / 16_777_216.0
    }

    /// One standard normal sample; every other call is served from the cache.
    pub fn sample(&mut self) -> f32 {
        if let Some(cached) = self.cached.take() {
            return cached;
        }

        let u1 = Self::uniform_f64(self.rng.next_u32(), self.rng.next_u32());
        let u2 = Self::uniform_f64(self.rng.next_u32(), self.rng.next_u32());
        let r = (-2.0 * (1.0 - u2).ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u1;

        self.cached = Some((r * theta.sin()) as f32);
        (r * theta.cos()) as f32
    }

    /// Blocks of sixteen uniforms give eight cosine then eight sine samples.
    fn sample_blocks(&mut self, count: usize) -> Vec<f32> {
        let mut output = Vec::with_capacity(count);

        for _ in 0..count / 16 {
            let mut uniforms = [0.0_f32; 16];
            for u in uniforms.iter_mut() {
                *u = Self::uniform_f32(self.rng.next_u32());
            }

            let mut cos = [0.0_f32; 8];
            let mut sin = [0.0_f32; 8];
            for i in 0..8 {
                let r = (-2.0_f32 * (1.0 - uniforms[i]).ln()).sqrt();
                let theta = 2.0_f32 * std::f32::consts::PI * uniforms[8 + i];
                cos[i] = r * theta.cos();
                sin[i] = r * theta.sin();
            }
            output.extend_from_slice(&cos);
            output.extend_from_slice(&sin);
        }

        for _ in 0..count % 16 {
            output.push(self.sample());
        }
        output
    }

    pub fn randn(&mut self, shape: &[usize], device: &Device, dtype: DType) -> Result<Tensor> {
        let count: usize = shape.iter().product();
        let data = if count >= 16 {
            self.sample_blocks(count)
        } else {
            (0..count).map(|_| self.sample()).collect()
        };

        let tensor = Tensor::from_vec(data, shape, &Device::Cpu)?;
        let tensor = if device.is_cpu() {
            tensor
        } else {
            tensor.to_device(device)?
        };
        Ok(tensor.to_dtype(dtype)?)
    }

    pub fn randn_like(&mut self, like: &Tensor) -> Result<Tensor> {
        self.randn(like.dims(), like.device(), like.dtype())
    }
}
