use anyhow::Result;
use candle_core::Tensor;

use super::ddim::{discrete_add_noise, discrete_estimates};
use super::{Scheduler, SchedulerConfig, TimestepSpacing};
use crate::noise::SeededNoise;

/// Ancestral DDPM with the fixed-small variance.
#[derive(Debug, Clone)]
pub struct DdpmScheduler {
    timesteps: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    step_ratio: usize,
    config: SchedulerConfig,
}

impl DdpmScheduler {
    pub fn new(steps: usize, config: SchedulerConfig) -> Self {
        Self {
            timesteps: config.discrete_timesteps(steps, TimestepSpacing::Leading),
            alphas_cumprod: config.alphas_cumprod(),
            step_ratio: config.num_train_timesteps / steps.max(1),
            config,
        }
    }
}

impl Scheduler for DdpmScheduler {
    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn scale_model_input(&self, sample: Tensor, _index: usize) -> Result<Tensor> {
        Ok(sample)
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        index: usize,
        sample: &Tensor,
        noise: &mut SeededNoise,
    ) -> Result<Tensor> {
        let timestep = self.timesteps[index] as i64;
        let prev_timestep = timestep - self.step_ratio as i64;
        let alpha_prod = self.alphas_cumprod[timestep as usize];
        let alpha_prod_prev = if prev_timestep >= 0 {
            self.alphas_cumprod[prev_timestep as usize]
        } else {
            1.0
        };
        let beta_prod = 1.0 - alpha_prod;
        let beta_prod_prev = 1.0 - alpha_prod_prev;
        let current_alpha = alpha_prod / alpha_prod_prev;
        let current_beta = 1.0 - current_alpha;

        let (mut x0, _) = discrete_estimates(self.config.prediction_type, sample, model_output, alpha_prod)?;
        if self.config.clip_sample {
            let range = self.config.clip_sample_range;
            x0 = x0.clamp(-range, range)?;
        }

        let x0_coeff = alpha_prod_prev.sqrt() * current_beta / beta_prod;
        let sample_coeff = current_alpha.sqrt() * beta_prod_prev / beta_prod;
        let prev = ((x0 * x0_coeff)? + (sample * sample_coeff)?)?;

        if timestep > 0 {
            let variance = (beta_prod_prev / beta_prod * current_beta).max(1e-20);
            let fresh = noise.randn_like(model_output)?;
            Ok((prev + (fresh * variance.sqrt())?)?)
        } else {
            Ok(prev)
        }
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, index: usize) -> Result<Tensor> {
        let alpha_prod = self.alphas_cumprod[self.timesteps[index] as usize];
        discrete_add_noise(original, noise, alpha_prod)
    }
}
