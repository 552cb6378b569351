use anyhow::Result;
use candle_core::Tensor;

use super::euler::sigma_schedule;
use super::{sigma_space_init_noise, sigma_space_x0, Scheduler, SchedulerConfig, TimestepSpacing};
use crate::noise::SeededNoise;

/// Ancestral Euler sampling: each step overshoots to `sigma_down` and adds
/// fresh seeded noise of size `sigma_up`.
#[derive(Debug, Clone)]
pub struct EulerAncestralScheduler {
    timesteps: Vec<f64>,
    sigmas: Vec<f64>,
    init_noise_sigma: f64,
    config: SchedulerConfig,
}

impl EulerAncestralScheduler {
    pub fn new(steps: usize, config: SchedulerConfig) -> Self {
        // Karras sigmas are not offered for the ancestral variant
        let config = SchedulerConfig {
            use_karras_sigmas: false,
            ..config
        };
        let (timesteps, sigmas) = sigma_schedule(&config, steps);
        let init_noise_sigma = sigma_space_init_noise(&sigmas, config.spacing_or(TimestepSpacing::Linspace));
        Self {
            timesteps,
            sigmas,
            init_noise_sigma,
            config,
        }
    }
}

impl Scheduler for EulerAncestralScheduler {
    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }

    fn scale_model_input(&self, sample: Tensor, index: usize) -> Result<Tensor> {
        let sigma = self.sigmas[index];
        Ok((sample / (sigma * sigma + 1.0).sqrt())?)
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        index: usize,
        sample: &Tensor,
        noise: &mut SeededNoise,
    ) -> Result<Tensor> {
        let sigma_from = self.sigmas[index];
        let sigma_to = self.sigmas[index + 1];
        let sigma_up = (sigma_to * sigma_to * (sigma_from * sigma_from - sigma_to * sigma_to)
            / (sigma_from * sigma_from))
            .sqrt();
        let sigma_down = (sigma_to * sigma_to - sigma_up * sigma_up).max(0.0).sqrt();

        let x0 = sigma_space_x0(self.config.prediction_type, sample, model_output, sigma_from)?;
        let derivative = ((sample - x0)? / sigma_from)?;
        let dt = sigma_down - sigma_from;
        let prev = (sample + (derivative * dt)?)?;

        let fresh = noise.randn_like(model_output)?;
        Ok((prev + (fresh * sigma_up)?)?)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, index: usize) -> Result<Tensor> {
        Ok((original + (noise * self.sigmas[index])?)?)
    }
}
