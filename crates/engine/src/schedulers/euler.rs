use anyhow::Result;
use candle_core::Tensor;

use super::{
    karras_sigmas, sigma_space_init_noise, sigma_space_x0, sigma_to_t, sigmas_at, training_sigmas,
    Scheduler, SchedulerConfig, TimestepSpacing,
};
use crate::noise::SeededNoise;

/// Euler method (Karras et al. 2022, algorithm 2) without churn.
#[derive(Debug, Clone)]
pub struct EulerDiscreteScheduler {
    timesteps: Vec<f64>,
    /// One longer than `timesteps`, ending at zero.
    sigmas: Vec<f64>,
    init_noise_sigma: f64,
    config: SchedulerConfig,
}

impl EulerDiscreteScheduler {
    pub fn new(steps: usize, config: SchedulerConfig) -> Self {
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

/// Timesteps and sigmas shared by the sigma-space samplers.
pub(crate) fn sigma_schedule(config: &SchedulerConfig, steps: usize) -> (Vec<f64>, Vec<f64>) {
    let training = training_sigmas(&config.alphas_cumprod());
    let mut timesteps = config.sigma_timesteps(steps, TimestepSpacing::Linspace);
    let mut sigmas = sigmas_at(&timesteps, &training);

    if config.use_karras_sigmas {
        let log_sigmas: Vec<f64> = training.iter().map(|s| s.ln()).collect();
        let (min, max) = (sigmas[sigmas.len() - 1], sigmas[0]);
        sigmas = karras_sigmas(min, max, steps);
        timesteps = sigmas.iter().map(|&s| sigma_to_t(s, &log_sigmas)).collect();
    }

    sigmas.push(0.0);
    (timesteps, sigmas)
}

impl Scheduler for EulerDiscreteScheduler {
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
        _noise: &mut SeededNoise,
    ) -> Result<Tensor> {
        let sigma = self.sigmas[index];
        let x0 = sigma_space_x0(self.config.prediction_type, sample, model_output, sigma)?;
        let derivative = ((sample - x0)? / sigma)?;
        let dt = self.sigmas[index + 1] - sigma;
        Ok((sample + (derivative * dt)?)?)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, index: usize) -> Result<Tensor> {
        Ok((original + (noise * self.sigmas[index])?)?)
    }
}
