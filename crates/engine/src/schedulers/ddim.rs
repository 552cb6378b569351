use anyhow::Result;
use candle_core::Tensor;

use super::{PredictionType, Scheduler, SchedulerConfig, TimestepSpacing};
use crate::noise::SeededNoise;

/// Deterministic DDIM (eta = 0).
#[derive(Debug, Clone)]
pub struct DdimScheduler {
    timesteps: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    step_ratio: usize,
    config: SchedulerConfig,
}

impl DdimScheduler {
    pub fn new(steps: usize, config: SchedulerConfig) -> Self {
        let alphas_cumprod = config.alphas_cumprod();
        let final_alpha_cumprod = if config.set_alpha_to_one {
            1.0
        } else {
            alphas_cumprod[0]
        };
        Self {
            timesteps: config.discrete_timesteps(steps, TimestepSpacing::Leading),
            step_ratio: config.num_train_timesteps / steps.max(1),
            alphas_cumprod,
            final_alpha_cumprod,
            config,
        }
    }

    fn alpha_at(&self, timestep: i64) -> f64 {
        if timestep >= 0 {
            self.alphas_cumprod[timestep as usize]
        } else {
            self.final_alpha_cumprod
        }
    }
}

/// `(x0, eps)` estimates from a discrete-time model output.
pub(crate) fn discrete_estimates(
    prediction: PredictionType,
    sample: &Tensor,
    model_output: &Tensor,
    alpha_prod: f64,
) -> Result<(Tensor, Tensor)> {
    let beta_prod = 1.0 - alpha_prod;
    let (sqrt_a, sqrt_b) = (alpha_prod.sqrt(), beta_prod.sqrt());
    let estimates = match prediction {
        PredictionType::Epsilon => {
            let x0 = ((sample - (model_output * sqrt_b)?)? / sqrt_a)?;
            (x0, model_output.clone())
        }
        PredictionType::VPrediction => {
            let x0 = ((sample * sqrt_a)? - (model_output * sqrt_b)?)?;
            let eps = ((model_output * sqrt_a)? + (sample * sqrt_b)?)?;
            (x0, eps)
        }
        PredictionType::Sample => {
            let eps = ((sample - (model_output * sqrt_a)?)? / sqrt_b)?;
            (model_output.clone(), eps)
        }
    };
    Ok(estimates)
}

/// `sqrt(ᾱ)·x + sqrt(1-ᾱ)·noise`
pub(crate) fn discrete_add_noise(original: &Tensor, noise: &Tensor, alpha_prod: f64) -> Result<Tensor> {
    Ok(((original * alpha_prod.sqrt())? + (noise * (1.0 - alpha_prod).sqrt())?)?)
}

impl Scheduler for DdimScheduler {
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
        _noise: &mut SeededNoise,
    ) -> Result<Tensor> {
        let timestep = self.timesteps[index] as i64;
        let prev_timestep = timestep - self.step_ratio as i64;
        let alpha_prod = self.alpha_at(timestep);
        let alpha_prod_prev = self.alpha_at(prev_timestep);

        let (mut x0, eps) = discrete_estimates(self.config.prediction_type, sample, model_output, alpha_prod)?;
        if self.config.clip_sample {
            let range = self.config.clip_sample_range;
            x0 = x0.clamp(-range, range)?;
        }

        let direction = (eps * (1.0 - alpha_prod_prev).sqrt())?;
        Ok(((x0 * alpha_prod_prev.sqrt())? + direction)?)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, index: usize) -> Result<Tensor> {
        let alpha_prod = self.alpha_at(self.timesteps[index] as i64);
        discrete_add_noise(original, noise, alpha_prod)
    }
}
