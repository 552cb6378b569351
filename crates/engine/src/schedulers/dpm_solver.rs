use anyhow::Result;
use candle_core::Tensor;

use super::{
    interp, karras_sigmas, linspace, sigma_to_t, training_sigmas, PredictionType, Scheduler,
    SchedulerConfig, TimestepSpacing,
};
use crate::noise::SeededNoise;

/// DPM-Solver++ (2M, midpoint) with a first-order final step.
#[derive(Debug, Clone)]
pub struct DpmSolverMultistepScheduler {
    timesteps: Vec<f64>,
    /// One longer than `timesteps`, ending at zero.
    sigmas: Vec<f64>,
    /// Last two data predictions, oldest first.
    outputs: Vec<Tensor>,
    lower_order_nums: usize,
    config: SchedulerConfig,
}

impl DpmSolverMultistepScheduler {
    pub fn new(steps: usize, config: SchedulerConfig) -> Self {
        let n = config.num_train_timesteps;
        let training = training_sigmas(&config.alphas_cumprod());

        let mut timesteps: Vec<f64> = match config.spacing_or(TimestepSpacing::Linspace) {
            TimestepSpacing::Linspace => {
                let mut ts: Vec<f64> = linspace(0.0, (n - 1) as f64, steps + 1)
                    .into_iter()
                    .map(f64::round)
                    .collect();
                ts.reverse();
                ts.truncate(steps);
                ts
            }
            TimestepSpacing::Leading => {
                let ratio = n / (steps + 1);
                (1..=steps)
                    .rev()
                    .map(|i| (i * ratio + config.steps_offset) as f64)
                    .collect()
            }
            TimestepSpacing::Trailing => {
                let ratio = n as f64 / steps as f64;
                (0..steps)
                    .map(|i| (n as f64 - i as f64 * ratio).round() - 1.0)
                    .collect()
            }
        };

        let mut sigmas = if config.use_karras_sigmas {
            let log_sigmas: Vec<f64> = training.iter().map(|s| s.ln()).collect();
            let sigmas = karras_sigmas(training[0], training[training.len() - 1], steps);
            timesteps = sigmas
                .iter()
                .map(|&s| sigma_to_t(s, &log_sigmas).round())
                .collect();
            sigmas
        } else {
            let positions: Vec<f64> = (0..training.len()).map(|i| i as f64).collect();
            timesteps
                .iter()
                .map(|&t| interp(t, &positions, &training))
                .collect()
        };
        sigmas.push(0.0);

        Self {
            timesteps,
            sigmas,
            outputs: Vec::with_capacity(2),
            lower_order_nums: 0,
            config,
        }
    }

    /// `(α_t, σ_t)` of the variance-preserving form for a sigma-space level.
    fn alpha_sigma(sigma: f64) -> (f64, f64) {
        let alpha = 1.0 / (sigma * sigma + 1.0).sqrt();
        (alpha, sigma * alpha)
    }

    fn lambda(sigma: f64) -> f64 {
        let (alpha, sigma) = Self::alpha_sigma(sigma);
        alpha.ln() - sigma.ln()
    }

    fn data_prediction(&self, model_output: &Tensor, index: usize, sample: &Tensor) -> Result<Tensor> {
        let (alpha, sigma) = Self::alpha_sigma(self.sigmas[index]);
        let x0 = match self.config.prediction_type {
            PredictionType::Epsilon => ((sample - (model_output * sigma)?)? / alpha)?,
            PredictionType::VPrediction => ((sample * alpha)? - (model_output * sigma)?)?,
            PredictionType::Sample => model_output.clone(),
        };
        Ok(x0)
    }
}

impl Scheduler for DpmSolverMultistepScheduler {
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
        let x0 = self.data_prediction(model_output, index, sample)?;
        if self.outputs.len() == 2 {
            self.outputs.remove(0);
        }
        self.outputs.push(x0);

        let final_step = index == self.timesteps.len() - 1;
        let sigma_t = self.sigmas[index + 1];
        let sigma_s0 = self.sigmas[index];
        let (alpha_t, sigma_t_vp) = Self::alpha_sigma(sigma_t);
        let (_, sigma_s0_vp) = Self::alpha_sigma(sigma_s0);

        // At sigma = 0 the update collapses onto the data prediction
        let (sample_coeff, phi) = if sigma_t == 0.0 {
            (0.0, -1.0)
        } else {
            let h = Self::lambda(sigma_t) - Self::lambda(sigma_s0);
            (sigma_t_vp / sigma_s0_vp, (-h).exp() - 1.0)
        };

        let d0 = &self.outputs[self.outputs.len() - 1];
        let mut prev = ((sample * sample_coeff)? - (d0 * (alpha_t * phi))?)?;

        if self.lower_order_nums >= 1 && !final_step && self.outputs.len() == 2 && index >= 1 {
            let sigma_s1 = self.sigmas[index - 1];
            let h = Self::lambda(sigma_t) - Self::lambda(sigma_s0);
            let h0 = Self::lambda(sigma_s0) - Self::lambda(sigma_s1);
            let r0 = h0 / h;
            let d1 = ((d0 - &self.outputs[0])? / r0)?;
            prev = (prev - (d1 * (0.5 * alpha_t * phi))?)?;
        }

        if self.lower_order_nums < 2 {
            self.lower_order_nums += 1;
        }
        Ok(prev)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, index: usize) -> Result<Tensor> {
        let (alpha, sigma) = Self::alpha_sigma(self.sigmas[index]);
        Ok(((original * alpha)? + (noise * sigma)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn linspace_schedule_drops_the_last_point() {
        let scheduler = DpmSolverMultistepScheduler::new(4, SchedulerConfig::default());
        assert_eq!(scheduler.timesteps(), &[999.0, 749.0, 500.0, 250.0]);
        assert_eq!(scheduler.sigmas.len(), 5);
    }

    #[test]
    fn exact_noise_prediction_recovers_sample() {
        let mut scheduler = DpmSolverMultistepScheduler::new(6, SchedulerConfig::default());
        let clean = Tensor::full(0.75f32, (1, 4, 2, 2), &Device::Cpu).unwrap();
        let noise = Tensor::ones((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let mut rng = SeededNoise::new(0);

        let mut sample = scheduler.add_noise(&clean, &noise, 0).unwrap();
        for i in 0..6 {
            // Epsilon that maps the current sample exactly back onto `clean`
            let (alpha, sigma) = DpmSolverMultistepScheduler::alpha_sigma(scheduler.sigmas[i]);
            let eps = ((&sample - (&clean * alpha).unwrap()).unwrap() / sigma).unwrap();
            sample = scheduler.step(&eps, i, &sample, &mut rng).unwrap();
        }
        let values: Vec<f32> = sample.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (v - 0.75).abs() < 1e-3), "{values:?}");
    }
}
