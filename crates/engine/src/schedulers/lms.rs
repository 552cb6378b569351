use anyhow::Result;
use candle_core::Tensor;

use super::euler::sigma_schedule;
use super::{sigma_space_init_noise, sigma_space_x0, Scheduler, SchedulerConfig, TimestepSpacing};
use crate::noise::SeededNoise;

const ORDER: usize = 4;

/// Linear multistep sampler over up to four past derivatives.
#[derive(Debug, Clone)]
pub struct LmsDiscreteScheduler {
    timesteps: Vec<f64>,
    sigmas: Vec<f64>,
    init_noise_sigma: f64,
    /// Most recent last.
    derivatives: Vec<Tensor>,
    config: SchedulerConfig,
}

impl LmsDiscreteScheduler {
    pub fn new(steps: usize, config: SchedulerConfig) -> Self {
        let (timesteps, sigmas) = sigma_schedule(&config, steps);
        let init_noise_sigma = sigma_space_init_noise(&sigmas, config.spacing_or(TimestepSpacing::Linspace));
        Self {
            timesteps,
            sigmas,
            init_noise_sigma,
            derivatives: Vec::with_capacity(ORDER),
            config,
        }
    }

    /// Integral over `[σ_i, σ_{i+1}]` of the Lagrange basis polynomial for
    /// the derivative taken `current` steps ago.
    fn coefficient(&self, order: usize, index: usize, current: usize) -> f64 {
        let basis = |tau: f64| {
            (0..order)
                .filter(|&k| k != current)
                .map(|k| {
                    (tau - self.sigmas[index - k]) / (self.sigmas[index - current] - self.sigmas[index - k])
                })
                .product::<f64>()
        };
        gauss_legendre(basis, self.sigmas[index], self.sigmas[index + 1])
    }
}

/// Four-point Gauss-Legendre quadrature, exact for the cubic bases used here.
fn gauss_legendre(f: impl Fn(f64) -> f64, a: f64, b: f64) -> f64 {
    const NODES: [f64; 4] = [-0.861_136_311_594_052_6, -0.339_981_043_584_856_3, 0.339_981_043_584_856_3, 0.861_136_311_594_052_6];
    const WEIGHTS: [f64; 4] = [0.347_854_845_137_453_8, 0.652_145_154_862_546_2, 0.652_145_154_862_546_2, 0.347_854_845_137_453_8];
    let half = (b - a) / 2.0;
    let mid = (a + b) / 2.0;
    NODES
        .iter()
        .zip(WEIGHTS)
        .map(|(x, w)| w * f(mid + half * x))
        .sum::<f64>()
        * half
}

impl Scheduler for LmsDiscreteScheduler {
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
        if self.derivatives.len() == ORDER {
            self.derivatives.remove(0);
        }
        self.derivatives.push(derivative);

        // History only covers steps this instance has taken
        let order = self.derivatives.len().min(index + 1);
        let mut prev = sample.clone();
        for (current, derivative) in self.derivatives.iter().rev().take(order).enumerate() {
            let coeff = self.coefficient(order, index, current);
            prev = (prev + (derivative * coeff)?)?;
        }
        Ok(prev)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, index: usize) -> Result<Tensor> {
        Ok((original + (noise * self.sigmas[index])?)?)
    }
}
