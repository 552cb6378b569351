//! Noise schedulers.
//!
//! Every scheduler is built from the checkpoint's scheduler configuration
//! (merged with the registry overrides) and indexed by position in its own
//! timestep list, so a pass that starts mid-schedule simply begins at a
//! later index.

mod ddim;
mod ddpm;
mod dpm_solver;
mod euler;
mod euler_ancestral;
mod lms;

use anyhow::{Context, Result};
use candle_core::Tensor;
use seedalchemy_core::schedulers::{SchedulerKind, SchedulerSpec};
use serde::Deserialize;

use crate::noise::SeededNoise;

pub use ddim::DdimScheduler;
pub use ddpm::DdpmScheduler;
pub use dpm_solver::DpmSolverMultistepScheduler;
pub use euler::EulerDiscreteScheduler;
pub use euler_ancestral::EulerAncestralScheduler;
pub use lms::LmsDiscreteScheduler;

pub trait Scheduler: Send {
    /// Denoiser timesteps, highest noise first.
    fn timesteps(&self) -> &[f64];

    fn init_noise_sigma(&self) -> f64;

    fn scale_model_input(&self, sample: Tensor, index: usize) -> Result<Tensor>;

    /// Advance `sample` from `timesteps()[index]` to the next timestep.
    fn step(
        &mut self,
        model_output: &Tensor,
        index: usize,
        sample: &Tensor,
        noise: &mut SeededNoise,
    ) -> Result<Tensor>;

    /// Noise `original` to the level of `timesteps()[index]`.
    fn add_noise(&self, original: &Tensor, noise: &Tensor, index: usize) -> Result<Tensor>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
    SquaredcosCapV2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Epsilon,
    VPrediction,
    Sample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepSpacing {
    Linspace,
    Leading,
    Trailing,
}

/// Scheduler configuration as stored in `scheduler_config.json`. Unknown
/// keys are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub prediction_type: PredictionType,
    /// Each scheduler has its own default when absent.
    pub timestep_spacing: Option<TimestepSpacing>,
    pub steps_offset: usize,
    pub use_karras_sigmas: bool,
    pub clip_sample: bool,
    pub clip_sample_range: f64,
    pub set_alpha_to_one: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            prediction_type: PredictionType::Epsilon,
            timestep_spacing: None,
            steps_offset: 0,
            use_karras_sigmas: false,
            clip_sample: false,
            clip_sample_range: 1.0,
            set_alpha_to_one: false,
        }
    }
}

impl SchedulerConfig {
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        // `null` entries such as `trained_betas` fall back to the defaults
        let value = seedalchemy_core::metadata::strip_nulls(value.clone());
        serde_json::from_value(value).context("Invalid scheduler configuration")
    }

    pub(crate) fn spacing_or(&self, default: TimestepSpacing) -> TimestepSpacing {
        self.timestep_spacing.unwrap_or(default)
    }

    pub(crate) fn alphas_cumprod(&self) -> Vec<f64> {
        let n = self.num_train_timesteps;
        let betas: Vec<f64> = match self.beta_schedule {
            BetaSchedule::Linear => linspace(self.beta_start, self.beta_end, n),
            BetaSchedule::ScaledLinear => linspace(self.beta_start.sqrt(), self.beta_end.sqrt(), n)
                .into_iter()
                .map(|b| b * b)
                .collect(),
            BetaSchedule::SquaredcosCapV2 => {
                let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
                (0..n)
                    .map(|i| {
                        let t1 = i as f64 / n as f64;
                        let t2 = (i + 1) as f64 / n as f64;
                        (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
                    })
                    .collect()
            }
        };

        let mut product = 1.0;
        betas
            .into_iter()
            .map(|beta| {
                product *= 1.0 - beta;
                product
            })
            .collect()
    }

    /// Timesteps for samplers working in sigma space; fractional values are kept.
    pub(crate) fn sigma_timesteps(&self, steps: usize, default: TimestepSpacing) -> Vec<f64> {
        let n = self.num_train_timesteps;
        match self.spacing_or(default) {
            TimestepSpacing::Linspace => {
                let mut ts = linspace(0.0, (n - 1) as f64, steps);
                ts.reverse();
                ts
            }
            TimestepSpacing::Leading => {
                let ratio = n / steps.max(1);
                (0..steps)
                    .rev()
                    .map(|i| (i * ratio + self.steps_offset) as f64)
                    .collect()
            }
            TimestepSpacing::Trailing => trailing(n, steps),
        }
    }

    /// Integer timesteps for the DDIM family.
    pub(crate) fn discrete_timesteps(&self, steps: usize, default: TimestepSpacing) -> Vec<f64> {
        let n = self.num_train_timesteps;
        match self.spacing_or(default) {
            TimestepSpacing::Linspace => {
                let mut ts: Vec<f64> = linspace(0.0, (n - 1) as f64, steps)
                    .into_iter()
                    .map(f64::round)
                    .collect();
                ts.reverse();
                ts
            }
            TimestepSpacing::Leading => {
                let ratio = n / steps.max(1);
                (0..steps)
                    .rev()
                    .map(|i| (i * ratio + self.steps_offset) as f64)
                    .collect()
            }
            TimestepSpacing::Trailing => trailing(n, steps),
        }
    }
}

fn trailing(train_steps: usize, steps: usize) -> Vec<f64> {
    let ratio = train_steps as f64 / steps.max(1) as f64;
    (0..steps)
        .map(|i| (train_steps as f64 - i as f64 * ratio).round() - 1.0)
        .collect()
}

/// `steps` evenly spaced values from `start` to `end` inclusive.
pub(crate) fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let delta = (end - start) / (steps - 1) as f64;
            (0..steps).map(|i| start + delta * i as f64).collect()
        }
    }
}

/// Piecewise-linear interpolation of `(xp, fp)` at `x`, clamped at the ends.
pub(crate) fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    if x <= xp[0] {
        return fp[0];
    }
    let last = xp.len() - 1;
    if x >= xp[last] {
        return fp[last];
    }
    let upper = xp.partition_point(|&v| v <= x);
    let (x0, x1) = (xp[upper - 1], xp[upper]);
    let (f0, f1) = (fp[upper - 1], fp[upper]);
    f0 + (f1 - f0) * (x - x0) / (x1 - x0)
}

/// `sqrt((1 - ᾱ) / ᾱ)` for every training timestep.
pub(crate) fn training_sigmas(alphas_cumprod: &[f64]) -> Vec<f64> {
    alphas_cumprod
        .iter()
        .map(|a| ((1.0 - a) / a).sqrt())
        .collect()
}

/// Sigmas of `timesteps` interpolated from the training schedule.
pub(crate) fn sigmas_at(timesteps: &[f64], training: &[f64]) -> Vec<f64> {
    let positions: Vec<f64> = (0..training.len()).map(|i| i as f64).collect();
    timesteps
        .iter()
        .map(|&t| interp(t, &positions, training))
        .collect()
}

/// Karras et al. (2022) noise levels between the extremes of `sigmas`.
pub(crate) fn karras_sigmas(sigma_min: f64, sigma_max: f64, steps: usize) -> Vec<f64> {
    const RHO: f64 = 7.0;
    let min_inv_rho = sigma_min.powf(1.0 / RHO);
    let max_inv_rho = sigma_max.powf(1.0 / RHO);
    linspace(0.0, 1.0, steps)
        .into_iter()
        .map(|ramp| (max_inv_rho + ramp * (min_inv_rho - max_inv_rho)).powf(RHO))
        .collect()
}

/// Fractional training timestep whose sigma is `sigma`.
pub(crate) fn sigma_to_t(sigma: f64, log_sigmas: &[f64]) -> f64 {
    let log_sigma = sigma.max(1e-10).ln();
    let low = log_sigmas
        .iter()
        .rposition(|&ls| log_sigma - ls >= 0.0)
        .unwrap_or(0)
        .min(log_sigmas.len() - 2);
    let high = low + 1;
    let w = ((log_sigmas[low] - log_sigma) / (log_sigmas[low] - log_sigmas[high])).clamp(0.0, 1.0);
    (1.0 - w) * low as f64 + w * high as f64
}

/// Denoised estimate from a sigma-space model output.
pub(crate) fn sigma_space_x0(
    prediction: PredictionType,
    sample: &Tensor,
    model_output: &Tensor,
    sigma: f64,
) -> Result<Tensor> {
    let x0 = match prediction {
        PredictionType::Epsilon => (sample - (model_output * sigma)?)?,
        PredictionType::VPrediction => {
            let c_out = -sigma / (sigma * sigma + 1.0).sqrt();
            let c_skip = 1.0 / (sigma * sigma + 1.0);
            ((model_output * c_out)? + (sample * c_skip)?)?
        }
        PredictionType::Sample => model_output.clone(),
    };
    Ok(x0)
}

/// `max(σ)` for linspace/trailing spacing, `sqrt(max(σ)² + 1)` otherwise.
pub(crate) fn sigma_space_init_noise(sigmas: &[f64], spacing: TimestepSpacing) -> f64 {
    let max = sigmas.iter().copied().fold(0.0, f64::max);
    match spacing {
        TimestepSpacing::Linspace | TimestepSpacing::Trailing => max,
        TimestepSpacing::Leading => (max * max + 1.0).sqrt(),
    }
}

/// Build the scheduler named by `spec` for `steps` inference steps.
pub fn build(spec: &SchedulerSpec, snapshot: &serde_json::Value, steps: usize) -> Result<Box<dyn Scheduler>> {
    let config = SchedulerConfig::from_value(&spec.merged_config(snapshot))?;
    let steps = steps.max(1);
    let scheduler: Box<dyn Scheduler> = match spec.kind {
        SchedulerKind::Ddim => Box::new(DdimScheduler::new(steps, config)),
        SchedulerKind::Ddpm => Box::new(DdpmScheduler::new(steps, config)),
        SchedulerKind::EulerDiscrete => Box::new(EulerDiscreteScheduler::new(steps, config)),
        SchedulerKind::EulerAncestral => Box::new(EulerAncestralScheduler::new(steps, config)),
        SchedulerKind::DpmSolverMultistep => Box::new(DpmSolverMultistepScheduler::new(steps, config)),
        SchedulerKind::LmsDiscrete => Box::new(LmsDiscreteScheduler::new(steps, config)),
    };
    Ok(scheduler)
}
