//! Euler discrete scheduler.
//!
//! First-order ODE integrator in sigma space:
//! ```text
//! x̂_0 = x - σ·ε                                  (epsilon)
//! x̂_0 = -σ/√(σ²+1) · v + x/(σ²+1)                (v_prediction)
//! d   = (x - x̂_0) / σ
//! x'  = x + (σ_next - σ) · d
//! ```
//! Latents live at scale `√(σ²+1)`; the UNet sees `x / √(σ²+1)`.

use candle_core::Tensor;

use super::{Scheduler, interp, sigmas_from_alphas_cumprod};
use crate::config::{PredictionType, SchedulerConfig, TimestepSpacing, linspace};
use crate::{Error, Result};

/// Euler discrete scheduler.
pub struct EulerDiscreteScheduler {
    config: SchedulerConfig,
    /// Sigma for every training timestep.
    train_sigmas: Vec<f64>,
    timesteps: Vec<f64>,
    sigmas: Vec<f64>,
}

impl EulerDiscreteScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let train_sigmas = sigmas_from_alphas_cumprod(&config.alphas_cumprod());
        Self {
            config,
            train_sigmas,
            timesteps: Vec::new(),
            sigmas: Vec::new(),
        }
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    fn spacing(&self) -> TimestepSpacing {
        self.config
            .timestep_spacing
            .unwrap_or(TimestepSpacing::Linspace)
    }
}

impl Scheduler for EulerDiscreteScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) {
        let n_train = self.config.num_train_timesteps as f64;
        let n = num_inference_steps;

        self.timesteps = match self.spacing() {
            // Fractional timesteps; the UNet embeds them as floats.
            TimestepSpacing::Linspace => linspace(0.0, n_train - 1.0, n).into_iter().rev().collect(),
            TimestepSpacing::Leading => {
                let step_ratio = self.config.num_train_timesteps / n;
                (0..n)
                    .rev()
                    .map(|i| (i * step_ratio + self.config.steps_offset) as f64)
                    .collect()
            }
            TimestepSpacing::Trailing => {
                let step_ratio = n_train / n as f64;
                (0..n)
                    .map(|i| (n_train - i as f64 * step_ratio).round_ties_even() - 1.0)
                    .collect()
            }
        };

        self.sigmas = self
            .timesteps
            .iter()
            .map(|&t| interp(&self.train_sigmas, t))
            .collect();
        self.sigmas.push(0.0);
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        let max_sigma = self.sigmas.iter().copied().fold(0.0, f64::max);
        match self.spacing() {
            TimestepSpacing::Linspace | TimestepSpacing::Trailing => max_sigma,
            TimestepSpacing::Leading => (max_sigma * max_sigma + 1.0).sqrt(),
        }
    }

    fn scale_model_input(&self, sample: Tensor, step_index: usize) -> Result<Tensor> {
        let sigma = self.sigmas[step_index];
        Ok((sample / (sigma * sigma + 1.0).sqrt())?)
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        sample: &Tensor,
        step_index: usize,
    ) -> Result<Tensor> {
        let sigma = self.sigmas[step_index];
        let sigma_next = self.sigmas[step_index + 1];

        let x0 = match self.config.prediction_type {
            PredictionType::Epsilon => (sample - (model_output * sigma)?)?,
            PredictionType::VPrediction => {
                let denom = sigma * sigma + 1.0;
                ((model_output * (-sigma / denom.sqrt()))? + (sample / denom)?)?
            }
            PredictionType::Sample => {
                return Err(Error::Config(
                    "euler discrete scheduler does not support prediction_type=sample".into(),
                ));
            }
        };

        let derivative = ((sample - x0)? / sigma)?;
        let next = (sample + (derivative * (sigma_next - sigma))?)?;
        Ok(next)
    }
}
