//! Discrete-time diffusion schedulers.
//!
//! Three schedulers for the Stable Diffusion denoising loop, all driven by
//! the checkpoint's `scheduler_config.json`:
//!
//! - [`ddpm`] — ancestral DDPM sampling with fixed-small variance
//! - [`dpm_solver`] — DPM-Solver++ (2nd order multistep, midpoint)
//! - [`euler`] — Euler discrete ODE sampler in sigma space
//!
//! ## Formulation
//!
//! The forward process is `x_t = √ᾱ_t · x_0 + √(1 - ᾱ_t) · ε` where `ᾱ_t`
//! is the running product of `1 - β`. Sigma-space schedulers use
//! `σ_t = √((1 - ᾱ_t) / ᾱ_t)`.

pub mod ddpm;
pub mod dpm_solver;
pub mod euler;

use candle_core::Tensor;

use crate::config::{PredictionType, SchedulerConfig, SchedulerKind, TimestepSpacing};
use crate::{Error, Result};

/// Common interface for all schedulers.
pub trait Scheduler {
    /// Set up the timestep schedule for a given number of inference steps.
    fn set_timesteps(&mut self, num_inference_steps: usize);

    /// Timesteps handed to the UNet, one per step, in denoising order.
    fn timesteps(&self) -> &[f64];

    /// Scale applied to the initial gaussian latents.
    fn init_noise_sigma(&self) -> f64;

    /// Scale the latents before they enter the UNet at `step_index`.
    fn scale_model_input(&self, sample: Tensor, step_index: usize) -> Result<Tensor>;

    /// Perform one scheduler step.
    ///
    /// - `model_output`: UNet prediction (guided)
    /// - `sample`: current noisy latent
    /// - `step_index`: which step we're on
    fn step(
        &mut self,
        model_output: &Tensor,
        sample: &Tensor,
        step_index: usize,
    ) -> Result<Tensor>;
}

/// Build and prime a scheduler for `num_inference_steps`.
///
/// `seed` drives the noise of stochastic schedulers (DDPM only).
pub fn build_scheduler(
    kind: SchedulerKind,
    config: SchedulerConfig,
    num_inference_steps: usize,
    seed: u64,
) -> Result<Box<dyn Scheduler>> {
    if num_inference_steps == 0 || num_inference_steps > config.num_train_timesteps {
        return Err(Error::Config(format!(
            "num_inference_steps must be in 1..={}, got {num_inference_steps}",
            config.num_train_timesteps
        )));
    }

    let mut scheduler: Box<dyn Scheduler> = match kind {
        SchedulerKind::Ddpm => Box::new(ddpm::DdpmScheduler::new(config, seed)),
        SchedulerKind::DpmSolverMultistep => {
            Box::new(dpm_solver::DpmSolverMultistepScheduler::new(config))
        }
        SchedulerKind::EulerDiscrete => Box::new(euler::EulerDiscreteScheduler::new(config)),
    };
    scheduler.set_timesteps(num_inference_steps);
    tracing::debug!(
        ?kind,
        steps = num_inference_steps,
        first = scheduler.timesteps().first().copied(),
        last = scheduler.timesteps().last().copied(),
        "scheduler ready"
    );
    Ok(scheduler)
}

/// Integer timesteps in denoising order, as diffusers lays them out.
///
/// `count` is the number of timesteps to produce; `steps_offset` only
/// applies to leading spacing. Halves round to even, as numpy does.
pub(crate) fn spaced_timesteps(
    spacing: TimestepSpacing,
    num_train_timesteps: usize,
    count: usize,
    steps_offset: usize,
) -> Vec<usize> {
    let n_train = num_train_timesteps as f64;
    match spacing {
        TimestepSpacing::Linspace => crate::config::linspace(0.0, n_train - 1.0, count)
            .into_iter()
            .rev()
            .map(|t| t.round_ties_even() as usize)
            .collect(),
        TimestepSpacing::Leading => {
            let step_ratio = num_train_timesteps / count;
            (0..count)
                .rev()
                .map(|i| (i * step_ratio + steps_offset).min(num_train_timesteps - 1))
                .collect()
        }
        TimestepSpacing::Trailing => {
            let step_ratio = n_train / count as f64;
            (0..count)
                .map(|i| {
                    ((n_train - i as f64 * step_ratio).round_ties_even() as usize).saturating_sub(1)
                })
                .collect()
        }
    }
}

/// Recover the clean sample `x_0` from a UNet prediction.
pub(crate) fn predict_original(
    prediction_type: PredictionType,
    model_output: &Tensor,
    sample: &Tensor,
    alpha_prod_t: f64,
) -> Result<Tensor> {
    let sqrt_alpha = alpha_prod_t.sqrt();
    let sqrt_beta = (1.0 - alpha_prod_t).sqrt();
    let x0 = match prediction_type {
        PredictionType::Epsilon => ((sample - (model_output * sqrt_beta)?)? / sqrt_alpha)?,
        PredictionType::VPrediction => ((sample * sqrt_alpha)? - (model_output * sqrt_beta)?)?,
        PredictionType::Sample => model_output.clone(),
    };
    Ok(x0)
}

/// `σ = √((1 - ᾱ) / ᾱ)` for every training timestep.
pub(crate) fn sigmas_from_alphas_cumprod(alphas_cumprod: &[f64]) -> Vec<f64> {
    alphas_cumprod
        .iter()
        .map(|a| ((1.0 - a) / a).sqrt())
        .collect()
}

/// Piecewise-linear interpolation of `table` (indexed 0..len) at `x`.
pub(crate) fn interp(table: &[f64], x: f64) -> f64 {
    if x <= 0.0 {
        return table[0];
    }
    let last = table.len() - 1;
    if x >= last as f64 {
        return table[last];
    }
    let lo = x.floor() as usize;
    let frac = x - lo as f64;
    table[lo] * (1.0 - frac) + table[lo + 1] * frac
}
