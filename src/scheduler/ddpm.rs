//! DDPM ancestral sampler.
//!
//! For consecutive timesteps `t → p` (`p = -1` after the last step):
//! ```text
//! α_t  = ᾱ_t / ᾱ_p          β_t = 1 - α_t
//! x̂_0  = predict_original(model_output, x_t)
//! μ    = √ᾱ_p · β_t / (1 - ᾱ_t) · x̂_0  +  √α_t · (1 - ᾱ_p) / (1 - ᾱ_t) · x_t
//! σ²   = (1 - ᾱ_p) / (1 - ᾱ_t) · β_t       // "fixed_small"
//! x_p  = μ + σ · ε                          // ε only when t > 0
//! ```
//! with `ᾱ_{-1} = 1`.

use candle_core::Tensor;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::{Scheduler, predict_original, spaced_timesteps};
use crate::Result;
use crate::config::{SchedulerConfig, TimestepSpacing};

/// DDPM scheduler.
pub struct DdpmScheduler {
    config: SchedulerConfig,
    alphas_cumprod: Vec<f64>,
    timesteps: Vec<f64>,
    rng: ChaCha8Rng,
}

impl DdpmScheduler {
    pub fn new(config: SchedulerConfig, seed: u64) -> Self {
        let alphas_cumprod = config.alphas_cumprod();
        Self {
            config,
            alphas_cumprod,
            timesteps: Vec::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    fn alpha_prod_at(&self, timestep: Option<usize>) -> f64 {
        timestep.map_or(1.0, |t| self.alphas_cumprod[t])
    }
}

impl Scheduler for DdpmScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) {
        let spacing = self
            .config
            .timestep_spacing
            .unwrap_or(TimestepSpacing::Leading);
        self.timesteps = spaced_timesteps(
            spacing,
            self.config.num_train_timesteps,
            num_inference_steps,
            self.config.steps_offset,
        )
        .into_iter()
        .map(|t| t as f64)
        .collect();
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn scale_model_input(&self, sample: Tensor, _step_index: usize) -> Result<Tensor> {
        Ok(sample)
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        sample: &Tensor,
        step_index: usize,
    ) -> Result<Tensor> {
        let t = self.timesteps[step_index] as usize;
        let prev_t = self.timesteps.get(step_index + 1).map(|&p| p as usize);

        let alpha_prod_t = self.alpha_prod_at(Some(t));
        let alpha_prod_prev = self.alpha_prod_at(prev_t);
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_prev = 1.0 - alpha_prod_prev;
        let current_alpha = alpha_prod_t / alpha_prod_prev;
        let current_beta = 1.0 - current_alpha;

        let mut x0 = predict_original(
            self.config.prediction_type,
            model_output,
            sample,
            alpha_prod_t,
        )?;
        if self.config.clip_sample.unwrap_or(true) {
            let range = self.config.clip_sample_range;
            x0 = x0.clamp(-range, range)?;
        }

        let x0_coeff = alpha_prod_prev.sqrt() * current_beta / beta_prod_t;
        let sample_coeff = current_alpha.sqrt() * beta_prod_prev / beta_prod_t;
        let mean = ((x0 * x0_coeff)? + (sample * sample_coeff)?)?;

        if t == 0 {
            return Ok(mean);
        }

        let variance = (beta_prod_prev / beta_prod_t * current_beta).max(1e-20);
        let noise = crate::noise::randn(
            &mut self.rng,
            sample.shape(),
            sample.device(),
            sample.dtype(),
        )?;
        let next = (mean + (noise * variance.sqrt())?)?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PredictionType;
    use candle_core::{DType, Device};

    fn sd_scheduler(steps: usize) -> DdpmScheduler {
        let mut scheduler = DdpmScheduler::new(SchedulerConfig::stable_diffusion(), 0);
        scheduler.set_timesteps(steps);
        scheduler
    }

    #[test]
    fn timesteps_setup() {
        let scheduler = sd_scheduler(50);
        assert_eq!(scheduler.timesteps().len(), 50);
        assert_eq!(scheduler.timesteps()[0], 981.0);
        assert_eq!(scheduler.timesteps()[49], 1.0);
        assert_eq!(scheduler.init_noise_sigma(), 1.0);
    }

    #[test]
    fn final_step_without_noise_returns_x0() {
        // A single step over timestep 0 lands on ᾱ_p = 1, so μ = x̂_0 and no
        // noise is added.
        let config = SchedulerConfig {
            timestep_spacing: Some(TimestepSpacing::Linspace),
            clip_sample: Some(false),
            prediction_type: PredictionType::Sample,
            ..SchedulerConfig::stable_diffusion()
        };
        let mut scheduler = DdpmScheduler::new(config, 0);
        scheduler.set_timesteps(1);
        // linspace(0, 999, 1) = [0]
        assert_eq!(scheduler.timesteps(), &[0.0]);

        let device = Device::Cpu;
        let sample = Tensor::ones((1, 4, 2, 2), DType::F32, &device).unwrap();
        let predicted = Tensor::full(0.25f32, (1, 4, 2, 2), &device).unwrap();
        let out = scheduler.step(&predicted, &sample, 0).unwrap();
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (v - 0.25).abs() < 1e-6), "{values:?}");
    }

    #[test]
    fn clip_sample_bounds_prediction() {
        let config = SchedulerConfig {
            timestep_spacing: Some(TimestepSpacing::Linspace),
            clip_sample: Some(true),
            prediction_type: PredictionType::Sample,
            ..SchedulerConfig::stable_diffusion()
        };
        let mut scheduler = DdpmScheduler::new(config, 0);
        scheduler.set_timesteps(1);

        let device = Device::Cpu;
        let sample = Tensor::zeros((1, 4), DType::F32, &device).unwrap();
        let predicted = Tensor::full(5.0f32, (1, 4), &device).unwrap();
        let out = scheduler.step(&predicted, &sample, 0).unwrap();
        let max: f32 = out.max_all().unwrap().to_scalar().unwrap();
        assert!((max - 1.0).abs() < 1e-6, "max = {max}");
    }

    #[test]
    fn seeded_noise_is_reproducible() {
        let device = Device::Cpu;
        let sample = Tensor::ones((1, 4, 8, 8), DType::F32, &device).unwrap();
        let eps = Tensor::zeros((1, 4, 8, 8), DType::F32, &device).unwrap();

        let mut a = sd_scheduler(10);
        let mut b = sd_scheduler(10);
        let xa = a.step(&eps, &sample, 0).unwrap();
        let xb = b.step(&eps, &sample, 0).unwrap();
        assert_eq!(
            xa.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            xb.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn full_loop_stays_finite() {
        let device = Device::Cpu;
        let mut scheduler = sd_scheduler(10);
        let mut latents = Tensor::randn(0f32, 1.0, (1, 4, 4, 4), &device).unwrap();
        for i in 0..scheduler.timesteps().len() {
            // Pretend the UNet predicts zero noise.
            let eps = latents.zeros_like().unwrap();
            latents = scheduler.step(&eps, &latents, i).unwrap();
        }
        let values = latents.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }
}
