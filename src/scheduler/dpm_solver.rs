//! DPM-Solver++ multistep scheduler (order 2, midpoint).
//!
//! Works in log-SNR space `λ = ln α - ln σ` where, for a sigma-space
//! `s = √((1 - ᾱ)/ᾱ)`, `α = 1/√(s² + 1)` and `σ = s · α`. Each step
//! converts the UNet output to a data prediction `D` and integrates:
//!
//! ```text
//! h  = λ_t - λ_s0
//! 1st order:  x_t = (σ_t/σ_s0) x - α_t (e^{-h} - 1) D0
//! 2nd order:  x_t = (σ_t/σ_s0) x - α_t (e^{-h} - 1) D0 - ½ α_t (e^{-h} - 1) D1
//!             D1  = (D0 - D_prev) · h / (λ_s0 - λ_s1)
//! ```
//!
//! The first step and the step onto the final zero sigma use first order.

use candle_core::Tensor;

use super::{Scheduler, predict_original, sigmas_from_alphas_cumprod, spaced_timesteps};
use crate::Result;
use crate::config::{SchedulerConfig, TimestepSpacing};

const SOLVER_ORDER: usize = 2;

/// Below this many steps the second-to-last step also drops to first order.
const LOWER_ORDER_FINAL_BELOW: usize = 15;

/// DPM-Solver++ multistep scheduler.
pub struct DpmSolverMultistepScheduler {
    config: SchedulerConfig,
    alphas_cumprod: Vec<f64>,
    timesteps: Vec<f64>,
    /// One sigma per timestep plus the terminal zero.
    sigmas: Vec<f64>,
    /// Data predictions from earlier steps, oldest first.
    model_outputs: Vec<Tensor>,
    lower_order_nums: usize,
}

impl DpmSolverMultistepScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let alphas_cumprod = config.alphas_cumprod();
        Self {
            config,
            alphas_cumprod,
            timesteps: Vec::new(),
            sigmas: Vec::new(),
            model_outputs: Vec::with_capacity(SOLVER_ORDER),
            lower_order_nums: 0,
        }
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    fn first_order_update(
        &self,
        d0: &Tensor,
        sample: &Tensor,
        step_index: usize,
    ) -> Result<Tensor> {
        let (alpha_t, sigma_t, lambda_t) = alpha_sigma_lambda(self.sigmas[step_index + 1]);
        let (_, sigma_s0, lambda_s0) = alpha_sigma_lambda(self.sigmas[step_index]);
        let h = lambda_t - lambda_s0;

        let sample_coeff = sigma_t / sigma_s0;
        let d0_coeff = alpha_t * ((-h).exp() - 1.0);
        Ok(((sample * sample_coeff)? - (d0 * d0_coeff)?)?)
    }

    fn second_order_update(&self, sample: &Tensor, step_index: usize) -> Result<Tensor> {
        let d0 = &self.model_outputs[self.model_outputs.len() - 1];
        let d_prev = &self.model_outputs[self.model_outputs.len() - 2];

        let (alpha_t, sigma_t, lambda_t) = alpha_sigma_lambda(self.sigmas[step_index + 1]);
        let (_, sigma_s0, lambda_s0) = alpha_sigma_lambda(self.sigmas[step_index]);
        let (_, _, lambda_s1) = alpha_sigma_lambda(self.sigmas[step_index - 1]);
        let h = lambda_t - lambda_s0;
        let h_0 = lambda_s0 - lambda_s1;
        let r0 = h_0 / h;

        let d1 = ((d0 - d_prev)? * (1.0 / r0))?;
        let phi = alpha_t * ((-h).exp() - 1.0);
        let x = ((sample * (sigma_t / sigma_s0))? - (d0 * phi)?)?;
        Ok((x - (d1 * (0.5 * phi))?)?)
    }
}

/// `(α, σ, λ)` for a sigma-space value. `λ` is `+∞` at `s = 0`.
fn alpha_sigma_lambda(sigma: f64) -> (f64, f64, f64) {
    let alpha_t = 1.0 / (sigma * sigma + 1.0).sqrt();
    let sigma_t = sigma * alpha_t;
    (alpha_t, sigma_t, alpha_t.ln() - sigma_t.ln())
}

impl Scheduler for DpmSolverMultistepScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) {
        let spacing = self
            .config
            .timestep_spacing
            .unwrap_or(TimestepSpacing::Linspace);
        let n_train = self.config.num_train_timesteps;

        let mut timesteps: Vec<usize> = match spacing {
            // Lay out n + 1 points and drop the trailing zero.
            TimestepSpacing::Linspace | TimestepSpacing::Leading => {
                let mut ts = spaced_timesteps(
                    spacing,
                    n_train,
                    num_inference_steps + 1,
                    self.config.steps_offset,
                );
                ts.pop();
                ts
            }
            TimestepSpacing::Trailing => {
                spaced_timesteps(spacing, n_train, num_inference_steps, 0)
            }
        };
        // Rounding can repeat a timestep when steps are dense. A repeated
        // sigma gives a zero log-SNR step and a division by zero in the
        // second-order update.
        timesteps.dedup();

        let table = sigmas_from_alphas_cumprod(&self.alphas_cumprod);
        self.sigmas = timesteps.iter().map(|&t| table[t]).collect();
        self.sigmas.push(0.0);
        self.timesteps = timesteps.into_iter().map(|t| t as f64).collect();
        self.model_outputs.clear();
        self.lower_order_nums = 0;
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
        let num_steps = self.timesteps.len();
        let lower_order_final = step_index == num_steps - 1;
        let lower_order_second =
            step_index + 2 == num_steps && num_steps < LOWER_ORDER_FINAL_BELOW;

        // Data prediction at the current sigma.
        let (alpha_s, _, _) = alpha_sigma_lambda(self.sigmas[step_index]);
        let x0 = predict_original(
            self.config.prediction_type,
            model_output,
            sample,
            alpha_s * alpha_s,
        )?;

        if self.model_outputs.len() == SOLVER_ORDER {
            self.model_outputs.remove(0);
        }
        self.model_outputs.push(x0);

        let use_first_order = self.lower_order_nums < 1
            || step_index == 0
            || lower_order_final
            || lower_order_second
            || self.sigmas[step_index - 1] == self.sigmas[step_index];
        let prev = if use_first_order {
            let d0 = &self.model_outputs[self.model_outputs.len() - 1];
            self.first_order_update(d0, sample, step_index)?
        } else {
            self.second_order_update(sample, step_index)?
        };

        if self.lower_order_nums < SOLVER_ORDER {
            self.lower_order_nums += 1;
        }
        Ok(prev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn sd_scheduler(steps: usize) -> DpmSolverMultistepScheduler {
        let mut scheduler = DpmSolverMultistepScheduler::new(SchedulerConfig::stable_diffusion());
        scheduler.set_timesteps(steps);
        scheduler
    }

    #[test]
    fn timesteps_setup() {
        let scheduler = sd_scheduler(20);
        assert_eq!(scheduler.timesteps().len(), 20);
        assert_eq!(scheduler.sigmas().len(), 21);
        // round(linspace(0, 999, 21))[::-1][:-1] starts at 999, then 949.
        assert_eq!(scheduler.timesteps()[0], 999.0);
        assert_eq!(scheduler.timesteps()[1], 949.0);
        assert_eq!(*scheduler.sigmas().last().unwrap(), 0.0);
        for w in scheduler.sigmas().windows(2) {
            assert!(w[0] > w[1], "sigmas not decreasing: {w:?}");
        }
    }

    fn layout(config: SchedulerConfig, steps: usize) -> Vec<f64> {
        let mut scheduler = DpmSolverMultistepScheduler::new(config);
        scheduler.set_timesteps(steps);
        scheduler.timesteps().to_vec()
    }

    #[test]
    fn six_step_layout_rounds_halves_to_even() {
        // round(linspace(0, 999, 7))[::-1][:-1]; 832.5 and 166.5 round down.
        assert_eq!(
            layout(SchedulerConfig::stable_diffusion(), 6),
            vec![999.0, 832.0, 666.0, 500.0, 333.0, 166.0]
        );
    }

    #[test]
    fn leading_layout() {
        let config = SchedulerConfig {
            timestep_spacing: Some(TimestepSpacing::Leading),
            ..SchedulerConfig::stable_diffusion()
        };
        // 1000 // 11 = 90, plus steps_offset 1.
        assert_eq!(
            layout(config, 10),
            vec![901.0, 811.0, 721.0, 631.0, 541.0, 451.0, 361.0, 271.0, 181.0, 91.0]
        );
    }

    #[test]
    fn trailing_layout() {
        let config = SchedulerConfig {
            timestep_spacing: Some(TimestepSpacing::Trailing),
            ..SchedulerConfig::stable_diffusion()
        };
        let mut scheduler = DpmSolverMultistepScheduler::new(config);
        scheduler.set_timesteps(4);
        assert_eq!(scheduler.timesteps(), &[999.0, 749.0, 499.0, 249.0]);
        assert_eq!(scheduler.sigmas().len(), 5);
    }

    #[test]
    fn thousand_steps_stay_finite() {
        // 1001 linspace points over 0..=999 round 499.5 and 500.5 both to 500.
        let device = Device::Cpu;
        let mut scheduler = sd_scheduler(1000);
        let timesteps = scheduler.timesteps().to_vec();
        assert!(timesteps.windows(2).all(|w| w[0] > w[1]), "repeated timestep");
        assert_eq!(timesteps.len(), 999);
        assert_eq!(scheduler.sigmas().len(), timesteps.len() + 1);

        let mut x = Tensor::randn(0f32, 1.0, (1, 4, 4, 4), &device).unwrap();
        for i in 0..timesteps.len() {
            let eps = (&x * 0.1).unwrap();
            x = scheduler.step(&eps, &x, i).unwrap();
            let values = x.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!(
                values.iter().all(|v| v.is_finite()),
                "non-finite sample after step {i} (t = {})",
                timesteps[i]
            );
        }
    }

    #[test]
    fn second_to_last_step_is_first_order_below_fifteen_steps() {
        let device = Device::Cpu;
        let steps = 10;
        let mut scheduler = sd_scheduler(steps);
        let mut x = Tensor::randn(0f32, 1.0, (1, 4, 4, 4), &device).unwrap();
        for i in 0..steps - 2 {
            let eps = (&x * 0.1).unwrap();
            x = scheduler.step(&eps, &x, i).unwrap();
        }
        assert_eq!(scheduler.lower_order_nums, SOLVER_ORDER);

        let i = steps - 2;
        let eps = (&x * 0.1).unwrap();
        let out = scheduler.step(&eps, &x, i).unwrap();
        let d0 = scheduler.model_outputs.last().unwrap().clone();
        let first = scheduler.first_order_update(&d0, &x, i).unwrap();
        let second = scheduler.second_order_update(&x, i).unwrap();

        let max_diff = |a: &Tensor, b: &Tensor| -> f32 {
            (a - b)
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar()
                .unwrap()
        };
        assert!(max_diff(&out, &first) < 1e-6);
        // The two updates must differ, or the comparison proves nothing.
        assert!(max_diff(&first, &second) > 1e-5);
    }

    #[test]
    fn second_to_last_step_is_second_order_from_fifteen_steps() {
        let device = Device::Cpu;
        let steps = 15;
        let mut scheduler = sd_scheduler(steps);
        let mut x = Tensor::randn(0f32, 1.0, (1, 4, 4, 4), &device).unwrap();
        for i in 0..steps - 2 {
            let eps = (&x * 0.1).unwrap();
            x = scheduler.step(&eps, &x, i).unwrap();
        }

        let i = steps - 2;
        let eps = (&x * 0.1).unwrap();
        let out = scheduler.step(&eps, &x, i).unwrap();
        let second = scheduler.second_order_update(&x, i).unwrap();
        let diff: f32 = (out - second)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6, "diff = {diff}");
    }

    #[test]
    fn alpha_sigma_lambda_at_zero_sigma() {
        let (alpha, sigma, lambda) = alpha_sigma_lambda(0.0);
        assert_eq!(alpha, 1.0);
        assert_eq!(sigma, 0.0);
        assert!(lambda.is_infinite() && lambda > 0.0);
    }

    #[test]
    fn final_step_returns_data_prediction() {
        // With a zero terminal sigma the last first-order update collapses
        // to x_t = D0, the denoised estimate.
        let mut scheduler = sd_scheduler(1);
        let device = Device::Cpu;
        let sample = Tensor::full(2.0f32, (1, 4, 2, 2), &device).unwrap();
        let eps = Tensor::zeros((1, 4, 2, 2), DType::F32, &device).unwrap();

        let (alpha, _, _) = alpha_sigma_lambda(scheduler.sigmas()[0]);
        let out = scheduler.step(&eps, &sample, 0).unwrap();
        let expected = 2.0 / alpha as f32;
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(
            values.iter().all(|v| (v - expected).abs() < 1e-3),
            "expected {expected}, got {values:?}"
        );
    }

    #[test]
    fn exact_noise_prediction_recovers_data() {
        // If the model predicts the true noise every step, every data
        // prediction equals x0 and the solver lands on x0.
        let device = Device::Cpu;
        let mut scheduler = sd_scheduler(20);
        let x0 = Tensor::new(&[0.3f32, -0.7, 0.1, 0.9], &device).unwrap();
        let eps = Tensor::new(&[1.0f32, -1.0, 0.5, -0.5], &device).unwrap();

        // x at sigma s is α (x0 + s ε) in sigma-space terms.
        let s0 = scheduler.sigmas()[0];
        let (a0, _, _) = alpha_sigma_lambda(s0);
        let mut x = ((&x0 + (&eps * s0).unwrap()).unwrap() * a0).unwrap();

        for i in 0..scheduler.timesteps().len() {
            x = scheduler.step(&eps, &x, i).unwrap();
        }
        let diff: f32 = (x - &x0)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-3, "diff = {diff}");
    }

    #[test]
    fn history_is_bounded_by_order() {
        let device = Device::Cpu;
        let mut scheduler = sd_scheduler(10);
        let mut x = Tensor::randn(0f32, 1.0, (1, 4, 4, 4), &device).unwrap();
        for i in 0..10 {
            let eps = x.zeros_like().unwrap();
            x = scheduler.step(&eps, &x, i).unwrap();
            assert!(scheduler.model_outputs.len() <= SOLVER_ORDER);
        }
        assert_eq!(scheduler.lower_order_nums, SOLVER_ORDER);
    }
}
