//! Benchmark and scheduler configuration.
//!
//! [`BenchConfig`] carries everything the CLI collects. [`SchedulerConfig`]
//! mirrors the `scheduler/scheduler_config.json` file shipped with every
//! diffusers-format checkpoint on the Hub.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Model id that always runs with the Euler discrete scheduler.
pub const EULER_MODEL_ID: &str = "stabilityai/stable-diffusion-2";

/// Default prompt used by the benchmark.
pub const DEFAULT_PROMPT: &str = "a dog, baroque painting, beautiful detailed intricate insanely detailed octane render trending on artstation, 8 k artistic photography, photorealistic, soft natural volumetric cinematic perfect light, chiaroscuro, award - winning photograph";

/// Default model id.
pub const DEFAULT_MODEL_ID: &str = "CompVis/stable-diffusion-v1-4";

/// Scheduler requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SchedulerChoice {
    /// Denoising diffusion probabilistic models.
    Ddpm,
    /// DPM-Solver++ multistep.
    Dmp,
}

/// Scheduler that actually drives the denoising loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Ddpm,
    DpmSolverMultistep,
    EulerDiscrete,
}

/// Pick the scheduler for a model id and CLI choice.
///
/// `stabilityai/stable-diffusion-2` overrides the choice with Euler discrete.
pub fn resolve_scheduler(model_id: &str, choice: SchedulerChoice) -> SchedulerKind {
    if model_id == EULER_MODEL_ID {
        return SchedulerKind::EulerDiscrete;
    }
    match choice {
        SchedulerChoice::Dmp => SchedulerKind::DpmSolverMultistep,
        SchedulerChoice::Ddpm => SchedulerKind::Ddpm,
    }
}

/// Stable Diffusion architecture family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// SD 1.x: CLIP ViT-L/14 text encoder, 768-dim context.
    V1,
    /// SD 2.x: OpenCLIP ViT-H/14 text encoder, 1024-dim context.
    V2,
}

impl ModelFamily {
    pub fn from_model_id(model_id: &str) -> Self {
        if model_id.contains("stable-diffusion-2") {
            ModelFamily::V2
        } else {
            ModelFamily::V1
        }
    }

    /// Hub repo providing `tokenizer.json` for this family.
    pub fn tokenizer_repo(&self) -> &'static str {
        match self {
            ModelFamily::V1 | ModelFamily::V2 => "openai/clip-vit-base-patch32",
        }
    }
}

/// Everything a benchmark run needs, as collected from the CLI.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub prompt: String,
    pub model_id: String,
    /// Number of benchmark iterations (one pipeline call each).
    pub num_images_per_prompt: usize,
    pub num_inference_steps: usize,
    pub img_height: usize,
    pub img_width: usize,
    pub scheduler: SchedulerChoice,
    pub saving_path: PathBuf,
    /// Images produced per pipeline call.
    pub batch_size: usize,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
    pub revision: String,
    pub variant: Option<String>,
    pub sliced_attention_size: Option<usize>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            num_images_per_prompt: 10,
            num_inference_steps: 50,
            img_height: 512,
            img_width: 512,
            scheduler: SchedulerChoice::Ddpm,
            saving_path: PathBuf::from("pytorch-sd-output"),
            batch_size: 1,
            guidance_scale: 7.5,
            seed: None,
            revision: "main".to_string(),
            variant: None,
            sliced_attention_size: None,
        }
    }
}

impl BenchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_images_per_prompt == 0 {
            return Err(Error::Config("num_images_per_prompt must be at least 1".into()));
        }
        if self.num_inference_steps == 0 {
            return Err(Error::Config("num_inference_steps must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        for (name, value) in [("img_height", self.img_height), ("img_width", self.img_width)] {
            if value == 0 || value % 8 != 0 {
                return Err(Error::Config(format!(
                    "{name} must be a positive multiple of 8, got {value}"
                )));
            }
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale < 0.0 {
            return Err(Error::Config(format!(
                "guidance_scale must be a finite non-negative number, got {}",
                self.guidance_scale
            )));
        }
        Ok(())
    }

    pub fn scheduler_kind(&self) -> SchedulerKind {
        resolve_scheduler(&self.model_id, self.scheduler)
    }

    pub fn model_family(&self) -> ModelFamily {
        ModelFamily::from_model_id(&self.model_id)
    }
}

/// Beta schedule of the forward diffusion process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
    #[serde(rename = "squaredcos_cap_v2")]
    SquaredCosCapV2,
}

/// What the UNet predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Epsilon,
    VPrediction,
    Sample,
}

/// How inference timesteps are laid over the training range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepSpacing {
    Leading,
    Linspace,
    Trailing,
}

/// Contents of `scheduler/scheduler_config.json`.
///
/// Keys that only matter to other scheduler classes (`_class_name`,
/// `skip_prk_steps`, `set_alpha_to_one`, ...) are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,

    #[serde(default = "default_beta_start")]
    pub beta_start: f64,

    #[serde(default = "default_beta_end")]
    pub beta_end: f64,

    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: BetaSchedule,

    #[serde(default = "default_prediction_type")]
    pub prediction_type: PredictionType,

    #[serde(default)]
    pub steps_offset: usize,

    /// Unset means "use the scheduler's own default".
    #[serde(default)]
    pub clip_sample: Option<bool>,

    #[serde(default = "default_clip_sample_range")]
    pub clip_sample_range: f64,

    /// Unset means "use the scheduler's own default".
    #[serde(default)]
    pub timestep_spacing: Option<TimestepSpacing>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: default_num_train_timesteps(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            beta_schedule: default_beta_schedule(),
            prediction_type: default_prediction_type(),
            steps_offset: 0,
            clip_sample: None,
            clip_sample_range: default_clip_sample_range(),
            timestep_spacing: None,
        }
    }
}

impl SchedulerConfig {
    /// The schedule every Stable Diffusion 1.x/2.x checkpoint ships with.
    pub fn stable_diffusion() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            steps_offset: 1,
            clip_sample: Some(false),
            ..Default::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        if config.num_train_timesteps < 2 {
            return Err(Error::Config(format!(
                "num_train_timesteps must be at least 2, got {}",
                config.num_train_timesteps
            )));
        }
        Ok(config)
    }

    /// Per-timestep betas over the training range.
    pub fn betas(&self) -> Vec<f64> {
        let n = self.num_train_timesteps;
        match self.beta_schedule {
            BetaSchedule::Linear => linspace(self.beta_start, self.beta_end, n),
            BetaSchedule::ScaledLinear => {
                linspace(self.beta_start.sqrt(), self.beta_end.sqrt(), n)
                    .into_iter()
                    .map(|b| b * b)
                    .collect()
            }
            BetaSchedule::SquaredCosCapV2 => {
                let alpha_bar = |t: f64| {
                    ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2)
                        .cos()
                        .powi(2)
                };
                (0..n)
                    .map(|i| {
                        let t1 = i as f64 / n as f64;
                        let t2 = (i + 1) as f64 / n as f64;
                        (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
                    })
                    .collect()
            }
        }
    }

    /// Running product of `1 - beta`.
    pub fn alphas_cumprod(&self) -> Vec<f64> {
        let mut acc = 1.0;
        self.betas()
            .into_iter()
            .map(|beta| {
                acc *= 1.0 - beta;
                acc
            })
            .collect()
    }
}

/// `n` evenly spaced values from `start` to `end`, both inclusive.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

fn default_num_train_timesteps() -> usize {
    1000
}

fn default_beta_start() -> f64 {
    0.0001
}

fn default_beta_end() -> f64 {
    0.02
}

fn default_beta_schedule() -> BetaSchedule {
    BetaSchedule::Linear
}

fn default_prediction_type() -> PredictionType {
    PredictionType::Epsilon
}

fn default_clip_sample_range() -> f64 {
    1.0
}
