//! End-to-end Stable Diffusion pipeline.
//!
//! Orchestrates text-to-image generation:
//! 1. Tokenize the prompt and the empty unconditional prompt (CLIP BPE)
//! 2. Encode both with the CLIP text transformer
//! 3. Sample seeded gaussian latents at 1/8 resolution
//! 4. Run the denoising loop (scheduler + UNet) with classifier-free guidance
//! 5. Decode latents with the VAE and convert to RGB images
//!
//! The model itself (CLIP, UNet, VAE) comes from `candle-transformers`;
//! weights are fetched from the HuggingFace Hub on first use. A token saved
//! by `huggingface-cli login` is picked up for gated repositories.

use std::path::PathBuf;

use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, StableDiffusionConfig, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use image::RgbImage;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tokenizers::Tokenizer;

use crate::config::{BenchConfig, ModelFamily, SchedulerConfig, SchedulerKind};
use crate::error::TokenizerError;
use crate::scheduler::build_scheduler;
use crate::{Error, Result, noise};

/// Latent scaling factor of the SD 1.x/2.x VAE.
const VAE_SCALE: f64 = 0.18215;

/// Latent channels of the UNet.
const LATENT_CHANNELS: usize = 4;

/// Pad token when the CLIP config doesn't name one.
const DEFAULT_PAD_TOKEN: &str = "<|endoftext|>";

/// Parameters for one pipeline call.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub prompt: String,
    pub width: usize,
    pub height: usize,
    pub num_inference_steps: usize,
    /// Classifier-free guidance weight; `<= 1.0` disables guidance.
    pub guidance_scale: f64,
    /// Images produced by this call.
    pub batch_size: usize,
}

impl GenerationParams {
    pub fn from_config(config: &BenchConfig) -> Self {
        Self {
            prompt: config.prompt.clone(),
            width: config.img_width,
            height: config.img_height,
            num_inference_steps: config.num_inference_steps,
            guidance_scale: config.guidance_scale,
            batch_size: config.batch_size,
        }
    }
}

/// Anything that turns a prompt into images.
pub trait ImageGenerator {
    fn generate(&mut self, params: &GenerationParams) -> Result<Vec<RgbImage>>;
}

/// Where and how to load the pipeline from.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub model_id: String,
    pub revision: String,
    /// Weight file variant, e.g. `fp16` selects `*.fp16.safetensors`.
    pub variant: Option<String>,
    pub scheduler: SchedulerKind,
    pub sliced_attention_size: Option<usize>,
    pub width: usize,
    pub height: usize,
    pub seed: Option<u64>,
}

impl PipelineOptions {
    pub fn from_config(config: &BenchConfig) -> Self {
        Self {
            model_id: config.model_id.clone(),
            revision: config.revision.clone(),
            variant: config.variant.clone(),
            scheduler: config.scheduler_kind(),
            sliced_attention_size: config.sliced_attention_size,
            width: config.img_width,
            height: config.img_height,
            seed: config.seed,
        }
    }

    pub fn family(&self) -> ModelFamily {
        ModelFamily::from_model_id(&self.model_id)
    }
}

/// Stable Diffusion text-to-image pipeline on candle.
pub struct StableDiffusionPipeline {
    tokenizer: Tokenizer,
    pad_id: u32,
    max_tokens: usize,
    text_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    scheduler_kind: SchedulerKind,
    scheduler_config: SchedulerConfig,
    device: Device,
    dtype: DType,
    rng: ChaCha8Rng,
    seed: u64,
}

impl StableDiffusionPipeline {
    /// Download (or reuse cached) weights and build every component.
    pub fn load(options: &PipelineOptions, device: &Device, dtype: DType) -> Result<Self> {
        let family = options.family();
        let sd_config = match family {
            ModelFamily::V1 => StableDiffusionConfig::v1_5(
                options.sliced_attention_size,
                Some(options.height),
                Some(options.width),
            ),
            ModelFamily::V2 => StableDiffusionConfig::v2_1(
                options.sliced_attention_size,
                Some(options.height),
                Some(options.width),
            ),
        };

        let api = Api::new()?;
        let repo = api.repo(Repo::with_revision(
            options.model_id.clone(),
            RepoType::Model,
            options.revision.clone(),
        ));

        let scheduler_config = load_scheduler_config(&repo);

        tracing::info!(repo = family.tokenizer_repo(), "fetching tokenizer");
        let tokenizer_path = api.model(family.tokenizer_repo().to_string()).get("tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)?;
        let pad_token = sd_config
            .clip
            .pad_with
            .clone()
            .unwrap_or_else(|| DEFAULT_PAD_TOKEN.to_string());
        let pad_id = *tokenizer.get_vocab(true).get(&pad_token).ok_or_else(|| {
            Error::Tokenizer(TokenizerError(format!("pad token {pad_token:?} not in vocab")))
        })?;

        let variant = options.variant.as_deref();
        let clip_path = fetch(&repo, &weight_file("text_encoder", "model", variant))?;
        let unet_path = fetch(
            &repo,
            &weight_file("unet", "diffusion_pytorch_model", variant),
        )?;
        let vae_path = fetch(
            &repo,
            &weight_file("vae", "diffusion_pytorch_model", variant),
        )?;

        tracing::info!("building CLIP text encoder");
        // The text encoder runs once per call; keep it in f32 for accuracy.
        let text_model =
            stable_diffusion::build_clip_transformer(&sd_config.clip, clip_path, device, DType::F32)
                .map_err(|e| Error::WeightLoad(format!("text encoder: {e}")))?;
        tracing::info!("building UNet");
        let unet = sd_config
            .build_unet(unet_path, device, LATENT_CHANNELS, false, dtype)
            .map_err(|e| Error::WeightLoad(format!("unet: {e}")))?;
        tracing::info!("building VAE");
        let vae = sd_config
            .build_vae(vae_path, device, dtype)
            .map_err(|e| Error::WeightLoad(format!("vae: {e}")))?;

        let (rng, seed) = noise::noise_rng(options.seed);
        tracing::info!(seed, scheduler = ?options.scheduler, "pipeline ready");

        Ok(Self {
            tokenizer,
            pad_id,
            max_tokens: sd_config.clip.max_position_embeddings,
            text_model,
            unet,
            vae,
            scheduler_kind: options.scheduler,
            scheduler_config,
            device: device.clone(),
            dtype,
            rng,
            seed,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Seed the noise RNG was created from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Token ids for a prompt, padded or truncated to the CLIP context.
    fn tokenize(&self, prompt: &str) -> Result<Vec<u32>> {
        let mut ids = self.tokenizer.encode(prompt, true)?.get_ids().to_vec();
        if ids.len() > self.max_tokens {
            tracing::warn!(
                tokens = ids.len(),
                max = self.max_tokens,
                "prompt too long for CLIP, truncating"
            );
            // Keep the end-of-text token.
            let eot = ids[ids.len() - 1];
            ids.truncate(self.max_tokens - 1);
            ids.push(eot);
        }
        ids.resize(self.max_tokens, self.pad_id);
        Ok(ids)
    }

    /// CLIP embeddings `[1, T, D]` for a prompt.
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let ids = self.tokenize(prompt)?;
        let tokens = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }
}

impl ImageGenerator for StableDiffusionPipeline {
    fn generate(&mut self, params: &GenerationParams) -> Result<Vec<RgbImage>> {
        let use_guidance = params.guidance_scale > 1.0;
        let batch = params.batch_size;

        let cond = self.encode_prompt(&params.prompt)?;
        let uncond = if use_guidance {
            Some(self.encode_prompt("")?)
        } else {
            None
        };
        let text_embeddings =
            batch_text_embeddings(uncond.as_ref(), &cond, batch)?.to_dtype(self.dtype)?;

        let mut scheduler = build_scheduler(
            self.scheduler_kind,
            self.scheduler_config.clone(),
            params.num_inference_steps,
            self.rng.random(),
        )?;

        let latent_shape = (batch, LATENT_CHANNELS, params.height / 8, params.width / 8);
        let mut latents = (noise::randn(&mut self.rng, latent_shape, &self.device, self.dtype)?
            * scheduler.init_noise_sigma())?;

        let timesteps = scheduler.timesteps().to_vec();
        for (step_index, &timestep) in timesteps.iter().enumerate() {
            let model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, step_index)?;
            let noise_pred = self.unet.forward(&model_input, timestep, &text_embeddings)?;
            let noise_pred = if use_guidance {
                apply_guidance(&noise_pred, params.guidance_scale)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, &latents, step_index)?;
            tracing::trace!(step_index, timestep, "denoising step");
        }

        let decoded = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let pixels = (((decoded.to_dtype(DType::F32)? / 2.0)? + 0.5)?.clamp(0f32, 1f32)? * 255.0)?
            .to_dtype(DType::U8)?;
        tensor_to_images(&pixels)
    }
}

/// Stack embeddings as `[uncond × batch, cond × batch]`, matching a model
/// input of `[latents, latents]`.
pub fn batch_text_embeddings(
    uncond: Option<&Tensor>,
    cond: &Tensor,
    batch: usize,
) -> Result<Tensor> {
    let cond = cond.repeat((batch, 1, 1))?;
    let embeddings = match uncond {
        Some(uncond) => Tensor::cat(&[uncond.repeat((batch, 1, 1))?, cond], 0)?,
        None => cond,
    };
    Ok(embeddings)
}

/// `uncond + scale · (cond - uncond)` over a `[uncond, cond]` batch.
pub fn apply_guidance(noise_pred: &Tensor, guidance_scale: f64) -> Result<Tensor> {
    let chunks = noise_pred.chunk(2, 0)?;
    let (uncond, cond) = (&chunks[0], &chunks[1]);
    Ok((uncond + ((cond - uncond)? * guidance_scale)?)?)
}

/// Convert a `[B, 3, H, W]` u8 tensor into RGB images.
pub fn tensor_to_images(pixels: &Tensor) -> Result<Vec<RgbImage>> {
    let (batch, channels, height, width) = pixels.dims4()?;
    if channels != 3 {
        return Err(Error::Image(format!("expected 3 channels, got {channels}")));
    }
    (0..batch)
        .map(|i| {
            let raw = pixels
                .i(i)?
                .permute((1, 2, 0))?
                .flatten_all()?
                .to_vec1::<u8>()?;
            RgbImage::from_raw(width as u32, height as u32, raw)
                .ok_or_else(|| Error::Image(format!("pixel buffer too small for {width}x{height}")))
        })
        .collect()
}

/// `<dir>/<name>[.<variant>].safetensors`
fn weight_file(dir: &str, name: &str, variant: Option<&str>) -> String {
    match variant {
        Some(variant) => format!("{dir}/{name}.{variant}.safetensors"),
        None => format!("{dir}/{name}.safetensors"),
    }
}

fn fetch(repo: &ApiRepo, file: &str) -> Result<PathBuf> {
    tracing::info!(file, "fetching weights");
    Ok(repo.get(file)?)
}

/// The repo's scheduler config, or the stock SD schedule if it can't be read.
fn load_scheduler_config(repo: &ApiRepo) -> SchedulerConfig {
    let loaded = repo
        .get("scheduler/scheduler_config.json")
        .map_err(Error::from)
        .and_then(|path| Ok(std::fs::read_to_string(path)?))
        .and_then(|text| SchedulerConfig::from_json(&text));
    match loaded {
        Ok(config) => config,
        Err(error) => {
            tracing::warn!(%error, "could not read scheduler_config.json, using the stock SD schedule");
            SchedulerConfig::stable_diffusion()
        }
    }
}
