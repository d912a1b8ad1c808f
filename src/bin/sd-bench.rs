//! sd-bench CLI — Stable Diffusion inference benchmark.
//!
//! Loads the pipeline once, then generates `--num_images_per_prompt` rounds
//! of images for a single prompt. Measurements go to stdout as tagged lines,
//! logs go to stderr.
//!
//! # Output
//!
//! ```text
//! [pytorch] [compile(s)] 9.81
//! [pytorch] [gpu_memory] 3300 MiB
//! [pytorch] [512x512] [elapsed(s)] [pipe] 4.02
//! [pytorch] [elapsed(s)] [save] 0.03
//! [pytorch] [last_gpu_memory] 5240 MiB
//! ...
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;
use std::time::Instant;

use candle_core::{DType, Device};
use clap::Parser;
use sd_bench::{
    bench,
    config::{BenchConfig, DEFAULT_MODEL_ID, DEFAULT_PROMPT, SchedulerChoice},
    gpu::{self, NvidiaSmiProbe},
    pipeline::{GenerationParams, PipelineOptions, StableDiffusionPipeline},
    report::{DEFAULT_TAG, Report, Reporter, RunSummary, TimingStats},
};

#[derive(Parser, Debug)]
#[command(
    name = "sd-bench",
    about = "Simple demo of image generation.",
    long_about = "Benchmark Stable Diffusion inference on candle.\n\
                  Downloads model weights from HuggingFace on first run.\n\
                  Tagged measurement lines are printed to stdout."
)]
struct Args {
    /// Text prompt.
    #[arg(long, default_value = DEFAULT_PROMPT)]
    prompt: String,

    /// HuggingFace model id.
    #[arg(long = "model_id", default_value = DEFAULT_MODEL_ID)]
    model_id: String,

    /// The number of images to generate per prompt.
    #[arg(long = "num_images_per_prompt", default_value_t = 10)]
    num_images_per_prompt: usize,

    /// The number of denoising steps. More denoising steps usually lead to a
    /// higher quality image at the expense of slower inference.
    #[arg(long = "num_inference_steps", default_value_t = 50)]
    num_inference_steps: usize,

    /// The height in pixels of the generated image.
    #[arg(long = "img_height", default_value_t = 512)]
    img_height: usize,

    /// The width in pixels of the generated image.
    #[arg(long = "img_width", default_value_t = 512)]
    img_width: usize,

    /// Scheduler.
    #[arg(long, value_enum, default_value_t = SchedulerChoice::Ddpm)]
    scheduler: SchedulerChoice,

    /// Directory where the generated images will be saved.
    #[arg(long = "saving_path", default_value = "pytorch-sd-output")]
    saving_path: PathBuf,

    /// Images produced by each pipeline call.
    #[arg(long = "batch_size", default_value_t = 1)]
    batch_size: usize,

    /// Classifier-free guidance scale. Values <= 1 disable guidance.
    #[arg(long = "guidance_scale", default_value_t = 7.5)]
    guidance_scale: f64,

    /// Random seed. Omit for a random seed each run.
    #[arg(long)]
    seed: Option<u64>,

    /// Hub revision (branch, tag or commit).
    #[arg(long, default_value = "main")]
    revision: String,

    /// Weight file variant, e.g. "fp16" for *.fp16.safetensors.
    #[arg(long)]
    variant: Option<String>,

    /// Run on CPU even if an accelerator is available.
    #[arg(long)]
    cpu: bool,

    /// Keep weights in f32 on the accelerator (default is f16).
    #[arg(long)]
    f32: bool,

    /// Slice attention into chunks of this size to save memory.
    #[arg(long = "sliced_attention_size")]
    sliced_attention_size: Option<usize>,

    /// Tag printed at the start of every report line.
    #[arg(long = "report_tag", default_value = DEFAULT_TAG)]
    report_tag: String,

    /// Write a JSON summary of the run to this file.
    #[arg(long = "summary_json")]
    summary_json: Option<PathBuf>,
}

impl Args {
    fn bench_config(&self) -> BenchConfig {
        BenchConfig {
            prompt: self.prompt.clone(),
            model_id: self.model_id.clone(),
            num_images_per_prompt: self.num_images_per_prompt,
            num_inference_steps: self.num_inference_steps,
            img_height: self.img_height,
            img_width: self.img_width,
            scheduler: self.scheduler,
            saving_path: self.saving_path.clone(),
            batch_size: self.batch_size,
            guidance_scale: self.guidance_scale,
            seed: self.seed,
            revision: self.revision.clone(),
            variant: self.variant.clone(),
            sliced_attention_size: self.sliced_attention_size,
        }
    }
}

fn select_device(cpu: bool) -> anyhow::Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        return Ok(Device::new_cuda(0)?);
    }
    if candle_core::utils::metal_is_available() {
        return Ok(Device::new_metal(0)?);
    }
    tracing::warn!("no accelerator available, running on CPU");
    Ok(Device::Cpu)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.bench_config();
    config.validate()?;

    let device = select_device(args.cpu)?;
    let dtype = if device.is_cpu() || args.f32 {
        DType::F32
    } else {
        DType::F16
    };
    tracing::info!(device = ?device, ?dtype, "using device");

    let gpus = match gpu::query_gpus() {
        Ok(gpus) => {
            for status in &gpus {
                tracing::info!(
                    name = %status.name,
                    driver = %status.driver_version,
                    total_mib = status.memory_total_mib,
                    used_mib = status.memory_used_mib,
                    "gpu"
                );
            }
            gpus
        }
        Err(error) => {
            tracing::warn!(%error, "could not query GPUs");
            Vec::new()
        }
    };
    match gpu::cuda_mem_info() {
        Ok((free, total)) => tracing::info!(
            free_mb = free / (1024 * 1024),
            total_mb = total / (1024 * 1024),
            "CUDA memory"
        ),
        Err(error) => tracing::debug!(%error, "CUDA memory info unavailable"),
    }

    let options = PipelineOptions::from_config(&config);
    tracing::info!(
        model = %options.model_id,
        scheduler = ?options.scheduler,
        "loading Stable Diffusion pipeline"
    );

    let load_start = Instant::now();
    let mut pipeline = StableDiffusionPipeline::load(&options, &device, dtype)
        .map_err(|e| anyhow::anyhow!("failed to load pipeline: {e}"))?;
    device.synchronize()?;
    let load_elapsed = load_start.elapsed();

    let mut reporter = Reporter::new(args.report_tag.clone(), std::io::stdout().lock());
    reporter.emit(Report::Compile(load_elapsed))?;

    let params = GenerationParams::from_config(&config);
    let mut probe = NvidiaSmiProbe::default();
    let measurements = bench::run(
        &mut pipeline,
        &mut probe,
        &mut reporter,
        &params,
        config.num_images_per_prompt,
        &config.saving_path,
    )
    .map_err(|e| anyhow::anyhow!("benchmark failed: {e}"))?;

    tracing::info!(
        files = measurements.files.len(),
        path = %config.saving_path.display(),
        "done"
    );

    if let Some(path) = &args.summary_json {
        let summary = RunSummary {
            model_id: config.model_id.clone(),
            scheduler: config.scheduler_kind(),
            width: config.img_width,
            height: config.img_height,
            num_inference_steps: config.num_inference_steps,
            batch_size: config.batch_size,
            seed: pipeline.seed(),
            device: format!("{device:?}"),
            gpus,
            load_s: load_elapsed.as_secs_f64(),
            pipe_stats: TimingStats::from_seconds(&measurements.pipe_s),
            pipe_s: measurements.pipe_s,
            save_s: measurements.save_s,
            gpu_memory_mib: measurements.gpu_memory_mib,
            last_gpu_memory_mib: measurements.last_gpu_memory_mib,
            files_written: measurements.files.len(),
        };
        summary.write_json(path)?;
        tracing::info!(path = %path.display(), "wrote run summary");
    }

    Ok(())
}
