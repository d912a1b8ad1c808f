//! Stable Diffusion inference benchmark on candle.
//!
//! Loads a pretrained text-to-image pipeline from the HuggingFace Hub, runs a
//! fixed number of generation rounds and reports load time, per-round
//! latency and the GPU memory held by the process.
//!
//! ## Flow
//!
//! ```text
//! CLI flags ─→ BenchConfig ─→ scheduler choice (DDPM / DPM-Solver++ / Euler)
//!                  │
//!                  ↓
//!      StableDiffusionPipeline::load   (CLIP + UNet + VAE, hf-hub)
//!                  │                    → [compile(s)]
//!                  ↓
//!      bench::run × N                   → [gpu_memory] [pipe] [save] [last_gpu_memory]
//!                  │
//!                  ↓
//!      <saving_path>/<prompt>-<j>-<i>.png
//! ```
//!
//! ## Modules
//!
//! - [`config`] — CLI-level configuration, hub scheduler config, beta schedules
//! - [`scheduler`] — DDPM, DPM-Solver++ multistep and Euler discrete samplers
//! - [`pipeline`] — text encoding, denoising loop, VAE decode
//! - [`gpu`] — `nvidia-smi` memory probe
//! - [`output`] — output directory and file naming
//! - [`report`] — tagged report lines and the JSON run summary
//! - [`bench`] — the measured loop

pub mod bench;
pub mod config;
pub mod gpu;
pub mod noise;
pub mod output;
pub mod pipeline;
pub mod report;
pub mod scheduler;

mod error;

pub use error::{Error, Result};
