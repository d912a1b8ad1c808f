//! Benchmark report lines and the run summary.
//!
//! Every line printed to stdout starts with a bracketed tag so several
//! framework runs can be grepped side by side:
//!
//! ```text
//! [pytorch] [compile(s)] 8.412
//! [pytorch] [gpu_memory] 3412 MiB
//! [pytorch] [512x512] [elapsed(s)] [pipe] 4.107
//! [pytorch] [elapsed(s)] [save] 0.031
//! [pytorch] [last_gpu_memory] 5120 MiB
//! ```

use std::fmt;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::Result;
use crate::config::SchedulerKind;
use crate::gpu::GpuStatus;

/// Tag used when none is configured.
pub const DEFAULT_TAG: &str = "pytorch";

/// One measurement, rendered without its tag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Report {
    /// Scheduler + pipeline load + device placement.
    Compile(Duration),
    /// Memory before an iteration; `None` when the probe failed.
    GpuMemory(Option<u64>),
    /// One pipeline call.
    Pipe {
        width: usize,
        height: usize,
        elapsed: Duration,
    },
    /// Writing one call's images.
    Save(Duration),
    /// Memory after an iteration.
    LastGpuMemory(Option<u64>),
}

struct Mib(Option<u64>);

impl fmt::Display for Mib {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(mib) => write!(f, "{mib} MiB"),
            None => f.write_str("unavailable"),
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Report::Compile(d) => write!(f, "[compile(s)] {}", d.as_secs_f64()),
            Report::GpuMemory(mib) => write!(f, "[gpu_memory] {}", Mib(mib)),
            Report::Pipe {
                width,
                height,
                elapsed,
            } => write!(
                f,
                "[{width}x{height}] [elapsed(s)] [pipe] {}",
                elapsed.as_secs_f64()
            ),
            Report::Save(d) => write!(f, "[elapsed(s)] [save] {}", d.as_secs_f64()),
            Report::LastGpuMemory(mib) => write!(f, "[last_gpu_memory] {}", Mib(mib)),
        }
    }
}

/// Writes tagged report lines to a sink (stdout in the binary).
pub struct Reporter<W: Write> {
    tag: String,
    out: W,
}

impl<W: Write> Reporter<W> {
    pub fn new(tag: impl Into<String>, out: W) -> Self {
        Self {
            tag: tag.into(),
            out,
        }
    }

    /// Write one line and flush, so progress shows up while the GPU works.
    pub fn emit(&mut self, report: Report) -> Result<()> {
        writeln!(self.out, "[{}] {report}", self.tag)?;
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Min / mean / max over a set of timings, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimingStats {
    pub min_s: f64,
    pub mean_s: f64,
    pub max_s: f64,
}

impl TimingStats {
    pub fn from_seconds(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let min_s = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max_s = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean_s = values.iter().sum::<f64>() / values.len() as f64;
        Some(Self {
            min_s,
            mean_s,
            max_s,
        })
    }
}

/// Machine-readable record of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub model_id: String,
    pub scheduler: SchedulerKind,
    pub width: usize,
    pub height: usize,
    pub num_inference_steps: usize,
    pub batch_size: usize,
    pub seed: u64,
    pub device: String,
    pub gpus: Vec<GpuStatus>,
    pub load_s: f64,
    pub pipe_s: Vec<f64>,
    pub save_s: Vec<f64>,
    pub pipe_stats: Option<TimingStats>,
    pub gpu_memory_mib: Vec<Option<u64>>,
    pub last_gpu_memory_mib: Vec<Option<u64>>,
    pub files_written: usize,
}

impl RunSummary {
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
