//! GPU memory sampling through `nvidia-smi`.
//!
//! The benchmark reports how much device memory *this* process holds, which
//! `nvidia-smi --query-compute-apps` lists per pid. Parsing is split from the
//! subprocess call so it can be tested without a GPU.

use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::{Error, Result};

/// Separator between `nvidia-smi` CSV fields and their units.
static FIELD_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(",? ").expect("built-in regex must compile"));

/// Source of per-process GPU memory readings.
pub trait MemoryProbe {
    /// Device memory used by the current process, in MiB.
    fn used_mib(&mut self) -> Result<u64>;
}

/// [`MemoryProbe`] backed by the `nvidia-smi` binary.
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    binary: String,
    pid: u32,
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self {
            binary: "nvidia-smi".to_string(),
            pid: std::process::id(),
        }
    }
}

impl NvidiaSmiProbe {
    /// Probe a different binary (e.g. an absolute path) or pid.
    pub fn new(binary: impl Into<String>, pid: u32) -> Self {
        Self {
            binary: binary.into(),
            pid,
        }
    }
}

impl MemoryProbe for NvidiaSmiProbe {
    fn used_mib(&mut self) -> Result<u64> {
        let output = run_nvidia_smi(
            &self.binary,
            &[
                "--query-compute-apps=pid,used_gpu_memory",
                "--format=csv,noheader",
            ],
        )?;
        Ok(parse_compute_apps(&output, self.pid))
    }
}

/// Sum the `used_gpu_memory` of every row belonging to `pid`.
///
/// Rows look like `12345, 2048 MiB`. Rows whose first two fields are not
/// integers (`[N/A]` on some drivers) are skipped.
pub fn parse_compute_apps(output: &str, pid: u32) -> u64 {
    output
        .trim()
        .lines()
        .filter_map(|line| {
            let mut fields = FIELD_SPLIT.split(line.trim());
            let row_pid = fields.next()?.parse::<u32>().ok();
            let used = fields.next()?.parse::<u64>().ok();
            match (row_pid, used) {
                (Some(row_pid), Some(used)) => Some((row_pid, used)),
                _ => {
                    tracing::debug!(line, "skipping unparsable nvidia-smi row");
                    None
                }
            }
        })
        .filter(|&(row_pid, _)| row_pid == pid)
        .map(|(_, used)| used)
        .sum()
}

/// One row of `nvidia-smi --query-gpu`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuStatus {
    pub timestamp: String,
    pub name: String,
    pub driver_version: String,
    pub utilization_gpu_percent: Option<u32>,
    pub utilization_memory_percent: Option<u32>,
    pub memory_total_mib: Option<u64>,
    pub memory_free_mib: Option<u64>,
    pub memory_used_mib: Option<u64>,
}

const GPU_QUERY_FIELDS: &str = "timestamp,name,driver_version,utilization.gpu,utilization.memory,memory.total,memory.free,memory.used";

/// Query every visible GPU's name, driver, utilization and memory.
pub fn query_gpus() -> Result<Vec<GpuStatus>> {
    let query = format!("--query-gpu={GPU_QUERY_FIELDS}");
    let output = run_nvidia_smi("nvidia-smi", &[query.as_str(), "--format=csv,noheader,nounits"])?;
    parse_gpu_status(&output)
}

/// Parse `--query-gpu` output produced with `csv,noheader,nounits`.
pub fn parse_gpu_status(output: &str) -> Result<Vec<GpuStatus>> {
    output
        .trim()
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let [timestamp, name, driver, util_gpu, util_mem, total, free, used] = fields[..]
            else {
                return Err(Error::GpuQuery(format!(
                    "expected 8 fields in nvidia-smi row, got {}: {line:?}",
                    fields.len()
                )));
            };
            Ok(GpuStatus {
                timestamp: timestamp.to_string(),
                name: name.to_string(),
                driver_version: driver.to_string(),
                utilization_gpu_percent: util_gpu.parse().ok(),
                utilization_memory_percent: util_mem.parse().ok(),
                memory_total_mib: total.parse().ok(),
                memory_free_mib: free.parse().ok(),
                memory_used_mib: used.parse().ok(),
            })
        })
        .collect()
}

fn run_nvidia_smi(binary: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(binary)
        .args(args)
        .output()
        .map_err(|e| Error::GpuQuery(format!("failed to run {binary}: {e}")))?;
    if !output.status.success() {
        return Err(Error::GpuQuery(format!(
            "{binary} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    String::from_utf8(output.stdout)
        .map_err(|e| Error::GpuQuery(format!("{binary} printed non-UTF-8 output: {e}")))
}

/// Free and total memory of the current CUDA device, in bytes.
#[cfg(feature = "cuda")]
pub fn cuda_mem_info() -> std::result::Result<(u64, u64), String> {
    cudarc::runtime::result::get_mem_info()
        .map(|(free, total)| (free as u64, total as u64))
        .map_err(|e| format!("cudaMemGetInfo failed: {e}"))
}

#[cfg(not(feature = "cuda"))]
pub fn cuda_mem_info() -> std::result::Result<(u64, u64), String> {
    Err("CUDA not compiled in".into())
}
