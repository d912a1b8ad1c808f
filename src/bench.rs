//! The benchmark loop.
//!
//! For each iteration: sample GPU memory, time one pipeline call, time
//! saving its images, sample GPU memory again. Every measurement is
//! emitted as a report line as soon as it is taken.

use std::io::Write;
use std::path::Path;
use std::time::Instant;

use crate::Result;
use crate::gpu::MemoryProbe;
use crate::output;
use crate::pipeline::{GenerationParams, ImageGenerator};
use crate::report::{Report, Reporter};

/// Raw measurements of a finished run.
#[derive(Debug, Clone, Default)]
pub struct RunMeasurements {
    pub pipe_s: Vec<f64>,
    pub save_s: Vec<f64>,
    pub gpu_memory_mib: Vec<Option<u64>>,
    pub last_gpu_memory_mib: Vec<Option<u64>>,
    pub files: Vec<std::path::PathBuf>,
}

/// Run `iterations` generate-and-save rounds into `saving_path`.
pub fn run<G, P, W>(
    generator: &mut G,
    probe: &mut P,
    reporter: &mut Reporter<W>,
    params: &GenerationParams,
    iterations: usize,
    saving_path: &Path,
) -> Result<RunMeasurements>
where
    G: ImageGenerator + ?Sized,
    P: MemoryProbe + ?Sized,
    W: Write,
{
    output::ensure_dir(saving_path)?;
    let stem = output::prompt_stem(&params.prompt);
    let mut measurements = RunMeasurements::default();

    for iteration in 0..iterations {
        let before = sample_memory(probe);
        reporter.emit(Report::GpuMemory(before))?;
        measurements.gpu_memory_mib.push(before);

        let start = Instant::now();
        let images = generator.generate(params)?;
        let elapsed = start.elapsed();
        reporter.emit(Report::Pipe {
            width: params.width,
            height: params.height,
            elapsed,
        })?;
        measurements.pipe_s.push(elapsed.as_secs_f64());

        let save_start = Instant::now();
        let paths = output::save_images(saving_path, &stem, iteration, &images)?;
        let save_elapsed = save_start.elapsed();
        reporter.emit(Report::Save(save_elapsed))?;
        measurements.save_s.push(save_elapsed.as_secs_f64());
        measurements.files.extend(paths);

        let after = sample_memory(probe);
        reporter.emit(Report::LastGpuMemory(after))?;
        measurements.last_gpu_memory_mib.push(after);

        tracing::debug!(
            iteration,
            images = images.len(),
            pipe_s = elapsed.as_secs_f64(),
            "iteration done"
        );
    }

    Ok(measurements)
}

fn sample_memory<P: MemoryProbe + ?Sized>(probe: &mut P) -> Option<u64> {
    match probe.used_mib() {
        Ok(mib) => Some(mib),
        Err(error) => {
            tracing::warn!(%error, "GPU memory query failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use image::RgbImage;
    use std::collections::HashSet;

    struct FakeGenerator {
        calls: usize,
    }

    impl ImageGenerator for FakeGenerator {
        fn generate(&mut self, params: &GenerationParams) -> Result<Vec<RgbImage>> {
            self.calls += 1;
            Ok((0..params.batch_size)
                .map(|_| RgbImage::new(params.width as u32, params.height as u32))
                .collect())
        }
    }

    struct CountingProbe(u64);

    impl MemoryProbe for CountingProbe {
        fn used_mib(&mut self) -> Result<u64> {
            self.0 += 100;
            Ok(self.0)
        }
    }

    struct BrokenProbe;

    impl MemoryProbe for BrokenProbe {
        fn used_mib(&mut self) -> Result<u64> {
            Err(Error::GpuQuery("nvidia-smi not found".into()))
        }
    }

    fn params(batch_size: usize) -> GenerationParams {
        GenerationParams {
            prompt: "a dog\nbaroque painting".into(),
            width: 16,
            height: 8,
            num_inference_steps: 2,
            guidance_scale: 7.5,
            batch_size,
        }
    }

    #[test]
    fn writes_one_file_per_image_with_unique_names() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("does").join("not").join("exist");
        let mut generator = FakeGenerator { calls: 0 };
        let mut reporter = Reporter::new("pytorch", Vec::new());

        let measurements = run(
            &mut generator,
            &mut CountingProbe(0),
            &mut reporter,
            &params(3),
            4,
            &out,
        )
        .unwrap();

        assert_eq!(generator.calls, 4);
        assert_eq!(measurements.files.len(), 12);
        let unique: HashSet<_> = measurements.files.iter().collect();
        assert_eq!(unique.len(), 12);
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 12);
        assert!(out.join("a dog baroque painting-3-2.png").exists());
    }

    #[test]
    fn emits_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut reporter = Reporter::new("pytorch", Vec::new());
        let measurements = run(
            &mut FakeGenerator { calls: 0 },
            &mut CountingProbe(0),
            &mut reporter,
            &params(1),
            2,
            dir.path(),
        )
        .unwrap();

        let text = String::from_utf8(reporter.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 8);
        assert_eq!(lines[0], "[pytorch] [gpu_memory] 100 MiB");
        assert!(lines[1].starts_with("[pytorch] [16x8] [elapsed(s)] [pipe] "));
        assert!(lines[2].starts_with("[pytorch] [elapsed(s)] [save] "));
        assert_eq!(lines[3], "[pytorch] [last_gpu_memory] 200 MiB");
        assert_eq!(lines[4], "[pytorch] [gpu_memory] 300 MiB");

        assert_eq!(measurements.pipe_s.len(), 2);
        assert_eq!(measurements.save_s.len(), 2);
        assert_eq!(measurements.gpu_memory_mib, vec![Some(100), Some(300)]);
        assert_eq!(measurements.last_gpu_memory_mib, vec![Some(200), Some(400)]);
    }

    #[test]
    fn probe_failure_does_not_abort() {
        let dir = tempfile::tempdir().unwrap();
        let mut reporter = Reporter::new("pytorch", Vec::new());
        let measurements = run(
            &mut FakeGenerator { calls: 0 },
            &mut BrokenProbe,
            &mut reporter,
            &params(1),
            1,
            dir.path(),
        )
        .unwrap();

        assert_eq!(measurements.gpu_memory_mib, vec![None]);
        let text = String::from_utf8(reporter.into_inner()).unwrap();
        assert!(text.contains("[pytorch] [gpu_memory] unavailable"));
    }

    #[test]
    fn generator_error_propagates() {
        struct Failing;
        impl ImageGenerator for Failing {
            fn generate(&mut self, _: &GenerationParams) -> Result<Vec<RgbImage>> {
                Err(Error::Config("boom".into()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut reporter = Reporter::new("pytorch", Vec::new());
        let result = run(
            &mut Failing,
            &mut CountingProbe(0),
            &mut reporter,
            &params(1),
            3,
            dir.path(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
