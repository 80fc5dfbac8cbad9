use std::env;
use std::error::Error;
use std::num::NonZeroUsize;
use std::path::Path;
use std::process::ExitCode;
use std::thread;

use affine_fusion::{
    ComputeDevice, CpuDevice, DistributedTransformCoordinator, GpuDevice, RawFileArray,
    ResampleConfig, RunReport, TransformJob, telemetry,
};
use tracing::{error, info, warn};

const USAGE: &str = "usage: affine-fusion <config.toml> <input-array-dir> <output-array-dir>";

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    if let Err(e) = telemetry::init_tracing() {
        eprintln!("{e}");
    }
    let args: Vec<String> = env::args().collect();
    let [_, config, input, output] = args.as_slice() else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };

    match run(Path::new(config), Path::new(input), Path::new(output)).await {
        Ok(report) if report.is_complete() => ExitCode::SUCCESS,
        Ok(report) => {
            for failure in &report.failures {
                error!(window = ?failure.window, error = %failure.error, "chunk failed");
            }
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &Path, input: &Path, output: &Path) -> Result<RunReport, Box<dyn Error>> {
    let config = ResampleConfig::from_path(config)?;
    let job = config.job()?;
    let input = RawFileArray::open(input)?;

    let gpus = match GpuDevice::request_all().await {
        Ok(devices) => devices,
        Err(e) => {
            warn!("{e}");
            Vec::new()
        }
    };
    if gpus.is_empty() {
        let count = config.device_count.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        });
        warn!(workers = count, "no GPU adapter available, running on the CPU");
        transform(CpuDevice::pool(count), &input, output, &job)
    } else {
        let mut gpus = gpus;
        if let Some(limit) = config.device_count {
            gpus.truncate(limit);
        }
        transform(gpus, &input, output, &job)
    }
}

fn transform<D: ComputeDevice>(
    devices: Vec<D>,
    input: &RawFileArray,
    output: &Path,
    job: &TransformJob,
) -> Result<RunReport, Box<dyn Error>> {
    let names: Vec<&str> = devices.iter().map(|d| d.name()).collect();
    info!(devices = ?names, "using devices");
    let coordinator = DistributedTransformCoordinator::new(devices)?;
    Ok(coordinator.run(input, output, job)?)
}
