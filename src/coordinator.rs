//! Chunked, multi-device execution of one affine transform.
//!
//! The output is split into processing chunks. Every chunk reads only the
//! part of the input its voxels map back into, resamples it on whichever
//! device it leased from the pool and writes its window of the output.
//! Chunks are independent, so a failing chunk never stops the others: the
//! run collects every failure and leaves the output marked incomplete.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use nalgebra::Vector3;
use rayon::ThreadPoolBuilder;
use tracing::{debug, info, warn};
use web_time::Instant;

use crate::chunks::{ChunkPlanner, ChunkSize, ChunkWindow};
use crate::device::ComputeDevice;
use crate::enums::Method;
use crate::error::{ResampleError, Result};
use crate::kernels::{DEFAULT_BLOCK_SHAPE, KernelSelector, LaunchParameters};
use crate::resampler::VolumeResampler;
use crate::storage::{ChunkedArray, RawFileArray};
use crate::transform::{AffineMatrix, output_shape, transformed_bounds};
use crate::volume::{Shape, Volume};

/// Extra input voxels read below and above the mapped bounds of a chunk, so
/// every interpolation footprint stays inside the region read.
const LOWER_MARGIN: f64 = 2.0;
const UPPER_MARGIN: f64 = 3.0;

/// Everything that describes one chunked transform.
#[derive(Clone, Debug)]
pub struct TransformJob {
    pub transform: AffineMatrix,
    pub method: Method,
    pub preserve_dtype: bool,
    pub out_shape: Option<Shape>,
    pub chunk_shape: ChunkSize,
    pub block_shape: Shape,
}

impl TransformJob {
    pub fn new(transform: AffineMatrix, chunk_shape: impl Into<ChunkSize>) -> Self {
        Self {
            transform,
            method: Method::default(),
            preserve_dtype: false,
            out_shape: None,
            chunk_shape: chunk_shape.into(),
            block_shape: DEFAULT_BLOCK_SHAPE,
        }
    }
}

/// A bounded pool of device ordinals.
///
/// `acquire` blocks until an ordinal is free; dropping the lease returns it
/// and wakes one waiter. An ordinal is never leased twice at once.
pub struct DevicePool {
    free: Mutex<VecDeque<usize>>,
    released: Condvar,
    size: usize,
}

impl DevicePool {
    pub fn new(size: usize) -> Self {
        Self {
            free: Mutex::new((0..size).collect()),
            released: Condvar::new(),
            size,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn acquire(&self) -> Result<DeviceLease<'_>> {
        if self.is_empty() {
            return Err(ResampleError::invalid_input("device pool is empty"));
        }
        let mut free = self.free.lock().map_err(ResampleError::poisoned)?;
        loop {
            if let Some(ordinal) = free.pop_front() {
                return Ok(DeviceLease {
                    pool: self,
                    ordinal,
                });
            }
            free = self.released.wait(free).map_err(ResampleError::poisoned)?;
        }
    }

    fn release(&self, ordinal: usize) {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(ordinal);
        self.released.notify_one();
    }
}

/// Exclusive use of one device ordinal until dropped.
pub struct DeviceLease<'p> {
    pool: &'p DevicePool,
    ordinal: usize,
}

impl DeviceLease<'_> {
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

impl Drop for DeviceLease<'_> {
    fn drop(&mut self) {
        self.pool.release(self.ordinal);
    }
}

#[derive(Debug)]
pub struct ChunkFailure {
    pub window: ChunkWindow,
    pub error: ResampleError,
}

/// Outcome of a distributed run.
#[derive(Debug)]
pub struct RunReport {
    pub out_shape: Shape,
    pub chunks_total: usize,
    pub chunks_written: usize,
    /// Chunks whose voxels all map outside the input; they keep the fill value.
    pub chunks_skipped: usize,
    pub failures: Vec<ChunkFailure>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turn an incomplete run into [`ResampleError::IncompleteOutput`].
    pub fn into_result(self) -> Result<RunReport> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(ResampleError::IncompleteOutput {
                failed: self.failures.len(),
                total: self.chunks_total,
            })
        }
    }
}

enum ChunkOutcome {
    Written,
    Skipped,
}

/// Validated, device-independent part of a run.
struct RunPlan {
    source_map: AffineMatrix,
    out_shape: Shape,
    windows: Vec<ChunkWindow>,
}

/// Input region, as a window, that output `window` samples from under
/// `source_map`; `None` when it lies entirely outside `in_shape`.
pub fn input_region(
    source_map: &AffineMatrix,
    window: &ChunkWindow,
    in_shape: Shape,
) -> Option<ChunkWindow> {
    // voxel centres of the first and last output voxel along each axis
    let lo = Vector3::new(window.x.start, window.y.start, window.z.start).map(|v| v as f64);
    let hi = Vector3::new(window.x.end, window.y.end, window.z.end).map(|v| v as f64 - 1.0);
    let (min, max) = transformed_bounds(source_map, &lo, &hi);
    let dims = [in_shape.2, in_shape.1, in_shape.0];

    let mut ranges = Vec::with_capacity(3);
    for axis in 0..3 {
        let start = (min[axis].floor() - LOWER_MARGIN).max(0.0);
        let end = (max[axis].ceil() + UPPER_MARGIN + 1.0).min(dims[axis] as f64);
        if start >= end {
            return None;
        }
        ranges.push(start as usize..end as usize);
    }
    let (x, y, z) = (ranges[0].clone(), ranges[1].clone(), ranges[2].clone());
    Some(ChunkWindow::new(z, y, x))
}

/// Maps chunk-local output voxels to region-local input coordinates.
fn chunk_source_map(
    source_map: &AffineMatrix,
    window: &ChunkWindow,
    region: &ChunkWindow,
) -> AffineMatrix {
    let (wz, wy, wx) = window.origin();
    let (rz, ry, rx) = region.origin();
    AffineMatrix::translation(-(rx as f64), -(ry as f64), -(rz as f64))
        * *source_map
        * AffineMatrix::translation(wx as f64, wy as f64, wz as f64)
}

/// Runs a [`TransformJob`] chunk by chunk over a fixed set of devices.
pub struct DistributedTransformCoordinator<D: ComputeDevice> {
    devices: Vec<D>,
    pool: DevicePool,
}

impl<D: ComputeDevice> DistributedTransformCoordinator<D> {
    /// `devices[i]` must report ordinal `i`.
    pub fn new(devices: Vec<D>) -> Result<Self> {
        if devices.is_empty() {
            return Err(ResampleError::invalid_input("no compute devices"));
        }
        if let Some((i, device)) = devices
            .iter()
            .enumerate()
            .find(|(i, d)| d.ordinal() != *i)
        {
            return Err(ResampleError::invalid_input(format!(
                "device {} at position {i} has ordinal {}",
                device.name(),
                device.ordinal()
            )));
        }
        Ok(Self {
            pool: DevicePool::new(devices.len()),
            devices,
        })
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Transform `input` into a new array created at `output_location`.
    pub fn run(
        &self,
        input: &dyn ChunkedArray,
        output_location: &Path,
        job: &TransformJob,
    ) -> Result<RunReport> {
        let plan = self.plan(input, job)?;
        let out_type = KernelSelector::output_type(input.element_type(), job.preserve_dtype);
        let output = RawFileArray::create(output_location, plan.out_shape, out_type, 0.0)?;
        info!(path = %output_location.display(), "output array created");
        self.execute(input, &output, job, plan)
    }

    /// Transform `input` into an existing array of the output shape.
    pub fn run_into(
        &self,
        input: &dyn ChunkedArray,
        output: &dyn ChunkedArray,
        job: &TransformJob,
    ) -> Result<RunReport> {
        let plan = self.plan(input, job)?;
        if output.shape() != plan.out_shape {
            return Err(ResampleError::ShapeMismatch {
                expected: plan.out_shape,
                actual: output.shape(),
            });
        }
        let out_type = KernelSelector::output_type(input.element_type(), job.preserve_dtype);
        if output.element_type() != out_type {
            return Err(ResampleError::invalid_input(format!(
                "output array holds {} samples, the job writes {out_type}",
                output.element_type()
            )));
        }
        self.execute(input, output, job, plan)
    }

    /// Every check that can fail without touching a device.
    fn plan(&self, input: &dyn ChunkedArray, job: &TransformJob) -> Result<RunPlan> {
        KernelSelector::select(input.element_type(), job.method, job.preserve_dtype)?;
        let source_map = job.transform.inverse()?;
        let out_shape = job
            .out_shape
            .unwrap_or_else(|| output_shape(&job.transform, input.shape()));
        let windows = ChunkPlanner::plan(out_shape, job.chunk_shape)?;
        LaunchParameters::for_volume(out_shape, job.block_shape)?;
        Ok(RunPlan {
            source_map,
            out_shape,
            windows,
        })
    }

    fn execute(
        &self,
        input: &dyn ChunkedArray,
        output: &dyn ChunkedArray,
        job: &TransformJob,
        plan: RunPlan,
    ) -> Result<RunReport> {
        let started = Instant::now();
        output.set_complete(false)?;
        info!(
            in_shape = ?input.shape(),
            out_shape = ?plan.out_shape,
            chunks = plan.windows.len(),
            devices = self.devices.len(),
            method = %job.method,
            "starting chunked transform"
        );

        let workers = ThreadPoolBuilder::new()
            .num_threads(self.devices.len())
            .thread_name(|i| format!("affine-fusion-worker-{i}"))
            .build()
            .map_err(|e| ResampleError::device(e.to_string()))?;

        // one worker per device, each pulling chunks until none are left
        let next = AtomicUsize::new(0);
        let results = workers.broadcast(|_| {
            let mut done = Vec::new();
            loop {
                let index = next.fetch_add(1, Ordering::Relaxed);
                let Some(window) = plan.windows.get(index) else {
                    break;
                };
                let outcome = self.pool.acquire().and_then(|lease| {
                    let device = &self.devices[lease.ordinal()];
                    self.transform_chunk(device, input, output, job, &plan.source_map, window)
                });
                done.push((index, outcome));
            }
            done
        });

        let mut report = RunReport {
            out_shape: plan.out_shape,
            chunks_total: plan.windows.len(),
            chunks_written: 0,
            chunks_skipped: 0,
            failures: Vec::new(),
            elapsed: Duration::ZERO,
        };
        let mut results: Vec<_> = results.into_iter().flatten().collect();
        results.sort_by_key(|(index, _)| *index);
        for (index, outcome) in results {
            match outcome {
                Ok(ChunkOutcome::Written) => report.chunks_written += 1,
                Ok(ChunkOutcome::Skipped) => report.chunks_skipped += 1,
                Err(error) => {
                    let window = plan.windows[index].clone();
                    warn!(?window, %error, "chunk failed");
                    report.failures.push(ChunkFailure { window, error });
                }
            }
        }

        output.set_complete(report.is_complete())?;
        report.elapsed = started.elapsed();
        if report.is_complete() {
            info!(
                written = report.chunks_written,
                skipped = report.chunks_skipped,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "chunked transform finished"
            );
        } else {
            warn!(
                failed = report.failures.len(),
                total = report.chunks_total,
                "chunked transform left the output incomplete"
            );
        }
        Ok(report)
    }

    fn transform_chunk(
        &self,
        device: &D,
        input: &dyn ChunkedArray,
        output: &dyn ChunkedArray,
        job: &TransformJob,
        source_map: &AffineMatrix,
        window: &ChunkWindow,
    ) -> Result<ChunkOutcome> {
        let Some(region) = input_region(source_map, window, input.shape()) else {
            debug!(?window, "chunk maps outside the input");
            return Ok(ChunkOutcome::Skipped);
        };
        let started = Instant::now();
        let source = Volume::upload(device, &input.read_region(&region)?)?;
        let local_map = chunk_source_map(source_map, window, &region);
        let result = VolumeResampler::new(device).resample_mapped(
            &source,
            &local_map,
            job.method,
            job.preserve_dtype,
            window.shape(),
            job.block_shape,
        )?;
        output.write_region(window, &result.to_host(device)?)?;
        debug!(
            device = %device.name(),
            ?window,
            ?region,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chunk written"
        );
        Ok(ChunkOutcome::Written)
    }
}
