//! Reference device running the kernels on host memory.
//!
//! It executes the same per-voxel semantics as the WGSL kernels, spread over
//! the rayon thread pool, and only touches voxels reached by the launch grid.
//! It backs machines without a GPU adapter and the test suite.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use ndarray::{Array3, Zip};
use tracing::debug;

use crate::device::{ComputeDevice, KernelArgs};
use crate::enums::ElementType;
use crate::error::{ResampleError, Result};
use crate::interpolator::Interpolator;
use crate::kernels::{KernelHandle, KernelId, LaunchParameters};
use crate::volume::{HostVolume, Shape};

pub struct CpuDevice {
    ordinal: usize,
    name: String,
}

/// Host memory standing in for a device allocation.
pub struct CpuBuffer(RwLock<HostVolume>);

impl CpuBuffer {
    fn read(&self) -> Result<RwLockReadGuard<'_, HostVolume>> {
        self.0.read().map_err(ResampleError::poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HostVolume>> {
        self.0.write().map_err(ResampleError::poisoned)
    }
}

impl CpuDevice {
    pub fn new(ordinal: usize) -> Self {
        Self {
            ordinal,
            name: format!("cpu:{ordinal}"),
        }
    }

    /// `count` devices with ordinals `0..count`.
    pub fn pool(count: usize) -> Vec<Self> {
        (0..count).map(Self::new).collect()
    }
}

fn expect_shape(actual: Shape, expected: Shape) -> Result<()> {
    if actual != expected {
        return Err(ResampleError::ShapeMismatch { expected, actual });
    }
    Ok(())
}

fn within(covered: Shape, (z, y, x): (usize, usize, usize)) -> bool {
    z < covered.0 && y < covered.1 && x < covered.2
}

impl ComputeDevice for CpuDevice {
    type Buffer = CpuBuffer;

    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn upload(&self, data: &HostVolume) -> Result<CpuBuffer> {
        Ok(CpuBuffer(RwLock::new(data.clone())))
    }

    fn zeros(&self, shape: Shape, dtype: ElementType) -> Result<CpuBuffer> {
        Ok(CpuBuffer(RwLock::new(HostVolume::zeros(shape, dtype))))
    }

    fn download(&self, buffer: &CpuBuffer, shape: Shape, dtype: ElementType) -> Result<HostVolume> {
        let data = buffer.read()?;
        expect_shape(data.shape(), shape)?;
        if data.element_type() != dtype {
            return Err(ResampleError::invalid_input(format!(
                "buffer holds {} samples, {dtype} requested",
                data.element_type()
            )));
        }
        Ok(data.clone())
    }

    fn launch(
        &self,
        kernel: &KernelHandle,
        launch: &LaunchParameters,
        args: KernelArgs<'_, CpuBuffer>,
    ) -> Result<()> {
        if !args.matches(&kernel.id) {
            return Err(ResampleError::invalid_input(format!(
                "arguments do not match kernel {}",
                kernel.name
            )));
        }
        debug!(device = %self.name, kernel = %kernel.name, grid = ?launch.grid, "launch");
        let covered = launch.covered_shape();

        match (kernel.id, args) {
            (
                KernelId::Transform { method, output: out_type, .. },
                KernelArgs::Transform {
                    output,
                    input,
                    coverage,
                    matrix,
                    out_shape,
                    in_shape,
                },
            ) => {
                let src = {
                    let input = input.read()?;
                    expect_shape(input.shape(), in_shape)?;
                    input.to_f32()
                };
                let src = src.view();

                let mut samples = Array3::<Option<f32>>::default(out_shape);
                Zip::indexed(&mut samples).par_for_each(|(z, y, x), sample| {
                    if within(covered, (z, y, x)) {
                        let v = Interpolator::source_coord(&matrix, x, y, z);
                        *sample = Interpolator::sample(method, &src, v);
                    }
                });

                let mut out = output.write()?;
                expect_shape(out.shape(), out_shape)?;
                match (&mut *out, out_type) {
                    (HostVolume::U16(dst), ElementType::U16) => {
                        Zip::from(dst).and(&samples).par_for_each(|d, s| {
                            if let Some(v) = s {
                                *d = Interpolator::encode_u16(*v);
                            }
                        })
                    }
                    (HostVolume::F32(dst), ElementType::F32) => {
                        Zip::from(dst).and(&samples).par_for_each(|d, s| {
                            if let Some(v) = s {
                                *d = *v;
                            }
                        })
                    }
                    (other, _) => {
                        return Err(ResampleError::invalid_input(format!(
                            "output buffer holds {} samples, kernel writes {out_type}",
                            other.element_type()
                        )));
                    }
                }

                if let Some(coverage) = coverage {
                    let mut mask = coverage.write()?;
                    let HostVolume::U16(mask) = &mut *mask else {
                        return Err(ResampleError::invalid_input("coverage must be uint16"));
                    };
                    expect_shape(mask.dim(), out_shape)?;
                    Zip::from(mask).and(&samples).par_for_each(|m, s| {
                        if s.is_some() {
                            *m = 1;
                        }
                    });
                }
                Ok(())
            }

            (
                KernelId::MaxBlend(_),
                KernelArgs::MaxBlend {
                    existing,
                    new_view,
                    shape,
                },
            ) => {
                let mut existing = existing.write()?;
                let new_view = new_view.read()?;
                expect_shape(existing.shape(), shape)?;
                expect_shape(new_view.shape(), shape)?;
                match (&mut *existing, &*new_view) {
                    (HostVolume::U16(e), HostVolume::U16(n)) => {
                        Zip::indexed(e).and(n).par_for_each(|idx, e, &n| {
                            if within(covered, idx) {
                                *e = (*e).max(n);
                            }
                        })
                    }
                    (HostVolume::F32(e), HostVolume::F32(n)) => {
                        Zip::indexed(e).and(n).par_for_each(|idx, e, &n| {
                            if within(covered, idx) {
                                *e = e.max(n);
                            }
                        })
                    }
                    _ => {
                        return Err(ResampleError::invalid_input(
                            "max blend operands must share an element type",
                        ));
                    }
                }
                Ok(())
            }

            (
                KernelId::MeanBlend(_),
                KernelArgs::MeanBlend {
                    sum,
                    count,
                    new_view,
                    coverage,
                    shape,
                },
            ) => {
                let view = new_view.read()?.to_f32();
                let coverage = coverage.read()?;
                let Some(mask) = coverage.as_u16() else {
                    return Err(ResampleError::invalid_input("coverage must be uint16"));
                };
                let mut sum = sum.write()?;
                let mut count = count.write()?;
                let (HostVolume::F32(sum), HostVolume::F32(count)) = (&mut *sum, &mut *count)
                else {
                    return Err(ResampleError::invalid_input(
                        "mean accumulators must be float32",
                    ));
                };
                for s in [sum.dim(), count.dim(), view.dim(), mask.dim()] {
                    expect_shape(s, shape)?;
                }
                Zip::indexed(sum)
                    .and(count)
                    .and(&view)
                    .and(mask)
                    .par_for_each(|idx, s, c, &v, &m| {
                        if within(covered, idx) && m != 0 {
                            *s += v;
                            *c += 1.0;
                        }
                    });
                Ok(())
            }

            (
                KernelId::MeanFinalize,
                KernelArgs::MeanFinalize {
                    output,
                    sum,
                    count,
                    shape,
                },
            ) => {
                let sum = sum.read()?;
                let count = count.read()?;
                let mut output = output.write()?;
                let (HostVolume::F32(dst), Some(sum), Some(count)) =
                    (&mut *output, sum.as_f32(), count.as_f32())
                else {
                    return Err(ResampleError::invalid_input("mean finalize works on float32"));
                };
                for s in [dst.dim(), sum.dim(), count.dim()] {
                    expect_shape(s, shape)?;
                }
                Zip::indexed(dst)
                    .and(sum)
                    .and(count)
                    .par_for_each(|idx, d, &s, &c| {
                        if within(covered, idx) {
                            *d = if c > 0.0 { s / c } else { 0.0 };
                        }
                    });
                Ok(())
            }

            _ => Err(ResampleError::invalid_input(format!(
                "arguments do not match kernel {}",
                kernel.name
            ))),
        }
    }
}
