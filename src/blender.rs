//! Combining resampled views into a shared output frame.

use tracing::{debug, info};

use crate::device::{ComputeDevice, KernelArgs};
use crate::enums::{BlendMode, ElementType, Method};
use crate::error::{ResampleError, Result};
use crate::kernels::{DEFAULT_BLOCK_SHAPE, KernelSelector, LaunchParameters};
use crate::resampler::{SampledView, VolumeResampler};
use crate::transform::AffineMatrix;
use crate::volume::{Shape, Volume};

fn expect_same_shape(expected: Shape, actual: Shape) -> Result<()> {
    if expected != actual {
        return Err(ResampleError::ShapeMismatch { expected, actual });
    }
    Ok(())
}

/// Stateless blend operations on one device.
pub struct ViewBlender<'d, D: ComputeDevice> {
    device: &'d D,
    block_shape: Shape,
}

impl<'d, D: ComputeDevice> ViewBlender<'d, D> {
    pub fn new(device: &'d D) -> Self {
        Self {
            device,
            block_shape: DEFAULT_BLOCK_SHAPE,
        }
    }

    pub fn with_block_shape(mut self, block_shape: Shape) -> Self {
        self.block_shape = block_shape;
        self
    }

    /// `existing = max(existing, new_view)` per voxel, in place.
    ///
    /// Background in `new_view` is zero, so it never raises the maximum of
    /// non-negative data.
    pub fn max_blend(&self, existing: &mut Volume<D>, new_view: &Volume<D>) -> Result<()> {
        expect_same_shape(existing.shape(), new_view.shape())?;
        let target = existing.on_device(self.device)?;
        let view = new_view.on_device(self.device)?;
        if target.element_type() != view.element_type() {
            return Err(ResampleError::invalid_input(format!(
                "cannot max-blend {} samples into a {} volume",
                view.element_type(),
                target.element_type()
            )));
        }
        let kernel = KernelSelector::max_blend(target.element_type())?;
        let launch = LaunchParameters::for_volume(target.shape(), self.block_shape)?;
        self.device.launch(
            kernel,
            &launch,
            KernelArgs::MaxBlend {
                existing: target.buffer(),
                new_view: view.buffer(),
                shape: target.shape(),
            },
        )
    }

    /// Add every sampled voxel of `view` to `sum` and bump `count` there.
    ///
    /// Voxels the view left as background contribute nothing, even where the
    /// background value equals a real sample.
    pub fn mean_blend(
        &self,
        sum: &mut Volume<D>,
        count: &mut Volume<D>,
        view: &SampledView<D>,
    ) -> Result<()> {
        expect_same_shape(sum.shape(), count.shape())?;
        expect_same_shape(sum.shape(), view.values.shape())?;
        expect_same_shape(sum.shape(), view.coverage.shape())?;
        let sum = sum.on_device(self.device)?;
        let count = count.on_device(self.device)?;
        let values = view.values.on_device(self.device)?;
        let coverage = view.coverage.on_device(self.device)?;
        if sum.element_type() != ElementType::F32 || count.element_type() != ElementType::F32 {
            return Err(ResampleError::invalid_input(
                "mean accumulators must be float32",
            ));
        }
        if coverage.element_type() != ElementType::U16 {
            return Err(ResampleError::invalid_input("coverage must be uint16"));
        }
        let kernel = KernelSelector::mean_blend(values.element_type())?;
        let launch = LaunchParameters::for_volume(sum.shape(), self.block_shape)?;
        self.device.launch(
            kernel,
            &launch,
            KernelArgs::MeanBlend {
                sum: sum.buffer(),
                count: count.buffer(),
                new_view: values.buffer(),
                coverage: coverage.buffer(),
                shape: sum.shape(),
            },
        )
    }

    /// Resample every `(volume, transform)` pair into the frame of
    /// `out_shape` and blend the results.
    ///
    /// Max fusion keeps the views' output element type; mean fusion always
    /// yields float32.
    pub fn fuse(
        &self,
        views: &[(&Volume<D>, AffineMatrix)],
        mode: BlendMode,
        out_shape: Shape,
        method: Method,
        preserve_dtype: bool,
    ) -> Result<Volume<D>> {
        let Some((first, _)) = views.first() else {
            return Err(ResampleError::invalid_input("nothing to fuse"));
        };
        let resampler = VolumeResampler::new(self.device);
        info!(views = views.len(), ?mode, ?out_shape, "fusing views");

        match mode {
            BlendMode::Max => {
                let dtype = KernelSelector::output_type(first.element_type(), preserve_dtype);
                let mut acc = MaxAccumulator::new(self.device, out_shape, dtype)?
                    .with_block_shape(self.block_shape);
                for (i, (volume, transform)) in views.iter().enumerate() {
                    let view = resampler.resample(
                        volume,
                        transform,
                        method,
                        preserve_dtype,
                        Some(out_shape),
                        self.block_shape,
                    )?;
                    acc.blend(&view)?;
                    debug!(view = i, "max-blended");
                }
                Ok(acc.finalize())
            }
            BlendMode::Mean => {
                let mut acc = MeanAccumulator::new(self.device, out_shape)?
                    .with_block_shape(self.block_shape);
                for (i, (volume, transform)) in views.iter().enumerate() {
                    let view = resampler.resample_with_coverage(
                        volume,
                        transform,
                        method,
                        preserve_dtype,
                        out_shape,
                        self.block_shape,
                    )?;
                    acc.blend(&view)?;
                    debug!(view = i, "mean-blended");
                }
                acc.finalize()
            }
        }
    }
}

/// Running maximum over any number of views.
pub struct MaxAccumulator<'d, D: ComputeDevice> {
    blender: ViewBlender<'d, D>,
    target: Volume<D>,
    views: usize,
}

impl<'d, D: ComputeDevice> MaxAccumulator<'d, D> {
    pub fn new(device: &'d D, shape: Shape, dtype: ElementType) -> Result<Self> {
        Ok(Self {
            blender: ViewBlender::new(device),
            target: Volume::zeros(device, shape, dtype)?,
            views: 0,
        })
    }

    pub fn with_block_shape(mut self, block_shape: Shape) -> Self {
        self.blender = self.blender.with_block_shape(block_shape);
        self
    }

    pub fn blend(&mut self, view: &Volume<D>) -> Result<()> {
        self.blender.max_blend(&mut self.target, view)?;
        self.views += 1;
        Ok(())
    }

    pub fn views(&self) -> usize {
        self.views
    }

    pub fn finalize(self) -> Volume<D> {
        self.target
    }
}

/// Running sum and contribution count; the mean only exists after
/// [`MeanAccumulator::finalize`].
pub struct MeanAccumulator<'d, D: ComputeDevice> {
    blender: ViewBlender<'d, D>,
    sum: Volume<D>,
    count: Volume<D>,
    views: usize,
}

impl<'d, D: ComputeDevice> MeanAccumulator<'d, D> {
    pub fn new(device: &'d D, shape: Shape) -> Result<Self> {
        Ok(Self {
            blender: ViewBlender::new(device),
            sum: Volume::zeros(device, shape, ElementType::F32)?,
            count: Volume::zeros(device, shape, ElementType::F32)?,
            views: 0,
        })
    }

    pub fn with_block_shape(mut self, block_shape: Shape) -> Self {
        self.blender = self.blender.with_block_shape(block_shape);
        self
    }

    pub fn shape(&self) -> Shape {
        self.sum.shape()
    }

    pub fn views(&self) -> usize {
        self.views
    }

    pub fn blend(&mut self, view: &SampledView<D>) -> Result<()> {
        self.blender
            .mean_blend(&mut self.sum, &mut self.count, view)?;
        self.views += 1;
        Ok(())
    }

    /// `sum / count` where `count > 0`, zero elsewhere.
    pub fn finalize(self) -> Result<Volume<D>> {
        let device = self.blender.device;
        let shape = self.shape();
        let output = Volume::zeros(device, shape, ElementType::F32)?;
        let kernel = KernelSelector::mean_finalize()?;
        let launch = LaunchParameters::for_volume(shape, self.blender.block_shape)?;
        device.launch(
            kernel,
            &launch,
            KernelArgs::MeanFinalize {
                output: output.on_device(device)?.buffer(),
                sum: self.sum.on_device(device)?.buffer(),
                count: self.count.on_device(device)?.buffer(),
                shape,
            },
        )?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_device::CpuDevice;
    use crate::volume::HostVolume;
    use ndarray::Array3;

    fn ramp(shape: Shape) -> HostVolume {
        HostVolume::from(Array3::from_shape_fn(shape, |(z, y, x)| {
            (x + 2 * y + 3 * z) as f32
        }))
    }

    #[test]
    fn max_blend_keeps_the_larger_sample() {
        let device = CpuDevice::new(0);
        let a = HostVolume::from(Array3::from_shape_vec((1, 1, 3), vec![1u16, 9, 4]).unwrap());
        let b = HostVolume::from(Array3::from_shape_vec((1, 1, 3), vec![5u16, 2, 4]).unwrap());
        let mut existing = Volume::upload(&device, &a).unwrap();
        let view = Volume::upload(&device, &b).unwrap();
        ViewBlender::new(&device)
            .max_blend(&mut existing, &view)
            .unwrap();
        let out = existing.to_host(&device).unwrap();
        assert_eq!(out.as_u16().unwrap().as_slice().unwrap(), &[5, 9, 4]);
    }

    #[test]
    fn blending_requires_matching_shapes() {
        let device = CpuDevice::new(0);
        let mut existing = Volume::zeros(&device, (2, 2, 2), ElementType::F32).unwrap();
        let view = Volume::zeros(&device, (2, 2, 3), ElementType::F32).unwrap();
        let err = ViewBlender::new(&device)
            .max_blend(&mut existing, &view)
            .unwrap_err();
        assert!(matches!(
            err,
            ResampleError::ShapeMismatch {
                expected: (2, 2, 2),
                actual: (2, 2, 3)
            }
        ));

        let mut acc = MeanAccumulator::new(&device, (2, 2, 2)).unwrap();
        let sampled = VolumeResampler::new(&device)
            .resample_with_coverage(
                &view,
                &AffineMatrix::identity(),
                Method::Nearest,
                false,
                (2, 2, 3),
                DEFAULT_BLOCK_SHAPE,
            )
            .unwrap();
        assert!(matches!(
            acc.blend(&sampled),
            Err(ResampleError::ShapeMismatch { .. })
        ));
        assert_eq!(acc.views(), 0);
    }

    #[test]
    fn mean_of_the_same_view_twice_is_the_view() {
        let device = CpuDevice::new(0);
        let input = Volume::upload(&device, &ramp((4, 4, 4))).unwrap();
        let resampler = VolumeResampler::new(&device);
        let shift = AffineMatrix::translation(1.0, 0.0, 0.0);
        let view = resampler
            .resample_with_coverage(&input, &shift, Method::Nearest, false, (4, 4, 4), (2, 2, 2))
            .unwrap();

        let mut acc = MeanAccumulator::new(&device, (4, 4, 4)).unwrap();
        acc.blend(&view).unwrap();
        acc.blend(&view).unwrap();
        assert_eq!(acc.views(), 2);
        let mean = acc.finalize().unwrap().to_host(&device).unwrap();
        let single = view.values.to_host(&device).unwrap();
        assert_eq!(mean, single);
    }

    #[test]
    fn mean_counts_only_sampled_voxels() {
        let device = CpuDevice::new(0);
        let input = Volume::upload(&device, &ramp((2, 2, 4))).unwrap();
        let shape = (2, 2, 4);
        let views = [
            (&input, AffineMatrix::identity()),
            (&input, AffineMatrix::translation(2.0, 0.0, 0.0)),
        ];
        let fused = ViewBlender::new(&device)
            .fuse(&views, BlendMode::Mean, shape, Method::Nearest, false)
            .unwrap()
            .to_host(&device)
            .unwrap();
        let fused = fused.as_f32().unwrap();
        // x = 0, 1 are only covered by the unshifted view
        assert_eq!(fused[[1, 1, 0]], 5.0);
        assert_eq!(fused[[1, 1, 1]], 6.0);
        // x = 2 averages input x = 2 and input x = 0
        assert_eq!(fused[[1, 1, 2]], (7.0 + 5.0) / 2.0);
    }

    #[test]
    fn max_fusion_of_shifted_views() {
        let device = CpuDevice::new(0);
        let input = Volume::upload(&device, &ramp((2, 2, 4))).unwrap();
        let views = [
            (&input, AffineMatrix::identity()),
            (&input, AffineMatrix::translation(1.0, 0.0, 0.0)),
        ];
        let fused = ViewBlender::new(&device)
            .with_block_shape((1, 2, 2))
            .fuse(&views, BlendMode::Max, (2, 2, 4), Method::Nearest, false)
            .unwrap()
            .to_host(&device)
            .unwrap();
        let fused = fused.as_f32().unwrap();
        assert_eq!(fused[[0, 0, 0]], 0.0);
        assert_eq!(fused[[0, 0, 3]], 3.0);
        assert_eq!(fused[[1, 1, 1]], 6.0);
    }

    #[test]
    fn fusing_nothing_is_an_error() {
        let device = CpuDevice::new(0);
        let result = ViewBlender::new(&device).fuse(
            &[],
            BlendMode::Max,
            (1, 1, 1),
            Method::Linear,
            false,
        );
        assert!(matches!(result, Err(ResampleError::InvalidInput(_))));
    }
}
