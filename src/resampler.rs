//! Affine resampling of one device-resident volume.

use tracing::debug;

use crate::device::{ComputeDevice, KernelArgs};
use crate::enums::{ElementType, Method};
use crate::error::Result;
use crate::kernels::{KernelSelector, LaunchParameters};
use crate::transform::{AffineMatrix, output_shape};
use crate::volume::{Shape, Volume};

/// A resampled view together with the mask of voxels the kernel actually
/// sampled (1) versus left as background (0). The mask is uint16.
pub struct SampledView<D: ComputeDevice> {
    pub values: Volume<D>,
    pub coverage: Volume<D>,
}

impl<D: ComputeDevice> SampledView<D> {
    pub fn shape(&self) -> Shape {
        self.values.shape()
    }
}

/// Runs transform kernels on a single device.
pub struct VolumeResampler<'d, D: ComputeDevice> {
    device: &'d D,
}

impl<'d, D: ComputeDevice> VolumeResampler<'d, D> {
    pub fn new(device: &'d D) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &'d D {
        self.device
    }

    /// Apply `transform` (input space to output space) to `input`.
    ///
    /// Without `out_shape` the output is the bounding shape of the
    /// transformed input. The input is never modified.
    pub fn resample(
        &self,
        input: &Volume<D>,
        transform: &AffineMatrix,
        method: Method,
        preserve_dtype: bool,
        out_shape: Option<Shape>,
        block_shape: Shape,
    ) -> Result<Volume<D>> {
        let out_shape = out_shape.unwrap_or_else(|| output_shape(transform, input.shape()));
        let source_map = transform.inverse()?;
        self.resample_mapped(
            input,
            &source_map,
            method,
            preserve_dtype,
            out_shape,
            block_shape,
        )
    }

    /// Resample with a matrix that already maps output voxels to input
    /// coordinates.
    pub fn resample_mapped(
        &self,
        input: &Volume<D>,
        source_map: &AffineMatrix,
        method: Method,
        preserve_dtype: bool,
        out_shape: Shape,
        block_shape: Shape,
    ) -> Result<Volume<D>> {
        let (values, _) = self.dispatch(
            input,
            source_map,
            method,
            preserve_dtype,
            out_shape,
            block_shape,
            false,
        )?;
        Ok(values)
    }

    /// Like [`VolumeResampler::resample`] into a fixed frame, also recording
    /// which voxels received a sample.
    pub fn resample_with_coverage(
        &self,
        input: &Volume<D>,
        transform: &AffineMatrix,
        method: Method,
        preserve_dtype: bool,
        out_shape: Shape,
        block_shape: Shape,
    ) -> Result<SampledView<D>> {
        let source_map = transform.inverse()?;
        let (values, coverage) = self.dispatch(
            input,
            &source_map,
            method,
            preserve_dtype,
            out_shape,
            block_shape,
            true,
        )?;
        let coverage = match coverage {
            Some(coverage) => coverage,
            None => Volume::zeros(self.device, out_shape, ElementType::U16)?,
        };
        Ok(SampledView { values, coverage })
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        input: &Volume<D>,
        source_map: &AffineMatrix,
        method: Method,
        preserve_dtype: bool,
        out_shape: Shape,
        block_shape: Shape,
        with_coverage: bool,
    ) -> Result<(Volume<D>, Option<Volume<D>>)> {
        let source = input.on_device(self.device)?;
        let kernel = KernelSelector::select(source.element_type(), method, preserve_dtype)?;
        let launch = LaunchParameters::for_volume(out_shape, block_shape)?;
        let out_type = KernelSelector::output_type(source.element_type(), preserve_dtype);

        let output = Volume::zeros(self.device, out_shape, out_type)?;
        let coverage = if with_coverage {
            Some(Volume::zeros(self.device, out_shape, ElementType::U16)?)
        } else {
            None
        };

        debug!(
            device = %self.device.name(),
            kernel = %kernel.name,
            in_shape = ?source.shape(),
            ?out_shape,
            "resample"
        );
        self.device.launch(
            kernel,
            &launch,
            KernelArgs::Transform {
                output: output.on_device(self.device)?.buffer(),
                input: source.buffer(),
                coverage: match &coverage {
                    Some(mask) => Some(mask.on_device(self.device)?.buffer()),
                    None => None,
                },
                matrix: source_map.to_f32_rows(),
                out_shape,
                in_shape: source.shape(),
            },
        )?;
        Ok((output, coverage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_device::CpuDevice;
    use crate::error::ResampleError;
    use crate::kernels::DEFAULT_BLOCK_SHAPE;
    use crate::volume::HostVolume;
    use ndarray::Array3;

    fn counting_u16(shape: Shape) -> HostVolume {
        HostVolume::from(Array3::from_shape_fn(shape, |(z, y, x)| {
            (z * 100 + y * 10 + x + 1) as u16
        }))
    }

    #[test]
    fn identity_nearest_reproduces_uint16_input() {
        let device = CpuDevice::new(0);
        let host = counting_u16((4, 4, 4));
        let input = Volume::upload(&device, &host).unwrap();
        let out = VolumeResampler::new(&device)
            .resample(
                &input,
                &AffineMatrix::identity(),
                Method::Nearest,
                true,
                None,
                DEFAULT_BLOCK_SHAPE,
            )
            .unwrap();
        assert_eq!(out.shape(), (4, 4, 4));
        assert_eq!(out.element_type(), ElementType::U16);
        assert_eq!(out.to_host(&device).unwrap(), host);
    }

    #[test]
    fn uint16_input_promotes_without_preserve() {
        let device = CpuDevice::new(0);
        let host = counting_u16((3, 3, 3));
        let input = Volume::upload(&device, &host).unwrap();
        let out = VolumeResampler::new(&device)
            .resample(
                &input,
                &AffineMatrix::identity(),
                Method::Linear,
                false,
                Some((2, 2, 2)),
                (2, 2, 2),
            )
            .unwrap();
        assert_eq!(out.element_type(), ElementType::F32);
        let out = out.to_host(&device).unwrap();
        assert_eq!(out.as_f32().unwrap()[[1, 1, 1]], 112.0);
    }

    #[test]
    fn host_input_is_rejected() {
        let device = CpuDevice::new(0);
        let input: Volume<CpuDevice> = counting_u16((2, 2, 2)).into();
        let err = VolumeResampler::new(&device)
            .resample(
                &input,
                &AffineMatrix::identity(),
                Method::Nearest,
                false,
                None,
                DEFAULT_BLOCK_SHAPE,
            )
            .err()
            .unwrap();
        assert!(matches!(err, ResampleError::InvalidInput(_)));
    }

    #[test]
    fn volume_from_another_device_is_rejected() {
        let devices = CpuDevice::pool(2);
        let input = Volume::upload(&devices[1], &counting_u16((2, 2, 2))).unwrap();
        let result = VolumeResampler::new(&devices[0]).resample(
            &input,
            &AffineMatrix::identity(),
            Method::Nearest,
            false,
            None,
            DEFAULT_BLOCK_SHAPE,
        );
        assert!(matches!(result, Err(ResampleError::InvalidInput(_))));
    }

    #[test]
    fn translation_shifts_and_pads_with_background() {
        let device = CpuDevice::new(0);
        let host = counting_u16((4, 4, 4));
        let input = Volume::upload(&device, &host).unwrap();
        let view = VolumeResampler::new(&device)
            .resample_with_coverage(
                &input,
                &AffineMatrix::translation(1.0, 0.0, 0.0),
                Method::Nearest,
                true,
                (4, 4, 4),
                DEFAULT_BLOCK_SHAPE,
            )
            .unwrap();
        let values = view.values.to_host(&device).unwrap();
        let values = values.as_u16().unwrap();
        let coverage = view.coverage.to_host(&device).unwrap();
        let coverage = coverage.as_u16().unwrap();
        let source = host.as_u16().unwrap();
        for z in 0..4 {
            for y in 0..4 {
                assert_eq!(values[[z, y, 0]], 0);
                assert_eq!(coverage[[z, y, 0]], 0);
                for x in 1..4 {
                    assert_eq!(values[[z, y, x]], source[[z, y, x - 1]]);
                    assert_eq!(coverage[[z, y, x]], 1);
                }
            }
        }
    }

    #[test]
    fn cubic_spline_keeps_an_interior_constant() {
        let device = CpuDevice::new(0);
        let host = HostVolume::filled((8, 8, 8), ElementType::F32, 5.0);
        let input = Volume::upload(&device, &host).unwrap();
        let out = VolumeResampler::new(&device)
            .resample(
                &input,
                &AffineMatrix::translation(0.25, -0.5, 0.75),
                Method::CubicSpline,
                false,
                None,
                DEFAULT_BLOCK_SHAPE,
            )
            .unwrap()
            .to_host(&device)
            .unwrap();
        let out = out.as_f32().unwrap();
        assert!((out[[4, 4, 4]] - 5.0).abs() < 1e-4);
    }

    #[test]
    fn zero_block_dimension_is_invalid() {
        let device = CpuDevice::new(0);
        let input = Volume::upload(&device, &counting_u16((2, 2, 2))).unwrap();
        let result = VolumeResampler::new(&device).resample(
            &input,
            &AffineMatrix::identity(),
            Method::Nearest,
            false,
            Some((2, 2, 2)),
            (0, 1, 1),
        );
        assert!(matches!(result, Err(ResampleError::InvalidInput(_))));
    }

    #[test]
    fn cubic_spline_drops_out_of_bounds_contributions_at_the_edge() {
        let device = CpuDevice::new(0);
        let host = HostVolume::filled((6, 6, 6), ElementType::F32, 10.0);
        let input = Volume::upload(&device, &host).unwrap();
        let view = VolumeResampler::new(&device)
            .resample_with_coverage(
                &input,
                &AffineMatrix::identity(),
                Method::CubicSpline,
                false,
                (6, 6, 6),
                DEFAULT_BLOCK_SHAPE,
            )
            .unwrap();
        let values = view.values.to_host(&device).unwrap();
        let values = values.as_f32().unwrap();
        let coverage = view.coverage.to_host(&device).unwrap();
        let coverage = coverage.as_u16().unwrap();

        // the lower fetch at x=0 and the upper fetch from x=4 on fall outside
        let expected = [10.0 / 6.0, 10.0, 10.0, 10.0, 50.0 / 6.0, 50.0 / 6.0];
        for (x, want) in expected.iter().enumerate() {
            let got = values[[2, 2, x]];
            assert!((got - want).abs() < 1e-4, "x={x}: {got} != {want}");
            assert_eq!(coverage[[2, 2, x]], 1);
        }
    }

    #[test]
    fn trilinear_with_a_negative_floor_is_background() {
        let device = CpuDevice::new(0);
        let host = HostVolume::from(Array3::from_shape_fn((4, 4, 6), |(_, _, x)| x as f32));
        let input = Volume::upload(&device, &host).unwrap();
        let view = VolumeResampler::new(&device)
            .resample_with_coverage(
                &input,
                &AffineMatrix::translation(0.5, 0.0, 0.0),
                Method::Linear,
                false,
                (4, 4, 6),
                DEFAULT_BLOCK_SHAPE,
            )
            .unwrap();
        let values = view.values.to_host(&device).unwrap();
        let values = values.as_f32().unwrap();
        let coverage = view.coverage.to_host(&device).unwrap();
        let coverage = coverage.as_u16().unwrap();

        // x=0 samples at -0.5
        assert_eq!(values[[1, 1, 0]], 0.0);
        assert_eq!(coverage[[1, 1, 0]], 0);
        for x in 1..6 {
            assert_eq!(values[[1, 1, x]], x as f32 - 0.5);
            assert_eq!(coverage[[1, 1, x]], 1);
        }
    }
}
