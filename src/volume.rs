use ndarray::{Array3, s};

use crate::chunks::ChunkWindow;
use crate::device::ComputeDevice;
use crate::enums::ElementType;
use crate::error::{ResampleError, Result};

/// Volume extent in (Z, Y, X) order, as returned by `Array3::dim()`.
pub type Shape = (usize, usize, usize);

pub fn voxel_count(shape: Shape) -> usize {
    shape.0 * shape.1 * shape.2
}

/// C-ordered samples held in host memory.
#[derive(Clone, Debug, PartialEq)]
pub enum HostVolume {
    U16(Array3<u16>),
    F32(Array3<f32>),
}

impl HostVolume {
    pub fn zeros(shape: Shape, dtype: ElementType) -> Self {
        match dtype {
            ElementType::U16 => HostVolume::U16(Array3::zeros(shape)),
            ElementType::F32 => HostVolume::F32(Array3::zeros(shape)),
        }
    }

    /// A volume where every sample is `value`, rounded and clamped for uint16.
    pub fn filled(shape: Shape, dtype: ElementType, value: f64) -> Self {
        match dtype {
            ElementType::U16 => HostVolume::U16(Array3::from_elem(
                shape,
                value.round().clamp(0.0, u16::MAX as f64) as u16,
            )),
            ElementType::F32 => HostVolume::F32(Array3::from_elem(shape, value as f32)),
        }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn shape(&self) -> Shape {
        match self {
            HostVolume::U16(a) => a.dim(),
            HostVolume::F32(a) => a.dim(),
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            HostVolume::U16(_) => ElementType::U16,
            HostVolume::F32(_) => ElementType::F32,
        }
    }

    pub fn as_u16(&self) -> Option<&Array3<u16>> {
        match self {
            HostVolume::U16(a) => Some(a),
            HostVolume::F32(_) => None,
        }
    }

    pub fn as_f32(&self) -> Option<&Array3<f32>> {
        match self {
            HostVolume::F32(a) => Some(a),
            HostVolume::U16(_) => None,
        }
    }

    /// Copy of the samples promoted to float.
    pub fn to_f32(&self) -> Array3<f32> {
        match self {
            HostVolume::U16(a) => a.mapv(f32::from),
            HostVolume::F32(a) => a.clone(),
        }
    }

    fn check_window(&self, window: &ChunkWindow) -> Result<()> {
        let (z, y, x) = self.shape();
        if window.z.end > z || window.y.end > y || window.x.end > x {
            return Err(ResampleError::invalid_input(format!(
                "window {window:?} exceeds volume shape {:?}",
                self.shape()
            )));
        }
        Ok(())
    }

    /// Owned copy of the samples inside `window`.
    pub fn region(&self, window: &ChunkWindow) -> Result<HostVolume> {
        self.check_window(window)?;
        let slice = s![window.z.clone(), window.y.clone(), window.x.clone()];
        Ok(match self {
            HostVolume::U16(a) => HostVolume::U16(a.slice(slice).to_owned()),
            HostVolume::F32(a) => HostVolume::F32(a.slice(slice).to_owned()),
        })
    }

    /// Overwrite the samples inside `window` with `data`.
    pub fn assign_region(&mut self, window: &ChunkWindow, data: &HostVolume) -> Result<()> {
        self.check_window(window)?;
        if window.shape() != data.shape() {
            return Err(ResampleError::ShapeMismatch {
                expected: window.shape(),
                actual: data.shape(),
            });
        }
        let slice = s![window.z.clone(), window.y.clone(), window.x.clone()];
        match (self, data) {
            (HostVolume::U16(dst), HostVolume::U16(src)) => dst.slice_mut(slice).assign(src),
            (HostVolume::F32(dst), HostVolume::F32(src)) => dst.slice_mut(slice).assign(src),
            (dst, src) => {
                return Err(ResampleError::invalid_input(format!(
                    "cannot write {} samples into a {} volume",
                    src.element_type(),
                    dst.element_type()
                )));
            }
        }
        Ok(())
    }
}

impl From<Array3<u16>> for HostVolume {
    fn from(data: Array3<u16>) -> Self {
        HostVolume::U16(data)
    }
}

impl From<Array3<f32>> for HostVolume {
    fn from(data: Array3<f32>) -> Self {
        HostVolume::F32(data)
    }
}

/// A buffer owned by one compute device.
pub struct DeviceVolume<D: ComputeDevice> {
    buffer: D::Buffer,
    shape: Shape,
    dtype: ElementType,
    device: usize,
}

impl<D: ComputeDevice> DeviceVolume<D> {
    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn element_type(&self) -> ElementType {
        self.dtype
    }

    /// Ordinal of the device holding the buffer.
    pub fn device_ordinal(&self) -> usize {
        self.device
    }

    pub(crate) fn buffer(&self) -> &D::Buffer {
        &self.buffer
    }
}

/// A volume tagged with where its samples live.
///
/// Device operations only accept [`Volume::Device`]; the residency is checked
/// once when a volume enters an operation.
pub enum Volume<D: ComputeDevice> {
    Host(HostVolume),
    Device(DeviceVolume<D>),
}

impl<D: ComputeDevice> Volume<D> {
    /// Copy host samples onto `device`.
    pub fn upload(device: &D, data: &HostVolume) -> Result<Self> {
        let shape = data.shape();
        if voxel_count(shape) == 0 {
            return Err(ResampleError::invalid_input(format!(
                "cannot upload empty volume of shape {shape:?}"
            )));
        }
        Ok(Volume::Device(DeviceVolume {
            buffer: device.upload(data)?,
            shape,
            dtype: data.element_type(),
            device: device.ordinal(),
        }))
    }

    /// A zero-initialised device volume.
    pub fn zeros(device: &D, shape: Shape, dtype: ElementType) -> Result<Self> {
        if voxel_count(shape) == 0 {
            return Err(ResampleError::invalid_input(format!(
                "cannot allocate empty volume of shape {shape:?}"
            )));
        }
        Ok(Volume::Device(DeviceVolume {
            buffer: device.zeros(shape, dtype)?,
            shape,
            dtype,
            device: device.ordinal(),
        }))
    }

    pub fn shape(&self) -> Shape {
        match self {
            Volume::Host(data) => data.shape(),
            Volume::Device(data) => data.shape,
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            Volume::Host(data) => data.element_type(),
            Volume::Device(data) => data.dtype,
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self, Volume::Device(_))
    }

    /// The device buffer, provided it lives on `device`.
    pub fn on_device(&self, device: &D) -> Result<&DeviceVolume<D>> {
        match self {
            Volume::Host(_) => Err(ResampleError::invalid_input(
                "volume is host-resident, upload it to a device first",
            )),
            Volume::Device(data) if data.device != device.ordinal() => {
                Err(ResampleError::invalid_input(format!(
                    "volume lives on device {} but the operation runs on device {}",
                    data.device,
                    device.ordinal()
                )))
            }
            Volume::Device(data) => Ok(data),
        }
    }

    /// Copy the samples back into host memory.
    pub fn to_host(&self, device: &D) -> Result<HostVolume> {
        match self {
            Volume::Host(data) => Ok(data.clone()),
            Volume::Device(_) => {
                let data = self.on_device(device)?;
                device.download(&data.buffer, data.shape, data.dtype)
            }
        }
    }
}

impl<D: ComputeDevice> From<HostVolume> for Volume<D> {
    fn from(data: HostVolume) -> Self {
        Volume::Host(data)
    }
}
