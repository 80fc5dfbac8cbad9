//! The compute-device seam: buffer residency and kernel dispatch.

use crate::enums::ElementType;
use crate::error::Result;
use crate::kernels::{KernelHandle, KernelId, LaunchParameters};
use crate::volume::{HostVolume, Shape};

/// Positional kernel arguments, one variant per kernel family.
pub enum KernelArgs<'a, B> {
    Transform {
        output: &'a B,
        input: &'a B,
        /// Set to 1 wherever the kernel actually sampled the input.
        coverage: Option<&'a B>,
        /// Output voxel to input coordinate, row-major, XYZ + homogeneous.
        matrix: [f32; 16],
        out_shape: Shape,
        in_shape: Shape,
    },
    MaxBlend {
        existing: &'a B,
        new_view: &'a B,
        shape: Shape,
    },
    MeanBlend {
        sum: &'a B,
        count: &'a B,
        new_view: &'a B,
        coverage: &'a B,
        shape: Shape,
    },
    MeanFinalize {
        output: &'a B,
        sum: &'a B,
        count: &'a B,
        shape: Shape,
    },
}

impl<B> KernelArgs<'_, B> {
    /// Whether these arguments belong to the kernel family of `id`.
    pub fn matches(&self, id: &KernelId) -> bool {
        matches!(
            (self, id),
            (KernelArgs::Transform { .. }, KernelId::Transform { .. })
                | (KernelArgs::MaxBlend { .. }, KernelId::MaxBlend(_))
                | (KernelArgs::MeanBlend { .. }, KernelId::MeanBlend(_))
                | (KernelArgs::MeanFinalize { .. }, KernelId::MeanFinalize)
        )
    }
}

/// A device that owns buffers and runs registered kernels on them.
///
/// Buffers are written through shared references; callers serialise access
/// per buffer. Every launch is synchronous and returns once the kernel has
/// completed.
pub trait ComputeDevice: Send + Sync {
    type Buffer: Send + Sync;

    /// Position of this device in its pool.
    fn ordinal(&self) -> usize;

    fn name(&self) -> &str;

    fn upload(&self, data: &HostVolume) -> Result<Self::Buffer>;

    fn zeros(&self, shape: Shape, dtype: ElementType) -> Result<Self::Buffer>;

    fn download(&self, buffer: &Self::Buffer, shape: Shape, dtype: ElementType)
    -> Result<HostVolume>;

    fn launch(
        &self,
        kernel: &KernelHandle,
        launch: &LaunchParameters,
        args: KernelArgs<'_, Self::Buffer>,
    ) -> Result<()>;
}
