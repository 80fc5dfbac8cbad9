//! # affine-fusion
//!
//! This crate resamples large 3-D volumes (microscopy stacks and the like)
//! under arbitrary affine transforms on the GPU, and fuses several
//! transformed views of the same physical volume into one output.
//!
//! The pieces, from the bottom up:
//!  - [`transform`]: decomposition of a 4x4 affine matrix into translation,
//!    rotation, zoom and shear, and the bounding shape of a transformed volume
//!  - [`kernels`]: the process-wide registry of WGSL compute kernels and the
//!    selection of a kernel by element type, method and dtype policy
//!  - [`resampler`]: one transform applied to one device-resident volume
//!  - [`blender`]: max and running-mean blending of resampled views
//!  - [`chunks`]: partitioning of an output shape into processing chunks
//!  - [`coordinator`]: chunked, out-of-core execution over several devices
//!
//! Kernels run on any [`ComputeDevice`]: a [`GpuDevice`] backed by wgpu, or
//! the [`CpuDevice`] which executes the same per-voxel semantics with rayon.
//! Volumes are C-ordered with shape (Z, Y, X); matrices keep the X, Y, Z,
//! homogeneous convention everywhere. Samples are uint16 or float32.
//!
//! Voxels that map outside the input are background (zero). Interpolation
//! methods:
//!  - Nearest neighbour (rounding half up)
//!  - Trilinear
//!  - Cubic B-spline
//!
//! # Examples
//!
//! ## Resampling a volume in memory
//!
//! ```no_run
//! # use affine_fusion::{AffineMatrix, CpuDevice, HostVolume, Method, Volume, VolumeResampler};
//! # use affine_fusion::kernels::DEFAULT_BLOCK_SHAPE;
//! # use ndarray::Array3;
//! let device = CpuDevice::new(0);
//! let data = HostVolume::from(Array3::<u16>::zeros((64, 128, 128)));
//! let input = Volume::upload(&device, &data).expect("should have uploaded the volume");
//! let transform = AffineMatrix::scaling(1.0, 1.0, 2.5).expect("zoom should be invertible");
//! let output = VolumeResampler::new(&device)
//!     .resample(&input, &transform, Method::Linear, true, None, DEFAULT_BLOCK_SHAPE)
//!     .expect("should have resampled the volume");
//! assert_eq!(output.shape(), (160, 128, 128));
//! ```
//!
//! ## Chunked transform of a persisted array on every GPU
//!
//! ```no_run
//! # use affine_fusion::{AffineMatrix, ChunkSize, DistributedTransformCoordinator, GpuDevice,
//! #     RawFileArray, TransformJob};
//! # use std::path::Path;
//! # async fn run() {
//! let devices = GpuDevice::request_all().await.expect("should have found an adapter");
//! let coordinator = DistributedTransformCoordinator::new(devices)
//!     .expect("should have accepted the devices");
//! let input = RawFileArray::open(Path::new("stack")).expect("should have opened the input");
//! let job = TransformJob::new(AffineMatrix::rotation_z(0.2), ChunkSize::Uniform(128));
//! let report = coordinator
//!     .run(&input, Path::new("rotated"), &job)
//!     .expect("should have planned the job");
//! assert!(report.is_complete());
//! # }
//! ```

pub mod blender;
pub mod chunks;
pub mod config;
pub mod coordinator;
pub mod cpu_device;
pub mod device;
pub mod enums;
pub mod error;
pub mod gpu_device;
mod interpolator;
pub mod kernels;
pub mod resampler;
pub mod storage;
pub mod telemetry;
pub mod transform;
pub mod volume;

pub use blender::{MaxAccumulator, MeanAccumulator, ViewBlender};
pub use chunks::{ChunkPlanner, ChunkSize, ChunkWindow};
pub use config::{ConfigError, ResampleConfig};
pub use coordinator::{DevicePool, DistributedTransformCoordinator, RunReport, TransformJob};
pub use cpu_device::CpuDevice;
pub use device::{ComputeDevice, KernelArgs};
pub use enums::{BlendMode, ElementType, Method};
pub use error::{ResampleError, Result};
pub use gpu_device::GpuDevice;
pub use kernels::{KernelRegistry, KernelSelector, LaunchParameters};
pub use resampler::{SampledView, VolumeResampler};
pub use storage::{ChunkedArray, InMemoryArray, RawFileArray};
pub use transform::{AffineMatrix, TransformDecomposition, decompose, output_shape, output_shape_inverse};
pub use volume::{HostVolume, Shape, Volume};
