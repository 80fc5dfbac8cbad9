use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::executor::block_on;
use ndarray::Array3;
use tracing::{debug, info};
use wgpu::{PollType, util::DeviceExt};

use crate::device::{ComputeDevice, KernelArgs};
use crate::enums::ElementType;
use crate::error::{ResampleError, Result};
use crate::kernels::{KernelHandle, KernelId, LaunchParameters};
use crate::volume::{HostVolume, Shape, voxel_count};

/// Device and queue handed over by a caller that already owns a wgpu setup.
pub struct WgpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

/// A wgpu adapter running the WGSL kernels.
///
/// Every sample occupies one 32-bit word on the device: uint16 data is widened
/// on upload and narrowed on download.
pub struct GpuDevice {
    ordinal: usize,
    name: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipelines: Mutex<HashMap<(KernelId, Shape), Arc<wgpu::ComputePipeline>>>,
    // bound when a transform runs without a coverage mask
    placeholder: wgpu::Buffer,
}

pub struct GpuBuffer {
    buffer: wgpu::Buffer,
    len: usize,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct TransformParams {
    rows: [[f32; 4]; 4],
    out_shape: [u32; 4],
    in_shape: [u32; 4],
    flags: [u32; 4],
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct BlendParams {
    shape: [u32; 4],
}

const WORD: u64 = std::mem::size_of::<u32>() as u64;

/// (Z, Y, X) shape as the (x, y, z, 0) vector the shaders index with.
fn shape_words(shape: Shape) -> Result<[u32; 4]> {
    if u32::try_from(voxel_count(shape)).is_err() {
        return Err(ResampleError::invalid_input(format!(
            "shape {shape:?} exceeds 32-bit device indexing"
        )));
    }
    Ok([shape.2 as u32, shape.1 as u32, shape.0 as u32, 0])
}

/// The parts of an `AdapterInfo` that identify a physical GPU and its driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct AdapterKey {
    vendor: u32,
    device: u32,
    device_type: wgpu::DeviceType,
    backend: wgpu::Backend,
}

impl From<&wgpu::AdapterInfo> for AdapterKey {
    fn from(info: &wgpu::AdapterInfo) -> Self {
        Self {
            vendor: info.vendor,
            device: info.device,
            device_type: info.device_type,
            backend: info.backend,
        }
    }
}

fn backend_rank(backend: wgpu::Backend) -> u8 {
    match backend {
        wgpu::Backend::Vulkan => 0,
        wgpu::Backend::Metal => 1,
        wgpu::Backend::Dx12 => 2,
        wgpu::Backend::Gl => 3,
        _ => 4,
    }
}

/// Positions of the adapters to open, one per physical GPU.
///
/// Every backend reports the same hardware again, so each (vendor, device)
/// pair keeps only the adapters of its best backend. Software rasterisers are
/// skipped, and GL adapters only count when no other backend sees a GPU.
fn physical_adapters(keys: &[AdapterKey]) -> Vec<usize> {
    let hardware: Vec<usize> = (0..keys.len())
        .filter(|&i| keys[i].device_type != wgpu::DeviceType::Cpu)
        .collect();
    let native = hardware.iter().any(|&i| keys[i].backend != wgpu::Backend::Gl);
    let candidates: Vec<usize> = hardware
        .into_iter()
        .filter(|&i| !(native && keys[i].backend == wgpu::Backend::Gl))
        .collect();

    candidates
        .iter()
        .copied()
        .filter(|&i| {
            let key = keys[i];
            let best = candidates
                .iter()
                .filter(|&&j| (keys[j].vendor, keys[j].device) == (key.vendor, key.device))
                .map(|&j| backend_rank(keys[j].backend))
                .min();
            best == Some(backend_rank(key.backend))
        })
        .collect()
}

/// Reject buffers the device could not allocate or bind as storage.
fn check_buffer_size(len: usize, limits: &wgpu::Limits) -> Result<u64> {
    let bytes = len as u64 * WORD;
    let max = limits
        .max_buffer_size
        .min(u64::from(limits.max_storage_buffer_binding_size));
    if bytes > max {
        return Err(ResampleError::device(format!(
            "buffer of {bytes} bytes exceeds the device limit of {max} bytes"
        )));
    }
    Ok(bytes)
}

impl GpuDevice {
    pub fn new(ordinal: usize, name: impl Into<String>, wgpu: WgpuContext) -> Self {
        let WgpuContext { device, queue } = wgpu;
        let placeholder = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Coverage Placeholder"),
            size: WORD,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        Self {
            ordinal,
            name: name.into(),
            device,
            queue,
            pipelines: Mutex::new(HashMap::new()),
            placeholder,
        }
    }

    /// One adapter per physical GPU, in enumeration order.
    fn adapters() -> Vec<wgpu::Adapter> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapters = instance.enumerate_adapters(wgpu::Backends::all());
        let keys: Vec<AdapterKey> = adapters
            .iter()
            .map(|adapter| AdapterKey::from(&adapter.get_info()))
            .collect();
        let keep = physical_adapters(&keys);
        adapters
            .into_iter()
            .enumerate()
            .filter_map(|(i, adapter)| {
                if keep.contains(&i) {
                    Some(adapter)
                } else {
                    let info = adapter.get_info();
                    debug!(adapter = %info.name, backend = ?info.backend, "skipping adapter");
                    None
                }
            })
            .collect()
    }

    /// Run buffer creation inside validation and out-of-memory error scopes.
    fn scoped_buffer(&self, create: impl FnOnce() -> wgpu::Buffer) -> Result<wgpu::Buffer> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let buffer = create();
        let validation = block_on(self.device.pop_error_scope());
        let out_of_memory = block_on(self.device.pop_error_scope());
        match validation.or(out_of_memory) {
            Some(err) => Err(ResampleError::device(format!("{}: {err}", self.name))),
            None => Ok(buffer),
        }
    }

    async fn open(ordinal: usize, adapter: wgpu::Adapter) -> Result<Self> {
        let info = adapter.get_info();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Affine Fusion Device"),
                required_limits: adapter.limits(),
                ..Default::default()
            })
            .await
            .map_err(|err| ResampleError::device(format!("{}: {err}", info.name)))?;
        info!(ordinal, adapter = %info.name, backend = ?info.backend, "opened gpu device");
        Ok(Self::new(ordinal, info.name, WgpuContext { device, queue }))
    }

    /// Open the adapter at position `ordinal`.
    pub async fn request(ordinal: usize) -> Result<Self> {
        let adapter = Self::adapters()
            .into_iter()
            .nth(ordinal)
            .ok_or_else(|| ResampleError::device(format!("no adapter with ordinal {ordinal}")))?;
        Self::open(ordinal, adapter).await
    }

    /// Open one adapter per physical GPU, in enumeration order.
    pub async fn request_all() -> Result<Vec<Self>> {
        let mut devices = Vec::new();
        for (ordinal, adapter) in Self::adapters().into_iter().enumerate() {
            devices.push(Self::open(ordinal, adapter).await?);
        }
        Ok(devices)
    }

    fn pipeline_for(
        &self,
        kernel: &KernelHandle,
        block: Shape,
    ) -> Result<Arc<wgpu::ComputePipeline>> {
        let mut pipelines = self.pipelines.lock().map_err(ResampleError::poisoned)?;
        if let Some(pipeline) = pipelines.get(&(kernel.id, block)) {
            return Ok(pipeline.clone());
        }

        let shader = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(kernel.name.as_str()),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(kernel.source.as_str())),
            });
        let constants = [
            ("BLOCK_X", block.2 as f64),
            ("BLOCK_Y", block.1 as f64),
            ("BLOCK_Z", block.0 as f64),
        ];
        let pipeline = Arc::new(self.device.create_compute_pipeline(
            &wgpu::ComputePipelineDescriptor {
                label: Some(kernel.name.as_str()),
                layout: None,
                module: &shader,
                entry_point: Some("main"),
                compilation_options: wgpu::PipelineCompilationOptions {
                    constants: &constants,
                    ..Default::default()
                },
                cache: None,
            },
        ));
        debug!(device = %self.name, kernel = %kernel.name, ?block, "compiled pipeline");
        pipelines.insert((kernel.id, block), pipeline.clone());
        Ok(pipeline)
    }

    fn check_launch(&self, launch: &LaunchParameters) -> Result<()> {
        let limits = self.device.limits();
        let (bz, by, bx) = launch.block;
        let (gz, gy, gx) = launch.grid;
        let fits = bx as u32 <= limits.max_compute_workgroup_size_x
            && by as u32 <= limits.max_compute_workgroup_size_y
            && bz as u32 <= limits.max_compute_workgroup_size_z
            && (bx * by * bz) as u32 <= limits.max_compute_invocations_per_workgroup
            && [gx, gy, gz]
                .iter()
                .all(|&g| g as u32 <= limits.max_compute_workgroups_per_dimension);
        if !fits {
            return Err(ResampleError::invalid_input(format!(
                "launch grid {:?} x block {:?} exceeds device limits",
                launch.grid, launch.block
            )));
        }
        Ok(())
    }

    fn expect_len(buffer: &GpuBuffer, shape: Shape) -> Result<()> {
        if buffer.len != voxel_count(shape) {
            return Err(ResampleError::invalid_input(format!(
                "buffer holds {} samples, shape {shape:?} needs {}",
                buffer.len,
                voxel_count(shape)
            )));
        }
        Ok(())
    }

    fn read_back(&self, buffer: &wgpu::Buffer, size: u64) -> Result<Vec<u32>> {
        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging_buffer, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|err| ResampleError::device(err.to_string()))?;
        block_on(receiver)
            .map_err(|_| ResampleError::device("readback callback dropped"))?
            .map_err(|err| ResampleError::device(err.to_string()))?;

        let data = buffer_slice.get_mapped_range();
        let words: Vec<u32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging_buffer.unmap();
        Ok(words)
    }
}

impl ComputeDevice for GpuDevice {
    type Buffer = GpuBuffer;

    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn upload(&self, data: &HostVolume) -> Result<GpuBuffer> {
        check_buffer_size(voxel_count(data.shape()), &self.device.limits())?;
        let words: Vec<u32> = match data {
            HostVolume::U16(a) => a.iter().map(|&v| u32::from(v)).collect(),
            HostVolume::F32(a) => a.iter().map(|v| v.to_bits()).collect(),
        };
        let buffer = self.scoped_buffer(|| {
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("Volume Buffer"),
                    contents: bytemuck::cast_slice(&words),
                    usage: wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_SRC
                        | wgpu::BufferUsages::COPY_DST,
                })
        })?;
        Ok(GpuBuffer {
            buffer,
            len: words.len(),
        })
    }

    fn zeros(&self, shape: Shape, _dtype: ElementType) -> Result<GpuBuffer> {
        shape_words(shape)?;
        let len = voxel_count(shape);
        let size = check_buffer_size(len, &self.device.limits())?;
        // wgpu zero-initialises new buffers
        let buffer = self.scoped_buffer(|| {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Volume Buffer"),
                size,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })?;
        Ok(GpuBuffer { buffer, len })
    }

    fn download(&self, buffer: &GpuBuffer, shape: Shape, dtype: ElementType) -> Result<HostVolume> {
        Self::expect_len(buffer, shape)?;
        let words = self.read_back(&buffer.buffer, buffer.len as u64 * WORD)?;
        let volume = match dtype {
            ElementType::U16 => HostVolume::U16(Array3::from_shape_vec(
                shape,
                words.iter().map(|&w| w as u16).collect(),
            )
            .map_err(|err| ResampleError::invalid_input(err.to_string()))?),
            ElementType::F32 => HostVolume::F32(Array3::from_shape_vec(
                shape,
                words.iter().map(|&w| f32::from_bits(w)).collect(),
            )
            .map_err(|err| ResampleError::invalid_input(err.to_string()))?),
        };
        Ok(volume)
    }

    fn launch(
        &self,
        kernel: &KernelHandle,
        launch: &LaunchParameters,
        args: KernelArgs<'_, GpuBuffer>,
    ) -> Result<()> {
        if !args.matches(&kernel.id) {
            return Err(ResampleError::invalid_input(format!(
                "arguments do not match kernel {}",
                kernel.name
            )));
        }
        self.check_launch(launch)?;

        let (storage, params): (Vec<&wgpu::Buffer>, Vec<u8>) = match args {
            KernelArgs::Transform {
                output,
                input,
                coverage,
                matrix,
                out_shape,
                in_shape,
            } => {
                Self::expect_len(output, out_shape)?;
                Self::expect_len(input, in_shape)?;
                let mut rows = [[0.0f32; 4]; 4];
                for (r, row) in rows.iter_mut().enumerate() {
                    row.copy_from_slice(&matrix[r * 4..r * 4 + 4]);
                }
                let mask = match coverage {
                    Some(mask) => {
                        Self::expect_len(mask, out_shape)?;
                        &mask.buffer
                    }
                    None => &self.placeholder,
                };
                let params = TransformParams {
                    rows,
                    out_shape: shape_words(out_shape)?,
                    in_shape: shape_words(in_shape)?,
                    flags: [u32::from(coverage.is_some()), 0, 0, 0],
                };
                (
                    vec![&output.buffer, &input.buffer, mask],
                    bytemuck::bytes_of(&params).to_vec(),
                )
            }
            KernelArgs::MaxBlend {
                existing,
                new_view,
                shape,
            } => {
                for b in [existing, new_view] {
                    Self::expect_len(b, shape)?;
                }
                let params = BlendParams {
                    shape: shape_words(shape)?,
                };
                (
                    vec![&existing.buffer, &new_view.buffer],
                    bytemuck::bytes_of(&params).to_vec(),
                )
            }
            KernelArgs::MeanBlend {
                sum,
                count,
                new_view,
                coverage,
                shape,
            } => {
                for b in [sum, count, new_view, coverage] {
                    Self::expect_len(b, shape)?;
                }
                let params = BlendParams {
                    shape: shape_words(shape)?,
                };
                (
                    vec![&sum.buffer, &count.buffer, &new_view.buffer, &coverage.buffer],
                    bytemuck::bytes_of(&params).to_vec(),
                )
            }
            KernelArgs::MeanFinalize {
                output,
                sum,
                count,
                shape,
            } => {
                for b in [output, sum, count] {
                    Self::expect_len(b, shape)?;
                }
                let params = BlendParams {
                    shape: shape_words(shape)?,
                };
                (
                    vec![&output.buffer, &sum.buffer, &count.buffer],
                    bytemuck::bytes_of(&params).to_vec(),
                )
            }
        };

        let pipeline = self.pipeline_for(kernel, launch.block)?;
        let uniform_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Uniform Buffer"),
                contents: &params,
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let mut entries: Vec<wgpu::BindGroupEntry> = storage
            .iter()
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: storage.len() as u32,
            resource: uniform_buffer.as_entire_binding(),
        });

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.name.as_str()),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(kernel.name.as_str()),
            });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.name.as_str()),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(&pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            let (gz, gy, gx) = launch.grid;
            compute_pass.dispatch_workgroups(gx as u32, gy as u32, gz as u32);
        }
        self.queue.submit(Some(encoder.finish()));
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            return Err(ResampleError::device(format!("{}: {err}", kernel.name)));
        }
        self.device
            .poll(PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|err| ResampleError::device(err.to_string()))?;
        debug!(device = %self.name, kernel = %kernel.name, grid = ?launch.grid, "launch");
        Ok(())
    }
}
