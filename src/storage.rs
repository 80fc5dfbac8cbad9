//! Persisted chunked arrays the coordinator reads from and writes into.
//!
//! The storage layout is independent of the processing chunks: any window
//! inside the array can be read or written.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use bytemuck::{Pod, Zeroable};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunks::ChunkWindow;
use crate::enums::ElementType;
use crate::error::{ResampleError, Result};
use crate::volume::{HostVolume, Shape, voxel_count};

/// A typed 3-D array supporting random-access region IO.
///
/// Concurrent writers must target disjoint windows.
pub trait ChunkedArray: Send + Sync {
    fn shape(&self) -> Shape;

    fn element_type(&self) -> ElementType;

    /// Value of samples that were never written.
    fn fill_value(&self) -> f64;

    fn read_region(&self, window: &ChunkWindow) -> Result<HostVolume>;

    fn write_region(&self, window: &ChunkWindow, data: &HostVolume) -> Result<()>;

    /// Record whether every region of the array holds final data.
    fn set_complete(&self, complete: bool) -> Result<()>;

    fn is_complete(&self) -> bool;
}

fn check_window(shape: Shape, window: &ChunkWindow) -> Result<()> {
    if window.z.end > shape.0 || window.y.end > shape.1 || window.x.end > shape.2 {
        return Err(ResampleError::invalid_input(format!(
            "window {window:?} exceeds array shape {shape:?}"
        )));
    }
    Ok(())
}

fn check_write(
    shape: Shape,
    dtype: ElementType,
    window: &ChunkWindow,
    data: &HostVolume,
) -> Result<()> {
    check_window(shape, window)?;
    if data.shape() != window.shape() {
        return Err(ResampleError::ShapeMismatch {
            expected: window.shape(),
            actual: data.shape(),
        });
    }
    if data.element_type() != dtype {
        return Err(ResampleError::invalid_input(format!(
            "cannot write {} samples into a {dtype} array",
            data.element_type()
        )));
    }
    Ok(())
}

/// An array held entirely in host memory.
pub struct InMemoryArray {
    data: RwLock<HostVolume>,
    fill_value: f64,
    complete: AtomicBool,
}

impl InMemoryArray {
    pub fn new(shape: Shape, dtype: ElementType, fill_value: f64) -> Self {
        Self {
            data: RwLock::new(HostVolume::filled(shape, dtype, fill_value)),
            fill_value,
            complete: AtomicBool::new(false),
        }
    }

    /// Wrap existing samples; the array counts as complete.
    pub fn from_volume(data: HostVolume) -> Self {
        Self {
            data: RwLock::new(data),
            fill_value: 0.0,
            complete: AtomicBool::new(true),
        }
    }

    /// Copy of the whole array.
    pub fn snapshot(&self) -> Result<HostVolume> {
        Ok(self.data.read().map_err(ResampleError::poisoned)?.clone())
    }
}

impl ChunkedArray for InMemoryArray {
    fn shape(&self) -> Shape {
        self.data
            .read()
            .map(|d| d.shape())
            .unwrap_or_else(|poisoned| poisoned.into_inner().shape())
    }

    fn element_type(&self) -> ElementType {
        self.data
            .read()
            .map(|d| d.element_type())
            .unwrap_or_else(|poisoned| poisoned.into_inner().element_type())
    }

    fn fill_value(&self) -> f64 {
        self.fill_value
    }

    fn read_region(&self, window: &ChunkWindow) -> Result<HostVolume> {
        self.data
            .read()
            .map_err(ResampleError::poisoned)?
            .region(window)
    }

    fn write_region(&self, window: &ChunkWindow, data: &HostVolume) -> Result<()> {
        self.data
            .write()
            .map_err(ResampleError::poisoned)?
            .assign_region(window, data)
    }

    fn set_complete(&self, complete: bool) -> Result<()> {
        self.complete.store(complete, Ordering::SeqCst);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }
}

const METADATA_FILE: &str = "array.json";
const DATA_FILE: &str = "data.raw";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct ArrayMetadata {
    shape: [usize; 3],
    dtype: ElementType,
    fill_value: f64,
    byte_order: String,
    complete: bool,
}

fn native_byte_order() -> &'static str {
    if cfg!(target_endian = "little") {
        "little"
    } else {
        "big"
    }
}

/// A directory holding `array.json` and the C-ordered samples in `data.raw`,
/// stored in native byte order.
pub struct RawFileArray {
    root: PathBuf,
    metadata: ArrayMetadata,
    file: Mutex<File>,
    complete: AtomicBool,
}

impl RawFileArray {
    /// Create (or truncate) an array at `root` with every sample set to
    /// `fill_value`.
    pub fn create(root: &Path, shape: Shape, dtype: ElementType, fill_value: f64) -> Result<Self> {
        fs::create_dir_all(root)?;
        let metadata = ArrayMetadata {
            shape: [shape.0, shape.1, shape.2],
            dtype,
            fill_value,
            byte_order: native_byte_order().to_string(),
            complete: false,
        };
        write_metadata(root, &metadata)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(root.join(DATA_FILE))?;
        let bytes = (voxel_count(shape) * dtype.size_of()) as u64;
        if fill_value == 0.0 {
            file.set_len(bytes)?;
        } else {
            // one z-plane at a time
            let plane = HostVolume::filled((1, shape.1, shape.2), dtype, fill_value);
            for _ in 0..shape.0 {
                match &plane {
                    HostVolume::U16(a) => write_samples(&mut file, a)?,
                    HostVolume::F32(a) => write_samples(&mut file, a)?,
                }
            }
        }
        debug!(path = %root.display(), ?shape, %dtype, "created array");

        Ok(Self {
            root: root.to_path_buf(),
            metadata,
            file: Mutex::new(file),
            complete: AtomicBool::new(false),
        })
    }

    /// Open an existing array for reading and writing.
    pub fn open(root: &Path) -> Result<Self> {
        let metadata: ArrayMetadata =
            serde_json::from_reader(File::open(root.join(METADATA_FILE))?)?;
        if metadata.byte_order != native_byte_order() {
            return Err(ResampleError::invalid_input(format!(
                "array at {} is {}-endian",
                root.display(),
                metadata.byte_order
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(root.join(DATA_FILE))?;
        let [z, y, x] = metadata.shape;
        let expected = (voxel_count((z, y, x)) * metadata.dtype.size_of()) as u64;
        let actual = file.metadata()?.len();
        if actual != expected {
            return Err(ResampleError::invalid_input(format!(
                "{} holds {actual} bytes, shape {:?} needs {expected}",
                DATA_FILE, metadata.shape
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
            complete: AtomicBool::new(metadata.complete),
            metadata,
            file: Mutex::new(file),
        })
    }

    /// Store `data` as a new, complete array at `root`.
    pub fn from_volume(root: &Path, data: &HostVolume) -> Result<Self> {
        let array = Self::create(root, data.shape(), data.element_type(), 0.0)?;
        let (z, y, x) = data.shape();
        array.write_region(&ChunkWindow::new(0..z, 0..y, 0..x), data)?;
        array.set_complete(true)?;
        Ok(array)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Byte offset of the first sample of row `(z, y)` starting at `x`.
    fn offset(&self, z: usize, y: usize, x: usize) -> u64 {
        let [_, height, width] = self.metadata.shape;
        (((z * height + y) * width + x) * self.metadata.dtype.size_of()) as u64
    }

    fn read_rows<T: Pod + Zeroable>(&self, window: &ChunkWindow) -> Result<Array3<T>> {
        let mut data = vec![T::zeroed(); window.voxels()];
        if !window.is_empty() {
            let mut file = self.file.lock().map_err(ResampleError::poisoned)?;
            let mut rows = data.chunks_mut(window.x.len());
            for z in window.z.clone() {
                for y in window.y.clone() {
                    let Some(row) = rows.next() else {
                        break;
                    };
                    file.seek(SeekFrom::Start(self.offset(z, y, window.x.start)))?;
                    file.read_exact(bytemuck::cast_slice_mut(row))?;
                }
            }
        }
        Array3::from_shape_vec(window.shape(), data)
            .map_err(|e| ResampleError::invalid_input(e.to_string()))
    }

    fn write_rows<T: Pod>(&self, window: &ChunkWindow, data: &Array3<T>) -> Result<()> {
        if window.is_empty() {
            return Ok(());
        }
        let data = data.as_standard_layout();
        let Some(samples) = data.as_slice() else {
            return Err(ResampleError::invalid_input("region is not contiguous"));
        };
        let mut file = self.file.lock().map_err(ResampleError::poisoned)?;
        let mut rows = samples.chunks(window.x.len());
        for z in window.z.clone() {
            for y in window.y.clone() {
                let Some(row) = rows.next() else {
                    break;
                };
                file.seek(SeekFrom::Start(self.offset(z, y, window.x.start)))?;
                file.write_all(bytemuck::cast_slice(row))?;
            }
        }
        Ok(())
    }
}

fn write_metadata(root: &Path, metadata: &ArrayMetadata) -> Result<()> {
    let file = File::create(root.join(METADATA_FILE))?;
    serde_json::to_writer_pretty(file, metadata)?;
    Ok(())
}

fn write_samples<T: Pod>(file: &mut File, data: &Array3<T>) -> Result<()> {
    let data = data.as_standard_layout();
    let Some(samples) = data.as_slice() else {
        return Err(ResampleError::invalid_input("region is not contiguous"));
    };
    file.write_all(bytemuck::cast_slice(samples))?;
    Ok(())
}

impl ChunkedArray for RawFileArray {
    fn shape(&self) -> Shape {
        let [z, y, x] = self.metadata.shape;
        (z, y, x)
    }

    fn element_type(&self) -> ElementType {
        self.metadata.dtype
    }

    fn fill_value(&self) -> f64 {
        self.metadata.fill_value
    }

    fn read_region(&self, window: &ChunkWindow) -> Result<HostVolume> {
        check_window(self.shape(), window)?;
        Ok(match self.metadata.dtype {
            ElementType::U16 => HostVolume::U16(self.read_rows(window)?),
            ElementType::F32 => HostVolume::F32(self.read_rows(window)?),
        })
    }

    fn write_region(&self, window: &ChunkWindow, data: &HostVolume) -> Result<()> {
        check_write(self.shape(), self.metadata.dtype, window, data)?;
        match data {
            HostVolume::U16(a) => self.write_rows(window, a),
            HostVolume::F32(a) => self.write_rows(window, a),
        }
    }

    fn set_complete(&self, complete: bool) -> Result<()> {
        // hold the data lock so the flag is never written while a region is
        // still being flushed
        let file = self.file.lock().map_err(ResampleError::poisoned)?;
        file.sync_data()?;
        let metadata = ArrayMetadata {
            complete,
            ..self.metadata.clone()
        };
        write_metadata(&self.root, &metadata)?;
        self.complete.store(complete, Ordering::SeqCst);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_volume() -> HostVolume {
        HostVolume::from(Array3::from_shape_fn((3, 4, 5), |(z, y, x)| {
            (z * 20 + y * 5 + x) as f32 * 0.5
        }))
    }

    #[test]
    fn raw_array_region_round_trip() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("volume");
        let array = RawFileArray::create(&root, (3, 4, 5), ElementType::F32, 0.0).unwrap();
        assert!(!array.is_complete());

        let window = ChunkWindow::new(1..3, 1..3, 2..5);
        let region = sample_volume().region(&window).unwrap();
        array.write_region(&window, &region).unwrap();
        assert_eq!(array.read_region(&window).unwrap(), region);

        let untouched = array
            .read_region(&ChunkWindow::new(0..1, 0..4, 0..5))
            .unwrap();
        assert!(untouched.as_f32().unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn raw_array_reopens_with_metadata() {
        let dir = tempdir().unwrap();
        let data = sample_volume();
        RawFileArray::from_volume(dir.path(), &data).unwrap();

        let reopened = RawFileArray::open(dir.path()).unwrap();
        assert_eq!(reopened.shape(), (3, 4, 5));
        assert_eq!(reopened.element_type(), ElementType::F32);
        assert!(reopened.is_complete());
        let full = ChunkWindow::full(reopened.shape());
        assert_eq!(reopened.read_region(&full).unwrap(), data);
    }

    #[test]
    fn raw_array_honours_fill_value() {
        let dir = tempdir().unwrap();
        let array = RawFileArray::create(dir.path(), (2, 2, 3), ElementType::U16, 7.0).unwrap();
        let all = array.read_region(&ChunkWindow::full((2, 2, 3))).unwrap();
        assert!(all.as_u16().unwrap().iter().all(|&v| v == 7));
        assert_eq!(array.fill_value(), 7.0);
    }

    #[test]
    fn writes_are_validated() {
        let dir = tempdir().unwrap();
        let array = RawFileArray::create(dir.path(), (2, 2, 2), ElementType::U16, 0.0).unwrap();
        let outside = ChunkWindow::new(0..1, 0..1, 1..3);
        let data = HostVolume::zeros((1, 1, 2), ElementType::U16);
        assert!(matches!(
            array.write_region(&outside, &data),
            Err(ResampleError::InvalidInput(_))
        ));
        let window = ChunkWindow::new(0..1, 0..1, 0..2);
        let floats = HostVolume::zeros((1, 1, 2), ElementType::F32);
        assert!(matches!(
            array.write_region(&window, &floats),
            Err(ResampleError::InvalidInput(_))
        ));
    }

    #[test]
    fn missing_array_is_an_io_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            RawFileArray::open(&dir.path().join("absent")),
            Err(ResampleError::Io(_))
        ));
    }

    #[test]
    fn in_memory_array_tracks_completion() {
        let array = InMemoryArray::new((2, 2, 2), ElementType::F32, 0.0);
        assert!(!array.is_complete());
        let window = ChunkWindow::new(1..2, 0..2, 0..2);
        array
            .write_region(&window, &HostVolume::filled((1, 2, 2), ElementType::F32, 3.0))
            .unwrap();
        array.set_complete(true).unwrap();
        assert!(array.is_complete());
        let snapshot = array.snapshot().unwrap();
        assert_eq!(snapshot.as_f32().unwrap()[[1, 1, 1]], 3.0);
        assert_eq!(snapshot.as_f32().unwrap()[[0, 1, 1]], 0.0);
    }
}
