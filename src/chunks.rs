//! Partitioning of a target shape into processing chunks.

use std::ops::Range;

use serde::Deserialize;

use crate::error::{ResampleError, Result};
use crate::volume::Shape;

/// Half-open index ranges along (Z, Y, X).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChunkWindow {
    pub z: Range<usize>,
    pub y: Range<usize>,
    pub x: Range<usize>,
}

impl ChunkWindow {
    pub fn new(z: Range<usize>, y: Range<usize>, x: Range<usize>) -> Self {
        Self { z, y, x }
    }

    /// The window spanning all of `shape`.
    pub fn full(shape: Shape) -> Self {
        Self::new(0..shape.0, 0..shape.1, 0..shape.2)
    }

    pub fn origin(&self) -> Shape {
        (self.z.start, self.y.start, self.x.start)
    }

    pub fn shape(&self) -> Shape {
        (self.z.len(), self.y.len(), self.x.len())
    }

    pub fn is_empty(&self) -> bool {
        self.z.is_empty() || self.y.is_empty() || self.x.is_empty()
    }

    pub fn voxels(&self) -> usize {
        self.z.len() * self.y.len() * self.x.len()
    }
}

/// Requested chunk extent: the same size on every axis, or one per axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ChunkSize {
    Uniform(usize),
    PerAxis([usize; 3]),
}

impl ChunkSize {
    pub fn shape(&self) -> Shape {
        match *self {
            ChunkSize::Uniform(n) => (n, n, n),
            ChunkSize::PerAxis([z, y, x]) => (z, y, x),
        }
    }
}

impl From<usize> for ChunkSize {
    fn from(n: usize) -> Self {
        ChunkSize::Uniform(n)
    }
}

impl From<Shape> for ChunkSize {
    fn from((z, y, x): Shape) -> Self {
        ChunkSize::PerAxis([z, y, x])
    }
}

/// Padding that brings `dim` up to the smallest multiple of `chunk_dim`
/// that is at least `dim`.
pub fn pad_amount(axis: usize, dim: usize, chunk_dim: usize) -> Result<usize> {
    if chunk_dim == 0 || chunk_dim > dim {
        return Err(ResampleError::InvalidChunkSize {
            axis,
            chunk: chunk_dim,
            dim,
        });
    }
    let mut n = 1;
    while chunk_dim * n < dim {
        n += 1;
    }
    Ok(chunk_dim * n - dim)
}

pub struct ChunkPlanner;

impl ChunkPlanner {
    /// Windows covering `shape` exactly once, in Z-major order.
    ///
    /// Each window is `chunk` wide except the last one along an axis, which
    /// is cut at the shape's edge.
    pub fn plan(shape: Shape, chunk: impl Into<ChunkSize>) -> Result<Vec<ChunkWindow>> {
        let dims = [shape.0, shape.1, shape.2];
        let (cz, cy, cx) = chunk.into().shape();
        let chunk = [cz, cy, cx];

        let mut counts = [0usize; 3];
        for axis in 0..3 {
            let padded = dims[axis] + pad_amount(axis, dims[axis], chunk[axis])?;
            counts[axis] = padded / chunk[axis];
        }

        let span = |axis: usize, i: usize| {
            let start = i * chunk[axis];
            start..(start + chunk[axis]).min(dims[axis])
        };

        let mut windows = Vec::with_capacity(counts.iter().product());
        for iz in 0..counts[0] {
            for iy in 0..counts[1] {
                for ix in 0..counts[2] {
                    windows.push(ChunkWindow::new(span(0, iz), span(1, iy), span(2, ix)));
                }
            }
        }
        Ok(windows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_to_the_smallest_multiple() {
        assert_eq!(pad_amount(0, 10, 4).unwrap(), 2);
        assert_eq!(pad_amount(0, 8, 4).unwrap(), 0);
        assert_eq!(pad_amount(0, 5, 5).unwrap(), 0);
    }

    #[test]
    fn ten_cubed_in_chunks_of_four() {
        let windows = ChunkPlanner::plan((10, 10, 10), ChunkSize::Uniform(4)).unwrap();
        assert_eq!(windows.len(), 27);
        assert_eq!(windows[0], ChunkWindow::new(0..4, 0..4, 0..4));
        assert_eq!(windows[26], ChunkWindow::new(8..10, 8..10, 8..10));
        assert!(windows.iter().all(|w| {
            let (z, y, x) = w.shape();
            z <= 4 && y <= 4 && x <= 4
        }));
        assert_eq!(windows.iter().map(ChunkWindow::voxels).sum::<usize>(), 1000);

        let mut hits = vec![0u8; 1000];
        for w in &windows {
            for z in w.z.clone() {
                for y in w.y.clone() {
                    for x in w.x.clone() {
                        hits[(z * 10 + y) * 10 + x] += 1;
                    }
                }
            }
        }
        assert!(hits.iter().all(|&h| h == 1));
    }

    #[test]
    fn per_axis_chunks() {
        let windows = ChunkPlanner::plan((3, 7, 9), ChunkSize::PerAxis([3, 5, 9])).unwrap();
        assert_eq!(
            windows,
            vec![
                ChunkWindow::new(0..3, 0..5, 0..9),
                ChunkWindow::new(0..3, 5..7, 0..9),
            ]
        );
    }

    #[test]
    fn chunk_larger_than_shape_fails() {
        let err = ChunkPlanner::plan((10, 3, 10), ChunkSize::Uniform(4)).unwrap_err();
        assert!(matches!(
            err,
            ResampleError::InvalidChunkSize {
                axis: 1,
                chunk: 4,
                dim: 3
            }
        ));
        assert!(ChunkPlanner::plan((4, 4, 4), ChunkSize::Uniform(0)).is_err());
    }
}
