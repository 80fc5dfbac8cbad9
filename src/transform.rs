//! Affine matrix handling: decomposition and bounding-shape computation.
//!
//! Matrices are 4x4 in homogeneous coordinates with rows and columns ordered
//! X, Y, Z, homogeneous. Volume shapes are (Z, Y, X), so every boundary
//! between the two conventions reverses the axis order.

use std::ops::Mul;

use nalgebra::{Matrix3, Matrix4, Rotation3, RowVector4, Vector3, Vector4};

use crate::error::{ResampleError, Result};
use crate::volume::Shape;

/// A linear block is singular when its determinant is below this fraction of
/// the product of its column norms (the largest determinant those columns
/// could have).
const SINGULAR_EPSILON: f64 = 1e-12;

/// Relative slack removed before rounding extents up, so that
/// `10.000000000000002` produced by a rotation does not grow the shape to 11.
const SHAPE_EPSILON: f64 = 1e-9;

/// Largest deviation of the bottom row from `[0, 0, 0, 1]` still accepted.
const AFFINE_ROW_TOLERANCE: f64 = 1e-9;

/// A 4x4 homogeneous affine transform whose linear block is invertible.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineMatrix(Matrix4<f64>);

impl AffineMatrix {
    /// Wrap a matrix, rejecting a projective bottom row or a singular linear
    /// block.
    pub fn new(mut matrix: Matrix4<f64>) -> Result<Self> {
        let bottom = matrix.fixed_view::<1, 4>(3, 0);
        let deviation = (bottom - RowVector4::new(0.0, 0.0, 0.0, 1.0)).abs().max();
        if !(deviation <= AFFINE_ROW_TOLERANCE) {
            return Err(ResampleError::invalid_input(format!(
                "bottom row {bottom} is not [0, 0, 0, 1]"
            )));
        }
        matrix
            .fixed_view_mut::<1, 4>(3, 0)
            .copy_from(&RowVector4::new(0.0, 0.0, 0.0, 1.0));

        let linear = matrix.fixed_view::<3, 3>(0, 0);
        let det = linear.determinant();
        let bound: f64 = linear.column_iter().map(|c| c.norm()).product();
        if !det.is_finite() || det.abs() <= SINGULAR_EPSILON * bound {
            return Err(ResampleError::SingularTransform(format!(
                "linear block has determinant {det:e}"
            )));
        }
        Ok(Self(matrix))
    }

    /// Build from row-major rows.
    pub fn from_rows(rows: [[f64; 4]; 4]) -> Result<Self> {
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        Self::new(Matrix4::from_row_slice(&flat))
    }

    pub fn identity() -> Self {
        Self(Matrix4::identity())
    }

    pub fn translation(x: f64, y: f64, z: f64) -> Self {
        Self(Matrix4::new_translation(&Vector3::new(x, y, z)))
    }

    pub fn scaling(x: f64, y: f64, z: f64) -> Result<Self> {
        Self::new(Matrix4::new_nonuniform_scaling(&Vector3::new(x, y, z)))
    }

    /// Rotation by `angle` radians about the Z axis.
    pub fn rotation_z(angle: f64) -> Self {
        Self(Rotation3::from_axis_angle(&Vector3::z_axis(), angle).to_homogeneous())
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.0
    }

    /// The 3x3 linear block (`RZS`).
    pub fn linear(&self) -> Matrix3<f64> {
        self.0.fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// Spatial entries of the last column.
    pub fn translation_part(&self) -> Vector3<f64> {
        self.0.fixed_view::<3, 1>(0, 3).into_owned()
    }

    /// `[L⁻¹ | -L⁻¹·t]`, built from the linear block alone.
    pub fn inverse(&self) -> Result<Self> {
        let linear = self.linear().try_inverse().ok_or_else(|| {
            ResampleError::SingularTransform("transform is not invertible".to_string())
        })?;
        let mut matrix = linear.to_homogeneous();
        matrix
            .fixed_view_mut::<3, 1>(0, 3)
            .copy_from(&(-(linear * self.translation_part())));
        Self::new(matrix)
    }

    /// Apply the linear and translation parts to a point given in XYZ order.
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        let h = self.0 * Vector4::new(point.x, point.y, point.z, 1.0);
        Vector3::new(h.x, h.y, h.z)
    }

    /// Row-major single precision copy, the form handed to device kernels.
    pub fn to_f32_rows(&self) -> [f32; 16] {
        let mut rows = [0.0f32; 16];
        for r in 0..4 {
            for c in 0..4 {
                rows[r * 4 + c] = self.0[(r, c)] as f32;
            }
        }
        rows
    }
}

impl Mul for AffineMatrix {
    type Output = AffineMatrix;

    /// `a * b` applies `b` first, then `a`.
    fn mul(self, rhs: AffineMatrix) -> AffineMatrix {
        AffineMatrix(self.0 * rhs.0)
    }
}

/// Translation, rotation, zoom and shear components of an affine transform.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransformDecomposition {
    pub translation: Vector3<f64>,
    /// Proper rotation, determinant +1.
    pub rotation: Matrix3<f64>,
    /// Per-axis scale factors. The first one carries the sign when the linear
    /// block contains a reflection.
    pub zoom: Vector3<f64>,
    /// Upper off-diagonal shear terms (xy, xz, yz).
    pub shear: [f64; 3],
}

impl TransformDecomposition {
    /// Rebuild the affine matrix as `T * R * diag(Z) * S`.
    pub fn compose(&self) -> Result<AffineMatrix> {
        let linear = self.rotation * Matrix3::from_diagonal(&self.zoom) * shear_matrix(&self.shear);
        let mut matrix = linear.to_homogeneous();
        matrix
            .fixed_view_mut::<3, 1>(0, 3)
            .copy_from(&self.translation);
        AffineMatrix::new(matrix)
    }
}

/// Unit upper-triangular matrix holding the shear terms.
pub fn shear_matrix(shear: &[f64; 3]) -> Matrix3<f64> {
    Matrix3::new(
        1.0, shear[0], shear[1], //
        0.0, 1.0, shear[2], //
        0.0, 0.0, 1.0,
    )
}

/// Split an affine transform into translation, rotation, zoom and shear.
///
/// The upper-triangular factor `ZS` comes from the Cholesky factorisation of
/// `RZSᵗ·RZS`, so `RZS = R·ZS`. When that leaves `R` improper, the first zoom
/// component and the first row of `ZS` are negated, which keeps `R` a rotation
/// and moves the reflection into the X scale.
pub fn decompose(transform: &AffineMatrix) -> Result<TransformDecomposition> {
    let translation = transform.translation_part();
    let rzs = transform.linear();

    let gram = rzs.transpose() * rzs;
    let cholesky = gram.cholesky().ok_or_else(|| {
        ResampleError::SingularTransform("linear block is not positive-definite".to_string())
    })?;
    let mut zs = cholesky.l().transpose();
    let mut zoom = zs.diagonal();
    let shear = [
        zs[(0, 1)] / zoom[0],
        zs[(0, 2)] / zoom[0],
        zs[(1, 2)] / zoom[1],
    ];

    let mut rotation = rzs * invert_upper(&zs)?;
    if rotation.determinant() < 0.0 {
        zoom[0] = -zoom[0];
        for col in 0..3 {
            zs[(0, col)] = -zs[(0, col)];
        }
        rotation = rzs * invert_upper(&zs)?;
    }

    Ok(TransformDecomposition {
        translation,
        rotation,
        zoom,
        shear,
    })
}

fn invert_upper(zs: &Matrix3<f64>) -> Result<Matrix3<f64>> {
    zs.try_inverse().ok_or_else(|| {
        ResampleError::SingularTransform("zoom/shear factor is not invertible".to_string())
    })
}

/// Axis-aligned bounds (XYZ) of the box spanned by `lo` and `hi` after
/// mapping all eight corners through `transform`.
pub fn transformed_bounds(
    transform: &AffineMatrix,
    lo: &Vector3<f64>,
    hi: &Vector3<f64>,
) -> (Vector3<f64>, Vector3<f64>) {
    let mut min = Vector3::repeat(f64::INFINITY);
    let mut max = Vector3::repeat(f64::NEG_INFINITY);
    for x in [lo.x, hi.x] {
        for y in [lo.y, hi.y] {
            for z in [lo.z, hi.z] {
                let p = transform.transform_point(&Vector3::new(x, y, z));
                min = min.inf(&p);
                max = max.sup(&p);
            }
        }
    }
    (min, max)
}

/// Shape (Z, Y, X) of the smallest volume containing the transformed input.
pub fn output_shape(transform: &AffineMatrix, input_shape: Shape) -> Shape {
    let (z, y, x) = input_shape;
    let (min, max) = transformed_bounds(
        transform,
        &Vector3::zeros(),
        &Vector3::new(x as f64, y as f64, z as f64),
    );
    let extent = (max - min).map(|v| (v - v.abs() * SHAPE_EPSILON).ceil().max(0.0) as usize);
    (extent.z, extent.y, extent.x)
}

/// Shape of the volume produced by the inverse of `transform`.
pub fn output_shape_inverse(transform: &AffineMatrix, input_shape: Shape) -> Result<Shape> {
    Ok(output_shape(&transform.inverse()?, input_shape))
}
