use affine_fusion::{AffineMatrix, decompose, output_shape, output_shape_inverse};
use nalgebra::{Matrix3, Matrix4, Vector3};
use proptest::prelude::*;

fn affine(linear: [[f64; 3]; 3], translation: [f64; 3]) -> Matrix4<f64> {
    let mut m = Matrix4::identity();
    for r in 0..3 {
        for c in 0..3 {
            m[(r, c)] = linear[r][c];
        }
        m[(r, 3)] = translation[r];
    }
    m
}

fn rotation(ax: f64, ay: f64, az: f64) -> Matrix3<f64> {
    let (sx, cx) = ax.sin_cos();
    let (sy, cy) = ay.sin_cos();
    let (sz, cz) = az.sin_cos();
    let rx = Matrix3::new(1.0, 0.0, 0.0, 0.0, cx, -sx, 0.0, sx, cx);
    let ry = Matrix3::new(cy, 0.0, sy, 0.0, 1.0, 0.0, -sy, 0.0, cy);
    let rz = Matrix3::new(cz, -sz, 0.0, sz, cz, 0.0, 0.0, 0.0, 1.0);
    rx * ry * rz
}

proptest! {
    #[test]
    fn decomposition_reconstructs_the_linear_block(
        linear in prop::array::uniform3(prop::array::uniform3(-3.0f64..3.0)),
        translation in prop::array::uniform3(-100.0f64..100.0),
    ) {
        let m = affine(linear, translation);
        prop_assume!(m.fixed_view::<3, 3>(0, 0).determinant().abs() > 0.1);
        let transform = AffineMatrix::new(m).unwrap();

        let parts = decompose(&transform).unwrap();
        prop_assert!((parts.rotation.determinant() - 1.0).abs() < 1e-6);
        let rebuilt = parts.compose().unwrap();
        let error = (rebuilt.matrix() - transform.matrix()).abs().max();
        prop_assert!(error < 1e-6, "reconstruction error {}", error);
    }

    #[test]
    fn identity_keeps_the_shape(z in 1usize..200, y in 1usize..200, x in 1usize..200) {
        prop_assert_eq!(output_shape(&AffineMatrix::identity(), (z, y, x)), (z, y, x));
    }

    #[test]
    fn inverse_shape_never_shrinks(
        angles in prop::array::uniform3(-3.1f64..3.1),
        zoom in prop::array::uniform3(0.25f64..4.0),
        translation in prop::array::uniform3(-50.0f64..50.0),
        shape in (1usize..40, 1usize..40, 1usize..40),
    ) {
        let linear = rotation(angles[0], angles[1], angles[2])
            * Matrix3::from_diagonal(&Vector3::from(zoom));
        let rows = [
            [linear[(0, 0)], linear[(0, 1)], linear[(0, 2)]],
            [linear[(1, 0)], linear[(1, 1)], linear[(1, 2)]],
            [linear[(2, 0)], linear[(2, 1)], linear[(2, 2)]],
        ];
        let transform = AffineMatrix::new(affine(rows, translation)).unwrap();

        let forward = output_shape(&transform, shape);
        let back = output_shape_inverse(&transform, forward).unwrap();
        prop_assert!(back.0 >= shape.0 && back.1 >= shape.1 && back.2 >= shape.2,
            "{:?} -> {:?} -> {:?}", shape, forward, back);
    }
}
