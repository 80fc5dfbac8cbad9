use ndarray::ArrayView3;

use crate::enums::Method;

/// Host-side sampling with the same arithmetic as the WGSL kernels, in
/// single precision. Coordinates are (x, y, z); the volume is indexed
/// `[z, y, x]`. `None` means the voxel is background.
pub(crate) struct Interpolator;

impl Interpolator {
    pub(crate) fn sample(method: Method, src: &ArrayView3<f32>, v: [f32; 3]) -> Option<f32> {
        if !v.iter().all(|c| c.is_finite()) {
            return None;
        }
        match method {
            Method::Nearest => Self::nearest(src, v),
            Method::Linear => Self::trilinear(src, v),
            Method::CubicSpline => Self::cubic_bspline(src, v),
        }
    }

    /// Map an output voxel through a row-major 4x4 matrix.
    #[inline]
    pub(crate) fn source_coord(matrix: &[f32; 16], x: usize, y: usize, z: usize) -> [f32; 3] {
        let p = [x as f32, y as f32, z as f32, 1.0];
        let row = |r: usize| {
            matrix[r * 4] * p[0]
                + matrix[r * 4 + 1] * p[1]
                + matrix[r * 4 + 2] * p[2]
                + matrix[r * 4 + 3] * p[3]
        };
        [row(0), row(1), row(2)]
    }

    /// Round half up and clamp into the uint16 range.
    #[inline]
    pub(crate) fn encode_u16(value: f32) -> u16 {
        (value + 0.5).floor().clamp(0.0, u16::MAX as f32) as u16
    }

    #[inline]
    fn in_bounds(src: &ArrayView3<f32>, p: [i64; 3]) -> bool {
        let (depth, height, width) = src.dim();
        p[0] >= 0
            && p[1] >= 0
            && p[2] >= 0
            && p[0] < width as i64
            && p[1] < height as i64
            && p[2] < depth as i64
    }

    #[inline]
    fn fetch(src: &ArrayView3<f32>, p: [i64; 3]) -> f32 {
        src[[p[2] as usize, p[1] as usize, p[0] as usize]]
    }

    #[inline]
    fn lerp(v0: f32, v1: f32, t: f32) -> f32 {
        v0 * (1.0 - t) + v1 * t
    }

    fn nearest(src: &ArrayView3<f32>, v: [f32; 3]) -> Option<f32> {
        let p = v.map(|c| (c + 0.5).floor() as i64);
        Self::in_bounds(src, p).then(|| Self::fetch(src, p))
    }

    fn trilinear(src: &ArrayView3<f32>, v: [f32; 3]) -> Option<f32> {
        let floor = v.map(f32::floor);
        let base = floor.map(|c| c as i64);
        let upper = base.map(|c| c + 1);
        if !Self::in_bounds(src, base) || !Self::in_bounds(src, upper) {
            return None;
        }
        let [dx, dy, dz] = [v[0] - floor[0], v[1] - floor[1], v[2] - floor[2]];
        let at = |ox: i64, oy: i64, oz: i64| Self::fetch(src, [base[0] + ox, base[1] + oy, base[2] + oz]);

        let c00 = Self::lerp(at(0, 0, 0), at(1, 0, 0), dx);
        let c10 = Self::lerp(at(0, 1, 0), at(1, 1, 0), dx);
        let c01 = Self::lerp(at(0, 0, 1), at(1, 0, 1), dx);
        let c11 = Self::lerp(at(0, 1, 1), at(1, 1, 1), dx);
        Some(Self::lerp(
            Self::lerp(c00, c10, dy),
            Self::lerp(c01, c11, dy),
            dz,
        ))
    }

    /// Cubic B-spline basis weights for a fractional offset in `[0, 1)`.
    pub(crate) fn bspline_weights(f: f32) -> [f32; 4] {
        let one_f = 1.0 - f;
        [
            one_f * one_f * one_f / 6.0,
            2.0 / 3.0 - 0.5 * f * f * (2.0 - f),
            2.0 / 3.0 - 0.5 * one_f * one_f * (2.0 - one_f),
            f * f * f / 6.0,
        ]
    }

    fn cubic_bspline(src: &ArrayView3<f32>, v: [f32; 3]) -> Option<f32> {
        let mut g0 = [0.0f32; 3];
        let mut g1 = [0.0f32; 3];
        let mut h0 = [0.0f32; 3];
        let mut h1 = [0.0f32; 3];
        for axis in 0..3 {
            let index = v[axis].floor();
            let [w0, w1, w2, w3] = Self::bspline_weights(v[axis] - index);
            g0[axis] = w0 + w1;
            g1[axis] = w2 + w3;
            h0[axis] = w1 / g0[axis] - 1.0 + index;
            h1[axis] = w3 / g1[axis] + 1.0 + index;
        }

        let mut hit = false;
        let mut fetch = |x: f32, y: f32, z: f32| match Self::trilinear(src, [x, y, z]) {
            Some(value) => {
                hit = true;
                value
            }
            None => 0.0,
        };

        let d000 = g0[0] * fetch(h0[0], h0[1], h0[2]) + g1[0] * fetch(h1[0], h0[1], h0[2]);
        let d010 = g0[0] * fetch(h0[0], h1[1], h0[2]) + g1[0] * fetch(h1[0], h1[1], h0[2]);
        let d00 = g0[1] * d000 + g1[1] * d010;

        let d001 = g0[0] * fetch(h0[0], h0[1], h1[2]) + g1[0] * fetch(h1[0], h0[1], h1[2]);
        let d011 = g0[0] * fetch(h0[0], h1[1], h1[2]) + g1[0] * fetch(h1[0], h1[1], h1[2]);
        let d01 = g0[1] * d001 + g1[1] * d011;

        let value = g0[2] * d00 + g1[2] * d01;
        hit.then_some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn ramp() -> Array3<f32> {
        Array3::from_shape_fn((6, 6, 6), |(z, y, x)| (x + 2 * y + 4 * z) as f32)
    }

    #[test]
    fn bspline_weights_partition_unity() {
        for f in [0.0, 0.25, 0.5, 0.9] {
            let sum: f32 = Interpolator::bspline_weights(f).iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn nearest_rounds_half_up() {
        let data = ramp();
        let view = data.view();
        assert_eq!(Interpolator::sample(Method::Nearest, &view, [1.5, 0.0, 0.0]), Some(2.0));
        assert_eq!(Interpolator::sample(Method::Nearest, &view, [1.49, 0.0, 0.0]), Some(1.0));
        assert_eq!(Interpolator::sample(Method::Nearest, &view, [-0.6, 0.0, 0.0]), None);
    }

    #[test]
    fn trilinear_is_exact_on_a_ramp() {
        let data = ramp();
        let value = Interpolator::sample(Method::Linear, &data.view(), [1.5, 2.25, 3.5]).unwrap();
        assert!((value - (1.5 + 4.5 + 14.0)).abs() < 1e-5);
    }

    #[test]
    fn trilinear_needs_all_neighbours() {
        let data = ramp();
        // the upper neighbour along x is outside
        assert_eq!(Interpolator::sample(Method::Linear, &data.view(), [5.0, 1.0, 1.0]), None);
        assert_eq!(Interpolator::sample(Method::Linear, &data.view(), [f32::NAN, 1.0, 1.0]), None);
    }

    #[test]
    fn cubic_spline_reproduces_constants_in_the_interior() {
        let data = Array3::from_elem((8, 8, 8), 7.0f32);
        let value =
            Interpolator::sample(Method::CubicSpline, &data.view(), [3.3, 4.6, 2.1]).unwrap();
        assert!((value - 7.0).abs() < 1e-4);
    }

    #[test]
    fn cubic_spline_misses_far_outside() {
        let data = Array3::from_elem((4, 4, 4), 1.0f32);
        let v = [-20.0, 1.0, 1.0];
        assert_eq!(Interpolator::sample(Method::CubicSpline, &data.view(), v), None);
    }

    #[test]
    fn encode_clamps_and_rounds() {
        assert_eq!(Interpolator::encode_u16(-3.0), 0);
        assert_eq!(Interpolator::encode_u16(2.5), 3);
        assert_eq!(Interpolator::encode_u16(1e9), u16::MAX);
    }

    #[test]
    fn trilinear_rejects_a_negative_floor() {
        let data = ramp();
        let view = data.view();
        assert_eq!(Interpolator::sample(Method::Linear, &view, [-0.25, 1.0, 1.0]), None);
        assert_eq!(Interpolator::sample(Method::Linear, &view, [1.0, 1.0, -0.5]), None);
        assert_eq!(Interpolator::sample(Method::Linear, &view, [0.0, 1.0, 1.0]), Some(6.0));
    }

    #[test]
    fn cubic_spline_background_is_per_contribution() {
        let data = Array3::from_elem((6, 6, 6), 10.0f32);
        let view = data.view();
        let at = |x: f32| Interpolator::sample(Method::CubicSpline, &view, [x, 2.0, 2.0]).unwrap();
        // only the upper fetch (weight 1/6) lands inside at x=0
        assert!((at(0.0) - 10.0 / 6.0).abs() < 1e-4);
        assert!((at(1.0) - 10.0).abs() < 1e-4);
        // only the lower fetch (weight 5/6) lands inside near the far edge
        assert!((at(5.0) - 50.0 / 6.0).abs() < 1e-4);
    }
}
