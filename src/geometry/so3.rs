//! SO(3) utilities: skew-symmetric matrices and the scaled-axis
//! parameterization of unit quaternions.
//!
//! The scaled-axis vector `r = angle · axis` keeps the optimizer in an
//! unconstrained 3-dimensional parameter space; it relates to a unit
//! quaternion by `q = (cos(|r|/2), sin(|r|/2) · r/|r|)`.

use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};

/// Small angle threshold for numerical stability.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-10;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Extracts the scaled-axis coefficients of a unit quaternion.
///
/// The quaternion sign is normalized to `w ≥ 0` first so the returned angle
/// stays in `[0, π]` and the round trip through
/// [`quaternion_from_scaled_axis`] is exact.
pub fn scaled_axis_from_quaternion(quat: &UnitQuaternion<f64>) -> Vector3<f64> {
    // forcing positive w to work from 0 to PI
    let q = if quat.w >= 0.0 {
        *quat.quaternion()
    } else {
        Quaternion::new(-quat.w, -quat.i, -quat.j, -quat.k)
    };

    let qv = q.imag();
    let sin_half_angle = qv.norm();
    if sin_half_angle > SMALL_ANGLE_THRESHOLD {
        let angle = 2.0 * sin_half_angle.atan2(q.w);
        qv * (angle / sin_half_angle)
    } else {
        // w dominates the vector part; first-order expansion of 2·atan2
        qv * (2.0 / q.w)
    }
}

/// Builds a unit quaternion from scaled-axis coefficients.
pub fn quaternion_from_scaled_axis(coefficients: &Vector3<f64>) -> UnitQuaternion<f64> {
    let angle = coefficients.norm();
    let half_angle = angle * 0.5;
    let scale = if angle > SMALL_ANGLE_THRESHOLD {
        half_angle.sin() / angle
    } else {
        0.5
    };

    UnitQuaternion::from_quaternion(Quaternion::new(
        half_angle.cos(),
        coefficients.x * scale,
        coefficients.y * scale,
        coefficients.z * scale,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);

        let cross_direct = v.cross(&u);
        let cross_skew = skew(&v) * u;

        assert_relative_eq!(cross_direct, cross_skew, epsilon = 1e-12);
    }

    #[test]
    fn test_skew_antisymmetric() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let skew_v = skew(&v);

        assert_relative_eq!(skew_v, -skew_v.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn test_scaled_axis_roundtrip() {
        let q = UnitQuaternion::from_euler_angles(0.3, -0.7, 1.2);
        let recovered = quaternion_from_scaled_axis(&scaled_axis_from_quaternion(&q));

        assert_relative_eq!(q.w, recovered.w, epsilon = 1e-12);
        assert_relative_eq!(q.i, recovered.i, epsilon = 1e-12);
        assert_relative_eq!(q.j, recovered.j, epsilon = 1e-12);
        assert_relative_eq!(q.k, recovered.k, epsilon = 1e-12);
    }

    #[test]
    fn test_negative_w_normalized() {
        // q and -q encode the same rotation; the extraction picks w >= 0
        let q = UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3);
        let negated = UnitQuaternion::from_quaternion(Quaternion::new(-q.w, -q.i, -q.j, -q.k));

        let sa = scaled_axis_from_quaternion(&negated);
        let recovered = quaternion_from_scaled_axis(&sa);

        let r1 = q.to_rotation_matrix();
        let r2 = recovered.to_rotation_matrix();
        assert_relative_eq!(r1.into_inner(), r2.into_inner(), epsilon = 1e-12);
    }

    #[test]
    fn test_zero_rotation() {
        let sa = scaled_axis_from_quaternion(&UnitQuaternion::identity());
        assert_relative_eq!(sa.norm(), 0.0, epsilon = 1e-12);

        let q = quaternion_from_scaled_axis(&Vector3::zeros());
        assert_relative_eq!(q.w, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_matches_nalgebra_scaled_axis() {
        let q = UnitQuaternion::from_euler_angles(0.4, 0.1, -0.9);
        assert_relative_eq!(
            scaled_axis_from_quaternion(&q),
            q.scaled_axis(),
            epsilon = 1e-9
        );
    }
}
