//! Covariance validity and propagation helpers.
//!
//! Every routine either returns a valid PSD matrix or a typed failure; a NaN
//! or indefinite covariance is never allowed to travel silently through the
//! pipeline.

use nalgebra::{Cholesky, Matrix3, OMatrix, SMatrix};

use crate::error::{Result, SlamError};
use crate::geometry::coordinates::{CameraIntrinsics, ScreenCoordinate};
use crate::geometry::pose::CameraToWorld;

/// Eigenvalues are allowed to be this far below zero before a matrix is
/// declared indefinite (numerical slack for symmetric decompositions).
pub const PSD_EPSILON: f64 = 1e-9;

/// True when the matrix is finite, symmetric and positive semi-definite.
///
/// Semi-definiteness is checked by Cholesky-factoring the matrix with a
/// small diagonal jitter, which accepts eigenvalues down to `-PSD_EPSILON`.
pub fn is_covariance_valid<const N: usize>(covariance: &SMatrix<f64, N, N>) -> bool {
    if covariance.iter().any(|value| !value.is_finite()) {
        return false;
    }
    let asymmetry = (covariance - covariance.transpose())
        .iter()
        .fold(0.0_f64, |max, value| max.max(value.abs()));
    if asymmetry > 1e-6 {
        return false;
    }
    let jittered = covariance + SMatrix::<f64, N, N>::identity() * (10.0 * PSD_EPSILON);
    Cholesky::new(jittered).is_some()
}

/// First-order covariance propagation through a map with Jacobian `J`:
/// `J · C · Jᵀ`, symmetrized against accumulation drift.
pub fn propagate_covariance<const R: usize, const C: usize>(
    covariance: &SMatrix<f64, C, C>,
    jacobian: &SMatrix<f64, R, C>,
) -> SMatrix<f64, R, R> {
    let propagated: OMatrix<f64, nalgebra::Const<R>, nalgebra::Const<R>> =
        jacobian * covariance * jacobian.transpose();
    (propagated + propagated.transpose()) * 0.5
}

/// Covariance of the depth measurement: a quadratic sensor noise model.
fn depth_variance(depth: f64, depth_sigma_error: f64) -> f64 {
    let sigma = depth_sigma_error * depth * depth;
    sigma * sigma
}

/// Covariance of a screen observation (u, v, z): one pixel of detection
/// noise on each image axis, depth noise from the sensor model.
pub fn screen_point_covariance(depth: f64, depth_sigma_error: f64) -> Matrix3<f64> {
    Matrix3::from_diagonal(&nalgebra::Vector3::new(
        1.0,
        1.0,
        depth_variance(depth, depth_sigma_error).max(1e-3),
    ))
}

/// Gaussian error of a screen point once projected to world space.
///
/// The Jacobian of the retroprojection is evaluated at the measurement; the
/// camera pose uncertainty enters additively through `pose_covariance`.
pub fn world_point_covariance(
    screen_point: &ScreenCoordinate,
    intrinsics: &CameraIntrinsics,
    camera_to_world: &CameraToWorld,
    pose_covariance: &Matrix3<f64>,
    depth_sigma_error: f64,
) -> Result<Matrix3<f64>> {
    let depth = screen_point.z();
    if !crate::geometry::coordinates::is_depth_valid(depth) {
        return Err(SlamError::InvalidInput(format!(
            "cannot compute a world covariance from an invalid depth ({depth} mm)"
        )));
    }

    // d(camera point)/d(u, v, z)
    let jacobian = Matrix3::new(
        depth / intrinsics.focal_x,
        0.0,
        (screen_point.u() - intrinsics.center_x) / intrinsics.focal_x,
        0.0,
        depth / intrinsics.focal_y,
        (screen_point.v() - intrinsics.center_y) / intrinsics.focal_y,
        0.0,
        0.0,
        1.0,
    );

    let screen_covariance = screen_point_covariance(depth, depth_sigma_error);
    let camera_covariance = propagate_covariance(&screen_covariance, &jacobian);

    // rotate into the world frame and stack the pose uncertainty
    let rotation = camera_to_world.rotation().to_rotation_matrix().into_inner();
    let world_covariance = propagate_covariance(&camera_covariance, &rotation) + pose_covariance;

    if is_covariance_valid(&world_covariance) {
        Ok(world_covariance)
    } else {
        Err(SlamError::InvalidInput(
            "world point covariance is not positive semi-definite".to_string(),
        ))
    }
}
