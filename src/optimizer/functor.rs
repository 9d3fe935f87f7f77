//! The pose estimation least-squares problem.
//!
//! Parameter vector `x ∈ R⁶`: `(tx, ty, tz, rx, ry, rz)` where the rotation
//! block is the scaled-axis of a **delta** quaternion applied on top of the
//! current rotation; `(0, 0, 0)` means "no change". Residuals concatenate,
//! per feature, a robust-loss-transformed scalar: one row per 3D point
//! (Manhattan retroprojection distance), one row per inverse-depth point
//! (signed perpendicular distance to the projected bearing line), three
//! rows per plane ((theta, phi, d) errors whitened by the feature
//! covariance). The Jacobian is a central difference with the configured
//! error precision.

use levenberg_marquardt::LeastSquaresProblem;
use nalgebra::storage::Owned;
use nalgebra::{DVector, Dyn, OMatrix, UnitQuaternion, Vector2, Vector3, Vector6, U6};

use crate::config::OptimizationSection;
use crate::geometry::coordinates::{CameraIntrinsics, ScreenCoordinate2D, WorldCoordinate};
use crate::geometry::pose::WorldToCamera;
use crate::geometry::so3::{quaternion_from_scaled_axis, scaled_axis_from_quaternion};
use crate::map::matches::Matches;
use crate::optimizer::loss::generalized_loss;

/// Retroprojection distance charged to a feature that does not project
/// (behind the camera), in pixels.
const UNPROJECTABLE_DISTANCE: f64 = 1e4;

pub struct PoseEstimator<'a> {
    matches: &'a Matches,
    intrinsics: CameraIntrinsics,
    optimization: &'a OptimizationSection,
    /// Rotation the delta parameterization is anchored to.
    base_orientation: UnitQuaternion<f64>,
    params: Vector6<f64>,
}

impl<'a> PoseEstimator<'a> {
    pub fn new(
        matches: &'a Matches,
        intrinsics: CameraIntrinsics,
        base_position: Vector3<f64>,
        base_orientation: UnitQuaternion<f64>,
        optimization: &'a OptimizationSection,
    ) -> Self {
        let mut params = Vector6::zeros();
        params.fixed_rows_mut::<3>(0).copy_from(&base_position);

        Self {
            matches,
            intrinsics,
            optimization,
            base_orientation,
            params,
        }
    }

    pub fn residual_count(&self) -> usize {
        self.matches.points.len() + self.matches.points_2d.len() + 3 * self.matches.planes.len()
    }

    /// Decode a parameter vector into a world pose.
    pub fn pose_from_params(&self, params: &Vector6<f64>) -> (Vector3<f64>, UnitQuaternion<f64>) {
        let position = params.fixed_rows::<3>(0).into_owned();
        let delta = quaternion_from_scaled_axis(&params.fixed_rows::<3>(3).into_owned());
        (position, delta * self.base_orientation)
    }

    /// Encode a pose relative to the base orientation.
    pub fn params_from_pose(
        &self,
        position: &Vector3<f64>,
        orientation: &UnitQuaternion<f64>,
    ) -> Vector6<f64> {
        let delta = orientation * self.base_orientation.inverse();
        let mut params = Vector6::zeros();
        params.fixed_rows_mut::<3>(0).copy_from(position);
        params
            .fixed_rows_mut::<3>(3)
            .copy_from(&scaled_axis_from_quaternion(&delta));
        params
    }

    fn residuals_at(&self, params: &Vector6<f64>) -> DVector<f64> {
        let (position, orientation) = self.pose_from_params(params);
        let world_to_camera = WorldToCamera::new(&orientation, &position);

        let mut residuals = DVector::zeros(self.residual_count());
        let alpha = self.optimization.point_loss_alpha;
        let scale = self.optimization.point_loss_scale;

        let mut row = 0;

        let point_count = self.matches.points.len().max(1);
        let point_weight =
            (self.optimization.point_error_multiplier / point_count as f64).sqrt();
        for matched in &self.matches.points {
            let distance = matched
                .world
                .screen_distance(&matched.screen.as_2d(), &self.intrinsics, &world_to_camera)
                .unwrap_or(UNPROJECTABLE_DISTANCE);
            residuals[row] = point_weight * generalized_loss(distance, alpha, scale);
            row += 1;
        }

        let point_2d_count = self.matches.points_2d.len().max(1);
        let point_2d_weight =
            (self.optimization.point_error_multiplier / point_2d_count as f64).sqrt();
        for matched in &self.matches.points_2d {
            let distance = bearing_line_distance(
                &matched.coordinates.first_observation,
                &matched.coordinates.bearing(),
                matched.coordinates.inverse_depth,
                &matched.screen,
                &self.intrinsics,
                &world_to_camera,
            );
            residuals[row] = point_2d_weight * generalized_loss(distance, alpha, scale);
            row += 1;
        }

        let plane_count = self.matches.planes.len().max(1);
        let plane_weight =
            (self.optimization.point_error_multiplier / plane_count as f64).sqrt();
        for matched in &self.matches.planes {
            let error = matched
                .map_plane
                .reduced_signed_distance(&matched.detected, &world_to_camera);
            for component in 0..3 {
                let deviation = matched.covariance[component].sqrt().max(1e-6);
                let whitened = error[component] / deviation;
                residuals[row] = plane_weight * generalized_loss(whitened, alpha, scale);
                row += 1;
            }
        }

        residuals
    }
}

/// Signed perpendicular screen distance from an observed keypoint to the
/// projected line of possible feature positions (the bearing ray sampled at
/// the current inverse depth and at half of it). Falls back to the plain
/// point distance when the ray projects to a point.
fn bearing_line_distance(
    first_observation: &WorldCoordinate,
    bearing: &Vector3<f64>,
    inverse_depth: f64,
    observed: &ScreenCoordinate2D,
    intrinsics: &CameraIntrinsics,
    world_to_camera: &WorldToCamera,
) -> f64 {
    let at_estimate = WorldCoordinate(first_observation.0 + bearing / inverse_depth);
    let at_half_range = WorldCoordinate(first_observation.0 + bearing / (2.0 * inverse_depth));

    let Some(projected) = at_estimate.to_screen_coordinates(intrinsics, world_to_camera) else {
        return UNPROJECTABLE_DISTANCE;
    };
    let offset = Vector2::new(
        observed.u() - projected.u(),
        observed.v() - projected.v(),
    );

    match at_half_range.to_screen_coordinates(intrinsics, world_to_camera) {
        Some(other) => {
            let direction = Vector2::new(other.u() - projected.u(), other.v() - projected.v());
            let length = direction.norm();
            if length < 1e-9 {
                offset.norm()
            } else {
                // 2D cross product: signed distance perpendicular to the line
                (direction.x * offset.y - direction.y * offset.x) / length
            }
        }
        None => offset.norm(),
    }
}

impl<'a> LeastSquaresProblem<f64, Dyn, U6> for PoseEstimator<'a> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U6>;
    type ParameterStorage = Owned<f64, U6>;

    fn set_params(&mut self, params: &Vector6<f64>) {
        self.params = *params;
    }

    fn params(&self) -> Vector6<f64> {
        self.params
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let residuals = self.residuals_at(&self.params);
        if residuals.iter().all(|value| value.is_finite()) {
            Some(residuals)
        } else {
            None
        }
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U6>> {
        let epsilon = if self.optimization.error_precision > 0.0 {
            self.optimization.error_precision
        } else {
            f64::EPSILON.sqrt()
        };

        let mut jacobian = OMatrix::<f64, Dyn, U6>::zeros(self.residual_count());
        for column in 0..6 {
            let mut plus = self.params;
            let mut minus = self.params;
            plus[column] += epsilon;
            minus[column] -= epsilon;

            let difference = (self.residuals_at(&plus) - self.residuals_at(&minus))
                / (2.0 * epsilon);
            if difference.iter().any(|value| !value.is_finite()) {
                return None;
            }
            jacobian.set_column(column, &difference);
        }
        Some(jacobian)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::keypoints::FeatureId;
    use crate::geometry::coordinates::ScreenCoordinate;
    use crate::geometry::pose::Pose;
    use crate::map::matches::PointMatch;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics {
            focal_x: 550.0,
            focal_y: 550.0,
            center_x: 320.0,
            center_y: 240.0,
        }
    }

    fn perfect_matches(pose: &Pose, world_points: &[Vector3<f64>]) -> Matches {
        let world_to_camera = pose.world_to_camera();
        let mut matches = Matches::default();
        for (index, point) in world_points.iter().enumerate() {
            let world = WorldCoordinate(*point);
            let screen = world
                .to_screen_coordinates(&intrinsics(), &world_to_camera)
                .unwrap();
            matches.points.push(PointMatch {
                screen: ScreenCoordinate::new(screen.u(), screen.v(), screen.z()),
                world,
                covariance: Matrix3::identity(),
                id: FeatureId(index as u64 + 1),
                detected_index: index,
            });
        }
        matches
    }

    #[test]
    fn residuals_vanish_at_the_true_pose() {
        let pose = Pose::new(
            Vector3::new(25.0, -10.0, 5.0),
            UnitQuaternion::from_euler_angles(0.02, -0.03, 0.01),
        );
        let matches = perfect_matches(
            &pose,
            &[
                Vector3::new(0.0, 0.0, 2000.0),
                Vector3::new(400.0, 200.0, 1800.0),
                Vector3::new(-300.0, -150.0, 2500.0),
            ],
        );

        let optimization = OptimizationSection::default();
        let estimator = PoseEstimator::new(
            &matches,
            intrinsics(),
            pose.position(),
            pose.orientation(),
            &optimization,
        );
        let residuals = estimator.residuals_at(&estimator.params());
        assert_relative_eq!(residuals.norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn residuals_grow_away_from_the_true_pose() {
        let pose = Pose::default();
        let matches = perfect_matches(
            &pose,
            &[
                Vector3::new(0.0, 0.0, 2000.0),
                Vector3::new(400.0, 200.0, 1800.0),
                Vector3::new(-300.0, -150.0, 2500.0),
            ],
        );

        let optimization = OptimizationSection::default();
        let estimator = PoseEstimator::new(
            &matches,
            intrinsics(),
            pose.position(),
            pose.orientation(),
            &optimization,
        );

        let mut shifted = estimator.params();
        shifted[0] += 50.0; // 50 mm to the side
        let at_truth = estimator.residuals_at(&estimator.params()).norm();
        let away = estimator.residuals_at(&shifted).norm();
        assert!(away > at_truth);
    }

    #[test]
    fn params_pose_roundtrip() {
        let pose = Pose::new(
            Vector3::new(10.0, 20.0, 30.0),
            UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
        );
        let matches = Matches::default();
        let optimization = OptimizationSection::default();
        let estimator = PoseEstimator::new(
            &matches,
            intrinsics(),
            pose.position(),
            pose.orientation(),
            &optimization,
        );

        let target = UnitQuaternion::from_euler_angles(0.15, 0.18, 0.33);
        let params = estimator.params_from_pose(&Vector3::new(1.0, 2.0, 3.0), &target);
        let (position, orientation) = estimator.pose_from_params(&params);

        assert_relative_eq!(position, Vector3::new(1.0, 2.0, 3.0), epsilon = 1e-12);
        assert_relative_eq!(orientation.angle_to(&target), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn zero_rotation_params_decode_to_base_orientation() {
        let base = UnitQuaternion::from_euler_angles(0.4, -0.2, 0.7);
        let matches = Matches::default();
        let optimization = OptimizationSection::default();
        let estimator =
            PoseEstimator::new(&matches, intrinsics(), Vector3::zeros(), base, &optimization);

        let (_, orientation) = estimator.pose_from_params(&Vector6::zeros());
        assert_relative_eq!(orientation.angle_to(&base), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn jacobian_is_finite_and_nonzero_off_optimum() {
        let pose = Pose::default();
        let matches = perfect_matches(
            &pose,
            &[
                Vector3::new(100.0, 50.0, 1500.0),
                Vector3::new(-200.0, 80.0, 2000.0),
                Vector3::new(50.0, -120.0, 2500.0),
            ],
        );
        let optimization = OptimizationSection::default();
        let mut estimator = PoseEstimator::new(
            &matches,
            intrinsics(),
            pose.position(),
            pose.orientation(),
            &optimization,
        );

        let mut params = estimator.params();
        params[1] += 20.0;
        estimator.set_params(&params);

        let jacobian = estimator.jacobian().unwrap();
        assert!(jacobian.iter().all(|value| value.is_finite()));
        assert!(jacobian.norm() > 0.0);
    }
}
