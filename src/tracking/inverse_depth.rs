//! Inverse-depth point tracking.
//!
//! A feature observed without depth is parameterized by the camera position
//! at first sight, two bearing angles and an inverse range:
//! `(firstObs, theta, phi, rho)` with a 6x6 covariance. The point tracks 2D
//! observations through the shared Kalman filter (in cartesian space, with
//! the 6->3 and 3->6 Jacobians on either side) until enough parallax has
//! accumulated to upgrade it to a plain 3D point.

use nalgebra::{Matrix3, Matrix6, SMatrix, Vector3};

use crate::error::{Result, SlamError};
use crate::geometry::coordinates::{
    CameraIntrinsics, ScreenCoordinate, ScreenCoordinate2D, WorldCoordinate,
};
use crate::geometry::covariance::{
    is_covariance_valid, propagate_covariance, world_point_covariance,
};
use crate::geometry::pose::CameraToWorld;
use crate::tracking::kalman::SharedKalmanFilter;

/// Index of the first-observation block in the 6-vector state.
pub const FIRST_POSE_INDEX: usize = 0;
/// Index of the polar bearing angle.
pub const THETA_INDEX: usize = 3;
/// Index of the azimuthal bearing angle.
pub const PHI_INDEX: usize = 4;
/// Index of the inverse range.
pub const INVERSE_DEPTH_INDEX: usize = 5;

/// The inverse-depth state: camera center at first observation, bearing
/// angles and inverse range.
///
/// The bearing is `m(theta, phi) = (sin t sin p, sin t cos p, cos t)` so
/// that `theta = acos(m_z)` and `phi = atan2(m_x, m_y)`; after any update
/// `0 <= theta <= pi`, `-pi < phi <= pi` and `rho > 0` hold by construction.
#[derive(Clone, Copy, Debug)]
pub struct InverseDepthCoordinates {
    pub first_observation: WorldCoordinate,
    pub theta: f64,
    pub phi: f64,
    pub inverse_depth: f64,
}

impl InverseDepthCoordinates {
    /// Build from a depthless screen observation: the bearing comes from the
    /// pixel ray, the inverse range from the configured prior.
    pub fn from_observation(
        observation: &ScreenCoordinate2D,
        intrinsics: &CameraIntrinsics,
        camera_to_world: &CameraToWorld,
        inverse_depth_prior: f64,
    ) -> Self {
        let bearing = observation.to_world_bearing(intrinsics, camera_to_world);
        let theta = bearing.z.clamp(-1.0, 1.0).acos();
        let phi = bearing.x.atan2(bearing.y);

        Self {
            first_observation: WorldCoordinate(camera_to_world.translation()),
            theta,
            phi,
            inverse_depth: inverse_depth_prior,
        }
    }

    /// Unit bearing vector of the stored angles.
    pub fn bearing(&self) -> Vector3<f64> {
        let (sin_theta, cos_theta) = self.theta.sin_cos();
        let (sin_phi, cos_phi) = self.phi.sin_cos();
        Vector3::new(sin_theta * sin_phi, sin_theta * cos_phi, cos_theta)
    }

    /// Cartesian world position: `firstObs + bearing / rho`.
    pub fn to_world_coordinates(&self) -> WorldCoordinate {
        WorldCoordinate(self.first_observation.0 + self.bearing() / self.inverse_depth)
    }

    /// Cartesian position with the 3x6 Jacobian of the conversion, ordered
    /// `(firstObs, theta, phi, rho)`.
    pub fn to_world_with_jacobian(&self) -> (WorldCoordinate, SMatrix<f64, 3, 6>) {
        let (sin_theta, cos_theta) = self.theta.sin_cos();
        let (sin_phi, cos_phi) = self.phi.sin_cos();
        let bearing = Vector3::new(sin_theta * sin_phi, sin_theta * cos_phi, cos_theta);
        let rho = self.inverse_depth;

        let mut jacobian = SMatrix::<f64, 3, 6>::zeros();
        jacobian
            .fixed_view_mut::<3, 3>(0, FIRST_POSE_INDEX)
            .copy_from(&Matrix3::identity());
        jacobian.set_column(
            THETA_INDEX,
            &(Vector3::new(cos_theta * sin_phi, cos_theta * cos_phi, -sin_theta) / rho),
        );
        jacobian.set_column(
            PHI_INDEX,
            &(Vector3::new(sin_theta * cos_phi, -sin_theta * sin_phi, 0.0) / rho),
        );
        jacobian.set_column(INVERSE_DEPTH_INDEX, &(-bearing / (rho * rho)));

        (
            WorldCoordinate(self.first_observation.0 + bearing / rho),
            jacobian,
        )
    }

    /// Re-express a cartesian point in inverse-depth form around a fixed
    /// first observation, with the 6x3 Jacobian of the state with respect to
    /// the point.
    pub fn from_cartesian(
        point: &WorldCoordinate,
        first_observation: &WorldCoordinate,
    ) -> Result<(Self, SMatrix<f64, 6, 3>)> {
        let to_point = point.0 - first_observation.0;
        let range = to_point.norm();
        if range <= f64::EPSILON {
            return Err(SlamError::DegenerateGeometry(
                "inverse depth from a point at the first observation center".to_string(),
            ));
        }

        let coordinates = Self {
            first_observation: *first_observation,
            theta: (to_point.z / range).clamp(-1.0, 1.0).acos(),
            phi: to_point.x.atan2(to_point.y),
            inverse_depth: 1.0 / range,
        };

        let range_cubed = range * range * range;
        let mut jacobian = SMatrix::<f64, 6, 3>::zeros();

        // d theta / d p
        let cos_theta = to_point.z / range;
        let sin_theta_sq = 1.0 - cos_theta * cos_theta;
        if sin_theta_sq > 1e-12 {
            let inv_sin_theta = sin_theta_sq.sqrt().recip();
            let d_theta = (to_point * (to_point.z / range_cubed)
                - Vector3::new(0.0, 0.0, 1.0 / range))
                * inv_sin_theta;
            jacobian.set_row(THETA_INDEX, &d_theta.transpose());
        }

        // d phi / d p
        let planar_norm_sq = to_point.x * to_point.x + to_point.y * to_point.y;
        if planar_norm_sq > 1e-12 {
            let d_phi =
                Vector3::new(to_point.y, -to_point.x, 0.0) / planar_norm_sq;
            jacobian.set_row(PHI_INDEX, &d_phi.transpose());
        }

        // d rho / d p
        jacobian.set_row(
            INVERSE_DEPTH_INDEX,
            &(-to_point / range_cubed).transpose(),
        );

        Ok((coordinates, jacobian))
    }
}

/// A tracked inverse-depth feature: state plus 6x6 covariance.
#[derive(Clone, Debug)]
pub struct PointInverseDepth {
    coordinates: InverseDepthCoordinates,
    covariance: Matrix6<f64>,
}

impl PointInverseDepth {
    /// Construct from a first depthless observation.
    ///
    /// The first-observation block carries the camera position uncertainty;
    /// bearing and inverse range start from the configured priors
    /// (`sigma_rho = baseline / 4`, angles in degrees).
    pub fn new(
        observation: &ScreenCoordinate2D,
        intrinsics: &CameraIntrinsics,
        camera_to_world: &CameraToWorld,
        pose_covariance: &Matrix3<f64>,
        inverse_depth_baseline: f64,
        angle_baseline_degrees: f64,
    ) -> Result<Self> {
        if !is_covariance_valid(pose_covariance) {
            return Err(SlamError::InvalidInput(
                "inverse depth point: pose covariance is invalid".to_string(),
            ));
        }

        let coordinates = InverseDepthCoordinates::from_observation(
            observation,
            intrinsics,
            camera_to_world,
            inverse_depth_baseline,
        );

        let angle_variance = (angle_baseline_degrees.to_radians()).powi(2);
        let depth_variance = (inverse_depth_baseline / 4.0).powi(2);

        let mut covariance = Matrix6::zeros();
        covariance
            .fixed_view_mut::<3, 3>(FIRST_POSE_INDEX, FIRST_POSE_INDEX)
            .copy_from(pose_covariance);
        covariance[(THETA_INDEX, THETA_INDEX)] = angle_variance;
        covariance[(PHI_INDEX, PHI_INDEX)] = angle_variance;
        covariance[(INVERSE_DEPTH_INDEX, INVERSE_DEPTH_INDEX)] = depth_variance;

        if !is_covariance_valid(&covariance) {
            return Err(SlamError::InvalidInput(
                "inverse depth point: built covariance is invalid".to_string(),
            ));
        }

        Ok(Self {
            coordinates,
            covariance,
        })
    }

    pub fn coordinates(&self) -> &InverseDepthCoordinates {
        &self.coordinates
    }

    pub fn covariance(&self) -> &Matrix6<f64> {
        &self.covariance
    }

    /// Covariance of the first-observation block.
    pub fn first_pose_covariance(&self) -> Matrix3<f64> {
        self.covariance
            .fixed_view::<3, 3>(FIRST_POSE_INDEX, FIRST_POSE_INDEX)
            .into_owned()
    }

    /// Variance of the inverse range.
    pub fn inverse_depth_variance(&self) -> f64 {
        self.covariance[(INVERSE_DEPTH_INDEX, INVERSE_DEPTH_INDEX)]
    }

    /// Cartesian covariance of the current state.
    pub fn cartesian_covariance(&self) -> Result<Matrix3<f64>> {
        let (_, jacobian) = self.coordinates.to_world_with_jacobian();
        let cartesian = propagate_covariance(&self.covariance, &jacobian);
        if is_covariance_valid(&cartesian) {
            Ok(cartesian)
        } else {
            Err(SlamError::DegenerateGeometry(
                "cartesian covariance of an inverse depth point is invalid".to_string(),
            ))
        }
    }

    /// Track a depthless observation: the measurement is another
    /// inverse-depth sighting from the current camera, merged in cartesian
    /// space.
    pub fn track_2d(
        &mut self,
        filter: &SharedKalmanFilter<3>,
        observation: &ScreenCoordinate2D,
        intrinsics: &CameraIntrinsics,
        camera_to_world: &CameraToWorld,
        pose_covariance: &Matrix3<f64>,
        inverse_depth_baseline: f64,
        angle_baseline_degrees: f64,
    ) -> Result<()> {
        let measurement = Self::new(
            observation,
            intrinsics,
            camera_to_world,
            pose_covariance,
            inverse_depth_baseline,
            angle_baseline_degrees,
        )?;
        let cartesian = measurement.coordinates.to_world_coordinates();
        let covariance = measurement.cartesian_covariance()?;
        self.update_with_cartesian(filter, &cartesian, &covariance)
    }

    /// Track an observation with valid depth: the measurement is the
    /// retroprojected world point with its covariance.
    pub fn track_3d(
        &mut self,
        filter: &SharedKalmanFilter<3>,
        observation: &ScreenCoordinate,
        intrinsics: &CameraIntrinsics,
        camera_to_world: &CameraToWorld,
        pose_covariance: &Matrix3<f64>,
        depth_sigma_error: f64,
    ) -> Result<()> {
        let world = observation.to_world_coordinates(intrinsics, camera_to_world);
        let covariance = world_point_covariance(
            observation,
            intrinsics,
            camera_to_world,
            pose_covariance,
            depth_sigma_error,
        )?;
        self.update_with_cartesian(filter, &world, &covariance)
    }

    /// Kalman-merge a cartesian measurement and fold the result back into
    /// inverse-depth form. The first-observation covariance block is
    /// restored from the prior state (the anchor does not move).
    fn update_with_cartesian(
        &mut self,
        filter: &SharedKalmanFilter<3>,
        point: &WorldCoordinate,
        point_covariance: &Matrix3<f64>,
    ) -> Result<()> {
        let (current_cartesian, _) = self.coordinates.to_world_with_jacobian();
        let current_covariance = self.cartesian_covariance()?;

        let (new_state, new_covariance) = filter.get_new_state(
            &current_cartesian.0,
            &current_covariance,
            &point.0,
            point_covariance,
        )?;

        let (new_coordinates, from_cartesian_jacobian) = InverseDepthCoordinates::from_cartesian(
            &WorldCoordinate(new_state),
            &self.coordinates.first_observation,
        )?;

        let mut merged = propagate_covariance(&new_covariance, &from_cartesian_jacobian);
        merged
            .fixed_view_mut::<3, 3>(FIRST_POSE_INDEX, FIRST_POSE_INDEX)
            .copy_from(&self.first_pose_covariance());

        if !is_covariance_valid(&merged) {
            return Err(SlamError::DegenerateGeometry(
                "inverse depth covariance is invalid after merge".to_string(),
            ));
        }

        self.coordinates = new_coordinates;
        self.covariance = merged;
        Ok(())
    }

    /// Dimensionless triangulation-parallax measure; low means the point is
    /// observed with enough baseline to be safely converted to cartesian.
    ///
    /// `4 * (sigma_rho / rho^2) * |cos alpha| / |h_c|`, evaluated in meters,
    /// where `h_c` is the vector from the current camera to the cartesian
    /// estimate and `alpha` the angle between bearing and `h_c`.
    pub fn compute_linearity_score(&self, camera_to_world: &CameraToWorld) -> f64 {
        let cartesian = self.coordinates.to_world_coordinates();
        let to_point = cartesian.0 - camera_to_world.translation();
        let distance = to_point.norm();
        if distance <= f64::EPSILON {
            return f64::INFINITY;
        }

        let cos_alpha = self.coordinates.bearing().dot(&to_point) / distance;
        let sigma_rho = self.inverse_depth_variance().sqrt();
        let rho = self.coordinates.inverse_depth;

        let depth_deviation_meters = (sigma_rho / (rho * rho)) / 1000.0;
        let distance_meters = distance / 1000.0;

        4.0 * depth_deviation_meters / distance_meters * cos_alpha.abs()
    }

    /// Cartesian position and covariance iff the linearity score is strictly
    /// below the threshold; a point exactly at the threshold stays 2D.
    pub fn upgrade(
        &self,
        camera_to_world: &CameraToWorld,
        linearity_threshold: f64,
    ) -> Result<Option<(WorldCoordinate, Matrix3<f64>)>> {
        if self.compute_linearity_score(camera_to_world) < linearity_threshold {
            let cartesian = self.coordinates.to_world_coordinates();
            let covariance = self.cartesian_covariance()?;
            Ok(Some((cartesian, covariance)))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::pose::Pose;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics {
            focal_x: 550.0,
            focal_y: 550.0,
            center_x: 320.0,
            center_y: 240.0,
        }
    }

    #[test]
    fn cartesian_roundtrip_preserves_state() {
        let first = WorldCoordinate::new(10.0, -20.0, 5.0);
        let original = InverseDepthCoordinates {
            first_observation: first,
            theta: 1.1,
            phi: -0.4,
            inverse_depth: 0.5e-3,
        };

        let cartesian = original.to_world_coordinates();
        let (recovered, _) =
            InverseDepthCoordinates::from_cartesian(&cartesian, &first).unwrap();

        assert_relative_eq!(original.theta, recovered.theta, epsilon = 1e-9);
        assert_relative_eq!(original.phi, recovered.phi, epsilon = 1e-9);
        assert_relative_eq!(
            original.inverse_depth,
            recovered.inverse_depth,
            epsilon = 1e-12
        );
    }

    #[test]
    fn to_world_jacobian_matches_numerical() {
        let coordinates = InverseDepthCoordinates {
            first_observation: WorldCoordinate::new(100.0, 50.0, -30.0),
            theta: 0.9,
            phi: 0.7,
            inverse_depth: 1e-3,
        };
        let (_, jacobian) = coordinates.to_world_with_jacobian();

        let eps = 1e-7;
        let perturb = |index: usize, delta: f64| {
            let mut c = coordinates;
            match index {
                0 => c.first_observation.0.x += delta,
                1 => c.first_observation.0.y += delta,
                2 => c.first_observation.0.z += delta,
                THETA_INDEX => c.theta += delta,
                PHI_INDEX => c.phi += delta,
                INVERSE_DEPTH_INDEX => c.inverse_depth += delta,
                _ => unreachable!(),
            }
            c.to_world_coordinates().0
        };

        for col in 0..6 {
            // inverse depth needs a relative step
            let step = if col == INVERSE_DEPTH_INDEX { 1e-9 } else { eps };
            let numerical = (perturb(col, step) - perturb(col, -step)) / (2.0 * step);
            let analytical = jacobian.column(col);
            // absolute epsilon absorbs central-difference roundoff on the
            // exactly-zero entries
            assert_relative_eq!(
                numerical,
                analytical.into_owned(),
                epsilon = 1e-4,
                max_relative = 1e-4
            );
        }
    }

    #[test]
    fn bearing_angles_stay_in_range_after_track() {
        let filter = SharedKalmanFilter::for_static_point();
        let pose = Pose::default();
        let mut point = PointInverseDepth::new(
            &ScreenCoordinate2D::new(400.0, 250.0),
            &intrinsics(),
            &pose.camera_to_world(),
            &(Matrix3::identity() * 4.0),
            0.5e-3,
            1.0,
        )
        .unwrap();

        // observe the same feature from a translated camera
        let moved = Pose::new(
            Vector3::new(300.0, 0.0, 0.0),
            UnitQuaternion::identity(),
        );
        point
            .track_2d(
                &filter,
                &ScreenCoordinate2D::new(330.0, 250.0),
                &intrinsics(),
                &moved.camera_to_world(),
                &(Matrix3::identity() * 4.0),
                0.5e-3,
                1.0,
            )
            .unwrap();

        let coordinates = point.coordinates();
        assert!((0.0..=std::f64::consts::PI).contains(&coordinates.theta));
        assert!(
            (-std::f64::consts::PI..=std::f64::consts::PI).contains(&coordinates.phi)
        );
        assert!(coordinates.inverse_depth > 0.0);
    }

    #[test]
    fn depth_observation_pins_down_inverse_range() {
        let filter = SharedKalmanFilter::for_static_point();
        let pose = Pose::default();
        let intrinsics = intrinsics();

        let mut point = PointInverseDepth::new(
            &ScreenCoordinate2D::new(320.0, 240.0),
            &intrinsics,
            &pose.camera_to_world(),
            &Matrix3::zeros(),
            0.5e-3,
            1.0,
        )
        .unwrap();

        let variance_before = point.inverse_depth_variance();
        point
            .track_3d(
                &filter,
                &ScreenCoordinate::new(320.0, 240.0, 2000.0),
                &intrinsics,
                &pose.camera_to_world(),
                &Matrix3::zeros(),
                1.425e-6,
            )
            .unwrap();

        assert!(point.inverse_depth_variance() < variance_before);
        // the optical-axis observation at 2 m pulls the range estimate there
        let range = 1.0 / point.coordinates().inverse_depth;
        assert!((500.0..4000.0).contains(&range));
    }

    #[test]
    fn point_at_exact_threshold_is_not_upgraded() {
        let pose = Pose::default();
        let point = PointInverseDepth::new(
            &ScreenCoordinate2D::new(320.0, 240.0),
            &intrinsics(),
            &pose.camera_to_world(),
            &Matrix3::zeros(),
            0.5e-3,
            1.0,
        )
        .unwrap();

        let score = point.compute_linearity_score(&pose.camera_to_world());
        // threshold equal to the score: strictly-below test must refuse
        assert!(point
            .upgrade(&pose.camera_to_world(), score)
            .unwrap()
            .is_none());
        // threshold just above: accepted
        assert!(point
            .upgrade(&pose.camera_to_world(), score * 1.0001)
            .unwrap()
            .is_some());
    }

    #[test]
    fn linearity_score_shrinks_as_inverse_depth_certainty_grows() {
        let filter = SharedKalmanFilter::for_static_point();
        let pose = Pose::default();
        let intrinsics = intrinsics();

        let mut point = PointInverseDepth::new(
            &ScreenCoordinate2D::new(320.0, 240.0),
            &intrinsics,
            &pose.camera_to_world(),
            &Matrix3::zeros(),
            0.5e-3,
            1.0,
        )
        .unwrap();
        let score_before = point.compute_linearity_score(&pose.camera_to_world());

        for _ in 0..5 {
            point
                .track_3d(
                    &filter,
                    &ScreenCoordinate::new(320.0, 240.0, 2000.0),
                    &intrinsics,
                    &pose.camera_to_world(),
                    &Matrix3::zeros(),
                    1.425e-6,
                )
                .unwrap();
        }

        assert!(point.compute_linearity_score(&pose.camera_to_world()) < score_before);
    }
}
