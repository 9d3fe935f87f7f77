//! Monte-Carlo pose covariance.
//!
//! The inlier set is perturbed with zero-mean Gaussian noise scaled by each
//! feature's stored covariance and re-optimized; the sample covariance of
//! the resulting 6-vectors (translation, tangent-space rotation delta) is
//! the pose covariance. Perturbation runs fork across a scoped thread pool
//! and merge under one mutex; per-slot seeding keeps the estimate
//! independent of the thread interleaving.

use nalgebra::{Matrix6, Vector6};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tracing::debug;

use crate::config::Parameters;
use crate::error::SlamError;
use crate::geometry::coordinates::CameraIntrinsics;
use crate::geometry::pose::Pose;
use crate::geometry::so3::scaled_axis_from_quaternion;
use crate::map::matches::Matches;
use crate::optimizer::ransac::run_optimization;
use crate::tracking::inverse_depth::{INVERSE_DEPTH_INDEX, PHI_INDEX, THETA_INDEX};

/// Diagonal loading of the sample covariance, keeps the output invertible.
const COVARIANCE_JITTER: f64 = 1e-3;

/// Perturb every feature of the set by its own standard deviations.
fn perturb_matches(matches: &Matches, rng: &mut StdRng) -> Matches {
    let normal = Normal::new(0.0, 1.0).expect("unit normal is well formed");
    let mut perturbed = matches.clone();

    for matched in &mut perturbed.points {
        for axis in 0..3 {
            let sigma = matched.covariance[(axis, axis)].max(0.0).sqrt();
            matched.world.0[axis] += sigma * normal.sample(rng);
        }
    }

    for matched in &mut perturbed.points_2d {
        let coordinates = &mut matched.coordinates;
        let theta_sigma = matched.covariance[(THETA_INDEX, THETA_INDEX)].max(0.0).sqrt();
        let phi_sigma = matched.covariance[(PHI_INDEX, PHI_INDEX)].max(0.0).sqrt();
        let rho_sigma = matched.covariance[(INVERSE_DEPTH_INDEX, INVERSE_DEPTH_INDEX)]
            .max(0.0)
            .sqrt();
        coordinates.theta =
            (coordinates.theta + theta_sigma * normal.sample(rng)).clamp(0.0, std::f64::consts::PI);
        coordinates.phi += phi_sigma * normal.sample(rng);
        coordinates.inverse_depth =
            (coordinates.inverse_depth + rho_sigma * normal.sample(rng)).max(1e-9);
    }

    for matched in &mut perturbed.planes {
        let d_sigma = matched.covariance.z.max(0.0).sqrt();
        let normal_vector = matched.map_plane.normal();
        let d = matched.map_plane.d() + d_sigma * normal.sample(rng);
        matched.map_plane =
            crate::geometry::coordinates::PlaneWorldCoordinates::new(normal_vector, d);
    }

    perturbed
}

/// Estimate the 6x6 covariance of an optimized pose over its inlier set.
///
/// Fails when fewer than half of the perturbed optimizations converge.
pub fn estimate_pose_covariance(
    optimized_pose: &Pose,
    inliers: &Matches,
    intrinsics: &CameraIntrinsics,
    params: &Parameters,
) -> Result<Matrix6<f64>, SlamError> {
    let iterations = params.ransac.covariance_iterations;
    if iterations == 0 || inliers.is_empty() {
        return Err(SlamError::InvalidInput(
            "pose covariance needs inliers and a positive iteration count".to_string(),
        ));
    }

    let base_position = optimized_pose.position();
    let base_orientation = optimized_pose.orientation();
    let base_seed = params.random_seed;

    // one result slot per iteration so the reduction order is fixed no
    // matter how the threads interleave
    let slots: Mutex<Vec<Option<Vector6<f64>>>> = Mutex::new(vec![None; iterations]);

    let worker_count = std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
        .min(8)
        .max(1);

    std::thread::scope(|scope| {
        for worker in 0..worker_count {
            let slots = &slots;
            scope.spawn(move || {
                let mut local: Vec<(usize, Vector6<f64>)> = Vec::new();
                for index in (worker..iterations).step_by(worker_count) {
                    let mut rng = StdRng::seed_from_u64(
                        base_seed ^ (0x9e37_79b9_7f4a_7c15_u64.wrapping_mul(index as u64 + 1)),
                    );
                    let perturbed = perturb_matches(inliers, &mut rng);
                    if let Ok((position, orientation)) = run_optimization(
                        &base_position,
                        &base_orientation,
                        &perturbed,
                        intrinsics,
                        params,
                    ) {
                        let rotation_delta = orientation * base_orientation.inverse();
                        let mut delta = Vector6::zeros();
                        delta
                            .fixed_rows_mut::<3>(0)
                            .copy_from(&(position - base_position));
                        delta
                            .fixed_rows_mut::<3>(3)
                            .copy_from(&scaled_axis_from_quaternion(&rotation_delta));
                        local.push((index, delta));
                    }
                }

                let mut slots = slots.lock();
                for (index, delta) in local {
                    slots[index] = Some(delta);
                }
            });
        }
    });

    let slots = slots.into_inner();
    let valid: Vec<Vector6<f64>> = slots.into_iter().flatten().collect();
    if valid.len() < iterations / 2 {
        return Err(SlamError::NonConvergence(format!(
            "only {}/{} perturbed optimizations converged",
            valid.len(),
            iterations
        )));
    }

    let count = valid.len() as f64;
    let mean: Vector6<f64> = valid.iter().sum::<Vector6<f64>>() / count;
    let mut covariance = Matrix6::zeros();
    for delta in &valid {
        let centered = delta - mean;
        covariance += centered * centered.transpose();
    }
    covariance /= count;
    covariance += Matrix6::identity() * COVARIANCE_JITTER;

    debug!(samples = valid.len(), "pose covariance estimated");
    Ok(covariance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::keypoints::FeatureId;
    use crate::geometry::coordinates::{ScreenCoordinate, WorldCoordinate};
    use crate::geometry::covariance::is_covariance_valid;
    use crate::map::matches::PointMatch;
    use nalgebra::{Matrix3, UnitQuaternion, Vector3};

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics {
            focal_x: 550.0,
            focal_y: 550.0,
            center_x: 320.0,
            center_y: 240.0,
        }
    }

    fn inlier_matches(pose: &Pose) -> Matches {
        let world_to_camera = pose.world_to_camera();
        let points = [
            Vector3::new(0.0, 0.0, 2000.0),
            Vector3::new(500.0, 300.0, 1800.0),
            Vector3::new(-400.0, 250.0, 2200.0),
            Vector3::new(300.0, -350.0, 2600.0),
            Vector3::new(-250.0, -150.0, 1500.0),
            Vector3::new(150.0, 400.0, 3000.0),
        ];

        let mut matches = Matches::default();
        for (index, point) in points.iter().enumerate() {
            let world = WorldCoordinate(*point);
            let screen = world
                .to_screen_coordinates(&intrinsics(), &world_to_camera)
                .unwrap();
            matches.points.push(PointMatch {
                screen: ScreenCoordinate::new(screen.u(), screen.v(), screen.z()),
                world,
                covariance: Matrix3::identity() * 9.0,
                id: FeatureId(index as u64 + 1),
                detected_index: index,
            });
        }
        matches
    }

    #[test]
    fn covariance_is_psd_and_bounded() {
        let pose = Pose::new(
            Vector3::new(10.0, 5.0, -3.0),
            UnitQuaternion::from_euler_angles(0.01, 0.02, 0.0),
        );
        let matches = inlier_matches(&pose);

        let mut params = Parameters::default();
        params.ransac.covariance_iterations = 20;

        let covariance =
            estimate_pose_covariance(&pose, &matches, &intrinsics(), &params).unwrap();

        assert!(is_covariance_valid(&covariance));
        // jitter keeps every diagonal entry strictly positive
        for index in 0..6 {
            assert!(covariance[(index, index)] >= COVARIANCE_JITTER * 0.99);
        }
        // 3 mm feature noise cannot produce meter-scale pose noise
        assert!(covariance[(0, 0)] < 1e4);
    }

    #[test]
    fn deterministic_given_seed() {
        let pose = Pose::default();
        let matches = inlier_matches(&pose);
        let mut params = Parameters::default();
        params.ransac.covariance_iterations = 10;

        let first = estimate_pose_covariance(&pose, &matches, &intrinsics(), &params).unwrap();
        let second = estimate_pose_covariance(&pose, &matches, &intrinsics(), &params).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_inliers_is_an_error() {
        let params = Parameters::default();
        assert!(estimate_pose_covariance(
            &Pose::default(),
            &Matches::default(),
            &intrinsics(),
            &params
        )
        .is_err());
    }
}
