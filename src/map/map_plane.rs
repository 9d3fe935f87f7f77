//! Planar map features with the staged/local lifecycle.
//!
//! A map plane lives in world coordinates as (nx, ny, nz, d) plus a
//! diagonal covariance over its (theta, phi, d) parameterization. Matching
//! happens in the camera frame against the primitive detector's output;
//! updates run a per-component scalar Kalman blend.

use nalgebra::Vector3;

use crate::config::{DetectionSection, MappingSection};
use crate::features::keypoints::FeatureId;
use crate::features::primitives::detector::DetectedPlane;
use crate::geometry::coordinates::{normal_spherical_angles, PlaneWorldCoordinates, WorldCoordinate};
use crate::geometry::pose::{CameraToWorld, WorldToCamera};

/// Process noise of the per-component plane filter.
const PLANE_PROCESS_NOISE: f64 = 1e-6;
/// Prior variance of the plane angles, in rad².
const PLANE_ANGLE_VARIANCE: f64 = 1e-4;

#[derive(Clone, Debug)]
pub struct MapPlane {
    pub id: FeatureId,
    plane: PlaneWorldCoordinates,
    /// (theta, phi, d) variances.
    covariance: Vector3<f64>,
    centroid: WorldCoordinate,
    pub color: [u8; 3],

    successive_matched: i32,
    failed_tracking: u32,
    pub match_index: Option<usize>,
}

impl MapPlane {
    /// Stage a detected plane observed from the given camera.
    pub fn from_detection(
        id: FeatureId,
        detected: &DetectedPlane,
        camera_to_world: &CameraToWorld,
        color: [u8; 3],
    ) -> Self {
        debug_assert!(id.is_valid());
        let plane = detected.plane.to_world_coordinates(camera_to_world);
        let centroid = WorldCoordinate(camera_to_world.transform_point(&detected.centroid));

        Self {
            id,
            plane,
            covariance: Vector3::new(
                PLANE_ANGLE_VARIANCE,
                PLANE_ANGLE_VARIANCE,
                detected.mse.max(1.0),
            ),
            centroid,
            color,
            successive_matched: 0,
            failed_tracking: 0,
            match_index: None,
        }
    }

    pub fn plane(&self) -> PlaneWorldCoordinates {
        self.plane
    }

    pub fn covariance(&self) -> Vector3<f64> {
        self.covariance
    }

    pub fn centroid(&self) -> WorldCoordinate {
        self.centroid
    }

    pub fn successive_matched(&self) -> i32 {
        self.successive_matched
    }

    /// Associate with the detected plane closest in normal direction and
    /// plane distance, gated by the merge thresholds.
    pub fn find_match(
        &self,
        detected: &[DetectedPlane],
        world_to_camera: &WorldToCamera,
        is_matched: &[bool],
        detection: &DetectionSection,
    ) -> Option<usize> {
        let projected = self.plane.to_camera_coordinates(world_to_camera);

        let mut best: Option<(usize, f64)> = None;
        for (index, candidate) in detected.iter().enumerate() {
            if is_matched[index] {
                continue;
            }
            let cos_angle = projected.normal().dot(&candidate.plane.normal());
            if cos_angle <= detection.primitive_maximum_cos_angle {
                continue;
            }
            let distance = (projected.d() - candidate.plane.d()).abs();
            if distance >= detection.primitive_maximum_merge_distance_mm {
                continue;
            }
            if best.map_or(true, |(_, best_distance)| distance < best_distance) {
                best = Some((index, distance));
            }
        }
        best.map(|(index, _)| index)
    }

    /// Blend the matched observation into the plane state, one scalar
    /// Kalman update per (theta, phi, d) component.
    pub fn update_with_match(&mut self, detected: &DetectedPlane, camera_to_world: &CameraToWorld) {
        let observed = detected.plane.to_world_coordinates(camera_to_world);

        let (state_theta, state_phi) = normal_spherical_angles(&self.plane.normal());
        let (observed_theta, observed_phi) = normal_spherical_angles(&observed.normal());
        let observation_variance = Vector3::new(
            PLANE_ANGLE_VARIANCE,
            PLANE_ANGLE_VARIANCE,
            detected.mse.max(1.0),
        );

        let mut state = Vector3::new(state_theta, state_phi, self.plane.d());
        let mut observation = Vector3::new(observed_theta, observed_phi, observed.d());
        // keep the phi blend on the short way around the circle
        let two_pi = 2.0 * std::f64::consts::PI;
        if (observation.y - state.y).abs() > std::f64::consts::PI {
            observation.y -= two_pi * (observation.y - state.y).signum();
        }

        for component in 0..3 {
            let predicted = self.covariance[component] + PLANE_PROCESS_NOISE;
            let gain = predicted / (predicted + observation_variance[component]);
            state[component] += gain * (observation[component] - state[component]);
            self.covariance[component] = (1.0 - gain) * predicted;
        }

        // rebuild the normal from the filtered angles
        let (sin_theta, cos_theta) = state.x.sin_cos();
        let (sin_phi, cos_phi) = state.y.sin_cos();
        let normal = Vector3::new(sin_theta * sin_phi, sin_theta * cos_phi, -cos_theta);
        self.plane = PlaneWorldCoordinates::new(normal, state.z);
        self.centroid = WorldCoordinate(camera_to_world.transform_point(&detected.centroid));

        self.successive_matched += 1;
        self.failed_tracking = 0;
    }

    pub fn update_no_match(&mut self) {
        self.successive_matched -= 1;
        self.failed_tracking += 1;
        self.match_index = None;
    }

    pub fn confidence(&self, mapping: &MappingSection) -> f64 {
        let confidence =
            self.successive_matched as f64 / mapping.point_staged_age_confidence as f64;
        confidence.clamp(-1.0, 1.0)
    }

    pub fn should_add_to_local_map(&self, mapping: &MappingSection) -> bool {
        self.confidence(mapping) > mapping.point_minimum_confidence_for_map
    }

    pub fn should_remove_from_staged(&self, mapping: &MappingSection) -> bool {
        self.confidence(mapping) <= 0.0
    }

    pub fn is_lost(&self, mapping: &MappingSection) -> bool {
        self.failed_tracking > mapping.point_unmatched_count_to_loose
    }

    pub fn promote(&mut self) {
        self.failed_tracking = 0;
    }
}
