//! 3D map points with the staged/local lifecycle.
//!
//! A point enters the map staged; successive matches raise its confidence
//! until promotion, failed trackings age it out. The same structure backs
//! both stages, the containers in the local map decide which predicates
//! apply.

use nalgebra::Matrix3;

use crate::config::{DetectionSection, MappingSection, MatchingSection};
use crate::error::Result;
use crate::features::keypoints::{Descriptor, FeatureId, KeypointHandler};
use crate::geometry::coordinates::{
    is_depth_valid, CameraIntrinsics, ScreenCoordinate2D, WorldCoordinate,
};
use crate::geometry::covariance::world_point_covariance;
use crate::geometry::pose::{CameraToWorld, WorldToCamera};
use crate::tracking::kalman::SharedKalmanFilter;
use crate::tracking::point::PointTracker;

#[derive(Clone, Debug)]
pub struct MapPoint {
    pub id: FeatureId,
    tracker: PointTracker,
    pub descriptor: Descriptor,
    pub color: [u8; 3],

    successive_matched: i32,
    failed_tracking: u32,
    /// Detected keypoint consumed by this feature in the current frame.
    pub match_index: Option<usize>,
    /// Screen position of the last successful match, for optical flow.
    pub last_match_screen: Option<ScreenCoordinate2D>,
}

impl MapPoint {
    pub fn new(
        id: FeatureId,
        coordinates: WorldCoordinate,
        covariance: Matrix3<f64>,
        descriptor: Descriptor,
        color: [u8; 3],
    ) -> Self {
        debug_assert!(id.is_valid());
        Self {
            id,
            tracker: PointTracker::new(coordinates, covariance),
            descriptor,
            color,
            successive_matched: 0,
            failed_tracking: 0,
            match_index: None,
            last_match_screen: None,
        }
    }

    pub fn coordinates(&self) -> WorldCoordinate {
        self.tracker.coordinates()
    }

    pub fn covariance(&self) -> Matrix3<f64> {
        self.tracker.covariance()
    }

    pub fn successive_matched(&self) -> i32 {
        self.successive_matched
    }

    pub fn failed_tracking(&self) -> u32 {
        self.failed_tracking
    }

    /// Associate this feature with a detected keypoint: the optical-flow
    /// carried identity wins, otherwise a windowed descriptor search around
    /// the retroprojection. The search radius doubles after a failed frame.
    pub fn find_match(
        &self,
        detected: &KeypointHandler,
        intrinsics: &CameraIntrinsics,
        world_to_camera: &WorldToCamera,
        is_matched: &[bool],
        matching: &MatchingSection,
    ) -> Option<usize> {
        if let Some(index) = detected.get_tracking_match_index(self.id, is_matched) {
            return Some(index);
        }

        let use_advanced_search = self.failed_tracking > 0;
        let radius = if use_advanced_search {
            matching.match_search_radius_px * 2.0
        } else {
            matching.match_search_radius_px
        };

        let projected = self
            .coordinates()
            .to_screen_coordinates(intrinsics, world_to_camera)?;
        detected.get_match_index(&projected.as_2d(), &self.descriptor, is_matched, radius)
    }

    /// Kalman-track the matched observation. An observation without valid
    /// depth cannot constrain the 3D position and only refreshes the
    /// descriptor and counters.
    pub fn update_with_match(
        &mut self,
        filter: &SharedKalmanFilter<3>,
        detected: &KeypointHandler,
        pose_covariance: &Matrix3<f64>,
        camera_to_world: &CameraToWorld,
        intrinsics: &CameraIntrinsics,
        detection: &DetectionSection,
    ) -> Result<()> {
        let index = self.match_index.ok_or_else(|| {
            crate::error::SlamError::ContractViolation(
                "update_with_match called with no associated match".to_string(),
            )
        })?;

        let keypoint = detected.keypoint(index);
        if is_depth_valid(keypoint.coordinates.z()) {
            let observed =
                keypoint.coordinates.to_world_coordinates(intrinsics, camera_to_world);
            let observation_covariance = world_point_covariance(
                &keypoint.coordinates,
                intrinsics,
                camera_to_world,
                pose_covariance,
                detection.depth_sigma_error,
            )?;
            self.tracker.track(filter, &observed, &observation_covariance)?;
        }

        if let Some(descriptor) = keypoint.descriptor {
            self.descriptor = descriptor;
        }
        self.successive_matched += 1;
        self.failed_tracking = 0;
        self.last_match_screen = Some(keypoint.coordinates.as_2d());
        Ok(())
    }

    pub fn update_no_match(&mut self) {
        self.successive_matched -= 1;
        self.failed_tracking += 1;
        self.match_index = None;
    }

    /// Staged confidence in [-1, 1].
    pub fn confidence(&self, mapping: &MappingSection) -> f64 {
        let confidence =
            self.successive_matched as f64 / mapping.point_staged_age_confidence as f64;
        confidence.clamp(-1.0, 1.0)
    }

    /// Long-term confidence of a promoted point, against the slower local
    /// aging divisor.
    pub fn age_confidence(&self, mapping: &MappingSection) -> f64 {
        let confidence = self.successive_matched as f64 / mapping.point_age_confidence as f64;
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

    /// Promotion keeps the id and the track but restarts the aging.
    pub fn promote(&mut self) {
        self.failed_tracking = 0;
    }
}
