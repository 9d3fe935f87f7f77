//! Inverse-depth map points with the staged/local lifecycle.
//!
//! These features track 2D observations only: a matched keypoint updates
//! the state through the 2D path whether or not its depth sample is valid
//! (the depth information enters the map when the point upgrades to 3D).

use nalgebra::Matrix3;

use crate::config::{DetectionSection, MappingSection, MatchingSection};
use crate::error::Result;
use crate::features::keypoints::{Descriptor, FeatureId, KeypointHandler};
use crate::geometry::coordinates::{CameraIntrinsics, WorldCoordinate};
use crate::geometry::pose::{CameraToWorld, WorldToCamera};
use crate::tracking::inverse_depth::PointInverseDepth;
use crate::tracking::kalman::SharedKalmanFilter;

#[derive(Clone, Debug)]
pub struct MapPoint2D {
    pub id: FeatureId,
    point: PointInverseDepth,
    pub descriptor: Descriptor,
    pub color: [u8; 3],

    successive_matched: i32,
    failed_tracking: u32,
    pub match_index: Option<usize>,
}

impl MapPoint2D {
    pub fn new(
        id: FeatureId,
        point: PointInverseDepth,
        descriptor: Descriptor,
        color: [u8; 3],
    ) -> Self {
        debug_assert!(id.is_valid());
        Self {
            id,
            point,
            descriptor,
            color,
            successive_matched: 0,
            failed_tracking: 0,
            match_index: None,
        }
    }

    pub fn point(&self) -> &PointInverseDepth {
        &self.point
    }

    pub fn successive_matched(&self) -> i32 {
        self.successive_matched
    }

    pub fn failed_tracking(&self) -> u32 {
        self.failed_tracking
    }

    /// Cartesian estimate of the current state.
    pub fn world_estimate(&self) -> WorldCoordinate {
        self.point.coordinates().to_world_coordinates()
    }

    /// Tracking-id match first, then a windowed descriptor search around
    /// the projected cartesian estimate.
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

        let radius = if self.failed_tracking > 0 {
            matching.match_search_radius_px * 2.0
        } else {
            matching.match_search_radius_px
        };

        let projected = self
            .world_estimate()
            .to_screen_coordinates(intrinsics, world_to_camera)?;
        detected.get_match_index(&projected.as_2d(), &self.descriptor, is_matched, radius)
    }

    /// Track the matched keypoint through the 2D observation path.
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
        self.point.track_2d(
            filter,
            &keypoint.coordinates.as_2d(),
            intrinsics,
            camera_to_world,
            pose_covariance,
            detection.inverse_depth_baseline,
            detection.inverse_depth_angle_baseline,
        )?;

        if let Some(descriptor) = keypoint.descriptor {
            self.descriptor = descriptor;
        }
        self.successive_matched += 1;
        self.failed_tracking = 0;
        Ok(())
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

    /// Cartesian position and covariance when the accumulated parallax
    /// makes the conversion safe.
    pub fn compute_upgraded(
        &self,
        camera_to_world: &CameraToWorld,
        mapping: &MappingSection,
    ) -> Result<Option<(WorldCoordinate, Matrix3<f64>)>> {
        self.point.upgrade(camera_to_world, mapping.linearity_threshold)
    }
}
