//! The local map: exclusive owner of staged and promoted features.
//!
//! Per frame it answers data association against the detected feature sets,
//! consumes the optimized pose to Kalman-update matched features, ages and
//! evicts unmatched ones, promotes staged features, stages fresh detections
//! and upgrades inverse-depth points that have gathered enough parallax.
//! It is mutated by a single caller between frames.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use nalgebra::Matrix3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::config::Parameters;
use crate::error::SlamError;
use crate::features::keypoints::{FeatureId, KeypointHandler, TrackedKeypoints};
use crate::features::lines::DetectedLine;
use crate::features::primitives::detector::DetectedPrimitives;
use crate::geometry::coordinates::{is_depth_valid, CameraIntrinsics};
use crate::geometry::covariance::world_point_covariance;
use crate::geometry::pose::Pose;
use crate::map::map_plane::MapPlane;
use crate::map::map_point::MapPoint;
use crate::map::map_point2d::MapPoint2D;
use crate::map::matches::{Matches, PlaneMatch, Point2DMatch, PointMatch};
use crate::tracking::inverse_depth::PointInverseDepth;
use crate::tracking::kalman::SharedKalmanFilter;

/// Joined output of the three per-frame detectors.
pub struct DetectedFeatures {
    pub keypoints: KeypointHandler,
    pub primitives: DetectedPrimitives,
    pub lines: Vec<DetectedLine>,
}

pub struct LocalMap {
    params: Parameters,
    intrinsics: CameraIntrinsics,
    filter: SharedKalmanFilter<3>,

    staged_points: Vec<MapPoint>,
    local_points: Vec<MapPoint>,
    staged_points_2d: Vec<MapPoint2D>,
    local_points_2d: Vec<MapPoint2D>,
    staged_planes: Vec<MapPlane>,
    local_planes: Vec<MapPlane>,

    /// Monotonic feature id source; 0 stays reserved as invalid.
    next_id: AtomicU64,
    color_rng: StdRng,
}

impl LocalMap {
    pub fn new(params: &Parameters) -> Self {
        Self {
            intrinsics: params.intrinsics(),
            filter: SharedKalmanFilter::for_static_point(),
            staged_points: Vec::new(),
            local_points: Vec::new(),
            staged_points_2d: Vec::new(),
            local_points_2d: Vec::new(),
            staged_planes: Vec::new(),
            local_planes: Vec::new(),
            next_id: AtomicU64::new(1),
            color_rng: StdRng::seed_from_u64(params.random_seed ^ 0x6c6f_6361),
            params: params.clone(),
        }
    }

    fn next_feature_id(&self) -> FeatureId {
        FeatureId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn next_color(&mut self) -> [u8; 3] {
        [
            self.color_rng.gen_range(60..=255),
            self.color_rng.gen_range(60..=255),
            self.color_rng.gen_range(60..=255),
        ]
    }

    /// Hard reset: forget every feature.
    pub fn reset(&mut self) {
        self.staged_points.clear();
        self.local_points.clear();
        self.staged_points_2d.clear();
        self.local_points_2d.clear();
        self.staged_planes.clear();
        self.local_planes.clear();
    }

    pub fn local_point_count(&self) -> usize {
        self.local_points.len()
    }

    pub fn staged_point_count(&self) -> usize {
        self.staged_points.len() + self.staged_points_2d.len()
    }

    pub fn local_point_2d_count(&self) -> usize {
        self.local_points_2d.len()
    }

    pub fn local_plane_count(&self) -> usize {
        self.local_planes.len()
    }

    pub fn local_planes(&self) -> &[MapPlane] {
        &self.local_planes
    }

    pub fn local_points(&self) -> &[MapPoint] {
        &self.local_points
    }

    pub fn staged_points(&self) -> &[MapPoint] {
        &self.staged_points
    }

    pub fn local_points_2d(&self) -> &[MapPoint2D] {
        &self.local_points_2d
    }

    pub fn mapping(&self) -> &crate::config::MappingSection {
        &self.params.mapping
    }

    /// Associate every local and staged feature with the detections.
    /// Local features search first so they get first pick of the keypoints.
    pub fn find_feature_matches(
        &mut self,
        predicted_pose: &Pose,
        detected: &DetectedFeatures,
    ) -> Matches {
        let world_to_camera = predicted_pose.world_to_camera();
        let mut matches = Matches::default();
        let mut keypoint_matched = vec![false; detected.keypoints.keypoint_count()];
        let mut plane_matched = vec![false; detected.primitives.planes.len()];

        let intrinsics = self.intrinsics;
        let matching = self.params.matching.clone();
        let detection = self.params.detection.clone();

        for point in self.local_points.iter_mut().chain(self.staged_points.iter_mut()) {
            point.match_index = None;
            if let Some(index) = point.find_match(
                &detected.keypoints,
                &intrinsics,
                &world_to_camera,
                &keypoint_matched,
                &matching,
            ) {
                keypoint_matched[index] = true;
                point.match_index = Some(index);
                matches.points.push(PointMatch {
                    screen: detected.keypoints.keypoint(index).coordinates,
                    world: point.coordinates(),
                    covariance: point.covariance(),
                    id: point.id,
                    detected_index: index,
                });
            }
        }

        for point in self
            .local_points_2d
            .iter_mut()
            .chain(self.staged_points_2d.iter_mut())
        {
            point.match_index = None;
            if let Some(index) = point.find_match(
                &detected.keypoints,
                &intrinsics,
                &world_to_camera,
                &keypoint_matched,
                &matching,
            ) {
                keypoint_matched[index] = true;
                point.match_index = Some(index);
                matches.points_2d.push(Point2DMatch {
                    screen: detected.keypoints.keypoint(index).coordinates.as_2d(),
                    coordinates: *point.point().coordinates(),
                    covariance: *point.point().covariance(),
                    id: point.id,
                    detected_index: index,
                });
            }
        }

        for plane in self.local_planes.iter_mut().chain(self.staged_planes.iter_mut()) {
            plane.match_index = None;
            if let Some(index) = plane.find_match(
                &detected.primitives.planes,
                &world_to_camera,
                &plane_matched,
                &detection,
            ) {
                plane_matched[index] = true;
                plane.match_index = Some(index);
                matches.planes.push(PlaneMatch {
                    detected: detected.primitives.planes[index].plane,
                    map_plane: plane.plane(),
                    covariance: plane.covariance(),
                    id: plane.id,
                    detected_index: index,
                });
            }
        }

        debug!(
            points = matches.points.len(),
            points_2d = matches.points_2d.len(),
            planes = matches.planes.len(),
            "feature association done"
        );
        matches
    }

    /// Consume the optimized pose: track matched features, age unmatched
    /// ones, evict, promote, stage the leftover detections and run the
    /// inverse-depth upgrade pass.
    pub fn update(
        &mut self,
        optimized_pose: &Pose,
        detected: &DetectedFeatures,
        point_outliers: &HashSet<FeatureId>,
        plane_outliers: &HashSet<FeatureId>,
    ) {
        let camera_to_world = optimized_pose.camera_to_world();
        let pose_covariance = optimized_pose.position_covariance();
        let mapping = self.params.mapping.clone();
        let detection = self.params.detection.clone();
        let intrinsics = self.intrinsics;
        let filter = self.filter.clone();

        // 1-3: locals, then 4: the same treatment for staged features
        let mut consumed = vec![false; detected.keypoints.keypoint_count()];

        for point in self.local_points.iter_mut().chain(self.staged_points.iter_mut()) {
            let matched = point.match_index.is_some() && !point_outliers.contains(&point.id);
            if matched {
                consumed[point.match_index.unwrap()] = true;
                if let Err(error) = point.update_with_match(
                    &filter,
                    &detected.keypoints,
                    &pose_covariance,
                    &camera_to_world,
                    &intrinsics,
                    &detection,
                ) {
                    warn!(id = point.id.0, %error, "dropping point after failed track");
                    point.match_index = None;
                    point.update_no_match();
                }
            } else {
                if let Some(index) = point.match_index {
                    consumed[index] = true; // outlier observation stays consumed
                }
                point.update_no_match();
            }
        }

        for point in self
            .local_points_2d
            .iter_mut()
            .chain(self.staged_points_2d.iter_mut())
        {
            let matched = point.match_index.is_some() && !point_outliers.contains(&point.id);
            if matched {
                consumed[point.match_index.unwrap()] = true;
                if let Err(error) = point.update_with_match(
                    &filter,
                    &detected.keypoints,
                    &pose_covariance,
                    &camera_to_world,
                    &intrinsics,
                    &detection,
                ) {
                    warn!(id = point.id.0, %error, "dropping 2d point after failed track");
                    point.match_index = None;
                    point.update_no_match();
                }
            } else {
                if let Some(index) = point.match_index {
                    consumed[index] = true;
                }
                point.update_no_match();
            }
        }

        let mut plane_consumed = vec![false; detected.primitives.planes.len()];
        for plane in self.local_planes.iter_mut().chain(self.staged_planes.iter_mut()) {
            let matched = plane.match_index.is_some() && !plane_outliers.contains(&plane.id);
            if matched {
                let index = plane.match_index.unwrap();
                plane_consumed[index] = true;
                plane.update_with_match(&detected.primitives.planes[index], &camera_to_world);
            } else {
                if let Some(index) = plane.match_index {
                    plane_consumed[index] = true;
                }
                plane.update_no_match();
            }
        }

        self.evict_and_promote();

        // 5: stage the detections no feature consumed
        self.stage_new_points(detected, &consumed, &pose_covariance, &camera_to_world, &detection);
        self.stage_new_planes(detected, &plane_consumed, &camera_to_world);

        // 6: upgrade inverse-depth locals with enough parallax
        self.upgrade_points_2d(&camera_to_world, &mapping);
    }

    /// No optimized pose this frame: age every feature, stage nothing.
    pub fn update_no_pose(&mut self) {
        for point in self.local_points.iter_mut().chain(self.staged_points.iter_mut()) {
            point.update_no_match();
        }
        for point in self
            .local_points_2d
            .iter_mut()
            .chain(self.staged_points_2d.iter_mut())
        {
            point.update_no_match();
        }
        for plane in self.local_planes.iter_mut().chain(self.staged_planes.iter_mut()) {
            plane.update_no_match();
        }
        self.evict_and_promote();
    }

    fn evict_and_promote(&mut self) {
        let mapping = self.params.mapping.clone();

        self.local_points.retain(|point| !point.is_lost(&mapping));
        self.local_points_2d.retain(|point| !point.is_lost(&mapping));
        self.local_planes.retain(|plane| !plane.is_lost(&mapping));

        let mut index = 0;
        while index < self.staged_points.len() {
            if self.staged_points[index].should_add_to_local_map(&mapping) {
                let mut point = self.staged_points.swap_remove(index);
                point.promote();
                self.local_points.push(point);
            } else if self.staged_points[index].should_remove_from_staged(&mapping) {
                self.staged_points.swap_remove(index);
            } else {
                index += 1;
            }
        }

        let mut index = 0;
        while index < self.staged_points_2d.len() {
            if self.staged_points_2d[index].should_add_to_local_map(&mapping) {
                let mut point = self.staged_points_2d.swap_remove(index);
                point.promote();
                self.local_points_2d.push(point);
            } else if self.staged_points_2d[index].should_remove_from_staged(&mapping) {
                self.staged_points_2d.swap_remove(index);
            } else {
                index += 1;
            }
        }

        let mut index = 0;
        while index < self.staged_planes.len() {
            if self.staged_planes[index].should_add_to_local_map(&mapping) {
                let mut plane = self.staged_planes.swap_remove(index);
                plane.promote();
                self.local_planes.push(plane);
            } else if self.staged_planes[index].should_remove_from_staged(&mapping) {
                self.staged_planes.swap_remove(index);
            } else {
                index += 1;
            }
        }
    }

    fn stage_new_points(
        &mut self,
        detected: &DetectedFeatures,
        consumed: &[bool],
        pose_covariance: &Matrix3<f64>,
        camera_to_world: &crate::geometry::pose::CameraToWorld,
        detection: &crate::config::DetectionSection,
    ) {
        for index in 0..detected.keypoints.keypoint_count() {
            if consumed[index] {
                continue;
            }
            let keypoint = detected.keypoints.keypoint(index).clone();
            let Some(descriptor) = keypoint.descriptor else {
                continue; // a feature without descriptor can never be re-found
            };

            if is_depth_valid(keypoint.coordinates.z()) {
                let world = keypoint
                    .coordinates
                    .to_world_coordinates(&self.intrinsics, camera_to_world);
                match world_point_covariance(
                    &keypoint.coordinates,
                    &self.intrinsics,
                    camera_to_world,
                    pose_covariance,
                    detection.depth_sigma_error,
                ) {
                    Ok(covariance) => {
                        let id = self.next_feature_id();
                        let color = self.next_color();
                        self.staged_points
                            .push(MapPoint::new(id, world, covariance, descriptor, color));
                    }
                    Err(error) => {
                        debug!(%error, "skipping keypoint with degenerate covariance");
                    }
                }
            } else {
                match PointInverseDepth::new(
                    &keypoint.coordinates.as_2d(),
                    &self.intrinsics,
                    camera_to_world,
                    pose_covariance,
                    detection.inverse_depth_baseline,
                    detection.inverse_depth_angle_baseline,
                ) {
                    Ok(point) => {
                        let id = self.next_feature_id();
                        let color = self.next_color();
                        self.staged_points_2d
                            .push(MapPoint2D::new(id, point, descriptor, color));
                    }
                    Err(error) => {
                        debug!(%error, "skipping depthless keypoint");
                    }
                }
            }
        }
    }

    fn stage_new_planes(
        &mut self,
        detected: &DetectedFeatures,
        consumed: &[bool],
        camera_to_world: &crate::geometry::pose::CameraToWorld,
    ) {
        for (index, plane) in detected.primitives.planes.iter().enumerate() {
            if consumed[index] {
                continue;
            }
            let id = self.next_feature_id();
            let color = self.next_color();
            self.staged_planes
                .push(MapPlane::from_detection(id, plane, camera_to_world, color));
        }
    }

    fn upgrade_points_2d(
        &mut self,
        camera_to_world: &crate::geometry::pose::CameraToWorld,
        mapping: &crate::config::MappingSection,
    ) {
        let mut index = 0;
        while index < self.local_points_2d.len() {
            let upgraded = match self.local_points_2d[index].compute_upgraded(camera_to_world, mapping)
            {
                Ok(upgraded) => upgraded,
                Err(error) => {
                    warn!(%error, "dropping 2d point with degenerate upgrade");
                    self.local_points_2d.swap_remove(index);
                    continue;
                }
            };

            if let Some((coordinates, covariance)) = upgraded {
                let old = self.local_points_2d.swap_remove(index);
                debug!(id = old.id.0, "upgrading inverse-depth point to cartesian");
                let mut point =
                    MapPoint::new(old.id, coordinates, covariance, old.descriptor, old.color);
                point.match_index = old.match_index;
                self.local_points.push(point);
            } else {
                index += 1;
            }
        }
    }

    /// All detections become staged features, matches or not; used to
    /// reseed the map when tracking is lost.
    pub fn add_features_to_map(&mut self, pose: &Pose, detected: &DetectedFeatures) {
        let camera_to_world = pose.camera_to_world();
        let pose_covariance = pose.position_covariance();
        let detection = self.params.detection.clone();
        let no_consumed = vec![false; detected.keypoints.keypoint_count()];
        let no_consumed_planes = vec![false; detected.primitives.planes.len()];

        self.stage_new_points(
            detected,
            &no_consumed,
            &pose_covariance,
            &camera_to_world,
            &detection,
        );
        self.stage_new_planes(detected, &no_consumed_planes, &camera_to_world);
    }

    /// Retroproject the last-matched local points to screen space so the
    /// extractor can carry their identities forward with optical flow.
    pub fn get_tracked_keypoints(&self, pose: &Pose) -> TrackedKeypoints {
        let world_to_camera = pose.world_to_camera();
        let mut tracked = TrackedKeypoints::default();
        for point in &self.local_points {
            if let Some(screen) = point
                .coordinates()
                .to_screen_coordinates(&self.intrinsics, &world_to_camera)
            {
                tracked.push(point.id, screen.as_2d());
            }
        }
        tracked
    }

    /// Contract check used by debug builds and tests.
    pub fn assert_ids_unique(&self) -> Result<(), SlamError> {
        let mut seen = HashSet::new();
        let all_unique = self
            .local_points
            .iter()
            .map(|p| p.id)
            .chain(self.staged_points.iter().map(|p| p.id))
            .chain(self.local_points_2d.iter().map(|p| p.id))
            .chain(self.staged_points_2d.iter().map(|p| p.id))
            .chain(self.local_planes.iter().map(|p| p.id))
            .chain(self.staged_planes.iter().map(|p| p.id))
            .all(|id| id.is_valid() && seen.insert(id));
        if all_unique {
            Ok(())
        } else {
            Err(SlamError::ContractViolation(
                "duplicate or invalid feature id in the local map".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::keypoints::{DetectedKeypoint, DESCRIPTOR_SIZE};
    use crate::geometry::coordinates::ScreenCoordinate;

    fn params() -> Parameters {
        Parameters::default()
    }

    fn keypoints(entries: &[(f64, f64, f64, u8)]) -> KeypointHandler {
        let keypoints = entries
            .iter()
            .map(|&(u, v, z, seed)| DetectedKeypoint {
                coordinates: ScreenCoordinate::new(u, v, z),
                descriptor: Some([seed; DESCRIPTOR_SIZE]),
            })
            .collect();
        KeypointHandler::new(
            keypoints,
            vec![None; entries.len()],
            640,
            480,
            50.0,
            0.7,
        )
    }

    fn detections(entries: &[(f64, f64, f64, u8)]) -> DetectedFeatures {
        DetectedFeatures {
            keypoints: keypoints(entries),
            primitives: DetectedPrimitives::default(),
            lines: Vec::new(),
        }
    }

    #[test]
    fn unmatched_detections_become_staged() {
        let mut map = LocalMap::new(&params());
        let pose = Pose::default();
        let detected = detections(&[
            (100.0, 100.0, 1500.0, 0x01), // valid depth -> 3d staged
            (200.0, 200.0, 0.0, 0x02),    // no depth -> inverse-depth staged
        ]);

        let matches = map.find_feature_matches(&pose, &detected);
        assert!(matches.is_empty());

        map.update(&pose, &detected, &HashSet::new(), &HashSet::new());
        assert_eq!(map.staged_points.len(), 1);
        assert_eq!(map.staged_points_2d.len(), 1);
        map.assert_ids_unique().unwrap();
    }

    #[test]
    fn repeated_matches_promote_staged_to_local() {
        let mut map = LocalMap::new(&params());
        let pose = Pose::default();
        let detected = detections(&[(320.0, 240.0, 2000.0, 0x05)]);

        map.update(&pose, &detected, &HashSet::new(), &HashSet::new());
        assert_eq!(map.staged_points.len(), 1);

        // promotion needs confidence > 0.9: eleven successive matches
        for _ in 0..11 {
            let matches = map.find_feature_matches(&pose, &detected);
            assert_eq!(matches.points.len(), 1);
            map.update(&pose, &detected, &HashSet::new(), &HashSet::new());
        }
        assert_eq!(map.local_point_count(), 1);
        assert_eq!(map.staged_points.len(), 0);
    }

    #[test]
    fn staged_features_die_without_matches() {
        let mut map = LocalMap::new(&params());
        let pose = Pose::default();
        map.update(
            &pose,
            &detections(&[(100.0, 100.0, 1000.0, 0x09)]),
            &HashSet::new(),
            &HashSet::new(),
        );
        assert_eq!(map.staged_point_count(), 1);

        // the next frame sees nothing: staged confidence drops to <= 0
        let empty = detections(&[]);
        map.find_feature_matches(&pose, &empty);
        map.update(&pose, &empty, &HashSet::new(), &HashSet::new());
        assert_eq!(map.staged_point_count(), 0);
    }

    #[test]
    fn outlier_matches_are_not_tracked_but_stay_consumed() {
        let mut map = LocalMap::new(&params());
        let pose = Pose::default();
        let detected = detections(&[(320.0, 240.0, 2000.0, 0x05)]);
        map.update(&pose, &detected, &HashSet::new(), &HashSet::new());

        let matches = map.find_feature_matches(&pose, &detected);
        let outlier_id = matches.points[0].id;
        let outliers: HashSet<FeatureId> = [outlier_id].into_iter().collect();

        map.update(&pose, &detected, &outliers, &HashSet::new());
        // the feature aged out instead of matching, and the keypoint it
        // consumed was not re-staged as a fresh feature
        assert_eq!(map.staged_point_count(), 0);
    }

    #[test]
    fn update_no_pose_ages_everything_and_stages_nothing() {
        let mut map = LocalMap::new(&params());
        let pose = Pose::default();
        map.update(
            &pose,
            &detections(&[(150.0, 150.0, 1200.0, 0x11)]),
            &HashSet::new(),
            &HashSet::new(),
        );
        let staged_before = map.staged_point_count();

        map.update_no_pose();
        // aged once: confidence dropped to <= 0, staged evicted
        assert!(map.staged_point_count() < staged_before);
    }

    #[test]
    fn tracked_keypoints_only_cover_visible_locals() {
        let mut map = LocalMap::new(&params());
        let pose = Pose::default();
        let detected = detections(&[(320.0, 240.0, 2000.0, 0x05)]);
        for _ in 0..12 {
            map.find_feature_matches(&pose, &detected);
            map.update(&pose, &detected, &HashSet::new(), &HashSet::new());
        }
        assert_eq!(map.local_point_count(), 1);

        let tracked = map.get_tracked_keypoints(&pose);
        assert_eq!(tracked.len(), 1);
        assert!((tracked.points[0].u() - 320.0).abs() < 2.0);
    }
}
