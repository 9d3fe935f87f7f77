//! Keypoint match surface.
//!
//! The detector itself is an external collaborator behind the
//! [`FeatureExtractor`] trait; the engine consumes its output through
//! [`KeypointHandler`], which indexes the detected keypoints in a coarse
//! spatial grid and answers two kinds of queries: descriptor matching inside
//! a search window, and direct lookup of optical-flow-carried identities.

use std::collections::HashMap;

use image::GrayImage;

use crate::geometry::coordinates::{ScreenCoordinate, ScreenCoordinate2D};
use crate::DepthImage;

/// Binary descriptor length in bytes (256 bits).
pub const DESCRIPTOR_SIZE: usize = 32;

/// ORB-shaped binary descriptor.
pub type Descriptor = [u8; DESCRIPTOR_SIZE];

/// Normalized Hamming distance between two descriptors, in [0, 1].
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> f64 {
    let bits: u32 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum();
    bits as f64 / (DESCRIPTOR_SIZE as f64 * 8.0)
}

/// Unique identity of a map feature. `0` is reserved as invalid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeatureId(pub u64);

impl FeatureId {
    pub const INVALID: FeatureId = FeatureId(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

/// One detected keypoint: screen position with its depth sample (`z = 0`
/// when no valid depth), and the descriptor when extraction succeeded.
#[derive(Clone, Debug)]
pub struct DetectedKeypoint {
    pub coordinates: ScreenCoordinate,
    pub descriptor: Option<Descriptor>,
}

/// Map features retroprojected to screen space, handed to the extractor so
/// optical flow can carry their identities into the next frame.
#[derive(Clone, Debug, Default)]
pub struct TrackedKeypoints {
    pub ids: Vec<FeatureId>,
    pub points: Vec<ScreenCoordinate2D>,
}

impl TrackedKeypoints {
    pub fn push(&mut self, id: FeatureId, point: ScreenCoordinate2D) {
        self.ids.push(id);
        self.points.push(point);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Detected keypoints of one frame, indexed for matching.
#[derive(Clone, Debug)]
pub struct KeypointHandler {
    keypoints: Vec<DetectedKeypoint>,
    /// Identity carried from the previous frame by optical flow.
    tracked_ids: HashMap<FeatureId, usize>,
    grid: Vec<Vec<usize>>,
    cells_x: usize,
    cells_y: usize,
    cell_size: f64,
    max_match_distance: f64,
}

impl KeypointHandler {
    /// Index a frame's detections. `tracking_ids` runs parallel to
    /// `keypoints`; `Some(id)` marks a keypoint produced by optical-flow
    /// carry-forward of a map feature.
    pub fn new(
        keypoints: Vec<DetectedKeypoint>,
        tracking_ids: Vec<Option<FeatureId>>,
        width: usize,
        height: usize,
        cell_size: f64,
        max_match_distance: f64,
    ) -> Self {
        let cells_x = ((width as f64 / cell_size).ceil() as usize).max(1);
        let cells_y = ((height as f64 / cell_size).ceil() as usize).max(1);

        let mut grid = vec![Vec::new(); cells_x * cells_y];
        let mut tracked_ids = HashMap::new();

        for (index, keypoint) in keypoints.iter().enumerate() {
            let cell_x = ((keypoint.coordinates.u() / cell_size) as usize).min(cells_x - 1);
            let cell_y = ((keypoint.coordinates.v() / cell_size) as usize).min(cells_y - 1);
            grid[cell_y * cells_x + cell_x].push(index);
        }
        for (index, id) in tracking_ids.iter().enumerate() {
            if let Some(id) = id {
                if id.is_valid() {
                    tracked_ids.insert(*id, index);
                }
            }
        }

        Self {
            keypoints,
            tracked_ids,
            grid,
            cells_x,
            cells_y,
            cell_size,
            max_match_distance,
        }
    }

    /// An empty handler (no detections this frame).
    pub fn empty(width: usize, height: usize, cell_size: f64, max_match_distance: f64) -> Self {
        Self::new(Vec::new(), Vec::new(), width, height, cell_size, max_match_distance)
    }

    pub fn keypoint_count(&self) -> usize {
        self.keypoints.len()
    }

    pub fn keypoint(&self, index: usize) -> &DetectedKeypoint {
        &self.keypoints[index]
    }

    pub fn descriptor(&self, index: usize) -> Option<&Descriptor> {
        self.keypoints[index].descriptor.as_ref()
    }

    /// Depth of a keypoint in millimeters; 0 when no valid sample exists.
    pub fn depth(&self, index: usize) -> f64 {
        self.keypoints[index].coordinates.z()
    }

    /// Single nearest descriptor neighbor of `descriptor` among the
    /// unmatched keypoints within `radius` pixels of `projected`, accepted
    /// only below the maximum match distance.
    pub fn get_match_index(
        &self,
        projected: &ScreenCoordinate2D,
        descriptor: &Descriptor,
        is_matched: &[bool],
        radius: f64,
    ) -> Option<usize> {
        debug_assert_eq!(is_matched.len(), self.keypoints.len());

        let min_cell_x = (((projected.u() - radius) / self.cell_size).floor().max(0.0)) as usize;
        let min_cell_y = (((projected.v() - radius) / self.cell_size).floor().max(0.0)) as usize;
        let max_cell_x =
            ((((projected.u() + radius) / self.cell_size).floor()) as usize).min(self.cells_x - 1);
        let max_cell_y =
            ((((projected.v() + radius) / self.cell_size).floor()) as usize).min(self.cells_y - 1);

        let mut best: Option<(usize, f64)> = None;
        for cell_y in min_cell_y..=max_cell_y {
            for cell_x in min_cell_x..=max_cell_x {
                for &index in &self.grid[cell_y * self.cells_x + cell_x] {
                    if is_matched[index] {
                        continue;
                    }
                    let keypoint = &self.keypoints[index];
                    let du = keypoint.coordinates.u() - projected.u();
                    let dv = keypoint.coordinates.v() - projected.v();
                    if (du * du + dv * dv).sqrt() > radius {
                        continue;
                    }
                    let Some(candidate_descriptor) = keypoint.descriptor.as_ref() else {
                        continue;
                    };
                    let distance = descriptor_distance(descriptor, candidate_descriptor);
                    if distance < self.max_match_distance
                        && best.map_or(true, |(_, best_distance)| distance < best_distance)
                    {
                        best = Some((index, distance));
                    }
                }
            }
        }
        best.map(|(index, _)| index)
    }

    /// The keypoint produced by optical-flow carry-forward of a feature id,
    /// unless it was already consumed by another match.
    pub fn get_tracking_match_index(&self, id: FeatureId, is_matched: &[bool]) -> Option<usize> {
        let index = *self.tracked_ids.get(&id)?;
        if is_matched[index] {
            None
        } else {
            Some(index)
        }
    }
}

/// External keypoint detector + descriptor extractor + optical flow.
///
/// `tracked` carries the map features retroprojected by the local map;
/// `force_redetect` is raised on the refresh cadence and whenever tracking
/// was lost.
pub trait FeatureExtractor: Send + Sync {
    fn compute_keypoints(
        &self,
        gray: &GrayImage,
        depth: &DepthImage,
        tracked: &TrackedKeypoints,
        force_redetect: bool,
    ) -> KeypointHandler;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypoint(u: f64, v: f64, seed: u8) -> DetectedKeypoint {
        DetectedKeypoint {
            coordinates: ScreenCoordinate::new(u, v, 0.0),
            descriptor: Some([seed; DESCRIPTOR_SIZE]),
        }
    }

    fn handler(keypoints: Vec<DetectedKeypoint>, ids: Vec<Option<FeatureId>>) -> KeypointHandler {
        KeypointHandler::new(keypoints, ids, 640, 480, 50.0, 0.7)
    }

    #[test]
    fn descriptor_distance_is_normalized() {
        let zeros = [0u8; DESCRIPTOR_SIZE];
        let ones = [0xFFu8; DESCRIPTOR_SIZE];
        assert_eq!(descriptor_distance(&zeros, &zeros), 0.0);
        assert_eq!(descriptor_distance(&zeros, &ones), 1.0);
    }

    #[test]
    fn match_prefers_nearest_descriptor() {
        let handler = handler(
            vec![keypoint(100.0, 100.0, 0x00), keypoint(105.0, 100.0, 0x0F)],
            vec![None, None],
        );

        let query = [0x0Fu8; DESCRIPTOR_SIZE];
        let matched = vec![false, false];
        let found = handler.get_match_index(
            &ScreenCoordinate2D::new(102.0, 100.0),
            &query,
            &matched,
            30.0,
        );
        assert_eq!(found, Some(1));
    }

    #[test]
    fn match_respects_radius() {
        let handler = handler(vec![keypoint(100.0, 100.0, 0x00)], vec![None]);
        let query = [0x00u8; DESCRIPTOR_SIZE];
        let matched = vec![false];

        assert_eq!(
            handler.get_match_index(
                &ScreenCoordinate2D::new(400.0, 400.0),
                &query,
                &matched,
                30.0
            ),
            None
        );
    }

    #[test]
    fn match_skips_already_matched() {
        let handler = handler(vec![keypoint(100.0, 100.0, 0x00)], vec![None]);
        let query = [0x00u8; DESCRIPTOR_SIZE];

        assert_eq!(
            handler.get_match_index(
                &ScreenCoordinate2D::new(100.0, 100.0),
                &query,
                &[true],
                30.0
            ),
            None
        );
    }

    #[test]
    fn match_rejects_distant_descriptor() {
        let handler = handler(vec![keypoint(100.0, 100.0, 0xFF)], vec![None]);
        let query = [0x00u8; DESCRIPTOR_SIZE];

        assert_eq!(
            handler.get_match_index(
                &ScreenCoordinate2D::new(100.0, 100.0),
                &query,
                &[false],
                30.0
            ),
            None
        );
    }

    #[test]
    fn tracking_id_lookup() {
        let handler = handler(
            vec![keypoint(10.0, 10.0, 1), keypoint(20.0, 20.0, 2)],
            vec![None, Some(FeatureId(42))],
        );

        assert_eq!(
            handler.get_tracking_match_index(FeatureId(42), &[false, false]),
            Some(1)
        );
        assert_eq!(
            handler.get_tracking_match_index(FeatureId(42), &[false, true]),
            None
        );
        assert_eq!(
            handler.get_tracking_match_index(FeatureId(7), &[false, false]),
            None
        );
    }
}
