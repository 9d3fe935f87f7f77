//! Match containers handed from data association to the pose optimizer and
//! back (with the inlier/outlier partition).

use nalgebra::{Matrix3, Matrix6};

use crate::features::keypoints::FeatureId;
use crate::geometry::coordinates::{
    PlaneCameraCoordinates, PlaneWorldCoordinates, ScreenCoordinate, ScreenCoordinate2D,
    WorldCoordinate,
};
use crate::tracking::inverse_depth::InverseDepthCoordinates;

/// A 3D map point associated with a detected keypoint.
#[derive(Clone, Debug)]
pub struct PointMatch {
    /// Observed keypoint; `z` is the depth sample (0 when invalid).
    pub screen: ScreenCoordinate,
    /// Map feature position.
    pub world: WorldCoordinate,
    /// Map feature covariance.
    pub covariance: Matrix3<f64>,
    pub id: FeatureId,
    /// Index of the consumed detected keypoint.
    pub detected_index: usize,
}

/// An inverse-depth map point associated with a detected keypoint.
#[derive(Clone, Debug)]
pub struct Point2DMatch {
    pub screen: ScreenCoordinate2D,
    pub coordinates: InverseDepthCoordinates,
    pub covariance: Matrix6<f64>,
    pub id: FeatureId,
    pub detected_index: usize,
}

/// A map plane associated with a detected plane.
#[derive(Clone, Debug)]
pub struct PlaneMatch {
    pub detected: PlaneCameraCoordinates,
    pub map_plane: PlaneWorldCoordinates,
    /// Per-component variances of the (theta, phi, d) parameterization.
    pub covariance: nalgebra::Vector3<f64>,
    pub id: FeatureId,
    pub detected_index: usize,
}

/// All feature associations of one frame.
#[derive(Clone, Debug, Default)]
pub struct Matches {
    pub points: Vec<PointMatch>,
    pub points_2d: Vec<Point2DMatch>,
    pub planes: Vec<PlaneMatch>,
}

impl Matches {
    pub fn len(&self) -> usize {
        self.points.len() + self.points_2d.len() + self.planes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Feature ids of every contained match.
    pub fn feature_ids(&self) -> impl Iterator<Item = FeatureId> + '_ {
        self.points
            .iter()
            .map(|m| m.id)
            .chain(self.points_2d.iter().map(|m| m.id))
            .chain(self.planes.iter().map(|m| m.id))
    }
}

/// Inlier/outlier partition produced by the RANSAC pose search.
#[derive(Clone, Debug, Default)]
pub struct MatchSets {
    pub inliers: Matches,
    pub outliers: Matches,
}
