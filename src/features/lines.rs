//! Line detection boundary.
//!
//! Line segments are detected by an external collaborator; the engine only
//! schedules the detector alongside keypoints and primitives and forwards
//! the result. No line features enter the local map yet.

use image::GrayImage;

use crate::geometry::coordinates::ScreenCoordinate2D;
use crate::DepthImage;

/// A detected 2D line segment in screen space.
#[derive(Clone, Copy, Debug)]
pub struct DetectedLine {
    pub start: ScreenCoordinate2D,
    pub end: ScreenCoordinate2D,
}

/// External line segment detector.
pub trait LineDetector: Send + Sync {
    fn detect_lines(&self, gray: &GrayImage, depth: &DepthImage) -> Vec<DetectedLine>;
}
