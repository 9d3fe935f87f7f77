//! Planar-primitive detection from the organized point cloud.

pub mod cylinder_segment;
pub mod detector;
pub mod histogram;
pub mod plane_segment;

pub use cylinder_segment::CylinderSegment;
pub use detector::{DetectedCylinder, DetectedPlane, DetectedPrimitives, PrimitiveDetector};
pub use histogram::OrientationHistogram;
pub use plane_segment::PlaneSegment;
