//! Per-frame feature detection: the organized depth cloud, the keypoint
//! match surface and the plane/cylinder primitive detector. Keypoint and
//! line detection themselves are external collaborators behind traits.

pub mod depth_map;
pub mod keypoints;
pub mod lines;
pub mod primitives;

pub use depth_map::OrganizedPointCloud;
pub use keypoints::{
    descriptor_distance, Descriptor, DetectedKeypoint, FeatureExtractor, FeatureId,
    KeypointHandler, TrackedKeypoints, DESCRIPTOR_SIZE,
};
pub use lines::{DetectedLine, LineDetector};
pub use primitives::detector::{DetectedPlane, DetectedPrimitives, PrimitiveDetector};
