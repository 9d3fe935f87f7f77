//! Geometry: typed coordinate frames, pose, rotation and covariance helpers.

pub mod coordinates;
pub mod covariance;
pub mod pose;
pub mod so3;

pub use coordinates::{
    is_depth_valid, CameraCoordinate, CameraCoordinate2D, CameraIntrinsics,
    PlaneCameraCoordinates, PlaneWorldCoordinates, ScreenCoordinate, ScreenCoordinate2D,
    WorldCoordinate,
};
pub use pose::{CameraToWorld, Pose, WorldToCamera};
