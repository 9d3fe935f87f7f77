//! Feature tracking: the shared Kalman filter and the two tracked point
//! parameterizations (cartesian and inverse-depth).

pub mod inverse_depth;
pub mod kalman;
pub mod motion_model;
pub mod point;

pub use inverse_depth::{InverseDepthCoordinates, PointInverseDepth};
pub use kalman::SharedKalmanFilter;
pub use motion_model::MotionModel;
pub use point::PointTracker;
