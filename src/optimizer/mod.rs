//! Pose optimization: robust Levenberg-Marquardt over mixed feature
//! residuals, RANSAC inlier selection and Monte-Carlo pose covariance.

pub mod covariance;
pub mod functor;
pub mod loss;
pub mod ransac;

pub use covariance::estimate_pose_covariance;
pub use functor::PoseEstimator;
pub use loss::generalized_loss;
pub use ransac::compute_optimized_pose;
