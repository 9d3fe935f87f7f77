pub mod config;
pub mod debug_image;
pub mod engine;
pub mod error;
pub mod features;
pub mod geometry;
pub mod map;
pub mod optimizer;
pub mod tracking;

pub use config::Parameters;
pub use engine::RgbdSlam;
pub use error::SlamError;
pub use geometry::pose::Pose;

/// Depth image in millimeters; `0` or NaN marks an invalid measurement.
pub type DepthImage = image::ImageBuffer<image::Luma<f32>, Vec<f32>>;
