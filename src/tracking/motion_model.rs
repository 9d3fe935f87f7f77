//! Frame-to-frame pose prediction.
//!
//! The engine uses an identity motion model: the predicted pose for the next
//! frame is the last optimized pose. The model still owns the reset hook the
//! tracking-lost path requires, and keeps the last pose delta around for
//! diagnostics.

use nalgebra::{UnitQuaternion, Vector3};

use crate::geometry::pose::Pose;

#[derive(Clone, Debug, Default)]
pub struct MotionModel {
    last_translation_delta: Vector3<f64>,
    last_rotation_delta: UnitQuaternion<f64>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Predict the pose of the incoming frame.
    pub fn predict_next_pose(&self, current_pose: &Pose) -> Pose {
        current_pose.clone()
    }

    /// Record the realized frame-to-frame motion.
    pub fn update(&mut self, previous_pose: &Pose, optimized_pose: &Pose) {
        self.last_translation_delta = optimized_pose.position() - previous_pose.position();
        self.last_rotation_delta =
            previous_pose.orientation().inverse() * optimized_pose.orientation();
    }

    /// Forget accumulated motion; called when tracking is lost.
    pub fn reset(&mut self) {
        self.last_translation_delta = Vector3::zeros();
        self.last_rotation_delta = UnitQuaternion::identity();
    }

    /// Translation of the last tracked frame, in millimeters.
    pub fn last_translation_delta(&self) -> Vector3<f64> {
        self.last_translation_delta
    }
}
