//! Camera pose: position + orientation with a 6x6 covariance, and the typed
//! transform matrices every cross-frame conversion must go through.

use nalgebra::{Isometry3, Matrix3, Matrix6, Translation3, UnitQuaternion, Vector3};

/// Rigid transform taking camera-frame coordinates to world-frame.
#[derive(Clone, Copy, Debug)]
pub struct CameraToWorld(pub Isometry3<f64>);

/// Rigid transform taking world-frame coordinates to camera-frame.
#[derive(Clone, Copy, Debug)]
pub struct WorldToCamera(pub Isometry3<f64>);

impl CameraToWorld {
    pub fn new(orientation: &UnitQuaternion<f64>, position: &Vector3<f64>) -> Self {
        Self(Isometry3::from_parts(Translation3::from(*position), *orientation))
    }

    pub fn inverse(&self) -> WorldToCamera {
        WorldToCamera(self.0.inverse())
    }

    /// Camera center expressed in world coordinates.
    pub fn translation(&self) -> Vector3<f64> {
        self.0.translation.vector
    }

    pub fn rotation(&self) -> &UnitQuaternion<f64> {
        &self.0.rotation
    }

    #[inline]
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.0.rotation * point + self.0.translation.vector
    }
}

impl WorldToCamera {
    pub fn new(orientation: &UnitQuaternion<f64>, position: &Vector3<f64>) -> Self {
        CameraToWorld::new(orientation, position).inverse()
    }

    pub fn inverse(&self) -> CameraToWorld {
        CameraToWorld(self.0.inverse())
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.0.translation.vector
    }

    pub fn rotation(&self) -> &UnitQuaternion<f64> {
        &self.0.rotation
    }

    #[inline]
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.0.rotation * point + self.0.translation.vector
    }
}

/// A 6-DoF camera pose in the world frame.
///
/// Position in millimeters, orientation as a unit quaternion. The covariance
/// is over `(tx, ty, tz, rx, ry, rz)` with the position block leading; the
/// rotation block lives in the tangent space of the scaled-axis
/// parameterization.
#[derive(Clone, Debug)]
pub struct Pose {
    position: Vector3<f64>,
    orientation: UnitQuaternion<f64>,
    covariance: Matrix6<f64>,
}

impl Pose {
    pub fn new(position: Vector3<f64>, orientation: UnitQuaternion<f64>) -> Self {
        Self {
            position,
            orientation,
            covariance: Matrix6::zeros(),
        }
    }

    pub fn with_covariance(
        position: Vector3<f64>,
        orientation: UnitQuaternion<f64>,
        covariance: Matrix6<f64>,
    ) -> Self {
        Self {
            position,
            orientation,
            covariance,
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        self.position
    }

    pub fn orientation(&self) -> UnitQuaternion<f64> {
        self.orientation
    }

    pub fn covariance(&self) -> Matrix6<f64> {
        self.covariance
    }

    pub fn set_covariance(&mut self, covariance: Matrix6<f64>) {
        self.covariance = covariance;
    }

    /// Leading 3x3 block: the position covariance in millimeters squared.
    pub fn position_covariance(&self) -> Matrix3<f64> {
        self.covariance.fixed_view::<3, 3>(0, 0).into_owned()
    }

    pub fn camera_to_world(&self) -> CameraToWorld {
        CameraToWorld::new(&self.orientation, &self.position)
    }

    pub fn world_to_camera(&self) -> WorldToCamera {
        self.camera_to_world().inverse()
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::new(Vector3::zeros(), UnitQuaternion::identity())
    }
}
