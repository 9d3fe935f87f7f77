//! Typed coordinates for the four frames the engine works in.
//!
//! Screen space is (u, v) pixels with depth in millimeters; camera space is
//! millimeters relative to the camera center; world space is millimeters in
//! the global frame; planes are (nx, ny, nz, d) with the normal pointing
//! toward the observer and `n·p + d = 0`, `d >= 0`.
//!
//! Conversion between frames always takes an explicit transform; projection
//! and retroprojection always take explicit intrinsics.

use nalgebra::{Vector2, Vector3, Vector4};

use super::pose::{CameraToWorld, WorldToCamera};

/// Depth camera minimum reliable distance, in millimeters.
pub const MIN_DEPTH_MM: f64 = 40.0;
/// Depth camera maximum reliable distance, in millimeters.
pub const MAX_DEPTH_MM: f64 = 6000.0;

/// True if a depth measurement is in the sensor's reliable range.
#[inline]
pub fn is_depth_valid(depth: f64) -> bool {
    depth.is_finite() && depth > MIN_DEPTH_MM && depth <= MAX_DEPTH_MM
}

/// Pinhole intrinsics of the color camera.
#[derive(Clone, Copy, Debug)]
pub struct CameraIntrinsics {
    pub focal_x: f64,
    pub focal_y: f64,
    pub center_x: f64,
    pub center_y: f64,
}

/// A 2D point in screen space (pixels).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScreenCoordinate2D(pub Vector2<f64>);

/// A screen point with its depth measurement: (u px, v px, z mm).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScreenCoordinate(pub Vector3<f64>);

/// A 2D direction in camera space (normalized image plane).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraCoordinate2D(pub Vector2<f64>);

/// A 3D point in camera space (millimeters from the camera center).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraCoordinate(pub Vector3<f64>);

/// A 3D point in world space (millimeters).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorldCoordinate(pub Vector3<f64>);

/// Plane coefficients (nx, ny, nz, d) in the camera frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlaneCameraCoordinates(pub Vector4<f64>);

/// Plane coefficients (nx, ny, nz, d) in the world frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlaneWorldCoordinates(pub Vector4<f64>);

impl ScreenCoordinate2D {
    pub fn new(u: f64, v: f64) -> Self {
        Self(Vector2::new(u, v))
    }

    pub fn u(&self) -> f64 {
        self.0.x
    }

    pub fn v(&self) -> f64 {
        self.0.y
    }

    pub fn is_in_screen_boundaries(&self, width: usize, height: usize) -> bool {
        self.0.x >= 0.0 && self.0.y >= 0.0 && self.0.x < width as f64 && self.0.y < height as f64
    }

    /// Unnormalized viewing ray of this pixel, in camera coordinates.
    pub fn to_camera_ray(&self, intrinsics: &CameraIntrinsics) -> Vector3<f64> {
        Vector3::new(
            (self.0.x - intrinsics.center_x) / intrinsics.focal_x,
            (self.0.y - intrinsics.center_y) / intrinsics.focal_y,
            1.0,
        )
    }

    /// World-frame unit bearing of this pixel's viewing ray.
    pub fn to_world_bearing(
        &self,
        intrinsics: &CameraIntrinsics,
        camera_to_world: &CameraToWorld,
    ) -> Vector3<f64> {
        (camera_to_world.rotation() * self.to_camera_ray(intrinsics)).normalize()
    }
}

impl ScreenCoordinate {
    pub fn new(u: f64, v: f64, z: f64) -> Self {
        Self(Vector3::new(u, v, z))
    }

    pub fn u(&self) -> f64 {
        self.0.x
    }

    pub fn v(&self) -> f64 {
        self.0.y
    }

    /// Measured depth in millimeters.
    pub fn z(&self) -> f64 {
        self.0.z
    }

    pub fn as_2d(&self) -> ScreenCoordinate2D {
        ScreenCoordinate2D::new(self.0.x, self.0.y)
    }

    pub fn to_camera_coordinates(&self, intrinsics: &CameraIntrinsics) -> CameraCoordinate {
        let x = (self.0.x - intrinsics.center_x) * self.0.z / intrinsics.focal_x;
        let y = (self.0.y - intrinsics.center_y) * self.0.z / intrinsics.focal_y;
        CameraCoordinate(Vector3::new(x, y, self.0.z))
    }

    pub fn to_world_coordinates(
        &self,
        intrinsics: &CameraIntrinsics,
        camera_to_world: &CameraToWorld,
    ) -> WorldCoordinate {
        self.to_camera_coordinates(intrinsics)
            .to_world_coordinates(camera_to_world)
    }
}

impl CameraCoordinate2D {
    pub fn new(x: f64, y: f64) -> Self {
        Self(Vector2::new(x, y))
    }

    /// Project normalized image-plane coordinates to pixels.
    pub fn to_screen_coordinates(&self, intrinsics: &CameraIntrinsics) -> ScreenCoordinate2D {
        ScreenCoordinate2D::new(
            intrinsics.focal_x * self.0.x + intrinsics.center_x,
            intrinsics.focal_y * self.0.y + intrinsics.center_y,
        )
    }
}

impl CameraCoordinate {
    pub fn x(&self) -> f64 {
        self.0.x
    }

    pub fn y(&self) -> f64 {
        self.0.y
    }

    pub fn z(&self) -> f64 {
        self.0.z
    }

    pub fn to_world_coordinates(&self, camera_to_world: &CameraToWorld) -> WorldCoordinate {
        WorldCoordinate(camera_to_world.transform_point(&self.0))
    }

    /// Pinhole projection; `None` when the point is not in front of the
    /// camera or projects outside the real plane.
    pub fn to_screen_coordinates(&self, intrinsics: &CameraIntrinsics) -> Option<ScreenCoordinate> {
        if self.0.z <= 0.0 {
            return None;
        }
        let u = intrinsics.focal_x * self.0.x / self.0.z + intrinsics.center_x;
        let v = intrinsics.focal_y * self.0.y / self.0.z + intrinsics.center_y;
        if u.is_finite() && v.is_finite() {
            Some(ScreenCoordinate::new(u, v, self.0.z))
        } else {
            None
        }
    }
}

impl WorldCoordinate {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self(Vector3::new(x, y, z))
    }

    pub fn x(&self) -> f64 {
        self.0.x
    }

    pub fn y(&self) -> f64 {
        self.0.y
    }

    pub fn z(&self) -> f64 {
        self.0.z
    }

    pub fn to_camera_coordinates(&self, world_to_camera: &WorldToCamera) -> CameraCoordinate {
        CameraCoordinate(world_to_camera.transform_point(&self.0))
    }

    pub fn to_screen_coordinates(
        &self,
        intrinsics: &CameraIntrinsics,
        world_to_camera: &WorldToCamera,
    ) -> Option<ScreenCoordinate> {
        self.to_camera_coordinates(world_to_camera)
            .to_screen_coordinates(intrinsics)
    }

    /// Signed 2D retroprojection distance to a screen point, in pixels.
    pub fn signed_screen_distance(
        &self,
        screen_point: &ScreenCoordinate2D,
        intrinsics: &CameraIntrinsics,
        world_to_camera: &WorldToCamera,
    ) -> Option<Vector2<f64>> {
        let projected = self.to_screen_coordinates(intrinsics, world_to_camera)?;
        Some(Vector2::new(
            screen_point.u() - projected.u(),
            screen_point.v() - projected.v(),
        ))
    }

    /// Manhattan retroprojection distance to a screen point, in pixels.
    pub fn screen_distance(
        &self,
        screen_point: &ScreenCoordinate2D,
        intrinsics: &CameraIntrinsics,
        world_to_camera: &WorldToCamera,
    ) -> Option<f64> {
        self.signed_screen_distance(screen_point, intrinsics, world_to_camera)
            .map(|distance| distance.x.abs() + distance.y.abs())
    }

    /// Signed 3D distance to a depth measurement projected into world space.
    pub fn signed_world_distance(
        &self,
        screen_point: &ScreenCoordinate,
        intrinsics: &CameraIntrinsics,
        camera_to_world: &CameraToWorld,
    ) -> Vector3<f64> {
        self.0 - screen_point.to_world_coordinates(intrinsics, camera_to_world).0
    }
}

/// Spherical angles of a unit normal, shared by the orientation histogram
/// and the plane residuals: `theta = acos(-nz)`, `phi = atan2(nx, ny)`.
pub fn normal_spherical_angles(normal: &Vector3<f64>) -> (f64, f64) {
    let theta = (-normal.z).clamp(-1.0, 1.0).acos();
    let phi = normal.x.atan2(normal.y);
    (theta, phi)
}

/// Wraps an angle difference to (-pi, pi].
fn wrap_angle(angle: f64) -> f64 {
    let two_pi = 2.0 * std::f64::consts::PI;
    let wrapped = angle % two_pi;
    if wrapped > std::f64::consts::PI {
        wrapped - two_pi
    } else if wrapped <= -std::f64::consts::PI {
        wrapped + two_pi
    } else {
        wrapped
    }
}

fn transform_plane(
    rotation: &nalgebra::UnitQuaternion<f64>,
    translation: &Vector3<f64>,
    plane: &Vector4<f64>,
) -> Vector4<f64> {
    let normal = rotation * plane.xyz();
    let d = plane.w - normal.dot(translation);
    Vector4::new(normal.x, normal.y, normal.z, d)
}

impl PlaneCameraCoordinates {
    pub fn new(normal: Vector3<f64>, d: f64) -> Self {
        Self(Vector4::new(normal.x, normal.y, normal.z, d))
    }

    pub fn normal(&self) -> Vector3<f64> {
        self.0.xyz()
    }

    pub fn d(&self) -> f64 {
        self.0.w
    }

    pub fn to_world_coordinates(&self, camera_to_world: &CameraToWorld) -> PlaneWorldCoordinates {
        PlaneWorldCoordinates(transform_plane(
            camera_to_world.rotation(),
            &camera_to_world.translation(),
            &self.0,
        ))
    }
}

impl PlaneWorldCoordinates {
    pub fn new(normal: Vector3<f64>, d: f64) -> Self {
        Self(Vector4::new(normal.x, normal.y, normal.z, d))
    }

    pub fn normal(&self) -> Vector3<f64> {
        self.0.xyz()
    }

    pub fn d(&self) -> f64 {
        self.0.w
    }

    pub fn to_camera_coordinates(&self, world_to_camera: &WorldToCamera) -> PlaneCameraCoordinates {
        PlaneCameraCoordinates(transform_plane(
            world_to_camera.rotation(),
            &world_to_camera.translation(),
            &self.0,
        ))
    }

    /// Retroprojection error against an observed camera-frame plane, reduced
    /// to two angle components and a distance: (theta error, phi error, d
    /// error in millimeters).
    pub fn reduced_signed_distance(
        &self,
        observed: &PlaneCameraCoordinates,
        world_to_camera: &WorldToCamera,
    ) -> Vector3<f64> {
        let projected = self.to_camera_coordinates(world_to_camera);
        let (theta_projected, phi_projected) = normal_spherical_angles(&projected.normal());
        let (theta_observed, phi_observed) = normal_spherical_angles(&observed.normal());

        Vector3::new(
            theta_projected - theta_observed,
            wrap_angle(phi_projected - phi_observed),
            projected.d() - observed.d(),
        )
    }
}
