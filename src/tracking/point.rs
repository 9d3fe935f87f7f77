//! Cartesian point tracking: the Kalman-filtered position update used by 3D
//! map points.

use nalgebra::Matrix3;

use crate::error::Result;
use crate::geometry::coordinates::WorldCoordinate;
use crate::tracking::kalman::SharedKalmanFilter;

/// Tracks a static 3D world point through repeated observations.
#[derive(Clone, Debug)]
pub struct PointTracker {
    coordinates: WorldCoordinate,
    covariance: Matrix3<f64>,
}

impl PointTracker {
    pub fn new(coordinates: WorldCoordinate, covariance: Matrix3<f64>) -> Self {
        Self {
            coordinates,
            covariance,
        }
    }

    pub fn coordinates(&self) -> WorldCoordinate {
        self.coordinates
    }

    pub fn covariance(&self) -> Matrix3<f64> {
        self.covariance
    }

    /// Merge a new observation into the tracked position.
    ///
    /// Returns the distance the estimate moved, a cheap measure of how
    /// surprising the observation was.
    pub fn track(
        &mut self,
        filter: &SharedKalmanFilter<3>,
        observation: &WorldCoordinate,
        observation_covariance: &Matrix3<f64>,
    ) -> Result<f64> {
        let (new_state, new_covariance) = filter.get_new_state(
            &self.coordinates.0,
            &self.covariance,
            &observation.0,
            observation_covariance,
        )?;

        let score = (self.coordinates.0 - new_state).norm();
        self.coordinates = WorldCoordinate(new_state);
        self.covariance = new_covariance;
        Ok(score)
    }

    /// Replace the state outright.
    pub fn reset(&mut self, coordinates: WorldCoordinate, covariance: Matrix3<f64>) {
        self.coordinates = coordinates;
        self.covariance = covariance;
    }
}
