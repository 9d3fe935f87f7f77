//! Stateless Kalman filter shared by every tracked feature.
//!
//! The filter holds only its immutable configuration (dynamics, output and
//! process-noise matrices); the per-feature state travels in the call. One
//! instance serves all features concurrently.

use nalgebra::{SMatrix, SVector};

use crate::error::{Result, SlamError};
use crate::geometry::covariance::is_covariance_valid;

/// Gain-based linear Kalman update over an `N`-dimensional state observed
/// through an `N`-dimensional measurement.
#[derive(Clone, Debug)]
pub struct SharedKalmanFilter<const N: usize> {
    /// System dynamics (tracked features do not move: identity).
    system_dynamics: SMatrix<f64, N, N>,
    /// Output matrix mapping state to measurement.
    output_matrix: SMatrix<f64, N, N>,
    /// Process noise added at every prediction.
    process_noise: SMatrix<f64, N, N>,
}

impl<const N: usize> SharedKalmanFilter<N> {
    pub fn new(
        system_dynamics: SMatrix<f64, N, N>,
        output_matrix: SMatrix<f64, N, N>,
        process_noise: SMatrix<f64, N, N>,
    ) -> Self {
        Self {
            system_dynamics,
            output_matrix,
            process_noise,
        }
    }

    /// Filter configured for a static point: identity dynamics and output,
    /// a small isotropic process noise.
    pub fn for_static_point() -> Self {
        Self::new(
            SMatrix::identity(),
            SMatrix::identity(),
            SMatrix::identity() * 1e-4,
        )
    }

    /// One predict + update step.
    ///
    /// Returns the merged state and its covariance. Fails when either input
    /// covariance is invalid or the innovation covariance cannot be
    /// inverted; the caller drops the feature for this frame.
    pub fn get_new_state(
        &self,
        state: &SVector<f64, N>,
        state_covariance: &SMatrix<f64, N, N>,
        measurement: &SVector<f64, N>,
        measurement_covariance: &SMatrix<f64, N, N>,
    ) -> Result<(SVector<f64, N>, SMatrix<f64, N, N>)> {
        if !is_covariance_valid(state_covariance) {
            return Err(SlamError::InvalidInput(
                "kalman update: state covariance is invalid".to_string(),
            ));
        }
        if !is_covariance_valid(measurement_covariance) {
            return Err(SlamError::InvalidInput(
                "kalman update: measurement covariance is invalid".to_string(),
            ));
        }

        // predict
        let predicted_state = self.system_dynamics * state;
        let predicted_covariance =
            self.system_dynamics * state_covariance * self.system_dynamics.transpose()
                + self.process_noise;

        // innovation
        let innovation = measurement - self.output_matrix * predicted_state;
        let innovation_covariance = self.output_matrix
            * predicted_covariance
            * self.output_matrix.transpose()
            + measurement_covariance;

        let inverted = innovation_covariance.try_inverse().ok_or_else(|| {
            SlamError::DegenerateGeometry(
                "kalman update: innovation covariance is singular".to_string(),
            )
        })?;

        let gain = predicted_covariance * self.output_matrix.transpose() * inverted;

        let new_state = predicted_state + gain * innovation;
        let identity = SMatrix::<f64, N, N>::identity();
        let new_covariance = (identity - gain * self.output_matrix) * predicted_covariance;
        // symmetrize against accumulation drift
        let new_covariance = (new_covariance + new_covariance.transpose()) * 0.5;

        if !is_covariance_valid(&new_covariance) {
            return Err(SlamError::DegenerateGeometry(
                "kalman update produced an invalid covariance".to_string(),
            ));
        }
        Ok((new_state, new_covariance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Vector3};

    #[test]
    fn update_moves_state_toward_measurement() {
        let filter = SharedKalmanFilter::<3>::for_static_point();
        let state = Vector3::new(0.0, 0.0, 1000.0);
        let measurement = Vector3::new(10.0, 0.0, 1000.0);

        let (new_state, _) = filter
            .get_new_state(
                &state,
                &(Matrix3::identity() * 4.0),
                &measurement,
                &(Matrix3::identity() * 4.0),
            )
            .unwrap();

        assert!(new_state.x > 0.0 && new_state.x < 10.0);
    }

    #[test]
    fn certain_measurement_dominates() {
        let filter = SharedKalmanFilter::<3>::for_static_point();
        let state = Vector3::new(0.0, 0.0, 0.0);
        let measurement = Vector3::new(100.0, -40.0, 7.0);

        // huge state uncertainty, tiny measurement uncertainty
        let (new_state, new_covariance) = filter
            .get_new_state(
                &state,
                &(Matrix3::identity() * 1e6),
                &measurement,
                &(Matrix3::identity() * 1e-3),
            )
            .unwrap();

        assert_relative_eq!(new_state, measurement, epsilon = 1e-2);
        assert!(new_covariance.trace() < 1.0);
    }

    #[test]
    fn covariance_never_grows_past_prediction() {
        let filter = SharedKalmanFilter::<3>::for_static_point();
        let covariance = Matrix3::identity() * 9.0;

        let (_, new_covariance) = filter
            .get_new_state(
                &Vector3::zeros(),
                &covariance,
                &Vector3::new(1.0, 1.0, 1.0),
                &(Matrix3::identity() * 9.0),
            )
            .unwrap();

        assert!(new_covariance.trace() <= covariance.trace() + 3.0 * 1e-4);
        assert!(is_covariance_valid(&new_covariance));
    }

    #[test]
    fn invalid_state_covariance_is_rejected() {
        let filter = SharedKalmanFilter::<3>::for_static_point();
        let mut bad = Matrix3::identity();
        bad[(0, 0)] = f64::NAN;

        assert!(filter
            .get_new_state(
                &Vector3::zeros(),
                &bad,
                &Vector3::zeros(),
                &Matrix3::identity(),
            )
            .is_err());
    }
}
