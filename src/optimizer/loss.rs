//! Barron's general and adaptive robust loss.
//!
//! "A General and Adaptive Robust Loss Function", Jonathan T. Barron, 2019.
//! One family parameterized by (alpha, scale) recovering L2 (alpha = 2),
//! Charbonnier (alpha = 1), Cauchy (alpha = 0), Geman-McClure (alpha = -2)
//! and Welsch (alpha -> -inf) as special cases.

/// Evaluate the loss for an error value.
///
/// `alpha` is the steepness, `scale` the standard deviation of the inlier
/// error. Alphas below -100 select the Welsch limit.
pub fn generalized_loss(error: f64, alpha: f64, scale: f64) -> f64 {
    let scaled_squared_error = (error * error) / (scale * scale);

    if alpha == 2.0 {
        0.5 * scaled_squared_error
    } else if alpha == 0.0 {
        (0.5 * scaled_squared_error + 1.0).ln()
    } else if alpha < -100.0 {
        1.0 - (-0.5 * scaled_squared_error).exp()
    } else {
        let abs_alpha_minus_two = (alpha - 2.0).abs();
        let internal_term = scaled_squared_error / abs_alpha_minus_two + 1.0;
        (abs_alpha_minus_two / alpha) * (internal_term.powf(alpha / 2.0) - 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn zero_error_is_zero_loss() {
        for alpha in [-1000.0, -2.0, 0.0, 1.0, 2.0] {
            assert_relative_eq!(generalized_loss(0.0, alpha, 1.0), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn l2_case() {
        assert_relative_eq!(generalized_loss(3.0, 2.0, 1.0), 4.5, epsilon = 1e-12);
        assert_relative_eq!(generalized_loss(3.0, 2.0, 3.0), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn cauchy_case() {
        assert_relative_eq!(
            generalized_loss(2.0, 0.0, 1.0),
            (0.5 * 4.0 + 1.0_f64).ln(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn welsch_case_saturates() {
        let small = generalized_loss(1.0, -1000.0, 1.0);
        let large = generalized_loss(100.0, -1000.0, 1.0);
        assert!(small < large);
        assert!(large <= 1.0 + 1e-12);
    }

    #[test]
    fn charbonnier_matches_general_formula() {
        // alpha = 1: loss = (|1-2|/1)((e²/(s²·1) + 1)^(1/2) - 1)
        let error = 2.5;
        let expected = ((error * error) + 1.0_f64).sqrt() - 1.0;
        assert_relative_eq!(generalized_loss(error, 1.0, 1.0), expected, epsilon = 1e-12);
    }

    #[test]
    fn loss_is_monotone_in_error() {
        for alpha in [-1000.0, 0.0, 1.0, 2.0] {
            let mut previous = 0.0;
            for step in 1..20 {
                let value = generalized_loss(step as f64 * 0.5, alpha, 100.0);
                assert!(value >= previous);
                previous = value;
            }
        }
    }
}
