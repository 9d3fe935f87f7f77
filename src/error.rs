//! Typed failure kinds for the per-frame pipeline.
//!
//! Every recoverable failure is one of four kinds. Nothing past engine
//! construction is allowed to panic: covariance routines, trackers and the
//! optimizer all surface these errors and the caller drops the offending
//! feature or discards the iteration.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SlamError {
    /// Out-of-range depth, NaN coordinates, empty descriptor, non-PSD
    /// covariance. The offending feature is dropped; the frame proceeds.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Eigendecomposition failure, singular SVD, zero-norm normal. The
    /// segment is marked non-planar and the detector skips it.
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    /// Levenberg-Marquardt returned a non-success status. The RANSAC
    /// iteration is discarded.
    #[error("optimization did not converge: {0}")]
    NonConvergence(String),

    /// An internal invariant was violated (feature id of 0, mismatched mask
    /// sizes). Logged as an error; the local operation is aborted.
    #[error("contract violation: {0}")]
    ContractViolation(String),
}

pub type Result<T> = std::result::Result<T, SlamError>;
