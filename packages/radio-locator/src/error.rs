//! error.rs — Error taxonomy for the locator and its model fitter

use thiserror::Error;

/// Errors surfaced by [`crate::RobustRangingLocator`] and its stages.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocatorError {
    /// Bad configuration value or input; correct the input and retry.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A mutator or `estimate()` was called while an estimation is in flight.
    #[error("locator is locked: an estimation is in progress")]
    Locked,

    /// Readings are missing or fewer than the minimum sample count.
    #[error("locator is not ready: at least {min_samples} readings are required")]
    NotReady { min_samples: usize },

    /// Iteration budget exhausted without a consensus set of usable size.
    #[error("no consensus after {iterations} iterations (best inlier count {best_inliers})")]
    NoConsensus { iterations: u32, best_inliers: usize },

    /// Refinement did not converge or the normal matrix is not positive-definite.
    #[error("numerical failure: {0}")]
    NumericalFailure(String),
}

/// Failure of the model fitter on one set of samples.
///
/// Inside the consensus loop this is recovered by skipping the sample.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    #[error("need at least {required} samples, got {got}")]
    InsufficientSamples { required: usize, got: usize },

    /// Receiver geometry does not constrain a 3D position (coplanar, coincident).
    #[error("degenerate receiver geometry")]
    Degenerate,

    /// Iteration budget exhausted, or the solve left the finite range.
    #[error("solver did not converge")]
    NotConverged,
}
