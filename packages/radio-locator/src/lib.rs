//! radio-locator — Robust position estimation of radio sources from ranging readings
//!
//! Pipeline:
//!   readings ──▶ consensus search (RANSAC, minimal samples of 4)
//!            ──▶ inlier re-fit (weighted Levenberg–Marquardt)
//!            ──▶ position covariance from reading σ
//!
//! [`RobustRangingLocator`] owns configuration, lock state and listener
//! notifications; the stages live in [`consensus`] and [`refine`], the model
//! fitter behind [`ModelFitter`].

pub mod config;
pub mod consensus;
pub mod error;
pub mod fitter;
pub mod locator;
pub mod propagation;
pub mod refine;

#[cfg(test)]
mod testing;

pub use config::LocatorConfig;
pub use consensus::residual;
pub use error::{FitError, LocatorError};
pub use fitter::{ModelFitter, MultilaterationSolver, MIN_SAMPLES};
pub use locator::{InliersData, LocatorListener, RobustRangingLocator};
pub use propagation::{PathLossModel, PowerVariances};

pub use radio_types;
