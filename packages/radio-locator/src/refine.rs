//! refine.rs — Inlier re-fit and position covariance
//!
//! After the consensus search the winning inliers are re-fitted together with a
//! weighted LM solve (wᵢ = 1/σ²ᵢ, unit when σ is unknown), seeded with the prior
//! position when one is configured and with the consensus position otherwise.
//! The covariance is then propagated from the reading variances at the refined
//! position (see [`crate::propagation::position_covariance`]).

use radio_types::{Matrix3, Point3, RangingReading};
use tracing::debug;

use crate::error::LocatorError;
use crate::fitter::ModelFitter;
use crate::propagation::{position_covariance, reading_weight};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefineOptions {
    pub result_refined: bool,
    pub covariance_kept: bool,
    pub initial_position: Option<Point3>,
    /// σ assumed in the covariance for readings that carry none
    pub fallback_distance_std_m: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Refinement {
    pub position: Point3,
    pub covariance: Option<Matrix3>,
}

pub fn refine<F: ModelFitter + ?Sized>(
    fitter: &F,
    inliers: &[&RangingReading],
    rough: Point3,
    options: &RefineOptions,
) -> Result<Refinement, LocatorError> {
    if !options.result_refined {
        return Ok(Refinement { position: rough, covariance: None });
    }

    let seed = options.initial_position.unwrap_or(rough);
    let weights: Vec<f64> = inliers.iter().map(|r| reading_weight(r)).collect();
    let position = fitter
        .fit_weighted(inliers, &weights, seed)
        .map_err(|e| LocatorError::NumericalFailure(format!("refinement failed: {e}")))?;
    if !position.is_finite() {
        return Err(LocatorError::NumericalFailure("refined position is not finite".to_string()));
    }
    debug!(
        inliers = inliers.len(),
        shift_m = position.distance(&rough),
        "refined consensus position"
    );

    let covariance = if options.covariance_kept {
        Some(position_covariance(inliers, &position, options.fallback_distance_std_m)?)
    } else {
        None
    };

    Ok(Refinement { position, covariance })
}
