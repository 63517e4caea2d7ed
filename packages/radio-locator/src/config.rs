//! config.rs — Locator tunables
//!
//! Defaults follow common indoor ranging practice: 10 cm inlier threshold,
//! 99 % confidence, up to 5000 consensus iterations, progress reported in
//! 5 % steps. Loaded from the `[locator]` table of the simulator config.

use radio_types::Point3;
use serde::Deserialize;

use crate::error::LocatorError;

pub const DEFAULT_THRESHOLD_M: f64 = 0.1;
pub const DEFAULT_CONFIDENCE: f64 = 0.99;
pub const DEFAULT_MAX_ITERATIONS: u32 = 5000;
pub const DEFAULT_PROGRESS_DELTA: f32 = 0.05;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    /// Max residual (meters) for a reading to count as an inlier
    pub threshold_m: f64,
    /// Probability of drawing at least one outlier-free sample
    pub confidence: f64,
    /// Hard cap on consensus iterations
    pub max_iterations: u32,
    /// Minimum progress step between progress notifications
    pub progress_delta: f32,
    /// Re-fit on all inliers after the consensus search
    pub result_refined: bool,
    /// Propagate reading variances into a position covariance (needs refinement)
    pub covariance_kept: bool,
    pub compute_and_keep_inliers: bool,
    pub compute_and_keep_residuals: bool,
    /// Refinement seed; a prior, not a constraint
    pub initial_position: Option<Point3>,
    /// RNG seed for reproducible sampling; entropy when absent
    pub seed: Option<u64>,
    /// Distance σ (meters) assumed in the covariance for readings without one;
    /// zero variance when absent
    pub fallback_distance_std_m: Option<f64>,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            threshold_m: DEFAULT_THRESHOLD_M,
            confidence: DEFAULT_CONFIDENCE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            progress_delta: DEFAULT_PROGRESS_DELTA,
            result_refined: true,
            covariance_kept: true,
            compute_and_keep_inliers: false,
            compute_and_keep_residuals: false,
            initial_position: None,
            seed: None,
            fallback_distance_std_m: None,
        }
    }
}

impl LocatorConfig {
    pub fn validate(&self) -> Result<(), LocatorError> {
        check_threshold(self.threshold_m)?;
        check_confidence(self.confidence)?;
        check_max_iterations(self.max_iterations)?;
        check_progress_delta(self.progress_delta)?;
        if let Some(p) = self.initial_position {
            check_position(&p)?;
        }
        if let Some(std) = self.fallback_distance_std_m {
            check_distance_std(std)?;
        }
        Ok(())
    }
}

// ── Argument checks (shared with the locator setters) ─────────────────────────

pub(crate) fn check_threshold(v: f64) -> Result<(), LocatorError> {
    if v.is_finite() && v > 0.0 {
        Ok(())
    } else {
        Err(LocatorError::InvalidArgument(format!("threshold must be > 0, got {v}")))
    }
}

pub(crate) fn check_confidence(v: f64) -> Result<(), LocatorError> {
    if (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(LocatorError::InvalidArgument(format!("confidence must be in [0, 1], got {v}")))
    }
}

pub(crate) fn check_max_iterations(n: u32) -> Result<(), LocatorError> {
    if n >= 1 {
        Ok(())
    } else {
        Err(LocatorError::InvalidArgument("max iterations must be >= 1".to_string()))
    }
}

pub(crate) fn check_progress_delta(v: f32) -> Result<(), LocatorError> {
    if (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(LocatorError::InvalidArgument(format!("progress delta must be in [0, 1], got {v}")))
    }
}

pub(crate) fn check_distance_std(v: f64) -> Result<(), LocatorError> {
    if v.is_finite() && v > 0.0 {
        Ok(())
    } else {
        Err(LocatorError::InvalidArgument(format!("fallback distance std must be > 0, got {v}")))
    }
}

pub(crate) fn check_position(p: &Point3) -> Result<(), LocatorError> {
    if p.is_finite() {
        Ok(())
    } else {
        Err(LocatorError::InvalidArgument("initial position must be finite".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = LocatorConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.threshold_m, DEFAULT_THRESHOLD_M);
        assert!(cfg.result_refined);
        assert!(!cfg.compute_and_keep_inliers);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg: LocatorConfig = toml::from_str(
            "threshold_m = 0.5\nseed = 42\nfallback_distance_std_m = 0.3\n\
             initial_position = { x = 1.0, y = 2.0, z = 3.0 }\n",
        )
        .unwrap();
        assert_eq!(cfg.threshold_m, 0.5);
        assert_eq!(cfg.seed, Some(42));
        assert_eq!(cfg.fallback_distance_std_m, Some(0.3));
        assert_eq!(cfg.initial_position, Some(Point3::new(1.0, 2.0, 3.0)));
        assert_eq!(cfg.max_iterations, DEFAULT_MAX_ITERATIONS);
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let bad = [
            LocatorConfig { threshold_m: 0.0, ..Default::default() },
            LocatorConfig { confidence: 1.5, ..Default::default() },
            LocatorConfig { max_iterations: 0, ..Default::default() },
            LocatorConfig { progress_delta: -0.1, ..Default::default() },
            LocatorConfig {
                initial_position: Some(Point3::new(f64::INFINITY, 0.0, 0.0)),
                ..Default::default()
            },
            LocatorConfig { fallback_distance_std_m: Some(0.0), ..Default::default() },
        ];
        for cfg in bad {
            assert!(matches!(cfg.validate(), Err(LocatorError::InvalidArgument(_))), "{cfg:?}");
        }
    }
}
