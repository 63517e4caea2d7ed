//! locator.rs — Robust ranging locator: configuration, lock state and listeners
//!
//! ## State machine
//!   Unlocked ──estimate()──▶ Locked ──return (Ok or Err)──▶ Unlocked
//!
//! All configuration lives in `Cell`s so that mutators take `&self`; listeners
//! receive `&RobustRangingLocator` and every mutator they call while an estimation
//! is running is rejected with [`LocatorError::Locked`]. The type is `!Sync`, so
//! concurrent use from several threads does not compile.

use std::cell::{Cell, RefCell};

use rand::rngs::StdRng;
use rand::SeedableRng;
use radio_types::{LocatedRadioSource, Matrix3, Point3, RangingReading};
use tracing::{debug, info};

use crate::config::{
    check_confidence, check_distance_std, check_max_iterations, check_position,
    check_progress_delta, check_threshold, LocatorConfig,
};
use crate::consensus::{self, residual, SearchEvent, SearchSettings};
use crate::error::LocatorError;
use crate::fitter::{ModelFitter, MultilaterationSolver, MIN_SAMPLES};
use crate::refine::{self, RefineOptions};

// ── Listener ──────────────────────────────────────────────────────────────────

/// Estimation callbacks, invoked synchronously on the calling thread.
pub trait LocatorListener {
    fn on_estimate_start(&self, _locator: &RobustRangingLocator<'_>) {}
    fn on_estimate_end(&self, _locator: &RobustRangingLocator<'_>) {}
    /// `iteration` is the 1-based count of completed consensus iterations
    fn on_estimate_next_iteration(&self, _locator: &RobustRangingLocator<'_>, _iteration: u32) {}
    fn on_estimate_progress_change(&self, _locator: &RobustRangingLocator<'_>, _progress: f32) {}
}

// ── Inlier diagnostics ────────────────────────────────────────────────────────

/// Consensus diagnostics of the last successful estimation.
#[derive(Debug, Clone, PartialEq)]
pub struct InliersData {
    inliers: Option<Vec<bool>>,
    residuals: Option<Vec<f64>>,
    num_inliers: usize,
}

impl InliersData {
    /// inliers()[i] ⇔ reading i belongs to the winning consensus set
    pub fn inliers(&self) -> Option<&[bool]> { self.inliers.as_deref() }
    /// Residual of every reading against the final position
    pub fn residuals(&self) -> Option<&[f64]> { self.residuals.as_deref() }
    pub fn num_inliers(&self) -> usize { self.num_inliers }
}

// ── Lock guard ────────────────────────────────────────────────────────────────

/// Holds the locked flag for the duration of one estimation.
struct LockGuard<'l> {
    flag: &'l Cell<bool>,
}

impl<'l> LockGuard<'l> {
    fn acquire(flag: &'l Cell<bool>) -> Result<Self, LocatorError> {
        if flag.replace(true) {
            return Err(LocatorError::Locked);
        }
        Ok(Self { flag })
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

// ── Locator ───────────────────────────────────────────────────────────────────

/// RANSAC locator for one radio source from ranging readings.
pub struct RobustRangingLocator<'a> {
    readings: Cell<Option<&'a [RangingReading]>>,
    listener: Cell<Option<&'a dyn LocatorListener>>,
    config: Cell<LocatorConfig>,
    fitter: Box<dyn ModelFitter + 'a>,
    locked: Cell<bool>,
    inliers_data: RefCell<Option<InliersData>>,
    located: RefCell<Option<LocatedRadioSource>>,
}

impl Default for RobustRangingLocator<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> RobustRangingLocator<'a> {
    pub fn new() -> Self {
        Self::with_fitter(MultilaterationSolver::default())
    }

    pub fn with_fitter(fitter: impl ModelFitter + 'a) -> Self {
        Self {
            readings: Cell::new(None),
            listener: Cell::new(None),
            config: Cell::new(LocatorConfig::default()),
            fitter: Box::new(fitter),
            locked: Cell::new(false),
            inliers_data: RefCell::new(None),
            located: RefCell::new(None),
        }
    }

    pub fn with_readings(readings: &'a [RangingReading]) -> Result<Self, LocatorError> {
        let locator = Self::new();
        locator.set_readings(readings)?;
        Ok(locator)
    }

    pub fn with_config(config: LocatorConfig) -> Result<Self, LocatorError> {
        let locator = Self::new();
        locator.set_config(config)?;
        Ok(locator)
    }

    // ── State ─────────────────────────────────────────────────────────────

    pub fn is_locked(&self) -> bool { self.locked.get() }

    /// Readings are set and number at least [`MIN_SAMPLES`].
    pub fn is_ready(&self) -> bool {
        self.readings.get().is_some_and(|r| r.len() >= MIN_SAMPLES)
    }

    pub fn min_required_samples(&self) -> usize { MIN_SAMPLES }

    fn ensure_unlocked(&self) -> Result<(), LocatorError> {
        if self.locked.get() { Err(LocatorError::Locked) } else { Ok(()) }
    }

    fn update(&self, apply: impl FnOnce(&mut LocatorConfig)) -> Result<(), LocatorError> {
        self.ensure_unlocked()?;
        let mut config = self.config.get();
        apply(&mut config);
        self.config.set(config);
        Ok(())
    }

    // ── Configuration ─────────────────────────────────────────────────────

    pub fn config(&self) -> LocatorConfig { self.config.get() }

    pub fn set_config(&self, config: LocatorConfig) -> Result<(), LocatorError> {
        self.ensure_unlocked()?;
        config.validate()?;
        self.config.set(config);
        Ok(())
    }

    pub fn readings(&self) -> Option<&'a [RangingReading]> { self.readings.get() }

    pub fn set_readings(&self, readings: &'a [RangingReading]) -> Result<(), LocatorError> {
        self.ensure_unlocked()?;
        if readings.len() < MIN_SAMPLES {
            return Err(LocatorError::InvalidArgument(format!(
                "at least {MIN_SAMPLES} readings are required, got {}",
                readings.len()
            )));
        }
        self.readings.set(Some(readings));
        Ok(())
    }

    pub fn set_listener(
        &self,
        listener: Option<&'a dyn LocatorListener>,
    ) -> Result<(), LocatorError> {
        self.ensure_unlocked()?;
        self.listener.set(listener);
        Ok(())
    }

    pub fn threshold(&self) -> f64 { self.config.get().threshold_m }

    pub fn set_threshold(&self, threshold_m: f64) -> Result<(), LocatorError> {
        self.ensure_unlocked()?;
        check_threshold(threshold_m)?;
        self.update(|c| c.threshold_m = threshold_m)
    }

    pub fn confidence(&self) -> f64 { self.config.get().confidence }

    pub fn set_confidence(&self, confidence: f64) -> Result<(), LocatorError> {
        self.ensure_unlocked()?;
        check_confidence(confidence)?;
        self.update(|c| c.confidence = confidence)
    }

    pub fn max_iterations(&self) -> u32 { self.config.get().max_iterations }

    pub fn set_max_iterations(&self, max_iterations: u32) -> Result<(), LocatorError> {
        self.ensure_unlocked()?;
        check_max_iterations(max_iterations)?;
        self.update(|c| c.max_iterations = max_iterations)
    }

    pub fn progress_delta(&self) -> f32 { self.config.get().progress_delta }

    pub fn set_progress_delta(&self, progress_delta: f32) -> Result<(), LocatorError> {
        self.ensure_unlocked()?;
        check_progress_delta(progress_delta)?;
        self.update(|c| c.progress_delta = progress_delta)
    }

    pub fn is_result_refined(&self) -> bool { self.config.get().result_refined }

    pub fn set_result_refined(&self, refined: bool) -> Result<(), LocatorError> {
        self.update(|c| c.result_refined = refined)
    }

    pub fn is_covariance_kept(&self) -> bool { self.config.get().covariance_kept }

    pub fn set_covariance_kept(&self, kept: bool) -> Result<(), LocatorError> {
        self.update(|c| c.covariance_kept = kept)
    }

    pub fn is_compute_and_keep_inliers(&self) -> bool { self.config.get().compute_and_keep_inliers }

    pub fn set_compute_and_keep_inliers(&self, keep: bool) -> Result<(), LocatorError> {
        self.update(|c| c.compute_and_keep_inliers = keep)
    }

    pub fn is_compute_and_keep_residuals(&self) -> bool {
        self.config.get().compute_and_keep_residuals
    }

    pub fn set_compute_and_keep_residuals(&self, keep: bool) -> Result<(), LocatorError> {
        self.update(|c| c.compute_and_keep_residuals = keep)
    }

    pub fn initial_position(&self) -> Option<Point3> { self.config.get().initial_position }

    pub fn set_initial_position(&self, position: Option<Point3>) -> Result<(), LocatorError> {
        self.ensure_unlocked()?;
        if let Some(p) = &position {
            check_position(p)?;
        }
        self.update(|c| c.initial_position = position)
    }

    pub fn seed(&self) -> Option<u64> { self.config.get().seed }

    pub fn set_seed(&self, seed: Option<u64>) -> Result<(), LocatorError> {
        self.update(|c| c.seed = seed)
    }

    pub fn fallback_distance_std(&self) -> Option<f64> { self.config.get().fallback_distance_std_m }

    /// σ used in the covariance for readings that carry none (zero variance when None).
    pub fn set_fallback_distance_std(&self, std_m: Option<f64>) -> Result<(), LocatorError> {
        self.ensure_unlocked()?;
        if let Some(v) = std_m {
            check_distance_std(v)?;
        }
        self.update(|c| c.fallback_distance_std_m = std_m)
    }

    /// Accepted and discarded: consensus sampling is uniform.
    pub fn set_quality_scores(&self, scores: Option<&[f64]>) -> Result<(), LocatorError> {
        self.ensure_unlocked()?;
        if let Some(s) = scores {
            debug!(len = s.len(), "quality scores ignored by uniform sampling");
        }
        Ok(())
    }

    /// Always None: scores are not retained (see [`Self::set_quality_scores`]).
    pub fn quality_scores(&self) -> Option<&[f64]> { None }

    // ── Results ───────────────────────────────────────────────────────────

    pub fn inliers_data(&self) -> Option<InliersData> { self.inliers_data.borrow().clone() }

    pub fn located_source(&self) -> Option<LocatedRadioSource> { self.located.borrow().clone() }

    pub fn estimated_position(&self) -> Option<Point3> {
        self.located.borrow().as_ref().map(|l| l.position)
    }

    pub fn estimated_covariance(&self) -> Option<Matrix3> {
        self.located.borrow().as_ref().and_then(|l| l.position_covariance)
    }

    // ── Estimation ────────────────────────────────────────────────────────

    /// Locate the radio source of the configured readings.
    pub fn estimate(&self) -> Result<LocatedRadioSource, LocatorError> {
        let _lock = LockGuard::acquire(&self.locked)?;
        let readings = self
            .readings
            .get()
            .filter(|r| r.len() >= MIN_SAMPLES)
            .ok_or(LocatorError::NotReady { min_samples: MIN_SAMPLES })?;

        self.inliers_data.replace(None);
        self.located.replace(None);

        let result = self.run(readings);
        if let Err(e) = &result {
            debug!(error = %e, readings = readings.len(), "estimation failed");
        }
        result
    }

    fn run(&self, readings: &'a [RangingReading]) -> Result<LocatedRadioSource, LocatorError> {
        let config = self.config.get();
        let listener = self.listener.get();

        if let Some(l) = listener {
            l.on_estimate_start(self);
        }

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let settings = SearchSettings {
            threshold_m: config.threshold_m,
            confidence: config.confidence,
            max_iterations: config.max_iterations,
            progress_delta: config.progress_delta,
        };

        let fitter = self.fitter.as_ref();
        let consensus = consensus::search(readings, fitter, &settings, &mut rng, |event| {
            if let Some(l) = listener {
                match event {
                    SearchEvent::NextIteration(i) => l.on_estimate_next_iteration(self, i),
                    SearchEvent::Progress(p) => l.on_estimate_progress_change(self, p),
                }
            }
        })?;

        let inliers = consensus.inlier_readings(readings);
        let refinement = refine::refine(
            fitter,
            &inliers,
            consensus.position,
            &RefineOptions {
                result_refined: config.result_refined,
                covariance_kept: config.covariance_kept,
                initial_position: config.initial_position,
                fallback_distance_std_m: config.fallback_distance_std_m,
            },
        )?;

        if config.compute_and_keep_inliers || config.compute_and_keep_residuals {
            let residuals = config.compute_and_keep_residuals.then(|| {
                readings.iter().map(|r| residual(&refinement.position, r)).collect()
            });
            let num_inliers = consensus.num_inliers;
            let inliers = config.compute_and_keep_inliers.then_some(consensus.inliers);
            self.inliers_data.replace(Some(InliersData { inliers, residuals, num_inliers }));
        }

        let located = LocatedRadioSource {
            source: readings[0].source().clone(),
            position: refinement.position,
            position_covariance: refinement.covariance,
        };
        self.located.replace(Some(located.clone()));

        info!(
            source = %located.id(),
            inliers = consensus.num_inliers,
            readings = readings.len(),
            iterations = consensus.iterations,
            x = located.position.x,
            y = located.position.y,
            z = located.position.z,
            "radio source located"
        );

        if let Some(l) = listener {
            l.on_estimate_end(self);
        }
        Ok(located)
    }
}
