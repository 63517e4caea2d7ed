//! consensus.rs — RANSAC consensus search over ranging readings
//!
//! Each iteration draws MIN_SAMPLES distinct readings, fits a candidate with the
//! model fitter and scores it by counting readings whose range residual is within
//! the threshold. A strictly larger consensus replaces the best model (the first
//! model to reach a count keeps it) and tightens the iteration bound:
//!
//!   N = ⌈ ln(1 − p) / ln(1 − wᵐ) ⌉,   w = inliers / total,  m = MIN_SAMPLES
//!
//! Fit failures (degenerate receiver geometry) skip the iteration.

use rand::seq::index;
use rand::Rng;
use radio_types::{Point3, RangingReading};
use tracing::debug;

use crate::error::LocatorError;
use crate::fitter::{ModelFitter, MIN_SAMPLES};

// ── Types ─────────────────────────────────────────────────────────────────────

/// Loop parameters, copied out of the locator configuration per call.
#[derive(Debug, Clone, Copy)]
pub struct SearchSettings {
    pub threshold_m: f64,
    pub confidence: f64,
    pub max_iterations: u32,
    pub progress_delta: f32,
}

/// Notifications emitted while searching, in iteration order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchEvent {
    /// 1-based count of completed iterations
    NextIteration(u32),
    /// Fraction of the current iteration bound consumed, in [0, 1]
    Progress(f32),
}

/// Winning model of a consensus search.
#[derive(Debug, Clone)]
pub struct Consensus {
    /// Position fitted from the winning minimal sample
    pub position: Point3,
    /// inliers[i] ⇔ residual of reading i ≤ threshold
    pub inliers: Vec<bool>,
    /// Residual of every reading against `position`
    pub residuals: Vec<f64>,
    pub num_inliers: usize,
    pub iterations: u32,
}

impl Consensus {
    pub fn inlier_readings<'r>(&self, readings: &'r [RangingReading]) -> Vec<&'r RangingReading> {
        readings
            .iter()
            .zip(&self.inliers)
            .filter_map(|(r, &keep)| keep.then_some(r))
            .collect()
    }
}

// ── Scoring ───────────────────────────────────────────────────────────────────

/// |‖position − receiver‖ − measured distance|
pub fn residual(position: &Point3, reading: &RangingReading) -> f64 {
    (position.distance(&reading.position()) - reading.distance_m()).abs()
}

/// Fill `residuals`/`inliers` for `candidate` and return the inlier count.
fn score(
    candidate: &Point3,
    readings: &[RangingReading],
    threshold_m: f64,
    residuals: &mut [f64],
    inliers: &mut [bool],
) -> usize {
    let mut count = 0;
    let rows = readings.iter().zip(residuals.iter_mut()).zip(inliers.iter_mut());
    for ((reading, res), inlier) in rows {
        *res = residual(candidate, reading);
        *inlier = *res <= threshold_m;
        if *inlier {
            count += 1;
        }
    }
    count
}

/// Adaptive iteration bound for the current inlier ratio.
///
/// Returns None when the ratio gives no information (w = 0), Some(0) when every
/// reading is an inlier, and falls back to `max_iterations` for non-finite bounds.
pub fn adaptive_iterations(
    confidence: f64,
    inlier_ratio: f64,
    min_samples: usize,
    max_iterations: u32,
) -> Option<u32> {
    if inlier_ratio <= 0.0 || inlier_ratio.is_nan() {
        return None;
    }
    let all_good = inlier_ratio.powi(min_samples as i32);
    if all_good >= 1.0 {
        return Some(0);
    }
    let numerator = (1.0 - confidence).ln();
    let denominator = (1.0 - all_good).ln();
    let bound = (numerator / denominator).ceil();
    if !bound.is_finite() || bound >= max_iterations as f64 {
        Some(max_iterations)
    } else {
        Some(bound.max(0.0) as u32)
    }
}

// ── Search loop ───────────────────────────────────────────────────────────────

/// Run the consensus search. `notify` receives iteration and progress events
/// synchronously, in iteration order.
pub fn search<F, R>(
    readings: &[RangingReading],
    fitter: &F,
    settings: &SearchSettings,
    rng: &mut R,
    mut notify: impl FnMut(SearchEvent),
) -> Result<Consensus, LocatorError>
where
    F: ModelFitter + ?Sized,
    R: Rng + ?Sized,
{
    let total = readings.len();
    if total < MIN_SAMPLES {
        return Err(LocatorError::NotReady { min_samples: MIN_SAMPLES });
    }

    let mut dynamic_max_iterations = settings.max_iterations;
    let mut iterations: u32 = 0;
    let mut last_progress: f32 = 0.0;

    let mut best_count = 0usize;
    let mut best_position: Option<Point3> = None;
    let mut best_inliers = vec![false; total];
    let mut best_residuals = vec![0.0; total];

    let mut current_inliers = vec![false; total];
    let mut current_residuals = vec![0.0; total];
    let mut sample: Vec<&RangingReading> = Vec::with_capacity(MIN_SAMPLES);

    while iterations < dynamic_max_iterations {
        sample.clear();
        sample.extend(index::sample(rng, total, MIN_SAMPLES).iter().map(|i| &readings[i]));

        match fitter.fit(&sample) {
            Ok(candidate) => {
                let count = score(
                    &candidate,
                    readings,
                    settings.threshold_m,
                    &mut current_residuals,
                    &mut current_inliers,
                );
                if count > best_count {
                    best_count = count;
                    best_position = Some(candidate);
                    std::mem::swap(&mut best_inliers, &mut current_inliers);
                    std::mem::swap(&mut best_residuals, &mut current_residuals);

                    let ratio = count as f64 / total as f64;
                    if let Some(bound) = adaptive_iterations(
                        settings.confidence,
                        ratio,
                        MIN_SAMPLES,
                        settings.max_iterations,
                    ) {
                        dynamic_max_iterations = bound.min(settings.max_iterations);
                    }
                    debug!(
                        iteration = iterations,
                        inliers = count,
                        total,
                        bound = dynamic_max_iterations,
                        "new best consensus"
                    );
                }
            }
            Err(e) => {
                debug!(iteration = iterations, error = %e, "sample skipped");
            }
        }

        let completed = iterations + 1;
        notify(SearchEvent::NextIteration(completed));

        let progress = if dynamic_max_iterations == 0 {
            1.0
        } else {
            (completed as f32 / dynamic_max_iterations as f32).min(1.0)
        };
        if progress - last_progress >= settings.progress_delta && progress > last_progress {
            last_progress = progress;
            notify(SearchEvent::Progress(progress));
        }

        iterations = completed;
    }

    match best_position {
        Some(position) if best_count >= MIN_SAMPLES => Ok(Consensus {
            position,
            inliers: best_inliers,
            residuals: best_residuals,
            num_inliers: best_count,
            iterations,
        }),
        _ => Err(LocatorError::NoConsensus { iterations, best_inliers: best_count }),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::error::FitError;
    use crate::fitter::MultilaterationSolver;
    use crate::testing::{access_point, exact_readings, readings_with_outliers};

    fn settings(threshold_m: f64) -> SearchSettings {
        SearchSettings { threshold_m, confidence: 0.99, max_iterations: 5000, progress_delta: 0.05 }
    }

    /// Returns the scripted positions in turn, wrapping around.
    struct ScriptedFitter {
        positions: Vec<Point3>,
        calls: Cell<usize>,
    }

    impl ModelFitter for ScriptedFitter {
        fn fit(&self, _samples: &[&RangingReading]) -> Result<Point3, FitError> {
            let i = self.calls.get();
            self.calls.set(i + 1);
            Ok(self.positions[i % self.positions.len()])
        }
    }

    struct FailingFitter;

    impl ModelFitter for FailingFitter {
        fn fit(&self, _samples: &[&RangingReading]) -> Result<Point3, FitError> {
            Err(FitError::Degenerate)
        }
    }

    /// Four readings consistent with `a` followed by four consistent with `b`.
    fn two_cluster_readings(a: &Point3, b: &Point3) -> Vec<RangingReading> {
        let near_a = [
            Point3::new(a.x + 3.0, a.y, a.z),
            Point3::new(a.x, a.y + 4.0, a.z),
            Point3::new(a.x, a.y, a.z + 5.0),
            Point3::new(a.x - 2.0, a.y - 2.0, a.z - 2.0),
        ];
        let near_b = [
            Point3::new(b.x + 1.0, b.y, b.z),
            Point3::new(b.x, b.y + 1.5, b.z),
            Point3::new(b.x, b.y, b.z + 2.5),
            Point3::new(b.x - 1.0, b.y - 1.0, b.z - 1.0),
        ];
        let mut readings = exact_readings(a, &near_a);
        readings.extend(exact_readings(b, &near_b));
        readings
    }

    #[test]
    fn residual_is_absolute_range_error() {
        let reading = RangingReading::new(access_point(), 3.0, None, Point3::origin()).unwrap();
        assert!((residual(&Point3::new(5.0, 0.0, 0.0), &reading) - 2.0).abs() < 1e-12);
        assert!((residual(&Point3::new(1.0, 0.0, 0.0), &reading) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn adaptive_bound_edge_cases() {
        assert_eq!(adaptive_iterations(0.99, 0.0, 4, 5000), None);
        assert_eq!(adaptive_iterations(0.99, 1.0, 4, 5000), Some(0));
        assert_eq!(adaptive_iterations(0.0, 0.5, 4, 5000), Some(0));
        assert_eq!(adaptive_iterations(1.0, 0.5, 4, 5000), Some(5000));
        // 0.5⁴ = 1/16 → ln(0.01)/ln(15/16) = 71.4
        assert_eq!(adaptive_iterations(0.99, 0.5, 4, 5000), Some(72));
        assert_eq!(adaptive_iterations(0.99, 0.5, 4, 10), Some(10));
    }

    #[test]
    fn adaptive_bound_shrinks_with_inlier_ratio() {
        let low = adaptive_iterations(0.99, 0.5, 4, 100_000).unwrap();
        let high = adaptive_iterations(0.99, 0.9, 4, 100_000).unwrap();
        assert!(high < low);
    }

    #[test]
    fn exact_readings_stop_after_first_full_consensus() {
        let mut rng = StdRng::seed_from_u64(7);
        let source = Point3::new(1.0, 2.0, 0.5);
        let (readings, _) = readings_with_outliers(&mut rng, &source, 30, 0.0, 1.0);
        let fitter = MultilaterationSolver::default();
        let consensus = search(&readings, &fitter, &settings(0.1), &mut rng, |_| {}).unwrap();
        assert_eq!(consensus.num_inliers, 30);
        assert_eq!(consensus.iterations, 1);
        assert!(consensus.position.distance(&source) < 1e-6);
    }

    #[test]
    fn outliers_are_rejected() {
        let mut rng = StdRng::seed_from_u64(11);
        let source = Point3::new(-1.0, 0.5, 2.0);
        let (readings, corrupted) = readings_with_outliers(&mut rng, &source, 60, 0.2, 10.0);
        // Keep every corrupted reading well outside the threshold
        let readings: Vec<RangingReading> = readings
            .iter()
            .zip(&corrupted)
            .map(|(r, &bad)| {
                let extra = if bad { 1.0 } else { 0.0 };
                let distance = r.distance_m() + extra;
                RangingReading::new(r.source().clone(), distance, None, r.position()).unwrap()
            })
            .collect();
        let fitter = MultilaterationSolver::default();
        let consensus = search(&readings, &fitter, &settings(0.1), &mut rng, |_| {}).unwrap();
        for (i, &bad) in corrupted.iter().enumerate() {
            if !bad {
                assert!(consensus.inliers[i], "clean reading {i} rejected");
            }
        }
        assert!(consensus.position.distance(&source) < 1e-6);
    }

    #[test]
    fn first_model_with_max_count_wins() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(40.0, 40.0, 40.0);
        let readings = two_cluster_readings(&a, &b);
        let cfg = SearchSettings { max_iterations: 2, ..settings(0.1) };
        let mut rng = StdRng::seed_from_u64(1);

        let a_first = ScriptedFitter { positions: vec![a, b], calls: Cell::new(0) };
        let consensus = search(&readings, &a_first, &cfg, &mut rng, |_| {}).unwrap();
        assert_eq!(consensus.position, a);
        assert_eq!(consensus.num_inliers, 4);
        assert!(consensus.inliers[..4].iter().all(|&v| v));

        let b_first = ScriptedFitter { positions: vec![b, a], calls: Cell::new(0) };
        let consensus = search(&readings, &b_first, &cfg, &mut rng, |_| {}).unwrap();
        assert_eq!(consensus.position, b);
        assert!(consensus.inliers[4..].iter().all(|&v| v));
    }

    #[test]
    fn failing_fitter_exhausts_budget_without_consensus() {
        let readings = exact_readings(
            &Point3::origin(),
            &[
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(0.0, 0.0, 1.0),
                Point3::new(1.0, 1.0, 1.0),
            ],
        );
        let cfg = SearchSettings { max_iterations: 25, ..settings(0.1) };
        let mut seen = 0;
        let err = search(&readings, &FailingFitter, &cfg, &mut StdRng::seed_from_u64(3), |e| {
            if let SearchEvent::NextIteration(_) = e {
                seen += 1;
            }
        })
        .unwrap_err();
        assert_eq!(err, LocatorError::NoConsensus { iterations: 25, best_inliers: 0 });
        assert_eq!(seen, 25);
    }

    #[test]
    fn events_are_ordered_and_progress_is_monotonic() {
        let readings = two_cluster_readings(&Point3::origin(), &Point3::new(40.0, 40.0, 40.0));
        // Always the same 4-inlier model: ratio 0.5 → bound 72, capped at 20
        let fitter = ScriptedFitter { positions: vec![Point3::origin()], calls: Cell::new(0) };
        let cfg = SearchSettings { max_iterations: 20, progress_delta: 0.1, ..settings(0.1) };
        let mut events = Vec::new();
        let mut rng = StdRng::seed_from_u64(5);
        search(&readings, &fitter, &cfg, &mut rng, |e| events.push(e)).unwrap();

        let iterations: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                SearchEvent::NextIteration(i) => Some(*i),
                _ => None,
            })
            .collect();
        assert_eq!(iterations, (1..=20).collect::<Vec<_>>());

        let progress: Vec<f32> = events
            .iter()
            .filter_map(|e| match e {
                SearchEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert!(!progress.is_empty());
        assert!(progress.windows(2).all(|w| w[1] - w[0] >= 0.1 - 1e-6));
        assert!(progress.iter().all(|p| (0.0..=1.0).contains(p)));
        assert!(progress.last().copied().unwrap() >= 0.85);
    }

    #[test]
    fn fewer_than_minimum_is_not_ready() {
        let readings = exact_readings(&Point3::origin(), &[Point3::new(1.0, 0.0, 0.0)]);
        let err = search(
            &readings,
            &MultilaterationSolver::default(),
            &settings(0.1),
            &mut StdRng::seed_from_u64(0),
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, LocatorError::NotReady { .. }));
    }
}
