//! fitter.rs — Nonlinear multilateration model fitter
//!
//! Algorithm: closed-form linearised start, then Levenberg–Marquardt minimizing
//!   J = Σᵢ wᵢ (‖x − pᵢ‖ − dᵢ)²
//! where wᵢ = 1/σ²ᵢ (unit when the reading carries no σ). Converged means a step
//! below `converge_threshold_m`, an exact fit, or no descent step left; running
//! out of iterations first is [`FitError::NotConverged`].
//!
//! The linear start subtracts the first sphere equation from the others:
//!   2(pᵢ − p₀)·x = ‖pᵢ‖² − ‖p₀‖² − (dᵢ² − d₀²)
//! which is exact for noise-free readings and needs non-coplanar receivers.

use nalgebra::{Matrix3, Vector3};
use radio_types::{Point3, RangingReading};
use tracing::trace;

use crate::error::FitError;
use crate::propagation::{range_gradient, reading_weight};

/// Readings needed to fix a 3D position.
pub const MIN_SAMPLES: usize = 4;

/// Ratio of smallest to largest eigenvalue below which the linear system is singular
const CONDITION_FLOOR: f64 = 1e-12;

/// Weighted cost treated as an exact fit
const COST_FLOOR: f64 = 1e-24;

// ── Fitter seam ───────────────────────────────────────────────────────────────

/// Turns a set of readings into a candidate source position.
pub trait ModelFitter {
    /// Fit from a (typically minimal) sample with no prior.
    fn fit(&self, samples: &[&RangingReading]) -> Result<Point3, FitError>;

    /// Weighted fit over many readings starting from `seed`.
    ///
    /// Default: ignore weights and seed and use [`ModelFitter::fit`].
    fn fit_weighted(
        &self,
        samples: &[&RangingReading],
        _weights: &[f64],
        _seed: Point3,
    ) -> Result<Point3, FitError> {
        self.fit(samples)
    }
}

// ── Levenberg–Marquardt multilateration ──────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MultilaterationSolver {
    /// Maximum LM iterations
    pub max_iterations: u32,
    /// Stop when the position update is below this (meters)
    pub converge_threshold_m: f64,
}

impl Default for MultilaterationSolver {
    fn default() -> Self {
        Self { max_iterations: 100, converge_threshold_m: 1e-10 }
    }
}

impl ModelFitter for MultilaterationSolver {
    fn fit(&self, samples: &[&RangingReading]) -> Result<Point3, FitError> {
        check_sample_count(samples)?;
        let start = linear_start(samples).ok_or(FitError::Degenerate)?;
        let weights: Vec<f64> = samples.iter().map(|r| reading_weight(r)).collect();
        self.levenberg_marquardt(samples, &weights, start)
    }

    fn fit_weighted(
        &self,
        samples: &[&RangingReading],
        weights: &[f64],
        seed: Point3,
    ) -> Result<Point3, FitError> {
        check_sample_count(samples)?;
        if weights.len() != samples.len() || !seed.is_finite() {
            return Err(FitError::Degenerate);
        }
        self.levenberg_marquardt(samples, weights, seed)
    }
}

fn check_sample_count(samples: &[&RangingReading]) -> Result<(), FitError> {
    if samples.len() < MIN_SAMPLES {
        Err(FitError::InsufficientSamples { required: MIN_SAMPLES, got: samples.len() })
    } else {
        Ok(())
    }
}

/// Weighted sum of squared range residuals
fn cost(samples: &[&RangingReading], weights: &[f64], x: &Point3) -> f64 {
    samples
        .iter()
        .zip(weights)
        .map(|(r, w)| {
            let res = x.distance(&r.position()) - r.distance_m();
            w * res * res
        })
        .sum()
}

/// Closed-form position from the linearised sphere differences.
/// None when receivers are coplanar or coincident.
pub fn linear_start(samples: &[&RangingReading]) -> Option<Point3> {
    let first = samples.first()?;
    let p0 = first.position();
    let d0 = first.distance_m();
    let p0_sq = p0.x * p0.x + p0.y * p0.y + p0.z * p0.z;

    let mut ata = Matrix3::<f64>::zeros();
    let mut atb = Vector3::<f64>::zeros();
    for r in &samples[1..] {
        let p = r.position();
        let d = r.distance_m();
        let row = Vector3::new(2.0 * (p.x - p0.x), 2.0 * (p.y - p0.y), 2.0 * (p.z - p0.z));
        let b = (p.x * p.x + p.y * p.y + p.z * p.z) - p0_sq - (d * d - d0 * d0);
        ata += row * row.transpose();
        atb += row * b;
    }

    let eig = ata.symmetric_eigenvalues();
    let max = eig.max();
    let min = eig.min();
    if max.is_nan() || max <= 0.0 || min / max < CONDITION_FLOOR {
        return None;
    }

    let x = ata.cholesky()?.solve(&atb);
    let p = Point3::new(x[0], x[1], x[2]);
    p.is_finite().then_some(p)
}

impl MultilaterationSolver {
    fn levenberg_marquardt(
        &self,
        samples: &[&RangingReading],
        weights: &[f64],
        start: Point3,
    ) -> Result<Point3, FitError> {
        let mut x = start;
        let mut current_cost = cost(samples, weights, &x);
        let mut lambda = 1e-3;

        for iter in 0..self.max_iterations {
            if current_cost < COST_FLOOR {
                return finish(x);
            }

            // Normal equations: (JᵀWJ + λ·diag) δ = −JᵀW r
            let mut jtj = Matrix3::<f64>::zeros();
            let mut jtr = Vector3::<f64>::zeros();
            for (r, &w) in samples.iter().zip(weights) {
                let Some(j) = range_gradient(&x, &r.position()) else { continue };
                let res = x.distance(&r.position()) - r.distance_m();
                jtj += j * j.transpose() * w;
                jtr += j * (w * res);
            }

            let mut accepted = false;
            for _ in 0..10 {
                let mut damped = jtj;
                for i in 0..3 {
                    damped[(i, i)] += lambda * (1.0 + jtj[(i, i)]);
                }
                let Some(chol) = damped.cholesky() else {
                    lambda *= 10.0;
                    continue;
                };
                let step = chol.solve(&(-jtr));
                let candidate = Point3::new(x.x + step[0], x.y + step[1], x.z + step[2]);
                let candidate_cost = cost(samples, weights, &candidate);

                if candidate_cost.is_finite() && candidate_cost <= current_cost {
                    x = candidate;
                    current_cost = candidate_cost;
                    lambda = (lambda * 0.1).max(1e-12);
                    accepted = true;

                    if step.norm() < self.converge_threshold_m {
                        trace!(iter, cost = current_cost, "multilateration converged");
                        return finish(x);
                    }
                    break;
                }
                lambda *= 10.0;
                if lambda > 1e12 {
                    break;
                }
            }

            if !accepted {
                // Stationary: no damping gives a descent step
                trace!(iter, cost = current_cost, "multilateration stationary");
                return finish(x);
            }
        }

        if current_cost < COST_FLOOR {
            return finish(x);
        }
        trace!(
            max_iterations = self.max_iterations,
            cost = current_cost,
            "multilateration iteration cap"
        );
        Err(FitError::NotConverged)
    }
}

fn finish(x: Point3) -> Result<Point3, FitError> {
    if x.is_finite() { Ok(x) } else { Err(FitError::NotConverged) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{access_point, exact_readings};

    fn refs(readings: &[RangingReading]) -> Vec<&RangingReading> {
        readings.iter().collect()
    }

    #[test]
    fn minimal_sample_recovers_exact_position() {
        let truth = Point3::new(1.5, -2.0, 0.75);
        let receivers = [
            Point3::new(5.0, 0.0, 0.0),
            Point3::new(0.0, 5.0, 0.0),
            Point3::new(0.0, 0.0, 5.0),
            Point3::new(-4.0, -3.0, 2.0),
        ];
        let readings = exact_readings(&truth, &receivers);
        let p = MultilaterationSolver::default().fit(&refs(&readings)).unwrap();
        assert!(p.distance(&truth) < 1e-8, "error {}", p.distance(&truth));
    }

    #[test]
    fn too_few_samples() {
        let readings = exact_readings(
            &Point3::origin(),
            &[Point3::new(1.0, 0.0, 0.0), Point3::new(0.0, 1.0, 0.0), Point3::new(0.0, 0.0, 1.0)],
        );
        assert_eq!(
            MultilaterationSolver::default().fit(&refs(&readings)),
            Err(FitError::InsufficientSamples { required: 4, got: 3 })
        );
    }

    #[test]
    fn coplanar_receivers_are_degenerate() {
        let receivers = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(4.0, 0.0, 0.0),
            Point3::new(0.0, 4.0, 0.0),
            Point3::new(4.0, 4.0, 0.0),
        ];
        let readings = exact_readings(&Point3::new(1.0, 1.0, 2.0), &receivers);
        assert_eq!(
            MultilaterationSolver::default().fit(&refs(&readings)),
            Err(FitError::Degenerate)
        );
    }

    fn spread_receivers() -> [Point3; 6] {
        [
            Point3::new(5.0, 0.0, 0.0),
            Point3::new(0.0, 5.0, 0.0),
            Point3::new(0.0, 0.0, 5.0),
            Point3::new(-4.0, -3.0, 2.0),
            Point3::new(3.0, -3.0, -2.0),
            Point3::new(-2.0, 4.0, -1.0),
        ]
    }

    #[test]
    fn weighted_fit_from_seed_converges() {
        let truth = Point3::new(0.3, 0.2, 1.1);
        let readings = exact_readings(&truth, &spread_receivers());
        let weights = vec![1.0; readings.len()];
        let p = MultilaterationSolver::default()
            .fit_weighted(&refs(&readings), &weights, Point3::new(1.0, 1.0, 1.0))
            .unwrap();
        assert!(p.distance(&truth) < 1e-6);
    }

    #[test]
    fn iteration_cap_without_convergence_is_an_error() {
        let truth = Point3::new(0.3, 0.2, 1.1);
        let readings = exact_readings(&truth, &spread_receivers());
        let weights = vec![1.0; readings.len()];
        let capped = MultilaterationSolver { max_iterations: 2, ..Default::default() };
        let r = capped.fit_weighted(&refs(&readings), &weights, Point3::new(30.0, -20.0, 15.0));
        assert_eq!(r, Err(FitError::NotConverged));

        // Same start converges with the default budget
        let r = MultilaterationSolver::default().fit_weighted(
            &refs(&readings),
            &weights,
            Point3::new(30.0, -20.0, 15.0),
        );
        assert!(r.is_ok(), "{r:?}");
    }

    #[test]
    fn exact_start_converges_within_one_iteration() {
        let truth = Point3::new(-1.0, 2.0, 0.5);
        let readings = exact_readings(&truth, &spread_receivers());
        let weights = vec![1.0; readings.len()];
        let one = MultilaterationSolver { max_iterations: 1, ..Default::default() };
        let p = one.fit_weighted(&refs(&readings), &weights, truth).unwrap();
        assert!(p.distance(&truth) < 1e-9);
    }

    #[test]
    fn weight_length_mismatch_is_rejected() {
        let receivers = [
            Point3::new(5.0, 0.0, 0.0),
            Point3::new(0.0, 5.0, 0.0),
            Point3::new(0.0, 0.0, 5.0),
            Point3::new(-4.0, -3.0, 2.0),
        ];
        let readings = exact_readings(&Point3::origin(), &receivers);
        let r = MultilaterationSolver::default()
            .fit_weighted(&refs(&readings), &[1.0], Point3::origin());
        assert_eq!(r, Err(FitError::Degenerate));
    }

    #[test]
    fn default_fit_weighted_delegates_to_fit() {
        struct Fixed;
        impl ModelFitter for Fixed {
            fn fit(&self, _samples: &[&RangingReading]) -> Result<Point3, FitError> {
                Ok(Point3::new(9.0, 9.0, 9.0))
            }
        }
        let reading = RangingReading::new(access_point(), 1.0, None, Point3::origin()).unwrap();
        let p = Fixed.fit_weighted(&[&reading], &[1.0], Point3::origin()).unwrap();
        assert_eq!(p, Point3::new(9.0, 9.0, 9.0));
    }
}
