//! physics.rs — Ranging measurement synthesis
//!
//! Simulates the measurement chain of one reading:
//! 1. Place a receiver uniformly inside the geometry box
//! 2. Compute the true receiver → source range
//! 3. Apply measurement noise: Gaussian range error, or log-distance RSSI noise
//!    inverted back to a distance (σ propagated through the path-loss model)
//! 4. With probability `outlier_fraction`, corrupt the reading: NLOS bias plus
//!    |N(0, outlier_std)| excess path, always lengthening the range

use anyhow::{ensure, Context, Result};
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
use radio_locator::{PathLossModel, PowerVariances};
use radio_types::{Point3, RadioSource, RangingReading};
use serde::Deserialize;

/// Tx power assumed for access points that do not advertise one
const DEFAULT_TX_POWER_DBM: f64 = -20.0;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    pub readings: usize,
    pub center: Point3,
    pub half_extent_m: [f64; 3],
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self { readings: 60, center: Point3::origin(), half_extent_m: [10.0, 10.0, 3.0] }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    /// σ of direct range noise (m)
    pub range_std_m: f64,
    /// When set, distances come from RSSI with this σ (dB) instead
    pub rssi_std_db: Option<f64>,
    pub path_loss_exponent: f64,
    pub outlier_fraction: f64,
    pub outlier_std_m: f64,
    /// Mean positive bias of corrupted (NLOS) readings (m)
    pub nlos_bias_m: f64,
    /// Attach the noise σ to each reading (enables weighting and covariance)
    pub attach_std: bool,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            range_std_m: 0.02,
            rssi_std_db: None,
            path_loss_exponent: 2.0,
            outlier_fraction: 0.2,
            outlier_std_m: 10.0,
            nlos_bias_m: 0.0,
            attach_std: true,
        }
    }
}

impl NoiseConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.range_std_m >= 0.0, "range_std_m must be >= 0, got {}", self.range_std_m);
        ensure!(
            self.outlier_std_m >= 0.0,
            "outlier_std_m must be >= 0, got {}",
            self.outlier_std_m
        );
        ensure!(self.nlos_bias_m >= 0.0, "nlos_bias_m must be >= 0, got {}", self.nlos_bias_m);
        ensure!(
            (0.0..=1.0).contains(&self.outlier_fraction),
            "outlier_fraction must be in [0, 1], got {}",
            self.outlier_fraction
        );
        ensure!(self.path_loss_exponent > 0.0, "path_loss_exponent must be > 0");
        if let Some(db) = self.rssi_std_db {
            ensure!(db >= 0.0, "rssi_std_db must be >= 0, got {db}");
        }
        Ok(())
    }
}

// ── Synthesis ─────────────────────────────────────────────────────────────────

/// Readings of one trial, with ground truth on which were corrupted.
#[derive(Debug, Clone)]
pub struct ReadingBatch {
    pub readings: Vec<RangingReading>,
    pub corrupted: Vec<bool>,
}

impl ReadingBatch {
    pub fn corrupted_count(&self) -> usize {
        self.corrupted.iter().filter(|&&c| c).count()
    }
}

/// One uniformly placed receiver inside the geometry box.
pub fn receiver_position(rng: &mut impl Rng, geometry: &GeometryConfig) -> Point3 {
    let [hx, hy, hz] = geometry.half_extent_m;
    let c = geometry.center;
    Point3::new(c.x + offset(rng, hx), c.y + offset(rng, hy), c.z + offset(rng, hz))
}

fn offset(rng: &mut impl Rng, half_extent: f64) -> f64 {
    if half_extent > 0.0 { rng.gen_range(-half_extent..half_extent) } else { 0.0 }
}

/// Measured distance and its σ for a true range, before outlier corruption.
fn measure(
    rng: &mut impl Rng,
    source: &RadioSource,
    true_range: f64,
    noise: &NoiseConfig,
) -> Result<(f64, f64)> {
    match noise.rssi_std_db {
        Some(rssi_std) => {
            let model = PathLossModel {
                frequency_hz: source.frequency_hz(),
                path_loss_exponent: noise.path_loss_exponent,
            };
            let tx = source.transmitted_power_dbm().unwrap_or(DEFAULT_TX_POWER_DBM);
            let rssi_noise = Normal::new(0.0, rssi_std).context("invalid rssi_std_db")?;
            let rssi = model.received_power_dbm(tx, true_range) + rssi_noise.sample(rng);
            let variances =
                PowerVariances { rx_power_dbm2: rssi_std * rssi_std, ..Default::default() };
            let distance = model.distance_from_rssi(tx, rssi);
            Ok((distance, model.distance_variance(tx, rssi, &variances).sqrt()))
        }
        None => {
            let range_noise = Normal::new(0.0, noise.range_std_m).context("invalid range_std_m")?;
            Ok((true_range + range_noise.sample(rng), noise.range_std_m))
        }
    }
}

/// Synthesize `geometry.readings` readings of `source` located at `truth`.
pub fn synthesize(
    rng: &mut impl Rng,
    source: &RadioSource,
    truth: &Point3,
    geometry: &GeometryConfig,
    noise: &NoiseConfig,
) -> Result<ReadingBatch> {
    noise.validate()?;
    let outlier_noise = Normal::new(0.0, noise.outlier_std_m).context("invalid outlier_std_m")?;
    let nlos_noise = Normal::new(noise.nlos_bias_m, noise.nlos_bias_m / 3.0)
        .context("invalid nlos_bias_m")?;
    let unit = Uniform::new(0.0, 1.0);

    let mut readings = Vec::with_capacity(geometry.readings);
    let mut corrupted = Vec::with_capacity(geometry.readings);

    for _ in 0..geometry.readings {
        let receiver = receiver_position(rng, geometry);
        let true_range = receiver.distance(truth);
        let (mut distance, std) = measure(rng, source, true_range, noise)?;

        let is_outlier = unit.sample(rng) < noise.outlier_fraction;
        if is_outlier {
            distance += nlos_noise.sample(rng).max(0.0) + outlier_noise.sample(rng).abs();
        }

        let distance_std = (noise.attach_std && std > 0.0 && std.is_finite()).then_some(std);
        let reading = RangingReading::new(source.clone(), distance.max(0.0), distance_std, receiver)
            .context("synthesized reading rejected")?;
        readings.push(reading);
        corrupted.push(is_outlier);
    }

    Ok(ReadingBatch { readings, corrupted })
}
