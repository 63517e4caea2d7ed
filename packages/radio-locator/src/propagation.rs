//! propagation.rs — Radio path-loss model and first-order uncertainty propagation
//!
//! Log-distance (Friis) model:
//!   Prx = Ptx + 10·n·log10(k / d),   k = c / (4π·f)
//!   d   = k · 10^((Ptx − Prx) / (10·n))
//!
//! Variances are propagated with the first-order Jacobian of these relations:
//!   σ²_out = Σ (∂f/∂xᵢ)² σ²ᵢ
//! and the position covariance with the linearised range residuals at a solution.

use nalgebra::{Matrix3, Vector3};
use radio_types::{Point3, RangingReading};

use crate::error::LocatorError;

pub const SPEED_OF_LIGHT_MPS: f64 = 299_792_458.0;

// ── Power units ───────────────────────────────────────────────────────────────

/// dBm → watts
pub fn dbm_to_power(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0) * 1e-3
}

/// watts → dBm
pub fn power_to_dbm(watts: f64) -> f64 {
    10.0 * (watts * 1e3).log10()
}

// ── Path-loss model ───────────────────────────────────────────────────────────

/// Log-distance path-loss parameters for one radio source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathLossModel {
    pub frequency_hz: f64,
    /// 2.0 = free space, 2.5–4.0 indoor
    pub path_loss_exponent: f64,
}

impl PathLossModel {
    pub fn free_space(frequency_hz: f64) -> Self {
        Self { frequency_hz, path_loss_exponent: 2.0 }
    }

    fn k(&self) -> f64 {
        SPEED_OF_LIGHT_MPS / (4.0 * std::f64::consts::PI * self.frequency_hz)
    }

    /// Expected RSSI (dBm) at `distance_m` from a source transmitting `tx_power_dbm`
    pub fn received_power_dbm(&self, tx_power_dbm: f64, distance_m: f64) -> f64 {
        tx_power_dbm + 10.0 * self.path_loss_exponent * (self.k() / distance_m).log10()
    }

    /// Distance (m) implied by a received power
    pub fn distance_from_rssi(&self, tx_power_dbm: f64, rx_power_dbm: f64) -> f64 {
        self.k() * 10f64.powf((tx_power_dbm - rx_power_dbm) / (10.0 * self.path_loss_exponent))
    }

    /// Variance (m²) of the RSSI-derived distance.
    pub fn distance_variance(
        &self,
        tx_power_dbm: f64,
        rx_power_dbm: f64,
        variances: &PowerVariances,
    ) -> f64 {
        let n = self.path_loss_exponent;
        let d = self.distance_from_rssi(tx_power_dbm, rx_power_dbm);
        let g = std::f64::consts::LN_10 / (10.0 * n);

        let d_tx = d * g;
        let d_rx = -d * g;
        let d_n = -d * g * (tx_power_dbm - rx_power_dbm) / n;

        d_tx * d_tx * variances.tx_power_dbm2
            + d_rx * d_rx * variances.rx_power_dbm2
            + d_n * d_n * variances.path_loss_exponent
    }

    /// Variance (dBm²) of the expected RSSI given tx power, distance and exponent variances.
    pub fn rssi_variance(
        &self,
        distance_m: f64,
        tx_power_var_dbm2: f64,
        distance_var_m2: f64,
        path_loss_exponent_var: f64,
    ) -> f64 {
        let n = self.path_loss_exponent;
        let d_tx = 1.0;
        let d_dist = -10.0 * n / (distance_m * std::f64::consts::LN_10);
        let d_n = 10.0 * (self.k() / distance_m).log10();

        d_tx * d_tx * tx_power_var_dbm2
            + d_dist * d_dist * distance_var_m2
            + d_n * d_n * path_loss_exponent_var
    }
}

/// Input variances for [`PathLossModel::distance_variance`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerVariances {
    pub tx_power_dbm2: f64,
    pub rx_power_dbm2: f64,
    pub path_loss_exponent: f64,
}

// ── Position covariance ───────────────────────────────────────────────────────

/// Least-squares weight for a reading: 1/σ² when known, unit otherwise.
pub fn reading_weight(reading: &RangingReading) -> f64 {
    match reading.distance_std_m() {
        Some(std) => 1.0 / (std * std),
        None => 1.0,
    }
}

/// Unit vector receiver → position, i.e. ∂‖x − p‖/∂x. None when coincident.
pub(crate) fn range_gradient(position: &Point3, receiver: &Point3) -> Option<Vector3<f64>> {
    let delta = Vector3::new(
        position.x - receiver.x,
        position.y - receiver.y,
        position.z - receiver.z,
    );
    let norm = delta.norm();
    if norm < 1e-12 {
        None
    } else {
        Some(delta / norm)
    }
}

/// Position covariance at `position` from the weighted range residuals of `readings`.
///
/// Cov = (JᵀWJ)⁻¹ · JᵀWΣWJ · (JᵀWJ)⁻¹ with Σ = diag(σᵢ²). Readings without a
/// standard deviation take `fallback_std_m` (zero variance when None). With every
/// σ known this is (JᵀWJ)⁻¹.
pub fn position_covariance(
    readings: &[&RangingReading],
    position: &Point3,
    fallback_std_m: Option<f64>,
) -> Result<radio_types::Matrix3, LocatorError> {
    let mut normal = Matrix3::<f64>::zeros();
    let mut spread = Matrix3::<f64>::zeros();

    for reading in readings {
        let Some(j) = range_gradient(position, &reading.position()) else { continue };
        let w = reading_weight(reading);
        let var = reading.distance_std_m().or(fallback_std_m).map_or(0.0, |s| s * s);
        let jjt = j * j.transpose();
        normal += jjt * w;
        spread += jjt * (w * w * var);
    }

    let chol = normal.cholesky().ok_or_else(|| {
        LocatorError::NumericalFailure("normal matrix is not positive-definite".to_string())
    })?;
    let inv = chol.inverse();
    let cov = inv * spread * inv;
    let cov = (cov + cov.transpose()) * 0.5;

    if cov.iter().any(|v| !v.is_finite()) {
        return Err(LocatorError::NumericalFailure("covariance is not finite".to_string()));
    }
    Ok(to_array(&cov))
}

fn to_array(m: &Matrix3<f64>) -> radio_types::Matrix3 {
    let mut out = [[0.0; 3]; 3];
    for (r, row) in out.iter_mut().enumerate() {
        for (c, v) in row.iter_mut().enumerate() {
            *v = m[(r, c)];
        }
    }
    out
}
