//! # radio-types
//!
//! Shared value objects for the radio source locator.
//!
//! These types are used by:
//! - `radio-locator`: consuming ranging readings, producing located sources
//! - `radio-sim`: synthesising readings and serialising trial reports
//!
//! ## Coordinate Conventions
//!
//! - **Local frame**: right-hand Cartesian, metres, Z = up
//! - Covariances are row-major 3×3 arrays in m²

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Geometry ──────────────────────────────────────────────────────────────────

/// Row-major 3×3 matrix (covariances, m²)
pub type Matrix3 = [[f64; 3]; 3];

/// 3D point in the local frame (metres)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self { Self { x, y, z } }
    pub fn origin() -> Self { Self::default() }

    pub fn add(&self, other: &Point3) -> Point3 {
        Point3::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
    pub fn sub(&self, other: &Point3) -> Point3 {
        Point3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
    pub fn distance(&self, other: &Point3) -> f64 {
        self.sub(other).norm()
    }
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

// ── Radio Sources ─────────────────────────────────────────────────────────────

/// WiFi access point identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiAccessPoint {
    /// MAC address of the radio, e.g. "bc:ae:c5:b9:2c:7e"
    pub bssid: String,
    /// Network name, when broadcast
    pub ssid: Option<String>,
    /// Carrier frequency in Hz (2.4 GHz / 5 GHz bands)
    pub frequency_hz: f64,
    /// Transmitted power, when known from calibration
    pub transmitted_power_dbm: Option<f64>,
}

/// Bluetooth LE beacon identity (iBeacon / AltBeacon style).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    /// Beacon identifiers (e.g. proximity UUID, major, minor)
    pub identifiers: Vec<String>,
    pub frequency_hz: f64,
    /// Calibrated transmitted power (RSSI at 1 m convention)
    pub transmitted_power_dbm: f64,
    pub bluetooth_address: Option<String>,
    pub beacon_type_code: u16,
    pub manufacturer: u16,
}

/// Any radio source that can be located from ranging readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RadioSource {
    WifiAccessPoint(WifiAccessPoint),
    Beacon(Beacon),
}

impl RadioSource {
    /// Stable textual identity: BSSID for access points, joined identifiers for beacons.
    pub fn id(&self) -> String {
        match self {
            Self::WifiAccessPoint(ap) => ap.bssid.clone(),
            Self::Beacon(b) => b.identifiers.join(":"),
        }
    }

    pub fn frequency_hz(&self) -> f64 {
        match self {
            Self::WifiAccessPoint(ap) => ap.frequency_hz,
            Self::Beacon(b) => b.frequency_hz,
        }
    }

    pub fn transmitted_power_dbm(&self) -> Option<f64> {
        match self {
            Self::WifiAccessPoint(ap) => ap.transmitted_power_dbm,
            Self::Beacon(b) => Some(b.transmitted_power_dbm),
        }
    }
}

// ── Ranging Reading ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidReading {
    #[error("distance must be a finite value >= 0, got {0}")]
    Distance(f64),
    #[error("distance standard deviation must be a finite value > 0, got {0}")]
    DistanceStd(f64),
    #[error("receiver position must be finite")]
    Position,
}

/// One distance observation from a known receiver position to a radio source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangingReading {
    source: RadioSource,
    /// Measured distance to the source, meters
    distance_m: f64,
    /// Standard deviation of the measured distance, when known
    distance_std_m: Option<f64>,
    /// Receiver position where the reading was taken
    position: Point3,
}

impl RangingReading {
    pub fn new(
        source: RadioSource,
        distance_m: f64,
        distance_std_m: Option<f64>,
        position: Point3,
    ) -> Result<Self, InvalidReading> {
        if !distance_m.is_finite() || distance_m < 0.0 {
            return Err(InvalidReading::Distance(distance_m));
        }
        if let Some(std) = distance_std_m {
            if !std.is_finite() || std <= 0.0 {
                return Err(InvalidReading::DistanceStd(std));
            }
        }
        if !position.is_finite() {
            return Err(InvalidReading::Position);
        }
        Ok(Self { source, distance_m, distance_std_m, position })
    }

    pub fn source(&self) -> &RadioSource { &self.source }
    pub fn distance_m(&self) -> f64 { self.distance_m }
    pub fn distance_std_m(&self) -> Option<f64> { self.distance_std_m }
    pub fn position(&self) -> Point3 { self.position }
}

// ── Located Source (estimator output) ─────────────────────────────────────────

/// A radio source together with its estimated position.
/// Identity fields are carried over unchanged from the input source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatedRadioSource {
    pub source: RadioSource,
    pub position: Point3,
    /// Position covariance (m²), when it was computed
    pub position_covariance: Option<Matrix3>,
}

impl LocatedRadioSource {
    pub fn id(&self) -> String { self.source.id() }

    /// 1-σ radius of the horizontal+vertical error, sqrt(trace(Σ))
    pub fn position_std_m(&self) -> Option<f64> {
        self.position_covariance
            .map(|c| (c[0][0] + c[1][1] + c[2][2]).max(0.0).sqrt())
    }
}
