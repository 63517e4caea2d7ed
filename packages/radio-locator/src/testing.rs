//! Synthetic reading sets shared by the unit tests.

use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
use radio_types::{Point3, RadioSource, RangingReading, WifiAccessPoint};

pub(crate) fn access_point() -> RadioSource {
    RadioSource::WifiAccessPoint(WifiAccessPoint {
        bssid: "bc:ae:c5:b9:2c:7e".to_string(),
        ssid: Some("lab-ap".to_string()),
        frequency_hz: 2.4e9,
        transmitted_power_dbm: Some(-20.0),
    })
}

/// Noise-free readings from `receivers` to `source`.
pub(crate) fn exact_readings(source: &Point3, receivers: &[Point3]) -> Vec<RangingReading> {
    receivers
        .iter()
        .map(|p| RangingReading::new(access_point(), p.distance(source), None, *p).unwrap())
        .collect()
}

/// Random receiver inside a 20 m cube centred on the origin.
pub(crate) fn random_receiver(rng: &mut impl Rng) -> Point3 {
    let u = Uniform::new(-10.0, 10.0);
    Point3::new(u.sample(rng), u.sample(rng), u.sample(rng))
}

/// `n` readings of `source`; a fraction are pushed outward by |N(0, outlier_std)|.
/// Returns the readings and which ones were corrupted.
pub(crate) fn readings_with_outliers(
    rng: &mut impl Rng,
    source: &Point3,
    n: usize,
    outlier_fraction: f64,
    outlier_std: f64,
) -> (Vec<RangingReading>, Vec<bool>) {
    let outlier_noise = Normal::new(0.0, outlier_std).unwrap();
    let mut readings = Vec::with_capacity(n);
    let mut corrupted = Vec::with_capacity(n);
    for _ in 0..n {
        let p = random_receiver(rng);
        let mut distance = p.distance(source);
        let is_outlier = rng.gen_bool(outlier_fraction);
        if is_outlier {
            distance += outlier_noise.sample(rng).abs();
        }
        readings.push(RangingReading::new(access_point(), distance, None, p).unwrap());
        corrupted.push(is_outlier);
    }
    (readings, corrupted)
}
