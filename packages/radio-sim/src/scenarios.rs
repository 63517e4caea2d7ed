//! scenarios.rs — Named presets layered over config.toml
//!
//! Each preset stresses one failure mode of the locator:
//!   clean       — small Gaussian ranging noise only
//!   outliers    — 20 % of readings pushed out by |N(0, 10 m)|
//!   heavy_nlos  — 40 % of readings carry a positive NLOS bias
//!   sparse      — the minimum usable number of readings

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::SimConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum Scenario {
    Clean,
    Outliers,
    HeavyNlos,
    Sparse,
}

impl Scenario {
    /// Overwrite the noise/geometry fields this preset controls.
    pub fn apply(self, cfg: &mut SimConfig) {
        let noise = &mut cfg.noise;
        match self {
            Scenario::Clean => {
                noise.range_std_m = 0.01;
                noise.outlier_fraction = 0.0;
                noise.nlos_bias_m = 0.0;
            }
            Scenario::Outliers => {
                noise.outlier_fraction = 0.2;
                noise.outlier_std_m = 10.0;
                noise.nlos_bias_m = 0.0;
            }
            Scenario::HeavyNlos => {
                noise.outlier_fraction = 0.4;
                noise.outlier_std_m = 1.0;
                noise.nlos_bias_m = 0.5;
                // Fewer clean samples per draw; search longer
                cfg.locator.confidence = cfg.locator.confidence.max(0.999);
            }
            Scenario::Sparse => {
                cfg.geometry.readings = radio_locator::MIN_SAMPLES + 2;
                noise.outlier_fraction = 0.0;
                noise.nlos_bias_m = 0.0;
            }
        }
    }
}
