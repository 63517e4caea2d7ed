//! main.rs — Ranging simulator entry point
//!
//! Runs repeated locate trials against synthetic readings:
//!   1. Synthesis: place receivers, range the configured source, corrupt a
//!      fraction of readings (see physics.rs)
//!   2. Estimation: robust RANSAC locator with the `[locator]` table settings
//!   3. Report: success rate against `tolerance_m`, error statistics and outlier
//!      rejection, as a summary log line or a JSON document (`--json`)
//!
//! Trial failures are logged and counted; the run itself never aborts on them.

mod physics;
mod scenarios;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use radio_locator::{LocatorConfig, RobustRangingLocator};
use radio_types::{Point3, RadioSource, WifiAccessPoint};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use physics::{GeometryConfig, NoiseConfig, ReadingBatch};
use scenarios::Scenario;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "radio-sim", about = "Robust radio source locator simulator")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Preset applied on top of the config file
    #[arg(short, long)]
    scenario: Option<Scenario>,
    /// Number of trials (overrides [run].trials)
    #[arg(short, long)]
    trials: Option<u32>,
    /// RNG seed for reproducible runs (overrides [run].seed)
    #[arg(long)]
    seed: Option<u64>,
    /// Print the full JSON report to stdout
    #[arg(long)]
    json: bool,
}

// ── Config (populated from config.toml) ───────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub run: RunConfig,
    pub source: SourceConfig,
    pub geometry: GeometryConfig,
    pub noise: NoiseConfig,
    pub locator: LocatorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub trials: u32,
    pub tolerance_m: f64,
    pub seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { trials: 50, tolerance_m: 0.1, seed: None }
    }
}

/// Source identity plus its true position.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub position: Point3,
    #[serde(flatten)]
    pub radio: RadioSource,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            position: Point3::new(1.5, -2.0, 1.0),
            radio: RadioSource::WifiAccessPoint(WifiAccessPoint {
                bssid: "bc:ae:c5:b9:2c:7e".to_string(),
                ssid: Some("lab-ap".to_string()),
                frequency_hz: 2.4e9,
                transmitted_power_dbm: Some(-20.0),
            }),
        }
    }
}

fn load_config(path: &str) -> Result<SimConfig> {
    let config_str = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            debug!(path, error = %e, "config file unreadable, using built-in defaults");
            include_str!("../config.toml").to_string()
        }
    };
    toml::from_str(&config_str).with_context(|| format!("invalid config {path}"))
}

// ── Report ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TrialOutcome {
    pub trial: u32,
    pub readings: usize,
    pub corrupted: usize,
    pub position: Option<Point3>,
    pub error_m: Option<f64>,
    pub position_std_m: Option<f64>,
    pub num_inliers: Option<usize>,
    /// Corrupted readings left out of the consensus set
    pub outliers_rejected: Option<usize>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub source: String,
    pub scenario: Option<Scenario>,
    pub trials: u32,
    pub successes: u32,
    pub failures: u32,
    pub success_rate: f64,
    pub mean_error_m: Option<f64>,
    pub max_error_m: Option<f64>,
    pub outlier_rejection_rate: Option<f64>,
    pub outcomes: Vec<TrialOutcome>,
}

impl Report {
    fn summarize(cfg: &SimConfig, scenario: Option<Scenario>, outcomes: Vec<TrialOutcome>) -> Self {
        let trials = outcomes.len() as u32;
        let errors: Vec<f64> = outcomes.iter().filter_map(|o| o.error_m).collect();
        let successes = errors.iter().filter(|&&e| e <= cfg.run.tolerance_m).count() as u32;
        let failures = outcomes.iter().filter(|o| o.failure.is_some()).count() as u32;

        let mean_error_m =
            (!errors.is_empty()).then(|| errors.iter().sum::<f64>() / errors.len() as f64);
        let max_error_m = errors.iter().copied().reduce(f64::max);

        let (rejected, corrupted) = outcomes
            .iter()
            .filter_map(|o| o.outliers_rejected.map(|r| (r, o.corrupted)))
            .fold((0usize, 0usize), |(r, c), (ri, ci)| (r + ri, c + ci));
        let outlier_rejection_rate = (corrupted > 0).then(|| rejected as f64 / corrupted as f64);

        Self {
            source: cfg.source.radio.id(),
            scenario,
            trials,
            successes,
            failures,
            success_rate: if trials == 0 { 0.0 } else { successes as f64 / trials as f64 },
            mean_error_m,
            max_error_m,
            outlier_rejection_rate,
            outcomes,
        }
    }
}

// ── Trials ────────────────────────────────────────────────────────────────────

fn run_trial(
    trial: u32,
    cfg: &SimConfig,
    batch: &ReadingBatch,
    locator_cfg: LocatorConfig,
) -> TrialOutcome {
    let mut outcome = TrialOutcome {
        trial,
        readings: batch.readings.len(),
        corrupted: batch.corrupted_count(),
        position: None,
        error_m: None,
        position_std_m: None,
        num_inliers: None,
        outliers_rejected: None,
        failure: None,
    };

    let result = RobustRangingLocator::with_config(locator_cfg).and_then(|locator| {
        locator.set_readings(&batch.readings)?;
        let located = locator.estimate()?;
        Ok((located, locator.inliers_data()))
    });

    match result {
        Ok((located, inliers_data)) => {
            let error_m = located.position.distance(&cfg.source.position);
            outcome.position = Some(located.position);
            outcome.error_m = Some(error_m);
            outcome.position_std_m = located.position_std_m();
            if let Some(data) = inliers_data {
                outcome.num_inliers = Some(data.num_inliers());
                outcome.outliers_rejected = data.inliers().map(|mask| {
                    mask.iter()
                        .zip(&batch.corrupted)
                        .filter(|&(&inlier, &bad)| bad && !inlier)
                        .count()
                });
            }
            if error_m > cfg.run.tolerance_m {
                warn!(
                    trial,
                    error_m,
                    tolerance_m = cfg.run.tolerance_m,
                    "located outside tolerance"
                );
            }
        }
        Err(e) => {
            warn!(trial, error = %e, readings = batch.readings.len(), "trial failed");
            outcome.failure = Some(e.to_string());
        }
    }
    outcome
}

fn run(cfg: &SimConfig, scenario: Option<Scenario>) -> Result<Report> {
    let mut rng = match cfg.run.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    cfg.locator.validate().context("invalid [locator] table")?;

    let mut outcomes = Vec::with_capacity(cfg.run.trials as usize);
    for trial in 0..cfg.run.trials {
        let batch = physics::synthesize(
            &mut rng,
            &cfg.source.radio,
            &cfg.source.position,
            &cfg.geometry,
            &cfg.noise,
        )?;
        let mut locator_cfg = cfg.locator;
        if cfg.run.seed.is_some() {
            locator_cfg.seed = Some(rng.gen());
        }
        outcomes.push(run_trial(trial, cfg, &batch, locator_cfg));
    }

    Ok(Report::summarize(cfg, scenario, outcomes))
}

// ── Main ──────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "radio_sim=info,radio_locator=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut cfg = load_config(&args.config)?;
    if let Some(scenario) = args.scenario {
        scenario.apply(&mut cfg);
    }
    if let Some(trials) = args.trials {
        cfg.run.trials = trials;
    }
    if args.seed.is_some() {
        cfg.run.seed = args.seed;
    }

    info!(
        source = %cfg.source.radio.id(),
        scenario = ?args.scenario,
        trials = cfg.run.trials,
        readings = cfg.geometry.readings,
        outlier_fraction = cfg.noise.outlier_fraction,
        "radio simulator starting"
    );

    let report = run(&cfg, args.scenario)?;

    info!(
        successes = report.successes,
        trials = report.trials,
        failures = report.failures,
        success_rate = report.success_rate,
        mean_error_m = ?report.mean_error_m,
        max_error_m = ?report.max_error_m,
        outlier_rejection_rate = ?report.outlier_rejection_rate,
        "simulation finished"
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
