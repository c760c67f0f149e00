//! EKF LOCALIZATION: closed-loop simulation of landmark based pose tracking.
//!
//! A simulated robot wanders a square world containing known landmarks. Each tick it reports noisy odometry and
//! noisy range/bearing detections of the landmarks in its field of view; an extended Kalman filter fuses them into a
//! pose estimate. One CSV row per tick (truth, estimate, 95% position ellipse, detection count) is written to stdout.
//!
//! Parameters come from defaults, optionally replaced by a configuration file (TOML/JSON/YAML), and finally by the
//! command-line overrides.

use clap::Parser;
use log::{error, info};

use std::error::Error;
use std::io::{self, Write};
use std::path::PathBuf;

use ekf_localization::sim::{SimulationConfig, run_simulation, write_csv};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Landmark based EKF localization of a simulated planar robot.")]
struct Cli {
    /// Simulation configuration file (TOML/JSON/YAML); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of simulation steps
    #[arg(long)]
    steps: Option<usize>,

    /// Time step in seconds
    #[arg(long)]
    dt: Option<f64>,

    /// Seed for the noise generator
    #[arg(long)]
    seed: Option<u64>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Write the effective configuration to this file and exit
    #[arg(long)]
    write_config: Option<PathBuf>,
}

/// Set up `env_logger` with a millisecond timestamp, logging to stderr or appending to `log_file`.
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    let level = match log_level.parse::<log::LevelFilter>() {
        Ok(level) => level,
        Err(_) => {
            eprintln!("Invalid log level '{}', using 'info'", log_level);
            log::LevelFilter::Info
        }
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {} - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });
    if let Some(path) = log_file {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}

/// Resolve the effective configuration: file (or defaults) first, then command-line overrides.
fn load_config(cli: &Cli) -> Result<SimulationConfig, Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            SimulationConfig::from_file(path)?
        }
        None => SimulationConfig::default(),
    };
    if let Some(steps) = cli.steps {
        config.steps = steps;
    }
    if let Some(dt) = cli.dt {
        config.dt = dt;
    }
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    let config = load_config(&cli).inspect_err(|e| error!("Invalid configuration: {}", e))?;

    if let Some(path) = &cli.write_config {
        config.to_file(path)?;
        info!("Wrote configuration to {}", path.display());
        return Ok(());
    }

    let records = run_simulation(&config)?;
    if let Some(last) = records.last() {
        let mean_error = records.iter().map(|r| r.position_error()).sum::<f64>() / records.len() as f64;
        info!(
            "Finished {} steps; final position error {:.3}, mean position error {:.3}",
            records.len(),
            last.position_error(),
            mean_error
        );
    }
    write_csv(&records, io::stdout().lock())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_defaults() {
        let cli = Cli::parse_from(["ekf-localization", "--steps", "10", "--dt", "0.05", "--seed", "3"]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.steps, 10);
        assert_eq!(config.dt, 0.05);
        assert_eq!(config.seed, 3);
        assert_eq!(config.landmarks, SimulationConfig::default().landmarks);
    }

    #[test]
    fn cli_rejects_invalid_override() {
        let cli = Cli::parse_from(["ekf-localization", "--dt", "0"]);
        assert!(load_config(&cli).is_err());
    }

    #[test]
    fn cli_reads_config_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().with_extension("toml");
        let written = SimulationConfig {
            steps: 25,
            seed: 11,
            ..SimulationConfig::default()
        };
        written.to_file(&path).unwrap();
        let cli = Cli::parse_from([
            "ekf-localization".to_string(),
            "--config".to_string(),
            path.display().to_string(),
            "--seed".to_string(),
            "12".to_string(),
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.steps, 25);
        assert_eq!(config.seed, 12);
    }
}
