//! Filter configuration
//!
//! Noise coefficients and thresholds that parameterize the EKF. They are plain values handed to the filter at
//! construction rather than process-wide constants, so filters with different tuning can run side by side.
//!
//! All configuration structs can be read from and written to JSON, YAML or TOML files; the format is chosen by the
//! file extension (`.json`, `.yaml`/`.yml`, `.toml`).

use nalgebra::Matrix2;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::{FilterError, VelocityCommand};

/// Default yaw rate threshold below which the straight-line motion model is used.
pub const DEFAULT_EPSILON: f64 = 1e-4;

/// Velocity motion noise coefficients
///
/// The standard deviation of the executed translational velocity is `alpha1 |v| + alpha2 |w|` and that of the
/// rotational velocity is `alpha3 |v| + alpha4 |w|`, so uncertainty grows with the size of the command.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionNoise {
    pub alpha1: f64,
    pub alpha2: f64,
    pub alpha3: f64,
    pub alpha4: f64,
}
impl Default for MotionNoise {
    fn default() -> Self {
        MotionNoise {
            alpha1: 0.1,
            alpha2: 0.0,
            alpha3: 0.0001,
            alpha4: 0.1,
        }
    }
}
impl MotionNoise {
    /// Standard deviation of the translational velocity for a command
    pub fn translational_sigma(&self, command: &VelocityCommand) -> f64 {
        self.alpha1 * command.linear.abs() + self.alpha2 * command.angular.abs()
    }
    /// Standard deviation of the rotational velocity for a command
    pub fn rotational_sigma(&self, command: &VelocityCommand) -> f64 {
        self.alpha3 * command.linear.abs() + self.alpha4 * command.angular.abs()
    }
}

/// Landmark measurement noise
///
/// Range noise is proportional to the observed range; bearing noise has a fixed standard deviation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementNoise {
    /// Range standard deviation per unit of measured range
    pub range_alpha: f64,
    /// Bearing standard deviation in radians
    pub bearing_sigma: f64,
}
impl Default for MeasurementNoise {
    fn default() -> Self {
        MeasurementNoise {
            range_alpha: 0.1,
            bearing_sigma: 2.0_f64.to_radians(),
        }
    }
}
impl MeasurementNoise {
    /// Measurement covariance Q for an observation with the given measured range
    pub fn covariance(&self, measured_range: f64) -> Matrix2<f64> {
        Matrix2::new(
            (measured_range * self.range_alpha).powi(2),
            0.0,
            0.0,
            self.bearing_sigma.powi(2),
        )
    }
}

/// Complete filter configuration
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub motion_noise: MotionNoise,
    pub measurement_noise: MeasurementNoise,
    /// Threshold for the straight-line motion model and for treating a range as "not detected"
    pub epsilon: f64,
}
impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            motion_noise: MotionNoise::default(),
            measurement_noise: MeasurementNoise::default(),
            epsilon: DEFAULT_EPSILON,
        }
    }
}
impl FilterConfig {
    /// Check that all values are finite and in their valid domains.
    ///
    /// Motion coefficients may be zero but not negative. Measurement coefficients must be strictly positive so that
    /// the measurement covariance is positive definite for every detected landmark.
    pub fn validate(&self) -> Result<(), FilterError> {
        let motion = [
            ("alpha1", self.motion_noise.alpha1),
            ("alpha2", self.motion_noise.alpha2),
            ("alpha3", self.motion_noise.alpha3),
            ("alpha4", self.motion_noise.alpha4),
        ];
        for (name, value) in motion {
            if !value.is_finite() || value < 0.0 {
                return Err(FilterError::InvalidConfig(format!(
                    "motion noise {} must be finite and non-negative, got {}",
                    name, value
                )));
            }
        }
        let measurement = [
            ("range_alpha", self.measurement_noise.range_alpha),
            ("bearing_sigma", self.measurement_noise.bearing_sigma),
            ("epsilon", self.epsilon),
        ];
        for (name, value) in measurement {
            if !value.is_finite() || value <= 0.0 {
                return Err(FilterError::InvalidConfig(format!(
                    "{} must be finite and positive, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
    /// Write the configuration to a file, format chosen by extension.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        write_config(self, path)
    }
    /// Read the configuration from a file, format chosen by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        read_config(path)
    }
}

/// Write the configuration to a JSON file (pretty-printed).
pub fn to_json<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> io::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, value).map_err(io::Error::other)
}
/// Read a configuration from a JSON file.
pub fn from_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> io::Result<T> {
    let file = File::open(path)?;
    serde_json::from_reader(file).map_err(io::Error::other)
}
/// Write the configuration as YAML.
pub fn to_yaml<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> io::Result<()> {
    let mut file = File::create(path)?;
    let s = serde_yaml::to_string(value).map_err(io::Error::other)?;
    file.write_all(s.as_bytes())
}
/// Read a configuration from YAML.
pub fn from_yaml<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> io::Result<T> {
    let file = File::open(path)?;
    serde_yaml::from_reader(file).map_err(io::Error::other)
}
/// Write the configuration as TOML.
pub fn to_toml<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> io::Result<()> {
    let mut file = File::create(path)?;
    let s = toml::to_string(value).map_err(io::Error::other)?;
    file.write_all(s.as_bytes())
}
/// Read a configuration from TOML.
pub fn from_toml<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> io::Result<T> {
    let mut s = String::new();
    let mut file = File::open(path)?;
    file.read_to_string(&mut s)?;
    toml::from_str(&s).map_err(io::Error::other)
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

/// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
pub fn write_config<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> io::Result<()> {
    let p = path.as_ref();
    match extension_of(p).as_deref() {
        Some("json") => to_json(value, p),
        Some("yaml") | Some("yml") => to_yaml(value, p),
        Some("toml") => to_toml(value, p),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unsupported file extension",
        )),
    }
}

/// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
pub fn read_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> io::Result<T> {
    let p = path.as_ref();
    match extension_of(p).as_deref() {
        Some("json") => from_json(p),
        Some("yaml") | Some("yml") => from_yaml(p),
        Some("toml") => from_toml(p),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unsupported file extension",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use tempfile::NamedTempFile;

    fn sample_cfg() -> FilterConfig {
        FilterConfig {
            motion_noise: MotionNoise {
                alpha1: 0.2,
                alpha2: 0.01,
                alpha3: 0.001,
                alpha4: 0.3,
            },
            measurement_noise: MeasurementNoise {
                range_alpha: 0.05,
                bearing_sigma: 0.02,
            },
            epsilon: 1e-5,
        }
    }

    #[test]
    fn default_values() {
        let cfg = FilterConfig::default();
        assert_eq!(cfg.motion_noise.alpha1, 0.1);
        assert_eq!(cfg.motion_noise.alpha2, 0.0);
        assert_eq!(cfg.motion_noise.alpha3, 0.0001);
        assert_eq!(cfg.motion_noise.alpha4, 0.1);
        assert_eq!(cfg.measurement_noise.range_alpha, 0.1);
        assert_approx_eq!(cfg.measurement_noise.bearing_sigma, 0.034906585, 1e-9);
        assert_eq!(cfg.epsilon, 1e-4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn noise_sigmas() {
        let noise = sample_cfg().motion_noise;
        let command = VelocityCommand::new(-100.0, 0.5);
        assert_approx_eq!(noise.translational_sigma(&command), 20.005, 1e-12);
        assert_approx_eq!(noise.rotational_sigma(&command), 0.25, 1e-12);

        let q = sample_cfg().measurement_noise.covariance(40.0);
        assert_approx_eq!(q[(0, 0)], 4.0, 1e-12);
        assert_approx_eq!(q[(1, 1)], 0.0004, 1e-12);
        assert_eq!(q[(0, 1)], 0.0);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = sample_cfg();
        cfg.motion_noise.alpha3 = -0.1;
        assert!(matches!(cfg.validate(), Err(FilterError::InvalidConfig(_))));

        let mut cfg = sample_cfg();
        cfg.measurement_noise.bearing_sigma = 0.0;
        assert!(matches!(cfg.validate(), Err(FilterError::InvalidConfig(_))));

        let mut cfg = sample_cfg();
        cfg.epsilon = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_roundtrip() {
        let cfg = sample_cfg();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("json");
        cfg.to_file(&path).unwrap();
        let loaded = FilterConfig::from_file(&path).unwrap();
        assert_eq!(cfg, loaded);
    }

    #[test]
    fn yaml_and_toml_roundtrip() {
        let cfg = sample_cfg();
        for extension in ["yaml", "yml", "toml"] {
            let f = NamedTempFile::new().unwrap();
            let path = f.path().with_extension(extension);
            cfg.to_file(&path).unwrap();
            let loaded = FilterConfig::from_file(&path).unwrap();
            assert_eq!(cfg, loaded, "roundtrip failed for .{}", extension);
        }
    }

    #[test]
    fn partial_file_uses_defaults() {
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("toml");
        std::fs::write(&path, "epsilon = 0.001\n[motion_noise]\nalpha1 = 0.5\n").unwrap();
        let loaded = FilterConfig::from_file(&path).unwrap();
        assert_eq!(loaded.epsilon, 0.001);
        assert_eq!(loaded.motion_noise.alpha1, 0.5);
        assert_eq!(loaded.motion_noise.alpha4, 0.1);
        assert_eq!(loaded.measurement_noise, MeasurementNoise::default());
    }

    #[test]
    fn unsupported_extension_error() {
        let cfg = sample_cfg();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("txt");

        let result = cfg.to_file(&path);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::InvalidInput);

        let result = FilterConfig::from_file(&path);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::InvalidInput);
    }
}
