//! Closed-loop simulation of a robot driving among known landmarks.
//!
//! This module provides:
//! - Configuration structs for the world, the robot and its landmark sensor (`SimulationConfig`)
//! - A ground-truth robot that wanders inside the world boundary (`SimulatedRobot`)
//! - Noisy landmark detection limited by field of view and range (`detect_landmarks`)
//! - `run_simulation`, which drives a [LocalizationFilter] with noisy odometry and detections and records the truth,
//!   the estimate and the 95% uncertainty ellipse at every step
//! - CSV export of the resulting records
//!
//! All randomness comes from a seeded `StdRng`, so a given configuration always reproduces the same run.

use log::{debug, info, warn};
use nalgebra::Vector3;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use std::io;
use std::path::Path;

use crate::config::{FilterConfig, read_config, write_config};
use crate::kalman::LocalizationFilter;
use crate::linalg::is_positive_semi_definite;
use crate::measurements::{Landmark, RangeBearingSensor, SensorModel, in_field_of_view};
use crate::{FilterError, Pose, VelocityCommand, constrain_angle, forward};

/// Size of the world and the box the robot tries to stay inside. Units are pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub width: f64,
    pub height: f64,
    pub boundary_x1: f64,
    pub boundary_x2: f64,
    pub boundary_y1: f64,
    pub boundary_y2: f64,
}
impl Default for WorldConfig {
    fn default() -> Self {
        WorldConfig {
            width: 600.0,
            height: 600.0,
            boundary_x1: 50.0,
            boundary_x2: 550.0,
            boundary_y1: 50.0,
            boundary_y2: 550.0,
        }
    }
}
impl WorldConfig {
    pub fn centre(&self) -> (f64, f64) {
        (0.5 * self.width, 0.5 * self.height)
    }
    /// True when the point lies inside the boundary box (edges included).
    pub fn within_boundary(&self, x: f64, y: f64) -> bool {
        x >= self.boundary_x1 && x <= self.boundary_x2 && y >= self.boundary_y1 && y <= self.boundary_y2
    }
}

/// Ground-truth robot motion settings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    /// Forward speed, pixels per second
    pub velocity: f64,
    /// Turning rate used to steer back towards the world centre, radians per second
    pub yaw_rate: f64,
    /// Starting pose, known exactly to the filter
    pub initial_pose: Pose,
}
impl Default for RobotConfig {
    fn default() -> Self {
        RobotConfig {
            velocity: 100.0,
            yaw_rate: 60.0_f64.to_radians(),
            initial_pose: Pose::new(300.0, 200.0, 0.0),
        }
    }
}

/// Landmark sensor used to generate detections.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Full opening angle, radians
    pub field_of_view: f64,
    /// Maximum detection range, pixels
    pub detection_range: f64,
    /// Range noise standard deviation per unit of true range
    pub range_alpha: f64,
    /// Standard deviation of the simulated bearing noise, radians
    pub bearing_sigma: f64,
}
impl Default for SensorConfig {
    fn default() -> Self {
        SensorConfig {
            field_of_view: 45.0_f64.to_radians(),
            detection_range: 200.0,
            range_alpha: 0.1,
            bearing_sigma: 2.0_f64.to_radians(),
        }
    }
}

fn default_landmarks() -> Vec<Landmark> {
    vec![
        Landmark::new(100.0, 100.0),
        Landmark::new(500.0, 100.0),
        Landmark::new(500.0, 500.0),
        Landmark::new(100.0, 500.0),
        Landmark::new(300.0, 300.0),
    ]
}

/// Full configuration of a simulation run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub filter: FilterConfig,
    pub world: WorldConfig,
    pub robot: RobotConfig,
    pub sensor: SensorConfig,
    pub landmarks: Vec<Landmark>,
    pub seed: u64,
    /// Confidence scale applied to the reported ellipse; 2.4477 gives a 95% region
    pub ellipse_chi: f64,
    /// Simulation time step, seconds
    pub dt: f64,
    pub steps: usize,
}
impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            filter: FilterConfig::default(),
            world: WorldConfig::default(),
            robot: RobotConfig::default(),
            sensor: SensorConfig::default(),
            landmarks: default_landmarks(),
            seed: 42,
            ellipse_chi: 2.4477,
            dt: 0.1,
            steps: 600,
        }
    }
}
impl SimulationConfig {
    pub fn validate(&self) -> Result<(), FilterError> {
        self.filter.validate()?;
        let positive = [
            ("dt", self.dt),
            ("ellipse_chi", self.ellipse_chi),
            ("world.width", self.world.width),
            ("world.height", self.world.height),
            ("sensor.field_of_view", self.sensor.field_of_view),
            ("sensor.detection_range", self.sensor.detection_range),
            ("robot.yaw_rate", self.robot.yaw_rate),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(FilterError::InvalidConfig(format!(
                    "{} must be finite and positive, got {}",
                    name, value
                )));
            }
        }
        let non_negative = [
            ("sensor.range_alpha", self.sensor.range_alpha),
            ("sensor.bearing_sigma", self.sensor.bearing_sigma),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(FilterError::InvalidConfig(format!(
                    "{} must be finite and non-negative, got {}",
                    name, value
                )));
            }
        }
        if !self.robot.velocity.is_finite() {
            return Err(FilterError::InvalidConfig("robot velocity must be finite".to_string()));
        }
        let world = &self.world;
        if world.boundary_x1 >= world.boundary_x2 || world.boundary_y1 >= world.boundary_y2 {
            return Err(FilterError::InvalidConfig(
                "world boundary must satisfy x1 < x2 and y1 < y2".to_string(),
            ));
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

/// Heading error below which a robot outside the boundary drives on towards the centre
pub const HEADING_TOLERANCE: f64 = std::f64::consts::PI / 18.0;

/// Ground-truth robot
///
/// Drives straight at the configured speed while inside the boundary box. Once outside, it stops and turns in place
/// towards the world centre until its heading is within [HEADING_TOLERANCE] of the centre, then drives straight again.
/// It therefore never strays more than one step's travel beyond the box. Motion is integrated exactly with [forward].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimulatedRobot {
    pose: Vector3<f64>,
    config: RobotConfig,
}
impl SimulatedRobot {
    pub fn new(config: RobotConfig) -> Self {
        SimulatedRobot {
            pose: config.initial_pose.into(),
            config,
        }
    }
    pub fn pose(&self) -> Pose {
        Pose::from(self.pose)
    }
    pub fn state(&self) -> &Vector3<f64> {
        &self.pose
    }
    /// Velocity command for the current pose and a step of `dt` seconds.
    ///
    /// The last step of an in-place turn is capped so the heading settles half the tolerance off the centre line
    /// rather than on it, where the centre landmark sits.
    pub fn command(&self, world: &WorldConfig, dt: f64) -> VelocityCommand {
        let (x, y, yaw) = (self.pose[0], self.pose[1], self.pose[2]);
        if world.within_boundary(x, y) {
            return VelocityCommand::new(self.config.velocity, 0.0);
        }
        let (cx, cy) = world.centre();
        let error = constrain_angle((cy - y).atan2(cx - x) - yaw);
        if error.abs() <= HEADING_TOLERANCE {
            return VelocityCommand::new(self.config.velocity, 0.0);
        }
        let rate = self.config.yaw_rate.abs().min((error.abs() - 0.5 * HEADING_TOLERANCE) / dt);
        VelocityCommand::new(0.0, rate.copysign(error))
    }
    /// Move the robot exactly along `command` for `dt` seconds. The heading is kept wrapped.
    pub fn step(&mut self, command: &VelocityCommand, dt: f64, epsilon: f64) {
        self.pose = forward(&self.pose, command, dt, epsilon);
        self.pose[2] = constrain_angle(self.pose[2]);
    }
}

fn normal(sigma: f64) -> Result<Normal<f64>, FilterError> {
    Normal::new(0.0, sigma)
        .map_err(|e| FilterError::InvalidConfig(format!("invalid noise standard deviation {}: {}", sigma, e)))
}

/// Simulate one sensor sweep from the true pose
///
/// Returns one entry per landmark, in the order given. Landmarks inside the field of view and detection range carry
/// a range and bearing corrupted by zero-mean Gaussian noise; the rest carry range zero, the "not detected" marker.
/// The range noise grows with distance (`range_alpha` times the true range), matching the filter's measurement model.
pub fn detect_landmarks(
    pose: &Vector3<f64>,
    landmarks: &[Landmark],
    sensor: &SensorConfig,
    rng: &mut StdRng,
) -> Result<Vec<Landmark>, FilterError> {
    let bearing_noise = normal(sensor.bearing_sigma)?;
    let geometry = RangeBearingSensor;
    landmarks
        .iter()
        .map(|landmark| -> Result<Landmark, FilterError> {
            let (range, bearing) = geometry.expected_range_bearing(landmark, pose);
            if !in_field_of_view(range, bearing, sensor.field_of_view, sensor.detection_range) {
                return Ok(landmark.undetected());
            }
            let range_noise = normal(sensor.range_alpha * range)?;
            let noisy_range = (range + range_noise.sample(rng)).max(0.0);
            let noisy_bearing = constrain_angle(bearing + bearing_noise.sample(rng));
            Ok(landmark.with_measurement(noisy_range, noisy_bearing))
        })
        .collect()
}

/// Corrupt a velocity command with noise drawn from the filter's motion model, as wheel odometry would report it.
pub fn noisy_odometry(
    command: &VelocityCommand,
    config: &FilterConfig,
    rng: &mut StdRng,
) -> Result<VelocityCommand, FilterError> {
    let linear = normal(config.motion_noise.translational_sigma(command))?;
    let angular = normal(config.motion_noise.rotational_sigma(command))?;
    Ok(VelocityCommand::new(
        command.linear + linear.sample(rng),
        command.angular + angular.sample(rng),
    ))
}

/// One row of simulation output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationRecord {
    pub step: usize,
    /// Elapsed time in seconds
    pub time: f64,
    pub true_x: f64,
    pub true_y: f64,
    pub true_yaw: f64,
    pub est_x: f64,
    pub est_y: f64,
    pub est_yaw: f64,
    /// Position ellipse scaled by the configured confidence factor
    pub ellipse_major: f64,
    pub ellipse_minor: f64,
    pub ellipse_theta: f64,
    /// Number of landmarks detected this step
    pub detections: usize,
}
impl SimulationRecord {
    /// Euclidean distance between the true and estimated positions.
    pub fn position_error(&self) -> f64 {
        (self.true_x - self.est_x).hypot(self.true_y - self.est_y)
    }
}

/// Run the closed-loop simulation
///
/// Each step the true robot moves, the sensor sweeps from the new true pose, and the filter is updated with noisy
/// odometry and the sweep. Returns one record per step.
///
/// # Errors
/// Returns [FilterError::InvalidConfig] when the configuration does not validate.
pub fn run_simulation(config: &SimulationConfig) -> Result<Vec<SimulationRecord>, FilterError> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut robot = SimulatedRobot::new(config.robot);
    let mut ekf = LocalizationFilter::new(config.filter);
    let start = config.robot.initial_pose;
    ekf.set_state(start.x, start.y, start.yaw);
    info!(
        "Running {} steps of {} s from {} with {} landmarks",
        config.steps,
        config.dt,
        start,
        config.landmarks.len()
    );

    let mut records = Vec::with_capacity(config.steps);
    for step in 1..=config.steps {
        let command = robot.command(&config.world, config.dt);
        robot.step(&command, config.dt, config.filter.epsilon);
        let observations = detect_landmarks(robot.state(), &config.landmarks, &config.sensor, &mut rng)?;
        let odometry = noisy_odometry(&command, &config.filter, &mut rng)?;
        let detections = observations
            .iter()
            .filter(|landmark| landmark.is_detected(config.filter.epsilon))
            .count();

        ekf.update(odometry.linear, odometry.angular, &observations, config.dt);

        if !is_positive_semi_definite(ekf.covariance(), 1e-9) {
            warn!("step {}: covariance lost positive semi-definiteness", step);
        }
        let ellipse = ekf.pose_ellipse().scaled(config.ellipse_chi);
        let truth = robot.pose();
        let record = SimulationRecord {
            step,
            time: step as f64 * config.dt,
            true_x: truth.x,
            true_y: truth.y,
            true_yaw: truth.yaw,
            est_x: ekf.x(),
            est_y: ekf.y(),
            est_yaw: ekf.yaw(),
            ellipse_major: ellipse.major,
            ellipse_minor: ellipse.minor,
            ellipse_theta: ellipse.theta,
            detections,
        };
        debug!(
            "step {}: detections {}, position error {:.3}",
            step,
            detections,
            record.position_error()
        );
        records.push(record);
    }
    Ok(records)
}

/// Write simulation records as CSV with a header row.
pub fn write_csv<W: io::Write>(records: &[SimulationRecord], writer: W) -> Result<(), csv::Error> {
    let mut wtr = csv::Writer::from_writer(writer);
    for record in records {
        wtr.serialize(record)?;
    }
    wtr.flush()?;
    Ok(())
}
