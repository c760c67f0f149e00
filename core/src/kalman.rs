//! Extended Kalman Filter localization
//!
//! This module contains the predict/correct recursion of the landmark EKF and the stateful
//! [LocalizationFilter] that owns the pose belief between ticks. The free functions [predict], [correct] and
//! [correct_single] are pure: they take a belief and return a new one, which keeps every step testable on its own.
//!
//! # Prediction
//!
//! $$
//! \begin{aligned}
//! \bar{\mu} &= g(u, \mu) \\\\
//! \bar{\Sigma} &= G \Sigma G^T + V M V^T
//! \end{aligned}
//! $$
//!
//! # Correction
//!
//! Observations are folded in one landmark at a time, each linearized around the mean left by the previous one:
//!
//! $$
//! \begin{aligned}
//! S &= H \bar{\Sigma} H^T + Q \\\\
//! K &= \bar{\Sigma} H^T S^{-1} \\\\
//! \mu &= \bar{\mu} + K (z - \hat{z}) \\\\
//! \Sigma &= (I - K H) \bar{\Sigma}
//! \end{aligned}
//! $$
//!
//! The result therefore depends on the order of the observations within a tick.
//!
//! Note that the bearing component of $z - \hat{z}$ is used as is, without wrapping. If a measured bearing and
//! its expected value straddle the ±π seam, the innovation is off by a full revolution and the correction is wrong.
//! Only the corrected heading is wrapped afterwards.

use log::{debug, trace, warn};
use nalgebra::{Matrix3, Vector2, Vector3};

use std::fmt::{self, Display};

use crate::config::{FilterConfig, MeasurementNoise};
use crate::linalg::{Ellipse, covariance_ellipse, spd_inverse, symmetrize};
use crate::linearize::{control_jacobian, control_noise, range_bearing_jacobian, state_transition_jacobian};
use crate::measurements::{Landmark, RangeBearingSensor, SensorModel};
use crate::{FilterError, Pose, PoseFilter, VelocityCommand, constrain_angle, forward, is_straight_line};

/// Motion prediction step
///
/// Propagates the mean through the velocity motion model and the covariance through its first-order
/// linearization. With `dt = 0` both Jacobians collapse (G = I, V = 0) and the belief is returned unchanged.
///
/// # Arguments
/// * `mean` - Current pose estimate `[x, y, yaw]`.
/// * `covariance` - Current 3x3 pose covariance.
/// * `command` - Velocity command applied over the interval.
/// * `dt` - Elapsed time in seconds.
/// * `config` - Noise coefficients and the straight-line threshold.
///
/// # Returns
/// The predicted mean and covariance.
pub fn predict(
    mean: &Vector3<f64>,
    covariance: &Matrix3<f64>,
    command: &VelocityCommand,
    dt: f64,
    config: &FilterConfig,
) -> (Vector3<f64>, Matrix3<f64>) {
    let theta = mean[2];
    if is_straight_line(command.angular, config.epsilon) {
        debug!("straight-line prediction for {}", command);
    }
    let g = state_transition_jacobian(theta, command, dt, config.epsilon);
    let v = control_jacobian(theta, command, dt, config.epsilon);
    let m = control_noise(command, &config.motion_noise);

    let predicted_mean = forward(mean, command, dt, config.epsilon);
    let predicted_covariance = symmetrize(&(g * covariance * g.transpose() + v * m * v.transpose()));
    (predicted_mean, predicted_covariance)
}

/// Fold a single landmark observation into the belief
///
/// The measurement is linearized around `mean` using the expected range from `sensor`; the measurement noise is
/// scaled by the *measured* range. The corrected heading is wrapped into (-π, π].
///
/// # Errors
/// * [FilterError::SingularInnovation] when the innovation covariance is singular, ill-conditioned or non-finite
///   (for example when the estimate sits on top of the landmark).
/// * [FilterError::NonFiniteUpdate] when the corrected belief would contain NaN or infinite values.
pub fn correct_single<S: SensorModel + ?Sized>(
    mean: &Vector3<f64>,
    covariance: &Matrix3<f64>,
    landmark: &Landmark,
    index: usize,
    noise: &MeasurementNoise,
    sensor: &S,
) -> Result<(Vector3<f64>, Matrix3<f64>), FilterError> {
    let (expected_range, expected_bearing) = sensor.expected_range_bearing(landmark, mean);
    let h = range_bearing_jacobian(&landmark.position(), mean, expected_range);
    let q = noise.covariance(landmark.range);

    // Innovation covariance: S = H * P * H^T + Q
    let s = h * covariance * h.transpose() + q;
    let s_inverse = spd_inverse(&s).ok_or(FilterError::SingularInnovation {
        landmark: index,
        determinant: s.determinant(),
    })?;

    // Kalman gain: K = P * H^T * S^(-1)
    let gain = covariance * h.transpose() * s_inverse;

    let innovation = landmark.measurement() - Vector2::new(expected_range, expected_bearing);
    trace!(
        "landmark {}: innovation [{:.4}, {:.4}]",
        index, innovation[0], innovation[1]
    );

    let mut corrected_mean = mean + gain * innovation;
    corrected_mean[2] = constrain_angle(corrected_mean[2]);
    let corrected_covariance = symmetrize(&((Matrix3::identity() - gain * h) * covariance));

    let finite = corrected_mean.iter().all(|value| value.is_finite())
        && corrected_covariance.iter().all(|value| value.is_finite());
    if !finite {
        return Err(FilterError::NonFiniteUpdate { landmark: index });
    }
    Ok((corrected_mean, corrected_covariance))
}

/// Measurement correction step
///
/// Applies [correct_single] to each observation in order. Observations whose measured range does not exceed the
/// configured epsilon are treated as "not detected" and skipped. A landmark whose update fails is logged and skipped,
/// leaving the belief as it was before that landmark.
pub fn correct<S: SensorModel + ?Sized>(
    mean: &Vector3<f64>,
    covariance: &Matrix3<f64>,
    observations: &[Landmark],
    config: &FilterConfig,
    sensor: &S,
) -> (Vector3<f64>, Matrix3<f64>) {
    let mut mean = *mean;
    let mut covariance = *covariance;
    for (index, landmark) in observations.iter().enumerate() {
        if !landmark.is_detected(config.epsilon) {
            debug!("landmark {} not detected, skipping", index);
            continue;
        }
        match correct_single(&mean, &covariance, landmark, index, &config.measurement_noise, sensor) {
            Ok((corrected_mean, corrected_covariance)) => {
                mean = corrected_mean;
                covariance = corrected_covariance;
            }
            Err(error) => warn!("{}; keeping prior state", error),
        }
    }
    (mean, covariance)
}

/// Landmark based EKF localization filter
///
/// Owns the pose belief (mean and covariance) between ticks. A freshly constructed filter has a zero covariance and
/// its mean at the origin; [LocalizationFilter::set_state] places the robot and marks the filter initialized. Each
/// call to [LocalizationFilter::update] runs one prediction followed by the sequential landmark corrections and only
/// then replaces the stored belief.
///
/// The filter is not synchronized; share it between threads only behind external locking.
///
/// # Example
///
/// ```rust
/// use ekf_localization::config::FilterConfig;
/// use ekf_localization::kalman::LocalizationFilter;
///
/// let mut ekf = LocalizationFilter::new(FilterConfig::default());
/// ekf.set_state(0.0, 0.0, 0.0);
/// ekf.update(100.0, 0.0, &[], 0.1);
/// assert!((ekf.x() - 10.0).abs() < 1e-12);
/// let ellipse = ekf.pose_ellipse();
/// assert!(ellipse.major >= ellipse.minor);
/// ```
#[derive(Clone, Debug)]
pub struct LocalizationFilter<S: SensorModel = RangeBearingSensor> {
    /// Pose estimate [x, y, yaw]
    mean_state: Vector3<f64>,
    /// Pose covariance (3x3)
    covariance: Matrix3<f64>,
    config: FilterConfig,
    sensor: S,
    /// Time step of the most recent update
    dt: f64,
    initialized: bool,
}

impl<S: SensorModel> Display for LocalizationFilter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalizationFilter")
            .field("mean_state", &self.mean_state)
            .field("covariance", &self.covariance)
            .field("config", &self.config)
            .field("dt", &self.dt)
            .field("initialized", &self.initialized)
            .finish()
    }
}

impl LocalizationFilter<RangeBearingSensor> {
    /// Create a filter that uses exact range/bearing geometry for its expected measurements.
    pub fn new(config: FilterConfig) -> Self {
        LocalizationFilter::with_sensor(config, RangeBearingSensor)
    }
}

impl<S: SensorModel> LocalizationFilter<S> {
    /// Create a filter with a custom expected-measurement model.
    pub fn with_sensor(config: FilterConfig, sensor: S) -> Self {
        LocalizationFilter {
            mean_state: Vector3::zeros(),
            covariance: Matrix3::zeros(),
            config,
            sensor,
            dt: 0.0,
            initialized: false,
        }
    }
    /// Set the pose estimate directly. The covariance is left untouched.
    pub fn set_state(&mut self, x: f64, y: f64, yaw: f64) {
        self.mean_state = Vector3::new(x, y, yaw);
        self.initialized = true;
    }
    /// Seed the covariance, e.g. with a prior uncertainty. The matrix is stored symmetrized.
    pub fn set_covariance(&mut self, covariance: Matrix3<f64>) {
        self.covariance = symmetrize(&covariance);
    }
    /// Run one filter tick: predict with `(v, w)` over `dt`, then correct with every observation in order.
    pub fn update(&mut self, v: f64, w: f64, observations: &[Landmark], dt: f64) {
        if !self.initialized {
            debug!("update before set_state; propagating from the origin");
        }
        self.dt = dt;
        let command = VelocityCommand::new(v, w);
        let (predicted_mean, predicted_covariance) =
            predict(&self.mean_state, &self.covariance, &command, dt, &self.config);
        let (mean, covariance) = correct(
            &predicted_mean,
            &predicted_covariance,
            observations,
            &self.config,
            &self.sensor,
        );
        self.mean_state = mean;
        self.covariance = covariance;
    }
    /// Uncertainty ellipse of the position block of the covariance, in standard deviations.
    pub fn pose_ellipse(&self) -> Ellipse {
        covariance_ellipse(&self.covariance.fixed_view::<2, 2>(0, 0).into_owned())
    }
    pub fn x(&self) -> f64 {
        self.mean_state[0]
    }
    pub fn y(&self) -> f64 {
        self.mean_state[1]
    }
    pub fn yaw(&self) -> f64 {
        self.mean_state[2]
    }
    pub fn pose(&self) -> Pose {
        Pose::from(self.mean_state)
    }
    pub fn mean(&self) -> &Vector3<f64> {
        &self.mean_state
    }
    pub fn covariance(&self) -> &Matrix3<f64> {
        &self.covariance
    }
    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
    /// Time step passed to the most recent [LocalizationFilter::update].
    pub fn last_dt(&self) -> f64 {
        self.dt
    }
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

impl<S: SensorModel> PoseFilter for LocalizationFilter<S> {
    fn predict(&mut self, command: &VelocityCommand, dt: f64) {
        self.dt = dt;
        let (mean, covariance) = predict(&self.mean_state, &self.covariance, command, dt, &self.config);
        self.mean_state = mean;
        self.covariance = covariance;
    }
    fn correct(&mut self, observations: &[Landmark]) {
        let (mean, covariance) = correct(
            &self.mean_state,
            &self.covariance,
            observations,
            &self.config,
            &self.sensor,
        );
        self.mean_state = mean;
        self.covariance = covariance;
    }
    fn get_estimate(&self) -> Vector3<f64> {
        self.mean_state
    }
    fn get_certainty(&self) -> Matrix3<f64> {
        self.covariance
    }
}
