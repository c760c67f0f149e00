//! Planar EKF localization toolbox
//!
//! This crate estimates the pose of a ground robot moving in a two dimensional world from a noisy velocity
//! command and noisy range/bearing observations of landmarks whose positions are known in advance. The estimator
//! is an Extended Kalman Filter (EKF) following the velocity motion model and landmark measurement model of
//! _Probabilistic Robotics_ by Thrun, Burgard and Fox (Chapter 7.4, Table 7.2). Where possible, variables are named
//! for the quantity they represent rather than the symbol used in the book, with the exception of the classic
//! Jacobian names (`G`, `V`, `H`) that are kept for readability against the reference text.
//!
//! This crate is primarily built off of the following dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the fixed-size linear algebra types for the filter.
//! - [`serde`](https://crates.io/crates/serde): Provides (de)serialization of the filter and simulation configuration.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Provides the
//!   random number generation for the simulated robot and sensor.
//! - [`log`](https://crates.io/crates/log): Logging facade used for diagnostics from inside the filter.
//!
//! ## Crate overview
//!
//! This crate is organized into several modules:
//! - [config]: Noise parameters and thresholds that parameterize the filter, with file I/O.
//! - [kalman]: The predict/correct recursion and the stateful [kalman::LocalizationFilter].
//! - [linalg]: Small linear algebra helpers (symmetrization, guarded inversion, covariance ellipses).
//! - [linearize]: Analytic Jacobians of the motion and measurement models.
//! - [measurements]: Landmark observations and the range/bearing sensor model.
//! - [sim]: A simulated robot and sensor for exercising the filter end to end.
//!
//! ## State definition
//!
//! The state is the robot pose in the world frame:
//!
//! $$
//! x = [p_x, p_y, \theta]
//! $$
//!
//! where $p_x$ and $p_y$ are unbounded positions and $\theta$ is the heading in radians measured counter-clockwise
//! from the world x-axis. The heading is re-normalized to $(-\pi, \pi]$ with [constrain_angle] after every landmark
//! correction.
//!
//! ## Velocity motion model
//!
//! Given a linear velocity $v$ and angular velocity $\omega$ held constant for a time $\Delta t$, the robot moves
//! along a circular arc:
//!
//! $$
//! \begin{aligned}
//! p_x' &= p_x - \frac{v}{\omega} \sin\theta + \frac{v}{\omega} \sin(\theta + \omega \Delta t) \\\\
//! p_y' &= p_y + \frac{v}{\omega} \cos\theta - \frac{v}{\omega} \cos(\theta + \omega \Delta t) \\\\
//! \theta' &= \theta + \omega \Delta t
//! \end{aligned}
//! $$
//!
//! For $|\omega| \le \epsilon$ the arc degenerates and the limit $\omega \rightarrow 0$ is used instead, which is the
//! straight line $p_x' = p_x + v \cos\theta \Delta t$, $p_y' = p_y + v \sin\theta \Delta t$, $\theta' = \theta$.
pub mod config;
pub mod kalman;
pub mod linalg;
pub mod linearize;
pub mod measurements;
pub mod sim;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use std::f64::consts::PI;
use std::fmt::{self, Display};

use crate::measurements::Landmark;

/// Errors produced by the filter and its configuration.
///
/// The numerical core never panics; a failing landmark correction is reported with one of these variants and the
/// caller (normally [kalman::correct]) keeps the prior state for that landmark.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterError {
    /// The innovation covariance of a landmark update could not be inverted safely.
    #[error("innovation covariance for landmark {landmark} is singular or ill-conditioned (det = {determinant:e})")]
    SingularInnovation { landmark: usize, determinant: f64 },
    /// A correction produced a mean or covariance containing NaN or infinite values.
    #[error("correction for landmark {landmark} produced a non-finite state")]
    NonFiniteUpdate { landmark: usize },
    /// Configuration values outside of their valid domain.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Generic Bayesian pose filter trait
///
/// Splits a filter tick into the prediction from a control input and the correction from a batch of landmark
/// observations. Implementations are expected to keep their own mean and covariance.
pub trait PoseFilter {
    fn predict(&mut self, command: &VelocityCommand, dt: f64);
    fn correct(&mut self, observations: &[Landmark]);
    fn get_estimate(&self) -> Vector3<f64>;
    fn get_certainty(&self) -> Matrix3<f64>;
}

/// Velocity control input for a unicycle (differential drive) robot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VelocityCommand {
    /// Forward velocity in world units per second
    pub linear: f64,
    /// Yaw rate in radians per second, counter-clockwise positive
    pub angular: f64,
}
impl VelocityCommand {
    pub fn new(linear: f64, angular: f64) -> Self {
        VelocityCommand { linear, angular }
    }
}
impl Display for VelocityCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VelocityCommand {{ v: {:.4}, w: {:.4} rad/s }}",
            self.linear, self.angular
        )
    }
}

/// Robot pose in the two dimensional world frame.
///
/// This is a named view of the three element state vector used by the filter. Conversions to and from
/// `Vector3<f64>` are provided so the filter can use plain nalgebra arithmetic internally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    /// Heading in radians
    pub yaw: f64,
}
impl Pose {
    pub fn new(x: f64, y: f64, yaw: f64) -> Self {
        Pose { x, y, yaw }
    }
}
impl Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pose {{ x: {:.3}, y: {:.3}, yaw: {:.2} deg }}",
            self.x,
            self.y,
            self.yaw.to_degrees()
        )
    }
}
impl From<Vector3<f64>> for Pose {
    fn from(state: Vector3<f64>) -> Self {
        Pose::new(state[0], state[1], state[2])
    }
}
impl From<Pose> for Vector3<f64> {
    fn from(pose: Pose) -> Self {
        Vector3::new(pose.x, pose.y, pose.yaw)
    }
}

/// Returns true when the yaw rate is too small for the arc form of the motion model.
#[inline]
pub fn is_straight_line(angular: f64, epsilon: f64) -> bool {
    angular.abs() <= epsilon
}

/// Propagate a pose with the velocity motion model
///
/// Uses the closed-form arc integration when $|\omega| > \epsilon$ and the straight-line limit otherwise. The
/// resulting heading is not re-normalized; the filter wraps it during the correction step.
///
/// # Arguments
/// * `pose` - Current pose `[x, y, yaw]`.
/// * `command` - Linear and angular velocity held over the interval.
/// * `dt` - Elapsed time in seconds (non-negative).
/// * `epsilon` - Yaw rate threshold below which the straight-line model is used.
///
/// # Example
/// ```rust
/// use ekf_localization::{forward, VelocityCommand};
/// use nalgebra::Vector3;
///
/// let pose = Vector3::new(0.0, 0.0, 0.0);
/// let next = forward(&pose, &VelocityCommand::new(100.0, 0.0), 0.1, 1e-4);
/// assert!((next[0] - 10.0).abs() < 1e-12);
/// assert_eq!(next[1], 0.0);
/// ```
pub fn forward(pose: &Vector3<f64>, command: &VelocityCommand, dt: f64, epsilon: f64) -> Vector3<f64> {
    let theta = pose[2];
    let v = command.linear;
    let w = command.angular;
    if is_straight_line(w, epsilon) {
        Vector3::new(
            pose[0] + v * theta.cos() * dt,
            pose[1] + v * theta.sin() * dt,
            theta,
        )
    } else {
        let radius = v / w;
        Vector3::new(
            pose[0] - radius * theta.sin() + radius * (theta + w * dt).sin(),
            pose[1] + radius * theta.cos() - radius * (theta + w * dt).cos(),
            theta + w * dt,
        )
    }
}

/// Wrap an angle into $(-\pi, \pi]$ with a single correction
///
/// Unlike a modulo loop, at most one full revolution is added or removed. This matches the bounded heading drift of
/// a single filter step; inputs more than one revolution outside of the range are only partially wrapped.
///
/// # Example
/// ```rust
/// use ekf_localization::constrain_angle;
/// use std::f64::consts::PI;
///
/// assert!((constrain_angle(1.5 * PI) + 0.5 * PI).abs() < 1e-12);
/// assert_eq!(constrain_angle(-PI), PI);
/// ```
pub fn constrain_angle(radian: f64) -> f64 {
    if radian <= -PI {
        radian + 2.0 * PI
    } else if radian > PI {
        radian - 2.0 * PI
    } else {
        radian
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const EPS: f64 = 1e-4;

    #[test]
    fn test_constrain_angle() {
        assert_eq!(constrain_angle(0.0), 0.0);
        assert_eq!(constrain_angle(PI), PI);
        assert_eq!(constrain_angle(-PI), PI);
        assert_approx_eq!(constrain_angle(3.0 * PI / 2.0), -PI / 2.0, 1e-12);
        assert_approx_eq!(constrain_angle(-3.0 * PI / 2.0), PI / 2.0, 1e-12);
        // single correction only
        assert_approx_eq!(constrain_angle(5.0 * PI), 3.0 * PI, 1e-12);
    }

    #[test]
    fn test_constrain_angle_range_and_idempotence() {
        let n = 2000;
        for i in 1..n {
            let angle = -3.0 * PI + 6.0 * PI * (i as f64) / (n as f64);
            let once = constrain_angle(angle);
            assert!(once > -PI && once <= PI, "{} wrapped to {}", angle, once);
            assert_eq!(constrain_angle(once), once);
        }
    }

    #[test]
    fn test_forward_straight_line() {
        let pose = Vector3::new(0.0, 0.0, 0.0);
        let next = forward(&pose, &VelocityCommand::new(100.0, 0.0), 0.1, EPS);
        assert_approx_eq!(next[0], 10.0, 1e-12);
        assert_eq!(next[1], 0.0);
        assert_eq!(next[2], 0.0);

        let pose = Vector3::new(1.0, 2.0, PI / 2.0);
        let next = forward(&pose, &VelocityCommand::new(10.0, 0.5 * EPS), 1.0, EPS);
        assert_approx_eq!(next[0], 1.0, 1e-9);
        assert_approx_eq!(next[1], 12.0, 1e-9);
        assert_eq!(next[2], PI / 2.0);
    }

    #[test]
    fn test_forward_quarter_circle() {
        // v/w = 10, a quarter turn from the origin heading along +x ends at (10, 10) heading +y
        let w = PI / 2.0;
        let pose = Vector3::new(0.0, 0.0, 0.0);
        let next = forward(&pose, &VelocityCommand::new(10.0 * w, w), 1.0, EPS);
        assert_approx_eq!(next[0], 10.0, 1e-9);
        assert_approx_eq!(next[1], 10.0, 1e-9);
        assert_approx_eq!(next[2], PI / 2.0, 1e-12);
    }

    #[test]
    fn test_forward_zero_dt_is_identity() {
        let pose = Vector3::new(3.0, -4.0, 0.7);
        for command in [VelocityCommand::new(5.0, 0.0), VelocityCommand::new(5.0, 1.0)] {
            let next = forward(&pose, &command, 0.0, EPS);
            assert_approx_eq!(next[0], pose[0], 1e-12);
            assert_approx_eq!(next[1], pose[1], 1e-12);
            assert_approx_eq!(next[2], pose[2], 1e-12);
        }
    }

    #[test]
    fn test_forward_branch_continuity() {
        let pose = Vector3::new(0.0, 0.0, 0.3);
        let straight = forward(&pose, &VelocityCommand::new(100.0, 0.0), 0.1, EPS);
        let mut previous_error = f64::INFINITY;
        for w in [2e-2, 2e-3, 2e-4] {
            let arc = forward(&pose, &VelocityCommand::new(100.0, w), 0.1, EPS);
            let error = (arc - straight).norm();
            assert!(error < 100.0 * w, "arc/line mismatch {} at w = {}", error, w);
            assert!(error < previous_error);
            previous_error = error;
        }
    }

    #[test]
    fn test_pose_conversions() {
        let pose = Pose::new(1.0, 2.0, 0.5);
        let v: Vector3<f64> = pose.into();
        assert_eq!(v, Vector3::new(1.0, 2.0, 0.5));
        assert_eq!(Pose::from(v), pose);
    }
}
