//! Jacobian and linearization utilities for the EKF
//!
//! This module provides the analytic Jacobians of the velocity motion model and of the landmark range/bearing
//! measurement model. They follow _Probabilistic Robotics_, Table 7.2, with an explicit straight-line limit for
//! $|\omega| \le \epsilon$ where the arc Jacobians would divide by a vanishing yaw rate.
//!
//! # State Ordering
//!
//! ```text
//! x = [x, y, yaw]     u = [v, w]     z = [range, bearing]
//! ```
//!
//! # Usage Example
//!
//! ```rust
//! use ekf_localization::linearize::{control_jacobian, state_transition_jacobian};
//! use ekf_localization::VelocityCommand;
//!
//! let command = VelocityCommand::new(100.0, 0.0);
//! let g = state_transition_jacobian(0.0, &command, 0.1, 1e-4);
//! let v = control_jacobian(0.0, &command, 0.1, 1e-4);
//! assert!((g[(1, 2)] - 10.0).abs() < 1e-12);
//! assert!((v[(0, 0)] - 0.1).abs() < 1e-12);
//! ```

use nalgebra::{Matrix2, Matrix2x3, Matrix3, Matrix3x2, Vector2, Vector3};

use crate::config::MotionNoise;
use crate::{VelocityCommand, is_straight_line};

/// Control-space noise covariance M
///
/// $$
/// M = \begin{bmatrix} (\alpha_1 |v| + \alpha_2 |\omega|)^2 & 0 \\\\ 0 & (\alpha_3 |v| + \alpha_4 |\omega|)^2 \end{bmatrix}
/// $$
pub fn control_noise(command: &VelocityCommand, noise: &MotionNoise) -> Matrix2<f64> {
    Matrix2::new(
        noise.translational_sigma(command).powi(2),
        0.0,
        0.0,
        noise.rotational_sigma(command).powi(2),
    )
}

/// Compute the state transition Jacobian G = ∂x'/∂x
///
/// Identity except for the heading column; the heading couples into position through the arc (or line) geometry.
///
/// # Arguments
/// * `theta` - Heading of the pose being propagated.
/// * `command` - Velocity command held over the interval.
/// * `dt` - Elapsed time in seconds.
/// * `epsilon` - Yaw rate threshold for the straight-line limit.
pub fn state_transition_jacobian(
    theta: f64,
    command: &VelocityCommand,
    dt: f64,
    epsilon: f64,
) -> Matrix3<f64> {
    let v = command.linear;
    let w = command.angular;
    let mut g = Matrix3::<f64>::identity();
    if is_straight_line(w, epsilon) {
        g[(0, 2)] = -v * theta.sin() * dt;
        g[(1, 2)] = v * theta.cos() * dt;
    } else {
        let radius = v / w;
        g[(0, 2)] = -radius * theta.cos() + radius * (theta + w * dt).cos();
        g[(1, 2)] = -radius * theta.sin() + radius * (theta + w * dt).sin();
    }
    g
}

/// Compute the control Jacobian V = ∂x'/∂u
///
/// Maps control-space noise into state space. In the straight-line limit the yaw-rate column reduces to the
/// second-order terms $\mp v \sin\theta \Delta t^2 / 2$.
pub fn control_jacobian(
    theta: f64,
    command: &VelocityCommand,
    dt: f64,
    epsilon: f64,
) -> Matrix3x2<f64> {
    let v = command.linear;
    let w = command.angular;
    let (sin_0, cos_0) = theta.sin_cos();
    let mut jacobian = Matrix3x2::<f64>::zeros();
    if is_straight_line(w, epsilon) {
        jacobian[(0, 0)] = cos_0 * dt;
        jacobian[(1, 0)] = sin_0 * dt;
        jacobian[(0, 1)] = -v * sin_0 * dt * dt * 0.5;
        jacobian[(1, 1)] = v * cos_0 * dt * dt * 0.5;
    } else {
        let (sin_1, cos_1) = (theta + w * dt).sin_cos();
        jacobian[(0, 0)] = (-sin_0 + sin_1) / w;
        jacobian[(1, 0)] = (cos_0 - cos_1) / w;
        jacobian[(0, 1)] = v * (sin_0 - sin_1) / (w * w) + v * cos_1 * dt / w;
        jacobian[(1, 1)] = -v * (cos_0 - cos_1) / (w * w) + v * sin_1 * dt / w;
    }
    jacobian[(2, 1)] = dt;
    jacobian
}

/// Compute the landmark measurement Jacobian H = ∂[range, bearing]/∂[x, y, yaw]
///
/// The expected range (from the current estimate, not the measured range) is the linearization denominator.
///
/// $$
/// H = \begin{bmatrix}
/// -\frac{l_x - x}{r} & -\frac{l_y - y}{r} & 0 \\\\
/// \frac{l_y - y}{r^2} & -\frac{l_x - x}{r^2} & -1
/// \end{bmatrix}
/// $$
pub fn range_bearing_jacobian(
    landmark: &Vector2<f64>,
    pose: &Vector3<f64>,
    expected_range: f64,
) -> Matrix2x3<f64> {
    let dx = landmark[0] - pose[0];
    let dy = landmark[1] - pose[1];
    let range_squared = expected_range * expected_range;
    Matrix2x3::new(
        -dx / expected_range,
        -dy / expected_range,
        0.0,
        dy / range_squared,
        -dx / range_squared,
        -1.0,
    )
}
