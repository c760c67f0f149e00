//! Landmark observations and the range/bearing sensor model.
//!
//! A [Landmark] carries both the known world position of a landmark and the current (range, bearing) measurement
//! made against it. Data association is resolved before the observation reaches the filter. The expected
//! measurement for a given pose is computed through the narrow [SensorModel] trait so the filter can be exercised
//! against synthetic geometry in tests.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use std::fmt::{self, Display};

use crate::constrain_angle;

/// Known landmark position together with the measurement taken against it this tick.
///
/// A range of zero (or any magnitude not exceeding the filter epsilon) means the landmark was not detected and the
/// corrector skips it. The color is an identity tag for rendering only.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    /// World x position
    pub x: f64,
    /// World y position
    pub y: f64,
    /// Measured range, zero when not detected
    #[serde(default)]
    pub range: f64,
    /// Measured bearing relative to the robot heading, radians
    #[serde(default)]
    pub bearing: f64,
    /// Rendering color as (red, green, blue) in [0, 1]
    #[serde(default = "default_color")]
    pub color: [f64; 3],
}
fn default_color() -> [f64; 3] {
    [1.0, 0.0, 0.0]
}
impl Default for Landmark {
    fn default() -> Self {
        Landmark {
            x: 0.0,
            y: 0.0,
            range: 0.0,
            bearing: 0.0,
            color: default_color(),
        }
    }
}
impl Display for Landmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Landmark(x: {:.2}, y: {:.2}, range: {:.3}, bearing: {:.2} deg)",
            self.x,
            self.y,
            self.range,
            self.bearing.to_degrees()
        )
    }
}
impl Landmark {
    /// Landmark at a known position with no measurement attached.
    pub fn new(x: f64, y: f64) -> Self {
        Landmark {
            x,
            y,
            ..Default::default()
        }
    }
    pub fn with_color(mut self, color: [f64; 3]) -> Self {
        self.color = color;
        self
    }
    /// Copy of this landmark carrying the given measurement.
    pub fn with_measurement(&self, range: f64, bearing: f64) -> Self {
        Landmark {
            range,
            bearing,
            ..*self
        }
    }
    /// Copy of this landmark with the measurement cleared (not detected).
    pub fn undetected(&self) -> Self {
        self.with_measurement(0.0, 0.0)
    }
    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }
    /// Measurement vector `[range, bearing]`.
    pub fn measurement(&self) -> Vector2<f64> {
        Vector2::new(self.range, self.bearing)
    }
    /// True when the measured range is large enough to be used for a correction.
    pub fn is_detected(&self, epsilon: f64) -> bool {
        self.range.abs() > epsilon
    }
}

/// Expected measurement model for range/bearing observations
///
/// Implementations must return the Euclidean range from the pose to the landmark and the bearing of the landmark
/// relative to the robot's forward axis, counter-clockwise positive. This convention is what gives the measurement
/// Jacobian its `-1` heading entry.
pub trait SensorModel {
    fn expected_range_bearing(&self, landmark: &Landmark, pose: &Vector3<f64>) -> (f64, f64);
}

/// Exact planar range/bearing geometry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RangeBearingSensor;
impl SensorModel for RangeBearingSensor {
    fn expected_range_bearing(&self, landmark: &Landmark, pose: &Vector3<f64>) -> (f64, f64) {
        let dx = landmark.x - pose[0];
        let dy = landmark.y - pose[1];
        let range = (dx * dx + dy * dy).sqrt();
        let bearing = constrain_angle(dy.atan2(dx) - pose[2]);
        (range, bearing)
    }
}

/// Whether a landmark at `range`/`bearing` is visible to a sensor with the given field of view and reach.
///
/// The field of view is the full opening angle, centered on the robot's forward axis.
pub fn in_field_of_view(range: f64, bearing: f64, field_of_view: f64, max_range: f64) -> bool {
    range <= max_range && bearing.abs() <= 0.5 * field_of_view
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_expected_range_bearing() {
        let sensor = RangeBearingSensor;
        let landmark = Landmark::new(3.0, 4.0);
        let (range, bearing) = sensor.expected_range_bearing(&landmark, &Vector3::zeros());
        assert_approx_eq!(range, 5.0, 1e-12);
        assert_approx_eq!(bearing, 4.0_f64.atan2(3.0), 1e-12);

        // landmark straight ahead after turning towards it
        let pose = Vector3::new(0.0, 0.0, 4.0_f64.atan2(3.0));
        let (_, bearing) = sensor.expected_range_bearing(&landmark, &pose);
        assert_approx_eq!(bearing, 0.0, 1e-12);
    }

    #[test]
    fn test_bearing_is_wrapped() {
        let sensor = RangeBearingSensor;
        // raw difference is 3π/4 - (-3π/4) = 3π/2, which wraps to -π/2
        let landmark = Landmark::new(-1.0, 1.0);
        let pose = Vector3::new(0.0, 0.0, -0.75 * PI);
        let (_, bearing) = sensor.expected_range_bearing(&landmark, &pose);
        assert!(bearing > -PI && bearing <= PI);
        assert_approx_eq!(bearing, -0.5 * PI, 1e-12);
    }

    #[test]
    fn test_landmark_detection_flags() {
        let landmark = Landmark::new(100.0, 100.0);
        assert!(!landmark.is_detected(1e-4));
        let observed = landmark.with_measurement(50.0, 0.1);
        assert!(observed.is_detected(1e-4));
        assert_eq!(observed.position(), landmark.position());
        assert_eq!(observed.measurement(), Vector2::new(50.0, 0.1));
        assert!(!observed.undetected().is_detected(1e-4));
        assert!(!landmark.with_measurement(1e-5, 0.3).is_detected(1e-4));
    }

    #[test]
    fn test_in_field_of_view() {
        let fov = 45.0_f64.to_radians();
        assert!(in_field_of_view(100.0, 0.0, fov, 200.0));
        assert!(in_field_of_view(200.0, 0.3, fov, 200.0));
        assert!(!in_field_of_view(201.0, 0.0, fov, 200.0));
        assert!(!in_field_of_view(100.0, 0.4, fov, 200.0));
        assert!(!in_field_of_view(100.0, -0.4, fov, 200.0));
    }
}
