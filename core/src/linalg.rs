//! Linear algebra helpers for the pose filter.
//!
//! Public API:
//!     pub fn symmetrize(m) -> m
//!     pub fn spd_inverse(s: &Matrix2<f64>) -> Option<Matrix2<f64>>
//!     pub fn is_positive_semi_definite(m, tolerance) -> bool
//!     pub fn covariance_ellipse(p: &Matrix2<f64>) -> Ellipse
//!
//! Strategy for the guarded inverse:
//! 1) Reject non-finite input
//! 2) Symmetrize S ← 0.5 (S + Sᵀ)
//! 3) Reject a non-positive diagonal, or a determinant that is tiny relative to the product of the diagonal
//!    (correlation of the two components within 1e-12 of ±1)
//! 4) Cholesky, and invert through the factor

use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{Matrix2, Matrix3, SMatrix};
use serde::{Deserialize, Serialize};

use std::fmt::{self, Display};

/// Relative determinant threshold: det(S) must exceed this times S₀₀·S₁₁, i.e. 1 - ρ² > tolerance.
///
/// The ratio is independent of the units of the two components, so a range (px²) and bearing (rad²) block is judged
/// only by its correlation.
pub const CONDITION_TOLERANCE: f64 = 1e-12;

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
///
/// Reduces the round-off asymmetry that accumulates in covariance propagation.
#[inline]
pub fn symmetrize<const D: usize>(m: &SMatrix<f64, D, D>) -> SMatrix<f64, D, D> {
    0.5 * (m + m.transpose())
}

/// Invert a 2x2 symmetric positive definite matrix, refusing ill-conditioned input.
///
/// Returns `None` when the matrix contains non-finite values, when a diagonal entry is not positive, when its
/// determinant is not comfortably positive relative to the product of the diagonal, or when the Cholesky factorization
/// fails.
pub fn spd_inverse(s: &Matrix2<f64>) -> Option<Matrix2<f64>> {
    if !s.iter().all(|value| value.is_finite()) {
        return None;
    }
    let s = symmetrize(s);
    let (a, d) = (s[(0, 0)], s[(1, 1)]);
    if a <= 0.0 || d <= 0.0 || s.determinant() <= CONDITION_TOLERANCE * a * d {
        return None;
    }
    Cholesky::new(s).map(|ch| ch.inverse())
}

/// Check that a symmetric 3x3 matrix has no eigenvalue below `-tolerance`.
pub fn is_positive_semi_definite(m: &Matrix3<f64>, tolerance: f64) -> bool {
    let eigen = SymmetricEigen::new(symmetrize(m));
    eigen.eigenvalues.iter().all(|&lambda| lambda >= -tolerance)
}

/// Largest absolute difference between a matrix and its transpose.
pub fn asymmetry<const D: usize>(m: &SMatrix<f64, D, D>) -> f64 {
    (m - m.transpose()).amax()
}

/// Confidence ellipse of a two dimensional Gaussian.
///
/// Axis lengths are in standard-deviation units (square roots of the covariance eigenvalues). Scaling to a given
/// confidence level is done by the caller with [Ellipse::scaled].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ellipse {
    /// Semi-axis length along the direction of greatest spread
    pub major: f64,
    /// Semi-axis length perpendicular to the major axis
    pub minor: f64,
    /// Orientation of the major axis in radians, in (-π/2, π/2]. Taken from the eigenvector flipped into the right
    /// half-plane, so it can differ by π from `atan2` of the solver's raw eigenvector; both describe the same axis.
    pub theta: f64,
}
impl Ellipse {
    /// Scale both axes by a confidence factor, e.g. 2.4477 for a 95% region in two dimensions.
    pub fn scaled(&self, chi: f64) -> Ellipse {
        Ellipse {
            major: self.major * chi,
            minor: self.minor * chi,
            theta: self.theta,
        }
    }
}
impl Display for Ellipse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ellipse {{ major: {:.4}, minor: {:.4}, theta: {:.2} deg }}",
            self.major,
            self.minor,
            self.theta.to_degrees()
        )
    }
}

/// Decompose a 2x2 covariance block into its uncertainty ellipse
///
/// The eigenvalues are square-rooted to candidate axis lengths `e0` and `e1` (one per eigenvector column). The larger
/// one becomes the major axis and `theta` is the direction of its eigenvector. Because an axis has no sign, the
/// eigenvector is flipped into the right half-plane before taking `atan2`, giving `theta` in (-π/2, π/2].
///
/// When `e0 == e1` (isotropic uncertainty) the second eigenvector is used and `theta` is whatever the solver returns;
/// the orientation of a circle is indeterminate. Tiny negative eigenvalues from round-off are clamped to zero.
///
/// # Example
/// ```rust
/// use ekf_localization::linalg::covariance_ellipse;
/// use nalgebra::Matrix2;
///
/// let ellipse = covariance_ellipse(&Matrix2::new(4.0, 0.0, 0.0, 1.0));
/// assert!((ellipse.major - 2.0).abs() < 1e-12);
/// assert!((ellipse.minor - 1.0).abs() < 1e-12);
/// assert!(ellipse.theta.abs() < 1e-12);
/// ```
pub fn covariance_ellipse(p: &Matrix2<f64>) -> Ellipse {
    let eigen = SymmetricEigen::new(symmetrize(p));
    let e0 = eigen.eigenvalues[0].max(0.0).sqrt();
    let e1 = eigen.eigenvalues[1].max(0.0).sqrt();
    let (major, minor, column) = if e0 > e1 { (e0, e1, 0) } else { (e1, e0, 1) };
    let mut direction = eigen.eigenvectors.column(column).into_owned();
    if direction[0] < 0.0 || (direction[0] == 0.0 && direction[1] < 0.0) {
        direction = -direction;
    }
    Ellipse {
        major,
        minor,
        theta: direction[1].atan2(direction[0]),
    }
}

/* =============================== Tests ==================================== */
