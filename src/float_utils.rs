/*!

  Tolerance-aware comparisons for `f64` bound values.

  Two tolerances are in play crate-wide: `EPSILON` (1e-8) for generic
  comparisons of bound values, and `CONSTRAINT_TOLERANCE` (1e-6) for
  deciding whether an assignment satisfies a piecewise-linear relation.

*/

/// Default epsilon for comparisons of bound values.
pub const EPSILON: f64 = 1e-8;

/// Tolerance used when checking a piecewise-linear relation against a
/// concrete assignment.
pub const CONSTRAINT_TOLERANCE: f64 = 1e-6;

pub fn infinity() -> f64 {
  f64::INFINITY
}

pub fn negative_infinity() -> f64 {
  f64::NEG_INFINITY
}

pub fn is_finite(x: f64) -> bool {
  x != f64::INFINITY && x != f64::NEG_INFINITY
}

pub fn is_zero(x: f64) -> bool {
  x >= -EPSILON && x <= EPSILON
}

pub fn is_positive(x: f64) -> bool {
  x > EPSILON
}

pub fn is_negative(x: f64) -> bool {
  x < -EPSILON
}

pub fn are_equal(x: f64, y: f64, epsilon: f64) -> bool {
  (x - y).abs() <= epsilon
}

pub fn gt(x: f64, y: f64) -> bool {
  is_positive(x - y)
}

pub fn gte(x: f64, y: f64) -> bool {
  !is_negative(x - y)
}

pub fn lt(x: f64, y: f64) -> bool {
  gt(y, x)
}

pub fn lte(x: f64, y: f64) -> bool {
  gte(y, x)
}

/// Rounds values within `EPSILON` of zero to exactly zero.
pub fn round_to_zero(x: f64) -> f64 {
  if is_zero(x) { 0.0 } else { x }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn comparisons_respect_epsilon() {
    assert!(is_zero(1e-9));
    assert!(!is_zero(1e-7));
    assert!(is_positive(1e-7));
    assert!(is_negative(-1e-7));
    assert!(gte(1.0, 1.0 + 1e-9));
    assert!(are_equal(0.5, 0.5 + 1e-7, CONSTRAINT_TOLERANCE));
    assert!(!are_equal(0.5, 0.51, CONSTRAINT_TOLERANCE));
  }

  #[test]
  fn infinities_are_representable() {
    assert!(!is_finite(infinity()));
    assert!(!is_finite(negative_infinity()));
    assert!(is_finite(0.0));
    assert!(gt(infinity(), 1e300));
  }
}
