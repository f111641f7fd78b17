/*!

  Interval propagation over the equation pool.

  For every equation `sum(c_i * x_i) <rel> s` and every participating
  variable, the remaining addends are evaluated as an interval and the
  implied bound on the isolated variable is pushed into the bound
  manager. Rounds repeat until nothing tightens or the saturation cap is
  reached; crossing bounds simply set the manager's inconsistency marker
  and stop the pass.

*/

use crate::bounds::BoundManager;
use crate::context::Context;
use crate::equation::{Equation, Relation};
use crate::Variable;

const SATURATION_ITERATIONS: usize = 20;

/// One term's contribution interval, `c * [lo, hi]`.
fn term_interval(coefficient: f64, lower: f64, upper: f64) -> (f64, f64) {
  if coefficient >= 0.0 {
    (coefficient * lower, coefficient * upper)
  } else {
    (coefficient * upper, coefficient * lower)
  }
}

struct RestIntervals {
  finite_min_sum: f64,
  finite_max_sum: f64,
  infinite_mins : usize,
  infinite_maxes: usize,
}

impl RestIntervals {
  fn of(equation: &Equation, bounds: &BoundManager, ctx: &Context) -> Self {
    let mut intervals = RestIntervals {
      finite_min_sum: 0.0,
      finite_max_sum: 0.0,
      infinite_mins : 0,
      infinite_maxes: 0,
    };
    for (coefficient, variable) in &equation.addends {
      if *coefficient == 0.0 {
        continue;
      }
      let (term_min, term_max) = term_interval(*coefficient,
                                               bounds.lower(ctx, *variable),
                                               bounds.upper(ctx, *variable));
      if term_min.is_finite() {
        intervals.finite_min_sum += term_min;
      } else {
        intervals.infinite_mins += 1;
      }
      if term_max.is_finite() {
        intervals.finite_max_sum += term_max;
      } else {
        intervals.infinite_maxes += 1;
      }
    }
    intervals
  }

  /// Interval of the sum excluding one term.
  fn without(&self, term_min: f64, term_max: f64) -> (f64, f64) {
    let rest_min = if term_min.is_finite() {
      if self.infinite_mins > 0 { f64::NEG_INFINITY } else { self.finite_min_sum - term_min }
    } else if self.infinite_mins == 1 {
      self.finite_min_sum
    } else {
      f64::NEG_INFINITY
    };

    let rest_max = if term_max.is_finite() {
      if self.infinite_maxes > 0 { f64::INFINITY } else { self.finite_max_sum - term_max }
    } else if self.infinite_maxes == 1 {
      self.finite_max_sum
    } else {
      f64::INFINITY
    };

    (rest_min, rest_max)
  }
}

/// One propagation round over every equation. Returns whether any bound
/// changed.
fn tighten_once(bounds: &BoundManager, ctx: &mut Context, equations: &[Equation]) -> bool {
  let mut changed = false;

  for equation in equations {
    if !bounds.consistent(ctx) {
      return changed;
    }
    let rest = RestIntervals::of(equation, bounds, ctx);

    for (coefficient, variable) in &equation.addends {
      let coefficient = *coefficient;
      let variable: Variable = *variable;
      if coefficient == 0.0 {
        continue;
      }

      let (term_min, term_max) = term_interval(coefficient,
                                               bounds.lower(ctx, variable),
                                               bounds.upper(ctx, variable));
      let (rest_min, rest_max) = rest.without(term_min, term_max);

      // Bounds on c * x implied by the relation.
      let (cx_min, cx_max) = match equation.relation {
        Relation::Eq => (equation.scalar - rest_max, equation.scalar - rest_min),
        Relation::Le => (f64::NEG_INFINITY, equation.scalar - rest_min),
        Relation::Ge => (equation.scalar - rest_max, f64::INFINITY),
      };

      // Divide through by the coefficient, flipping for negatives.
      let (x_min, x_max) = if coefficient > 0.0 {
        (cx_min / coefficient, cx_max / coefficient)
      } else {
        (cx_max / coefficient, cx_min / coefficient)
      };

      if x_min.is_finite() {
        changed |= bounds.tighten_lower(ctx, variable, x_min);
      }
      if x_max.is_finite() {
        changed |= bounds.tighten_upper(ctx, variable, x_max);
      }
    }
  }

  changed
}

/// Propagates until fixpoint or saturation. Returns whether any bound
/// changed across the whole pass.
pub fn tighten_to_fixpoint(bounds: &BoundManager, ctx: &mut Context,
                           equations: &[Equation]) -> bool {
  let mut changed_any = false;
  for _ in 0..SATURATION_ITERATIONS {
    if !bounds.consistent(ctx) {
      break;
    }
    if !tighten_once(bounds, ctx, equations) {
      break;
    }
    changed_any = true;
  }
  changed_any
}
