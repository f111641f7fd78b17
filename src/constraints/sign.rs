/*!

  `f = sign(b)`: +1 when `b >= 0`, -1 otherwise. The output is clamped to
  `[-1, 1]`.

  Phase positive is fixed as soon as `lo[b] >= 0` or `lo[f] > -1`; phase
  negative as soon as `hi[b] < 0` or `hi[f] < 1`.

*/

use crate::bounds::BoundManager;
use crate::case_split::{CaseSplit, Tightening};
use crate::constraints::{ConstraintCore, ConstraintKind, PhaseStatus, PiecewiseLinear};
use crate::context::Context;
use crate::equation::LinearExpr;
use crate::float_utils;
use crate::Variable;

#[derive(Clone, Debug)]
pub struct SignConstraint {
  b   : Variable,
  f   : Variable,
  core: ConstraintCore,
  have_eliminated_variables: bool,
}

impl SignConstraint {
  pub fn new(b: Variable, f: Variable) -> Self {
    SignConstraint {
      b,
      f,
      core: ConstraintCore::new(),
      have_eliminated_variables: false,
    }
  }

  /// Input format is `sign,f,b`.
  pub fn from_serialized(line: &str) -> Result<Self, String> {
    let tokens: Vec<&str> = line.split(',').collect();
    if tokens.first() != Some(&"sign") || tokens.len() != 3 {
      return Err(format!("expected `sign,f,b`, got `{}`", line));
    }
    let parse = |t: &str| t.trim().parse::<usize>().map_err(|_| format!("bad variable index `{}`", t));
    Ok(SignConstraint::new(parse(tokens[2])?, parse(tokens[1])?))
  }

  pub fn b(&self) -> Variable {
    self.b
  }

  pub fn f(&self) -> Variable {
    self.f
  }

  fn compute_polarity(&self, ctx: &Context, bounds: &BoundManager) -> f64 {
    let lower = bounds.lower(ctx, self.b);
    let upper = bounds.upper(ctx, self.b);
    if lower >= 0.0 {
      return 1.0;
    }
    if upper <= 0.0 {
      return -1.0;
    }
    (upper + lower) / (upper - lower)
  }

  fn positive_split(&self) -> CaseSplit {
    // Positive phase: b >= 0, f = 1
    let mut split = CaseSplit::new();
    split.store_bound_tightening(Tightening::lower(self.b, 0.0));
    split.store_bound_tightening(Tightening::lower(self.f, 1.0));
    split
  }

  fn negative_split(&self) -> CaseSplit {
    // Negative phase: b < 0, f = -1
    let mut split = CaseSplit::new();
    split.store_bound_tightening(Tightening::upper(self.b, 0.0));
    split.store_bound_tightening(Tightening::upper(self.f, -1.0));
    split
  }
}

impl PiecewiseLinear for SignConstraint {
  fn kind(&self) -> ConstraintKind {
    ConstraintKind::Sign
  }

  fn core(&self) -> &ConstraintCore {
    &self.core
  }

  fn core_mut(&mut self) -> &mut ConstraintCore {
    &mut self.core
  }

  fn participating_variables(&self) -> Vec<Variable> {
    vec![self.b, self.f]
  }

  fn notify_lower_bound(&self, variable: Variable, bound: f64,
                        bounds: &BoundManager, ctx: &mut Context) {
    if variable == self.f && float_utils::gt(bound, -1.0) {
      self.core.set_phase(ctx, PhaseStatus::SignPositive);
      if self.core.is_active(ctx) {
        bounds.tighten_lower(ctx, self.f, 1.0);
        bounds.tighten_lower(ctx, self.b, 0.0);
      }
    } else if variable == self.b && !float_utils::is_negative(bound) {
      self.core.set_phase(ctx, PhaseStatus::SignPositive);
      if self.core.is_active(ctx) {
        bounds.tighten_lower(ctx, self.f, 1.0);
      }
    }
  }

  fn notify_upper_bound(&self, variable: Variable, bound: f64,
                        bounds: &BoundManager, ctx: &mut Context) {
    if variable == self.f && float_utils::lt(bound, 1.0) {
      self.core.set_phase(ctx, PhaseStatus::SignNegative);
      if self.core.is_active(ctx) {
        bounds.tighten_upper(ctx, self.f, -1.0);
        bounds.tighten_upper(ctx, self.b, 0.0);
      }
    } else if variable == self.b && float_utils::is_negative(bound) {
      self.core.set_phase(ctx, PhaseStatus::SignNegative);
      if self.core.is_active(ctx) {
        bounds.tighten_upper(ctx, self.f, -1.0);
      }
    }
  }

  fn satisfied(&self, assignment: &[f64]) -> bool {
    let b_value = assignment[self.b];
    let f_value = assignment[self.f];
    if b_value >= 0.0 {
      float_utils::are_equal(f_value, 1.0, float_utils::CONSTRAINT_TOLERANCE)
    } else {
      float_utils::are_equal(f_value, -1.0, float_utils::CONSTRAINT_TOLERANCE)
    }
  }

  fn case_splits(&self, ctx: &Context, _bounds: &BoundManager) -> Vec<CaseSplit> {
    debug_assert!(!self.phase_fixed(ctx));
    if self.core.direction() == PhaseStatus::SignPositive {
      vec![self.positive_split(), self.negative_split()]
    } else {
      vec![self.negative_split(), self.positive_split()]
    }
  }

  fn all_cases(&self) -> Vec<PhaseStatus> {
    if self.core.direction() == PhaseStatus::SignPositive {
      vec![PhaseStatus::SignPositive, PhaseStatus::SignNegative]
    } else {
      vec![PhaseStatus::SignNegative, PhaseStatus::SignPositive]
    }
  }

  fn case_split_for(&self, phase: PhaseStatus) -> CaseSplit {
    match phase {
      PhaseStatus::SignPositive => self.positive_split(),
      PhaseStatus::SignNegative => self.negative_split(),
      _ => unreachable!("sign has no phase {}", phase),
    }
  }

  fn entailed_tightenings(&self, ctx: &Context, bounds: &BoundManager,
                          out: &mut Vec<Tightening>) {
    let b_lower = bounds.lower(ctx, self.b);
    let b_upper = bounds.upper(ctx, self.b);
    let f_lower = bounds.lower(ctx, self.f);
    let f_upper = bounds.upper(ctx, self.f);

    // The output is always clamped to [-1, 1].
    out.push(Tightening::lower(self.f, -1.0));
    out.push(Tightening::upper(self.f, 1.0));

    if !float_utils::is_negative(b_lower) || float_utils::gt(f_lower, -1.0) {
      // Positive phase: f = 1, b >= 0.
      out.push(Tightening::lower(self.f, 1.0));
      out.push(Tightening::lower(self.b, 0.0));
    } else if float_utils::is_negative(b_upper) || float_utils::lt(f_upper, 1.0) {
      // Negative phase: f = -1, b < 0.
      out.push(Tightening::upper(self.f, -1.0));
      out.push(Tightening::upper(self.b, 0.0));
    }
  }

  fn cost_component(&self, out: &mut LinearExpr, phase: PhaseStatus) {
    match phase {
      // 1 - f: non-negative under the clamp, zero exactly at f = 1.
      PhaseStatus::SignPositive => {
        out.add_to_coefficient(self.f, -1.0);
        out.add_constant(1.0);
      }
      // 1 + f: zero exactly at f = -1.
      PhaseStatus::SignNegative => {
        out.add_to_coefficient(self.f, 1.0);
        out.add_constant(1.0);
      }
      _ => unreachable!("sign has no cost term for {}", phase),
    }
  }

  fn supports_soi_cost(&self) -> bool {
    true
  }

  fn phase_in_assignment(&self, assignment: &[f64]) -> PhaseStatus {
    if assignment[self.b] >= 0.0 {
      PhaseStatus::SignPositive
    } else {
      PhaseStatus::SignNegative
    }
  }

  fn serialize_to_string(&self) -> String {
    // Output format is: sign,f,b
    format!("sign,{},{}", self.f, self.b)
  }

  fn eliminate_variable(&mut self, _variable: Variable, _value: f64) {
    self.have_eliminated_variables = true;
  }

  fn update_variable_index(&mut self, old_index: Variable, new_index: Variable) {
    if self.b == old_index {
      self.b = new_index;
    } else if self.f == old_index {
      self.f = new_index;
    }
  }

  fn obsolete(&self) -> bool {
    self.have_eliminated_variables
  }

  fn polarity(&self, ctx: &Context, bounds: &BoundManager) -> Option<f64> {
    Some(self.compute_polarity(ctx, bounds))
  }

  fn update_direction(&self, ctx: &Context, bounds: &BoundManager) {
    let polarity = self.compute_polarity(ctx, bounds);
    self.core.set_direction(if polarity > 0.0 {
      PhaseStatus::SignPositive
    } else {
      PhaseStatus::SignNegative
    });
    self.core.set_score(num_traits::abs(polarity));
  }

  fn clone_boxed(&self) -> Box<dyn PiecewiseLinear> {
    Box::new(self.clone())
  }
}
