/*!

  `f = max(b, 0)`, the rectified linear unit.

  Two phases: active (`f = b`, `b >= 0`) and inactive (`f = 0`, `b <= 0`).
  An optional auxiliary variable `aux = f - b >= 0` strengthens the LP
  relaxation; when it is in use the active split is just `aux <= 0` and
  the inactive phase forces `b = -aux`.

*/

use crate::bounds::BoundManager;
use crate::case_split::{CaseSplit, Tightening};
use crate::constraints::{ConstraintCore, ConstraintKind, PhaseStatus, PiecewiseLinear};
use crate::context::Context;
use crate::equation::{Equation, LinearExpr, Relation};
use crate::float_utils;
use crate::query::Query;
use crate::Variable;

#[derive(Clone, Debug)]
pub struct ReluConstraint {
  b   : Variable,
  f   : Variable,
  aux : Option<Variable>,
  core: ConstraintCore,
  have_eliminated_variables: bool,
}

impl ReluConstraint {
  pub fn new(b: Variable, f: Variable) -> Self {
    ReluConstraint {
      b,
      f,
      aux: None,
      core: ConstraintCore::new(),
      have_eliminated_variables: false,
    }
  }

  pub fn with_aux(b: Variable, f: Variable, aux: Variable) -> Self {
    ReluConstraint {
      b,
      f,
      aux: Some(aux),
      core: ConstraintCore::new(),
      have_eliminated_variables: false,
    }
  }

  /// Input format is `relu,f,b` or `relu,f,b,aux`.
  pub fn from_serialized(line: &str) -> Result<Self, String> {
    let tokens: Vec<&str> = line.split(',').collect();
    if tokens.first() != Some(&"relu") || tokens.len() < 3 || tokens.len() > 4 {
      return Err(format!("expected `relu,f,b[,aux]`, got `{}`", line));
    }
    let parse = |t: &str| t.trim().parse::<usize>().map_err(|_| format!("bad variable index `{}`", t));
    let f = parse(tokens[1])?;
    let b = parse(tokens[2])?;
    if tokens.len() == 4 {
      Ok(ReluConstraint::with_aux(b, f, parse(tokens[3])?))
    } else {
      Ok(ReluConstraint::new(b, f))
    }
  }

  pub fn b(&self) -> Variable {
    self.b
  }

  pub fn f(&self) -> Variable {
    self.f
  }

  pub fn aux(&self) -> Option<Variable> {
    self.aux
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

  fn active_split(&self) -> CaseSplit {
    // Active phase: b >= 0, b - f = 0
    let mut split = CaseSplit::new();
    split.store_bound_tightening(Tightening::lower(self.b, 0.0));
    if let Some(aux) = self.aux {
      // aux = f - b and aux >= 0, so aux <= 0 pins the phase.
      split.store_bound_tightening(Tightening::upper(aux, 0.0));
    } else {
      let mut equation = Equation::new(Relation::Eq);
      equation.add_addend(1.0, self.b);
      equation.add_addend(-1.0, self.f);
      equation.set_scalar(0.0);
      split.add_equation(equation);
    }
    split
  }

  fn inactive_split(&self) -> CaseSplit {
    // Inactive phase: b <= 0, f = 0
    let mut split = CaseSplit::new();
    split.store_bound_tightening(Tightening::upper(self.b, 0.0));
    split.store_bound_tightening(Tightening::upper(self.f, 0.0));
    split
  }
}

impl PiecewiseLinear for ReluConstraint {
  fn kind(&self) -> ConstraintKind {
    ConstraintKind::Relu
  }

  fn core(&self) -> &ConstraintCore {
    &self.core
  }

  fn core_mut(&mut self) -> &mut ConstraintCore {
    &mut self.core
  }

  fn participating_variables(&self) -> Vec<Variable> {
    match self.aux {
      Some(aux) => vec![self.b, self.f, aux],
      None      => vec![self.b, self.f],
    }
  }

  fn notify_lower_bound(&self, variable: Variable, bound: f64,
                        bounds: &BoundManager, ctx: &mut Context) {
    if variable == self.f && float_utils::is_positive(bound) {
      self.core.set_phase(ctx, PhaseStatus::ReluActive);
    } else if variable == self.b && !float_utils::is_negative(bound) {
      self.core.set_phase(ctx, PhaseStatus::ReluActive);
    } else if Some(variable) == self.aux && float_utils::is_positive(bound) {
      self.core.set_phase(ctx, PhaseStatus::ReluInactive);
    }

    if !self.core.is_active(ctx) {
      return;
    }

    if (variable == self.f || variable == self.b) && bound > 0.0 {
      // A positive lower bound is always propagated between f and b.
      let partner = if variable == self.f { self.b } else { self.f };
      bounds.tighten_lower(ctx, partner, bound);
      if let Some(aux) = self.aux {
        bounds.tighten_upper(ctx, aux, 0.0);
      }
    } else if variable == self.b && float_utils::is_zero(bound) {
      if let Some(aux) = self.aux {
        bounds.tighten_upper(ctx, aux, 0.0);
      }
    } else if Some(variable) == self.aux && bound > 0.0 {
      // A positive lower bound for aux means inactive: f is 0, b = -aux.
      bounds.tighten_upper(ctx, self.b, -bound);
      bounds.tighten_upper(ctx, self.f, 0.0);
    } else if variable == self.b && bound < 0.0 {
      if let Some(aux) = self.aux {
        bounds.tighten_upper(ctx, aux, -bound);
      }
    } else if variable == self.f && bound < 0.0 {
      // f is never negative; lift a useless negative bound to 0.
      bounds.tighten_lower(ctx, self.f, 0.0);
    }
  }

  fn notify_upper_bound(&self, variable: Variable, bound: f64,
                        bounds: &BoundManager, ctx: &mut Context) {
    if (variable == self.f || variable == self.b) && !float_utils::is_positive(bound) {
      self.core.set_phase(ctx, PhaseStatus::ReluInactive);
    }
    if Some(variable) == self.aux && float_utils::is_zero(bound) {
      self.core.set_phase(ctx, PhaseStatus::ReluActive);
    }

    if !self.core.is_active(ctx) {
      return;
    }

    if variable == self.f {
      bounds.tighten_upper(ctx, self.b, bound);
    } else if variable == self.b {
      if !float_utils::is_positive(bound) {
        bounds.tighten_upper(ctx, self.f, 0.0);
        if let Some(aux) = self.aux {
          // Aux's range is minus the range of b.
          bounds.tighten_lower(ctx, aux, -bound);
        }
      } else {
        bounds.tighten_upper(ctx, self.f, bound);
      }
    } else if Some(variable) == self.aux {
      bounds.tighten_lower(ctx, self.b, -bound);
    }
  }

  fn satisfied(&self, assignment: &[f64]) -> bool {
    let b_value = assignment[self.b];
    let f_value = assignment[self.f];

    if float_utils::is_negative(f_value) {
      return false;
    }
    if float_utils::is_positive(f_value) {
      float_utils::are_equal(b_value, f_value, float_utils::CONSTRAINT_TOLERANCE)
    } else {
      !float_utils::is_positive(b_value)
    }
  }

  fn case_splits(&self, ctx: &Context, _bounds: &BoundManager) -> Vec<CaseSplit> {
    debug_assert!(!self.phase_fixed(ctx));
    if self.core.direction() == PhaseStatus::ReluInactive {
      vec![self.inactive_split(), self.active_split()]
    } else {
      vec![self.active_split(), self.inactive_split()]
    }
  }

  fn all_cases(&self) -> Vec<PhaseStatus> {
    if self.core.direction() == PhaseStatus::ReluInactive {
      vec![PhaseStatus::ReluInactive, PhaseStatus::ReluActive]
    } else {
      vec![PhaseStatus::ReluActive, PhaseStatus::ReluInactive]
    }
  }

  fn case_split_for(&self, phase: PhaseStatus) -> CaseSplit {
    match phase {
      PhaseStatus::ReluActive   => self.active_split(),
      PhaseStatus::ReluInactive => self.inactive_split(),
      _ => unreachable!("relu has no phase {}", phase),
    }
  }

  fn entailed_tightenings(&self, ctx: &Context, bounds: &BoundManager,
                          out: &mut Vec<Tightening>) {
    let b_lower = bounds.lower(ctx, self.b);
    let b_upper = bounds.upper(ctx, self.b);
    let f_lower = bounds.lower(ctx, self.f);
    let f_upper = bounds.upper(ctx, self.f);

    let aux_lower = self.aux.map(|aux| bounds.lower(ctx, aux));
    let aux_upper = self.aux.map(|aux| bounds.upper(ctx, aux));

    let active = !float_utils::is_negative(b_lower)
                 || float_utils::is_positive(f_lower)
                 || aux_upper.map_or(false, float_utils::is_zero);
    let inactive = float_utils::is_negative(b_upper)
                   || float_utils::is_zero(f_upper)
                   || aux_lower.map_or(false, float_utils::is_positive);

    if active {
      // All bounds are propagated between b and f; aux is zero.
      out.push(Tightening::lower(self.b, f_lower));
      out.push(Tightening::lower(self.f, b_lower));
      out.push(Tightening::upper(self.b, f_upper));
      out.push(Tightening::upper(self.f, b_upper));
      if let Some(aux) = self.aux {
        out.push(Tightening::lower(aux, 0.0));
        out.push(Tightening::upper(aux, 0.0));
      }
      out.push(Tightening::lower(self.b, 0.0));
      out.push(Tightening::lower(self.f, 0.0));
    } else if inactive {
      // f is zero, b is non-positive, aux = -b.
      out.push(Tightening::lower(self.f, 0.0));
      out.push(Tightening::upper(self.f, 0.0));
      out.push(Tightening::upper(self.b, 0.0));
      if let Some(aux) = self.aux {
        out.push(Tightening::upper(aux, -b_lower));
        out.push(Tightening::lower(aux, -b_upper));
        out.push(Tightening::upper(self.b, -aux_lower.unwrap()));
        out.push(Tightening::lower(self.b, -aux_upper.unwrap()));
        out.push(Tightening::lower(aux, 0.0));
      }
    } else {
      // Phase unknown: b and f share upper bounds, f and aux stay
      // non-negative, aux's upper bound mirrors b's lower bound.
      out.push(Tightening::upper(self.b, f_upper));
      out.push(Tightening::upper(self.f, b_upper));
      if let Some(aux) = self.aux {
        out.push(Tightening::lower(self.b, -aux_upper.unwrap()));
        out.push(Tightening::upper(aux, -b_lower));
        out.push(Tightening::lower(aux, 0.0));
      }
      out.push(Tightening::lower(self.f, 0.0));
    }
  }

  fn cost_component(&self, out: &mut LinearExpr, phase: PhaseStatus) {
    match phase {
      // Drive f to 0.
      PhaseStatus::ReluInactive => out.add_to_coefficient(self.f, 1.0),
      // Drive f and b together; f - b >= 0 holds in the relaxation.
      PhaseStatus::ReluActive => {
        out.add_to_coefficient(self.f, 1.0);
        out.add_to_coefficient(self.b, -1.0);
      }
      _ => unreachable!("relu has no cost term for {}", phase),
    }
  }

  fn supports_soi_cost(&self) -> bool {
    true
  }

  fn phase_in_assignment(&self, assignment: &[f64]) -> PhaseStatus {
    if float_utils::is_positive(assignment[self.b]) {
      PhaseStatus::ReluActive
    } else {
      PhaseStatus::ReluInactive
    }
  }

  fn serialize_to_string(&self) -> String {
    match self.aux {
      Some(aux) => format!("relu,{},{},{}", self.f, self.b, aux),
      None      => format!("relu,{},{}", self.f, self.b),
    }
  }

  fn transform_to_use_aux_variables(&mut self, query: &mut Query) {
    if self.aux.is_some() {
      return;
    }

    // f - b - aux = 0, aux >= 0. Upper bound: when f = 0 and b is
    // minimal, i.e. -b.lb; in the active phase (b.lb > 0) aux is 0.
    let aux = query.add_variable();
    let mut equation = Equation::new(Relation::Eq);
    equation.add_addend(1.0, self.f);
    equation.add_addend(-1.0, self.b);
    equation.add_addend(-1.0, aux);
    equation.set_scalar(0.0);
    query.add_equation(equation);

    let b_lower = query.lower_bound(self.b);
    query.set_lower_bound(aux, 0.0);
    query.set_upper_bound(aux, if b_lower > 0.0 { 0.0 } else { -b_lower });

    self.aux = Some(aux);
  }

  fn eliminate_variable(&mut self, _variable: Variable, _value: f64) {
    // If a watched variable is removed the entire constraint is
    // discarded; its semantics were folded into bounds beforehand.
    self.have_eliminated_variables = true;
  }

  fn update_variable_index(&mut self, old_index: Variable, new_index: Variable) {
    if self.b == old_index {
      self.b = new_index;
    } else if self.f == old_index {
      self.f = new_index;
    } else if self.aux == Some(old_index) {
      self.aux = Some(new_index);
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
      PhaseStatus::ReluActive
    } else {
      PhaseStatus::ReluInactive
    });
    self.core.set_score(num_traits::abs(polarity));
  }

  fn clone_boxed(&self) -> Box<dyn PiecewiseLinear> {
    Box::new(self.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn fixture(n: usize) -> (Context, BoundManager) {
    let mut ctx = Context::new();
    let mut bounds = BoundManager::new(&mut ctx);
    bounds.initialize(&mut ctx, n);
    (ctx, bounds)
  }

  fn installed(mut relu: ReluConstraint, ctx: &mut Context) -> ReluConstraint {
    relu.core_mut().register(ctx);
    relu
  }

  #[test]
  fn positive_input_lower_bound_fixes_active_and_propagates() {
    let (mut ctx, bounds) = fixture(2);
    let relu = installed(ReluConstraint::new(0, 1), &mut ctx);

    bounds.tighten_lower(&mut ctx, 0, 3.0);
    relu.notify_lower_bound(0, 3.0, &bounds, &mut ctx);

    assert_eq!(relu.core().phase(&ctx), PhaseStatus::ReluActive);
    assert!(relu.phase_fixed(&ctx));
    assert_eq!(bounds.lower(&ctx, 1), 3.0);
  }

  #[test]
  fn negative_input_upper_bound_fixes_inactive_and_zeroes_f() {
    let (mut ctx, bounds) = fixture(2);
    let relu = installed(ReluConstraint::new(0, 1), &mut ctx);

    bounds.tighten_upper(&mut ctx, 0, -1.0);
    relu.notify_upper_bound(0, -1.0, &bounds, &mut ctx);

    assert_eq!(relu.core().phase(&ctx), PhaseStatus::ReluInactive);
    assert_eq!(bounds.upper(&ctx, 1), 0.0);
  }

  #[test]
  fn aux_lower_bound_forces_inactive() {
    let (mut ctx, bounds) = fixture(3);
    let relu = installed(ReluConstraint::with_aux(0, 1, 2), &mut ctx);

    bounds.tighten_lower(&mut ctx, 2, 0.5);
    relu.notify_lower_bound(2, 0.5, &bounds, &mut ctx);

    assert_eq!(relu.core().phase(&ctx), PhaseStatus::ReluInactive);
    assert_eq!(bounds.upper(&ctx, 0), -0.5);
    assert_eq!(bounds.upper(&ctx, 1), 0.0);
  }

  #[test]
  fn satisfied_checks_the_relation_with_tolerance() {
    let relu = ReluConstraint::new(0, 1);
    assert!(relu.satisfied(&[2.0, 2.0]));
    assert!(relu.satisfied(&[-3.0, 0.0]));
    assert!(!relu.satisfied(&[2.0, 0.0]));
    assert!(!relu.satisfied(&[2.0, 1.0]));
    assert!(!relu.satisfied(&[0.0, -1.0]));
  }

  #[test]
  fn polarity_and_direction_follow_the_input_interval() {
    let (mut ctx, bounds) = fixture(2);
    let relu = installed(ReluConstraint::new(0, 1), &mut ctx);

    bounds.tighten_lower(&mut ctx, 0, -1.0);
    bounds.tighten_upper(&mut ctx, 0, 3.0);
    assert_eq!(relu.polarity(&ctx, &bounds), Some(0.5));

    relu.update_direction(&ctx, &bounds);
    assert_eq!(relu.core().direction(), PhaseStatus::ReluActive);
    assert_eq!(relu.core().score(), 0.5);
    assert_eq!(relu.all_cases(),
               vec![PhaseStatus::ReluActive, PhaseStatus::ReluInactive]);
  }

  #[test]
  fn case_splits_cover_both_phases() {
    let (mut ctx, bounds) = fixture(2);
    let relu = installed(ReluConstraint::new(0, 1), &mut ctx);

    let splits = relu.case_splits(&ctx, &bounds);
    assert_eq!(splits.len(), 2);
    // Active split carries the b - f = 0 equation when no aux is in use.
    assert_eq!(splits[0].equations().len(), 1);
    assert!(splits[1].equations().is_empty());
  }

  #[test]
  fn active_entailed_tightenings_propagate_between_b_and_f() {
    let (mut ctx, bounds) = fixture(2);
    let relu = installed(ReluConstraint::new(0, 1), &mut ctx);

    bounds.tighten_lower(&mut ctx, 0, 1.0);
    bounds.tighten_upper(&mut ctx, 0, 5.0);

    let mut tightenings = Vec::new();
    relu.entailed_tightenings(&ctx, &bounds, &mut tightenings);
    assert!(tightenings.iter().any(|t| t.variable == 1
                                       && t.kind == crate::case_split::BoundKind::Lower
                                       && t.value == 1.0));
    assert!(tightenings.iter().any(|t| t.variable == 1
                                       && t.kind == crate::case_split::BoundKind::Upper
                                       && t.value == 5.0));
  }

  #[test]
  fn serialization_round_trips() {
    let relu = ReluConstraint::with_aux(4, 7, 9);
    let line = relu.serialize_to_string();
    assert_eq!(line, "relu,7,4,9");

    let parsed = ReluConstraint::from_serialized(&line).unwrap();
    assert_eq!(parsed.b(), 4);
    assert_eq!(parsed.f(), 7);
    assert_eq!(parsed.aux(), Some(9));

    assert!(ReluConstraint::from_serialized("relu,1").is_err());
  }
}
