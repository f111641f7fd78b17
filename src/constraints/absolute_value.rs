/*!

  `f = |b|`.

  Two phases: positive (`f = b`, `b >= 0`) and negative (`f = -b`,
  `b <= 0`). Two auxiliary variables enforce the signs in the relaxation:
  `posAux = f - b >= 0` (zero in the positive phase) and
  `negAux = f + b >= 0` (zero in the negative phase).

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
pub struct AbsoluteValueConstraint {
  b      : Variable,
  f      : Variable,
  pos_aux: Option<Variable>,
  neg_aux: Option<Variable>,
  core   : ConstraintCore,
  have_eliminated_variables: bool,
}

impl AbsoluteValueConstraint {
  pub fn new(b: Variable, f: Variable) -> Self {
    AbsoluteValueConstraint {
      b,
      f,
      pos_aux: None,
      neg_aux: None,
      core: ConstraintCore::new(),
      have_eliminated_variables: false,
    }
  }

  pub fn with_aux(b: Variable, f: Variable, pos_aux: Variable, neg_aux: Variable) -> Self {
    AbsoluteValueConstraint {
      b,
      f,
      pos_aux: Some(pos_aux),
      neg_aux: Some(neg_aux),
      core: ConstraintCore::new(),
      have_eliminated_variables: false,
    }
  }

  /// Input format is `absoluteValue,f,b` or `absoluteValue,f,b,posAux,negAux`.
  pub fn from_serialized(line: &str) -> Result<Self, String> {
    let tokens: Vec<&str> = line.split(',').collect();
    if tokens.first() != Some(&"absoluteValue") || (tokens.len() != 3 && tokens.len() != 5) {
      return Err(format!("expected `absoluteValue,f,b[,posAux,negAux]`, got `{}`", line));
    }
    let parse = |t: &str| t.trim().parse::<usize>().map_err(|_| format!("bad variable index `{}`", t));
    let f = parse(tokens[1])?;
    let b = parse(tokens[2])?;
    if tokens.len() == 5 {
      Ok(AbsoluteValueConstraint::with_aux(b, f, parse(tokens[3])?, parse(tokens[4])?))
    } else {
      Ok(AbsoluteValueConstraint::new(b, f))
    }
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
    // Positive phase: b >= 0, f = b
    let mut split = CaseSplit::new();
    split.store_bound_tightening(Tightening::lower(self.b, 0.0));
    if let Some(pos_aux) = self.pos_aux {
      split.store_bound_tightening(Tightening::upper(pos_aux, 0.0));
    } else {
      let mut equation = Equation::new(Relation::Eq);
      equation.add_addend(1.0, self.f);
      equation.add_addend(-1.0, self.b);
      equation.set_scalar(0.0);
      split.add_equation(equation);
    }
    split
  }

  fn negative_split(&self) -> CaseSplit {
    // Negative phase: b <= 0, f = -b
    let mut split = CaseSplit::new();
    split.store_bound_tightening(Tightening::upper(self.b, 0.0));
    if let Some(neg_aux) = self.neg_aux {
      split.store_bound_tightening(Tightening::upper(neg_aux, 0.0));
    } else {
      let mut equation = Equation::new(Relation::Eq);
      equation.add_addend(1.0, self.f);
      equation.add_addend(1.0, self.b);
      equation.set_scalar(0.0);
      split.add_equation(equation);
    }
    split
  }
}

impl PiecewiseLinear for AbsoluteValueConstraint {
  fn kind(&self) -> ConstraintKind {
    ConstraintKind::AbsoluteValue
  }

  fn core(&self) -> &ConstraintCore {
    &self.core
  }

  fn core_mut(&mut self) -> &mut ConstraintCore {
    &mut self.core
  }

  fn participating_variables(&self) -> Vec<Variable> {
    let mut variables = vec![self.b, self.f];
    variables.extend(self.pos_aux);
    variables.extend(self.neg_aux);
    variables
  }

  fn notify_lower_bound(&self, variable: Variable, bound: f64,
                        bounds: &BoundManager, ctx: &mut Context) {
    if variable == self.b && !float_utils::is_negative(bound) {
      self.core.set_phase(ctx, PhaseStatus::AbsPositive);
    } else if Some(variable) == self.pos_aux && float_utils::is_positive(bound) {
      self.core.set_phase(ctx, PhaseStatus::AbsNegative);
    } else if Some(variable) == self.neg_aux && float_utils::is_positive(bound) {
      self.core.set_phase(ctx, PhaseStatus::AbsPositive);
    }

    if !self.core.is_active(ctx) {
      return;
    }

    if variable == self.f && bound < 0.0 {
      bounds.tighten_lower(ctx, self.f, 0.0);
      return;
    }

    match self.core.phase(ctx) {
      PhaseStatus::AbsPositive => {
        if variable == self.b {
          bounds.tighten_lower(ctx, self.f, bound);
        } else if variable == self.f && bound > 0.0 {
          bounds.tighten_lower(ctx, self.b, bound);
        }
        if let Some(pos_aux) = self.pos_aux {
          bounds.tighten_upper(ctx, pos_aux, 0.0);
        }
      }
      PhaseStatus::AbsNegative => {
        if variable == self.b {
          bounds.tighten_upper(ctx, self.f, -bound);
        } else if variable == self.f && bound > 0.0 {
          bounds.tighten_upper(ctx, self.b, -bound);
        }
        if let Some(neg_aux) = self.neg_aux {
          bounds.tighten_upper(ctx, neg_aux, 0.0);
        }
      }
      _ => {}
    }
  }

  fn notify_upper_bound(&self, variable: Variable, bound: f64,
                        bounds: &BoundManager, ctx: &mut Context) {
    if variable == self.b && float_utils::is_negative(bound) {
      self.core.set_phase(ctx, PhaseStatus::AbsNegative);
    } else if Some(variable) == self.pos_aux && float_utils::is_zero(bound) {
      self.core.set_phase(ctx, PhaseStatus::AbsPositive);
    } else if Some(variable) == self.neg_aux && float_utils::is_zero(bound) {
      self.core.set_phase(ctx, PhaseStatus::AbsNegative);
    }

    if !self.core.is_active(ctx) {
      return;
    }

    if variable == self.f {
      // |b| <= f <= bound boxes b regardless of phase.
      bounds.tighten_upper(ctx, self.b, bound);
      bounds.tighten_lower(ctx, self.b, -bound);
      return;
    }

    match self.core.phase(ctx) {
      PhaseStatus::AbsPositive => {
        if variable == self.b {
          bounds.tighten_upper(ctx, self.f, bound);
        }
      }
      PhaseStatus::AbsNegative => {
        if variable == self.b {
          bounds.tighten_lower(ctx, self.f, -bound);
        }
      }
      _ => {}
    }
  }

  fn satisfied(&self, assignment: &[f64]) -> bool {
    float_utils::are_equal(assignment[self.f],
                           assignment[self.b].abs(),
                           float_utils::CONSTRAINT_TOLERANCE)
  }

  fn case_splits(&self, ctx: &Context, _bounds: &BoundManager) -> Vec<CaseSplit> {
    debug_assert!(!self.phase_fixed(ctx));
    if self.core.direction() == PhaseStatus::AbsNegative {
      vec![self.negative_split(), self.positive_split()]
    } else {
      vec![self.positive_split(), self.negative_split()]
    }
  }

  fn all_cases(&self) -> Vec<PhaseStatus> {
    if self.core.direction() == PhaseStatus::AbsNegative {
      vec![PhaseStatus::AbsNegative, PhaseStatus::AbsPositive]
    } else {
      vec![PhaseStatus::AbsPositive, PhaseStatus::AbsNegative]
    }
  }

  fn case_split_for(&self, phase: PhaseStatus) -> CaseSplit {
    match phase {
      PhaseStatus::AbsPositive => self.positive_split(),
      PhaseStatus::AbsNegative => self.negative_split(),
      _ => unreachable!("abs has no phase {}", phase),
    }
  }

  fn entailed_tightenings(&self, ctx: &Context, bounds: &BoundManager,
                          out: &mut Vec<Tightening>) {
    let b_lower = bounds.lower(ctx, self.b);
    let b_upper = bounds.upper(ctx, self.b);
    let f_lower = bounds.lower(ctx, self.f);
    let f_upper = bounds.upper(ctx, self.f);

    if !float_utils::is_negative(b_lower) {
      // Positive phase: f mirrors b.
      out.push(Tightening::lower(self.f, b_lower));
      out.push(Tightening::lower(self.b, f_lower));
      out.push(Tightening::upper(self.f, b_upper));
      out.push(Tightening::upper(self.b, f_upper));
      if let Some(pos_aux) = self.pos_aux {
        out.push(Tightening::lower(pos_aux, 0.0));
        out.push(Tightening::upper(pos_aux, 0.0));
      }
    } else if !float_utils::is_positive(b_upper) {
      // Negative phase: f mirrors -b.
      out.push(Tightening::lower(self.f, -b_upper));
      out.push(Tightening::upper(self.f, -b_lower));
      out.push(Tightening::upper(self.b, -f_lower));
      out.push(Tightening::lower(self.b, -f_upper));
      if let Some(neg_aux) = self.neg_aux {
        out.push(Tightening::lower(neg_aux, 0.0));
        out.push(Tightening::upper(neg_aux, 0.0));
      }
    } else {
      // Phase unknown: f is bounded by the larger magnitude of b and b
      // is boxed by f's upper bound.
      out.push(Tightening::upper(self.f, f64::max(-b_lower, b_upper)));
      out.push(Tightening::upper(self.b, f_upper));
      out.push(Tightening::lower(self.b, -f_upper));
    }
    out.push(Tightening::lower(self.f, 0.0));
  }

  fn cost_component(&self, out: &mut LinearExpr, phase: PhaseStatus) {
    match phase {
      // f - b >= 0 in the relaxation; zero exactly when f = b.
      PhaseStatus::AbsPositive => {
        out.add_to_coefficient(self.f, 1.0);
        out.add_to_coefficient(self.b, -1.0);
      }
      // f + b >= 0 in the relaxation; zero exactly when f = -b.
      PhaseStatus::AbsNegative => {
        out.add_to_coefficient(self.f, 1.0);
        out.add_to_coefficient(self.b, 1.0);
      }
      _ => unreachable!("abs has no cost term for {}", phase),
    }
  }

  fn supports_soi_cost(&self) -> bool {
    true
  }

  fn phase_in_assignment(&self, assignment: &[f64]) -> PhaseStatus {
    if assignment[self.b] >= 0.0 {
      PhaseStatus::AbsPositive
    } else {
      PhaseStatus::AbsNegative
    }
  }

  fn serialize_to_string(&self) -> String {
    // Output format is: absoluteValue,f,b,posAux,negAux
    match (self.pos_aux, self.neg_aux) {
      (Some(pos_aux), Some(neg_aux)) =>
        format!("absoluteValue,{},{},{},{}", self.f, self.b, pos_aux, neg_aux),
      _ => format!("absoluteValue,{},{}", self.f, self.b),
    }
  }

  fn transform_to_use_aux_variables(&mut self, query: &mut Query) {
    if self.pos_aux.is_some() {
      return;
    }

    // f - b - posAux = 0 and f + b - negAux = 0, both auxes non-negative.
    let pos_aux = query.add_variable();
    let mut positive = Equation::new(Relation::Eq);
    positive.add_addend(1.0, self.f);
    positive.add_addend(-1.0, self.b);
    positive.add_addend(-1.0, pos_aux);
    positive.set_scalar(0.0);
    query.add_equation(positive);
    query.set_lower_bound(pos_aux, 0.0);

    let neg_aux = query.add_variable();
    let mut negative = Equation::new(Relation::Eq);
    negative.add_addend(1.0, self.f);
    negative.add_addend(1.0, self.b);
    negative.add_addend(-1.0, neg_aux);
    negative.set_scalar(0.0);
    query.add_equation(negative);
    query.set_lower_bound(neg_aux, 0.0);

    query.tighten_lower_bound(self.f, 0.0);

    self.pos_aux = Some(pos_aux);
    self.neg_aux = Some(neg_aux);
  }

  fn eliminate_variable(&mut self, _variable: Variable, _value: f64) {
    self.have_eliminated_variables = true;
  }

  fn update_variable_index(&mut self, old_index: Variable, new_index: Variable) {
    if self.b == old_index {
      self.b = new_index;
    } else if self.f == old_index {
      self.f = new_index;
    } else if self.pos_aux == Some(old_index) {
      self.pos_aux = Some(new_index);
    } else if self.neg_aux == Some(old_index) {
      self.neg_aux = Some(new_index);
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
      PhaseStatus::AbsPositive
    } else {
      PhaseStatus::AbsNegative
    });
    self.core.set_score(num_traits::abs(polarity));
  }

  fn clone_boxed(&self) -> Box<dyn PiecewiseLinear> {
    Box::new(self.clone())
  }
}
