/*!

  `f = max(e_1, ..., e_k)`.

  One phase per input element, identified by the element's variable so
  the identity survives element elimination. Auxiliary variables
  `aux_i = f - e_i >= 0` let a case split pin phase i with the single
  tightening `aux_i <= 0`. Inputs eliminated during preprocessing leave
  behind their fixed value as a witness: the eliminated phase keeps that
  value and is never marked infeasible.

*/

use itertools::Itertools;

use crate::bounds::BoundManager;
use crate::case_split::{CaseSplit, Tightening};
use crate::constraints::{ConstraintCore, ConstraintKind, PhaseStatus, PiecewiseLinear};
use crate::context::Context;
use crate::equation::{Equation, LinearExpr, Relation};
use crate::float_utils;
use crate::query::Query;
use crate::Variable;

#[derive(Clone, Debug)]
pub struct MaxConstraint {
  f       : Variable,
  elements: Vec<Variable>,
  auxes   : Vec<Option<Variable>>,
  eliminated_value: Option<f64>,
  f_was_eliminated: bool,
  core    : ConstraintCore,
}

impl MaxConstraint {
  pub fn new(f: Variable, elements: Vec<Variable>) -> Self {
    let auxes = vec![None; elements.len()];
    MaxConstraint {
      f,
      elements,
      auxes,
      eliminated_value: None,
      f_was_eliminated: false,
      core: ConstraintCore::new(),
    }
  }

  /// Input format is `max,f,inputCount,e_1,...,e_k[,eliminated_value]*`.
  pub fn from_serialized(line: &str) -> Result<Self, String> {
    let tokens: Vec<&str> = line.split(',').collect();
    if tokens.first() != Some(&"max") || tokens.len() < 3 {
      return Err(format!("expected `max,f,inputCount,e_1,...`, got `{}`", line));
    }
    let parse_var = |t: &str| t.trim().parse::<usize>().map_err(|_| format!("bad variable index `{}`", t));
    let f = parse_var(tokens[1])?;
    let count = parse_var(tokens[2])?;
    if tokens.len() < 3 + count {
      return Err(format!("max declares {} inputs but lists fewer", count));
    }

    let mut elements = Vec::with_capacity(count);
    for token in &tokens[3..3 + count] {
      elements.push(parse_var(token)?);
    }

    let mut constraint = MaxConstraint::new(f, elements);
    for token in &tokens[3 + count..] {
      let value = token.trim()
                       .parse::<f64>()
                       .map_err(|_| format!("bad eliminated value `{}`", token))?;
      constraint.note_eliminated_value(value);
    }
    Ok(constraint)
  }

  pub fn f(&self) -> Variable {
    self.f
  }

  pub fn elements(&self) -> &[Variable] {
    &self.elements
  }

  pub fn eliminated_value(&self) -> Option<f64> {
    self.eliminated_value
  }

  fn note_eliminated_value(&mut self, value: f64) {
    self.eliminated_value = Some(match self.eliminated_value {
      Some(current) => current.max(value),
      None          => value,
    });
  }

  fn aux_for(&self, element: Variable) -> Option<Variable> {
    self.elements
        .iter()
        .position(|e| *e == element)
        .and_then(|i| self.auxes[i])
  }

  fn element_split(&self, element: Variable) -> CaseSplit {
    let mut split = CaseSplit::new();
    if let Some(aux) = self.aux_for(element) {
      // aux = f - element >= 0, and every other aux_j >= 0 already gives
      // e_j <= f = element.
      split.store_bound_tightening(Tightening::upper(aux, 0.0));
    } else {
      let mut pins = Equation::new(Relation::Eq);
      pins.add_addend(1.0, self.f);
      pins.add_addend(-1.0, element);
      pins.set_scalar(0.0);
      split.add_equation(pins);

      for other in self.elements.iter().filter(|e| **e != element) {
        let mut dominated = Equation::new(Relation::Le);
        dominated.add_addend(1.0, *other);
        dominated.add_addend(-1.0, element);
        dominated.set_scalar(0.0);
        split.add_equation(dominated);
      }
    }
    if let Some(value) = self.eliminated_value {
      split.store_bound_tightening(Tightening::lower(self.f, value));
    }
    split
  }

  fn eliminated_split(&self) -> CaseSplit {
    let value = self.eliminated_value.expect("no eliminated witness");
    let mut split = CaseSplit::new();
    split.store_bound_tightening(Tightening::lower(self.f, value));
    split.store_bound_tightening(Tightening::upper(self.f, value));
    for element in &self.elements {
      split.store_bound_tightening(Tightening::upper(*element, value));
    }
    split
  }

  fn fix_phase_if_needed(&self, bounds: &BoundManager, ctx: &mut Context) {
    if self.phase_fixed(ctx) {
      return;
    }
    let feasible = self.feasible_cases(ctx);
    if feasible.len() == 1 {
      let phase = feasible[0];
      self.core.set_phase(ctx, phase);
      if let (PhaseStatus::MaxCase(element), true) = (phase, self.core.is_active(ctx)) {
        let element = element as Variable;
        bounds.tighten_lower(ctx, self.f, bounds.lower(ctx, element));
        bounds.tighten_upper(ctx, self.f, bounds.upper(ctx, element));
        if let Some(aux) = self.aux_for(element) {
          bounds.tighten_upper(ctx, aux, 0.0);
        }
      }
    }
  }

  /// The largest possible value of the relation under current bounds.
  fn best_upper(&self, ctx: &Context, bounds: &BoundManager) -> f64 {
    let mut best = self.eliminated_value.unwrap_or(f64::NEG_INFINITY);
    for element in &self.elements {
      best = best.max(bounds.upper(ctx, *element));
    }
    best
  }
}

impl PiecewiseLinear for MaxConstraint {
  fn kind(&self) -> ConstraintKind {
    ConstraintKind::Max
  }

  fn core(&self) -> &ConstraintCore {
    &self.core
  }

  fn core_mut(&mut self) -> &mut ConstraintCore {
    &mut self.core
  }

  fn participating_variables(&self) -> Vec<Variable> {
    let mut variables = vec![self.f];
    variables.extend(self.elements.iter().copied());
    variables.extend(self.auxes.iter().flatten().copied());
    variables
  }

  fn notify_lower_bound(&self, variable: Variable, bound: f64,
                        bounds: &BoundManager, ctx: &mut Context) {
    if self.elements.contains(&variable) {
      if self.core.is_active(ctx) {
        bounds.tighten_lower(ctx, self.f, bound);
      }
      // Elements whose whole interval sits below this lower bound can
      // no longer realize the max. The eliminated witness is exempt.
      for other in &self.elements {
        if *other != variable && float_utils::gt(bound, bounds.upper(ctx, *other)) {
          self.core.mark_infeasible(ctx, PhaseStatus::MaxCase(*other as u32));
        }
      }
    } else if variable == self.f
              && self.core.is_active(ctx)
              && self.elements.len() == 1
              && self.eliminated_value.map_or(true, |v| float_utils::lt(v, bound)) {
      bounds.tighten_lower(ctx, self.elements[0], bound);
    }
    self.fix_phase_if_needed(bounds, ctx);
  }

  fn notify_upper_bound(&self, variable: Variable, bound: f64,
                        bounds: &BoundManager, ctx: &mut Context) {
    if variable == self.f {
      if self.core.is_active(ctx) {
        // Every element sits below the max.
        for element in &self.elements {
          bounds.tighten_upper(ctx, *element, bound);
        }
      }
    } else if self.elements.contains(&variable) {
      if self.core.is_active(ctx) {
        bounds.tighten_upper(ctx, self.f, self.best_upper(ctx, bounds));
      }
      for other in &self.elements {
        if *other != variable && float_utils::gt(bounds.lower(ctx, *other), bound) {
          self.core.mark_infeasible(ctx, PhaseStatus::MaxCase(variable as u32));
          break;
        }
      }
    }
    self.fix_phase_if_needed(bounds, ctx);
  }

  fn satisfied(&self, assignment: &[f64]) -> bool {
    let mut best = self.eliminated_value.unwrap_or(f64::NEG_INFINITY);
    for element in &self.elements {
      best = best.max(assignment[*element]);
    }
    float_utils::are_equal(assignment[self.f], best, float_utils::CONSTRAINT_TOLERANCE)
  }

  fn case_splits(&self, ctx: &Context, _bounds: &BoundManager) -> Vec<CaseSplit> {
    debug_assert!(!self.phase_fixed(ctx));
    self.feasible_cases(ctx)
        .into_iter()
        .map(|phase| self.case_split_for(phase))
        .collect()
  }

  fn all_cases(&self) -> Vec<PhaseStatus> {
    let mut cases: Vec<PhaseStatus> = self.elements
                                          .iter()
                                          .map(|e| PhaseStatus::MaxCase(*e as u32))
                                          .collect();
    if self.eliminated_value.is_some() {
      cases.push(PhaseStatus::MaxEliminated);
    }
    cases
  }

  fn case_split_for(&self, phase: PhaseStatus) -> CaseSplit {
    match phase {
      PhaseStatus::MaxCase(element) => self.element_split(element as Variable),
      PhaseStatus::MaxEliminated    => self.eliminated_split(),
      _ => unreachable!("max has no phase {}", phase),
    }
  }

  fn entailed_tightenings(&self, ctx: &Context, bounds: &BoundManager,
                          out: &mut Vec<Tightening>) {
    let f_upper = bounds.upper(ctx, self.f);

    let mut best_lower = self.eliminated_value.unwrap_or(f64::NEG_INFINITY);
    for element in &self.elements {
      best_lower = best_lower.max(bounds.lower(ctx, *element));
      out.push(Tightening::upper(*element, f_upper));
    }
    if float_utils::is_finite(best_lower) {
      out.push(Tightening::lower(self.f, best_lower));
    }

    let best_upper = self.best_upper(ctx, bounds);
    if float_utils::is_finite(best_upper) {
      out.push(Tightening::upper(self.f, best_upper));
    }
  }

  fn cost_component(&self, out: &mut LinearExpr, phase: PhaseStatus) {
    match phase {
      // f - e_i >= 0 in the relaxation; zero exactly when f = e_i.
      PhaseStatus::MaxCase(element) => {
        out.add_to_coefficient(self.f, 1.0);
        out.add_to_coefficient(element as Variable, -1.0);
      }
      // f >= witness always; zero exactly when f equals it.
      PhaseStatus::MaxEliminated => {
        out.add_to_coefficient(self.f, 1.0);
        out.add_constant(-self.eliminated_value.expect("no eliminated witness"));
      }
      _ => unreachable!("max has no cost term for {}", phase),
    }
  }

  fn supports_soi_cost(&self) -> bool {
    true
  }

  fn phase_in_assignment(&self, assignment: &[f64]) -> PhaseStatus {
    let mut best_phase = PhaseStatus::MaxEliminated;
    let mut best = self.eliminated_value.unwrap_or(f64::NEG_INFINITY);
    for element in &self.elements {
      if assignment[*element] > best {
        best = assignment[*element];
        best_phase = PhaseStatus::MaxCase(*element as u32);
      }
    }
    best_phase
  }

  fn serialize_to_string(&self) -> String {
    // Output format is: max,f,inputCount,e_1,...,e_k[,eliminated_value]
    let elements = self.elements.iter().map(|e| e.to_string()).join(",");
    match self.eliminated_value {
      Some(value) => format!("max,{},{},{},{}", self.f, self.elements.len(), elements, value),
      None        => format!("max,{},{},{}", self.f, self.elements.len(), elements),
    }
  }

  fn transform_to_use_aux_variables(&mut self, query: &mut Query) {
    for i in 0..self.elements.len() {
      if self.auxes[i].is_some() {
        continue;
      }
      // f - e_i - aux_i = 0, aux_i >= 0.
      let aux = query.add_variable();
      let mut equation = Equation::new(Relation::Eq);
      equation.add_addend(1.0, self.f);
      equation.add_addend(-1.0, self.elements[i]);
      equation.add_addend(-1.0, aux);
      equation.set_scalar(0.0);
      query.add_equation(equation);
      query.set_lower_bound(aux, 0.0);
      self.auxes[i] = Some(aux);
    }
  }

  fn eliminate_variable(&mut self, variable: Variable, value: f64) {
    if variable == self.f {
      self.f_was_eliminated = true;
      return;
    }
    if let Some(position) = self.elements.iter().position(|e| *e == variable) {
      self.elements.remove(position);
      self.auxes.remove(position);
      self.note_eliminated_value(value);
    }
  }

  fn update_variable_index(&mut self, old_index: Variable, new_index: Variable) {
    if self.f == old_index {
      self.f = new_index;
    }
    for element in self.elements.iter_mut() {
      if *element == old_index {
        *element = new_index;
      }
    }
    for aux in self.auxes.iter_mut().flatten() {
      if *aux == old_index {
        *aux = new_index;
      }
    }
  }

  fn obsolete(&self) -> bool {
    self.f_was_eliminated || self.elements.is_empty()
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

  fn installed(mut max: MaxConstraint, ctx: &mut Context) -> MaxConstraint {
    max.core_mut().register(ctx);
    max
  }

  #[test]
  fn element_lower_bound_lifts_the_output() {
    let (mut ctx, bounds) = fixture(3);
    let max = installed(MaxConstraint::new(2, vec![0, 1]), &mut ctx);

    bounds.tighten_lower(&mut ctx, 0, 4.0);
    max.notify_lower_bound(0, 4.0, &bounds, &mut ctx);
    assert_eq!(bounds.lower(&ctx, 2), 4.0);
  }

  #[test]
  fn dominated_element_is_ruled_out_and_phase_fixes() {
    let (mut ctx, bounds) = fixture(3);
    let max = installed(MaxConstraint::new(2, vec![0, 1]), &mut ctx);

    bounds.tighten_upper(&mut ctx, 1, 1.0);
    max.notify_upper_bound(1, 1.0, &bounds, &mut ctx);
    bounds.tighten_lower(&mut ctx, 0, 3.0);
    max.notify_lower_bound(0, 3.0, &bounds, &mut ctx);

    assert_eq!(max.core().phase(&ctx), PhaseStatus::MaxCase(0));
  }

  #[test]
  fn output_upper_bound_caps_every_element() {
    let (mut ctx, bounds) = fixture(3);
    let max = installed(MaxConstraint::new(2, vec![0, 1]), &mut ctx);

    bounds.tighten_upper(&mut ctx, 2, 6.0);
    max.notify_upper_bound(2, 6.0, &bounds, &mut ctx);
    assert_eq!(bounds.upper(&ctx, 0), 6.0);
    assert_eq!(bounds.upper(&ctx, 1), 6.0);
  }

  #[test]
  fn satisfied_accounts_for_the_eliminated_witness() {
    let mut max = MaxConstraint::new(2, vec![0, 1]);
    assert!(max.satisfied(&[1.0, 3.0, 3.0]));
    assert!(!max.satisfied(&[1.0, 3.0, 1.0]));

    max.eliminate_variable(1, 5.0);
    assert!(max.satisfied(&[1.0, 0.0, 5.0]));
    assert!(!max.satisfied(&[1.0, 0.0, 1.0]));
  }

  #[test]
  fn elimination_preserves_the_witness_and_its_phase() {
    let mut max = MaxConstraint::new(2, vec![0, 1]);
    max.eliminate_variable(0, 2.5);
    assert_eq!(max.eliminated_value(), Some(2.5));
    assert_eq!(max.elements(), &[1]);
    assert!(max.all_cases().contains(&PhaseStatus::MaxEliminated));

    // A second elimination keeps the larger witness.
    max.eliminate_variable(1, 1.0);
    assert_eq!(max.eliminated_value(), Some(2.5));
    assert!(max.obsolete());
  }

  #[test]
  fn serialization_round_trips_with_eliminated_value() {
    let mut max = MaxConstraint::new(5, vec![1, 2, 3]);
    max.eliminate_variable(3, 0.5);
    let line = max.serialize_to_string();
    assert_eq!(line, "max,5,2,1,2,0.5");

    let parsed = MaxConstraint::from_serialized(&line).unwrap();
    assert_eq!(parsed.f(), 5);
    assert_eq!(parsed.elements(), &[1, 2]);
    assert_eq!(parsed.eliminated_value(), Some(0.5));
  }
}
