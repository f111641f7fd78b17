/*!

  `(split_1) or ... or (split_k)` over arbitrary bound tightenings and
  equations.

  Unlike the activation constraints this one is not a function graph; its
  watched variables are the union of everything any disjunct mentions. A
  disjunct becomes infeasible on the current branch as soon as one of its
  bound tightenings conflicts with the current bounds, and the phase is
  fixed once exactly one disjunct survives.

*/

use bit_set::BitSet;

use crate::bounds::BoundManager;
use crate::case_split::{BoundKind, CaseSplit, Tightening};
use crate::constraints::{ConstraintCore, ConstraintKind, PhaseStatus, PiecewiseLinear};
use crate::context::Context;
use crate::equation::{Equation, LinearExpr, Relation};
use crate::float_utils;
use crate::Variable;

#[derive(Clone, Debug)]
pub struct DisjunctionConstraint {
  disjuncts    : Vec<CaseSplit>,
  participating: Vec<Variable>,
  core         : ConstraintCore,
}

impl DisjunctionConstraint {
  pub fn new(disjuncts: Vec<CaseSplit>) -> Self {
    debug_assert!(!disjuncts.is_empty());
    let participating = Self::extract_participating_variables(&disjuncts);
    DisjunctionConstraint {
      disjuncts,
      participating,
      core: ConstraintCore::new(),
    }
  }

  /// Token stream is
  /// `disj,k,nbounds_1,l|u,v,val,...,neqs_1,e|l|g,naddends,coef,v,...,scalar,...`
  /// repeated per disjunct.
  pub fn from_serialized(line: &str) -> Result<Self, String> {
    let tokens: Vec<&str> = line.split(',')
                                .filter(|t| !t.trim().is_empty())
                                .collect();
    if tokens.first() != Some(&"disj") || tokens.len() < 2 {
      return Err(format!("expected `disj,k,...`, got `{}`", line));
    }

    let mut cursor = Cursor { tokens: &tokens, position: 1 };
    let disjunct_count = cursor.next_usize()?;
    let mut disjuncts = Vec::with_capacity(disjunct_count);

    for _ in 0..disjunct_count {
      let mut split = CaseSplit::new();

      let bound_count = cursor.next_usize()?;
      for _ in 0..bound_count {
        let kind = match cursor.next_token()? {
          "l" => BoundKind::Lower,
          "u" => BoundKind::Upper,
          other => return Err(format!("bad bound kind `{}`", other)),
        };
        let variable = cursor.next_usize()?;
        let value = cursor.next_f64()?;
        split.store_bound_tightening(Tightening { variable, value, kind });
      }

      let equation_count = cursor.next_usize()?;
      for _ in 0..equation_count {
        let relation = match cursor.next_token()? {
          "e" => Relation::Eq,
          "l" => Relation::Le,
          "g" => Relation::Ge,
          other => return Err(format!("bad equation type `{}`", other)),
        };
        let mut equation = Equation::new(relation);
        let addend_count = cursor.next_usize()?;
        for _ in 0..addend_count {
          let coefficient = cursor.next_f64()?;
          let variable = cursor.next_usize()?;
          equation.add_addend(coefficient, variable);
        }
        equation.set_scalar(cursor.next_f64()?);
        split.add_equation(equation);
      }

      disjuncts.push(split);
    }

    Ok(DisjunctionConstraint::new(disjuncts))
  }

  pub fn disjuncts(&self) -> &[CaseSplit] {
    &self.disjuncts
  }

  fn extract_participating_variables(disjuncts: &[CaseSplit]) -> Vec<Variable> {
    let mut set = BitSet::new();
    for disjunct in disjuncts {
      for variable in disjunct.mentioned_variables() {
        set.insert(variable);
      }
    }
    set.iter().collect()
  }

  /// A disjunct conflicts with the current bounds when one of its
  /// tightenings can no longer be applied consistently.
  fn disjunct_conflicts(&self, disjunct: &CaseSplit,
                        ctx: &Context, bounds: &BoundManager) -> bool {
    for tightening in disjunct.bound_tightenings() {
      match tightening.kind {
        BoundKind::Lower => {
          if float_utils::gt(tightening.value, bounds.upper(ctx, tightening.variable)) {
            return true;
          }
        }
        BoundKind::Upper => {
          if float_utils::lt(tightening.value, bounds.lower(ctx, tightening.variable)) {
            return true;
          }
        }
      }
    }
    false
  }

  fn update_feasible_disjuncts(&self, bounds: &BoundManager, ctx: &mut Context) {
    for (index, disjunct) in self.disjuncts.iter().enumerate() {
      let phase = PhaseStatus::DisjunctCase(index as u32);
      if self.core.infeasible_cases(ctx).contains(&phase) {
        continue;
      }
      if self.disjunct_conflicts(disjunct, ctx, bounds) {
        self.core.mark_infeasible(ctx, phase);
      }
    }

    if !self.phase_fixed(ctx) {
      let feasible = self.feasible_cases(ctx);
      if feasible.len() == 1 {
        self.core.set_phase(ctx, feasible[0]);
      }
    }
  }

  fn disjunct_satisfied(&self, disjunct: &CaseSplit, assignment: &[f64]) -> bool {
    for tightening in disjunct.bound_tightenings() {
      let value = assignment[tightening.variable];
      match tightening.kind {
        BoundKind::Lower => {
          if value < tightening.value - float_utils::CONSTRAINT_TOLERANCE {
            return false;
          }
        }
        BoundKind::Upper => {
          if value > tightening.value + float_utils::CONSTRAINT_TOLERANCE {
            return false;
          }
        }
      }
    }

    for equation in disjunct.equations() {
      let lhs = equation.evaluate_lhs(assignment);
      let holds = match equation.relation {
        Relation::Eq => float_utils::are_equal(lhs, equation.scalar,
                                               float_utils::CONSTRAINT_TOLERANCE),
        Relation::Le => lhs <= equation.scalar + float_utils::CONSTRAINT_TOLERANCE,
        Relation::Ge => lhs >= equation.scalar - float_utils::CONSTRAINT_TOLERANCE,
      };
      if !holds {
        return false;
      }
    }
    true
  }
}

impl PiecewiseLinear for DisjunctionConstraint {
  fn kind(&self) -> ConstraintKind {
    ConstraintKind::Disjunction
  }

  fn core(&self) -> &ConstraintCore {
    &self.core
  }

  fn core_mut(&mut self) -> &mut ConstraintCore {
    &mut self.core
  }

  fn participating_variables(&self) -> Vec<Variable> {
    self.participating.clone()
  }

  fn notify_lower_bound(&self, _variable: Variable, _bound: f64,
                        bounds: &BoundManager, ctx: &mut Context) {
    self.update_feasible_disjuncts(bounds, ctx);
  }

  fn notify_upper_bound(&self, _variable: Variable, _bound: f64,
                        bounds: &BoundManager, ctx: &mut Context) {
    self.update_feasible_disjuncts(bounds, ctx);
  }

  fn satisfied(&self, assignment: &[f64]) -> bool {
    self.disjuncts
        .iter()
        .any(|disjunct| self.disjunct_satisfied(disjunct, assignment))
  }

  fn case_splits(&self, ctx: &Context, _bounds: &BoundManager) -> Vec<CaseSplit> {
    self.feasible_cases(ctx)
        .into_iter()
        .map(|phase| self.case_split_for(phase))
        .collect()
  }

  fn all_cases(&self) -> Vec<PhaseStatus> {
    (0..self.disjuncts.len())
      .map(|index| PhaseStatus::DisjunctCase(index as u32))
      .collect()
  }

  fn case_split_for(&self, phase: PhaseStatus) -> CaseSplit {
    match phase {
      PhaseStatus::DisjunctCase(index) => self.disjuncts[index as usize].clone(),
      _ => unreachable!("disjunction has no phase {}", phase),
    }
  }

  fn entailed_tightenings(&self, _ctx: &Context, _bounds: &BoundManager,
                          _out: &mut Vec<Tightening>) {
    // Disjuncts constrain nothing until all but one are excluded, and
    // that case is handled through the implied valid split.
  }

  fn cost_component(&self, _out: &mut LinearExpr, _phase: PhaseStatus) {
    unreachable!("disjunctions do not participate in the SoI cost");
  }

  fn supports_soi_cost(&self) -> bool {
    false
  }

  fn phase_in_assignment(&self, assignment: &[f64]) -> PhaseStatus {
    for (index, disjunct) in self.disjuncts.iter().enumerate() {
      if self.disjunct_satisfied(disjunct, assignment) {
        return PhaseStatus::DisjunctCase(index as u32);
      }
    }
    PhaseStatus::NotFixed
  }

  fn serialize_to_string(&self) -> String {
    let mut tokens: Vec<String> = vec!["disj".to_string(), self.disjuncts.len().to_string()];
    for disjunct in &self.disjuncts {
      tokens.push(disjunct.bound_tightenings().len().to_string());
      for bound in disjunct.bound_tightenings() {
        tokens.push(match bound.kind {
          BoundKind::Lower => "l".to_string(),
          BoundKind::Upper => "u".to_string(),
        });
        tokens.push(bound.variable.to_string());
        tokens.push(bound.value.to_string());
      }
      tokens.push(disjunct.equations().len().to_string());
      for equation in disjunct.equations() {
        tokens.push(match equation.relation {
          Relation::Le => "l".to_string(),
          Relation::Ge => "g".to_string(),
          Relation::Eq => "e".to_string(),
        });
        tokens.push(equation.addends.len().to_string());
        for (coefficient, variable) in &equation.addends {
          tokens.push(coefficient.to_string());
          tokens.push(variable.to_string());
        }
        tokens.push(equation.scalar.to_string());
      }
    }
    tokens.join(",")
  }

  fn eliminate_variable(&mut self, _variable: Variable, _value: f64) {
    // The eliminated variable's bounds stay pinned at its value, so the
    // feasibility checks keep working unchanged.
  }

  fn update_variable_index(&mut self, old_index: Variable, new_index: Variable) {
    for disjunct in self.disjuncts.iter_mut() {
      disjunct.update_variable_index(old_index, new_index);
    }
    self.participating = Self::extract_participating_variables(&self.disjuncts);
  }

  fn obsolete(&self) -> bool {
    false
  }

  fn clone_boxed(&self) -> Box<dyn PiecewiseLinear> {
    Box::new(self.clone())
  }
}

struct Cursor<'a> {
  tokens  : &'a [&'a str],
  position: usize,
}

impl<'a> Cursor<'a> {
  fn next_token(&mut self) -> Result<&'a str, String> {
    let token = self.tokens
                    .get(self.position)
                    .ok_or_else(|| "unexpected end of disjunction tokens".to_string())?;
    self.position += 1;
    Ok(token.trim())
  }

  fn next_usize(&mut self) -> Result<usize, String> {
    let token = self.next_token()?;
    token.parse::<usize>().map_err(|_| format!("bad integer `{}`", token))
  }

  fn next_f64(&mut self) -> Result<f64, String> {
    let token = self.next_token()?;
    token.parse::<f64>().map_err(|_| format!("bad scalar `{}`", token))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn integrality_disjunction() -> DisjunctionConstraint {
    // x0 = 0 or x0 = 1
    let mut zero = CaseSplit::new();
    zero.store_bound_tightening(Tightening::lower(0, 0.0));
    zero.store_bound_tightening(Tightening::upper(0, 0.0));
    let mut one = CaseSplit::new();
    one.store_bound_tightening(Tightening::lower(0, 1.0));
    one.store_bound_tightening(Tightening::upper(0, 1.0));
    DisjunctionConstraint::new(vec![zero, one])
  }

  fn fixture(n: usize) -> (Context, BoundManager) {
    let mut ctx = Context::new();
    let mut bounds = BoundManager::new(&mut ctx);
    bounds.initialize(&mut ctx, n);
    (ctx, bounds)
  }

  #[test]
  fn watches_the_union_of_mentioned_variables() {
    let disj = integrality_disjunction();
    assert_eq!(disj.participating_variables(), vec![0]);
    assert_eq!(disj.all_cases().len(), 2);
  }

  #[test]
  fn conflicting_disjunct_is_excluded_and_the_last_one_fixes() {
    let (mut ctx, bounds) = fixture(1);
    let mut disj = integrality_disjunction();
    disj.core_mut().register(&mut ctx);

    bounds.tighten_lower(&mut ctx, 0, 0.5);
    disj.notify_lower_bound(0, 0.5, &bounds, &mut ctx);

    assert_eq!(disj.feasible_cases(&ctx), vec![PhaseStatus::DisjunctCase(1)]);
    assert_eq!(disj.core().phase(&ctx), PhaseStatus::DisjunctCase(1));
    assert!(disj.phase_fixed(&ctx));
  }

  #[test]
  fn satisfied_accepts_any_holding_disjunct() {
    let disj = integrality_disjunction();
    assert!(disj.satisfied(&[0.0]));
    assert!(disj.satisfied(&[1.0]));
    assert!(!disj.satisfied(&[0.5]));
  }

  #[test]
  fn serialization_round_trips() {
    let disj = integrality_disjunction();
    let line = disj.serialize_to_string();
    assert_eq!(line, "disj,2,2,l,0,0,u,0,0,0,2,l,0,1,u,0,1,0");

    let parsed = DisjunctionConstraint::from_serialized(&line).unwrap();
    assert_eq!(parsed.disjuncts().len(), 2);
    assert!(parsed.satisfied(&[1.0]));
    assert!(!parsed.satisfied(&[0.4]));
  }

  #[test]
  fn parses_a_disjunction_with_equations() {
    // One disjunct: no bounds, one equation 2 x0 - 1 x1 <= 3.
    let parsed = DisjunctionConstraint::from_serialized("disj,1,0,1,l,2,2,0,-1,1,3").unwrap();
    assert_eq!(parsed.disjuncts().len(), 1);
    assert_eq!(parsed.disjuncts()[0].equations().len(), 1);
    assert!(parsed.satisfied(&[1.0, 0.0]));
    assert!(!parsed.satisfied(&[3.0, 0.0]));
  }
}
