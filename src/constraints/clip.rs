/*!

  `f = min(ceiling, max(floor, b))`.

  Three phases: floor (`hi[b] <= floor`, `f = floor`), ceiling
  (`lo[b] >= ceiling`, `f = ceiling`) and middle (`f = b` with
  `floor <= b <= ceiling`). The floor and ceiling phases are ruled out
  individually as the output's bounds move off the saturation values;
  the middle phase is fixed once both saturations are excluded.

*/

use crate::bounds::BoundManager;
use crate::case_split::{CaseSplit, Tightening};
use crate::constraints::{ConstraintCore, ConstraintKind, PhaseStatus, PiecewiseLinear};
use crate::context::Context;
use crate::equation::{Equation, LinearExpr, Relation};
use crate::float_utils;
use crate::Variable;

#[derive(Clone, Debug)]
pub struct ClipConstraint {
  b      : Variable,
  f      : Variable,
  floor  : f64,
  ceiling: f64,
  core   : ConstraintCore,
  have_eliminated_variables: bool,
}

impl ClipConstraint {
  pub fn new(b: Variable, f: Variable, floor: f64, ceiling: f64) -> Self {
    debug_assert!(floor <= ceiling);
    ClipConstraint {
      b,
      f,
      floor,
      ceiling,
      core: ConstraintCore::new(),
      have_eliminated_variables: false,
    }
  }

  /// Input format is `clip,f,b,floor,ceiling`.
  pub fn from_serialized(line: &str) -> Result<Self, String> {
    let tokens: Vec<&str> = line.split(',').collect();
    if tokens.first() != Some(&"clip") || tokens.len() != 5 {
      return Err(format!("expected `clip,f,b,floor,ceiling`, got `{}`", line));
    }
    let parse_var = |t: &str| t.trim().parse::<usize>().map_err(|_| format!("bad variable index `{}`", t));
    let parse_num = |t: &str| t.trim().parse::<f64>().map_err(|_| format!("bad scalar `{}`", t));
    let f = parse_var(tokens[1])?;
    let b = parse_var(tokens[2])?;
    let floor = parse_num(tokens[3])?;
    let ceiling = parse_num(tokens[4])?;
    if floor > ceiling {
      return Err(format!("clip floor {} above ceiling {}", floor, ceiling));
    }
    Ok(ClipConstraint::new(b, f, floor, ceiling))
  }

  pub fn b(&self) -> Variable {
    self.b
  }

  pub fn f(&self) -> Variable {
    self.f
  }

  fn clamp(&self, x: f64) -> f64 {
    x.max(self.floor).min(self.ceiling)
  }

  fn floor_split(&self) -> CaseSplit {
    // Floor phase: b <= floor, f = floor
    let mut split = CaseSplit::new();
    split.store_bound_tightening(Tightening::upper(self.b, self.floor));
    split.store_bound_tightening(Tightening::lower(self.f, self.floor));
    split.store_bound_tightening(Tightening::upper(self.f, self.floor));
    split
  }

  fn ceiling_split(&self) -> CaseSplit {
    // Ceiling phase: b >= ceiling, f = ceiling
    let mut split = CaseSplit::new();
    split.store_bound_tightening(Tightening::lower(self.b, self.ceiling));
    split.store_bound_tightening(Tightening::lower(self.f, self.ceiling));
    split.store_bound_tightening(Tightening::upper(self.f, self.ceiling));
    split
  }

  fn middle_split(&self) -> CaseSplit {
    // Middle phase: floor <= b <= ceiling, f = b
    let mut split = CaseSplit::new();
    split.store_bound_tightening(Tightening::lower(self.b, self.floor));
    split.store_bound_tightening(Tightening::upper(self.b, self.ceiling));
    let mut equation = Equation::new(Relation::Eq);
    equation.add_addend(1.0, self.f);
    equation.add_addend(-1.0, self.b);
    equation.set_scalar(0.0);
    split.add_equation(equation);
    split
  }

  /// Fixes the phase once only one case survives exclusion, applying the
  /// phase's output pinning.
  fn fix_phase_if_needed(&self, bounds: &BoundManager, ctx: &mut Context) {
    if self.phase_fixed(ctx) {
      return;
    }
    let feasible = self.feasible_cases(ctx);
    if feasible.len() == 1 {
      let phase = feasible[0];
      self.core.set_phase(ctx, phase);
      self.apply_phase_tightenings(phase, bounds, ctx);
    }
  }

  fn apply_phase_tightenings(&self, phase: PhaseStatus, bounds: &BoundManager, ctx: &mut Context) {
    if !self.core.is_active(ctx) {
      return;
    }
    match phase {
      PhaseStatus::ClipFloor => {
        bounds.tighten_lower(ctx, self.f, self.floor);
        bounds.tighten_upper(ctx, self.f, self.floor);
      }
      PhaseStatus::ClipCeiling => {
        bounds.tighten_lower(ctx, self.f, self.ceiling);
        bounds.tighten_upper(ctx, self.f, self.ceiling);
      }
      PhaseStatus::ClipMiddle => {
        bounds.tighten_lower(ctx, self.b, self.floor);
        bounds.tighten_upper(ctx, self.b, self.ceiling);
        bounds.tighten_lower(ctx, self.f, bounds.lower(ctx, self.b));
        bounds.tighten_upper(ctx, self.f, bounds.upper(ctx, self.b));
      }
      _ => {}
    }
  }
}

impl PiecewiseLinear for ClipConstraint {
  fn kind(&self) -> ConstraintKind {
    ConstraintKind::Clip
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
    if variable == self.b {
      if float_utils::gte(bound, self.ceiling) {
        self.core.set_phase(ctx, PhaseStatus::ClipCeiling);
        self.apply_phase_tightenings(PhaseStatus::ClipCeiling, bounds, ctx);
        return;
      }
      if float_utils::gt(bound, self.floor) {
        // hi[b] can no longer drop to the floor.
        self.core.mark_infeasible(ctx, PhaseStatus::ClipFloor);
      }
      if self.core.is_active(ctx) {
        bounds.tighten_lower(ctx, self.f, self.clamp(bound));
      }
    } else if variable == self.f && float_utils::gt(bound, self.floor) {
      self.core.mark_infeasible(ctx, PhaseStatus::ClipFloor);
      if self.core.is_active(ctx) && float_utils::lte(bound, self.ceiling) {
        // f above the floor means b has reached f.
        bounds.tighten_lower(ctx, self.b, bound);
      }
    }
    self.fix_phase_if_needed(bounds, ctx);
  }

  fn notify_upper_bound(&self, variable: Variable, bound: f64,
                        bounds: &BoundManager, ctx: &mut Context) {
    if variable == self.b {
      if float_utils::lte(bound, self.floor) {
        self.core.set_phase(ctx, PhaseStatus::ClipFloor);
        self.apply_phase_tightenings(PhaseStatus::ClipFloor, bounds, ctx);
        return;
      }
      if float_utils::lt(bound, self.ceiling) {
        self.core.mark_infeasible(ctx, PhaseStatus::ClipCeiling);
      }
      if self.core.is_active(ctx) {
        bounds.tighten_upper(ctx, self.f, self.clamp(bound));
      }
    } else if variable == self.f && float_utils::lt(bound, self.ceiling) {
      self.core.mark_infeasible(ctx, PhaseStatus::ClipCeiling);
      if self.core.is_active(ctx) && float_utils::gte(bound, self.floor) {
        bounds.tighten_upper(ctx, self.b, bound);
      }
    }
    self.fix_phase_if_needed(bounds, ctx);
  }

  fn satisfied(&self, assignment: &[f64]) -> bool {
    float_utils::are_equal(assignment[self.f],
                           self.clamp(assignment[self.b]),
                           float_utils::CONSTRAINT_TOLERANCE)
  }

  fn case_splits(&self, ctx: &Context, _bounds: &BoundManager) -> Vec<CaseSplit> {
    debug_assert!(!self.phase_fixed(ctx));
    self.all_cases()
        .into_iter()
        .map(|phase| self.case_split_for(phase))
        .collect()
  }

  fn all_cases(&self) -> Vec<PhaseStatus> {
    let mut cases = vec![PhaseStatus::ClipMiddle, PhaseStatus::ClipFloor, PhaseStatus::ClipCeiling];
    let direction = self.core.direction();
    if let Some(position) = cases.iter().position(|c| *c == direction) {
      cases.remove(position);
      cases.insert(0, direction);
    }
    cases
  }

  fn case_split_for(&self, phase: PhaseStatus) -> CaseSplit {
    match phase {
      PhaseStatus::ClipFloor   => self.floor_split(),
      PhaseStatus::ClipMiddle  => self.middle_split(),
      PhaseStatus::ClipCeiling => self.ceiling_split(),
      _ => unreachable!("clip has no phase {}", phase),
    }
  }

  fn entailed_tightenings(&self, ctx: &Context, bounds: &BoundManager,
                          out: &mut Vec<Tightening>) {
    let b_lower = bounds.lower(ctx, self.b);
    let b_upper = bounds.upper(ctx, self.b);
    let f_lower = bounds.lower(ctx, self.f);
    let f_upper = bounds.upper(ctx, self.f);

    // The output always stays inside [floor, ceiling] and inside the
    // clamped image of b's interval.
    out.push(Tightening::lower(self.f, self.floor));
    out.push(Tightening::upper(self.f, self.ceiling));
    out.push(Tightening::lower(self.f, self.clamp(b_lower)));
    out.push(Tightening::upper(self.f, self.clamp(b_upper)));

    if float_utils::gte(b_lower, self.floor) && float_utils::lte(b_upper, self.ceiling) {
      // Middle phase: f mirrors b.
      out.push(Tightening::lower(self.b, f_lower));
      out.push(Tightening::upper(self.b, f_upper));
    }
  }

  fn cost_component(&self, out: &mut LinearExpr, phase: PhaseStatus) {
    // Clip does not contribute SoI terms; the middle phase's distance is
    // not linear in f and b.
    let _ = (out, phase);
    unreachable!("clip does not participate in the SoI cost");
  }

  fn supports_soi_cost(&self) -> bool {
    false
  }

  fn phase_in_assignment(&self, assignment: &[f64]) -> PhaseStatus {
    let b_value = assignment[self.b];
    if b_value <= self.floor {
      PhaseStatus::ClipFloor
    } else if b_value >= self.ceiling {
      PhaseStatus::ClipCeiling
    } else {
      PhaseStatus::ClipMiddle
    }
  }

  fn serialize_to_string(&self) -> String {
    // Output format is: clip,f,b,floor,ceiling
    format!("clip,{},{},{:.8},{:.8}", self.f, self.b, self.floor, self.ceiling)
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

  fn update_direction(&self, ctx: &Context, bounds: &BoundManager) {
    let lower = bounds.lower(ctx, self.b);
    let upper = bounds.upper(ctx, self.b);
    let midpoint = if float_utils::is_finite(lower) && float_utils::is_finite(upper) {
      (lower + upper) / 2.0
    } else {
      0.0
    };
    self.core.set_direction(if midpoint <= self.floor {
      PhaseStatus::ClipFloor
    } else if midpoint >= self.ceiling {
      PhaseStatus::ClipCeiling
    } else {
      PhaseStatus::ClipMiddle
    });
  }

  fn clone_boxed(&self) -> Box<dyn PiecewiseLinear> {
    Box::new(self.clone())
  }
}
