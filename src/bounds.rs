/*!

  The bound manager: single source of truth for per-variable lower/upper
  bounds.

  All bound slots are context-dependent cells, so case splits can tighten
  bounds freely and a backtrack restores them wholesale. A tightening that
  is not strictly tighter than the current bound is a no-op (but counted);
  a tightening that crosses the opposite bound records the first
  inconsistency and clears the consistent flag, to be observed by the
  engine at the next loop iteration. Crossing bounds is deliberately not
  an error path.

*/

use std::cell::Cell;

use crate::case_split::{BoundKind, Tightening};
use crate::context::{CdBool, CdF64, CdUsize, Context};
use crate::float_utils;
use crate::Variable;

pub struct BoundManager {
  lower          : Vec<CdF64>,
  upper          : Vec<CdF64>,
  tightened_lower: Vec<CdBool>,
  tightened_upper: Vec<CdBool>,

  consistent         : CdBool,
  inconsistent_var   : CdUsize,
  inconsistent_value : CdF64,
  inconsistent_is_low: CdBool,

  // Plain counters; the engine exports them into statistics.
  tightenings_applied: Cell<u64>,
  tightenings_rejected: Cell<u64>,
}

impl BoundManager {
  pub fn new(ctx: &mut Context) -> Self {
    BoundManager {
      lower          : Vec::new(),
      upper          : Vec::new(),
      tightened_lower: Vec::new(),
      tightened_upper: Vec::new(),

      consistent         : ctx.new_bool(true),
      inconsistent_var   : ctx.new_usize(0),
      inconsistent_value : ctx.new_f64(0.0),
      inconsistent_is_low: ctx.new_bool(true),

      tightenings_applied : Cell::new(0),
      tightenings_rejected: Cell::new(0),
    }
  }

  pub fn initialize(&mut self, ctx: &mut Context, number_of_variables: usize) {
    debug_assert!(self.lower.is_empty());
    for _ in 0..number_of_variables {
      self.register_new_variable(ctx);
    }
  }

  pub fn register_new_variable(&mut self, ctx: &mut Context) -> Variable {
    let new_var = self.lower.len();
    self.lower.push(ctx.new_f64(float_utils::negative_infinity()));
    self.upper.push(ctx.new_f64(float_utils::infinity()));
    self.tightened_lower.push(ctx.new_bool(false));
    self.tightened_upper.push(ctx.new_bool(false));
    new_var
  }

  pub fn number_of_variables(&self) -> usize {
    self.lower.len()
  }

  pub fn lower(&self, ctx: &Context, variable: Variable) -> f64 {
    ctx.get_f64(self.lower[variable])
  }

  pub fn upper(&self, ctx: &Context, variable: Variable) -> f64 {
    ctx.get_f64(self.upper[variable])
  }

  /// Applies `value` as a new lower bound for `variable` if strictly
  /// tighter. Returns whether a change occurred.
  pub fn tighten_lower(&self, ctx: &mut Context, variable: Variable, value: f64) -> bool {
    if value > self.lower(ctx, variable) {
      ctx.set_f64(self.lower[variable], value);
      ctx.set_bool(self.tightened_lower[variable], true);
      self.tightenings_applied.set(self.tightenings_applied.get() + 1);
      if !self.consistent_variable(ctx, variable) {
        self.record_inconsistency(ctx, variable, value, BoundKind::Lower);
      }
      true
    } else {
      self.tightenings_rejected.set(self.tightenings_rejected.get() + 1);
      false
    }
  }

  /// Symmetric to `tighten_lower`.
  pub fn tighten_upper(&self, ctx: &mut Context, variable: Variable, value: f64) -> bool {
    if value < self.upper(ctx, variable) {
      ctx.set_f64(self.upper[variable], value);
      ctx.set_bool(self.tightened_upper[variable], true);
      self.tightenings_applied.set(self.tightenings_applied.get() + 1);
      if !self.consistent_variable(ctx, variable) {
        self.record_inconsistency(ctx, variable, value, BoundKind::Upper);
      }
      true
    } else {
      self.tightenings_rejected.set(self.tightenings_rejected.get() + 1);
      false
    }
  }

  pub fn apply(&self, ctx: &mut Context, tightening: &Tightening) -> bool {
    match tightening.kind {
      BoundKind::Lower => self.tighten_lower(ctx, tightening.variable, tightening.value),
      BoundKind::Upper => self.tighten_upper(ctx, tightening.variable, tightening.value),
    }
  }

  /// Moves the pending tightening records out for consumers.
  pub fn drain_tightenings(&self, ctx: &mut Context) -> Vec<Tightening> {
    let mut tightenings = Vec::new();
    for variable in 0..self.lower.len() {
      if ctx.get_bool(self.tightened_lower[variable]) {
        tightenings.push(Tightening::lower(variable, self.lower(ctx, variable)));
        ctx.set_bool(self.tightened_lower[variable], false);
      }
      if ctx.get_bool(self.tightened_upper[variable]) {
        tightenings.push(Tightening::upper(variable, self.upper(ctx, variable)));
        ctx.set_bool(self.tightened_upper[variable], false);
      }
    }
    tightenings
  }

  pub fn consistent(&self, ctx: &Context) -> bool {
    ctx.get_bool(self.consistent)
  }

  pub fn consistent_variable(&self, ctx: &Context, variable: Variable) -> bool {
    float_utils::gte(self.upper(ctx, variable), self.lower(ctx, variable))
  }

  /// The first tightening that produced `lo > hi` on this branch, if any.
  pub fn first_inconsistency(&self, ctx: &Context) -> Option<Tightening> {
    if self.consistent(ctx) {
      return None;
    }
    let kind = if ctx.get_bool(self.inconsistent_is_low) {
      BoundKind::Lower
    } else {
      BoundKind::Upper
    };
    Some(Tightening {
      variable: ctx.get_usize(self.inconsistent_var),
      value: ctx.get_f64(self.inconsistent_value),
      kind,
    })
  }

  pub fn tightenings_applied(&self) -> u64 {
    self.tightenings_applied.get()
  }

  pub fn tightenings_rejected(&self) -> u64 {
    self.tightenings_rejected.get()
  }

  fn record_inconsistency(&self, ctx: &mut Context, variable: Variable, value: f64, kind: BoundKind) {
    if self.consistent(ctx) {
      ctx.set_bool(self.consistent, false);
      ctx.set_usize(self.inconsistent_var, variable);
      ctx.set_f64(self.inconsistent_value, value);
      ctx.set_bool(self.inconsistent_is_low, kind == BoundKind::Lower);
    }
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

  #[test]
  fn fresh_variables_are_unbounded() {
    let (ctx, bounds) = fixture(2);
    assert_eq!(bounds.lower(&ctx, 0), f64::NEG_INFINITY);
    assert_eq!(bounds.upper(&ctx, 1), f64::INFINITY);
    assert!(bounds.consistent(&ctx));
  }

  #[test]
  fn tightening_is_monotone_and_counted() {
    let (mut ctx, bounds) = fixture(1);
    assert!(bounds.tighten_lower(&mut ctx, 0, 1.0));
    assert!(!bounds.tighten_lower(&mut ctx, 0, 0.5));
    assert!(!bounds.tighten_lower(&mut ctx, 0, 1.0));
    assert_eq!(bounds.lower(&ctx, 0), 1.0);
    assert_eq!(bounds.tightenings_applied(), 1);
    assert_eq!(bounds.tightenings_rejected(), 2);
  }

  #[test]
  fn repeated_equal_tightening_does_not_grow_the_trail() {
    let (mut ctx, bounds) = fixture(1);
    ctx.push();
    assert!(bounds.tighten_lower(&mut ctx, 0, 2.0));
    let len = ctx.trail_len();
    assert!(!bounds.tighten_lower(&mut ctx, 0, 2.0));
    assert_eq!(ctx.trail_len(), len);
    ctx.pop();
  }

  #[test]
  fn crossing_bounds_records_the_first_inconsistency() {
    let (mut ctx, bounds) = fixture(1);
    bounds.tighten_upper(&mut ctx, 0, 1.0);
    bounds.tighten_lower(&mut ctx, 0, 3.0);
    assert!(!bounds.consistent(&ctx));
    let first = bounds.first_inconsistency(&ctx).unwrap();
    assert_eq!(first.variable, 0);
    assert_eq!(first.value, 3.0);
    assert_eq!(first.kind, BoundKind::Lower);

    // A later crossing does not overwrite the record.
    bounds.tighten_lower(&mut ctx, 0, 5.0);
    assert_eq!(bounds.first_inconsistency(&ctx).unwrap().value, 3.0);
  }

  #[test]
  fn backtracking_restores_bounds_flags_and_consistency() {
    let (mut ctx, bounds) = fixture(1);
    bounds.tighten_upper(&mut ctx, 0, 2.0);
    let _ = bounds.drain_tightenings(&mut ctx);

    ctx.push();
    bounds.tighten_lower(&mut ctx, 0, 5.0);
    assert!(!bounds.consistent(&ctx));
    ctx.pop();

    assert!(bounds.consistent(&ctx));
    assert_eq!(bounds.lower(&ctx, 0), f64::NEG_INFINITY);
    assert_eq!(bounds.upper(&ctx, 0), 2.0);
    assert!(bounds.drain_tightenings(&mut ctx).is_empty());
  }

  #[test]
  fn drain_returns_and_clears_pending_records() {
    let (mut ctx, bounds) = fixture(2);
    bounds.tighten_lower(&mut ctx, 0, 1.0);
    bounds.tighten_upper(&mut ctx, 1, 4.0);

    let pending = bounds.drain_tightenings(&mut ctx);
    assert_eq!(pending.len(), 2);
    assert!(bounds.drain_tightenings(&mut ctx).is_empty());
  }
}
