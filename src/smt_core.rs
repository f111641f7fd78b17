/*!

  The case-split search controller.

  Keeps the depth-first stack of case splits. Each frame owns the split
  currently applied on its context level, the ordered alternatives not
  yet tried, and any implied valid splits deduced while the frame was
  live. Splits are applied through a caller-supplied closure so the
  controller stays ignorant of the bound manager and equation pool; it
  owns exactly the stack discipline and the context push/pop pairing.

  A branch dies when `pop_split` runs out of alternatives everywhere and
  returns false; that is the unsatisfiability signal.

*/

use crate::case_split::CaseSplit;
use crate::constraints::ConstraintId;
use crate::context::Context;
use crate::log::log_at_level;

#[derive(Clone, Debug)]
struct StackFrame {
  active_split        : CaseSplit,
  alternative_splits  : Vec<CaseSplit>,
  implied_valid_splits: Vec<CaseSplit>,
}

pub struct SmtCore {
  stack: Vec<StackFrame>,
  implied_valid_splits_at_root: Vec<CaseSplit>,

  need_to_split           : bool,
  constraint_for_splitting: Option<ConstraintId>,

  constraint_violation_threshold: u32,
  number_of_random_flips        : u32,

  visited_tree_states: u64,
}

impl SmtCore {
  pub fn new(constraint_violation_threshold: u32) -> Self {
    SmtCore {
      stack: Vec::new(),
      implied_valid_splits_at_root: Vec::new(),
      need_to_split           : false,
      constraint_for_splitting: None,
      constraint_violation_threshold,
      number_of_random_flips  : 0,
      visited_tree_states     : 0,
    }
  }

  /// A random SoI flip is a stall signal; enough of them request a
  /// split. Returns true exactly when the threshold is crossed and the
  /// engine should pick a constraint for splitting.
  pub fn report_random_flip(&mut self) -> bool {
    let crossed = self.number_of_random_flips >= self.constraint_violation_threshold;
    self.number_of_random_flips += 1;
    if crossed {
      self.need_to_split = true;
    }
    crossed
  }

  pub fn need_to_split(&self) -> bool {
    self.need_to_split
  }

  pub fn set_constraint_for_splitting(&mut self, id: ConstraintId) {
    self.constraint_for_splitting = Some(id);
  }

  pub fn constraint_for_splitting(&self) -> Option<ConstraintId> {
    self.constraint_for_splitting
  }

  pub fn reset_reported_violations(&mut self) {
    self.number_of_random_flips = 0;
    self.need_to_split = false;
  }

  /// Requests a split outright, outside the random-flip accounting (the
  /// engine uses this when descent has stalled).
  pub fn request_split(&mut self) {
    self.need_to_split = true;
  }

  /// Drops the whole stack without touching the context; the caller is
  /// responsible for popping the context levels it owns.
  pub fn reset(&mut self) {
    self.stack.clear();
    self.implied_valid_splits_at_root.clear();
    self.need_to_split = false;
    self.constraint_for_splitting = None;
    self.number_of_random_flips = 0;
  }

  pub fn stack_depth(&self) -> usize {
    self.stack.len()
  }

  pub fn visited_tree_states(&self) -> u64 {
    self.visited_tree_states
  }

  /// Pushes the context, applies the first of `splits` and stacks the
  /// rest as alternatives. The engine must already have deactivated the
  /// split constraint and obtained `splits` from it.
  pub fn perform_split<F>(&mut self, splits: Vec<CaseSplit>, ctx: &mut Context, mut apply: F)
  where
    F: FnMut(&CaseSplit, &mut Context),
  {
    debug_assert!(self.need_to_split);
    debug_assert!(!splits.is_empty());

    self.visited_tree_states += 1;
    self.reset_reported_violations();
    self.constraint_for_splitting = None;

    let mut splits = splits.into_iter();
    let active = splits.next().unwrap();

    ctx.push();
    log_at_level(2, &format!("(pwlsat.smt-core :split :depth {})", ctx.depth()));
    apply(&active, ctx);

    self.stack.push(StackFrame {
      active_split        : active,
      alternative_splits  : splits.collect(),
      implied_valid_splits: Vec::new(),
    });
  }

  /// Abandons the current branch: frames with no alternatives left are
  /// discarded, then the next alternative of the surviving frame is
  /// applied on a fresh context level. Returns false when the tree is
  /// exhausted.
  pub fn pop_split<F>(&mut self, ctx: &mut Context, mut apply: F) -> bool
  where
    F: FnMut(&CaseSplit, &mut Context),
  {
    if self.stack.is_empty() {
      debug_assert!(ctx.depth() == 0);
      return false;
    }

    self.visited_tree_states += 1;

    while self.stack.last().map_or(false, |frame| frame.alternative_splits.is_empty()) {
      self.stack.pop();
      ctx.pop();
      log_at_level(2, &format!("(pwlsat.smt-core :backtrack :depth {})", ctx.depth()));
      if self.stack.is_empty() {
        return false;
      }
    }

    // Undo the failed active split, then try the next alternative on a
    // fresh level.
    ctx.pop();
    let frame = self.stack.last_mut().unwrap();
    // Valid splits deduced under the failed split no longer hold.
    frame.implied_valid_splits.clear();

    let next = frame.alternative_splits.remove(0);
    ctx.push();
    apply(&next, ctx);
    frame.active_split = next;

    log_at_level(2, &format!("(pwlsat.smt-core :alternative :depth {})", ctx.depth()));
    true
  }

  /// Appends to the live frame, or to the root list below any frame.
  pub fn record_implied_valid_split(&mut self, split: CaseSplit) {
    match self.stack.last_mut() {
      Some(frame) => frame.implied_valid_splits.push(split),
      None        => self.implied_valid_splits_at_root.push(split),
    }
  }

  /// The ordered concatenation of root-implied splits, then each
  /// frame's active and implied splits.
  pub fn all_splits_so_far(&self) -> Vec<CaseSplit> {
    let mut result = self.implied_valid_splits_at_root.clone();
    for frame in &self.stack {
      result.push(frame.active_split.clone());
      result.extend(frame.implied_valid_splits.iter().cloned());
    }
    result
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bounds::BoundManager;
  use crate::case_split::Tightening;

  fn split_fixing(variable: usize, value: f64) -> CaseSplit {
    let mut split = CaseSplit::new();
    split.store_bound_tightening(Tightening::lower(variable, value));
    split.store_bound_tightening(Tightening::upper(variable, value));
    split
  }

  fn fixture(n: usize) -> (Context, BoundManager) {
    let mut ctx = Context::new();
    let mut bounds = BoundManager::new(&mut ctx);
    bounds.initialize(&mut ctx, n);
    (ctx, bounds)
  }

  #[test]
  fn random_flip_threshold_requests_a_split() {
    let mut smt = SmtCore::new(3);
    assert!(!smt.report_random_flip());
    assert!(!smt.report_random_flip());
    assert!(!smt.report_random_flip());
    assert!(smt.report_random_flip());
    assert!(smt.need_to_split());

    smt.reset_reported_violations();
    assert!(!smt.need_to_split());
  }

  #[test]
  fn perform_and_pop_walk_every_alternative() {
    let (mut ctx, bounds) = fixture(1);
    let mut smt = SmtCore::new(0);
    let mut visited = Vec::new();

    smt.report_random_flip();
    assert!(smt.need_to_split());

    smt.perform_split(vec![split_fixing(0, 1.0), split_fixing(0, 2.0), split_fixing(0, 3.0)],
                      &mut ctx,
                      |split, ctx| {
                        for t in split.bound_tightenings() {
                          bounds.apply(ctx, t);
                        }
                      });
    visited.push(bounds.lower(&ctx, 0));

    while smt.pop_split(&mut ctx, |split, ctx| {
      for t in split.bound_tightenings() {
        bounds.apply(ctx, t);
      }
    }) {
      visited.push(bounds.lower(&ctx, 0));
    }

    assert_eq!(visited, vec![1.0, 2.0, 3.0]);
    assert_eq!(ctx.depth(), 0);
    // Bounds are fully restored after exhaustion.
    assert_eq!(bounds.lower(&ctx, 0), f64::NEG_INFINITY);
    assert_eq!(smt.visited_tree_states(), 4);
  }

  #[test]
  fn nested_splits_enumerate_the_product() {
    let (mut ctx, bounds) = fixture(2);
    let mut smt = SmtCore::new(0);
    let apply = |split: &CaseSplit, ctx: &mut Context| {
      for t in split.bound_tightenings() {
        bounds.apply(ctx, t);
      }
    };

    // Split on x0, then on x1 below it.
    smt.report_random_flip();
    smt.perform_split(vec![split_fixing(0, 0.0), split_fixing(0, 1.0)], &mut ctx, apply);
    smt.report_random_flip();
    smt.perform_split(vec![split_fixing(1, 0.0), split_fixing(1, 1.0)], &mut ctx, apply);

    let mut leaves = vec![(bounds.lower(&ctx, 0), bounds.lower(&ctx, 1))];
    while smt.pop_split(&mut ctx, apply) {
      leaves.push((bounds.lower(&ctx, 0), bounds.lower(&ctx, 1)));
    }

    // The second x0 branch has no x1 frame below it; the enumeration
    // still visits both x1 cases under the first branch and the bare
    // second branch.
    assert_eq!(leaves, vec![(0.0, 0.0), (0.0, 1.0), (1.0, f64::NEG_INFINITY)]);
  }

  #[test]
  fn implied_valid_splits_follow_their_frame() {
    let (mut ctx, bounds) = fixture(2);
    let mut smt = SmtCore::new(0);
    let apply = |split: &CaseSplit, ctx: &mut Context| {
      for t in split.bound_tightenings() {
        bounds.apply(ctx, t);
      }
    };

    smt.record_implied_valid_split(split_fixing(1, 9.0));
    assert_eq!(smt.all_splits_so_far().len(), 1);

    smt.report_random_flip();
    smt.perform_split(vec![split_fixing(0, 0.0), split_fixing(0, 1.0)], &mut ctx, apply);
    smt.record_implied_valid_split(split_fixing(1, 5.0));
    assert_eq!(smt.all_splits_so_far().len(), 3);

    // Backtracking to the alternative clears the implied splits that
    // were deduced under the failed branch.
    assert!(smt.pop_split(&mut ctx, apply));
    assert_eq!(smt.all_splits_so_far().len(), 2);
  }
}
