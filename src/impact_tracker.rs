/*!

  Pseudo-impact branching scores.

  An ordered set of `(score, constraint)` pairs, highest score first,
  ties broken by constraint id. Scores are exponential moving averages
  of the observed impact deltas, so recent branching history dominates.
  `top_unfixed` yields the best constraint still worth splitting on.

*/

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::constraints::{ConstraintId, PiecewiseLinear};
use crate::context::Context;
use crate::data_structures::ExponentialMovingAverage;

#[derive(Copy, Clone, Debug)]
struct ScoreEntry {
  score: f64,
  id   : ConstraintId,
}

impl Ord for ScoreEntry {
  fn cmp(&self, other: &Self) -> Ordering {
    // Descending score, ascending id.
    other.score
         .partial_cmp(&self.score)
         .unwrap_or(Ordering::Equal)
         .then(self.id.cmp(&other.id))
  }
}

impl PartialOrd for ScoreEntry {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl PartialEq for ScoreEntry {
  fn eq(&self, other: &Self) -> bool {
    self.cmp(other) == Ordering::Equal
  }
}

impl Eq for ScoreEntry {}

pub struct PseudoImpactTracker {
  scores  : BTreeSet<ScoreEntry>,
  averages: Vec<ExponentialMovingAverage>,
}

impl PseudoImpactTracker {
  pub fn new() -> Self {
    PseudoImpactTracker {
      scores  : BTreeSet::new(),
      averages: Vec::new(),
    }
  }

  pub fn initialize(&mut self, constraint_count: usize, alpha: f64) {
    self.scores.clear();
    self.averages.clear();
    for id in 0..constraint_count {
      self.averages.push(ExponentialMovingAverage::new(alpha));
      self.scores.insert(ScoreEntry { score: 0.0, id });
    }
  }

  pub fn score(&self, id: ConstraintId) -> f64 {
    self.averages[id].mean()
  }

  /// Blends `delta` into the constraint's running impact.
  pub fn update(&mut self, id: ConstraintId, delta: f64) {
    let old = ScoreEntry { score: self.averages[id].mean(), id };
    self.scores.remove(&old);
    self.averages[id].update(delta);
    self.scores.insert(ScoreEntry { score: self.averages[id].mean(), id });
  }

  /// The highest-scored constraint that is still active and unfixed.
  pub fn top_unfixed(&self, constraints: &[Box<dyn PiecewiseLinear>],
                     ctx: &Context) -> Option<ConstraintId> {
    for entry in &self.scores {
      let constraint = &constraints[entry.id];
      if constraint.core().is_active(ctx) && !constraint.phase_fixed(ctx) {
        return Some(entry.id);
      }
    }
    None
  }
}

impl Default for PseudoImpactTracker {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bounds::BoundManager;
  use crate::constraints::{PhaseStatus, ReluConstraint};

  #[test]
  fn updates_blend_with_the_configured_alpha() {
    let mut tracker = PseudoImpactTracker::new();
    tracker.initialize(2, 0.5);

    tracker.update(0, 4.0);
    assert_eq!(tracker.score(0), 2.0);
    tracker.update(0, 4.0);
    assert_eq!(tracker.score(0), 3.0);
    assert_eq!(tracker.score(1), 0.0);
  }

  #[test]
  fn top_unfixed_skips_fixed_and_inactive_constraints() {
    let mut ctx = Context::new();
    let mut bounds = BoundManager::new(&mut ctx);
    bounds.initialize(&mut ctx, 4);

    let mut constraints: Vec<Box<dyn PiecewiseLinear>> = vec![
      Box::new(ReluConstraint::new(0, 1)),
      Box::new(ReluConstraint::new(2, 3)),
    ];
    for constraint in constraints.iter_mut() {
      constraint.core_mut().register(&mut ctx);
    }

    let mut tracker = PseudoImpactTracker::new();
    tracker.initialize(2, 0.5);
    tracker.update(0, 10.0);

    assert_eq!(tracker.top_unfixed(&constraints, &ctx), Some(0));

    // Fixing the leader's phase promotes the runner-up.
    constraints[0].core().set_phase(&mut ctx, PhaseStatus::ReluActive);
    assert_eq!(tracker.top_unfixed(&constraints, &ctx), Some(1));

    // Deactivating the runner-up leaves nothing.
    constraints[1].core().set_active(&mut ctx, false);
    assert_eq!(tracker.top_unfixed(&constraints, &ctx), None);
  }

  #[test]
  fn ties_break_toward_the_smaller_id() {
    let mut tracker = PseudoImpactTracker::new();
    tracker.initialize(3, 0.5);
    tracker.update(2, 2.0);
    tracker.update(1, 2.0);

    let first = tracker.scores.iter().next().unwrap().id;
    assert_eq!(first, 1);
  }
}
