/*!

  The sum-of-infeasibilities manager.

  Maintains the *phase pattern*: a choice of phase for every unfixed,
  cost-supporting piecewise-linear constraint. Concretizing the pattern
  (summing each constraint's cost component for its chosen phase) yields
  a linear objective whose minimum is zero exactly when some assignment
  satisfies every constraint at those phases. The search walks the space
  of patterns: propose a phase change, evaluate the proposed objective,
  accept by the Metropolis-Hastings criterion, repeat.

*/

use std::collections::BTreeMap;

use crate::config::{Config, SoiInitStrategy, SoiSearchStrategy};
use crate::constraints::{ConstraintId, PhaseStatus, PiecewiseLinear};
use crate::context::Context;
use crate::data_structures::RandomGenerator;
use crate::equation::LinearExpr;
use crate::float_utils;
use crate::log::log_at_level;

type Constraints = [Box<dyn PiecewiseLinear>];

pub struct SoiManager {
  init_strategy  : SoiInitStrategy,
  search_strategy: SoiSearchStrategy,
  /// The Metropolis-Hastings beta: larger values make uphill moves
  /// rarer.
  beta: f64,

  pattern      : BTreeMap<ConstraintId, PhaseStatus>,
  proposal     : BTreeMap<ConstraintId, PhaseStatus>,
  /// Pattern keys in insertion order, for uniform random access.
  pattern_order: Vec<ConstraintId>,

  current_assignment: Vec<f64>,
  rand: RandomGenerator,
}

impl SoiManager {
  pub fn new(config: &Config) -> Self {
    SoiManager {
      init_strategy  : config.soi_init_strategy,
      search_strategy: config.soi_search_strategy,
      beta           : config.probability_density_parameter,
      pattern        : BTreeMap::new(),
      proposal       : BTreeMap::new(),
      pattern_order  : Vec::new(),
      current_assignment: Vec::new(),
      rand           : RandomGenerator::with_seed(config.seed.wrapping_add(1)),
    }
  }

  /// Refreshes the local copy of the assignment the cost terms are
  /// evaluated against.
  pub fn set_current_assignment(&mut self, assignment: &[f64]) {
    self.current_assignment.clear();
    self.current_assignment.extend_from_slice(assignment);
  }

  pub fn current_assignment(&self) -> &[f64] {
    &self.current_assignment
  }

  /// Chooses the first phase pattern. `oracle_assignment` is the
  /// forward-propagated input concretization when a network oracle is
  /// available; without one the input-assignment strategy falls back to
  /// the current assignment.
  pub fn initialize_phase_pattern(&mut self, constraints: &Constraints, ctx: &Context,
                                  oracle_assignment: Option<&[f64]>) {
    self.pattern.clear();
    self.proposal.clear();
    self.pattern_order.clear();

    for (id, constraint) in constraints.iter().enumerate() {
      if !constraint.core().is_active(ctx)
         || constraint.phase_fixed(ctx)
         || !constraint.supports_soi_cost() {
        continue;
      }

      let phase = match (self.init_strategy, oracle_assignment) {
        (SoiInitStrategy::InputAssignment, Some(assignment)) =>
          constraint.phase_in_assignment(assignment),
        (SoiInitStrategy::Random, _) => {
          let cases = constraint.all_cases();
          cases[self.rand.at_most(cases.len() as u32) as usize]
        }
        _ => constraint.phase_in_assignment(&self.current_assignment),
      };

      self.pattern.insert(id, phase);
      self.pattern_order.push(id);
    }
  }

  pub fn pattern_len(&self) -> usize {
    self.pattern_order.len()
  }

  pub fn phase_of(&self, id: ConstraintId) -> Option<PhaseStatus> {
    self.pattern.get(&id).copied()
  }

  /// Concretizes the current pattern into a linear objective.
  pub fn soi_expr(&self, constraints: &Constraints) -> LinearExpr {
    let mut cost = LinearExpr::new();
    for (id, phase) in &self.pattern {
      constraints[*id].cost_component(&mut cost, *phase);
    }
    cost
  }

  /// Concretizes the pattern with the pending proposal overlaid.
  pub fn proposed_soi_expr(&self, constraints: &Constraints) -> LinearExpr {
    debug_assert!(self.proposal.keys().all(|id| self.pattern.contains_key(id)));

    let mut cost = LinearExpr::new();
    for (id, phase) in &self.proposal {
      constraints[*id].cost_component(&mut cost, *phase);
    }
    for (id, phase) in &self.pattern {
      if !self.proposal.contains_key(id) {
        constraints[*id].cost_component(&mut cost, *phase);
      }
    }
    cost
  }

  pub fn has_proposal(&self) -> bool {
    !self.proposal.is_empty()
  }

  pub fn proposal_ids(&self) -> Vec<ConstraintId> {
    self.proposal.keys().copied().collect()
  }

  /// Proposes a pattern change under the configured search strategy.
  /// Returns whether descent is guaranteed (true only for a Walksat
  /// pick with positive reduced cost).
  pub fn propose_update(&mut self, constraints: &Constraints) -> bool {
    self.proposal.clear();
    match self.search_strategy {
      SoiSearchStrategy::Mcmc => {
        self.propose_randomly(constraints);
        false
      }
      SoiSearchStrategy::Walksat => self.propose_walksat(constraints),
    }
  }

  /// Picks a pattern constraint uniformly and one of its alternative
  /// phases uniformly.
  pub fn propose_randomly(&mut self, constraints: &Constraints) {
    debug_assert!(!self.pattern_order.is_empty());

    let index = self.rand.at_most(self.pattern_order.len() as u32) as usize;
    let id = self.pattern_order[index];
    let current = self.pattern[&id];

    let mut alternatives = constraints[id].all_cases();
    alternatives.retain(|phase| *phase != current);
    debug_assert!(!alternatives.is_empty());

    let choice = if alternatives.len() == 1 {
      alternatives[0]
    } else {
      alternatives[self.rand.at_most(alternatives.len() as u32) as usize]
    };
    self.proposal.insert(id, choice);
  }

  /// Flips the cost term with the largest reduced cost; ties break
  /// toward the smaller constraint id. Falls back to a random proposal
  /// when no flip decreases the cost.
  fn propose_walksat(&mut self, constraints: &Constraints) -> bool {
    let mut best: Option<(ConstraintId, PhaseStatus, f64)> = None;

    for id in &self.pattern_order {
      if let Some((phase, reduced)) = self.reduced_cost(constraints, *id) {
        if reduced > 0.0 && best.map_or(true, |(_, _, r)| reduced > r) {
          best = Some((*id, phase, reduced));
        }
      }
    }

    match best {
      Some((id, phase, _)) => {
        self.proposal.insert(id, phase);
        true
      }
      None => {
        log_at_level(2, "(pwlsat.soi :walksat-local-optimum, random fallback)");
        self.propose_randomly(constraints);
        false
      }
    }
  }

  /// The largest decrease in this constraint's cost term achievable by
  /// switching phase, evaluated at the current assignment, with the
  /// phase realizing it.
  pub fn reduced_cost(&self, constraints: &Constraints, id: ConstraintId)
      -> Option<(PhaseStatus, f64)> {
    let current = *self.pattern.get(&id)?;

    let mut current_component = LinearExpr::new();
    constraints[id].cost_component(&mut current_component, current);
    let current_cost = current_component.evaluate(&self.current_assignment);

    let mut best: Option<(PhaseStatus, f64)> = None;
    for phase in constraints[id].all_cases() {
      if phase == current {
        continue;
      }
      let mut other_component = LinearExpr::new();
      constraints[id].cost_component(&mut other_component, phase);
      let reduction = current_cost - other_component.evaluate(&self.current_assignment);
      if best.map_or(true, |(_, r)| reduction > r) {
        best = Some((phase, reduction));
      }
    }
    best
  }

  /// Metropolis-Hastings: always accept a decrease, otherwise accept
  /// with probability exp(-beta * increase).
  pub fn decide_to_accept(&mut self, current_cost: f64, proposed_cost: f64) -> bool {
    if proposed_cost < current_cost {
      true
    } else {
      let probability = (-self.beta * (proposed_cost - current_cost)).exp();
      self.rand.next_f64() < probability
    }
  }

  /// Folds the pending proposal into the pattern.
  pub fn commit_proposal(&mut self) {
    for (id, phase) in std::mem::take(&mut self.proposal) {
      self.pattern.insert(id, phase);
    }
  }

  pub fn discard_proposal(&mut self) {
    self.proposal.clear();
  }

  /// For every pattern constraint satisfied by the current assignment,
  /// adopt the phase that assignment realizes; the overall cost can
  /// only go down.
  pub fn refresh_for_satisfied_constraints(&mut self, constraints: &Constraints) {
    for (id, phase) in self.pattern.iter_mut() {
      if constraints[*id].satisfied(&self.current_assignment) {
        *phase = constraints[*id].phase_in_assignment(&self.current_assignment);
      }
    }
  }

  /// Called when a constraint's phase became fixed during search; its
  /// cost term leaves the pattern.
  pub fn remove(&mut self, id: ConstraintId) {
    if self.pattern.remove(&id).is_some() {
      self.pattern_order.retain(|other| *other != id);
    }
  }

  /// True when the pattern cost is exactly zero at the current
  /// assignment, which certifies that every pattern constraint is
  /// satisfied.
  pub fn at_zero(&self, constraints: &Constraints) -> bool {
    float_utils::is_zero(self.soi_expr(constraints).evaluate(&self.current_assignment))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bounds::BoundManager;
  use crate::constraints::ReluConstraint;

  fn two_relus() -> (Context, BoundManager, Vec<Box<dyn PiecewiseLinear>>) {
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
    (ctx, bounds, constraints)
  }

  fn manager(strategy: SoiSearchStrategy) -> SoiManager {
    let mut config = Config::default();
    config.soi_search_strategy = strategy;
    config.soi_init_strategy = SoiInitStrategy::CurrentAssignment;
    SoiManager::new(&config)
  }

  #[test]
  fn initialization_classifies_by_the_current_assignment() {
    let (ctx, _bounds, constraints) = two_relus();
    let mut soi = manager(SoiSearchStrategy::Mcmc);

    soi.set_current_assignment(&[1.0, 1.0, -1.0, 0.0]);
    soi.initialize_phase_pattern(&constraints, &ctx, None);

    assert_eq!(soi.pattern_len(), 2);
    assert_eq!(soi.phase_of(0), Some(PhaseStatus::ReluActive));
    assert_eq!(soi.phase_of(1), Some(PhaseStatus::ReluInactive));
  }

  #[test]
  fn phase_fixed_constraints_stay_out_of_the_pattern() {
    let (mut ctx, bounds, constraints) = two_relus();
    // Fix the second relu inactive.
    bounds.tighten_upper(&mut ctx, 2, -1.0);
    constraints[1].notify_upper_bound(2, -1.0, &bounds, &mut ctx);

    let mut soi = manager(SoiSearchStrategy::Mcmc);
    soi.set_current_assignment(&[1.0, 1.0, -1.0, 0.0]);
    soi.initialize_phase_pattern(&constraints, &ctx, None);

    assert_eq!(soi.pattern_len(), 1);
    assert_eq!(soi.phase_of(1), None);
  }

  #[test]
  fn soi_expr_sums_cost_components() {
    let (ctx, _bounds, constraints) = two_relus();
    let mut soi = manager(SoiSearchStrategy::Mcmc);
    soi.set_current_assignment(&[1.0, 2.0, -1.0, 0.5]);
    soi.initialize_phase_pattern(&constraints, &ctx, None);

    // Pattern: relu0 active (cost x1 - x0), relu1 inactive (cost x3).
    let expr = soi.soi_expr(&constraints);
    assert_eq!(expr.evaluate(&[1.0, 2.0, -1.0, 0.5]), 1.5);
  }

  #[test]
  fn walksat_picks_the_largest_reduction_and_guarantees_descent() {
    let (ctx, _bounds, constraints) = two_relus();
    let mut soi = manager(SoiSearchStrategy::Walksat);

    // relu0 active costs x1 - x0 = 3; flipping to inactive costs x1 = 4,
    // a reduction of -1. relu1 inactive costs x3 = 2; flipping to active
    // costs x3 - x2 = 7, a reduction of -5. No positive reduction exists,
    // so the proposal falls back to random.
    soi.set_current_assignment(&[1.0, 4.0, -5.0, 2.0]);
    soi.initialize_phase_pattern(&constraints, &ctx, None);
    assert!(!soi.propose_update(&constraints));

    // After the assignment moves, relu0's active term costs
    // x1 - x0 = 5 while inactive would cost x1 = 1: a reduction of 4.
    // Descent is guaranteed.
    soi.set_current_assignment(&[-4.0, 1.0, -5.0, 2.0]);
    assert!(soi.propose_update(&constraints));
    let proposed = soi.proposed_soi_expr(&constraints);
    // Proposed pattern: relu0 inactive (x1), relu1 inactive (x3).
    assert_eq!(proposed.evaluate(&[-4.0, 1.0, -5.0, 2.0]), 3.0);
  }

  #[test]
  fn metropolis_always_accepts_descent() {
    let mut soi = manager(SoiSearchStrategy::Mcmc);
    assert!(soi.decide_to_accept(5.0, 1.0));
  }

  #[test]
  fn huge_uphill_moves_are_effectively_rejected() {
    let mut soi = manager(SoiSearchStrategy::Mcmc);
    let mut accepted = 0;
    for _ in 0..100 {
      if soi.decide_to_accept(0.0, 1000.0) {
        accepted += 1;
      }
    }
    assert_eq!(accepted, 0);
  }

  #[test]
  fn refresh_adopts_phases_of_satisfied_constraints() {
    let (ctx, _bounds, constraints) = two_relus();
    let mut soi = manager(SoiSearchStrategy::Mcmc);

    // relu0 starts inactive in the pattern, but the assignment satisfies
    // it in the active phase.
    soi.set_current_assignment(&[-1.0, 0.0, -1.0, 0.0]);
    soi.initialize_phase_pattern(&constraints, &ctx, None);
    assert_eq!(soi.phase_of(0), Some(PhaseStatus::ReluInactive));

    soi.set_current_assignment(&[2.0, 2.0, -1.0, 0.0]);
    soi.refresh_for_satisfied_constraints(&constraints);
    assert_eq!(soi.phase_of(0), Some(PhaseStatus::ReluActive));
  }

  #[test]
  fn a_zero_cost_pattern_certifies_satisfaction() {
    let (ctx, _bounds, constraints) = two_relus();
    let mut soi = manager(SoiSearchStrategy::Mcmc);

    // Both relus satisfied: active at (2, 2), inactive at (-1, 0).
    soi.set_current_assignment(&[2.0, 2.0, -1.0, 0.0]);
    soi.initialize_phase_pattern(&constraints, &ctx, None);

    assert!(soi.at_zero(&constraints));
    assert!(constraints.iter().all(|c| c.satisfied(soi.current_assignment())));

    // Perturbing the assignment off the relation moves the cost off
    // zero.
    soi.set_current_assignment(&[2.0, 3.0, -1.0, 0.0]);
    assert!(!soi.at_zero(&constraints));
  }

  #[test]
  fn removal_shrinks_the_pattern() {
    let (ctx, _bounds, constraints) = two_relus();
    let mut soi = manager(SoiSearchStrategy::Mcmc);
    soi.set_current_assignment(&[0.0; 4]);
    soi.initialize_phase_pattern(&constraints, &ctx, None);

    soi.remove(0);
    assert_eq!(soi.pattern_len(), 1);
    assert_eq!(soi.phase_of(0), None);
  }
}
