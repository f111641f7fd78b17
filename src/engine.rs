/*!

  The engine: preprocessing, the main solve loop, and the glue between
  the bound manager, the piecewise-linear constraints, the LP backend,
  the SoI local search and the case-split controller.

  Each outer iteration: check budgets, backtrack if the bound manager is
  inconsistent, propagate tightenings to a fixpoint, apply implied case
  splits, obtain an assignment from the LP relaxation, and either report
  Sat, take one SoI step, or branch when progress has stalled. All
  reversible state lives in the context, so a backtrack is one `pop`.

*/

use std::fmt::Write as FmtWrite;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bounds::BoundManager;
use crate::case_split::{BoundKind, CaseSplit, Tightening};
use crate::config::{BranchingHeuristic, Config};
use crate::constraints::{ConstraintId, ConstraintKind, PiecewiseLinear};
use crate::context::{CdUsize, Context};
use crate::data_structures::Statistics;
use crate::equation::{Equation, LinearExpr};
use crate::float_utils;
use crate::impact_tracker::PseudoImpactTracker;
use crate::heuristic_cost::HeuristicCost;
use crate::log::log_at_level;
use crate::lp::{LpProblem, LpSolver, LpStatus};
use crate::oracle::NetworkOracle;
use crate::preprocessor::{preprocess, PreprocessInfo};
use crate::query::Query;
use crate::row_tightener;
use crate::simplex::DenseSimplex;
use crate::smt_core::SmtCore;
use crate::soi::SoiManager;
use crate::Variable;

const EMA_ALPHA: f64 = 0.5;
const PROGRESS_LOGGING_FREQUENCY: u64 = 100;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum ExitCode {
  Sat           = 0,
  Unsat         = 1,
  Error         = 2,
  Timeout       = 3,
  QuitRequested = 4,
}

impl ExitCode {
  pub fn code(self) -> i32 {
    self as i32
  }

  pub fn as_str(self) -> &'static str {
    match self {
      ExitCode::Sat           => "sat",
      ExitCode::Unsat         => "unsat",
      ExitCode::Error         => "ERROR",
      ExitCode::Timeout       => "TIMEOUT",
      ExitCode::QuitRequested => "QUIT_REQUESTED",
    }
  }
}

/// Counters owned by the engine, exported into the crate-level map.
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct EngineStatistics {
  pub main_loop_iterations: u64,
  pub lp_solves           : u64,
  pub lp_pivots           : u64,
  pub lp_time_micros      : u64,
  pub proposed_flips      : u64,
  pub accepted_flips      : u64,
  pub splits              : u64,
  pub implied_splits      : u64,
  pub max_stack_depth     : u64,
  pub total_time_micros   : u64,
}

impl EngineStatistics {
  pub fn average_pivot_micros(&self) -> u64 {
    if self.lp_pivots == 0 {
      0
    } else {
      self.lp_time_micros / self.lp_pivots
    }
  }
}

enum LpResult {
  Assignment(f64),
  Infeasible,
  Timeout,
  Error,
}

enum SplitChoice {
  Constraint(ConstraintId),
  Interval(Variable, f64),
}

pub struct Engine {
  config: Config,

  ctx        : Context,
  bounds     : BoundManager,
  constraints: Vec<Box<dyn PiecewiseLinear>>,
  watchers   : Vec<Vec<ConstraintId>>,

  equations        : Vec<Equation>,
  equation_pool_len: CdUsize,

  smt_core : SmtCore,
  soi      : SoiManager,
  heuristic: HeuristicCost,
  impact   : PseudoImpactTracker,

  lp    : Box<dyn LpSolver>,
  oracle: Option<Box<dyn NetworkOracle>>,

  preprocess_info: PreprocessInfo,
  input_variables: Vec<Variable>,

  assignment: Vec<f64>,
  solution  : Option<Vec<f64>>,
  exit_code : Option<ExitCode>,

  statistics: EngineStatistics,

  rounds_without_descent: u32,
  pending_impact        : Option<(ConstraintId, f64)>,

  start      : Option<Instant>,
  time_budget: Option<Duration>,
  should_quit: Option<Arc<AtomicBool>>,
}

impl Engine {
  pub fn new(mut query: Query, config: Config) -> Engine {
    if config.verbosity > 0 {
      crate::log::set_verbosity(config.verbosity);
    }

    let preprocess_info = preprocess(&mut query);
    let input_variables = query.input_variables().to_vec();

    let mut ctx = Context::new();
    let mut bounds = BoundManager::new(&mut ctx);
    bounds.initialize(&mut ctx, query.number_of_variables());
    for variable in 0..query.number_of_variables() {
      let lower = query.lower_bound(variable);
      let upper = query.upper_bound(variable);
      if float_utils::is_finite(lower) {
        bounds.tighten_lower(&mut ctx, variable, lower);
      }
      if float_utils::is_finite(upper) {
        bounds.tighten_upper(&mut ctx, variable, upper);
      }
    }

    let mut constraints = query.take_constraints();
    let mut watchers = vec![Vec::new(); query.number_of_variables()];
    for (id, constraint) in constraints.iter_mut().enumerate() {
      constraint.core_mut().register(&mut ctx);
      for variable in constraint.participating_variables() {
        watchers[variable].push(id);
      }
    }

    let equations: Vec<Equation> = query.equations().to_vec();
    let equation_pool_len = ctx.new_usize(equations.len());

    let mut impact = PseudoImpactTracker::new();
    impact.initialize(constraints.len(), EMA_ALPHA);

    Engine {
      smt_core : SmtCore::new(config.constraint_violation_threshold),
      soi      : SoiManager::new(&config),
      heuristic: HeuristicCost::new(&config),
      impact,
      lp    : Box::new(DenseSimplex::new()),
      oracle: None,
      preprocess_info,
      input_variables,
      assignment: Vec::new(),
      solution  : None,
      exit_code : None,
      statistics: EngineStatistics::default(),
      rounds_without_descent: 0,
      pending_impact        : None,
      start      : None,
      time_budget: None,
      should_quit: None,
      config,
      ctx,
      bounds,
      constraints,
      watchers,
      equations,
      equation_pool_len,
    }
  }

  pub fn set_lp_solver(&mut self, lp: Box<dyn LpSolver>) {
    self.lp = lp;
  }

  pub fn set_network_oracle(&mut self, oracle: Box<dyn NetworkOracle>) {
    self.oracle = Some(oracle);
  }

  pub fn set_quit_flag(&mut self, flag: Arc<AtomicBool>) {
    self.should_quit = Some(flag);
  }

  pub fn exit_code(&self) -> Option<ExitCode> {
    self.exit_code
  }

  pub fn solution(&self) -> Option<&[f64]> {
    self.solution.as_deref()
  }

  pub fn statistics(&self) -> &EngineStatistics {
    &self.statistics
  }

  pub fn visited_tree_states(&self) -> u64 {
    self.smt_core.visited_tree_states()
  }

  /// Applies a subquery's split permanently (depth 0) before solving.
  pub fn apply_external_split(&mut self, split: &CaseSplit) {
    debug_assert!(self.ctx.depth() == 0);
    let Engine {
      ref bounds,
      ref mut ctx,
      ref mut equations,
      equation_pool_len,
      ..
    } = *self;
    apply_split(split, bounds, ctx, equations, equation_pool_len);
  }

  /// Runs the main loop; `timeout_seconds` of 0 means no budget.
  pub fn solve(&mut self, timeout_seconds: u64) -> ExitCode {
    let code = self.run(timeout_seconds);
    self.exit_code = Some(code);
    log_at_level(1, &format!(
      "(pwlsat.engine :result {} :visited {} :iterations {})",
      code.as_str(),
      self.smt_core.visited_tree_states(),
      self.statistics.main_loop_iterations,
    ));
    code
  }

  fn run(&mut self, timeout_seconds: u64) -> ExitCode {
    let started = Instant::now();
    self.start = Some(started);
    self.time_budget = if timeout_seconds > 0 {
      Some(Duration::from_secs(timeout_seconds))
    } else {
      None
    };

    let mut pattern_ready = false;
    let mut current_cost = 0.0;

    let code = loop {
      self.statistics.main_loop_iterations += 1;
      self.statistics.max_stack_depth =
        self.statistics.max_stack_depth.max(self.smt_core.stack_depth() as u64);
      if self.statistics.main_loop_iterations % PROGRESS_LOGGING_FREQUENCY == 0 {
        log_at_level(1, &format!(
          "(pwlsat.engine :iteration {} :depth {} :visited {})",
          self.statistics.main_loop_iterations,
          self.smt_core.stack_depth(),
          self.smt_core.visited_tree_states(),
        ));
      }

      if self.quit_requested() {
        self.unwind_all();
        break ExitCode::QuitRequested;
      }
      if self.time_exhausted() {
        break ExitCode::Timeout;
      }

      self.sync_equation_pool();

      if !self.bounds.consistent(&self.ctx) || self.dead_branch() {
        if !self.backtrack() {
          break ExitCode::Unsat;
        }
        continue;
      }

      self.propagate();
      if !self.bounds.consistent(&self.ctx) {
        continue;
      }

      self.apply_implied_case_splits();
      if !self.bounds.consistent(&self.ctx) {
        continue;
      }

      // Solve the relaxation under the current SoI objective (empty
      // before the pattern exists: a pure feasibility solve).
      let objective = if pattern_ready {
        self.soi.soi_expr(&self.constraints)
      } else {
        LinearExpr::new()
      };
      match self.lp_solve(objective) {
        LpResult::Assignment(cost) => current_cost = cost,
        LpResult::Infeasible => {
          if !self.backtrack() {
            break ExitCode::Unsat;
          }
          continue;
        }
        LpResult::Timeout => break ExitCode::Timeout,
        LpResult::Error => break ExitCode::Error,
      }

      if let Some((id, baseline)) = self.pending_impact.take() {
        self.impact.update(id, num_traits::abs(current_cost - baseline));
      }

      if self.all_constraints_satisfied() {
        self.store_solution();
        break ExitCode::Sat;
      }

      if !pattern_ready {
        self.initialize_soi();
        pattern_ready = true;
        continue;
      }

      if self.smt_core.need_to_split() {
        if self.branch() {
          self.rounds_without_descent = 0;
          continue;
        }
        self.smt_core.reset_reported_violations();
      }

      if self.soi.pattern_len() == 0 {
        // Only constraints outside the SoI remain unsatisfied; branch on
        // one of them directly.
        self.smt_core.request_split();
        if self.branch() {
          continue;
        }
        log_at_level(0, "(pwlsat.engine :no-split-candidate with unsatisfied constraints)");
        break ExitCode::Error;
      }

      // One SoI step: refresh the pattern for free wins, propose a
      // flip, evaluate it through the LP and apply Metropolis-Hastings.
      self.soi.refresh_for_satisfied_constraints(&self.constraints);
      current_cost = self.soi
                         .soi_expr(&self.constraints)
                         .evaluate(self.soi.current_assignment());

      let descent_guaranteed = self.heuristic.update_cost(&mut self.soi, &self.constraints);
      self.statistics.proposed_flips += 1;
      if !descent_guaranteed {
        self.smt_core.report_random_flip();
      }

      let proposed_objective = self.soi.proposed_soi_expr(&self.constraints);
      match self.lp_solve(proposed_objective) {
        LpResult::Assignment(proposed_cost) => {
          if self.soi.decide_to_accept(current_cost, proposed_cost) {
            for id in self.soi.proposal_ids() {
              self.impact.update(id, num_traits::abs(current_cost - proposed_cost));
            }
            self.soi.commit_proposal();
            self.statistics.accepted_flips += 1;
            if proposed_cost < current_cost - float_utils::EPSILON {
              self.rounds_without_descent = 0;
            } else {
              self.rounds_without_descent += 1;
            }
          } else {
            self.heuristic.undo_last_update(&mut self.soi);
            self.rounds_without_descent += 1;
          }
        }
        LpResult::Infeasible => {
          if !self.backtrack() {
            break ExitCode::Unsat;
          }
          continue;
        }
        LpResult::Timeout => break ExitCode::Timeout,
        LpResult::Error => break ExitCode::Error,
      }

      if self.rounds_without_descent >= self.config.soi_split_threshold {
        self.smt_core.request_split();
      }
    };

    self.statistics.total_time_micros = started.elapsed().as_micros() as u64;
    code
  }

  // region Loop building blocks

  fn quit_requested(&self) -> bool {
    self.should_quit
        .as_ref()
        .map_or(false, |flag| flag.load(Ordering::Relaxed))
  }

  fn time_exhausted(&self) -> bool {
    match (self.start, self.time_budget) {
      (Some(start), Some(budget)) => start.elapsed() >= budget,
      _ => false,
    }
  }

  fn remaining_time(&self) -> Option<Duration> {
    match (self.start, self.time_budget) {
      (Some(start), Some(budget)) => Some(budget.saturating_sub(start.elapsed())),
      _ => None,
    }
  }

  /// Truncates the equation pool to the length recorded for the current
  /// context level (pops shrink the recorded length, not the vector).
  fn sync_equation_pool(&mut self) {
    let live = self.ctx.get_usize(self.equation_pool_len);
    self.equations.truncate(live);
  }

  /// An active constraint with every case excluded makes the branch
  /// unsatisfiable.
  fn dead_branch(&self) -> bool {
    self.constraints.iter().any(|constraint| {
      constraint.core().is_active(&self.ctx)
        && constraint.feasible_cases(&self.ctx).is_empty()
    })
  }

  /// Interval propagation through the equation pool interleaved with
  /// per-constraint bound notifications, to a fixpoint.
  fn propagate(&mut self) {
    loop {
      row_tightener::tighten_to_fixpoint(&self.bounds, &mut self.ctx, &self.equations);
      if !self.bounds.consistent(&self.ctx) {
        return;
      }

      let pending = self.bounds.drain_tightenings(&mut self.ctx);
      if pending.is_empty() {
        break;
      }

      for tightening in pending {
        for &id in &self.watchers[tightening.variable] {
          let constraint = &self.constraints[id];
          match tightening.kind {
            BoundKind::Lower => constraint.notify_lower_bound(
              tightening.variable, tightening.value, &self.bounds, &mut self.ctx),
            BoundKind::Upper => constraint.notify_upper_bound(
              tightening.variable, tightening.value, &self.bounds, &mut self.ctx),
          }
          if !self.bounds.consistent(&self.ctx) {
            return;
          }
        }
      }

      // Close each active constraint's deductions over the new bounds.
      let mut entailed = Vec::new();
      for constraint in &self.constraints {
        if !constraint.core().is_active(&self.ctx) {
          continue;
        }
        constraint.entailed_tightenings(&self.ctx, &self.bounds, &mut entailed);
      }
      for tightening in entailed {
        if float_utils::is_finite(tightening.value) {
          self.bounds.apply(&mut self.ctx, &tightening);
        }
        if !self.bounds.consistent(&self.ctx) {
          return;
        }
      }
    }
  }

  /// Applies the unique split of every constraint whose phase became
  /// fixed, records it for `all_splits_so_far` and retires the
  /// constraint from search.
  fn apply_implied_case_splits(&mut self) {
    for id in 0..self.constraints.len() {
      let constraint = &self.constraints[id];
      if !constraint.core().is_active(&self.ctx) || !constraint.phase_fixed(&self.ctx) {
        continue;
      }
      let split = constraint.valid_split(&self.ctx);
      constraint.core().set_active(&mut self.ctx, false);

      let Engine {
        ref bounds,
        ref mut ctx,
        ref mut equations,
        equation_pool_len,
        ..
      } = *self;
      apply_split(&split, bounds, ctx, equations, equation_pool_len);

      self.smt_core.record_implied_valid_split(split);
      self.soi.remove(id);
      self.statistics.implied_splits += 1;
    }
  }

  fn lp_solve(&mut self, objective: LinearExpr) -> LpResult {
    let n = self.bounds.number_of_variables();
    let problem = LpProblem {
      lower: (0..n).map(|v| self.bounds.lower(&self.ctx, v)).collect(),
      upper: (0..n).map(|v| self.bounds.upper(&self.ctx, v)).collect(),
      equations: self.equations.clone(),
      objective,
    };

    let started = Instant::now();
    let outcome = match self.lp.solve(&problem, self.remaining_time()) {
      Ok(outcome) => outcome,
      Err(error) => {
        log_at_level(0, &format!("(pwlsat.engine :lp-error {})", error));
        return LpResult::Error;
      }
    };

    self.statistics.lp_solves += 1;
    self.statistics.lp_pivots += outcome.pivots;
    self.statistics.lp_time_micros += started.elapsed().as_micros() as u64;

    match outcome.status {
      LpStatus::Optimal => {
        self.assignment = outcome.assignment;
        for value in self.assignment.iter_mut() {
          *value = float_utils::round_to_zero(*value);
        }
        self.soi.set_current_assignment(&self.assignment);
        LpResult::Assignment(outcome.objective_value)
      }
      LpStatus::Infeasible => LpResult::Infeasible,
      LpStatus::TimedOut   => LpResult::Timeout,
      LpStatus::Unbounded  => {
        log_at_level(0, "(pwlsat.engine :lp-unbounded)");
        LpResult::Error
      }
    }
  }

  fn all_constraints_satisfied(&self) -> bool {
    if self.assignment.is_empty() {
      return false;
    }
    self.constraints
        .iter()
        .filter(|constraint| !constraint.obsolete())
        .all(|constraint| constraint.satisfied(&self.assignment))
  }

  fn store_solution(&mut self) {
    let mut solution = self.assignment.clone();
    self.preprocess_info.restore_assignment(&mut solution);
    self.solution = Some(solution);
  }

  fn initialize_soi(&mut self) {
    let oracle_assignment = self.oracle.as_ref().map(|oracle| {
      let n = self.bounds.number_of_variables();
      let lower: Vec<f64> = (0..n).map(|v| self.bounds.lower(&self.ctx, v)).collect();
      let upper: Vec<f64> = (0..n).map(|v| self.bounds.upper(&self.ctx, v)).collect();
      oracle.concretize_input_assignment(&lower, &upper)
    });
    self.heuristic.initialize(&mut self.soi, &self.constraints, &self.ctx,
                              oracle_assignment.as_deref());
    log_at_level(2, &format!("(pwlsat.soi :pattern-size {})", self.soi.pattern_len()));
  }

  /// Backtracks to the next open alternative. Returns false when the
  /// search tree is exhausted.
  fn backtrack(&mut self) -> bool {
    let Engine {
      ref mut smt_core,
      ref mut ctx,
      ref bounds,
      ref mut equations,
      equation_pool_len,
      ..
    } = *self;
    let alive = smt_core.pop_split(ctx, |split, ctx| {
      apply_split(split, bounds, ctx, equations, equation_pool_len);
    });
    self.sync_equation_pool();
    alive
  }

  /// Picks a split candidate and performs the split. Returns false when
  /// nothing is left to branch on.
  fn branch(&mut self) -> bool {
    let choice = match self.pick_split_candidate() {
      Some(choice) => choice,
      None => return false,
    };

    let splits = match choice {
      SplitChoice::Constraint(id) => {
        let constraint = &self.constraints[id];
        constraint.update_direction(&self.ctx, &self.bounds);
        let splits = constraint.case_splits(&self.ctx, &self.bounds);
        if splits.is_empty() {
          return false;
        }
        constraint.core().set_active(&mut self.ctx, false);
        self.smt_core.set_constraint_for_splitting(id);
        self.soi.remove(id);
        self.pending_impact = Some((id, self.last_cost_for_impact()));
        log_at_level(2, &format!("(pwlsat.smt-core :branch-constraint {})", id));
        splits
      }
      SplitChoice::Interval(variable, midpoint) => {
        let mut below = CaseSplit::new();
        below.store_bound_tightening(Tightening::upper(variable, midpoint));
        let mut above = CaseSplit::new();
        above.store_bound_tightening(Tightening::lower(variable, midpoint));
        log_at_level(2, &format!(
          "(pwlsat.smt-core :branch-interval x{} :at {})", variable, midpoint));
        vec![below, above]
      }
    };

    let Engine {
      ref mut smt_core,
      ref mut ctx,
      ref bounds,
      ref mut equations,
      equation_pool_len,
      ..
    } = *self;
    smt_core.perform_split(splits, ctx, |split, ctx| {
      apply_split(split, bounds, ctx, equations, equation_pool_len);
    });
    self.statistics.splits += 1;
    true
  }

  fn last_cost_for_impact(&self) -> f64 {
    if self.soi.current_assignment().is_empty() {
      0.0
    } else {
      self.soi
          .soi_expr(&self.constraints)
          .evaluate(self.soi.current_assignment())
    }
  }

  fn pick_split_candidate(&self) -> Option<SplitChoice> {
    let candidate = match self.config.branching {
      BranchingHeuristic::PseudoImpact =>
        self.impact.top_unfixed(&self.constraints, &self.ctx),
      BranchingHeuristic::EarliestRelu => self.earliest_of_kind(ConstraintKind::Relu),
      BranchingHeuristic::ReluViolation => self.first_violated(),
      BranchingHeuristic::Polarity => self.smallest_polarity(),
      BranchingHeuristic::LargestInterval => {
        if let Some(choice) = self.widest_input_interval() {
          return Some(choice);
        }
        None
      }
    };

    candidate
      .or_else(|| self.first_unfixed())
      .map(SplitChoice::Constraint)
  }

  fn is_branchable(&self, id: ConstraintId) -> bool {
    let constraint = &self.constraints[id];
    constraint.core().is_active(&self.ctx) && !constraint.phase_fixed(&self.ctx)
  }

  fn first_unfixed(&self) -> Option<ConstraintId> {
    (0..self.constraints.len()).find(|&id| self.is_branchable(id))
  }

  fn earliest_of_kind(&self, kind: ConstraintKind) -> Option<ConstraintId> {
    (0..self.constraints.len())
      .find(|&id| self.is_branchable(id) && self.constraints[id].kind() == kind)
  }

  fn first_violated(&self) -> Option<ConstraintId> {
    if self.assignment.is_empty() {
      return None;
    }
    (0..self.constraints.len())
      .find(|&id| self.is_branchable(id) && !self.constraints[id].satisfied(&self.assignment))
  }

  /// Among the first few branchable constraints, the one with the most
  /// zero-centered input interval.
  fn smallest_polarity(&self) -> Option<ConstraintId> {
    let mut best: Option<(ConstraintId, f64)> = None;
    let mut considered = 0;
    for id in 0..self.constraints.len() {
      if considered >= self.config.polarity_candidates_threshold {
        break;
      }
      if !self.is_branchable(id) {
        continue;
      }
      if let Some(polarity) = self.constraints[id].polarity(&self.ctx, &self.bounds) {
        considered += 1;
        let magnitude = num_traits::abs(polarity);
        if best.map_or(true, |(_, m)| magnitude < m) {
          best = Some((id, magnitude));
        }
      }
    }
    best.map(|(id, _)| id)
  }

  fn widest_input_interval(&self) -> Option<SplitChoice> {
    let mut best: Option<(Variable, f64)> = None;
    for &variable in &self.input_variables {
      let lower = self.bounds.lower(&self.ctx, variable);
      let upper = self.bounds.upper(&self.ctx, variable);
      if !float_utils::is_finite(lower) || !float_utils::is_finite(upper) {
        continue;
      }
      let width = upper - lower;
      if width > float_utils::EPSILON && best.map_or(true, |(_, w)| width > w) {
        best = Some((variable, width));
      }
    }
    best.map(|(variable, _)| {
      let midpoint = (self.bounds.lower(&self.ctx, variable)
                      + self.bounds.upper(&self.ctx, variable)) / 2.0;
      SplitChoice::Interval(variable, midpoint)
    })
  }

  fn unwind_all(&mut self) {
    while self.ctx.depth() > 0 {
      self.ctx.pop();
    }
    self.smt_core.reset();
    self.sync_equation_pool();
  }

  // endregion

  // region Reporting

  pub fn collect_statistics(&self, statistics: &mut Statistics) {
    statistics.update("engine iterations", self.statistics.main_loop_iterations);
    statistics.update("engine lp solves", self.statistics.lp_solves);
    statistics.update("engine lp pivots", self.statistics.lp_pivots);
    statistics.update("engine proposed flips", self.statistics.proposed_flips);
    statistics.update("engine accepted flips", self.statistics.accepted_flips);
    statistics.update("engine splits", self.statistics.splits);
    statistics.update("engine implied splits", self.statistics.implied_splits);
    statistics.update("engine visited tree states", self.smt_core.visited_tree_states());
    statistics.update("engine max stack depth", self.statistics.max_stack_depth);
    statistics.update("bounds tightenings applied", self.bounds.tightenings_applied());
    statistics.update("bounds tightenings rejected", self.bounds.tightenings_rejected());
  }

  /// One line: `<result> <seconds> <visited_tree_states>
  /// <avg_pivot_micros>`, then on Sat one `\t<var>,<value>` line per
  /// variable.
  pub fn summary(&self) -> String {
    let code = self.exit_code.unwrap_or(ExitCode::Error);
    let mut out = format!(
      "{} {} {} {}",
      code.as_str(),
      self.statistics.total_time_micros / 1_000_000,
      self.smt_core.visited_tree_states(),
      self.statistics.average_pivot_micros(),
    );
    if code == ExitCode::Sat {
      if let Some(solution) = &self.solution {
        for (variable, value) in solution.iter().enumerate() {
          let _ = write!(out, "\n\t{},{}", variable, value);
        }
      }
    }
    out
  }

  // endregion
}

fn apply_split(split: &CaseSplit, bounds: &BoundManager, ctx: &mut Context,
               equations: &mut Vec<Equation>, equation_pool_len: CdUsize) {
  // Drop equations retracted by context pops before growing the pool.
  equations.truncate(ctx.get_usize(equation_pool_len));
  for tightening in split.bound_tightenings() {
    bounds.apply(ctx, tightening);
  }
  for equation in split.equations() {
    equations.push(equation.clone());
  }
  ctx.set_usize(equation_pool_len, equations.len());
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::constraints::{ClipConstraint, DisjunctionConstraint, ReluConstraint};
  use crate::equation::Relation;

  fn relu_query(b_lower: f64, b_upper: f64, f_lower: f64, f_upper: f64) -> Query {
    let mut query = Query::new(2);
    query.set_lower_bound(0, b_lower);
    query.set_upper_bound(0, b_upper);
    query.set_lower_bound(1, f_lower);
    query.set_upper_bound(1, f_upper);
    query.add_constraint(Box::new(ReluConstraint::new(0, 1)));
    query
  }

  #[test]
  fn single_active_relu_is_sat_without_branching() {
    let mut engine = Engine::new(relu_query(3.0, 5.0, 0.0, 10.0), Config::default());
    assert_eq!(engine.solve(10), ExitCode::Sat);

    let solution = engine.solution().unwrap();
    assert!((solution[1] - solution[0]).abs() < 1e-6);
    assert!(solution[0] >= 3.0 - 1e-6 && solution[0] <= 5.0 + 1e-6);
    assert_eq!(engine.statistics().splits, 0);
  }

  #[test]
  fn single_inactive_relu_forces_zero_output() {
    let mut engine = Engine::new(relu_query(-5.0, -1.0, -10.0, 10.0), Config::default());
    assert_eq!(engine.solve(10), ExitCode::Sat);

    let solution = engine.solution().unwrap();
    assert!(solution[1].abs() < 1e-6);
    assert_eq!(engine.statistics().splits, 0);
  }

  #[test]
  fn coupled_relus_with_contradictory_outputs_are_unsat() {
    // x0 - x2 = 0; relu(0, 1); relu(2, 3); outputs must sum to both
    // <= 0 and >= 1.
    let mut query = Query::new(4);
    for v in [0, 2] {
      query.set_lower_bound(v, -5.0);
      query.set_upper_bound(v, 5.0);
    }

    let mut tie = Equation::new(Relation::Eq);
    tie.add_addend(1.0, 0);
    tie.add_addend(-1.0, 2);
    tie.set_scalar(0.0);
    query.add_equation(tie);

    let mut le = Equation::new(Relation::Le);
    le.add_addend(1.0, 1);
    le.add_addend(1.0, 3);
    le.set_scalar(0.0);
    query.add_equation(le);

    let mut ge = Equation::new(Relation::Ge);
    ge.add_addend(1.0, 1);
    ge.add_addend(1.0, 3);
    ge.set_scalar(1.0);
    query.add_equation(ge);

    query.add_constraint(Box::new(ReluConstraint::new(0, 1)));
    query.add_constraint(Box::new(ReluConstraint::new(2, 3)));

    let mut engine = Engine::new(query, Config::default());
    assert_eq!(engine.solve(10), ExitCode::Unsat);
    assert!(engine.statistics().splits <= 1);
  }

  #[test]
  fn clip_saturation_pins_the_output_at_the_ceiling() {
    let mut query = Query::new(2);
    query.set_lower_bound(0, 10.0);
    query.set_upper_bound(0, 20.0);
    query.add_constraint(Box::new(ClipConstraint::new(0, 1, 1.0, 5.0)));

    let mut engine = Engine::new(query, Config::default());
    assert_eq!(engine.solve(10), ExitCode::Sat);
    let solution = engine.solution().unwrap();
    assert!((solution[1] - 5.0).abs() < 1e-6);
  }

  #[test]
  fn integrality_disjunction_with_a_sum_equation() {
    // (x0 = 0 or x0 = 1) and x0 + x1 = 1 over unit boxes.
    let mut query = Query::new(2);
    query.set_lower_bound(0, 0.0);
    query.set_upper_bound(0, 1.0);
    query.set_lower_bound(1, 0.0);
    query.set_upper_bound(1, 1.0);

    let mut sum = Equation::new(Relation::Eq);
    sum.add_addend(1.0, 0);
    sum.add_addend(1.0, 1);
    sum.set_scalar(1.0);
    query.add_equation(sum);

    let mut zero = CaseSplit::new();
    zero.store_bound_tightening(Tightening::lower(0, 0.0));
    zero.store_bound_tightening(Tightening::upper(0, 0.0));
    let mut one = CaseSplit::new();
    one.store_bound_tightening(Tightening::lower(0, 1.0));
    one.store_bound_tightening(Tightening::upper(0, 1.0));
    query.add_constraint(Box::new(DisjunctionConstraint::new(vec![zero, one])));

    let mut engine = Engine::new(query, Config::default());
    assert_eq!(engine.solve(10), ExitCode::Sat);

    let solution = engine.solution().unwrap();
    let x0_integral = solution[0].abs() < 1e-6 || (solution[0] - 1.0).abs() < 1e-6;
    assert!(x0_integral);
    assert!((solution[0] + solution[1] - 1.0).abs() < 1e-6);
  }

  #[test]
  fn equation_disjuncts_force_a_branch() {
    // (x0 = 0 or x0 = 1) expressed through disjunct equations, which
    // interval reasoning cannot exclude, with 2 x0 + x1 = 1 over unit
    // boxes: only (0, 1) survives, and the relaxation's interior point
    // satisfies neither disjunct, so the engine has to split.
    let mut query = Query::new(2);
    query.set_lower_bound(0, 0.0);
    query.set_upper_bound(0, 1.0);
    query.set_lower_bound(1, 0.0);
    query.set_upper_bound(1, 1.0);

    let mut sum = Equation::new(Relation::Eq);
    sum.add_addend(2.0, 0);
    sum.add_addend(1.0, 1);
    sum.set_scalar(1.0);
    query.add_equation(sum);

    let mut zero = CaseSplit::new();
    let mut pin_zero = Equation::new(Relation::Eq);
    pin_zero.add_addend(1.0, 0);
    pin_zero.set_scalar(0.0);
    zero.add_equation(pin_zero);

    let mut one = CaseSplit::new();
    let mut pin_one = Equation::new(Relation::Eq);
    pin_one.add_addend(1.0, 0);
    pin_one.set_scalar(1.0);
    one.add_equation(pin_one);

    query.add_constraint(Box::new(DisjunctionConstraint::new(vec![zero, one])));

    let mut engine = Engine::new(query, Config::default());
    assert_eq!(engine.solve(10), ExitCode::Sat);
    assert!(engine.statistics().splits >= 1);

    let solution = engine.solution().unwrap();
    assert!(solution[0].abs() < 1e-6);
    assert!((solution[1] - 1.0).abs() < 1e-6);
  }

  #[test]
  fn walksat_strategy_reaches_the_same_verdicts() {
    let mut config = Config::default();
    config.soi_search_strategy = crate::config::SoiSearchStrategy::Walksat;

    let mut engine = Engine::new(relu_query(3.0, 5.0, 0.0, 10.0), config);
    assert_eq!(engine.solve(10), ExitCode::Sat);

    let mut engine = Engine::new(relu_query(-5.0, -1.0, 1.0, 10.0), config);
    // f is forced positive while the relu is inactive: unsatisfiable.
    assert_eq!(engine.solve(10), ExitCode::Unsat);
  }

  #[test]
  fn two_layer_network_with_unreachable_output_is_unsat() {
    // Inputs x0 in [0, 1]. Layer 1: n0 = relu(x0 - 1), n1 = relu(-x0).
    // Output y = n0 + n1 + 1 must be <= 0.5: impossible, y >= 1 for all
    // x0 in [0, 1].
    let mut query = Query::new(6);
    query.set_lower_bound(0, 0.0);
    query.set_upper_bound(0, 1.0);
    query.mark_input_variable(0);

    // x1 = x0 - 1, x3 = -x0 (pre-activations).
    let mut pre0 = Equation::new(Relation::Eq);
    pre0.add_addend(1.0, 1);
    pre0.add_addend(-1.0, 0);
    pre0.set_scalar(-1.0);
    query.add_equation(pre0);

    let mut pre1 = Equation::new(Relation::Eq);
    pre1.add_addend(1.0, 3);
    pre1.add_addend(1.0, 0);
    pre1.set_scalar(0.0);
    query.add_equation(pre1);

    query.add_constraint(Box::new(ReluConstraint::new(1, 2)));
    query.add_constraint(Box::new(ReluConstraint::new(3, 4)));

    // y = x2 + x4 + 1 and y <= 0.5.
    let mut out = Equation::new(Relation::Eq);
    out.add_addend(1.0, 5);
    out.add_addend(-1.0, 2);
    out.add_addend(-1.0, 4);
    out.set_scalar(1.0);
    query.add_equation(out);
    query.set_upper_bound(5, 0.5);

    let mut engine = Engine::new(query, Config::default());
    assert_eq!(engine.solve(60), ExitCode::Unsat);
  }

  #[test]
  fn abs_with_negative_input_interval_mirrors_through() {
    // f = |b|, b in [-4, -2], f otherwise free: Sat with f in [2, 4].
    let mut query = Query::new(2);
    query.set_lower_bound(0, -4.0);
    query.set_upper_bound(0, -2.0);
    query.add_constraint(Box::new(crate::constraints::AbsoluteValueConstraint::new(0, 1)));

    let mut engine = Engine::new(query, Config::default());
    assert_eq!(engine.solve(10), ExitCode::Sat);

    let solution = engine.solution().unwrap();
    assert!((solution[1] - solution[0].abs()).abs() < 1e-6);
    assert!(solution[1] >= 2.0 - 1e-6 && solution[1] <= 4.0 + 1e-6);
  }

  #[test]
  fn sign_output_is_forced_by_the_input_interval() {
    let mut query = Query::new(2);
    query.set_lower_bound(0, 1.0);
    query.set_upper_bound(0, 3.0);
    query.add_constraint(Box::new(crate::constraints::SignConstraint::new(0, 1)));

    let mut engine = Engine::new(query, Config::default());
    assert_eq!(engine.solve(10), ExitCode::Sat);
    assert!((engine.solution().unwrap()[1] - 1.0).abs() < 1e-6);
  }

  #[test]
  fn max_tracks_its_dominant_element() {
    // f = max(x0, x1) with x0 in [1, 2] and x1 in [5, 6]: f follows x1.
    let mut query = Query::new(3);
    query.set_lower_bound(0, 1.0);
    query.set_upper_bound(0, 2.0);
    query.set_lower_bound(1, 5.0);
    query.set_upper_bound(1, 6.0);
    query.add_constraint(Box::new(crate::constraints::MaxConstraint::new(2, vec![0, 1])));

    let mut engine = Engine::new(query, Config::default());
    assert_eq!(engine.solve(10), ExitCode::Sat);

    let solution = engine.solution().unwrap();
    assert!((solution[2] - solution[1]).abs() < 1e-6);
    assert!(solution[2] >= 5.0 - 1e-6);
  }

  #[test]
  fn a_network_oracle_seeds_the_phase_pattern() {
    use crate::oracle::{Activation, Layer, LayeredNetwork};

    // x2 = relu(x1), x1 = x0 - 1, x0 in [0, 4], and x2 + x0 = 3.5. The
    // phase stays open under interval reasoning and the first
    // relaxation point violates the relu, so the SoI pattern is seeded
    // from the oracle's forward pass (x0 = 2, relu active).
    let mut query = Query::new(3);
    query.set_lower_bound(0, 0.0);
    query.set_upper_bound(0, 4.0);
    query.mark_input_variable(0);

    let mut pre = Equation::new(Relation::Eq);
    pre.add_addend(1.0, 1);
    pre.add_addend(-1.0, 0);
    pre.set_scalar(-1.0);
    query.add_equation(pre);

    let mut post = Equation::new(Relation::Eq);
    post.add_addend(1.0, 2);
    post.add_addend(1.0, 0);
    post.set_scalar(3.5);
    query.add_equation(post);

    query.add_constraint(Box::new(ReluConstraint::new(1, 2)));

    let mut network = LayeredNetwork::new(vec![0]);
    network.add_layer(Layer {
      weights       : vec![vec![1.0]],
      biases        : vec![-1.0],
      activation    : Activation::Relu,
      pre_variables : vec![1],
      post_variables: vec![2],
    });

    let mut engine = Engine::new(query, Config::default());
    engine.set_network_oracle(Box::new(network));
    assert_eq!(engine.solve(10), ExitCode::Sat);

    let solution = engine.solution().unwrap();
    assert!((solution[2] - (solution[0] - 1.0)).abs() < 1e-6);
  }

  #[test]
  fn time_budget_exhaustion_is_detected_at_polling_points() {
    let mut engine = Engine::new(relu_query(-5.0, 5.0, 0.0, 10.0), Config::default());
    engine.start = Some(Instant::now() - Duration::from_secs(10));
    engine.time_budget = Some(Duration::from_secs(5));
    assert!(engine.time_exhausted());
    assert_eq!(engine.remaining_time(), Some(Duration::from_secs(0)));

    engine.time_budget = None;
    assert!(!engine.time_exhausted());
    assert_eq!(engine.remaining_time(), None);
  }

  #[test]
  fn quit_flag_unwinds_cleanly() {
    let mut engine = Engine::new(relu_query(-5.0, 5.0, 0.0, 10.0), Config::default());
    let flag = Arc::new(AtomicBool::new(true));
    engine.set_quit_flag(flag);
    assert_eq!(engine.solve(10), ExitCode::QuitRequested);
    assert_eq!(engine.exit_code(), Some(ExitCode::QuitRequested));
  }

  #[test]
  fn summary_line_has_the_documented_shape() {
    let mut engine = Engine::new(relu_query(3.0, 5.0, 0.0, 10.0), Config::default());
    engine.solve(10);

    let summary = engine.summary();
    let first_line = summary.lines().next().unwrap();
    let fields: Vec<&str> = first_line.split(' ').collect();
    assert_eq!(fields.len(), 4);
    assert_eq!(fields[0], "sat");
    assert!(summary.lines().skip(1).all(|line| line.starts_with('\t')));
    assert!(summary.lines().count() > 1);
  }

  #[test]
  fn exit_codes_match_the_documented_numbers() {
    assert_eq!(ExitCode::Sat.code(), 0);
    assert_eq!(ExitCode::Unsat.code(), 1);
    assert_eq!(ExitCode::Error.code(), 2);
    assert_eq!(ExitCode::Timeout.code(), 3);
    assert_eq!(ExitCode::QuitRequested.code(), 4);
  }
}
