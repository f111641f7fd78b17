/*!

  Divide-and-conquer solving.

  A divider strategy partitions a query into subqueries by repeatedly
  bisecting: at each level it selects a splitting constraint (or input
  variable) and produces one child per case, each child carrying the
  accumulated split. Workers pop subqueries from a bounded lock-free
  queue; every worker owns a fresh engine per subquery. A timeout is not
  fatal: the worker re-partitions the subquery and pushes the children
  back. The first Sat wins and quits everyone; all-Unsat means Unsat.

  The dividers keep their own scratch context and bound manager, so
  refining bounds under a candidate split is an ordinary push/pop.

*/

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::queue::ArrayQueue;

use crate::bounds::BoundManager;
use crate::case_split::{CaseSplit, Tightening};
use crate::config::{Config, DivideStrategy};
use crate::constraints::{ConstraintKind, PiecewiseLinear};
use crate::context::Context;
use crate::engine::{Engine, ExitCode};
use crate::float_utils;
use crate::log::log_at_level;
use crate::query::Query;
use crate::Variable;

const EMPTY_QUEUE_BACKOFF: Duration = Duration::from_millis(100);
const MIN_QUEUE_CAPACITY : usize = 1024;

#[derive(Clone, Debug)]
pub struct SubQuery {
  pub query_id       : String,
  pub depth          : u32,
  pub split          : CaseSplit,
  pub timeout_seconds: u64,
}

pub trait QueryDivider: Send {
  /// Splits `previous` into `2^divides` children (fewer when no further
  /// split point exists).
  fn create_subqueries(&mut self, divides: u32, id_prefix: &str, depth: u32,
                       previous: &CaseSplit, timeout_seconds: u64) -> Vec<SubQuery>;
}

/// Scratch state shared by the divider strategies: the base query's
/// bounds in a private context, plus unregistered-phase clones of the
/// constraints for polarity questions.
struct DividerScratch {
  ctx        : Context,
  bounds     : BoundManager,
  constraints: Vec<Box<dyn PiecewiseLinear>>,
  inputs     : Vec<Variable>,
}

impl DividerScratch {
  fn new(query: &Query) -> Self {
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

    let mut constraints: Vec<Box<dyn PiecewiseLinear>> = query.constraints().to_vec();
    for constraint in constraints.iter_mut() {
      constraint.core_mut().register(&mut ctx);
    }

    DividerScratch {
      ctx,
      bounds,
      constraints,
      inputs: query.input_variables().to_vec(),
    }
  }

  /// Evaluates `select` under the bounds refined by `split`.
  fn with_split<T>(&mut self, split: &CaseSplit,
                   select: impl FnOnce(&mut DividerScratch) -> T) -> T {
    self.ctx.push();
    for tightening in split.bound_tightenings() {
      self.bounds.apply(&mut self.ctx, tightening);
    }
    let result = select(self);
    self.ctx.pop();
    result
  }

  /// A constraint is still splittable when its input interval straddles
  /// zero under the refined bounds.
  fn straddles_zero(&self, id: usize) -> bool {
    match self.constraints[id].polarity(&self.ctx, &self.bounds) {
      Some(polarity) => num_traits::abs(polarity) < 1.0,
      None           => false,
    }
  }
}

fn expand(base: &CaseSplit, case: CaseSplit) -> CaseSplit {
  let mut combined = case;
  for tightening in base.bound_tightenings() {
    combined.store_bound_tightening(*tightening);
  }
  for equation in base.equations() {
    combined.add_equation(equation.clone());
  }
  combined
}

fn number_subqueries(splits: Vec<CaseSplit>, id_prefix: &str, depth: u32,
                     timeout_seconds: u64) -> Vec<SubQuery> {
  splits.into_iter()
        .enumerate()
        .map(|(index, split)| SubQuery {
          query_id: if id_prefix.is_empty() {
            format!("{}", index + 1)
          } else {
            format!("{}-{}", id_prefix, index + 1)
          },
          depth,
          split,
          timeout_seconds,
        })
        .collect()
}

fn bisect<F>(divides: u32, previous: &CaseSplit, mut split_one: F) -> Vec<CaseSplit>
where
  F: FnMut(&CaseSplit) -> Option<Vec<CaseSplit>>,
{
  let mut splits = vec![previous.clone()];
  for _ in 0..divides {
    let mut next = Vec::with_capacity(splits.len() * 2);
    for split in &splits {
      match split_one(split) {
        Some(cases) => next.extend(cases.into_iter().map(|case| expand(split, case))),
        None        => next.push(split.clone()),
      }
    }
    splits = next;
  }
  splits
}

// region Divider strategies

/// Bisects the widest input variable interval at its midpoint.
pub struct LargestIntervalDivider {
  scratch: DividerScratch,
}

impl LargestIntervalDivider {
  pub fn new(query: &Query) -> Self {
    LargestIntervalDivider { scratch: DividerScratch::new(query) }
  }
}

impl QueryDivider for LargestIntervalDivider {
  fn create_subqueries(&mut self, divides: u32, id_prefix: &str, depth: u32,
                       previous: &CaseSplit, timeout_seconds: u64) -> Vec<SubQuery> {
    let scratch = &mut self.scratch;
    let splits = bisect(divides, previous, |split| {
      scratch.with_split(split, |scratch| {
        let mut widest: Option<(Variable, f64)> = None;
        for &variable in &scratch.inputs {
          let lower = scratch.bounds.lower(&scratch.ctx, variable);
          let upper = scratch.bounds.upper(&scratch.ctx, variable);
          if !float_utils::is_finite(lower) || !float_utils::is_finite(upper) {
            continue;
          }
          let width = upper - lower;
          if width > float_utils::EPSILON
             && widest.map_or(true, |(_, best)| width > best) {
            widest = Some((variable, width));
          }
        }
        widest.map(|(variable, _)| {
          let midpoint = (scratch.bounds.lower(&scratch.ctx, variable)
                          + scratch.bounds.upper(&scratch.ctx, variable)) / 2.0;
          let mut below = CaseSplit::new();
          below.store_bound_tightening(Tightening::upper(variable, midpoint));
          let mut above = CaseSplit::new();
          above.store_bound_tightening(Tightening::lower(variable, midpoint));
          vec![below, above]
        })
      })
    });
    number_subqueries(splits, id_prefix, depth, timeout_seconds)
  }
}

/// Among the first `candidates` still-splittable constraints, picks the
/// one with the most zero-centered input interval and splits on its
/// cases.
pub struct PolarityBasedDivider {
  scratch   : DividerScratch,
  candidates: usize,
}

impl PolarityBasedDivider {
  pub fn new(query: &Query, candidates: usize) -> Self {
    PolarityBasedDivider {
      scratch: DividerScratch::new(query),
      candidates,
    }
  }
}

impl QueryDivider for PolarityBasedDivider {
  fn create_subqueries(&mut self, divides: u32, id_prefix: &str, depth: u32,
                       previous: &CaseSplit, timeout_seconds: u64) -> Vec<SubQuery> {
    let candidates = self.candidates;
    let scratch = &mut self.scratch;
    let splits = bisect(divides, previous, |split| {
      scratch.with_split(split, |scratch| {
        let mut best: Option<(usize, f64)> = None;
        let mut considered = 0;
        for id in 0..scratch.constraints.len() {
          if considered >= candidates {
            break;
          }
          if !scratch.straddles_zero(id) {
            continue;
          }
          considered += 1;
          let polarity = scratch.constraints[id]
                                .polarity(&scratch.ctx, &scratch.bounds)
                                .unwrap();
          let magnitude = num_traits::abs(polarity);
          if best.map_or(true, |(_, m)| magnitude < m) {
            best = Some((id, magnitude));
          }
        }
        best.map(|(id, _)| {
          scratch.constraints[id].update_direction(&scratch.ctx, &scratch.bounds);
          scratch.constraints[id].case_splits(&scratch.ctx, &scratch.bounds)
        })
      })
    });
    number_subqueries(splits, id_prefix, depth, timeout_seconds)
  }
}

/// Splits on the first still-splittable ReLU in topological (id) order.
pub struct EarliestReluDivider {
  scratch: DividerScratch,
}

impl EarliestReluDivider {
  pub fn new(query: &Query) -> Self {
    EarliestReluDivider { scratch: DividerScratch::new(query) }
  }
}

impl QueryDivider for EarliestReluDivider {
  fn create_subqueries(&mut self, divides: u32, id_prefix: &str, depth: u32,
                       previous: &CaseSplit, timeout_seconds: u64) -> Vec<SubQuery> {
    let scratch = &mut self.scratch;
    let splits = bisect(divides, previous, |split| {
      scratch.with_split(split, |scratch| {
        (0..scratch.constraints.len())
          .find(|&id| scratch.constraints[id].kind() == ConstraintKind::Relu
                      && scratch.straddles_zero(id))
          .map(|id| {
            scratch.constraints[id].update_direction(&scratch.ctx, &scratch.bounds);
            scratch.constraints[id].case_splits(&scratch.ctx, &scratch.bounds)
          })
      })
    });
    number_subqueries(splits, id_prefix, depth, timeout_seconds)
  }
}

pub fn make_divider(query: &Query, config: &Config) -> Box<dyn QueryDivider> {
  match config.split_strategy {
    DivideStrategy::LargestInterval => Box::new(LargestIntervalDivider::new(query)),
    DivideStrategy::Polarity        =>
      Box::new(PolarityBasedDivider::new(query, config.polarity_candidates_threshold)),
    DivideStrategy::EarliestRelu    => Box::new(EarliestReluDivider::new(query)),
  }
}

// endregion

// region Worker pool

struct SharedState {
  workload      : ArrayQueue<SubQuery>,
  unsolved_count: AtomicU32,
  should_quit   : Arc<AtomicBool>,
  verdict       : Mutex<Option<(ExitCode, Option<Vec<f64>>)>>,
}

impl SharedState {
  fn record_verdict(&self, code: ExitCode, solution: Option<Vec<f64>>) {
    let mut verdict = self.verdict.lock().unwrap();
    if verdict.is_none() {
      *verdict = Some((code, solution));
    }
    self.should_quit.store(true, Ordering::SeqCst);
  }
}

/// Solves `query` with the divide-and-conquer worker pool. Returns the
/// overall exit code and, on Sat, the witness assignment.
pub fn solve_with_snc(query: Query, config: Config) -> (ExitCode, Option<Vec<f64>>) {
  let mut worker_config = config;
  worker_config.snc_mode = false;

  let mut divider = make_divider(&query, &config);
  let initial = divider.create_subqueries(config.initial_divides, "", 0,
                                          &CaseSplit::new(),
                                          config.initial_timeout_seconds);
  drop(divider);

  let capacity = MIN_QUEUE_CAPACITY.max(initial.len() * 2);
  let shared = Arc::new(SharedState {
    workload      : ArrayQueue::new(capacity),
    unsolved_count: AtomicU32::new(initial.len() as u32),
    should_quit   : Arc::new(AtomicBool::new(false)),
    verdict       : Mutex::new(None),
  });

  for subquery in initial {
    if shared.workload.push(subquery).is_err() {
      return (ExitCode::Error, None);
    }
  }

  let worker_count = config.num_workers.max(1);
  let mut handles = Vec::with_capacity(worker_count);
  for worker_id in 0..worker_count {
    let shared = Arc::clone(&shared);
    let query = query.clone();
    handles.push(thread::spawn(move || {
      worker_loop(worker_id, query, worker_config, shared);
    }));
  }

  for handle in handles {
    let _ = handle.join();
  }

  let verdict = shared.verdict.lock().unwrap().take();
  match verdict {
    Some((code, solution)) => (code, solution),
    None => {
      if shared.unsolved_count.load(Ordering::SeqCst) == 0 {
        (ExitCode::Unsat, None)
      } else {
        (ExitCode::Error, None)
      }
    }
  }
}

fn worker_loop(worker_id: usize, base_query: Query, config: Config, shared: Arc<SharedState>) {
  let mut divider = make_divider(&base_query, &config);

  loop {
    if shared.should_quit.load(Ordering::SeqCst) {
      return;
    }
    if shared.unsolved_count.load(Ordering::SeqCst) == 0 {
      return;
    }

    let subquery = match shared.workload.pop() {
      Some(subquery) => subquery,
      None => {
        // The queue can be transiently empty while another worker is
        // re-dividing; back off and retry.
        thread::sleep(EMPTY_QUEUE_BACKOFF);
        continue;
      }
    };

    let mut engine = Engine::new(base_query.clone(), config);
    engine.set_quit_flag(Arc::clone(&shared.should_quit));
    engine.apply_external_split(&subquery.split);

    let result = engine.solve(subquery.timeout_seconds);
    log_at_level(1, &format!(
      "(pwlsat.dnc :worker {} :query {} :result {} :remaining {})",
      worker_id,
      subquery.query_id,
      result.as_str(),
      shared.unsolved_count.load(Ordering::SeqCst),
    ));

    match result {
      ExitCode::Unsat => {
        if shared.unsolved_count.fetch_sub(1, Ordering::SeqCst) == 1 {
          shared.should_quit.store(true, Ordering::SeqCst);
        }
      }
      ExitCode::Timeout => {
        // Not fatal: re-partition into 2^online_divides children with a
        // stretched budget.
        let child_timeout = if subquery.depth + 1 >= config.dnc_depth_threshold {
          0
        } else {
          (subquery.timeout_seconds as f64 * config.timeout_factor) as u64
        };
        let children = divider.create_subqueries(config.online_divides,
                                                 &subquery.query_id,
                                                 subquery.depth + 1,
                                                 &subquery.split,
                                                 child_timeout);
        for child in children {
          shared.unsolved_count.fetch_add(1, Ordering::SeqCst);
          if shared.workload.push(child).is_err() {
            shared.record_verdict(ExitCode::Error, None);
            return;
          }
        }
        shared.unsolved_count.fetch_sub(1, Ordering::SeqCst);
      }
      ExitCode::Sat => {
        shared.unsolved_count.fetch_sub(1, Ordering::SeqCst);
        shared.record_verdict(ExitCode::Sat, engine.solution().map(|s| s.to_vec()));
      }
      ExitCode::QuitRequested => {
        return;
      }
      ExitCode::Error => {
        shared.record_verdict(ExitCode::Error, None);
        return;
      }
    }
  }
}

/// Front door: route to the worker pool in split-and-conquer mode, or a
/// single engine otherwise.
pub fn solve(query: Query, config: Config) -> (ExitCode, Option<Vec<f64>>) {
  if config.snc_mode {
    solve_with_snc(query, config)
  } else {
    let mut engine = Engine::new(query, config);
    let code = engine.solve(config.timeout_seconds);
    (code, engine.solution().map(|s| s.to_vec()))
  }
}

// endregion

#[cfg(test)]
mod tests {
  use super::*;
  use crate::constraints::ReluConstraint;
  use crate::equation::{Equation, Relation};

  fn box_query() -> Query {
    let mut query = Query::new(2);
    query.set_lower_bound(0, 0.0);
    query.set_upper_bound(0, 8.0);
    query.set_lower_bound(1, 0.0);
    query.set_upper_bound(1, 2.0);
    query.mark_input_variable(0);
    query.mark_input_variable(1);
    query
  }

  #[test]
  fn largest_interval_divider_bisects_the_widest_input() {
    let query = box_query();
    let mut divider = LargestIntervalDivider::new(&query);

    let subqueries = divider.create_subqueries(1, "", 0, &CaseSplit::new(), 5);
    assert_eq!(subqueries.len(), 2);
    assert_eq!(subqueries[0].query_id, "1");
    assert_eq!(subqueries[1].query_id, "2");

    // Both children constrain x0 (the widest interval) at its midpoint.
    for subquery in &subqueries {
      let tightenings = subquery.split.bound_tightenings();
      assert_eq!(tightenings.len(), 1);
      assert_eq!(tightenings[0].variable, 0);
      assert_eq!(tightenings[0].value, 4.0);
    }
  }

  #[test]
  fn two_divides_split_along_both_inputs() {
    let query = box_query();
    let mut divider = LargestIntervalDivider::new(&query);

    let subqueries = divider.create_subqueries(2, "q", 0, &CaseSplit::new(), 5);
    assert_eq!(subqueries.len(), 4);
    assert!(subqueries.iter().all(|s| s.query_id.starts_with("q-")));

    // After bisecting x0 once, both halves are 4 wide while x1 is 2
    // wide, so the second round bisects the x0 halves again.
    let quarters = subqueries.iter()
                             .filter(|s| s.split
                                          .bound_tightenings()
                                          .iter()
                                          .filter(|t| t.variable == 0)
                                          .count() == 2)
                             .count();
    assert_eq!(quarters, 4);
  }

  #[test]
  fn earliest_relu_divider_splits_on_constraint_cases() {
    let mut query = Query::new(4);
    for v in 0..4 {
      query.set_lower_bound(v, -2.0);
      query.set_upper_bound(v, 2.0);
    }
    query.add_constraint(Box::new(ReluConstraint::new(0, 1)));
    query.add_constraint(Box::new(ReluConstraint::new(2, 3)));

    let mut divider = EarliestReluDivider::new(&query);
    let subqueries = divider.create_subqueries(1, "", 0, &CaseSplit::new(), 5);

    assert_eq!(subqueries.len(), 2);
    // Each child pins x0's phase (lower 0 for active, upper 0 for
    // inactive).
    assert!(subqueries.iter().all(|s| {
      s.split.bound_tightenings().iter().any(|t| t.variable == 0 && t.value == 0.0)
    }));
  }

  #[test]
  fn exhausted_split_points_return_the_parent_unchanged() {
    let mut query = Query::new(1);
    query.set_lower_bound(0, 1.0);
    query.set_upper_bound(0, 1.0);
    query.mark_input_variable(0);

    let mut divider = LargestIntervalDivider::new(&query);
    let subqueries = divider.create_subqueries(3, "", 0, &CaseSplit::new(), 5);
    assert_eq!(subqueries.len(), 1);
    assert!(subqueries[0].split.bound_tightenings().is_empty());
  }

  #[test]
  fn snc_mode_solves_a_satisfiable_box() {
    let mut config = Config::default();
    config.snc_mode = true;
    config.num_workers = 2;
    config.initial_divides = 1;
    config.initial_timeout_seconds = 10;

    let (code, solution) = solve(box_query(), config);
    assert_eq!(code, ExitCode::Sat);
    let solution = solution.unwrap();
    assert!(solution[0] >= -1e-6 && solution[0] <= 8.0 + 1e-6);
  }

  #[test]
  fn snc_mode_agrees_on_unsat() {
    // relu output forced negative: unsat everywhere.
    let mut query = Query::new(2);
    query.set_lower_bound(0, -4.0);
    query.set_upper_bound(0, 4.0);
    query.set_upper_bound(1, -1.0);
    query.mark_input_variable(0);
    query.add_constraint(Box::new(ReluConstraint::new(0, 1)));

    let mut config = Config::default();
    config.snc_mode = true;
    config.num_workers = 2;
    config.initial_divides = 1;
    config.initial_timeout_seconds = 10;

    let (code, _) = solve(query, config);
    assert_eq!(code, ExitCode::Unsat);
  }

  #[test]
  fn single_engine_mode_still_reports_sat_with_equations() {
    let mut query = box_query();
    let mut eq = Equation::new(Relation::Le);
    eq.add_addend(1.0, 0);
    eq.add_addend(1.0, 1);
    eq.set_scalar(6.0);
    query.add_equation(eq);

    let (code, solution) = solve(query, Config::default());
    assert_eq!(code, ExitCode::Sat);
    let solution = solution.unwrap();
    assert!(solution[0] + solution[1] <= 6.0 + 1e-6);
  }
}
