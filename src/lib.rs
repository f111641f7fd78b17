
mod bounds;
mod case_split;
mod config;
mod constraints;
mod context;
mod data_structures;
mod dnc;
mod engine;
mod equation;
mod errors;
mod float_utils;
mod heuristic_cost;
mod impact_tracker;
mod log;
mod lp;
mod oracle;
mod preprocessor;
mod query;
mod row_tightener;
mod simplex;
mod smt_core;
mod soi;


// Re-exported items
pub use bounds::BoundManager;
pub use case_split::{BoundKind, CaseSplit, Tightening};
pub use config::{
  BranchingHeuristic,
  Config,
  DivideStrategy,
  SoiInitStrategy,
  SoiSearchStrategy,
};
pub use constraints::{
  AbsoluteValueConstraint,
  ClipConstraint,
  ConstraintId,
  ConstraintKind,
  DisjunctionConstraint,
  MaxConstraint,
  PhaseStatus,
  PiecewiseLinear,
  ReluConstraint,
  SignConstraint,
};
pub use context::Context;
pub use data_structures::{RandomGenerator, Statistic, Statistics};
pub use dnc::{
  solve,
  solve_with_snc,
  EarliestReluDivider,
  LargestIntervalDivider,
  PolarityBasedDivider,
  QueryDivider,
  SubQuery,
};
pub use engine::{Engine, EngineStatistics, ExitCode};
pub use equation::{Equation, LinearExpr, Relation};
pub use errors::Error;
pub use lp::{LpOutcome, LpProblem, LpSolver, LpStatus};
pub use oracle::{Activation, Layer, LayeredNetwork, NetworkOracle};
pub use preprocessor::{preprocess, PreprocessInfo};
pub use query::Query;
pub use simplex::DenseSimplex;
pub use soi::SoiManager;



/// A variable is an index into the bound manager's interval store. Its
/// identity is stable for the lifetime of a run.
pub type Variable = usize;



#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn query_through_the_front_door() {
    // relu over x0 in [1, 2]: trivially satisfiable.
    let mut query = Query::new(2);
    query.set_lower_bound(0, 1.0);
    query.set_upper_bound(0, 2.0);
    query.add_constraint(Box::new(ReluConstraint::new(0, 1)));

    let (code, solution) = solve(query, Config::default());
    assert_eq!(code, ExitCode::Sat);
    let solution = solution.unwrap();
    assert!((solution[0] - solution[1]).abs() < 1e-6);
  }
}
