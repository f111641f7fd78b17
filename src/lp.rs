/*!

  The interface to the linear-programming backend.

  The engine talks to the backend through the `LpSolver` trait: it hands
  over the full relaxation (current bounds, live equation pool, SoI
  objective) and reads back a status, an assignment and the objective
  value. Variables are integer indices end to end; a backend that wants
  names generates them at this boundary.

*/

use std::time::Duration;

use crate::equation::{Equation, LinearExpr};
use crate::errors::Error;
use crate::Variable;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum LpStatus {
  Optimal,
  Infeasible,
  Unbounded,
  TimedOut,
}

/// The relaxation handed to the backend: box bounds, linear rows and a
/// linear objective to minimize.
#[derive(Clone, Debug, Default)]
pub struct LpProblem {
  pub lower    : Vec<f64>,
  pub upper    : Vec<f64>,
  pub equations: Vec<Equation>,
  pub objective: LinearExpr,
}

impl LpProblem {
  pub fn number_of_variables(&self) -> usize {
    self.lower.len()
  }

  /// Name generation for backends that require symbolic columns.
  pub fn variable_name(variable: Variable) -> String {
    format!("x{}", variable)
  }
}

#[derive(Clone, Debug)]
pub struct LpOutcome {
  pub status         : LpStatus,
  /// Variable values; meaningful only when `status` is `Optimal`.
  pub assignment     : Vec<f64>,
  pub objective_value: f64,
  pub pivots         : u64,
}

pub trait LpSolver: Send {
  fn solve(&mut self, problem: &LpProblem, time_limit: Option<Duration>)
      -> Result<LpOutcome, Error>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn variable_names_are_generated_at_the_boundary() {
    assert_eq!(LpProblem::variable_name(17), "x17");
  }
}
