/*!

  A dense bounded-variable primal simplex, the bundled `LpSolver`.

  Two phases: phase 1 drives per-row artificial variables to zero to find
  a basic feasible solution (a positive optimum means the relaxation is
  infeasible); phase 2 minimizes the real objective with the artificials
  pinned at zero. Entering variables are chosen by Bland's rule, so the
  iteration terminates without anti-cycling machinery. The basis system
  is re-solved densely each iteration; the relaxations this solver sees
  stay small enough that factorization reuse does not pay for itself.

*/

use std::time::{Duration, Instant};

use crate::equation::Relation;
use crate::errors::Error;
use crate::lp::{LpOutcome, LpProblem, LpSolver, LpStatus};

const PIVOT_TOLERANCE      : f64 = 1e-9;
const FEASIBILITY_TOLERANCE: f64 = 1e-7;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum VarState {
  Basic(usize),
  AtLower,
  AtUpper,
  Free,
}

#[derive(Default)]
pub struct DenseSimplex {
  // Column data for the expanded problem: structurals, slacks,
  // artificials, in that order.
  lower : Vec<f64>,
  upper : Vec<f64>,
  cost  : Vec<f64>,
  rows  : Vec<Vec<f64>>,
  rhs   : Vec<f64>,
  values: Vec<f64>,
  state : Vec<VarState>,
  basis : Vec<usize>,

  structural_count: usize,
  enterable_count : usize,
  pivots          : u64,
}

impl DenseSimplex {
  pub fn new() -> Self {
    Self::default()
  }

  fn install(&mut self, problem: &LpProblem) {
    let n = problem.number_of_variables();
    let m = problem.equations.len();

    self.lower = problem.lower.clone();
    self.upper = problem.upper.clone();
    self.cost = vec![0.0; n];
    for (variable, coefficient) in &problem.objective.addends {
      self.cost[*variable] = *coefficient;
    }

    self.rows = vec![vec![0.0; n]; m];
    self.rhs = vec![0.0; m];
    for (i, equation) in problem.equations.iter().enumerate() {
      for (coefficient, variable) in &equation.addends {
        self.rows[i][*variable] += coefficient;
      }
      self.rhs[i] = equation.scalar;
    }

    self.structural_count = n;

    // Slack columns turn inequalities into equalities.
    for (i, equation) in problem.equations.iter().enumerate() {
      match equation.relation {
        Relation::Eq => {}
        Relation::Le => {
          let slack = self.add_column(0.0, f64::INFINITY, 0.0);
          self.rows[i][slack] = 1.0;
        }
        Relation::Ge => {
          let slack = self.add_column(f64::NEG_INFINITY, 0.0, 0.0);
          self.rows[i][slack] = 1.0;
        }
      }
    }

    // Artificials may not re-enter the basis during phase 2.
    self.enterable_count = self.lower.len();

    // Start every non-artificial column at a finite bound (or at zero
    // when unbounded on both sides).
    self.values = vec![0.0; self.lower.len()];
    self.state = vec![VarState::AtLower; self.lower.len()];
    for j in 0..self.lower.len() {
      if self.lower[j].is_finite() {
        self.values[j] = self.lower[j];
        self.state[j] = VarState::AtLower;
      } else if self.upper[j].is_finite() {
        self.values[j] = self.upper[j];
        self.state[j] = VarState::AtUpper;
      } else {
        self.values[j] = 0.0;
        self.state[j] = VarState::Free;
      }
    }

    // One artificial per row carries the residual and forms the initial
    // (identity) basis.
    self.basis = Vec::with_capacity(m);
    for i in 0..m {
      let mut residual = self.rhs[i];
      for j in 0..self.lower.len() {
        residual -= self.rows[i][j] * self.values[j];
      }
      let artificial = if residual >= 0.0 {
        self.add_column(0.0, f64::INFINITY, 0.0)
      } else {
        self.add_column(f64::NEG_INFINITY, 0.0, 0.0)
      };
      self.rows[i][artificial] = 1.0;
      self.values.push(residual);
      self.state.push(VarState::Basic(i));
      self.basis.push(artificial);
    }
  }

  /// Appends a column to the expanded problem. The caller is responsible
  /// for the column's value/state entries.
  fn add_column(&mut self, lower: f64, upper: f64, cost: f64) -> usize {
    self.lower.push(lower);
    self.upper.push(upper);
    self.cost.push(cost);
    for row in self.rows.iter_mut() {
      row.push(0.0);
    }
    self.lower.len() - 1
  }

  /// Solves `B x = rhs` for the current basis, densely with partial
  /// pivoting. Returns `None` on a singular basis.
  fn solve_basis(&self, rhs: &[f64], transposed: bool) -> Option<Vec<f64>> {
    let m = self.basis.len();
    let mut matrix = vec![vec![0.0; m]; m];
    for (column, &j) in self.basis.iter().enumerate() {
      for row in 0..m {
        if transposed {
          matrix[column][row] = self.rows[row][j];
        } else {
          matrix[row][column] = self.rows[row][j];
        }
      }
    }

    let mut augmented = rhs.to_vec();
    // Forward elimination.
    for pivot_row in 0..m {
      let mut best = pivot_row;
      for candidate in pivot_row + 1..m {
        if matrix[candidate][pivot_row].abs() > matrix[best][pivot_row].abs() {
          best = candidate;
        }
      }
      if matrix[best][pivot_row].abs() < PIVOT_TOLERANCE {
        return None;
      }
      matrix.swap(pivot_row, best);
      augmented.swap(pivot_row, best);

      for lower_row in pivot_row + 1..m {
        let factor = matrix[lower_row][pivot_row] / matrix[pivot_row][pivot_row];
        if factor == 0.0 {
          continue;
        }
        for column in pivot_row..m {
          matrix[lower_row][column] -= factor * matrix[pivot_row][column];
        }
        augmented[lower_row] -= factor * augmented[pivot_row];
      }
    }

    // Back substitution.
    let mut solution = vec![0.0; m];
    for row in (0..m).rev() {
      let mut value = augmented[row];
      for column in row + 1..m {
        value -= matrix[row][column] * solution[column];
      }
      solution[row] = value / matrix[row][row];
    }
    Some(solution)
  }

  /// Runs the simplex iteration on the installed problem with the given
  /// per-column costs. Returns the status reached.
  fn iterate(&mut self, costs: &[f64], deadline: Option<Instant>) -> Result<LpStatus, Error> {
    let m = self.basis.len();
    let iteration_cap = 10_000 + 100 * (self.lower.len() + m);

    for _ in 0..iteration_cap {
      if let Some(deadline) = deadline {
        if Instant::now() >= deadline {
          return Ok(LpStatus::TimedOut);
        }
      }

      // Duals: y B = c_B.
      let basic_costs: Vec<f64> = self.basis.iter().map(|&j| costs[j]).collect();
      let duals = match self.solve_basis(&basic_costs, true) {
        Some(duals) => duals,
        None => return Err(Error::LpBackend("singular basis".to_string())),
      };

      // Entering column by Bland's rule.
      let mut entering = None;
      for j in 0..self.enterable_count {
        if matches!(self.state[j], VarState::Basic(_)) {
          continue;
        }
        let mut reduced = costs[j];
        for i in 0..m {
          reduced -= duals[i] * self.rows[i][j];
        }
        let eligible = match self.state[j] {
          VarState::AtLower => reduced < -PIVOT_TOLERANCE,
          VarState::AtUpper => reduced > PIVOT_TOLERANCE,
          VarState::Free    => reduced.abs() > PIVOT_TOLERANCE,
          VarState::Basic(_) => false,
        };
        if eligible {
          entering = Some((j, reduced));
          break;
        }
      }

      let (entering, reduced) = match entering {
        Some(pair) => pair,
        None => return Ok(LpStatus::Optimal),
      };

      // Direction of change for the entering variable.
      let sigma: f64 = match self.state[entering] {
        VarState::AtLower => 1.0,
        VarState::AtUpper => -1.0,
        VarState::Free    => if reduced < 0.0 { 1.0 } else { -1.0 },
        VarState::Basic(_) => unreachable!(),
      };

      // Basic response: B w = A_entering.
      let entering_column: Vec<f64> = (0..m).map(|i| self.rows[i][entering]).collect();
      let w = match self.solve_basis(&entering_column, false) {
        Some(w) => w,
        None => return Err(Error::LpBackend("singular basis".to_string())),
      };

      // Ratio test; the entering variable's own opposite bound competes
      // with the basics.
      let own_limit = if sigma > 0.0 {
        self.upper[entering] - self.values[entering]
      } else {
        self.values[entering] - self.lower[entering]
      };
      let mut step = own_limit;
      let mut blocking: Option<usize> = None;

      for i in 0..m {
        let basic = self.basis[i];
        let delta = sigma * w[i];
        let limit = if delta > PIVOT_TOLERANCE {
          if self.lower[basic].is_finite() {
            (self.values[basic] - self.lower[basic]) / delta
          } else {
            f64::INFINITY
          }
        } else if delta < -PIVOT_TOLERANCE {
          if self.upper[basic].is_finite() {
            (self.upper[basic] - self.values[basic]) / -delta
          } else {
            f64::INFINITY
          }
        } else {
          f64::INFINITY
        };

        // Bland tie-break: keep the blocking variable with the smallest
        // index.
        if limit < step - PIVOT_TOLERANCE
           || (limit < step + PIVOT_TOLERANCE
               && blocking.map_or(false, |current| basic < self.basis[current])) {
          step = limit;
          blocking = Some(i);
        }
      }

      if step.is_infinite() {
        return Ok(LpStatus::Unbounded);
      }
      let step = step.max(0.0);

      // Move.
      self.values[entering] += sigma * step;
      for i in 0..m {
        let basic = self.basis[i];
        self.values[basic] -= sigma * w[i] * step;
      }

      match blocking {
        None => {
          // Bound-to-bound move; entering stays nonbasic on the other
          // side.
          self.state[entering] = if sigma > 0.0 {
            VarState::AtUpper
          } else {
            VarState::AtLower
          };
        }
        Some(row) => {
          let leaving = self.basis[row];
          let delta = sigma * w[row];
          self.state[leaving] = if delta > 0.0 {
            self.values[leaving] = self.lower[leaving];
            VarState::AtLower
          } else {
            self.values[leaving] = self.upper[leaving];
            VarState::AtUpper
          };
          self.basis[row] = entering;
          self.state[entering] = VarState::Basic(row);
          self.pivots += 1;
        }
      }
    }

    Err(Error::LpBackend("simplex iteration cap exceeded".to_string()))
  }

  fn phase_one_costs(&self) -> Vec<f64> {
    let mut costs = vec![0.0; self.lower.len()];
    for j in self.enterable_count..self.lower.len() {
      // Artificials at [0, inf) cost +1; the mirrored ones cost -1, so
      // the phase-1 objective is the total residual magnitude.
      costs[j] = if self.lower[j] == 0.0 { 1.0 } else { -1.0 };
    }
    costs
  }

  fn phase_one_objective(&self) -> f64 {
    let mut total = 0.0;
    for j in self.enterable_count..self.lower.len() {
      total += self.values[j].abs();
    }
    total
  }
}

impl LpSolver for DenseSimplex {
  fn solve(&mut self, problem: &LpProblem, time_limit: Option<Duration>)
      -> Result<LpOutcome, Error> {
    let deadline = time_limit.map(|limit| Instant::now() + limit);

    self.pivots = 0;
    self.install(problem);

    // Phase 1: drive the artificials to zero.
    let phase_one = self.phase_one_costs();
    match self.iterate(&phase_one, deadline)? {
      LpStatus::TimedOut => {
        return Ok(LpOutcome {
          status: LpStatus::TimedOut,
          assignment: Vec::new(),
          objective_value: 0.0,
          pivots: self.pivots,
        });
      }
      LpStatus::Unbounded => {
        return Err(Error::LpBackend("phase-1 objective unbounded".to_string()));
      }
      _ => {}
    }

    if self.phase_one_objective() > FEASIBILITY_TOLERANCE {
      return Ok(LpOutcome {
        status: LpStatus::Infeasible,
        assignment: Vec::new(),
        objective_value: 0.0,
        pivots: self.pivots,
      });
    }

    // Pin the artificials at zero for phase 2.
    for j in self.enterable_count..self.lower.len() {
      self.lower[j] = 0.0;
      self.upper[j] = 0.0;
      self.values[j] = 0.0;
    }

    let costs = self.cost.clone();
    let status = match self.iterate(&costs, deadline)? {
      LpStatus::TimedOut  => LpStatus::TimedOut,
      LpStatus::Unbounded => LpStatus::Unbounded,
      _                   => LpStatus::Optimal,
    };

    let assignment: Vec<f64> = self.values[..self.structural_count].to_vec();
    let objective_value = problem.objective.evaluate(&assignment);

    Ok(LpOutcome {
      status,
      assignment,
      objective_value,
      pivots: self.pivots,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::equation::{Equation, LinearExpr, Relation};

  fn problem(lower: Vec<f64>, upper: Vec<f64>) -> LpProblem {
    LpProblem {
      lower,
      upper,
      equations: Vec::new(),
      objective: LinearExpr::new(),
    }
  }

  #[test]
  fn pure_box_problem_minimizes_at_the_bounds() {
    let mut p = problem(vec![1.0, -2.0], vec![4.0, 3.0]);
    p.objective.add_to_coefficient(0, 1.0);
    p.objective.add_to_coefficient(1, -1.0);

    let outcome = DenseSimplex::new().solve(&p, None).unwrap();
    assert_eq!(outcome.status, LpStatus::Optimal);
    assert!((outcome.assignment[0] - 1.0).abs() < 1e-6);
    assert!((outcome.assignment[1] - 3.0).abs() < 1e-6);
    assert!((outcome.objective_value - (-2.0)).abs() < 1e-6);
  }

  #[test]
  fn equality_rows_are_honored() {
    // x0 + x1 = 4, 0 <= x0 <= 10, 0 <= x1 <= 1, minimize x0.
    let mut p = problem(vec![0.0, 0.0], vec![10.0, 1.0]);
    let mut eq = Equation::new(Relation::Eq);
    eq.add_addend(1.0, 0);
    eq.add_addend(1.0, 1);
    eq.set_scalar(4.0);
    p.equations.push(eq);
    p.objective.add_to_coefficient(0, 1.0);

    let outcome = DenseSimplex::new().solve(&p, None).unwrap();
    assert_eq!(outcome.status, LpStatus::Optimal);
    assert!((outcome.assignment[0] - 3.0).abs() < 1e-6);
    assert!((outcome.assignment[1] - 1.0).abs() < 1e-6);
  }

  #[test]
  fn crossing_constraints_are_reported_infeasible() {
    // x0 + x1 <= 0 and x0 + x1 >= 1 with x0, x1 in [0, 1].
    let mut p = problem(vec![0.0, 0.0], vec![1.0, 1.0]);
    let mut le = Equation::new(Relation::Le);
    le.add_addend(1.0, 0);
    le.add_addend(1.0, 1);
    le.set_scalar(0.0);
    p.equations.push(le);
    let mut ge = Equation::new(Relation::Ge);
    ge.add_addend(1.0, 0);
    ge.add_addend(1.0, 1);
    ge.set_scalar(1.0);
    p.equations.push(ge);

    let outcome = DenseSimplex::new().solve(&p, None).unwrap();
    assert_eq!(outcome.status, LpStatus::Infeasible);
  }

  #[test]
  fn inequalities_bind_in_the_optimizing_direction() {
    // Maximize x0 (minimize -x0) subject to 2 x0 <= 6, x0 in [0, 10].
    let mut p = problem(vec![0.0], vec![10.0]);
    let mut le = Equation::new(Relation::Le);
    le.add_addend(2.0, 0);
    le.set_scalar(6.0);
    p.equations.push(le);
    p.objective.add_to_coefficient(0, -1.0);

    let outcome = DenseSimplex::new().solve(&p, None).unwrap();
    assert_eq!(outcome.status, LpStatus::Optimal);
    assert!((outcome.assignment[0] - 3.0).abs() < 1e-6);
  }

  #[test]
  fn free_variables_are_supported() {
    // x0 free, x0 + x1 = 2, x1 in [5, 5]: forces x0 = -3.
    let mut p = problem(vec![f64::NEG_INFINITY, 5.0], vec![f64::INFINITY, 5.0]);
    let mut eq = Equation::new(Relation::Eq);
    eq.add_addend(1.0, 0);
    eq.add_addend(1.0, 1);
    eq.set_scalar(2.0);
    p.equations.push(eq);

    let outcome = DenseSimplex::new().solve(&p, None).unwrap();
    assert_eq!(outcome.status, LpStatus::Optimal);
    assert!((outcome.assignment[0] + 3.0).abs() < 1e-6);
  }

  #[test]
  fn unbounded_objective_is_detected() {
    // Minimize x0 with x0 free and no rows.
    let mut p = problem(vec![f64::NEG_INFINITY], vec![f64::INFINITY]);
    p.objective.add_to_coefficient(0, 1.0);

    let outcome = DenseSimplex::new().solve(&p, None).unwrap();
    assert_eq!(outcome.status, LpStatus::Unbounded);
  }
}
