/*!

  Symbolic linear rows: `Equation` for the constraint pool and
  `LinearExpr` for cost expressions.

  An `Equation` is `sum( coefficient * variable ) <relation> scalar`,
  stored as a list of addends plus a scalar and a relation tag. A
  `LinearExpr` is a mapping from variable to coefficient plus a constant,
  and is what the SoI machinery sums cost components into.

*/

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use itertools::Itertools;

use crate::Variable;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum Relation {
  Eq,
  Le,
  Ge,
}

#[derive(Clone, PartialEq, Debug, Default)]
pub struct Equation {
  pub addends : Vec<(f64, Variable)>,
  pub scalar  : f64,
  pub relation: Relation,
}

impl Default for Relation {
  fn default() -> Self {
    Relation::Eq
  }
}

impl Equation {
  pub fn new(relation: Relation) -> Self {
    Equation {
      addends: Vec::new(),
      scalar: 0.0,
      relation,
    }
  }

  pub fn add_addend(&mut self, coefficient: f64, variable: Variable) {
    self.addends.push((coefficient, variable));
  }

  pub fn set_scalar(&mut self, scalar: f64) {
    self.scalar = scalar;
  }

  pub fn participates(&self, variable: Variable) -> bool {
    self.addends.iter().any(|(_, v)| *v == variable)
  }

  /// Left-hand side value under `assignment`.
  pub fn evaluate_lhs(&self, assignment: &[f64]) -> f64 {
    self.addends.iter().map(|(c, v)| c * assignment[*v]).sum()
  }

  /// Replaces `variable` with the fixed `value`, folding its contribution
  /// into the scalar.
  pub fn eliminate_variable(&mut self, variable: Variable, value: f64) {
    let mut folded = 0.0;
    for (c, v) in &self.addends {
      if *v == variable {
        folded += c * value;
      }
    }
    self.addends.retain(|(_, v)| *v != variable);
    self.scalar -= folded;
  }

  pub fn update_variable_index(&mut self, old_index: Variable, new_index: Variable) {
    for (_, v) in self.addends.iter_mut() {
      if *v == old_index {
        *v = new_index;
      }
    }
  }
}

impl Display for Equation {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let lhs = self.addends
                  .iter()
                  .map(|(c, v)| format!("{}*x{}", c, v))
                  .join(" + ");
    let relation = match self.relation {
      Relation::Eq => "=",
      Relation::Le => "<=",
      Relation::Ge => ">=",
    };
    write!(f, "{} {} {}", lhs, relation, self.scalar)
  }
}

/// `sum( coefficient * variable ) + constant`. Zero coefficients are
/// dropped eagerly so that the addend set always names exactly the
/// variables with live cost terms.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct LinearExpr {
  pub addends : BTreeMap<Variable, f64>,
  pub constant: f64,
}

impl LinearExpr {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn coefficient(&self, variable: Variable) -> f64 {
    self.addends.get(&variable).copied().unwrap_or(0.0)
  }

  pub fn add_to_coefficient(&mut self, variable: Variable, delta: f64) {
    let updated = self.coefficient(variable) + delta;
    if updated == 0.0 {
      self.addends.remove(&variable);
    } else {
      self.addends.insert(variable, updated);
    }
  }

  pub fn add_constant(&mut self, delta: f64) {
    self.constant += delta;
  }

  pub fn is_empty(&self) -> bool {
    self.addends.is_empty() && self.constant == 0.0
  }

  pub fn evaluate(&self, assignment: &[f64]) -> f64 {
    let mut result = self.constant;
    for (variable, coefficient) in &self.addends {
      result += coefficient * assignment[*variable];
    }
    result
  }
}

impl Display for LinearExpr {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let body = self.addends
                   .iter()
                   .map(|(v, c)| format!("{:.2} x{}", c, v))
                   .join(" + ");
    if self.constant == 0.0 {
      write!(f, "{}", body)
    } else {
      write!(f, "{} + {:.2}", body, self.constant)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn evaluates_lhs() {
    let mut eq = Equation::new(Relation::Le);
    eq.add_addend(2.0, 0);
    eq.add_addend(-1.0, 2);
    eq.set_scalar(5.0);
    assert_eq!(eq.evaluate_lhs(&[1.0, 0.0, 3.0]), -1.0);
  }

  #[test]
  fn eliminating_a_variable_folds_into_the_scalar() {
    let mut eq = Equation::new(Relation::Eq);
    eq.add_addend(1.0, 0);
    eq.add_addend(3.0, 1);
    eq.set_scalar(10.0);
    eq.eliminate_variable(1, 2.0);
    assert_eq!(eq.addends, vec![(1.0, 0)]);
    assert_eq!(eq.scalar, 4.0);
  }

  #[test]
  fn linear_expr_drops_zeroed_addends() {
    let mut expr = LinearExpr::new();
    expr.add_to_coefficient(4, 1.0);
    expr.add_to_coefficient(4, -1.0);
    assert!(expr.is_empty());
  }

  #[test]
  fn linear_expr_evaluates_with_constant() {
    let mut expr = LinearExpr::new();
    expr.add_to_coefficient(0, 1.0);
    expr.add_to_coefficient(1, -1.0);
    expr.add_constant(0.5);
    assert_eq!(expr.evaluate(&[2.0, 1.0]), 1.5);
  }
}
