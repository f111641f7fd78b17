/*!

  Bound tightenings and piecewise-linear case splits.

  A `Tightening` proposes narrowing one side of a variable's interval; it
  takes effect only if strictly tighter than the current bound. A
  `CaseSplit` is the conjunction of bound tightenings and equations that
  constitutes one phase of a piecewise-linear relation; applying it
  tightens bounds and adds equations atomically.

*/

use std::fmt::{Display, Formatter};

use itertools::Itertools;

use crate::equation::Equation;
use crate::Variable;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum BoundKind {
  Lower,
  Upper,
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Tightening {
  pub variable: Variable,
  pub value   : f64,
  pub kind    : BoundKind,
}

impl Tightening {
  pub fn lower(variable: Variable, value: f64) -> Self {
    Tightening { variable, value, kind: BoundKind::Lower }
  }

  pub fn upper(variable: Variable, value: f64) -> Self {
    Tightening { variable, value, kind: BoundKind::Upper }
  }
}

impl Display for Tightening {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self.kind {
      BoundKind::Lower => write!(f, "x{} >= {}", self.variable, self.value),
      BoundKind::Upper => write!(f, "x{} <= {}", self.variable, self.value),
    }
  }
}

#[derive(Clone, PartialEq, Debug, Default)]
pub struct CaseSplit {
  bound_tightenings: Vec<Tightening>,
  equations        : Vec<Equation>,
}

impl CaseSplit {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn store_bound_tightening(&mut self, tightening: Tightening) {
    self.bound_tightenings.push(tightening);
  }

  pub fn add_equation(&mut self, equation: Equation) {
    self.equations.push(equation);
  }

  pub fn bound_tightenings(&self) -> &[Tightening] {
    &self.bound_tightenings
  }

  pub fn equations(&self) -> &[Equation] {
    &self.equations
  }

  pub fn update_variable_index(&mut self, old_index: Variable, new_index: Variable) {
    for tightening in self.bound_tightenings.iter_mut() {
      if tightening.variable == old_index {
        tightening.variable = new_index;
      }
    }
    for equation in self.equations.iter_mut() {
      equation.update_variable_index(old_index, new_index);
    }
  }

  /// Every variable mentioned by a bound or an equation addend.
  pub fn mentioned_variables(&self) -> Vec<Variable> {
    let mut variables: Vec<Variable> = self.bound_tightenings
                                           .iter()
                                           .map(|t| t.variable)
                                           .collect();
    for equation in &self.equations {
      variables.extend(equation.addends.iter().map(|(_, v)| *v));
    }
    variables.sort_unstable();
    variables.dedup();
    variables
  }
}

impl Display for CaseSplit {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let bounds = self.bound_tightenings.iter().map(|t| t.to_string()).join(", ");
    let equations = self.equations.iter().map(|e| e.to_string()).join(", ");
    write!(f, "[{}; {}]", bounds, equations)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::equation::Relation;

  #[test]
  fn mentioned_variables_are_deduplicated_and_sorted() {
    let mut split = CaseSplit::new();
    split.store_bound_tightening(Tightening::lower(3, 0.0));
    split.store_bound_tightening(Tightening::upper(1, 2.0));

    let mut eq = Equation::new(Relation::Eq);
    eq.add_addend(1.0, 3);
    eq.add_addend(-1.0, 0);
    split.add_equation(eq);

    assert_eq!(split.mentioned_variables(), vec![0, 1, 3]);
  }

  #[test]
  fn reindexing_touches_bounds_and_equations() {
    let mut split = CaseSplit::new();
    split.store_bound_tightening(Tightening::lower(2, 1.0));
    let mut eq = Equation::new(Relation::Eq);
    eq.add_addend(1.0, 2);
    split.add_equation(eq);

    split.update_variable_index(2, 9);
    assert_eq!(split.bound_tightenings()[0].variable, 9);
    assert_eq!(split.equations()[0].addends[0].1, 9);
  }
}
