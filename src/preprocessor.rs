/*!

  Query preprocessing, run once before the engine installs anything.

  Three passes: constraints request their auxiliary variables and
  equations; variables fixed by equal bounds are folded out of the
  equation pool; trivial `x - y = 0` pairings merge the two variables.
  The returned `PreprocessInfo` reconstructs full assignments for
  variables the passes removed from the live problem.

*/

use crate::case_split::{CaseSplit, Tightening};
use crate::constraints::DisjunctionConstraint;
use crate::equation::Relation;
use crate::float_utils;
use crate::query::Query;
use crate::Variable;

use bit_set::BitSet;

/// How to rebuild values for variables the preprocessor removed from the
/// live problem.
#[derive(Clone, Debug, Default)]
pub struct PreprocessInfo {
  fixed      : Vec<Option<f64>>,
  merged_into: Vec<Option<Variable>>,
}

impl PreprocessInfo {
  fn new(number_of_variables: usize) -> Self {
    PreprocessInfo {
      fixed      : vec![None; number_of_variables],
      merged_into: vec![None; number_of_variables],
    }
  }

  fn grow_to(&mut self, number_of_variables: usize) {
    self.fixed.resize(number_of_variables, None);
    self.merged_into.resize(number_of_variables, None);
  }

  /// Follows merge chains to the surviving representative.
  fn representative(&self, variable: Variable) -> Variable {
    let mut current = variable;
    while let Some(next) = self.merged_into[current] {
      current = next;
    }
    current
  }

  /// Patches merged and fixed variables back into a solver assignment.
  pub fn restore_assignment(&self, assignment: &mut [f64]) {
    for variable in 0..assignment.len() {
      let representative = self.representative(variable);
      if representative != variable {
        assignment[variable] = assignment[representative];
      }
    }
    for (variable, value) in self.fixed.iter().enumerate() {
      if let Some(value) = value {
        assignment[variable] = *value;
      }
    }
  }
}

pub fn preprocess(query: &mut Query) -> PreprocessInfo {
  let mut info = PreprocessInfo::new(query.number_of_variables());

  encode_integer_variables(query);
  add_requested_aux_variables(query);
  info.grow_to(query.number_of_variables());

  eliminate_fixed_variables(query, &mut info);
  merge_trivial_equations(query, &mut info);

  // Constraints whose variables were folded away no longer constrain
  // anything.
  query.constraints_mut().retain(|constraint| !constraint.obsolete());

  info
}

/// Integer-valued variables become disjunctions over the integer points
/// of their (finite) interval.
fn encode_integer_variables(query: &mut Query) {
  for i in 0..query.integer_variables().len() {
    let variable = query.integer_variables()[i];
    let lower = query.lower_bound(variable).ceil();
    let upper = query.upper_bound(variable).floor();
    if !lower.is_finite() || !upper.is_finite() || lower > upper {
      continue;
    }

    let mut disjuncts = Vec::new();
    let mut point = lower;
    while point <= upper {
      let mut pin = CaseSplit::new();
      pin.store_bound_tightening(Tightening::lower(variable, point));
      pin.store_bound_tightening(Tightening::upper(variable, point));
      disjuncts.push(pin);
      point += 1.0;
    }
    query.add_constraint(Box::new(DisjunctionConstraint::new(disjuncts)));
  }
}

fn add_requested_aux_variables(query: &mut Query) {
  let mut constraints = query.take_constraints();
  for constraint in constraints.iter_mut() {
    constraint.transform_to_use_aux_variables(query);
  }
  for constraint in constraints {
    query.add_constraint(constraint);
  }
}

/// Folds variables pinned by equal bounds out of the equation pool. Only
/// variables watched by no piecewise-linear constraint are folded; for
/// the others the pinned bounds carry the information through search.
fn eliminate_fixed_variables(query: &mut Query, info: &mut PreprocessInfo) {
  let mut watched = BitSet::new();
  for constraint in query.constraints() {
    for variable in constraint.participating_variables() {
      watched.insert(variable);
    }
  }

  for variable in 0..query.number_of_variables() {
    let lower = query.lower_bound(variable);
    let upper = query.upper_bound(variable);
    if !float_utils::are_equal(lower, upper, float_utils::EPSILON) {
      continue;
    }
    if watched.contains(variable) || query.input_variables().contains(&variable) {
      continue;
    }

    for equation in query.equations_mut().iter_mut() {
      equation.eliminate_variable(variable, lower);
    }
    info.fixed[variable] = Some(lower);
  }

  query.equations_mut().retain(|equation| !equation.addends.is_empty());
}

/// Merges `x - y = 0` pairs by rewriting `y` to `x` everywhere. Inputs
/// are kept as the surviving representative where possible.
fn merge_trivial_equations(query: &mut Query, info: &mut PreprocessInfo) {
  loop {
    let candidate = query.equations().iter().position(|equation| {
      equation.relation == Relation::Eq
        && equation.scalar == 0.0
        && equation.addends.len() == 2
        && equation.addends[0].0 == -equation.addends[1].0
        && equation.addends[0].0 != 0.0
    });

    let index = match candidate {
      Some(index) => index,
      None => return,
    };

    let (_, first) = query.equations()[index].addends[0];
    let (_, second) = query.equations()[index].addends[1];
    query.equations_mut().remove(index);
    if first == second {
      continue;
    }

    // Keep the input variable alive; otherwise keep the smaller index.
    let inputs = query.input_variables();
    let (kept, removed) = if inputs.contains(&second) && !inputs.contains(&first) {
      (second, first)
    } else if first <= second {
      (first, second)
    } else {
      (second, first)
    };
    if inputs.contains(&removed) {
      // Both are inputs; leave such equations to the LP.
      continue;
    }

    // The survivor inherits the intersection of both intervals.
    let lower = query.lower_bound(kept).max(query.lower_bound(removed));
    let upper = query.upper_bound(kept).min(query.upper_bound(removed));
    query.set_lower_bound(kept, lower);
    query.set_upper_bound(kept, upper);
    query.set_lower_bound(removed, lower);
    query.set_upper_bound(removed, upper);

    for equation in query.equations_mut().iter_mut() {
      equation.update_variable_index(removed, kept);
    }
    for constraint in query.constraints_mut().iter_mut() {
      constraint.update_variable_index(removed, kept);
    }
    info.merged_into[removed] = Some(kept);
  }
}
