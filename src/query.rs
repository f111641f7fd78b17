/*!

  The satisfiability query: variables with interval bounds, linear
  equations, and piecewise-linear constraints.

  Queries serialize to a plain text format for dumping and for handing
  subqueries to workers:

  - header line `N,M` (variables, equations),
  - `N` bound lines `v,lo,hi` (`inf`/`-inf` for missing bounds),
  - `M` equation lines `type,n_addends,coef,var,...,scalar` with
    `type` one of `e`, `l`, `g`,
  - one line per piecewise-linear constraint in its own serialized form.

*/

use itertools::Itertools;

use crate::constraints::{
  AbsoluteValueConstraint,
  ClipConstraint,
  DisjunctionConstraint,
  MaxConstraint,
  PiecewiseLinear,
  ReluConstraint,
  SignConstraint,
};
use crate::equation::{Equation, Relation};
use crate::errors::Error;
use crate::float_utils;
use crate::Variable;

#[derive(Clone, Default)]
pub struct Query {
  lower_bounds: Vec<f64>,
  upper_bounds: Vec<f64>,
  equations   : Vec<Equation>,
  constraints : Vec<Box<dyn PiecewiseLinear>>,
  input_variables  : Vec<Variable>,
  integer_variables: Vec<Variable>,
}

impl Query {
  pub fn new(number_of_variables: usize) -> Self {
    Query {
      lower_bounds: vec![float_utils::negative_infinity(); number_of_variables],
      upper_bounds: vec![float_utils::infinity(); number_of_variables],
      equations   : Vec::new(),
      constraints : Vec::new(),
      input_variables  : Vec::new(),
      integer_variables: Vec::new(),
    }
  }

  pub fn number_of_variables(&self) -> usize {
    self.lower_bounds.len()
  }

  pub fn add_variable(&mut self) -> Variable {
    self.lower_bounds.push(float_utils::negative_infinity());
    self.upper_bounds.push(float_utils::infinity());
    self.lower_bounds.len() - 1
  }

  pub fn lower_bound(&self, variable: Variable) -> f64 {
    self.lower_bounds[variable]
  }

  pub fn upper_bound(&self, variable: Variable) -> f64 {
    self.upper_bounds[variable]
  }

  pub fn set_lower_bound(&mut self, variable: Variable, value: f64) {
    self.lower_bounds[variable] = value;
  }

  pub fn set_upper_bound(&mut self, variable: Variable, value: f64) {
    self.upper_bounds[variable] = value;
  }

  /// Narrows the stored bound only if `value` is tighter.
  pub fn tighten_lower_bound(&mut self, variable: Variable, value: f64) {
    if value > self.lower_bounds[variable] {
      self.lower_bounds[variable] = value;
    }
  }

  pub fn tighten_upper_bound(&mut self, variable: Variable, value: f64) {
    if value < self.upper_bounds[variable] {
      self.upper_bounds[variable] = value;
    }
  }

  pub fn add_equation(&mut self, equation: Equation) {
    self.equations.push(equation);
  }

  pub fn equations(&self) -> &[Equation] {
    &self.equations
  }

  pub fn equations_mut(&mut self) -> &mut Vec<Equation> {
    &mut self.equations
  }

  pub fn add_constraint(&mut self, constraint: Box<dyn PiecewiseLinear>) {
    self.constraints.push(constraint);
  }

  pub fn constraints(&self) -> &[Box<dyn PiecewiseLinear>] {
    &self.constraints
  }

  pub fn constraints_mut(&mut self) -> &mut Vec<Box<dyn PiecewiseLinear>> {
    &mut self.constraints
  }

  pub fn take_constraints(&mut self) -> Vec<Box<dyn PiecewiseLinear>> {
    std::mem::take(&mut self.constraints)
  }

  pub fn mark_input_variable(&mut self, variable: Variable) {
    if !self.input_variables.contains(&variable) {
      self.input_variables.push(variable);
    }
  }

  pub fn input_variables(&self) -> &[Variable] {
    &self.input_variables
  }

  /// Flags a variable as integer-valued. Integrality is encoded through
  /// a disjunction over the integer points of its interval during
  /// preprocessing; the variable must carry finite bounds by then.
  pub fn mark_integer_variable(&mut self, variable: Variable) {
    if !self.integer_variables.contains(&variable) {
      self.integer_variables.push(variable);
    }
  }

  pub fn integer_variables(&self) -> &[Variable] {
    &self.integer_variables
  }

  // region Text format

  pub fn dump(&self) -> String {
    let mut lines = Vec::new();
    lines.push(format!("{},{}", self.number_of_variables(), self.equations.len()));

    for variable in 0..self.number_of_variables() {
      lines.push(format!("{},{},{}",
                         variable,
                         format_bound(self.lower_bounds[variable]),
                         format_bound(self.upper_bounds[variable])));
    }

    for equation in &self.equations {
      let relation = match equation.relation {
        Relation::Eq => "e",
        Relation::Le => "l",
        Relation::Ge => "g",
      };
      let addends = equation.addends
                            .iter()
                            .map(|(c, v)| format!("{},{}", c, v))
                            .join(",");
      lines.push(format!("{},{},{},{}", relation, equation.addends.len(), addends, equation.scalar));
    }

    for constraint in &self.constraints {
      lines.push(constraint.serialize_to_string());
    }

    lines.join("\n")
  }

  pub fn parse(text: &str) -> Result<Query, Error> {
    let mut lines = text.lines()
                        .enumerate()
                        .map(|(i, l)| (i + 1, l.trim()))
                        .filter(|(_, l)| !l.is_empty());

    let (line_number, header) = lines.next()
                                     .ok_or_else(|| malformed(0, "empty query"))?;
    let header_tokens: Vec<&str> = header.split(',').collect();
    if header_tokens.len() != 2 {
      return Err(malformed(line_number, "header must be `N,M`"));
    }
    let variable_count = parse_usize(header_tokens[0], line_number)?;
    let equation_count = parse_usize(header_tokens[1], line_number)?;

    let mut query = Query::new(variable_count);

    for _ in 0..variable_count {
      let (line_number, line) = lines.next()
                                     .ok_or_else(|| malformed(0, "missing bound line"))?;
      let tokens: Vec<&str> = line.split(',').collect();
      if tokens.len() != 3 {
        return Err(malformed(line_number, "bound line must be `v,lo,hi`"));
      }
      let variable = parse_usize(tokens[0], line_number)?;
      if variable >= variable_count {
        return Err(malformed(line_number, "bound line names an unknown variable"));
      }
      query.set_lower_bound(variable, parse_f64(tokens[1], line_number)?);
      query.set_upper_bound(variable, parse_f64(tokens[2], line_number)?);
    }

    for _ in 0..equation_count {
      let (line_number, line) = lines.next()
                                     .ok_or_else(|| malformed(0, "missing equation line"))?;
      query.add_equation(parse_equation_line(line, line_number)?);
    }

    for (line_number, line) in lines {
      query.add_constraint(parse_constraint_line(line, line_number)?);
    }

    Ok(query)
  }

  // endregion
}

fn format_bound(value: f64) -> String {
  if value == f64::INFINITY {
    "inf".to_string()
  } else if value == f64::NEG_INFINITY {
    "-inf".to_string()
  } else {
    value.to_string()
  }
}

fn malformed(line: usize, reason: &str) -> Error {
  Error::MalformedQuery { line, reason: reason.to_string() }
}

fn parse_usize(token: &str, line: usize) -> Result<usize, Error> {
  token.trim()
       .parse::<usize>()
       .map_err(|_| malformed(line, &format!("bad integer `{}`", token)))
}

fn parse_f64(token: &str, line: usize) -> Result<f64, Error> {
  token.trim()
       .parse::<f64>()
       .map_err(|_| malformed(line, &format!("bad scalar `{}`", token)))
}

fn parse_equation_line(line: &str, line_number: usize) -> Result<Equation, Error> {
  let tokens: Vec<&str> = line.split(',').collect();
  if tokens.len() < 2 {
    return Err(malformed(line_number, "equation line too short"));
  }
  let relation = match tokens[0].trim() {
    "e" => Relation::Eq,
    "l" => Relation::Le,
    "g" => Relation::Ge,
    other => return Err(malformed(line_number, &format!("bad equation type `{}`", other))),
  };
  let addend_count = parse_usize(tokens[1], line_number)?;
  if tokens.len() != 2 + 2 * addend_count + 1 {
    return Err(malformed(line_number, "equation token count mismatch"));
  }

  let mut equation = Equation::new(relation);
  for i in 0..addend_count {
    let coefficient = parse_f64(tokens[2 + 2 * i], line_number)?;
    let variable = parse_usize(tokens[3 + 2 * i], line_number)?;
    equation.add_addend(coefficient, variable);
  }
  equation.set_scalar(parse_f64(tokens[2 + 2 * addend_count], line_number)?);
  Ok(equation)
}

/// Dispatches one serialized constraint line to the matching variant.
pub fn parse_constraint_line(line: &str, line_number: usize)
    -> Result<Box<dyn PiecewiseLinear>, Error> {
  let kind = line.split(',').next().unwrap_or("").trim();
  let wrap = |reason: String| Error::MalformedQuery { line: line_number, reason };

  match kind {
    "relu"          => Ok(Box::new(ReluConstraint::from_serialized(line).map_err(wrap)?)),
    "absoluteValue" => Ok(Box::new(AbsoluteValueConstraint::from_serialized(line).map_err(wrap)?)),
    "sign"          => Ok(Box::new(SignConstraint::from_serialized(line).map_err(wrap)?)),
    "clip"          => Ok(Box::new(ClipConstraint::from_serialized(line).map_err(wrap)?)),
    "max"           => Ok(Box::new(MaxConstraint::from_serialized(line).map_err(wrap)?)),
    "disj"          => Ok(Box::new(DisjunctionConstraint::from_serialized(line).map_err(wrap)?)),
    other           => Err(Error::UnsupportedConstraint(other.to_string())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_query() -> Query {
    let mut query = Query::new(2);
    query.set_lower_bound(0, -5.0);
    query.set_upper_bound(0, 5.0);
    query.set_lower_bound(1, 0.0);

    let mut equation = Equation::new(Relation::Eq);
    equation.add_addend(1.0, 0);
    equation.add_addend(-1.0, 1);
    equation.set_scalar(0.0);
    query.add_equation(equation);

    query.add_constraint(Box::new(ReluConstraint::new(0, 1)));
    query
  }

  #[test]
  fn dump_and_parse_round_trip() {
    let query = sample_query();
    let text = query.dump();

    let parsed = Query::parse(&text).unwrap();
    assert_eq!(parsed.number_of_variables(), 2);
    assert_eq!(parsed.lower_bound(0), -5.0);
    assert_eq!(parsed.upper_bound(1), f64::INFINITY);
    assert_eq!(parsed.equations().len(), 1);
    assert_eq!(parsed.constraints().len(), 1);
    assert_eq!(parsed.constraints()[0].serialize_to_string(), "relu,1,0");
  }

  #[test]
  fn infinite_bounds_use_inf_tokens() {
    let query = Query::new(1);
    let text = query.dump();
    assert!(text.contains("0,-inf,inf"));
  }

  #[test]
  fn cosine_lines_are_rejected_as_unsupported() {
    let text = "1,0\n0,-1,1\ncosine,0,0";
    match Query::parse(text) {
      Err(Error::UnsupportedConstraint(kind)) => assert_eq!(kind, "cosine"),
      other => panic!("expected unsupported-constraint error, got {:?}", other.map(|_| ())),
    }
  }

  #[test]
  fn malformed_equations_name_the_line() {
    let text = "1,1\n0,0,1\ne,2,1.0,0";
    match Query::parse(text) {
      Err(Error::MalformedQuery { line, .. }) => assert_eq!(line, 3),
      other => panic!("expected malformed-query error, got {:?}", other.map(|_| ())),
    }
  }

  #[test]
  fn cloning_deep_copies_constraints() {
    let query = sample_query();
    let clone = query.clone();
    assert_eq!(clone.constraints().len(), 1);
    assert_eq!(clone.constraints()[0].serialize_to_string(), "relu,1,0");
  }
}
