/*!

  Parameters governing how the solver functions.

  A `Config` is built once, optionally overlaid with overrides from a
  JSON parameters file, and passed into the engine constructor. Derived
  components receive only the fields they use; nothing here is global
  state.

*/

use std::fs::read_to_string;
use std::path::Path;
use std::str::FromStr;

use json::parse as parse_json;

use crate::errors::Error;

// region Strategy enums

/// How the engine picks the constraint to branch on.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum BranchingHeuristic {
  EarliestRelu,
  Polarity,
  LargestInterval,
  ReluViolation,
  PseudoImpact,
}

/// How the divide-and-conquer manager partitions a query.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum DivideStrategy {
  LargestInterval,
  Polarity,
  EarliestRelu,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum SoiSearchStrategy {
  Mcmc,
  Walksat,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum SoiInitStrategy {
  InputAssignment,
  CurrentAssignment,
  Random,
}

impl FromStr for BranchingHeuristic {
  type Err = Error;

  fn from_str(name: &str) -> Result<Self, Error> {
    match name {
      "earliest-relu"    => Ok(BranchingHeuristic::EarliestRelu),
      "polarity"         => Ok(BranchingHeuristic::Polarity),
      "largest-interval" => Ok(BranchingHeuristic::LargestInterval),
      "relu-violation"   => Ok(BranchingHeuristic::ReluViolation),
      "pseudo-impact"    => Ok(BranchingHeuristic::PseudoImpact),
      _                  => Err(Error::UnknownStrategy(name.to_string())),
    }
  }
}

impl FromStr for DivideStrategy {
  type Err = Error;

  fn from_str(name: &str) -> Result<Self, Error> {
    match name {
      "largest-interval" => Ok(DivideStrategy::LargestInterval),
      "polarity"         => Ok(DivideStrategy::Polarity),
      "earliest-relu"    => Ok(DivideStrategy::EarliestRelu),
      _                  => Err(Error::UnknownStrategy(name.to_string())),
    }
  }
}

impl FromStr for SoiSearchStrategy {
  type Err = Error;

  fn from_str(name: &str) -> Result<Self, Error> {
    match name {
      "mcmc"    => Ok(SoiSearchStrategy::Mcmc),
      "walksat" => Ok(SoiSearchStrategy::Walksat),
      _         => Err(Error::UnknownStrategy(name.to_string())),
    }
  }
}

impl FromStr for SoiInitStrategy {
  type Err = Error;

  fn from_str(name: &str) -> Result<Self, Error> {
    match name {
      "input-assignment"   => Ok(SoiInitStrategy::InputAssignment),
      "current-assignment" => Ok(SoiInitStrategy::CurrentAssignment),
      "random"             => Ok(SoiInitStrategy::Random),
      _                    => Err(Error::UnknownStrategy(name.to_string())),
    }
  }
}

// endregion

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Config {
  // Global and per-subquery budgets, in seconds; 0 means unlimited.
  pub timeout_seconds        : u64,
  pub initial_timeout_seconds: u64,

  // Divide and conquer.
  pub num_workers    : usize,
  pub snc_mode       : bool,
  pub split_strategy : DivideStrategy,
  pub initial_divides: u32,
  pub online_divides : u32,
  pub timeout_factor : f64,
  pub dnc_depth_threshold: u32,

  // Branching.
  pub branching: BranchingHeuristic,
  pub polarity_candidates_threshold: usize,

  // Sum-of-infeasibilities local search.
  pub soi_search_strategy: SoiSearchStrategy,
  pub soi_init_strategy  : SoiInitStrategy,
  /// The Metropolis-Hastings beta.
  pub probability_density_parameter: f64,
  /// Probability of a noise flip in the GWSAT flipping strategy.
  pub noise_parameter: f64,

  // Split when this many random flips happened without progress.
  pub constraint_violation_threshold: u32,
  pub soi_split_threshold           : u32,

  pub seed     : u32,
  pub verbosity: i32,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      timeout_seconds        : 0,
      initial_timeout_seconds: 5,

      num_workers    : 4,
      snc_mode       : false,
      split_strategy : DivideStrategy::LargestInterval,
      initial_divides: 0,
      online_divides : 2,
      timeout_factor : 1.5,
      dnc_depth_threshold: 5,

      branching: BranchingHeuristic::PseudoImpact,
      polarity_candidates_threshold: 5,

      soi_search_strategy: SoiSearchStrategy::Mcmc,
      soi_init_strategy  : SoiInitStrategy::InputAssignment,
      probability_density_parameter: 10.0,
      noise_parameter: 0.2,

      constraint_violation_threshold: 20,
      soi_split_threshold           : 20,

      seed     : 0,
      verbosity: 0,
    }
  }
}

impl Config {
  pub fn new() -> Self {
    Self::default()
  }

  /// Overlays fields present in a JSON parameters file on top of `self`.
  /// Unknown keys are an error so typos do not silently configure
  /// nothing.
  pub fn apply_overrides_file(&mut self, path: &Path) -> Result<(), Error> {
    let text = read_to_string(path).map_err(|e| Error::MalformedQuery {
      line: 0,
      reason: format!("cannot read parameters file: {}", e),
    })?;
    self.apply_overrides(&text)
  }

  pub fn apply_overrides(&mut self, text: &str) -> Result<(), Error> {
    let object = parse_json(text).map_err(|e| Error::MalformedQuery {
      line: 0,
      reason: format!("bad parameters JSON: {}", e),
    })?;

    for (key, value) in object.entries() {
      match key {
        "timeout"          => self.timeout_seconds = value.as_u64().unwrap_or(self.timeout_seconds),
        "initial-timeout"  => self.initial_timeout_seconds = value.as_u64().unwrap_or(self.initial_timeout_seconds),
        "num-workers"      => self.num_workers = value.as_usize().unwrap_or(self.num_workers),
        "snc"              => self.snc_mode = value.as_bool().unwrap_or(self.snc_mode),
        "split-strategy"   => self.split_strategy = parse_strategy(value.as_str())?,
        "initial-divides"  => self.initial_divides = value.as_u32().unwrap_or(self.initial_divides),
        "num-online-divides" => self.online_divides = value.as_u32().unwrap_or(self.online_divides),
        "branch"           => self.branching = parse_strategy(value.as_str())?,
        "soi-search-strategy" => self.soi_search_strategy = parse_strategy(value.as_str())?,
        "soi-init-strategy"   => self.soi_init_strategy = parse_strategy(value.as_str())?,
        "mcmc-beta"        => self.probability_density_parameter =
                                value.as_f64().unwrap_or(self.probability_density_parameter),
        "noise"            => self.noise_parameter = value.as_f64().unwrap_or(self.noise_parameter),
        "reluplex-split-threshold" => self.constraint_violation_threshold =
                                value.as_u32().unwrap_or(self.constraint_violation_threshold),
        "soi-split-threshold" => self.soi_split_threshold =
                                value.as_u32().unwrap_or(self.soi_split_threshold),
        "seed"             => self.seed = value.as_u32().unwrap_or(self.seed),
        "verbosity"        => self.verbosity = value.as_i32().unwrap_or(self.verbosity),
        other              => return Err(Error::UnknownStrategy(other.to_string())),
      }
    }
    Ok(())
  }
}

fn parse_strategy<T: FromStr<Err = Error>>(name: Option<&str>) -> Result<T, Error> {
  match name {
    Some(name) => name.parse(),
    None       => Err(Error::UnknownStrategy("<non-string>".to_string())),
  }
}
