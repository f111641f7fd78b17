/*!

  The piecewise-linear constraint contract and its concrete variants.

  Every activation kind honors one uniform interface: bound watching
  (`notify_*_bound`), phase tracking, case-split enumeration, entailed
  tightenings, and cost contribution for the sum-of-infeasibilities local
  search. Constraints are plain data until installed into an engine, at
  which point their reversible fields (active flag, phase, excluded cases)
  register cells with the `Context` so that branching and backtracking
  restore them for free.

*/

mod relu;
mod absolute_value;
mod sign;
mod clip;
mod max;
mod disjunction;

pub use absolute_value::AbsoluteValueConstraint;
pub use clip::ClipConstraint;
pub use disjunction::DisjunctionConstraint;
pub use max::MaxConstraint;
pub use relu::ReluConstraint;
pub use sign::SignConstraint;

use std::cell::Cell;
use std::fmt::{Display, Formatter};

use crate::bounds::BoundManager;
use crate::case_split::{CaseSplit, Tightening};
use crate::context::{CdBool, CdPhase, CdPhaseList, Context};
use crate::equation::LinearExpr;
use crate::query::Query;
use crate::Variable;

/// Index of a constraint in the engine's arena.
pub type ConstraintId = usize;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum ConstraintKind {
  Relu,
  AbsoluteValue,
  Sign,
  Clip,
  Max,
  Disjunction,
}

impl Display for ConstraintKind {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      ConstraintKind::Relu          => "relu",
      ConstraintKind::AbsoluteValue => "absoluteValue",
      ConstraintKind::Sign          => "sign",
      ConstraintKind::Clip          => "clip",
      ConstraintKind::Max           => "max",
      ConstraintKind::Disjunction   => "disj",
    };
    write!(f, "{}", name)
  }
}

/// One shared phase namespace across all constraint kinds, with a single
/// not-fixed sentinel. `MaxCase` carries the input *variable* so that the
/// identity survives element elimination; `DisjunctCase` carries the
/// disjunct index.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum PhaseStatus {
  NotFixed,
  ReluActive,
  ReluInactive,
  AbsPositive,
  AbsNegative,
  SignPositive,
  SignNegative,
  ClipFloor,
  ClipMiddle,
  ClipCeiling,
  MaxCase(u32),
  MaxEliminated,
  DisjunctCase(u32),
}

impl Default for PhaseStatus {
  fn default() -> Self {
    PhaseStatus::NotFixed
  }
}

impl Display for PhaseStatus {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      PhaseStatus::NotFixed         => write!(f, "not-fixed"),
      PhaseStatus::ReluActive       => write!(f, "relu-active"),
      PhaseStatus::ReluInactive     => write!(f, "relu-inactive"),
      PhaseStatus::AbsPositive      => write!(f, "abs-positive"),
      PhaseStatus::AbsNegative      => write!(f, "abs-negative"),
      PhaseStatus::SignPositive     => write!(f, "sign-positive"),
      PhaseStatus::SignNegative     => write!(f, "sign-negative"),
      PhaseStatus::ClipFloor        => write!(f, "clip-floor"),
      PhaseStatus::ClipMiddle       => write!(f, "clip-middle"),
      PhaseStatus::ClipCeiling      => write!(f, "clip-ceiling"),
      PhaseStatus::MaxCase(v)       => write!(f, "max-case-x{}", v),
      PhaseStatus::MaxEliminated    => write!(f, "max-eliminated"),
      PhaseStatus::DisjunctCase(i)  => write!(f, "disjunct-{}", i),
    }
  }
}

/// Context cells registered when the constraint is installed into an
/// engine.
#[derive(Copy, Clone, Debug)]
pub struct ContextCells {
  active    : CdBool,
  phase     : CdPhase,
  infeasible: CdPhaseList,
}

/// State shared by every variant: the reversible cells, the pseudo-impact
/// score and the branch-direction hint. The latter two are plain search
/// heuristics, not part of the reversible state.
#[derive(Debug)]
pub struct ConstraintCore {
  cells    : Option<ContextCells>,
  score    : Cell<f64>,
  direction: Cell<PhaseStatus>,
}

impl ConstraintCore {
  pub fn new() -> Self {
    ConstraintCore {
      cells    : None,
      score    : Cell::new(0.0),
      direction: Cell::new(PhaseStatus::NotFixed),
    }
  }

  pub fn register(&mut self, ctx: &mut Context) {
    debug_assert!(self.cells.is_none());
    self.cells = Some(ContextCells {
      active    : ctx.new_bool(true),
      phase     : ctx.new_phase(PhaseStatus::NotFixed),
      infeasible: ctx.new_phase_list(),
    });
  }

  fn cells(&self) -> &ContextCells {
    self.cells.as_ref().expect("constraint not installed into a context")
  }

  pub fn is_active(&self, ctx: &Context) -> bool {
    ctx.get_bool(self.cells().active)
  }

  pub fn set_active(&self, ctx: &mut Context, active: bool) {
    ctx.set_bool(self.cells().active, active);
  }

  pub fn phase(&self, ctx: &Context) -> PhaseStatus {
    ctx.get_phase(self.cells().phase)
  }

  /// Within one branch a phase may only move off the not-fixed sentinel
  /// once; backtracking restores the prior value through the trail.
  /// When a degenerate interval (e.g. an input pinned to exactly zero)
  /// makes both phases fixable, the first fix stands; a genuinely
  /// contradictory second fix always comes with crossing bounds, which
  /// the bound manager reports separately.
  pub fn set_phase(&self, ctx: &mut Context, phase: PhaseStatus) {
    debug_assert!(phase != PhaseStatus::NotFixed);
    let current = self.phase(ctx);
    if current != PhaseStatus::NotFixed && current != phase {
      return;
    }
    ctx.set_phase(self.cells().phase, phase);
  }

  pub fn infeasible_cases<'a>(&self, ctx: &'a Context) -> &'a [PhaseStatus] {
    ctx.phase_list(self.cells().infeasible)
  }

  pub fn mark_infeasible(&self, ctx: &mut Context, phase: PhaseStatus) {
    if !self.infeasible_cases(ctx).contains(&phase) {
      ctx.phase_list_push(self.cells().infeasible, phase);
    }
  }

  pub fn score(&self) -> f64 {
    self.score.get()
  }

  pub fn set_score(&self, score: f64) {
    self.score.set(score);
  }

  pub fn direction(&self) -> PhaseStatus {
    self.direction.get()
  }

  pub fn set_direction(&self, direction: PhaseStatus) {
    self.direction.set(direction);
  }
}

impl Clone for ConstraintCore {
  /// Clones the heuristic fields but *not* the context registration; the
  /// clone is plain data again, ready to be installed into another
  /// engine's context (divide-and-conquer duplication).
  fn clone(&self) -> Self {
    ConstraintCore {
      cells    : None,
      score    : Cell::new(self.score.get()),
      direction: Cell::new(self.direction.get()),
    }
  }
}

impl Default for ConstraintCore {
  fn default() -> Self {
    Self::new()
  }
}

pub trait PiecewiseLinear: Send {
  fn kind(&self) -> ConstraintKind;

  fn core(&self) -> &ConstraintCore;
  fn core_mut(&mut self) -> &mut ConstraintCore;

  /// Stable set of variables this constraint watches.
  fn participating_variables(&self) -> Vec<Variable>;

  /// Called when a watched lower bound tightens. May call back into the
  /// bound manager with entailed tightenings and may transition the
  /// phase. Idempotent when the bound is not strictly tighter.
  fn notify_lower_bound(&self, variable: Variable, bound: f64,
                        bounds: &BoundManager, ctx: &mut Context);

  /// Symmetric to `notify_lower_bound`.
  fn notify_upper_bound(&self, variable: Variable, bound: f64,
                        bounds: &BoundManager, ctx: &mut Context);

  /// True iff `assignment` satisfies the relation within tolerance.
  fn satisfied(&self, assignment: &[f64]) -> bool;

  /// Enumerates all phases as case splits, first-listed tried first.
  /// Must not be invoked when the phase is fixed.
  fn case_splits(&self, ctx: &Context, bounds: &BoundManager) -> Vec<CaseSplit>;

  fn phase_fixed(&self, ctx: &Context) -> bool {
    self.core().phase(ctx) != PhaseStatus::NotFixed
  }

  /// The unique implied split. Pre: `phase_fixed()`.
  fn valid_split(&self, ctx: &Context) -> CaseSplit {
    debug_assert!(self.phase_fixed(ctx));
    self.case_split_for(self.core().phase(ctx))
  }

  /// All phases in branch order.
  fn all_cases(&self) -> Vec<PhaseStatus>;

  /// Phases not yet excluded on this branch.
  fn feasible_cases(&self, ctx: &Context) -> Vec<PhaseStatus> {
    let infeasible = self.core().infeasible_cases(ctx);
    self.all_cases()
        .into_iter()
        .filter(|phase| !infeasible.contains(phase))
        .collect()
  }

  /// The split constituting `phase`.
  fn case_split_for(&self, phase: PhaseStatus) -> CaseSplit;

  /// Deductive closure of the current bounds under the relation.
  fn entailed_tightenings(&self, ctx: &Context, bounds: &BoundManager,
                          out: &mut Vec<Tightening>);

  /// Adds the linear cost term realizing distance-to-`phase`.
  fn cost_component(&self, out: &mut LinearExpr, phase: PhaseStatus);

  /// Whether this constraint contributes terms to the SoI objective.
  fn supports_soi_cost(&self) -> bool;

  /// Classifies a concrete assignment into the phase it naturally takes.
  fn phase_in_assignment(&self, assignment: &[f64]) -> PhaseStatus;

  /// One text line, `kind,f,b[,extra...]`.
  fn serialize_to_string(&self) -> String;

  /// Request auxiliary variables and equations from the query during
  /// preprocessing.
  fn transform_to_use_aux_variables(&mut self, _query: &mut Query) {}

  /// A participating variable was fixed and removed during preprocessing.
  fn eliminate_variable(&mut self, variable: Variable, value: f64);

  fn update_variable_index(&mut self, old_index: Variable, new_index: Variable);

  /// True when the constraint no longer constrains anything and can be
  /// dropped (e.g. a watched variable was eliminated).
  fn obsolete(&self) -> bool;

  /// Polarity of the input interval in `[-1, 1]`, for constraints that
  /// support polarity-based branching.
  fn polarity(&self, _ctx: &Context, _bounds: &BoundManager) -> Option<f64> {
    None
  }

  /// Refreshes the branch-direction hint (and the polarity-based score)
  /// from the current bounds.
  fn update_direction(&self, _ctx: &Context, _bounds: &BoundManager) {}

  fn clone_boxed(&self) -> Box<dyn PiecewiseLinear>;
}

impl Clone for Box<dyn PiecewiseLinear> {
  fn clone(&self) -> Self {
    self.clone_boxed()
  }
}
