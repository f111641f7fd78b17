/*!

  The `Context` is a versioned store with `push`/`pop` that undoes every
  change made in between, used to make the search stack cheap.

  Every reversible slot in the solver registers a typed cell here at
  construction time and receives a small copyable handle. Mutating a cell
  at depth `d >= 1` records a `(cell, previous_value)` event on the trail;
  `pop` truncates the trail back to the mark taken at the matching `push`,
  restoring each cell in reverse order. Mutations at depth 0 are permanent.

  Phase-exclusion lists are append-only while a branch is alive, so their
  trail event is just the previous length.

*/

use crate::constraints::PhaseStatus;

// region Cell handles

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct CdF64(usize);

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct CdBool(usize);

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct CdUsize(usize);

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct CdPhase(usize);

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct CdPhaseList(usize);

// endregion

#[derive(Clone, Debug)]
enum TrailEvent {
  F64     { cell: usize, previous: f64 },
  Bool    { cell: usize, previous: bool },
  Usize   { cell: usize, previous: usize },
  Phase   { cell: usize, previous: PhaseStatus },
  ListLen { cell: usize, previous: usize },
}

#[derive(Clone, Debug, Default)]
pub struct Context {
  depth      : u32,
  f64_cells  : Vec<f64>,
  bool_cells : Vec<bool>,
  usize_cells: Vec<usize>,
  phase_cells: Vec<PhaseStatus>,
  phase_lists: Vec<Vec<PhaseStatus>>,
  trail      : Vec<TrailEvent>,
  frames     : Vec<usize>,
}

impl Context {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn depth(&self) -> u32 {
    self.depth
  }

  pub fn trail_len(&self) -> usize {
    self.trail.len()
  }

  pub fn push(&mut self) {
    self.frames.push(self.trail.len());
    self.depth += 1;
  }

  /// Restores every registered cell to the value it held at the matching
  /// `push`. A pop at depth 0 is a programming error.
  pub fn pop(&mut self) {
    let mark = self.frames.pop().expect("context pop at depth 0");
    while self.trail.len() > mark {
      match self.trail.pop().unwrap() {
        TrailEvent::F64 { cell, previous }     => self.f64_cells[cell] = previous,
        TrailEvent::Bool { cell, previous }    => self.bool_cells[cell] = previous,
        TrailEvent::Usize { cell, previous }   => self.usize_cells[cell] = previous,
        TrailEvent::Phase { cell, previous }   => self.phase_cells[cell] = previous,
        TrailEvent::ListLen { cell, previous } => self.phase_lists[cell].truncate(previous),
      }
    }
    self.depth -= 1;
  }

  // region Registration

  pub fn new_f64(&mut self, initial: f64) -> CdF64 {
    self.f64_cells.push(initial);
    CdF64(self.f64_cells.len() - 1)
  }

  pub fn new_bool(&mut self, initial: bool) -> CdBool {
    self.bool_cells.push(initial);
    CdBool(self.bool_cells.len() - 1)
  }

  pub fn new_usize(&mut self, initial: usize) -> CdUsize {
    self.usize_cells.push(initial);
    CdUsize(self.usize_cells.len() - 1)
  }

  pub fn new_phase(&mut self, initial: PhaseStatus) -> CdPhase {
    self.phase_cells.push(initial);
    CdPhase(self.phase_cells.len() - 1)
  }

  pub fn new_phase_list(&mut self) -> CdPhaseList {
    self.phase_lists.push(Vec::new());
    CdPhaseList(self.phase_lists.len() - 1)
  }

  // endregion

  // region Cell access

  pub fn get_f64(&self, cell: CdF64) -> f64 {
    self.f64_cells[cell.0]
  }

  /// Writing the current value back is a no-op and does not grow the trail.
  pub fn set_f64(&mut self, cell: CdF64, value: f64) {
    let previous = self.f64_cells[cell.0];
    if previous == value {
      return;
    }
    if self.depth > 0 {
      self.trail.push(TrailEvent::F64 { cell: cell.0, previous });
    }
    self.f64_cells[cell.0] = value;
  }

  pub fn get_bool(&self, cell: CdBool) -> bool {
    self.bool_cells[cell.0]
  }

  pub fn set_bool(&mut self, cell: CdBool, value: bool) {
    let previous = self.bool_cells[cell.0];
    if previous == value {
      return;
    }
    if self.depth > 0 {
      self.trail.push(TrailEvent::Bool { cell: cell.0, previous });
    }
    self.bool_cells[cell.0] = value;
  }

  pub fn get_usize(&self, cell: CdUsize) -> usize {
    self.usize_cells[cell.0]
  }

  pub fn set_usize(&mut self, cell: CdUsize, value: usize) {
    let previous = self.usize_cells[cell.0];
    if previous == value {
      return;
    }
    if self.depth > 0 {
      self.trail.push(TrailEvent::Usize { cell: cell.0, previous });
    }
    self.usize_cells[cell.0] = value;
  }

  pub fn get_phase(&self, cell: CdPhase) -> PhaseStatus {
    self.phase_cells[cell.0]
  }

  pub fn set_phase(&mut self, cell: CdPhase, value: PhaseStatus) {
    let previous = self.phase_cells[cell.0];
    if previous == value {
      return;
    }
    if self.depth > 0 {
      self.trail.push(TrailEvent::Phase { cell: cell.0, previous });
    }
    self.phase_cells[cell.0] = value;
  }

  pub fn phase_list(&self, cell: CdPhaseList) -> &[PhaseStatus] {
    &self.phase_lists[cell.0]
  }

  pub fn phase_list_push(&mut self, cell: CdPhaseList, value: PhaseStatus) {
    if self.depth > 0 {
      self.trail.push(TrailEvent::ListLen {
        cell: cell.0,
        previous: self.phase_lists[cell.0].len(),
      });
    }
    self.phase_lists[cell.0].push(value);
  }

  // endregion
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::constraints::PhaseStatus;

  #[test]
  fn push_pop_restores_every_cell_kind() {
    let mut ctx = Context::new();
    let x = ctx.new_f64(1.5);
    let b = ctx.new_bool(true);
    let n = ctx.new_usize(3);
    let p = ctx.new_phase(PhaseStatus::NotFixed);
    let l = ctx.new_phase_list();

    ctx.push();
    ctx.set_f64(x, 9.0);
    ctx.set_bool(b, false);
    ctx.set_usize(n, 7);
    ctx.set_phase(p, PhaseStatus::ReluActive);
    ctx.phase_list_push(l, PhaseStatus::ReluInactive);
    ctx.pop();

    assert_eq!(ctx.get_f64(x), 1.5);
    assert!(ctx.get_bool(b));
    assert_eq!(ctx.get_usize(n), 3);
    assert_eq!(ctx.get_phase(p), PhaseStatus::NotFixed);
    assert!(ctx.phase_list(l).is_empty());
  }

  #[test]
  fn depth_zero_changes_are_permanent() {
    let mut ctx = Context::new();
    let x = ctx.new_f64(0.0);
    ctx.set_f64(x, 4.0);
    ctx.push();
    ctx.set_f64(x, 5.0);
    ctx.pop();
    assert_eq!(ctx.get_f64(x), 4.0);
  }

  #[test]
  fn rewriting_the_same_value_does_not_grow_the_trail() {
    let mut ctx = Context::new();
    let x = ctx.new_f64(2.0);
    ctx.push();
    ctx.set_f64(x, 2.0);
    assert_eq!(ctx.trail_len(), 0);
    ctx.set_f64(x, 3.0);
    let len = ctx.trail_len();
    ctx.set_f64(x, 3.0);
    assert_eq!(ctx.trail_len(), len);
    ctx.pop();
  }

  #[test]
  fn nested_frames_unwind_in_order() {
    let mut ctx = Context::new();
    let x = ctx.new_f64(0.0);

    ctx.push();
    ctx.set_f64(x, 1.0);
    ctx.push();
    ctx.set_f64(x, 2.0);
    assert_eq!(ctx.depth(), 2);

    ctx.pop();
    assert_eq!(ctx.get_f64(x), 1.0);
    ctx.pop();
    assert_eq!(ctx.get_f64(x), 0.0);
    assert_eq!(ctx.depth(), 0);
  }
}
