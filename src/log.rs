/*!

  Handles emitting verbose and generic log messages.

  Verbosity is a small global level: 0 is silent, 1 reports search progress,
  2 reports per-iteration detail, 3 and above is a firehose. Components
  prefix their messages in the style `(pwlsat.engine :iteration 42)`.

*/

use std::sync::atomic::{AtomicI32, Ordering};

static VERBOSITY: AtomicI32 = AtomicI32::new(0);

pub fn set_verbosity(level: i32) {
  VERBOSITY.store(level, Ordering::Relaxed);
}

pub fn verbosity() -> i32 {
  VERBOSITY.load(Ordering::Relaxed)
}

pub fn is_at_least(level: i32) -> bool {
  level <= VERBOSITY.load(Ordering::Relaxed)
}

/// Emits `msg` to stderr if the global verbosity is at least `level`.
pub fn log_at_level(level: i32, msg: &str) {
  if is_at_least(level) {
    eprintln!("{}", msg);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn verbosity_gates_levels() {
    set_verbosity(2);
    assert_eq!(verbosity(), 2);
    assert!(is_at_least(1));
    assert!(is_at_least(2));
    assert!(!is_at_least(3));
    set_verbosity(0);
    assert!(!is_at_least(1));
  }
}
