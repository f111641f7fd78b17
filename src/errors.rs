use thiserror::Error as DeriveError;
use user_error::UFE;

/// Errors proper. An infeasible query is *not* an error: the bound manager
/// records the first inconsistent tightening and the engine observes it at
/// the next loop iteration and backtracks.
#[derive(Clone, PartialEq, Debug, DeriveError)]
pub enum Error {
  #[error("The LP backend reported an unexpected status: {0}.")]
  LpBackend(String),

  #[error("Serialized constraint variant is not supported: {0}.")]
  UnsupportedConstraint(String),

  #[error("The bounded subquery queue rejected a push.")]
  QueuePushFailed,

  #[error("Malformed query at line {line}: {reason}.")]
  MalformedQuery { line: usize, reason: String },

  #[error("Unknown strategy name `{0}`.")]
  UnknownStrategy(String),
}

impl UFE for Error { /* User Facing Error - nothing to implement. */ }

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn messages_name_the_offender() {
    let e = Error::UnsupportedConstraint("cosine".to_string());
    assert!(e.to_string().contains("cosine"));

    let e = Error::MalformedQuery { line: 7, reason: "missing scalar".to_string() };
    assert!(e.to_string().contains("line 7"));
  }
}
