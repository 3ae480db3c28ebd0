use std::fmt;

use crate::process::ProcessId;

/// Errors surfaced by the scheduler's public API.
///
/// The conditions behind these were hard aborts in the original engine;
/// they are recoverable results here so the host can decide whether, say,
/// pool exhaustion is fatal for its use case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// `spawn` was called with no FREE slot left. The pool never grows;
    /// capacity is fixed at construction.
    Exhausted,
    /// `kill` targeted the currently-resuming process. A process ends
    /// itself by returning from its body, never through the kill path.
    KillCurrent(ProcessId),
    /// `tick` was called from inside a running process body.
    ReentrantTick,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "process pool exhausted"),
            Self::KillCurrent(id) => {
                write!(f, "cannot kill the currently-resuming process {id}")
            }
            Self::ReentrantTick => write!(f, "tick() called from inside a running process"),
        }
    }
}

impl std::error::Error for SchedError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_all_variants() {
        assert_eq!(SchedError::Exhausted.to_string(), "process pool exhausted");
        assert_eq!(
            SchedError::KillCurrent(ProcessId::new(7)).to_string(),
            "cannot kill the currently-resuming process 7"
        );
        assert_eq!(
            SchedError::ReentrantTick.to_string(),
            "tick() called from inside a running process"
        );
    }
}
