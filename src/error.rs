//! Error taxonomy shared by the registry, dispatcher and scenario driver.

use crate::task::{TaskId, TaskState};
use serde::{Serialize, Serializer};
use std::fmt;

/// Errors and faults surfaced by the scheduler.
///
/// Only configuration errors abort setup. Unknown task ids and inconsistent states are recorded
/// as faults of a run, and counter mismatches are reported after the run has completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// A task id outside the registered range, or one naming an empty slot.
    UnknownTask { id: TaskId },
    /// The dispatcher met a task it cannot execute in its current state.
    InconsistentState { id: TaskId, state: TaskState },
    /// Final counters differ from the expected totals.
    CounterMismatch {
        expected: (u64, u64),
        actual: (u64, u64),
    },
    /// Two tasks were configured with the same id.
    DuplicateTask { id: TaskId },
    /// A task id does not fit in the registry.
    CapacityExceeded { id: TaskId, capacity: usize },
    /// Configuration could not be read or parsed.
    Config(String),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::UnknownTask { id } => write!(f, "bad task id {id}"),
            SchedError::InconsistentState { id, state } => {
                write!(f, "task {id} cannot be dispatched in state {state:?}")
            }
            SchedError::CounterMismatch { expected, actual } => write!(
                f,
                "sanity check failed: expected {}, {}; got {}, {}",
                expected.0, expected.1, actual.0, actual.1
            ),
            SchedError::DuplicateTask { id } => write!(f, "task {id} is already registered"),
            SchedError::CapacityExceeded { id, capacity } => {
                write!(f, "task {id} does not fit in a registry of {capacity} slots")
            }
            SchedError::Config(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for SchedError {}

impl Serialize for SchedError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl From<serde_json::Error> for SchedError {
    fn from(err: serde_json::Error) -> Self {
        SchedError::Config(err.to_string())
    }
}

impl From<std::io::Error> for SchedError {
    fn from(err: std::io::Error) -> Self {
        SchedError::Config(err.to_string())
    }
}
