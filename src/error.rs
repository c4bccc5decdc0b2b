use std::io;

use thiserror::Error;

use crate::co::FiberId;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("not running inside a scheduled fiber")]
    NotInFiber,

    #[error("the run loop cannot be driven from inside {0}")]
    Reentrant(FiberId),

    /// Caller contract violation: the handle was already resumed.
    #[error("{0} is not suspended awaiting a host call")]
    NotSuspended(FiberId),

    /// The handle was parked by a different scheduler.
    #[error("{0} is parked on another scheduler")]
    ForeignHandle(FiberId),

    #[error("fiber was resumed with a value that is not a `{expected}`")]
    UnexpectedValue { expected: &'static str },

    #[error("failed to allocate a fiber stack")]
    Stack(#[from] io::Error),
}
