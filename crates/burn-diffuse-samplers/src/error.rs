//! Scheduler error types

use thiserror::Error;

/// Errors raised while building or stepping a scheduler
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("unknown scheduler kind: {0}")]
    UnknownKind(String),

    #[error("invalid scheduler options: {0}")]
    InvalidOptions(String),

    #[error("timestep {0} is not part of the schedule")]
    UnknownTimestep(usize),

    #[error("cannot split batch of {batch} into {parts} guidance groups")]
    GuidanceBatch { batch: usize, parts: usize },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
