use thiserror::Error;

use crate::core::value::Value;

/// Cause attached to a failed event.
///
/// Failures travel through event settlement and are observed by whoever
/// awaits the event; they are distinct from [`SimError`], which reports
/// contract violations synchronously at the call site.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Failure {
    #[error("interrupted: {cause}")]
    Interrupt { cause: Value },

    #[error("preempted by request priority={priority} order={order}")]
    Preempted { priority: i64, order: u64 },

    #[error("request timed out after {after}")]
    RequestTimeout { after: f64 },

    #[error("{0}")]
    Error(String),
}

impl Failure {
    /// Custom failure with a message.
    pub fn error(msg: impl Into<String>) -> Self {
        Failure::Error(msg.into())
    }
}

/// Lets process bodies use `?` on kernel calls; the synchronous error
/// becomes the process's failure cause.
impl From<SimError> for Failure {
    fn from(err: SimError) -> Self {
        Failure::Error(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum SimError {
    #[error("event has already been triggered")]
    AlreadySettled,

    #[error("event value not yet available")]
    ValueNotAvailable,

    #[error("event failed: {0}")]
    EventFailed(Failure),

    #[error("unhandled event failure: {0}")]
    UnhandledFailure(Failure),

    #[error("empty schedule")]
    EmptySchedule,

    #[error("no scheduled events left before until condition is met")]
    NoEventsBeforeTarget,

    #[error("until must be greater than the current time")]
    UntilInPast,

    #[error("negative delay {0}")]
    NegativeDelay(f64),

    #[error("interval must be greater than zero, got {0}")]
    InvalidInterval(f64),

    #[error("capacity must be greater than zero")]
    InvalidCapacity,

    #[error("amount must be greater than zero, got {0}")]
    InvalidAmount(f64),

    #[error("initial level {initial} is outside [0, {capacity}]")]
    InvalidLevel { initial: f64, capacity: f64 },

    #[error("factor must be greater than zero")]
    InvalidFactor,

    #[error("request is not holding this resource")]
    NotHolder,

    #[error("process has terminated and cannot be interrupted")]
    ProcessTerminated,

    #[error("a process cannot interrupt itself")]
    SelfInterrupt,

    #[error("cannot mix events from different environments")]
    MixedEnvironments,

    #[error("at least one operand is required")]
    OperandRequired,

    #[error("event #{0} did not contribute a value")]
    MissingEntry(u64),

    #[error("environment has been dropped")]
    EnvironmentGone,

    #[error("simulation too slow for real time (lag={lag:.3}s)")]
    TooSlow { lag: f64 },
}

pub type Result<T> = std::result::Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_display() {
        let f = Failure::Interrupt { cause: Value::from("stop") };
        assert_eq!(f.to_string(), "interrupted: stop");

        let f = Failure::RequestTimeout { after: 0.5 };
        assert!(f.to_string().contains("timed out"));
    }

    #[test]
    fn test_sim_error_converts_to_failure() {
        let f: Failure = Failure::from(SimError::EmptySchedule);
        assert_eq!(f, Failure::Error("empty schedule".into()));
    }
}
