//! Wall-clock-synchronized execution.
//!
//! Wraps an [`Environment`] and sleeps before each dispatch so that
//! virtual time tracks the system clock, scaled by a factor. Adds no
//! scheduling semantics of its own: events, processes and resources are
//! created through the inner environment's factories.

use std::cell::Cell;
use std::thread;
use std::time::{Duration, Instant};

use crate::core::env::Environment;
use crate::core::error::{Result, SimError};
use crate::core::event::{Event, Outcome};
use crate::core::value::Value;

/// Environment that paces dispatch against the wall clock.
pub struct RealtimeEnvironment {
    env: Environment,
    /// Wall seconds per unit of virtual time.
    factor: f64,
    /// When true, falling behind by more than one factor is an error.
    strict: bool,
    env_start: f64,
    real_start: Cell<Instant>,
}

impl RealtimeEnvironment {
    /// Start at virtual time 0 with a factor of 1.0, strict.
    pub fn new() -> Self {
        RealtimeEnvironment {
            env: Environment::new(),
            factor: 1.0,
            strict: true,
            env_start: 0.0,
            real_start: Cell::new(Instant::now()),
        }
    }

    pub fn with_options(initial: f64, factor: f64, strict: bool) -> Result<Self> {
        if factor <= 0.0 {
            return Err(SimError::InvalidFactor);
        }
        Ok(RealtimeEnvironment {
            env: Environment::with_start(initial),
            factor,
            strict,
            env_start: initial,
            real_start: Cell::new(Instant::now()),
        })
    }

    /// The wrapped environment; use its factories to build the model.
    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    pub fn now(&self) -> f64 {
        self.env.now()
    }

    pub fn peek(&self) -> f64 {
        self.env.peek()
    }

    /// Rebase the wall-clock origin to the present. Useful if setup took
    /// a while between construction and the first run.
    pub fn sync(&self) {
        self.real_start.set(Instant::now());
    }

    /// Sleep until the next entry's wall-clock deadline, then dispatch
    /// it. Errors with [`SimError::TooSlow`] in strict mode when
    /// dispatch lags by more than one factor.
    pub fn step(&self) -> Result<()> {
        let next = self.env.peek();
        if next.is_infinite() {
            return Err(SimError::EmptySchedule);
        }
        let offset = Duration::from_secs_f64((next - self.env_start) * self.factor);
        let deadline = self.real_start.get() + offset;
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        } else if self.strict {
            let lag = (now - deadline).as_secs_f64();
            if lag > self.factor {
                tracing::warn!("realtime dispatch lagging by {:.3}s", lag);
                return Err(SimError::TooSlow { lag });
            }
        }
        self.env.step()
    }

    /// Run until no scheduled entries remain.
    pub fn run(&self) -> Result<()> {
        loop {
            match self.step() {
                Ok(()) => {}
                Err(SimError::EmptySchedule) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Run until `until` has been processed, pacing each dispatch.
    pub fn run_until(&self, until: &Event) -> Result<Value> {
        loop {
            if until.is_processed() {
                return finish(until);
            }
            match self.step() {
                Ok(()) => {}
                Err(SimError::EmptySchedule) => return Err(SimError::NoEventsBeforeTarget),
                Err(e) => {
                    if until.is_processed() {
                        return finish(until);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Run until the virtual clock reaches `until`.
    pub fn run_until_time(&self, until: f64) -> Result<Value> {
        let now = self.env.now();
        if until <= now {
            return Err(SimError::UntilInPast);
        }
        let target = self.env.timeout(until - now)?;
        self.run_until(&target)
    }
}

impl Default for RealtimeEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

fn finish(until: &Event) -> Result<Value> {
    match until.outcome() {
        Outcome::Success(v) => Ok(v),
        Outcome::Failure(f) => Err(SimError::EventFailed(f)),
        Outcome::Pending => Err(SimError::ValueNotAvailable),
    }
}
