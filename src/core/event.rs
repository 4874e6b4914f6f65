//! Settle-once outcome cells.
//!
//! An [`Event`] is bound to one [`Environment`] for life, settles at most
//! once (success value or failure cause) and invokes its registered
//! callbacks when the scheduler dispatches it. Settling and dispatch are
//! distinct moments: `is_triggered` becomes true at settlement,
//! `is_processed` only once the callbacks have run.

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use crate::core::condition::ConditionState;
use crate::core::env::{EnvCore, Environment, Priority};
use crate::core::error::{Failure, Result, SimError};
use crate::core::value::Value;

/// Callback invoked with the event when it is dispatched.
pub type Callback = Box<dyn FnOnce(&Event)>;

/// Handle returned by [`Event::add_callback`], used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackHandle(u64);

/// The settlement state of an event.
#[derive(Debug, Clone)]
pub enum Outcome {
    Pending,
    Success(Value),
    Failure(Failure),
}

impl Outcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }
}

struct EventState {
    outcome: Outcome,
    defused: bool,
    /// `None` once the callbacks have been detached for dispatch.
    callbacks: Option<Vec<(u64, Callback)>>,
    next_callback: u64,
    /// Present only on condition events; lets composition operators see
    /// through to the constituents for value harvesting.
    condition: Option<Rc<RefCell<ConditionState>>>,
}

pub(crate) struct EventInner {
    id: u64,
    env: Weak<RefCell<EnvCore>>,
    state: RefCell<EventState>,
}

/// A settle-once outcome cell with an ordered callback list.
#[derive(Clone)]
pub struct Event {
    inner: Rc<EventInner>,
}

impl Event {
    pub(crate) fn new(id: u64, env: Weak<RefCell<EnvCore>>) -> Self {
        Event {
            inner: Rc::new(EventInner {
                id,
                env,
                state: RefCell::new(EventState {
                    outcome: Outcome::Pending,
                    defused: false,
                    callbacks: Some(Vec::new()),
                    next_callback: 0,
                    condition: None,
                }),
            }),
        }
    }

    /// Identifier unique within the owning environment, assigned in
    /// creation order.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The owning environment, if it is still alive.
    pub fn env(&self) -> Option<Environment> {
        self.inner.env.upgrade().map(Environment::from_core)
    }

    pub(crate) fn same_env(&self, env: &Environment) -> bool {
        std::ptr::eq(self.inner.env.as_ptr(), env.core_ptr())
    }

    /// True once the event has settled (value or failure assigned).
    pub fn is_triggered(&self) -> bool {
        !self.inner.state.borrow().outcome.is_pending()
    }

    /// True once the callbacks have been detached and run.
    pub fn is_processed(&self) -> bool {
        self.inner.state.borrow().callbacks.is_none()
    }

    /// True if the event settled successfully.
    pub fn succeeded(&self) -> bool {
        matches!(self.inner.state.borrow().outcome, Outcome::Success(_))
    }

    pub fn is_defused(&self) -> bool {
        self.inner.state.borrow().defused
    }

    /// Acknowledge a failure so it will not crash the run loop when
    /// dispatched.
    pub fn set_defused(&self, defused: bool) {
        self.inner.state.borrow_mut().defused = defused;
    }

    /// A snapshot of the settlement state.
    pub fn outcome(&self) -> Outcome {
        self.inner.state.borrow().outcome.clone()
    }

    /// The settled value. Errors while pending; a failure cause is
    /// wrapped in [`SimError::EventFailed`].
    pub fn value(&self) -> Result<Value> {
        match self.outcome() {
            Outcome::Pending => Err(SimError::ValueNotAvailable),
            Outcome::Success(v) => Ok(v),
            Outcome::Failure(f) => Err(SimError::EventFailed(f)),
        }
    }

    /// Settle successfully with `value` and schedule dispatch at the
    /// current instant, normal priority.
    pub fn succeed(&self, value: impl Into<Value>) -> Result<()> {
        if self.resolve(Outcome::Success(value.into())) {
            Ok(())
        } else {
            Err(SimError::AlreadySettled)
        }
    }

    /// Settle with a failure cause and schedule dispatch. The failure
    /// crashes the run loop at dispatch unless the event is defused or
    /// awaited by then.
    pub fn fail(&self, cause: Failure) -> Result<()> {
        if self.resolve(Outcome::Failure(cause)) {
            Ok(())
        } else {
            Err(SimError::AlreadySettled)
        }
    }

    /// Settle and enqueue for dispatch; false if already settled.
    pub(crate) fn resolve(&self, outcome: Outcome) -> bool {
        {
            let mut state = self.inner.state.borrow_mut();
            if !state.outcome.is_pending() {
                return false;
            }
            state.outcome = outcome;
        }
        self.schedule_self(Priority::Normal, 0.0);
        true
    }

    pub(crate) fn grant(&self, value: Value) -> bool {
        self.resolve(Outcome::Success(value))
    }

    pub(crate) fn reject(&self, failure: Failure) -> bool {
        self.resolve(Outcome::Failure(failure))
    }

    /// Assign an outcome without scheduling. Used to construct events that
    /// are born settled (timeouts, process initialization) and dispatched
    /// on their own terms.
    pub(crate) fn mark_settled(&self, outcome: Outcome) {
        let mut state = self.inner.state.borrow_mut();
        debug_assert!(state.outcome.is_pending());
        state.outcome = outcome;
    }

    /// Replace the payload of an already-successful event. Only condition
    /// events use this, to swap their placeholder for the harvested map
    /// just before their callbacks observe it.
    pub(crate) fn overwrite_value(&self, value: Value) {
        let mut state = self.inner.state.borrow_mut();
        if matches!(state.outcome, Outcome::Success(_)) {
            state.outcome = Outcome::Success(value);
        }
    }

    /// Register a callback for dispatch. No-op (returns `None`) if the
    /// event has already been processed.
    pub fn add_callback(&self, cb: impl FnOnce(&Event) + 'static) -> Option<CallbackHandle> {
        let mut state = self.inner.state.borrow_mut();
        let id = state.next_callback;
        match state.callbacks {
            Some(ref mut list) => {
                list.push((id, Box::new(cb)));
                state.next_callback += 1;
                Some(CallbackHandle(id))
            }
            None => None,
        }
    }

    /// Deregister a callback. No-op once the event has been processed.
    pub fn remove_callback(&self, handle: CallbackHandle) {
        let mut state = self.inner.state.borrow_mut();
        if let Some(ref mut list) = state.callbacks {
            list.retain(|(id, _)| *id != handle.0);
        }
    }

    /// Detach the callback list for dispatch, marking the event processed.
    pub(crate) fn detach_callbacks(&self) -> Vec<(u64, Callback)> {
        self.inner
            .state
            .borrow_mut()
            .callbacks
            .take()
            .unwrap_or_default()
    }

    /// Composite event that succeeds once this event and every operand
    /// have succeeded. Requires at least one operand.
    pub fn and(&self, others: &[Event]) -> Result<Event> {
        self.compose(others, true)
    }

    /// Composite event that succeeds once this event or any operand has
    /// succeeded. Requires at least one operand.
    pub fn or(&self, others: &[Event]) -> Result<Event> {
        self.compose(others, false)
    }

    fn compose(&self, others: &[Event], all: bool) -> Result<Event> {
        if others.is_empty() {
            return Err(SimError::OperandRequired);
        }
        let env = self.env().ok_or(SimError::EnvironmentGone)?;
        let mut operands = Vec::with_capacity(others.len() + 1);
        operands.push(self.clone());
        operands.extend(others.iter().cloned());
        if all {
            env.all_of(&operands)
        } else {
            env.any_of(&operands)
        }
    }

    pub(crate) fn condition_state(&self) -> Option<Rc<RefCell<ConditionState>>> {
        self.inner.state.borrow().condition.clone()
    }

    pub(crate) fn set_condition_state(&self, cs: Rc<RefCell<ConditionState>>) {
        self.inner.state.borrow_mut().condition = Some(cs);
    }

    fn schedule_self(&self, priority: Priority, delay: f64) {
        if let Some(core) = self.inner.env.upgrade() {
            Environment::from_core(core).push(self, priority, delay);
        }
    }
}

/// Identity equality: two handles are equal when they refer to the same
/// underlying event.
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Event {}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        let tag = match state.outcome {
            Outcome::Pending => "pending",
            Outcome::Success(_) => "succeeded",
            Outcome::Failure(_) => "failed",
        };
        write!(f, "Event(#{}, {})", self.inner.id, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::env::Environment;

    #[test]
    fn test_double_settle_is_rejected() {
        let env = Environment::new();
        let e = env.event();
        e.succeed("first").unwrap();
        assert!(matches!(e.succeed("again"), Err(SimError::AlreadySettled)));
        assert!(matches!(
            e.fail(Failure::error("boom")),
            Err(SimError::AlreadySettled)
        ));
        // The original outcome is untouched.
        assert_eq!(e.value().unwrap(), Value::from("first"));
    }

    #[test]
    fn test_value_unavailable_while_pending() {
        let env = Environment::new();
        let e = env.event();
        assert!(matches!(e.value(), Err(SimError::ValueNotAvailable)));
        assert!(!e.is_triggered());
        assert!(!e.is_processed());
    }

    #[test]
    fn test_triggered_before_processed() {
        let env = Environment::new();
        let e = env.event();
        e.succeed(1).unwrap();
        assert!(e.is_triggered());
        assert!(!e.is_processed());
        env.step().unwrap();
        assert!(e.is_processed());
    }

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let env = Environment::new();
        let e = env.event();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            e.add_callback(move |_| seen.borrow_mut().push(i));
        }
        e.succeed(Value::None).unwrap();
        env.step().unwrap();
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_callback_removal() {
        let env = Environment::new();
        let e = env.event();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s1 = seen.clone();
        let keep = e.add_callback(move |_| s1.borrow_mut().push("keep")).unwrap();
        let s2 = seen.clone();
        let discard = e.add_callback(move |_| s2.borrow_mut().push("discard")).unwrap();
        assert_ne!(keep, discard);
        e.remove_callback(discard);
        e.succeed(Value::None).unwrap();
        env.step().unwrap();
        assert_eq!(*seen.borrow(), vec!["keep"]);
    }

    #[test]
    fn test_add_callback_after_processed_is_noop() {
        let env = Environment::new();
        let e = env.event();
        e.succeed(Value::None).unwrap();
        env.step().unwrap();
        assert!(e.add_callback(|_| panic!("must not run")).is_none());
    }

    #[test]
    fn test_failed_event_value_carries_cause() {
        let env = Environment::new();
        let e = env.event();
        e.set_defused(true);
        e.fail(Failure::error("broken")).unwrap();
        match e.value() {
            Err(SimError::EventFailed(Failure::Error(msg))) => assert_eq!(msg, "broken"),
            other => panic!("unexpected: {:?}", other.err()),
        }
    }
}
