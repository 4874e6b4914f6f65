//! Execution environment: the virtual clock and the ready queue.
//!
//! Time advances only by dispatching scheduled entries. Entries are
//! totally ordered by (time, priority, sequence), which is the sole
//! source of determinism for same-instant events: identical scheduling
//! calls in identical order always dispatch in the same order.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use ordered_float::OrderedFloat;

use crate::core::condition::{self, ConditionKind};
use crate::core::error::{Failure, Result, SimError};
use crate::core::event::{Event, Outcome};
use crate::core::process::{Context, Process};
use crate::core::value::Value;

/// Dispatch priority for entries scheduled at the same instant.
/// `Urgent` sorts before `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Urgent,
    Normal,
}

/// Entry in the ready queue.
#[derive(Debug, Clone)]
struct ScheduledEntry {
    time: OrderedFloat<f64>,
    priority: Priority,
    seq: u64,
    event: Event,
}

impl ScheduledEntry {
    fn key(&self) -> (OrderedFloat<f64>, Priority, u64) {
        (self.time, self.priority, self.seq)
    }
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ScheduledEntry {}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other.key().cmp(&self.key())
    }
}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) struct EnvCore {
    now: f64,
    queue: BinaryHeap<ScheduledEntry>,
    /// Shared monotonic counter for event ids and schedule sequence
    /// numbers.
    next_seq: u64,
    active: Option<Process>,
}

/// Handle to a simulation environment. Cheap to clone; all clones share
/// the same clock and ready queue.
#[derive(Clone)]
pub struct Environment {
    core: Rc<RefCell<EnvCore>>,
}

impl Environment {
    pub fn new() -> Self {
        Self::with_start(0.0)
    }

    /// Environment whose clock starts at `initial`.
    pub fn with_start(initial: f64) -> Self {
        Environment {
            core: Rc::new(RefCell::new(EnvCore {
                now: initial,
                queue: BinaryHeap::new(),
                next_seq: 0,
                active: None,
            })),
        }
    }

    pub(crate) fn from_core(core: Rc<RefCell<EnvCore>>) -> Self {
        Environment { core }
    }

    pub(crate) fn core_ptr(&self) -> *const RefCell<EnvCore> {
        Rc::as_ptr(&self.core)
    }

    /// Current virtual time.
    pub fn now(&self) -> f64 {
        self.core.borrow().now
    }

    /// Time of the next scheduled entry, or infinity if none.
    pub fn peek(&self) -> f64 {
        self.core
            .borrow()
            .queue
            .peek()
            .map(|e| e.time.into_inner())
            .unwrap_or(f64::INFINITY)
    }

    /// Number of entries currently scheduled.
    pub fn scheduled_count(&self) -> usize {
        self.core.borrow().queue.len()
    }

    /// Create a fresh pending event bound to this environment.
    pub fn event(&self) -> Event {
        let id = self.next_seq();
        Event::new(id, Rc::downgrade(&self.core))
    }

    /// An event that succeeds with no value after `delay`.
    pub fn timeout(&self, delay: f64) -> Result<Event> {
        self.timeout_with(delay, Value::None)
    }

    /// An event that succeeds with `value` after `delay`.
    pub fn timeout_with(&self, delay: f64, value: impl Into<Value>) -> Result<Event> {
        if delay < 0.0 {
            return Err(SimError::NegativeDelay(delay));
        }
        let event = self.event();
        event.mark_settled(Outcome::Success(value.into()));
        self.push(&event, Priority::Normal, delay);
        Ok(event)
    }

    /// Composite event that succeeds once every operand has succeeded.
    /// An empty slice resolves immediately with an empty value map.
    pub fn all_of(&self, events: &[Event]) -> Result<Event> {
        condition::build(self, ConditionKind::All, events)
    }

    /// Composite event that succeeds once any operand has succeeded.
    pub fn any_of(&self, events: &[Event]) -> Result<Event> {
        condition::build(self, ConditionKind::Any, events)
    }

    /// Create and start a process. The body begins executing at the
    /// current instant, before any other same-instant activity.
    pub fn process<F, Fut>(&self, body: F) -> Process
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = std::result::Result<Value, Failure>> + 'static,
    {
        Process::spawn(self, body)
    }

    /// The process currently executing its body, if any.
    pub fn active_process(&self) -> Option<Process> {
        self.core.borrow().active.clone()
    }

    pub(crate) fn set_active(&self, process: Option<Process>) {
        self.core.borrow_mut().active = process;
    }

    /// Insert `event` into the ready queue at `now + delay`.
    pub fn schedule(&self, event: &Event, priority: Priority, delay: f64) -> Result<()> {
        if delay < 0.0 {
            return Err(SimError::NegativeDelay(delay));
        }
        if !event.same_env(self) {
            return Err(SimError::MixedEnvironments);
        }
        self.push(event, priority, delay);
        Ok(())
    }

    pub(crate) fn push(&self, event: &Event, priority: Priority, delay: f64) {
        let mut core = self.core.borrow_mut();
        let time = core.now + delay;
        let seq = core.next_seq;
        core.next_seq += 1;
        tracing::trace!("t={}: schedule event #{} at t={} ({:?})", core.now, event.id(), time, priority);
        core.queue.push(ScheduledEntry {
            time: OrderedFloat(time),
            priority,
            seq,
            event: event.clone(),
        });
    }

    fn next_seq(&self) -> u64 {
        let mut core = self.core.borrow_mut();
        let seq = core.next_seq;
        core.next_seq += 1;
        seq
    }

    /// Dispatch the next scheduled entry: advance the clock, run the
    /// event's callbacks in registration order, and surface the failure
    /// of a non-defused failed event.
    pub fn step(&self) -> Result<()> {
        let entry = {
            let mut core = self.core.borrow_mut();
            match core.queue.pop() {
                Some(entry) => {
                    core.now = entry.time.into_inner();
                    entry
                }
                None => return Err(SimError::EmptySchedule),
            }
        };
        let event = entry.event;
        tracing::trace!("t={}: dispatch event #{}", entry.time.into_inner(), event.id());
        let callbacks = event.detach_callbacks();
        for (_, cb) in callbacks {
            cb(&event);
        }
        if let Outcome::Failure(cause) = event.outcome() {
            if !event.is_defused() {
                return Err(SimError::UnhandledFailure(cause));
            }
        }
        Ok(())
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

    /// Run until `until` has been processed, returning its value or
    /// re-raising its failure. Errors if the queue empties first.
    pub fn run_until(&self, until: &Event) -> Result<Value> {
        loop {
            if until.is_processed() {
                return Self::finish(until);
            }
            match self.step() {
                Ok(()) => {}
                Err(SimError::EmptySchedule) => return Err(SimError::NoEventsBeforeTarget),
                Err(e) => {
                    // The target itself may be the event whose failure
                    // aborted the step; report it as the run outcome.
                    if until.is_processed() {
                        return Self::finish(until);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Run until the clock reaches the absolute time `until`.
    pub fn run_until_time(&self, until: f64) -> Result<Value> {
        let now = self.now();
        if until <= now {
            return Err(SimError::UntilInPast);
        }
        let target = self.timeout(until - now)?;
        self.run_until(&target)
    }

    fn finish(until: &Event) -> Result<Value> {
        match until.outcome() {
            Outcome::Success(v) => Ok(v),
            Outcome::Failure(f) => Err(SimError::EventFailed(f)),
            Outcome::Pending => Err(SimError::ValueNotAvailable),
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("Environment")
            .field("now", &core.now)
            .field("scheduled", &core.queue.len())
            .finish()
    }
}
