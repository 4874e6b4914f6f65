//! Processes: suspend/resume units of sequential logic.
//!
//! A process wraps an async body that advances by awaiting events through
//! its [`Context`]. Suspension happens only inside [`Context::wait`];
//! resumption is a plain poll performed by the scheduler when the awaited
//! event is dispatched. There are no threads: at most one process body is
//! executing at any virtual instant.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context as TaskContext, Poll, Waker};

use crate::core::env::{Environment, Priority};
use crate::core::error::{Failure, Result, SimError};
use crate::core::event::{CallbackHandle, Event, Outcome};
use crate::core::value::Value;

type BodyFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, Failure>>>>;

pub(crate) struct ProcessCore {
    /// The process's own completion event.
    event: Event,
    /// The stored body; taken while polling, absent after termination.
    future: Option<BodyFuture>,
    /// Set once the initialization event has dispatched.
    started: bool,
    /// The event the process is currently suspended on, with the resume
    /// callback registered there.
    target: Option<(Event, CallbackHandle)>,
    /// Failure to deliver at the next poll instead of the target's
    /// outcome (interrupt injection).
    injected: Option<Failure>,
}

/// Handle to a running or terminated process. The process's own [`Event`]
/// settles with the body's return value or failure.
#[derive(Clone)]
pub struct Process {
    core: Rc<RefCell<ProcessCore>>,
}

impl Process {
    pub(crate) fn spawn<F, Fut>(env: &Environment, body: F) -> Process
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = std::result::Result<Value, Failure>> + 'static,
    {
        let event = env.event();
        let core = Rc::new(RefCell::new(ProcessCore {
            event: event.clone(),
            future: None,
            started: false,
            target: None,
            injected: None,
        }));
        let ctx = Context {
            env: env.clone(),
            core: Rc::downgrade(&core),
        };
        core.borrow_mut().future = Some(Box::pin(body(ctx)));

        // Initialization runs urgently at the current instant so the body
        // starts before any other same-instant activity, interrupts
        // included.
        let init = env.event();
        init.mark_settled(Outcome::Success(Value::None));
        let weak = Rc::downgrade(&core);
        init.add_callback(move |_| {
            if let Some(core) = weak.upgrade() {
                resume(&core);
            }
        });
        env.push(&init, Priority::Urgent, 0.0);

        tracing::debug!("spawned process (event #{})", event.id());
        Process { core }
    }

    /// The completion event: settles with the body's return value, or
    /// with its failure cause.
    pub fn event(&self) -> Event {
        self.core.borrow().event.clone()
    }

    /// Alive until the completion event settles.
    pub fn is_alive(&self) -> bool {
        !self.core.borrow().event.is_triggered()
    }

    /// The event this process is currently suspended on, if any.
    pub fn target(&self) -> Option<Event> {
        self.core.borrow().target.as_ref().map(|(e, _)| e.clone())
    }

    /// Interrupt the process with `cause`.
    ///
    /// Delivered as an urgent failure event: a pending `wait` fails with
    /// [`Failure::Interrupt`], and a process that has not started yet
    /// fails outright. Interrupting a terminated process or the currently
    /// active process is rejected.
    pub fn interrupt(&self, cause: impl Into<Value>) -> Result<()> {
        if !self.is_alive() {
            return Err(SimError::ProcessTerminated);
        }
        let event = self.event();
        let env = event.env().ok_or(SimError::EnvironmentGone)?;
        if let Some(active) = env.active_process() {
            if Rc::ptr_eq(&active.core, &self.core) {
                return Err(SimError::SelfInterrupt);
            }
        }

        let failure = Failure::Interrupt {
            cause: cause.into(),
        };
        let interruption = env.event();
        interruption.mark_settled(Outcome::Failure(failure));
        // Pre-defused so the interruption itself never crashes the loop.
        interruption.set_defused(true);
        let weak = Rc::downgrade(&self.core);
        interruption.add_callback(move |ev| {
            if let Some(core) = weak.upgrade() {
                deliver_interrupt(&core, ev);
            }
        });
        env.push(&interruption, Priority::Urgent, 0.0);
        Ok(())
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.borrow();
        write!(
            f,
            "Process(event #{}, alive={})",
            core.event.id(),
            !core.event.is_triggered()
        )
    }
}

/// Poll the body once. Called from event dispatch: at initialization, on
/// settlement of the awaited target, and on interrupt injection.
pub(crate) fn resume(core: &Rc<RefCell<ProcessCore>>) {
    let (mut future, event) = {
        let mut c = core.borrow_mut();
        let Some(future) = c.future.take() else {
            return;
        };
        c.started = true;
        c.target = None;
        (future, c.event.clone())
    };
    let Some(env) = event.env() else { return };

    env.set_active(Some(Process { core: core.clone() }));
    let mut cx = TaskContext::from_waker(Waker::noop());
    let poll = future.as_mut().poll(&mut cx);
    env.set_active(None);

    match poll {
        Poll::Pending => {
            core.borrow_mut().future = Some(future);
        }
        Poll::Ready(Ok(value)) => {
            tracing::debug!("process (event #{}) returned", event.id());
            if !event.is_triggered() {
                let _ = event.succeed(value);
            }
        }
        Poll::Ready(Err(failure)) => {
            tracing::debug!("process (event #{}) failed: {}", event.id(), failure);
            if !event.is_triggered() {
                let _ = event.fail(failure);
            }
        }
    }
}

fn deliver_interrupt(core: &Rc<RefCell<ProcessCore>>, interruption: &Event) {
    let Outcome::Failure(failure) = interruption.outcome() else {
        return;
    };
    enum Action {
        Resume,
        FailDirectly(Event),
        Nothing,
    }
    let action = {
        let mut c = core.borrow_mut();
        if c.event.is_triggered() {
            // Terminated between scheduling and delivery.
            Action::Nothing
        } else if let Some((target, handle)) = c.target.take() {
            // Deregister so a later natural settlement of the target
            // cannot resume the process a second time.
            target.remove_callback(handle);
            c.injected = Some(failure.clone());
            Action::Resume
        } else if !c.started {
            c.future = None;
            Action::FailDirectly(c.event.clone())
        } else {
            Action::Nothing
        }
    };
    match action {
        Action::Resume => resume(core),
        Action::FailDirectly(event) => {
            let _ = event.fail(failure);
        }
        Action::Nothing => {}
    }
}

/// Capability handed to a process body: await events, reach the
/// environment.
#[derive(Clone)]
pub struct Context {
    env: Environment,
    core: Weak<RefCell<ProcessCore>>,
}

impl Context {
    /// The owning environment.
    pub fn env(&self) -> Environment {
        self.env.clone()
    }

    /// Suspend until `event` settles; resolves to its value or failure.
    /// Awaiting a failed event defuses it: the caller takes
    /// responsibility for the failure.
    pub fn wait(&self, event: &Event) -> Wait {
        Wait {
            core: self.core.clone(),
            event: event.clone(),
            registered: false,
        }
    }

    /// Suspend for `delay` units of virtual time.
    pub fn hold(&self, delay: f64) -> Result<Wait> {
        let timeout = self.env.timeout(delay)?;
        Ok(self.wait(&timeout))
    }
}

/// Future returned by [`Context::wait`].
pub struct Wait {
    core: Weak<RefCell<ProcessCore>>,
    event: Event,
    registered: bool,
}

impl Future for Wait {
    type Output = std::result::Result<Value, Failure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(core) = this.core.upgrade() else {
            return Poll::Pending;
        };

        // An injected interrupt preempts whatever the target would say.
        if let Some(failure) = core.borrow_mut().injected.take() {
            return Poll::Ready(Err(failure));
        }

        if this.event.is_processed() {
            return match this.event.outcome() {
                Outcome::Success(value) => Poll::Ready(Ok(value)),
                Outcome::Failure(failure) => {
                    this.event.set_defused(true);
                    Poll::Ready(Err(failure))
                }
                Outcome::Pending => Poll::Pending,
            };
        }

        if !this.registered {
            let weak = this.core.clone();
            if let Some(handle) = this.event.add_callback(move |_| {
                if let Some(core) = weak.upgrade() {
                    resume(&core);
                }
            }) {
                core.borrow_mut().target = Some((this.event.clone(), handle));
                this.registered = true;
            }
        }
        Poll::Pending
    }
}
