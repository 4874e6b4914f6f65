//! Plain capacity pool.
//!
//! Holds up to `capacity` concurrent users; requests are granted in
//! submission order, releases always go through immediately. A release
//! for a request that is not currently holding the pool is rejected at
//! the call site.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::core::env::Environment;
use crate::core::error::{Result, SimError};
use crate::core::event::Event;
use crate::core::value::Value;
use crate::resources::engine::{PendingOp, WaitQueues};

struct PoolState {
    env: Environment,
    capacity: usize,
    /// Request events of the current holders.
    users: Vec<Event>,
}

struct PoolInner {
    state: PoolState,
    queues: WaitQueues<Request, Release>,
}

/// FIFO capacity pool.
#[derive(Clone)]
pub struct Resource {
    inner: Rc<RefCell<PoolInner>>,
}

/// A pending or granted request. Await its event to acquire the pool.
#[derive(Clone)]
pub struct Request {
    event: Event,
    pool: Weak<RefCell<PoolInner>>,
}

/// A release in flight; its event succeeds once the slot is returned.
#[derive(Clone)]
pub struct Release {
    event: Event,
    request: Event,
}

impl PendingOp for Request {
    fn event(&self) -> &Event {
        &self.event
    }
}

impl PendingOp for Release {
    fn event(&self) -> &Event {
        &self.event
    }
}

impl Resource {
    pub fn new(env: &Environment, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(SimError::InvalidCapacity);
        }
        Ok(Resource {
            inner: Rc::new(RefCell::new(PoolInner {
                state: PoolState {
                    env: env.clone(),
                    capacity,
                    users: Vec::new(),
                },
                queues: WaitQueues::new(),
            })),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.borrow().state.capacity
    }

    /// Number of current holders.
    pub fn count(&self) -> usize {
        self.inner.borrow().state.users.len()
    }

    /// Number of requests waiting for a slot.
    pub fn waiting_count(&self) -> usize {
        self.inner.borrow().queues.puts.len()
    }

    /// Queue a request for one slot. Granted immediately if capacity
    /// allows, otherwise in submission order as holders release.
    pub fn request(&self) -> Request {
        let env = self.inner.borrow().state.env.clone();
        let event = env.event();
        let request = Request {
            event: event.clone(),
            pool: Rc::downgrade(&self.inner),
        };
        let weak = Rc::downgrade(&self.inner);
        event.add_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                trigger_gets(&inner);
            }
        });
        self.inner.borrow_mut().queues.puts.push(request.clone());
        trigger_puts(&self.inner);
        request
    }

    /// Return the slot held by `request`. Errors if the request is not a
    /// current holder.
    pub fn release(&self, request: &Request) -> Result<Release> {
        {
            let inner = self.inner.borrow();
            if !inner.state.users.contains(&request.event) {
                return Err(SimError::NotHolder);
            }
        }
        let env = self.inner.borrow().state.env.clone();
        let event = env.event();
        let release = Release {
            event: event.clone(),
            request: request.event.clone(),
        };
        let weak = Rc::downgrade(&self.inner);
        event.add_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                trigger_puts(&inner);
            }
        });
        self.inner.borrow_mut().queues.gets.push(release.clone());
        trigger_gets(&self.inner);
        Ok(release)
    }
}

fn trigger_puts(inner: &Rc<RefCell<PoolInner>>) {
    let inner = &mut *inner.borrow_mut();
    inner.queues.trigger_puts(&mut inner.state, |state, request| {
        if state.users.len() < state.capacity {
            state.users.push(request.event.clone());
            request.event.grant(Value::None);
            tracing::trace!(
                "t={}: pool grant request #{} ({}/{})",
                state.env.now(),
                request.event.id(),
                state.users.len(),
                state.capacity
            );
        }
        true
    });
}

fn trigger_gets(inner: &Rc<RefCell<PoolInner>>) {
    let inner = &mut *inner.borrow_mut();
    inner.queues.trigger_gets(&mut inner.state, |state, release| {
        state.users.retain(|user| *user != release.request);
        release.event.grant(Value::None);
        true
    });
}

impl Request {
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Withdraw a queued request; a no-op once granted or failed.
    pub fn cancel(&self) {
        if self.event.is_triggered() {
            return;
        }
        if let Some(inner) = self.pool.upgrade() {
            inner.borrow_mut().queues.cancel_put(&self.event);
        }
    }
}

impl Release {
    pub fn event(&self) -> &Event {
        &self.event
    }
}
