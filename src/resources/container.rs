//! Container for continuous or discrete matter.
//!
//! A single numeric level bounded to [0, capacity]. A put of `amount`
//! succeeds only while `level + amount <= capacity`; a get of `amount`
//! only while `level >= amount`. Amounts must be strictly positive.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::core::env::Environment;
use crate::core::error::{Result, SimError};
use crate::core::event::Event;
use crate::core::value::Value;
use crate::resources::engine::{PendingOp, WaitQueues};

struct ContainerState {
    env: Environment,
    capacity: f64,
    level: f64,
}

struct ContainerInner {
    state: ContainerState,
    queues: WaitQueues<ContainerPut, ContainerGet>,
}

/// Level-based container.
#[derive(Clone)]
pub struct Container {
    inner: Rc<RefCell<ContainerInner>>,
}

/// A pending deposit; its event succeeds once the amount fits.
#[derive(Clone)]
pub struct ContainerPut {
    event: Event,
    amount: f64,
    container: Weak<RefCell<ContainerInner>>,
}

/// A pending withdrawal; its event succeeds with the amount taken.
#[derive(Clone)]
pub struct ContainerGet {
    event: Event,
    amount: f64,
    container: Weak<RefCell<ContainerInner>>,
}

impl PendingOp for ContainerPut {
    fn event(&self) -> &Event {
        &self.event
    }
}

impl PendingOp for ContainerGet {
    fn event(&self) -> &Event {
        &self.event
    }
}

impl Container {
    pub fn new(env: &Environment, capacity: f64, initial: f64) -> Result<Self> {
        if capacity <= 0.0 {
            return Err(SimError::InvalidCapacity);
        }
        if initial < 0.0 || initial > capacity {
            return Err(SimError::InvalidLevel { initial, capacity });
        }
        Ok(Container {
            inner: Rc::new(RefCell::new(ContainerInner {
                state: ContainerState {
                    env: env.clone(),
                    capacity,
                    level: initial,
                },
                queues: WaitQueues::new(),
            })),
        })
    }

    pub fn capacity(&self) -> f64 {
        self.inner.borrow().state.capacity
    }

    /// Current fill level.
    pub fn level(&self) -> f64 {
        self.inner.borrow().state.level
    }

    /// Queue a deposit of `amount` (> 0).
    pub fn put(&self, amount: f64) -> Result<ContainerPut> {
        if amount <= 0.0 {
            return Err(SimError::InvalidAmount(amount));
        }
        let env = self.inner.borrow().state.env.clone();
        let event = env.event();
        let put = ContainerPut {
            event: event.clone(),
            amount,
            container: Rc::downgrade(&self.inner),
        };
        let weak = Rc::downgrade(&self.inner);
        event.add_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                trigger_gets(&inner);
            }
        });
        self.inner.borrow_mut().queues.puts.push(put.clone());
        trigger_puts(&self.inner);
        Ok(put)
    }

    /// Queue a withdrawal of `amount` (> 0).
    pub fn get(&self, amount: f64) -> Result<ContainerGet> {
        if amount <= 0.0 {
            return Err(SimError::InvalidAmount(amount));
        }
        let env = self.inner.borrow().state.env.clone();
        let event = env.event();
        let get = ContainerGet {
            event: event.clone(),
            amount,
            container: Rc::downgrade(&self.inner),
        };
        let weak = Rc::downgrade(&self.inner);
        event.add_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                trigger_puts(&inner);
            }
        });
        self.inner.borrow_mut().queues.gets.push(get.clone());
        trigger_gets(&self.inner);
        Ok(get)
    }
}

fn trigger_puts(inner: &Rc<RefCell<ContainerInner>>) {
    let inner = &mut *inner.borrow_mut();
    inner.queues.trigger_puts(&mut inner.state, |state, put| {
        if state.level + put.amount <= state.capacity {
            state.level += put.amount;
            put.event.grant(Value::None);
        }
        true
    });
}

fn trigger_gets(inner: &Rc<RefCell<ContainerInner>>) {
    let inner = &mut *inner.borrow_mut();
    inner.queues.trigger_gets(&mut inner.state, |state, get| {
        if state.level >= get.amount {
            state.level -= get.amount;
            get.event.grant(Value::from(get.amount));
        }
        true
    });
}

impl ContainerPut {
    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }

    pub fn cancel(&self) {
        if self.event.is_triggered() {
            return;
        }
        if let Some(inner) = self.container.upgrade() {
            inner.borrow_mut().queues.cancel_put(&self.event);
        }
    }
}

impl ContainerGet {
    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }

    pub fn cancel(&self) {
        if self.event.is_triggered() {
            return;
        }
        if let Some(inner) = self.container.upgrade() {
            inner.borrow_mut().queues.cancel_get(&self.event);
        }
    }
}
