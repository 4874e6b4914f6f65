//! Store with predicate-filtered retrieval.
//!
//! A get carries a predicate and is satisfied by the first matching item
//! scanning from the front. An unsatisfied get at the head of the queue
//! blocks the gets behind it, like every other discipline.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use crate::core::env::Environment;
use crate::core::error::{Result, SimError};
use crate::core::event::Event;
use crate::core::value::Value;
use crate::resources::engine::{PendingOp, WaitQueues};

type Filter = Rc<dyn Fn(&Value) -> bool>;

struct FilterState {
    env: Environment,
    capacity: usize,
    items: VecDeque<Value>,
}

struct FilterInner {
    state: FilterState,
    queues: WaitQueues<FilterPut, FilterGet>,
}

/// Bounded store whose gets select items by predicate.
#[derive(Clone)]
pub struct FilterStore {
    inner: Rc<RefCell<FilterInner>>,
}

#[derive(Clone)]
pub struct FilterPut {
    event: Event,
    item: Value,
    store: Weak<RefCell<FilterInner>>,
}

#[derive(Clone)]
pub struct FilterGet {
    event: Event,
    filter: Filter,
    store: Weak<RefCell<FilterInner>>,
}

impl PendingOp for FilterPut {
    fn event(&self) -> &Event {
        &self.event
    }
}

impl PendingOp for FilterGet {
    fn event(&self) -> &Event {
        &self.event
    }
}

impl FilterStore {
    pub fn new(env: &Environment, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(SimError::InvalidCapacity);
        }
        Ok(FilterStore {
            inner: Rc::new(RefCell::new(FilterInner {
                state: FilterState {
                    env: env.clone(),
                    capacity,
                    items: VecDeque::new(),
                },
                queues: WaitQueues::new(),
            })),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.borrow().state.capacity
    }

    pub fn item_count(&self) -> usize {
        self.inner.borrow().state.items.len()
    }

    /// Queue an item for insertion.
    pub fn put(&self, item: impl Into<Value>) -> FilterPut {
        let env = self.inner.borrow().state.env.clone();
        let event = env.event();
        let put = FilterPut {
            event: event.clone(),
            item: item.into(),
            store: Rc::downgrade(&self.inner),
        };
        let weak = Rc::downgrade(&self.inner);
        event.add_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                trigger_gets(&inner);
            }
        });
        self.inner.borrow_mut().queues.puts.push(put.clone());
        trigger_puts(&self.inner);
        put
    }

    /// Queue a retrieval of the first item matching `filter`.
    pub fn get(&self, filter: impl Fn(&Value) -> bool + 'static) -> FilterGet {
        let env = self.inner.borrow().state.env.clone();
        let event = env.event();
        let get = FilterGet {
            event: event.clone(),
            filter: Rc::new(filter),
            store: Rc::downgrade(&self.inner),
        };
        let weak = Rc::downgrade(&self.inner);
        event.add_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                trigger_puts(&inner);
            }
        });
        self.inner.borrow_mut().queues.gets.push(get.clone());
        trigger_gets(&self.inner);
        get
    }
}

fn trigger_puts(inner: &Rc<RefCell<FilterInner>>) {
    let inner = &mut *inner.borrow_mut();
    inner.queues.trigger_puts(&mut inner.state, |state, put| {
        if state.items.len() < state.capacity {
            state.items.push_back(put.item.clone());
            put.event.grant(Value::None);
        }
        true
    });
}

fn trigger_gets(inner: &Rc<RefCell<FilterInner>>) {
    let inner = &mut *inner.borrow_mut();
    inner.queues.trigger_gets(&mut inner.state, |state, get| {
        let found = state.items.iter().position(|item| (get.filter)(item));
        if let Some(at) = found {
            let item = state.items.remove(at).unwrap_or_default();
            get.event.grant(item);
        }
        true
    });
}

impl FilterPut {
    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn cancel(&self) {
        if self.event.is_triggered() {
            return;
        }
        if let Some(inner) = self.store.upgrade() {
            inner.borrow_mut().queues.cancel_put(&self.event);
        }
    }
}

impl FilterGet {
    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn cancel(&self) {
        if self.event.is_triggered() {
            return;
        }
        if let Some(inner) = self.store.upgrade() {
            inner.borrow_mut().queues.cancel_get(&self.event);
        }
    }
}
