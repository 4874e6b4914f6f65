//! Store that hands items out in priority order.
//!
//! Items are kept sorted by the natural [`Value`] order or by a supplied
//! comparator; gets receive the smallest item first, FIFO among equal
//! items.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::{Rc, Weak};

use crate::core::env::Environment;
use crate::core::error::{Result, SimError};
use crate::core::event::Event;
use crate::core::value::Value;
use crate::resources::engine::{PendingOp, WaitQueues};

type Comparator = Rc<dyn Fn(&Value, &Value) -> Ordering>;

struct PriorityStoreState {
    env: Environment,
    capacity: usize,
    /// Sorted ascending; equal items stay in insertion order because new
    /// ones are placed after their equals.
    items: Vec<Value>,
    comparator: Option<Comparator>,
}

impl PriorityStoreState {
    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        match &self.comparator {
            Some(cmp) => cmp(a, b),
            None => a.cmp(b),
        }
    }
}

struct PriorityStoreInner {
    state: PriorityStoreState,
    queues: WaitQueues<PriorityStorePut, PriorityStoreGet>,
}

/// Bounded store ordered by item priority.
#[derive(Clone)]
pub struct PriorityStore {
    inner: Rc<RefCell<PriorityStoreInner>>,
}

#[derive(Clone)]
pub struct PriorityStorePut {
    event: Event,
    item: Value,
    store: Weak<RefCell<PriorityStoreInner>>,
}

#[derive(Clone)]
pub struct PriorityStoreGet {
    event: Event,
    store: Weak<RefCell<PriorityStoreInner>>,
}

impl PendingOp for PriorityStorePut {
    fn event(&self) -> &Event {
        &self.event
    }
}

impl PendingOp for PriorityStoreGet {
    fn event(&self) -> &Event {
        &self.event
    }
}

impl PriorityStore {
    /// Store ordered by the natural [`Value`] order.
    pub fn new(env: &Environment, capacity: usize) -> Result<Self> {
        Self::build(env, capacity, None)
    }

    /// Store ordered by `comparator`.
    pub fn with_comparator(
        env: &Environment,
        capacity: usize,
        comparator: impl Fn(&Value, &Value) -> Ordering + 'static,
    ) -> Result<Self> {
        Self::build(env, capacity, Some(Rc::new(comparator)))
    }

    fn build(env: &Environment, capacity: usize, comparator: Option<Comparator>) -> Result<Self> {
        if capacity == 0 {
            return Err(SimError::InvalidCapacity);
        }
        Ok(PriorityStore {
            inner: Rc::new(RefCell::new(PriorityStoreInner {
                state: PriorityStoreState {
                    env: env.clone(),
                    capacity,
                    items: Vec::new(),
                    comparator,
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

    /// Queue an item for insertion at its sorted position.
    pub fn put(&self, item: impl Into<Value>) -> PriorityStorePut {
        let env = self.inner.borrow().state.env.clone();
        let event = env.event();
        let put = PriorityStorePut {
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

    /// Queue a retrieval of the smallest item.
    pub fn get(&self) -> PriorityStoreGet {
        let env = self.inner.borrow().state.env.clone();
        let event = env.event();
        let get = PriorityStoreGet {
            event: event.clone(),
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

fn trigger_puts(inner: &Rc<RefCell<PriorityStoreInner>>) {
    let inner = &mut *inner.borrow_mut();
    inner.queues.trigger_puts(&mut inner.state, |state, put| {
        if state.items.len() < state.capacity {
            let at = state
                .items
                .iter()
                .position(|item| state.compare(item, &put.item) == Ordering::Greater)
                .unwrap_or(state.items.len());
            state.items.insert(at, put.item.clone());
            put.event.grant(Value::None);
        }
        true
    });
}

fn trigger_gets(inner: &Rc<RefCell<PriorityStoreInner>>) {
    let inner = &mut *inner.borrow_mut();
    inner.queues.trigger_gets(&mut inner.state, |state, get| {
        if !state.items.is_empty() {
            let item = state.items.remove(0);
            get.event.grant(item);
        }
        true
    });
}

impl PriorityStorePut {
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

impl PriorityStoreGet {
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
