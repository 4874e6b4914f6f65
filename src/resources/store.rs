//! Bounded FIFO store of items.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use crate::core::env::Environment;
use crate::core::error::{Result, SimError};
use crate::core::event::Event;
use crate::core::value::Value;
use crate::resources::engine::{PendingOp, WaitQueues};

struct StoreState {
    env: Environment,
    capacity: usize,
    items: VecDeque<Value>,
}

struct StoreInner {
    state: StoreState,
    queues: WaitQueues<StorePut, StoreGet>,
}

/// FIFO store holding up to `capacity` items. Puts block while the store
/// is full, gets block while it is empty.
#[derive(Clone)]
pub struct Store {
    inner: Rc<RefCell<StoreInner>>,
}

/// A pending put; its event succeeds once the item has been accepted.
#[derive(Clone)]
pub struct StorePut {
    event: Event,
    item: Value,
    store: Weak<RefCell<StoreInner>>,
}

/// A pending get; its event succeeds with the retrieved item.
#[derive(Clone)]
pub struct StoreGet {
    event: Event,
    store: Weak<RefCell<StoreInner>>,
}

impl PendingOp for StorePut {
    fn event(&self) -> &Event {
        &self.event
    }
}

impl PendingOp for StoreGet {
    fn event(&self) -> &Event {
        &self.event
    }
}

impl Store {
    pub fn new(env: &Environment, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(SimError::InvalidCapacity);
        }
        Ok(Store {
            inner: Rc::new(RefCell::new(StoreInner {
                state: StoreState {
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

    /// Items currently in the store.
    pub fn item_count(&self) -> usize {
        self.inner.borrow().state.items.len()
    }

    /// Queue an item for insertion.
    pub fn put(&self, item: impl Into<Value>) -> StorePut {
        let env = self.inner.borrow().state.env.clone();
        let event = env.event();
        let put = StorePut {
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

    /// Queue a retrieval of the oldest item.
    pub fn get(&self) -> StoreGet {
        let env = self.inner.borrow().state.env.clone();
        let event = env.event();
        let get = StoreGet {
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

fn trigger_puts(inner: &Rc<RefCell<StoreInner>>) {
    let inner = &mut *inner.borrow_mut();
    inner.queues.trigger_puts(&mut inner.state, |state, put| {
        if state.items.len() < state.capacity {
            state.items.push_back(put.item.clone());
            put.event.grant(Value::None);
        }
        true
    });
}

fn trigger_gets(inner: &Rc<RefCell<StoreInner>>) {
    let inner = &mut *inner.borrow_mut();
    inner.queues.trigger_gets(&mut inner.state, |state, get| {
        if let Some(item) = state.items.pop_front() {
            get.event.grant(item);
        }
        true
    });
}

impl StorePut {
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Withdraw a queued put; a no-op once accepted.
    pub fn cancel(&self) {
        if self.event.is_triggered() {
            return;
        }
        if let Some(inner) = self.store.upgrade() {
            inner.borrow_mut().queues.cancel_put(&self.event);
        }
    }
}

impl StoreGet {
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Withdraw a queued get; a no-op once satisfied.
    pub fn cancel(&self) {
        if self.event.is_triggered() {
            return;
        }
        if let Some(inner) = self.store.upgrade() {
            inner.borrow_mut().queues.cancel_get(&self.event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_items_come_out_in_insertion_order() {
        let env = Environment::new();
        let store = Store::new(&env, 10).unwrap();
        store.put("a");
        store.put("b");
        let first = store.get();
        let second = store.get();
        env.run().unwrap();
        assert_eq!(first.event().value().unwrap(), Value::from("a"));
        assert_eq!(second.event().value().unwrap(), Value::from("b"));
    }

    #[test]
    fn test_get_blocks_until_put() {
        let env = Environment::new();
        let store = Store::new(&env, 1).unwrap();
        let get = store.get();
        assert!(!get.event().is_triggered());
        store.put(7);
        assert!(get.event().is_triggered());
        assert_eq!(get.event().value().unwrap(), Value::from(7));
    }

    #[test]
    fn test_put_blocks_when_full() {
        let env = Environment::new();
        let store = Store::new(&env, 1).unwrap();
        let first = store.put(1);
        let second = store.put(2);
        assert!(first.event().is_triggered());
        assert!(!second.event().is_triggered());
        assert_eq!(store.item_count(), 1);

        let get = store.get();
        env.run().unwrap();
        // The get freed a slot, letting the queued put through.
        assert!(second.event().is_triggered());
        assert_eq!(get.event().value().unwrap(), Value::from(1));
        assert_eq!(store.item_count(), 1);
    }

    #[test]
    fn test_cancelled_get_is_skipped() {
        let env = Environment::new();
        let store = Store::new(&env, 1).unwrap();
        let abandoned = store.get();
        let kept = store.get();
        abandoned.cancel();
        store.put("only");
        env.run().unwrap();
        assert!(!abandoned.event().is_triggered());
        assert_eq!(kept.event().value().unwrap(), Value::from("only"));
    }
}
