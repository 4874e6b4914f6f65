//! Priority-ordered capacity pool.
//!
//! Requests are granted by ascending priority value (lower is served
//! first), FIFO within equal priority. Tracks grant counts, waiting
//! times and time-weighted utilization, and supports racing a request
//! against a timeout.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::core::env::Environment;
use crate::core::error::{Failure, Result, SimError};
use crate::core::event::Event;
use crate::core::value::Value;
use crate::resources::engine::{PendingOp, WaitQueues};

/// Grant/wait/utilization counters for a pool, updated on grant and
/// release.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    granted: u64,
    preemptions: u64,
    total_wait: f64,
    busy_area: f64,
    last_change: f64,
}

impl PoolStats {
    /// Fold the busy time since the last state change into the running
    /// integral. Call with the holder count *before* the change.
    pub(crate) fn account(&mut self, now: f64, in_use: usize) {
        self.busy_area += in_use as f64 * (now - self.last_change);
        self.last_change = now;
    }

    pub(crate) fn on_grant(&mut self, waited: f64) {
        self.granted += 1;
        self.total_wait += waited;
    }

    pub(crate) fn on_preemption(&mut self) {
        self.preemptions += 1;
    }

    pub fn granted(&self) -> u64 {
        self.granted
    }

    pub fn preemptions(&self) -> u64 {
        self.preemptions
    }

    pub fn total_wait(&self) -> f64 {
        self.total_wait
    }

    /// Mean time granted requests spent queued.
    pub fn average_wait(&self) -> f64 {
        if self.granted == 0 {
            0.0
        } else {
            self.total_wait / self.granted as f64
        }
    }

    /// Time-weighted fraction of capacity in use between the clock
    /// origin and `now`.
    pub(crate) fn utilization_at(&self, now: f64, in_use: usize, capacity: usize) -> f64 {
        if now <= 0.0 {
            return 0.0;
        }
        let area = self.busy_area + in_use as f64 * (now - self.last_change);
        area / (now * capacity as f64)
    }
}

struct PriorityState {
    env: Environment,
    capacity: usize,
    users: Vec<PriorityRequest>,
    stats: PoolStats,
    next_order: u64,
}

struct PriorityInner {
    state: PriorityState,
    queues: WaitQueues<PriorityRequest, PriorityRelease>,
}

/// Capacity pool granting by (priority, submission order).
#[derive(Clone)]
pub struct PriorityResource {
    inner: Rc<RefCell<PriorityInner>>,
}

/// A request with a priority; lower values are served first.
#[derive(Clone)]
pub struct PriorityRequest {
    event: Event,
    pool: Weak<RefCell<PriorityInner>>,
    priority: i64,
    order: u64,
    created: f64,
}

#[derive(Clone)]
pub struct PriorityRelease {
    event: Event,
    request: Event,
}

impl PendingOp for PriorityRequest {
    fn event(&self) -> &Event {
        &self.event
    }
}

impl PendingOp for PriorityRelease {
    fn event(&self) -> &Event {
        &self.event
    }
}

impl PriorityResource {
    pub fn new(env: &Environment, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(SimError::InvalidCapacity);
        }
        Ok(PriorityResource {
            inner: Rc::new(RefCell::new(PriorityInner {
                state: PriorityState {
                    env: env.clone(),
                    capacity,
                    users: Vec::new(),
                    stats: PoolStats::default(),
                    next_order: 0,
                },
                queues: WaitQueues::new(),
            })),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.borrow().state.capacity
    }

    pub fn count(&self) -> usize {
        self.inner.borrow().state.users.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.borrow().queues.puts.len()
    }

    pub fn granted_count(&self) -> u64 {
        self.inner.borrow().state.stats.granted()
    }

    pub fn total_wait_time(&self) -> f64 {
        self.inner.borrow().state.stats.total_wait()
    }

    pub fn average_wait(&self) -> f64 {
        self.inner.borrow().state.stats.average_wait()
    }

    pub fn utilization(&self) -> f64 {
        let inner = self.inner.borrow();
        let state = &inner.state;
        state
            .stats
            .utilization_at(state.env.now(), state.users.len(), state.capacity)
    }

    /// Queue a request at `priority`; lower values outrank higher ones.
    pub fn request(&self, priority: i64) -> PriorityRequest {
        let (env, order, created) = {
            let mut inner = self.inner.borrow_mut();
            let order = inner.state.next_order;
            inner.state.next_order += 1;
            (inner.state.env.clone(), order, inner.state.env.now())
        };
        let event = env.event();
        let request = PriorityRequest {
            event: event.clone(),
            pool: Rc::downgrade(&self.inner),
            priority,
            order,
            created,
        };
        let weak = Rc::downgrade(&self.inner);
        event.add_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                trigger_gets(&inner);
            }
        });
        {
            let mut inner = self.inner.borrow_mut();
            let puts = &mut inner.queues.puts;
            let at = puts
                .iter()
                .position(|queued| (queued.priority, queued.order) > (priority, order))
                .unwrap_or(puts.len());
            puts.insert(at, request.clone());
        }
        trigger_puts(&self.inner);
        request
    }

    /// Queue a request and race it against a timer: if the timer fires
    /// first the request is cancelled and fails with
    /// [`Failure::RequestTimeout`].
    pub fn request_with_timeout(&self, priority: i64, timeout: f64) -> Result<PriorityRequest> {
        let env = self.inner.borrow().state.env.clone();
        let timer = env.timeout(timeout)?;
        let request = self.request(priority);
        let weak = Rc::downgrade(&self.inner);
        let racer = request.clone();
        timer.add_callback(move |_| {
            if racer.event.is_triggered() {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().queues.cancel_put(&racer.event);
            }
            tracing::debug!("request #{} timed out after {}", racer.event.id(), timeout);
            racer.event.reject(Failure::RequestTimeout { after: timeout });
        });
        Ok(request)
    }

    /// Return the slot held by `request`. Errors if the request is not a
    /// current holder.
    pub fn release(&self, request: &PriorityRequest) -> Result<PriorityRelease> {
        {
            let inner = self.inner.borrow();
            if !inner
                .state
                .users
                .iter()
                .any(|user| user.event == request.event)
            {
                return Err(SimError::NotHolder);
            }
        }
        let env = self.inner.borrow().state.env.clone();
        let event = env.event();
        let release = PriorityRelease {
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

fn trigger_puts(inner: &Rc<RefCell<PriorityInner>>) {
    let inner = &mut *inner.borrow_mut();
    inner.queues.trigger_puts(&mut inner.state, |state, request| {
        if state.users.len() < state.capacity {
            let now = state.env.now();
            state.stats.account(now, state.users.len());
            state.stats.on_grant(now - request.created);
            state.users.push(request.clone());
            request.event.grant(Value::None);
            tracing::trace!(
                "t={}: priority pool grant #{} (priority {})",
                now,
                request.event.id(),
                request.priority
            );
        }
        true
    });
}

fn trigger_gets(inner: &Rc<RefCell<PriorityInner>>) {
    let inner = &mut *inner.borrow_mut();
    inner.queues.trigger_gets(&mut inner.state, |state, release| {
        let now = state.env.now();
        state.stats.account(now, state.users.len());
        state.users.retain(|user| user.event != release.request);
        release.event.grant(Value::None);
        true
    });
}

impl PriorityRequest {
    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    /// Virtual time at which the request was submitted.
    pub fn created(&self) -> f64 {
        self.created
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

impl PriorityRelease {
    pub fn event(&self) -> &Event {
        &self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order_beats_submission_order() {
        let env = Environment::new();
        let pool = PriorityResource::new(&env, 1).unwrap();
        let holder = pool.request(0);
        assert!(holder.event().is_triggered());

        let low = pool.request(5);
        let high = pool.request(1);

        pool.release(&holder).unwrap();
        env.run().unwrap();
        assert!(high.event().is_triggered());
        assert!(!low.event().is_triggered());
    }

    #[test]
    fn test_fifo_within_equal_priority() {
        let env = Environment::new();
        let pool = PriorityResource::new(&env, 1).unwrap();
        let holder = pool.request(0);
        let first = pool.request(3);
        let second = pool.request(3);

        pool.release(&holder).unwrap();
        env.run().unwrap();
        assert!(first.event().is_triggered());
        assert!(!second.event().is_triggered());
    }

    #[test]
    fn test_cancelled_request_never_granted() {
        let env = Environment::new();
        let pool = PriorityResource::new(&env, 1).unwrap();
        let holder = pool.request(1);
        let queued = pool.request(2);
        queued.cancel();
        assert_eq!(pool.waiting_count(), 0);

        pool.release(&holder).unwrap();
        env.run().unwrap();
        assert!(!queued.event().is_triggered());
        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn test_queued_request_times_out() {
        let env = Environment::new();
        let pool = PriorityResource::new(&env, 1).unwrap();
        let _holder = pool.request(5);
        let queued = pool.request_with_timeout(1, 0.5).unwrap();

        // The failure surfaces when the request event is dispatched.
        let result = env.run();
        assert!(matches!(
            result,
            Err(SimError::UnhandledFailure(Failure::RequestTimeout { .. }))
        ));
        assert!(queued.event().is_triggered());
        assert!(!queued.event().succeeded());
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn test_stats_track_grants_and_waits() {
        let env = Environment::new();
        let pool = PriorityResource::new(&env, 1).unwrap();
        let first = pool.request(1);
        let _second = pool.request(1);

        env.timeout(4.0).unwrap();
        env.run_until_time(4.0).unwrap();
        pool.release(&first).unwrap();
        env.run().unwrap();

        assert_eq!(pool.granted_count(), 2);
        // The second request waited the full 4 time units.
        assert_eq!(pool.total_wait_time(), 4.0);
        assert_eq!(pool.average_wait(), 2.0);
    }

    #[test]
    fn test_utilization_of_busy_pool() {
        let env = Environment::new();
        let pool = PriorityResource::new(&env, 1).unwrap();
        let holder = pool.request(1);
        env.run_until_time(10.0).unwrap();
        assert!((pool.utilization() - 1.0).abs() < 1e-9);
        pool.release(&holder).unwrap();
        env.run().unwrap();
    }
}
