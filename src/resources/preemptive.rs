//! Priority pool with preemption.
//!
//! Like [`PriorityResource`](crate::resources::priority::PriorityResource),
//! but when capacity is full an incoming preemptible request that strictly
//! outranks the worst current holder evicts it: the holder is removed,
//! marked preempted with the preemptor recorded, and the freed slot goes
//! to the newcomer. Non-preemptible requests queue instead.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::core::env::Environment;
use crate::core::error::{Failure, Result, SimError};
use crate::core::event::Event;
use crate::core::value::Value;
use crate::resources::engine::{PendingOp, WaitQueues};
use crate::resources::priority::PoolStats;

struct PreemptiveState {
    env: Environment,
    capacity: usize,
    users: Vec<PreemptiveRequest>,
    stats: PoolStats,
    next_order: u64,
}

struct PreemptiveInner {
    state: PreemptiveState,
    queues: WaitQueues<PreemptiveRequest, PreemptiveRelease>,
}

/// Capacity pool with priority-based preemption.
#[derive(Clone)]
pub struct PreemptiveResource {
    inner: Rc<RefCell<PreemptiveInner>>,
}

/// A request that may seize a slot from a lower-priority holder.
#[derive(Clone)]
pub struct PreemptiveRequest {
    event: Event,
    pool: Weak<RefCell<PreemptiveInner>>,
    priority: i64,
    order: u64,
    preempt: bool,
    created: f64,
    /// (priority, order) of the preemptor, once evicted.
    preempted_by: Rc<Cell<Option<(i64, u64)>>>,
}

#[derive(Clone)]
pub struct PreemptiveRelease {
    event: Event,
    request: Event,
}

impl PendingOp for PreemptiveRequest {
    fn event(&self) -> &Event {
        &self.event
    }
}

impl PendingOp for PreemptiveRelease {
    fn event(&self) -> &Event {
        &self.event
    }
}

impl PreemptiveResource {
    pub fn new(env: &Environment, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(SimError::InvalidCapacity);
        }
        Ok(PreemptiveResource {
            inner: Rc::new(RefCell::new(PreemptiveInner {
                state: PreemptiveState {
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

    pub fn preemption_count(&self) -> u64 {
        self.inner.borrow().state.stats.preemptions()
    }

    pub fn total_wait_time(&self) -> f64 {
        self.inner.borrow().state.stats.total_wait()
    }

    /// Preemptible request at `priority` (lower outranks higher).
    pub fn request(&self, priority: i64) -> PreemptiveRequest {
        self.request_with(priority, true)
    }

    /// Request at `priority`; `preempt` controls whether it may evict a
    /// worse holder when the pool is full.
    pub fn request_with(&self, priority: i64, preempt: bool) -> PreemptiveRequest {
        let (env, order, created) = {
            let mut inner = self.inner.borrow_mut();
            let order = inner.state.next_order;
            inner.state.next_order += 1;
            (inner.state.env.clone(), order, inner.state.env.now())
        };
        let event = env.event();
        let request = PreemptiveRequest {
            event: event.clone(),
            pool: Rc::downgrade(&self.inner),
            priority,
            order,
            preempt,
            created,
            preempted_by: Rc::new(Cell::new(None)),
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

    /// Request racing a timer, as in
    /// [`PriorityResource::request_with_timeout`](crate::resources::priority::PriorityResource::request_with_timeout).
    pub fn request_with_timeout(
        &self,
        priority: i64,
        preempt: bool,
        timeout: f64,
    ) -> Result<PreemptiveRequest> {
        let env = self.inner.borrow().state.env.clone();
        let timer = env.timeout(timeout)?;
        let request = self.request_with(priority, preempt);
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
    pub fn release(&self, request: &PreemptiveRequest) -> Result<PreemptiveRelease> {
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
        let release = PreemptiveRelease {
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

fn trigger_puts(inner: &Rc<RefCell<PreemptiveInner>>) {
    let inner = &mut *inner.borrow_mut();
    inner.queues.trigger_puts(&mut inner.state, |state, request| {
        if state.users.len() >= state.capacity && request.preempt {
            maybe_preempt(state, request);
        }
        if state.users.len() < state.capacity {
            let now = state.env.now();
            state.stats.account(now, state.users.len());
            state.stats.on_grant(now - request.created);
            state.users.push(request.clone());
            request.event.grant(Value::None);
            tracing::trace!(
                "t={}: preemptive pool grant #{} (priority {})",
                now,
                request.event.id(),
                request.priority
            );
        }
        true
    });
}

/// Evict the worst current holder if the incoming request strictly
/// outranks it.
fn maybe_preempt(state: &mut PreemptiveState, incoming: &PreemptiveRequest) {
    let worst = state
        .users
        .iter()
        .enumerate()
        .max_by_key(|(_, user)| (user.priority, user.order))
        .map(|(at, _)| at);
    let Some(at) = worst else { return };
    let victim = &state.users[at];
    if (incoming.priority, incoming.order) >= (victim.priority, victim.order) {
        return;
    }
    let victim = state.users.remove(at);
    let now = state.env.now();
    state.stats.account(now, state.users.len() + 1);
    state.stats.on_preemption();
    victim
        .preempted_by
        .set(Some((incoming.priority, incoming.order)));
    tracing::debug!(
        "t={}: request #{} preempted by priority={} order={}",
        now,
        victim.event.id(),
        incoming.priority,
        incoming.order
    );
    // A granted holder's event has already settled; the failure channel
    // only applies to a victim whose grant is still pending.
    if !victim.event.is_triggered() {
        victim.event.reject(Failure::Preempted {
            priority: incoming.priority,
            order: incoming.order,
        });
    }
}

fn trigger_gets(inner: &Rc<RefCell<PreemptiveInner>>) {
    let inner = &mut *inner.borrow_mut();
    inner.queues.trigger_gets(&mut inner.state, |state, release| {
        let now = state.env.now();
        state.stats.account(now, state.users.len());
        state.users.retain(|user| user.event != release.request);
        release.event.grant(Value::None);
        true
    });
}

impl PreemptiveRequest {
    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    /// Whether this request was allowed to preempt when submitted.
    pub fn is_preempt(&self) -> bool {
        self.preempt
    }

    /// True once this request has been evicted from the pool.
    pub fn is_preempted(&self) -> bool {
        self.preempted_by.get().is_some()
    }

    /// (priority, order) of the request that evicted this one.
    pub fn preempted_by(&self) -> Option<(i64, u64)> {
        self.preempted_by.get()
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

impl PreemptiveRelease {
    pub fn event(&self) -> &Event {
        &self.event
    }
}
