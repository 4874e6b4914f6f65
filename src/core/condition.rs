//! Composite conditions over sets of events.
//!
//! An AllOf/AnyOf condition is itself an event. Construction flattens the
//! operands: a condition operand contributes its own constituents to the
//! value map instead of appearing there as an opaque wrapper. The first
//! constituent failure fails the whole condition; success is decided by
//! the condition kind once enough constituents have resolved.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::core::env::Environment;
use crate::core::error::{Result, SimError};
use crate::core::event::{Event, Outcome};
use crate::core::value::Value;

/// Resolution rule of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    /// Succeeds once every constituent has succeeded.
    All,
    /// Succeeds once any constituent has succeeded (immediately if there
    /// are none).
    Any,
}

impl ConditionKind {
    fn resolved(self, total: usize, count: usize) -> bool {
        match self {
            ConditionKind::All => count == total,
            ConditionKind::Any => count > 0 || total == 0,
        }
    }
}

pub(crate) struct ConditionState {
    kind: ConditionKind,
    /// Flattened, de-duplicated constituents in operand order.
    events: Vec<Event>,
    /// Ids of constituents that are themselves conditions; they are
    /// skipped during harvesting in favor of their own constituents.
    nested_ids: HashSet<u64>,
    nested: Vec<Rc<RefCell<ConditionState>>>,
    resolved_count: usize,
}

/// Build a condition event over `operands` for `env`.
pub(crate) fn build(env: &Environment, kind: ConditionKind, operands: &[Event]) -> Result<Event> {
    let condition = env.event();
    let mut events: Vec<Event> = Vec::new();
    let mut nested_ids = HashSet::new();
    let mut nested = Vec::new();

    for operand in operands {
        if !operand.same_env(env) {
            return Err(SimError::MixedEnvironments);
        }
        if events.contains(operand) {
            continue;
        }
        events.push(operand.clone());
        if let Some(state) = operand.condition_state() {
            nested_ids.insert(operand.id());
            nested.push(state);
        }
    }

    if events.is_empty() {
        condition.grant(Value::Cond(ConditionValue::new()));
        return Ok(condition);
    }

    let state = Rc::new(RefCell::new(ConditionState {
        kind,
        events: events.clone(),
        nested_ids,
        nested,
        resolved_count: 0,
    }));
    condition.set_condition_state(state.clone());

    // Registered first so the harvested map is in place before any user
    // callback observes the condition's value.
    {
        let state = state.clone();
        condition.add_callback(move |ev| {
            if ev.succeeded() {
                let mut map = ConditionValue::new();
                harvest(&state, &mut map);
                ev.overwrite_value(Value::Cond(map));
            }
        });
    }

    for event in &events {
        if event.is_processed() {
            check(&condition, &state, event);
        } else {
            let condition = condition.clone();
            let state = state.clone();
            event.add_callback(move |ev| check(&condition, &state, ev));
        }
    }

    Ok(condition)
}

/// Per-constituent resolution check, run when a constituent is dispatched
/// (or inline for constituents already processed at construction).
fn check(condition: &Event, state: &Rc<RefCell<ConditionState>>, constituent: &Event) {
    if condition.is_triggered() {
        return;
    }
    let (kind, total, count) = {
        let mut s = state.borrow_mut();
        s.resolved_count += 1;
        (s.kind, s.events.len(), s.resolved_count)
    };
    match constituent.outcome() {
        Outcome::Failure(cause) => {
            // First failure wins; an acknowledged constituent failure
            // keeps the condition acknowledged too.
            if constituent.is_defused() {
                condition.set_defused(true);
            }
            condition.reject(cause);
        }
        Outcome::Success(_) => {
            if kind.resolved(total, count) {
                condition.grant(Value::None);
            }
        }
        Outcome::Pending => {}
    }
}

/// Collect the values of every constituent that settled successfully
/// before the condition was dispatched, in operand order. Constituents
/// wrapped by a nested condition contribute through that condition's own
/// harvest instead.
fn harvest(state: &Rc<RefCell<ConditionState>>, map: &mut ConditionValue) {
    let s = state.borrow();
    for event in &s.events {
        if s.nested_ids.contains(&event.id()) {
            continue;
        }
        if event.is_processed() {
            if let Outcome::Success(value) = event.outcome() {
                map.insert(event.clone(), value);
            }
        }
    }
    for nested in &s.nested {
        harvest(nested, map);
    }
}

/// Insertion-ordered mapping from contributing event to resolved value,
/// produced by a resolved condition.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConditionValue {
    entries: IndexMap<Event, Value>,
}

impl ConditionValue {
    pub fn new() -> Self {
        ConditionValue {
            entries: IndexMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, event: Event, value: Value) {
        self.entries.insert(event, value);
    }

    pub fn contains(&self, event: &Event) -> bool {
        self.entries.contains_key(event)
    }

    /// Value contributed by `event`; errors if it never contributed.
    pub fn get(&self, event: &Event) -> Result<&Value> {
        self.entries
            .get(event)
            .ok_or(SimError::MissingEntry(event.id()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Event, &Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Event> {
        self.entries.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.values()
    }
}

/// Lexicographic over (event id, value) pairs sorted by id, so the
/// order agrees with the order-independent equality. Only needed so
/// `Value` can carry condition results and still be totally ordered.
impl Ord for ConditionValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let sorted = |cv: &ConditionValue| {
            let mut pairs: Vec<(u64, Value)> =
                cv.entries.iter().map(|(e, v)| (e.id(), v.clone())).collect();
            pairs.sort_by_key(|(id, _)| *id);
            pairs
        };
        sorted(self).cmp(&sorted(other))
    }
}

impl PartialOrd for ConditionValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(e, v)| (e.id(), v)))
            .finish()
    }
}
