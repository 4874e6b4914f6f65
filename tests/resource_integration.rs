//! Integration tests for the pool disciplines driven by processes:
//! capacity pools, priority ordering, preemption, timeout racing.

use std::cell::RefCell;
use std::rc::Rc;

use eventide::core::env::Environment;
use eventide::core::error::Failure;
use eventide::core::value::Value;
use eventide::resources::pool::Resource;
use eventide::resources::preemptive::PreemptiveResource;
use eventide::resources::priority::PriorityResource;

#[test]
fn test_processes_share_capacity_pool_fifo() {
    let env = Environment::new();
    let pool = Resource::new(&env, 1).unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    for name in ["a", "b", "c"] {
        let pool = pool.clone();
        let order = order.clone();
        env.process(move |ctx| async move {
            let req = pool.request();
            ctx.wait(req.event()).await?;
            order.borrow_mut().push((name, ctx.env().now()));
            ctx.hold(2.0)?.await?;
            let rel = pool.release(&req)?;
            ctx.wait(rel.event()).await?;
            Ok(Value::None)
        });
    }
    env.run().unwrap();
    assert_eq!(
        *order.borrow(),
        vec![("a", 0.0), ("b", 2.0), ("c", 4.0)]
    );
}

#[test]
fn test_priority_pool_grants_by_priority_not_submission() {
    let env = Environment::new();
    let pool = PriorityResource::new(&env, 1).unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    // The holder occupies the pool; two waiters queue with priorities
    // [5, 1] in that submission order.
    let holder = pool.request(0);
    for priority in [5i64, 1] {
        let pool = pool.clone();
        let order = order.clone();
        env.process(move |ctx| async move {
            let req = pool.request(priority);
            ctx.wait(req.event()).await?;
            order.borrow_mut().push(priority);
            let rel = pool.release(&req)?;
            ctx.wait(rel.event()).await?;
            Ok(Value::None)
        });
    }
    let release_at = env.timeout(1.0).unwrap();
    let pool2 = pool.clone();
    release_at.add_callback(move |_| {
        pool2.release(&holder).unwrap();
    });

    env.run().unwrap();
    assert_eq!(*order.borrow(), vec![1, 5]);
}

#[test]
fn test_preemption_from_processes() {
    let env = Environment::new();
    let pool = PreemptiveResource::new(&env, 1).unwrap();

    let pool_low = pool.clone();
    let low = env.process(move |ctx| async move {
        let req = pool_low.request(5);
        ctx.wait(req.event()).await?;
        ctx.hold(10.0)?.await?;
        let preempted = req.is_preempted();
        Ok(Value::from(preempted))
    });

    let pool_high = pool.clone();
    env.process(move |ctx| async move {
        ctx.hold(2.0)?.await?;
        let req = pool_high.request(1);
        ctx.wait(req.event()).await?;
        Ok(Value::None)
    });

    let out = env.run_until(&low.event()).unwrap();
    // The low-priority holder was evicted while it held the pool.
    assert_eq!(out, Value::from(true));
    assert_eq!(pool.preemption_count(), 1);
    assert_eq!(pool.granted_count(), 2);
}

#[test]
fn test_request_timeout_failure_is_catchable_in_process() {
    let env = Environment::new();
    let pool = PriorityResource::new(&env, 1).unwrap();
    let _holder = pool.request(0);

    let pool2 = pool.clone();
    let p = env.process(move |ctx| async move {
        let req = pool2.request_with_timeout(1, 0.5)?;
        match ctx.wait(req.event()).await {
            Err(Failure::RequestTimeout { after }) => Ok(Value::from(after)),
            other => Err(Failure::error(format!("unexpected: {:?}", other))),
        }
    });
    let out = env.run_until(&p.event()).unwrap();
    assert_eq!(out, Value::from(0.5));
    assert_eq!(env.now(), 0.5);
    assert_eq!(pool.waiting_count(), 0);
}

#[test]
fn test_granted_request_ignores_late_timer() {
    let env = Environment::new();
    let pool = PriorityResource::new(&env, 1).unwrap();
    let pool2 = pool.clone();
    let p = env.process(move |ctx| async move {
        // Pool is free, so the request is granted immediately; the timer
        // fires later and must be a no-op.
        let req = pool2.request_with_timeout(1, 2.0)?;
        ctx.wait(req.event()).await?;
        ctx.hold(5.0)?.await?;
        let rel = pool2.release(&req)?;
        ctx.wait(rel.event()).await?;
        Ok(Value::from("done"))
    });
    let out = env.run_until(&p.event()).unwrap();
    assert_eq!(out, Value::from("done"));
    assert_eq!(pool.granted_count(), 1);
}

#[test]
fn test_cancelled_request_is_never_granted_even_when_freed() {
    let env = Environment::new();
    let pool = PriorityResource::new(&env, 1).unwrap();
    let holder = pool.request(1);
    let queued = pool.request(2);

    queued.cancel();
    // Cancelling twice is harmless.
    queued.cancel();

    pool.release(&holder).unwrap();
    env.run().unwrap();
    assert!(!queued.event().is_triggered());
    assert_eq!(pool.count(), 0);
    assert_eq!(pool.waiting_count(), 0);
}

#[test]
fn test_pool_statistics_accumulate() {
    let env = Environment::new();
    let pool = PriorityResource::new(&env, 2).unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    for i in 0..4i64 {
        let pool = pool.clone();
        let order = order.clone();
        env.process(move |ctx| async move {
            let req = pool.request(1);
            ctx.wait(req.event()).await?;
            order.borrow_mut().push(i);
            ctx.hold(3.0)?.await?;
            let rel = pool.release(&req)?;
            ctx.wait(rel.event()).await?;
            Ok(Value::None)
        });
    }
    env.run().unwrap();
    assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    assert_eq!(pool.granted_count(), 4);
    // Two waiters each queued ~3 time units.
    assert!(pool.total_wait_time() >= 6.0);
    assert!(pool.average_wait() > 0.0);
    assert!(pool.utilization() > 0.0);
}
