//! Convenience processes built on the core primitives.
//!
//! None of these add scheduling semantics; they are ordinary processes
//! over `timeout` and `wait`.

use std::future::Future;

use crate::core::env::Environment;
use crate::core::error::{Failure, Result, SimError};
use crate::core::process::{Context, Process};
use crate::core::value::Value;

/// Start `body` as a process after `delay` units of virtual time.
pub fn start_delayed<F, Fut>(env: &Environment, delay: f64, body: F) -> Result<Process>
where
    F: FnOnce(Context) -> Fut + 'static,
    Fut: Future<Output = std::result::Result<Value, Failure>> + 'static,
{
    if delay < 0.0 {
        return Err(SimError::NegativeDelay(delay));
    }
    Ok(env.process(move |ctx| async move {
        ctx.hold(delay)?.await?;
        body(ctx).await
    }))
}

/// Run `task` now and then once every `interval`, until the driving
/// process is interrupted.
pub fn every(env: &Environment, interval: f64, mut task: impl FnMut() + 'static) -> Result<Process> {
    if interval <= 0.0 {
        return Err(SimError::InvalidInterval(interval));
    }
    Ok(env.process(move |ctx| async move {
        loop {
            task();
            ctx.hold(interval)?.await?;
        }
    }))
}

/// Periodically sample `probe` and hand the reading to `record`. Useful
/// for collecting queue lengths, levels or utilization over time.
pub fn monitor<T: 'static>(
    env: &Environment,
    interval: f64,
    mut probe: impl FnMut() -> T + 'static,
    mut record: impl FnMut(T) + 'static,
) -> Result<Process> {
    every(env, interval, move || record(probe()))
}

/// Poll `predicate` every `interval` until it returns true. The returned
/// process succeeds once it does.
pub fn wait_for(
    env: &Environment,
    interval: f64,
    mut predicate: impl FnMut() -> bool + 'static,
) -> Result<Process> {
    if interval <= 0.0 {
        return Err(SimError::InvalidInterval(interval));
    }
    Ok(env.process(move |ctx| async move {
        while !predicate() {
            ctx.hold(interval)?.await?;
        }
        Ok(Value::None)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_start_delayed_defers_the_body() {
        let env = Environment::new();
        let p = start_delayed(&env, 3.0, |ctx| async move {
            Ok(Value::from(ctx.env().now()))
        })
        .unwrap();
        let out = env.run_until(&p.event()).unwrap();
        assert_eq!(out, Value::from(3.0));
    }

    #[test]
    fn test_every_runs_until_interrupted() {
        let env = Environment::new();
        let ticks = Rc::new(RefCell::new(0));
        let counter = ticks.clone();
        let p = every(&env, 1.0, move || *counter.borrow_mut() += 1).unwrap();

        let stop = env.timeout(2.5).unwrap();
        let loopy = p.clone();
        stop.add_callback(move |_| {
            loopy.interrupt("enough").unwrap();
        });
        // The loop dies with the interrupt as its failure cause.
        assert!(matches!(
            env.run_until(&p.event()),
            Err(SimError::EventFailed(Failure::Interrupt { .. }))
        ));
        // Ran at t=0, 1, 2.
        assert_eq!(*ticks.borrow(), 3);
    }

    #[test]
    fn test_monitor_records_samples() {
        let env = Environment::new();
        let level = Rc::new(RefCell::new(0i64));
        let samples = Rc::new(RefCell::new(Vec::new()));

        let probe_src = level.clone();
        let sink = samples.clone();
        let m = monitor(
            &env,
            1.0,
            move || *probe_src.borrow(),
            move |v| sink.borrow_mut().push(v),
        )
        .unwrap();

        let bump = level.clone();
        every(&env, 1.0, move || *bump.borrow_mut() += 10).unwrap();

        env.run_until_time(2.5).unwrap();
        let _ = m;
        assert_eq!(*samples.borrow(), vec![0, 10, 20]);
    }

    #[test]
    fn test_wait_for_polls_until_true() {
        let env = Environment::new();
        let ready = Rc::new(RefCell::new(false));

        let flag = ready.clone();
        let flip = env.timeout(2.2).unwrap();
        flip.add_callback(move |_| *flag.borrow_mut() = true);

        let checked = ready.clone();
        let waiter = wait_for(&env, 1.0, move || *checked.borrow()).unwrap();
        env.run_until(&waiter.event()).unwrap();
        // Polls at 0, 1, 2 and finds it true at 3.
        assert_eq!(env.now(), 3.0);
    }

    #[test]
    fn test_invalid_arguments() {
        let env = Environment::new();
        assert!(matches!(
            every(&env, 0.0, || {}),
            Err(SimError::InvalidInterval(_))
        ));
        assert!(matches!(
            start_delayed(&env, -1.0, |_| async { Ok(Value::None) }),
            Err(SimError::NegativeDelay(_))
        ));
    }
}
