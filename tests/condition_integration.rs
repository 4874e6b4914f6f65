//! Integration tests for the condition algebra:
//! - AllOf/AnyOf resolution times and value maps
//! - nested conditions and leaf identity
//! - waiting on conditions from processes

use eventide::core::env::Environment;
use eventide::core::error::{Failure, SimError};
use eventide::core::value::Value;

#[test]
fn test_all_of_value_map_preserves_operand_order() {
    let env = Environment::new();
    let a = env.timeout_with(2.0, "a").unwrap();
    let b = env.timeout_with(1.0, "b").unwrap();
    let both = env.all_of(&[a.clone(), b.clone()]).unwrap();

    let out = env.run_until(&both).unwrap();
    assert_eq!(env.now(), 2.0);

    let map = out.as_condition().expect("condition value");
    let entries: Vec<(u64, Value)> = map.iter().map(|(e, v)| (e.id(), v.clone())).collect();
    assert_eq!(
        entries,
        vec![(a.id(), Value::from("a")), (b.id(), Value::from("b"))]
    );
}

#[test]
fn test_any_of_losing_operand_contributes_nothing() {
    let env = Environment::new();
    let fast = env.timeout_with(0.5, "f").unwrap();
    let slow = env.timeout_with(5.0, "s").unwrap();
    let first = env.any_of(&[fast.clone(), slow.clone()]).unwrap();

    let out = env.run_until(&first).unwrap();
    assert_eq!(env.now(), 0.5);

    let map = out.as_condition().expect("condition value");
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(&fast).unwrap(), &Value::from("f"));
    assert!(matches!(map.get(&slow), Err(SimError::MissingEntry(_))));
}

#[test]
fn test_nested_conditions_flatten_to_leaves() {
    let env = Environment::new();
    let a = env.timeout_with(1.0, "a").unwrap();
    let b = env.timeout_with(2.0, "b").unwrap();
    let c = env.timeout_with(3.0, "c").unwrap();

    let inner = env.all_of(&[a.clone(), b.clone()]).unwrap();
    let outer = env.all_of(&[inner, c.clone()]).unwrap();

    let out = env.run_until(&outer).unwrap();
    assert_eq!(env.now(), 3.0);

    let map = out.as_condition().expect("condition value");
    // The inner condition wrapper contributes its leaves, not itself:
    // exactly the three leaf events, no duplicates, none missing.
    assert_eq!(map.len(), 3);
    for leaf in [&a, &b, &c] {
        assert!(map.contains(leaf), "missing leaf {:?}", leaf);
    }
}

#[test]
fn test_deeply_nested_any_of_all_of() {
    let env = Environment::new();
    let a = env.timeout_with(1.0, "a").unwrap();
    let b = env.timeout_with(2.0, "b").unwrap();
    let slow = env.timeout_with(50.0, "slow").unwrap();

    let pair = env.all_of(&[a.clone(), b.clone()]).unwrap();
    let race = env.any_of(&[pair, slow.clone()]).unwrap();

    let out = env.run_until(&race).unwrap();
    // The pair completes at t=2, well before the slow timer.
    assert_eq!(env.now(), 2.0);
    let map = out.as_condition().expect("condition value");
    assert!(map.contains(&a));
    assert!(map.contains(&b));
    assert!(!map.contains(&slow));
}

#[test]
fn test_process_waits_on_condition() {
    let env = Environment::new();
    let a = env.timeout_with(1.0, 10).unwrap();
    let b = env.timeout_with(4.0, 20).unwrap();
    let a2 = a.clone();
    let b2 = b.clone();
    let p = env.process(move |ctx| async move {
        let both = a2.and(&[b2.clone()])?;
        let v = ctx.wait(&both).await?;
        let map = v
            .as_condition()
            .ok_or_else(|| Failure::error("expected a condition value"))?;
        let total = map.get(&a2)?.as_int().unwrap_or(0) + map.get(&b2)?.as_int().unwrap_or(0);
        Ok(Value::from(total))
    });
    let out = env.run_until(&p.event()).unwrap();
    assert_eq!(out, Value::from(30));
    assert_eq!(env.now(), 4.0);
}

#[test]
fn test_process_races_with_any_of() {
    let env = Environment::new();
    let p = env.process(|ctx| async move {
        let env = ctx.env();
        let quick = env.timeout_with(1.0, "quick")?;
        let slow = env.timeout_with(9.0, "slow")?;
        let winner = quick.or(&[slow.clone()])?;
        let v = ctx.wait(&winner).await?;
        let map = v
            .as_condition()
            .ok_or_else(|| Failure::error("expected a condition value"))?;
        Ok(Value::from(map.contains(&slow)))
    });
    let out = env.run_until(&p.event()).unwrap();
    assert_eq!(out, Value::from(false));
    assert_eq!(env.now(), 1.0);
}

#[test]
fn test_condition_failure_inside_process_is_catchable() {
    let env = Environment::new();
    let doomed = env.event();
    let all = env.all_of(&[doomed.clone(), env.timeout(5.0).unwrap()]).unwrap();
    let p = env.process(move |ctx| async move {
        match ctx.wait(&all).await {
            Err(Failure::Error(msg)) => Ok(Value::from(format!("caught {}", msg))),
            other => Err(Failure::error(format!("unexpected: {:?}", other))),
        }
    });
    // Fail the constituent after the process has suspended on the
    // condition; defuse so the constituent's own dispatch is benign.
    let trigger = env.timeout(1.0).unwrap();
    trigger.add_callback(move |_| {
        doomed.set_defused(true);
        doomed.fail(Failure::error("constituent died")).unwrap();
    });

    let out = env.run_until(&p.event()).unwrap();
    assert_eq!(out, Value::from("caught constituent died"));
}

#[test]
fn test_same_instant_operands_both_contribute_to_any_of() {
    let env = Environment::new();
    let x = env.timeout_with(1.0, "x").unwrap();
    let y = env.timeout_with(1.0, "y").unwrap();
    let either = env.any_of(&[x.clone(), y.clone()]).unwrap();

    let out = env.run_until(&either).unwrap();
    let map = out.as_condition().expect("condition value");
    // Both operands dispatched at t=1 before the condition itself was
    // processed, so both are harvested.
    assert_eq!(map.len(), 2);
    assert!(map.contains(&x));
    assert!(map.contains(&y));
}
