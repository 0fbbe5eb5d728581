#![cfg(test)]

// Property tests for SlotMap kept inside the crate so they can reach
// crate internals without feature gates.

use crate::slot_map::{InsertError, SlotMap};
use crate::value::Value;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use std::collections::{BTreeSet, HashMap};

// Pool-indexed operations to improve shrinking: indices shrink to earlier
// keys, pool length shrinks, and op lists shrink in length.
#[derive(Clone, Debug)]
enum OpI {
    InsertCount(usize, u64),
    InsertBlob(usize, Vec<u8>),
    Remove(usize),
    Lookup(usize),
    Incr(usize, i64),
    Iterate,
}

#[derive(Clone, Debug)]
enum ModelVal {
    Count(u64),
    Blob(Vec<u8>),
}

fn arb_scenario() -> impl Strategy<Value = (Vec<String>, Vec<OpI>)> {
    proptest::collection::vec("[a-z]{1,6}", 1..=8).prop_flat_map(|pool| {
        let idxs: Vec<usize> = (0..pool.len()).collect();
        let idx = proptest::sample::select(idxs);
        // Blob payloads straddle the 255-byte inline cap.
        let blob = proptest::collection::vec(any::<u8>(), 0..600);
        let op = prop_oneof![
            (idx.clone(), any::<u64>()).prop_map(|(i, v)| OpI::InsertCount(i, v)),
            (idx.clone(), blob).prop_map(|(i, b)| OpI::InsertBlob(i, b)),
            idx.clone().prop_map(OpI::Remove),
            idx.clone().prop_map(OpI::Lookup),
            (idx.clone(), any::<i64>()).prop_map(|(i, d)| OpI::Incr(i, d)),
            Just(OpI::Iterate),
        ];
        proptest::collection::vec(op, 1..60).prop_map(move |ops| (pool.clone(), ops))
    })
}

// State-machine equivalence against a model HashMap. Invariants checked
// after every op:
// - `load()` equals the model's entry count.
// - Every model key stays reachable through its probe sequence with the
//   model's value (remove-shift soundness).
// - Handles captured before a remove or overwrite never resolve again.
// - Insert succeeds exactly when the key is present or a slot is free.
fn run_scenario(capacity: usize, pool: &[String], ops: &[OpI]) -> Result<(), TestCaseError> {
    let m = SlotMap::with_capacity(capacity).unwrap();
    let mut model: HashMap<Vec<u8>, ModelVal> = HashMap::new();
    let mut stale = Vec::new();

    for op in ops {
        match op {
            OpI::InsertCount(i, v) => {
                let k = pool[*i].as_bytes();
                if let Some(h) = m.lookup(k) {
                    stale.push(h);
                }
                match m.insert(k, Value::count(*v)) {
                    Ok(_) => {
                        prop_assert!(model.contains_key(k) || model.len() < capacity);
                        model.insert(k.to_vec(), ModelVal::Count(*v));
                    }
                    Err(InsertError::TableFull) => {
                        prop_assert!(model.len() == capacity && !model.contains_key(k));
                    }
                    Err(e) => prop_assert!(false, "unexpected insert error {:?}", e),
                }
            }
            OpI::InsertBlob(i, b) => {
                let k = pool[*i].as_bytes();
                if let Some(h) = m.lookup(k) {
                    stale.push(h);
                }
                match m.insert(k, Value::blob(b).unwrap()) {
                    Ok(_) => {
                        prop_assert!(model.contains_key(k) || model.len() < capacity);
                        model.insert(k.to_vec(), ModelVal::Blob(b.clone()));
                    }
                    Err(InsertError::TableFull) => {
                        prop_assert!(model.len() == capacity && !model.contains_key(k));
                    }
                    Err(e) => prop_assert!(false, "unexpected insert error {:?}", e),
                }
            }
            OpI::Remove(i) => {
                let k = pool[*i].as_bytes();
                if let Some(h) = m.lookup(k) {
                    stale.push(h);
                }
                m.remove(k);
                model.remove(k);
            }
            OpI::Lookup(i) => {
                let k = pool[*i].as_bytes();
                prop_assert_eq!(m.lookup(k).is_some(), model.contains_key(k));
            }
            OpI::Incr(i, d) => {
                let k = pool[*i].as_bytes();
                match model.get_mut(k) {
                    Some(ModelVal::Count(n)) => {
                        let mut h = m.lookup(k).expect("model key present");
                        let got = h
                            .write(|v, _| v.incr(*d))
                            .expect("fresh handle is current")
                            .expect("count kind");
                        *n = n.wrapping_add(*d as u64);
                        prop_assert_eq!(got, *n);
                    }
                    Some(ModelVal::Blob(_)) => {
                        // Wrong-kind increments fail inside the callback;
                        // the write itself still happened and advances
                        // the generation.
                        let mut h = m.lookup(k).expect("model key present");
                        let got = h.write(|v, _| v.incr(*d)).expect("fresh handle");
                        prop_assert!(got.is_err());
                    }
                    None => prop_assert!(m.lookup(k).is_none()),
                }
            }
            OpI::Iterate => {
                let yielded: BTreeSet<Vec<u8>> = m
                    .iter()
                    .filter_map(|h| h.read(|_, k| k.to_vec()).ok())
                    .collect();
                let expect: BTreeSet<Vec<u8>> = model.keys().cloned().collect();
                prop_assert_eq!(yielded, expect);
            }
        }

        // Post-conditions after each op.
        prop_assert_eq!(m.load(), model.len());
        for (k, mv) in &model {
            let h = m.lookup(k);
            prop_assert!(h.is_some(), "model key {:?} became unreachable", k);
            let h = h.expect("checked above");
            match mv {
                ModelVal::Count(n) => {
                    prop_assert_eq!(h.read(|v, _| v.as_count().unwrap()).unwrap(), *n);
                }
                ModelVal::Blob(b) => {
                    let got = h.read(|v, _| v.as_bytes().unwrap().to_vec()).unwrap();
                    prop_assert_eq!(&got, b);
                }
            }
        }
        for h in &stale {
            prop_assert!(h.read(|_, _| ()).is_err(), "stale handle resolved");
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    // Roomy table: the pool can never fill it, so every insert must land.
    #[test]
    fn prop_state_machine((pool, ops) in arb_scenario()) {
        run_scenario(16, &pool, &ops)?;
    }

    // Tiny table: the pool exceeds the capacity, exercising TableFull
    // parity and compaction under heavy collision pressure.
    #[test]
    fn prop_state_machine_tiny_table((pool, ops) in arb_scenario()) {
        run_scenario(4, &pool, &ops)?;
    }
}

// Group linkage under slot churn. The member pool is fixed; slots are
// removed and reinserted underneath the group while the model tracks the
// intended membership.
#[derive(Clone, Debug)]
enum GOp {
    Add(usize),
    Unlink(usize),
    RemoveSlot(usize),
    Reinsert(usize),
}

fn member_pool() -> Vec<Vec<u8>> {
    (0..6).map(|i| format!("m{}", i).into_bytes()).collect()
}

fn arb_group_ops() -> impl Strategy<Value = Vec<GOp>> {
    let idx = 0..6usize;
    let op = prop_oneof![
        idx.clone().prop_map(GOp::Add),
        idx.clone().prop_map(GOp::Unlink),
        idx.clone().prop_map(GOp::RemoveSlot),
        idx.prop_map(GOp::Reinsert),
    ];
    proptest::collection::vec(op, 1..80)
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    // Invariants checked after every op:
    // - The members exposed through valid handles equal the model set,
    //   even while removals relocate slots under the group.
    // - The stored member count matches too: cleanup passes leave no
    //   stale forward references behind in this single-threaded run.
    #[test]
    fn prop_group_linkage(ops in arb_group_ops()) {
        let m = SlotMap::with_capacity(16).unwrap();
        m.insert(b"grp", Value::group()).unwrap();
        let pool = member_pool();
        for k in &pool {
            m.insert(k, Value::count(0)).unwrap();
        }
        let mut model: BTreeSet<Vec<u8>> = BTreeSet::new();

        for op in &ops {
            match op {
                GOp::Add(i) => {
                    if let Some(mh) = m.lookup(&pool[*i]) {
                        let g = m.lookup(b"grp").expect("group slot never removed");
                        g.group_add(&mh).expect("fresh handles");
                        model.insert(pool[*i].clone());
                    }
                }
                GOp::Unlink(i) => {
                    if let Some(mh) = m.lookup(&pool[*i]) {
                        let g = m.lookup(b"grp").expect("group slot never removed");
                        g.group_remove(&mh).expect("fresh handles");
                        model.remove(&pool[*i]);
                    }
                }
                GOp::RemoveSlot(i) => {
                    m.remove(&pool[*i]);
                    model.remove(&pool[*i]);
                }
                GOp::Reinsert(i) => {
                    if m.lookup(&pool[*i]).is_none() {
                        m.insert(&pool[*i], Value::count(0)).unwrap();
                    }
                }
            }

            let g = m.lookup(b"grp").expect("group slot never removed");
            let exposed: BTreeSet<Vec<u8>> = g
                .group_members()
                .expect("group kind")
                .filter_map(|h| h.read(|_, k| k.to_vec()).ok())
                .collect();
            prop_assert_eq!(&exposed, &model);
            prop_assert_eq!(g.read(|v, _| v.group_len().unwrap()).unwrap(), model.len());
        }
    }
}
