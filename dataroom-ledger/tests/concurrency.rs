use std::sync::Arc;
use std::thread;

use dataroom_core::DatasetId;
use dataroom_ledger::{BudgetError, PrivacyBudget, PrivacyBudgetLedger};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

#[test]
fn concurrent_reservations_never_oversell() {
    let ledger = Arc::new(PrivacyBudgetLedger::new());
    let dataset = DatasetId::from("patients");
    ledger.register(dataset.clone(), 1.0);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            let dataset = dataset.clone();
            thread::spawn(move || {
                (0..8)
                    .filter(|_| ledger.reserve(&dataset, 0.125).is_ok())
                    .count()
            })
        })
        .collect();
    let granted: usize = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .sum();

    assert_eq!(granted, 8);
    let snapshot = ledger.snapshot(&dataset).unwrap();
    assert_eq!(snapshot.reserved, 1.0);
    assert_eq!(snapshot.remaining(), 0.0);
}

#[test]
fn concurrent_tenths_fill_a_unit_budget() {
    let ledger = Arc::new(PrivacyBudgetLedger::new());
    let dataset = DatasetId::from("claims");
    ledger.register(dataset.clone(), 1.0);

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            let dataset = dataset.clone();
            thread::spawn(move || ledger.reserve(&dataset, 0.1).is_ok())
        })
        .collect();
    let granted = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|ok| *ok)
        .count();

    assert_eq!(granted, 10);
    let snapshot = ledger.snapshot(&dataset).unwrap();
    assert!(snapshot.reserved <= snapshot.total);
    assert_eq!(snapshot.remaining(), 0.0);
}

#[test]
fn datasets_are_accounted_independently() {
    let ledger = PrivacyBudgetLedger::new();
    let a = DatasetId::from("a");
    let b = DatasetId::from("b");
    ledger.register(a.clone(), 0.5);
    ledger.register(b.clone(), 0.5);

    ledger.reserve(&a, 0.5).unwrap();
    assert!(matches!(
        ledger.reserve(&a, 0.25),
        Err(BudgetError::Exhausted { .. })
    ));
    assert!(ledger.reserve(&b, 0.25).is_ok());
    assert_eq!(ledger.remaining(&b).unwrap(), 0.25);
}

#[derive(Clone, Debug)]
enum Op {
    Reserve(u8),
    Commit(u8),
    Rollback(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..16).prop_map(Op::Reserve),
        (0u8..16).prop_map(Op::Commit),
        (0u8..16).prop_map(Op::Rollback),
    ]
}

proptest! {
    // Epsilons are multiples of 1/8 so every sum is exact in f64.
    #[test]
    fn reserve_succeeds_iff_it_fits(ops in prop::collection::vec(op(), 1..64)) {
        let ledger = PrivacyBudgetLedger::new();
        let dataset = DatasetId::from("patients");
        ledger.register(dataset.clone(), 4.0);

        for op in ops {
            let before = ledger.snapshot(&dataset).unwrap();
            match op {
                Op::Reserve(eighths) => {
                    let epsilon = f64::from(eighths) / 8.0;
                    let fits = epsilon <= before.total - before.consumed - before.reserved;
                    let result = ledger.reserve(&dataset, epsilon);
                    prop_assert_eq!(result.is_ok(), fits);
                    if !fits {
                        prop_assert_eq!(ledger.snapshot(&dataset).unwrap(), before);
                    }
                }
                Op::Commit(eighths) => {
                    // Only commit what is actually reserved, as the coordinator does.
                    let actual = (f64::from(eighths) / 8.0).min(before.reserved);
                    let after = ledger.commit(&dataset, actual).unwrap();
                    prop_assert_eq!(after.consumed, before.consumed + actual);
                    prop_assert_eq!(after.reserved, (before.reserved - actual).max(0.0));
                }
                Op::Rollback(eighths) => {
                    let released = f64::from(eighths) / 8.0;
                    let after = ledger.rollback(&dataset, released).unwrap();
                    prop_assert_eq!(after.reserved, (before.reserved - released).max(0.0));
                    prop_assert_eq!(after.consumed, before.consumed);
                }
            }
            let PrivacyBudget { total, consumed, reserved } = ledger.snapshot(&dataset).unwrap();
            prop_assert!(consumed >= 0.0 && reserved >= 0.0);
            prop_assert!(consumed + reserved <= total);
        }
    }
}
