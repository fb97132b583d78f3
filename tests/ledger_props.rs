use std::sync::Arc;

use proptest::prelude::*;
use tokio::sync::Barrier;

use creditchat::models::{LedgerLink, UserAccount};
use creditchat::services::{CreditLedger, Database, Reservation};
use creditchat::ChatError;

#[derive(Debug, Clone)]
enum Op {
    Grant(i64),
    Reserve(i64),
    Refund,
    Commit,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1i64..50).prop_map(Op::Grant),
        (0i64..40).prop_map(Op::Reserve),
        Just(Op::Refund),
        Just(Op::Commit),
    ]
}

struct Outcome {
    expected: i64,
    balance: i64,
    sum: i64,
    running_ok: bool,
    min_balance: i64,
}

async fn replay(opening: i64, ops: Vec<Op>) -> Outcome {
    let db = Database::new_in_memory().unwrap();
    let mut user = UserAccount::new("u1");
    user.credits = opening;
    db.insert_user(&user).await.unwrap();
    let ledger = CreditLedger::new(db.clone());

    let mut expected = opening;
    let mut open: Vec<Reservation> = Vec::new();
    for op in ops {
        match op {
            Op::Grant(amount) => {
                ledger.grant("u1", amount, "top-up").await.unwrap();
                expected += amount;
            }
            Op::Reserve(amount) => match ledger.reserve("u1", amount, LedgerLink::default()).await {
                Ok(reservation) => {
                    expected -= amount;
                    open.push(reservation);
                }
                Err(ChatError::InsufficientCredits { available, .. }) => {
                    assert!(available < amount);
                }
                Err(e) => panic!("unexpected ledger error: {}", e),
            },
            Op::Refund => {
                if !open.is_empty() {
                    let reservation = open.remove(0);
                    expected += reservation.amount();
                    reservation.refund("released").await.unwrap();
                }
            }
            Op::Commit => {
                if !open.is_empty() {
                    open.remove(0).commit();
                }
            }
        }
    }
    for reservation in open {
        reservation.commit();
    }

    let entries = ledger.entries("u1").await.unwrap();
    let mut running = 0;
    let mut running_ok = true;
    let mut min_balance = i64::MAX;
    for entry in &entries {
        running += entry.delta;
        running_ok &= entry.balance_after == running;
        min_balance = min_balance.min(entry.balance_after);
    }

    Outcome {
        expected,
        balance: db.get_user("u1").await.unwrap().unwrap().credits,
        sum: running,
        running_ok,
        min_balance: if entries.is_empty() { 0 } else { min_balance },
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn balance_always_equals_ledger_sum(
        opening in 0i64..100,
        ops in prop::collection::vec(op_strategy(), 0..24),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let outcome = rt.block_on(replay(opening, ops));

        prop_assert_eq!(outcome.balance, outcome.expected);
        prop_assert_eq!(outcome.balance, outcome.sum);
        prop_assert!(outcome.running_ok);
        prop_assert!(outcome.min_balance >= 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_overdraw() {
    const AFFORDABLE: usize = 5;
    const ATTEMPTS: usize = 20;

    let db = Database::new_in_memory().unwrap();
    let mut user = UserAccount::new("u1");
    user.credits = 10 * AFFORDABLE as i64;
    db.insert_user(&user).await.unwrap();
    let ledger = CreditLedger::new(db.clone());

    let start = Arc::new(Barrier::new(ATTEMPTS));
    let mut tasks = Vec::new();
    for _ in 0..ATTEMPTS {
        let ledger = ledger.clone();
        let start = start.clone();
        tasks.push(tokio::spawn(async move {
            start.wait().await;
            ledger
                .reserve("u1", 10, LedgerLink::default())
                .await
                .map(Reservation::commit)
        }));
    }

    let mut reserved = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => reserved += 1,
            Err(ChatError::InsufficientCredits { required, available }) => {
                assert_eq!(required, 10);
                assert!(available < 10);
            }
            Err(e) => panic!("unexpected ledger error: {}", e),
        }
    }
    assert_eq!(reserved, AFFORDABLE);

    let balance = db.get_user("u1").await.unwrap().unwrap().credits;
    assert_eq!(balance, 0);
    let entries = ledger.entries("u1").await.unwrap();
    assert_eq!(entries.iter().map(|e| e.delta).sum::<i64>(), balance);
    assert!(entries.iter().all(|e| e.balance_after >= 0));
    assert_eq!(entries.len(), 1 + AFFORDABLE);
}
