//! Per-account serialization under real threads.

use marketplace_core::config::AppConfig;
use marketplace_core::loyalty::TransactionCategory;
use marketplace_core::LoyaltyError;
use marketplace_loyalty::LoyaltyEngine;
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

fn engine() -> Arc<LoyaltyEngine> {
    let mut app = AppConfig::default();
    app.ledger.lock_timeout_ms = 2_000;
    Arc::new(LoyaltyEngine::new(&app).unwrap())
}

#[test]
fn test_concurrent_spends_cannot_overdraw() {
    for _ in 0..50 {
        let engine = engine();
        engine
            .ledger()
            .earn("user-1", 1000, TransactionCategory::EarnBooking, "booking", None)
            .unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let engine = engine.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    engine.ledger().spend(
                        "user-1",
                        700,
                        TransactionCategory::RedeemVoucher,
                        "race",
                        None,
                    )
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        for result in results.iter().filter(|r| r.is_err()) {
            assert!(matches!(
                result,
                Err(LoyaltyError::InsufficientBalance { .. })
                    | Err(LoyaltyError::ConcurrentModification(_))
            ));
        }

        let account = engine.ledger().account("user-1").unwrap();
        assert_eq!(account.balance, 300);
        assert!(engine.ledger().verify("user-1").is_ok());
    }
}

#[test]
fn test_parallel_earn_and_spend_keep_log_consistent() {
    let engine = engine();
    engine
        .ledger()
        .earn("user-1", 5_000, TransactionCategory::EarnBooking, "seed", None)
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let engine = engine.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    if (worker + i) % 2 == 0 {
                        let _ = engine.ledger().earn(
                            "user-1",
                            7,
                            TransactionCategory::EarnReview,
                            "review",
                            None,
                        );
                    } else {
                        let _ = engine.ledger().spend(
                            "user-1",
                            11,
                            TransactionCategory::RedeemVoucher,
                            "spend",
                            None,
                        );
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let account = engine.ledger().account("user-1").unwrap();
    assert!(account.is_balanced());
    assert!(engine.ledger().verify("user-1").is_ok());

    let sequences: Vec<u64> = engine
        .ledger()
        .transactions("user-1")
        .unwrap()
        .iter()
        .map(|tx| tx.sequence)
        .collect();
    let expected: Vec<u64> = (1..=sequences.len() as u64).collect();
    assert_eq!(sequences, expected);
}

#[test]
fn test_concurrent_redemptions_mint_unique_codes() {
    let engine = engine();
    let accounts: Vec<String> = (0..8).map(|i| format!("user-{i}")).collect();
    for account in &accounts {
        engine
            .ledger()
            .earn(account, 20_000, TransactionCategory::EarnBooking, "seed", None)
            .unwrap();
    }

    let handles: Vec<_> = accounts
        .iter()
        .cloned()
        .map(|account| {
            let engine = engine.clone();
            thread::spawn(move || {
                (0..15)
                    .map(|_| engine.vouchers().redeem(&account, 100.0).unwrap().code)
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut codes = HashSet::new();
    for handle in handles {
        for code in handle.join().unwrap() {
            assert!(codes.insert(code), "duplicate voucher code");
        }
    }
    assert_eq!(codes.len(), 8 * 15);
    assert_eq!(engine.vouchers().len(), 8 * 15);

    for account in &accounts {
        assert_eq!(engine.ledger().account(account).unwrap().balance, 5_000);
    }
}

#[test]
fn test_concurrent_apply_succeeds_once() {
    let engine = engine();
    engine
        .ledger()
        .earn("user-1", 1_000, TransactionCategory::EarnBooking, "seed", None)
        .unwrap();
    let code = engine.vouchers().redeem("user-1", 100.0).unwrap().code;

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            let code = code.clone();
            thread::spawn(move || {
                barrier.wait();
                engine
                    .vouchers()
                    .apply(&code, "user-1", 80.0, &format!("purchase-{i}"))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, LoyaltyError::AlreadyUsed)));
}
