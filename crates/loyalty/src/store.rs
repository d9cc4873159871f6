//! Per-account storage: balance counters and the append-only transaction
//! log, each account behind its own mutex.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use marketplace_core::loyalty::{Account, Transaction, TransactionCategory, TransactionRef};
use marketplace_core::{LoyaltyError, LoyaltyResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// One account with its complete transaction history.
#[derive(Debug, Clone)]
pub struct AccountRecord {
    account: Account,
    transactions: Vec<Transaction>,
}

impl AccountRecord {
    fn new(account: Account) -> Self {
        Self {
            account,
            transactions: Vec::new(),
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub(crate) fn set_tier(&mut self, tier: String) {
        self.account.tier = tier;
    }

    /// Apply a validated, non-zero delta and append its transaction.
    ///
    /// Positive deltas raise `lifetime_earned`. Negative administrative
    /// deltas lower it; every other debit raises `lifetime_redeemed`. Callers
    /// must have checked that a debit does not exceed the balance.
    pub(crate) fn post(
        &mut self,
        delta: i64,
        category: TransactionCategory,
        description: String,
        reference: Option<TransactionRef>,
        actor: Option<String>,
        now: DateTime<Utc>,
    ) -> Transaction {
        debug_assert!(delta != 0);
        let magnitude = delta.unsigned_abs();
        let account = &mut self.account;

        if delta > 0 {
            account.balance += magnitude;
            account.lifetime_earned += magnitude;
        } else {
            debug_assert!(magnitude <= account.balance);
            account.balance -= magnitude;
            if category == TransactionCategory::AdminAdjustment {
                account.lifetime_earned -= magnitude;
            } else {
                account.lifetime_redeemed += magnitude;
            }
        }

        if category.is_earning() {
            account.last_earn_at = Some(now);
        }
        if category == TransactionCategory::RedeemVoucher {
            account.last_redeem_at = Some(now);
        }

        let transaction = Transaction {
            id: Uuid::new_v4(),
            account_id: account.account_id.clone(),
            sequence: self.transactions.len() as u64 + 1,
            delta,
            balance_after: account.balance,
            category,
            description,
            reference,
            actor,
            created_at: now,
        };
        self.transactions.push(transaction.clone());
        transaction
    }

    /// Replay the log and check it reproduces every snapshot and the
    /// counters.
    pub fn verify(&self) -> Result<(), String> {
        let replayed = replay(&self.transactions)?;
        if replayed != self.account.balance {
            return Err(format!(
                "balance {} but replay gives {}",
                self.account.balance, replayed
            ));
        }
        if !self.account.is_balanced() {
            return Err(format!(
                "balance {} != lifetime_earned {} - lifetime_redeemed {}",
                self.account.balance, self.account.lifetime_earned, self.account.lifetime_redeemed
            ));
        }
        Ok(())
    }
}

/// Sum one account's deltas in order, checking sequence numbers, non-zero
/// deltas and every balance snapshot. Returns the final balance.
pub fn replay(transactions: &[Transaction]) -> Result<u64, String> {
    let mut running: i64 = 0;
    for (index, tx) in transactions.iter().enumerate() {
        if tx.delta == 0 {
            return Err(format!("transaction {} has a zero delta", tx.sequence));
        }
        if tx.sequence != index as u64 + 1 {
            return Err(format!(
                "transaction at position {} has sequence {}",
                index + 1,
                tx.sequence
            ));
        }
        running = running
            .checked_add(tx.delta)
            .ok_or_else(|| format!("balance overflowed at sequence {}", tx.sequence))?;
        if running < 0 {
            return Err(format!("balance went negative at sequence {}", tx.sequence));
        }
        if running as u64 != tx.balance_after {
            return Err(format!(
                "sequence {} snapshot {} but replay gives {}",
                tx.sequence, tx.balance_after, running
            ));
        }
    }
    Ok(running as u64)
}

/// In-memory account storage backed by `DashMap`.
///
/// Mutations run inside `with_account*` closures while holding the
/// account's lock, so read-validate-write is never interleaved with another
/// writer on the same account.
pub struct AccountStore {
    accounts: DashMap<String, Arc<Mutex<AccountRecord>>>,
    lock_timeout: Duration,
}

impl AccountStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            accounts: DashMap::new(),
            lock_timeout,
        }
    }

    pub fn contains(&self, account_id: &str) -> bool {
        self.accounts.contains_key(account_id)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn account_ids(&self) -> Vec<String> {
        self.accounts.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Run `f` with exclusive access to an existing account.
    pub fn with_account<R>(
        &self,
        account_id: &str,
        f: impl FnOnce(&mut AccountRecord) -> LoyaltyResult<R>,
    ) -> LoyaltyResult<R> {
        let slot = self
            .accounts
            .get(account_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| LoyaltyError::AccountNotFound(account_id.to_string()))?;
        self.locked(account_id, &slot, f)
    }

    /// Run `f` with exclusive access to an account, creating it first when
    /// it does not exist yet.
    pub fn with_account_or_open<R>(
        &self,
        account_id: &str,
        base_tier: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut AccountRecord) -> LoyaltyResult<R>,
    ) -> LoyaltyResult<R> {
        let slot = self
            .accounts
            .entry(account_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(AccountRecord::new(Account::new(
                    account_id, base_tier, now,
                ))))
            })
            .value()
            .clone();
        self.locked(account_id, &slot, f)
    }

    /// Consistent copy of an account and its log.
    pub fn snapshot(&self, account_id: &str) -> LoyaltyResult<AccountRecord> {
        self.with_account(account_id, |record| Ok(record.clone()))
    }

    fn locked<R>(
        &self,
        account_id: &str,
        slot: &Mutex<AccountRecord>,
        f: impl FnOnce(&mut AccountRecord) -> LoyaltyResult<R>,
    ) -> LoyaltyResult<R> {
        let Some(mut record) = slot.try_lock_for(self.lock_timeout) else {
            metrics::counter!("loyalty.lock_timeouts").increment(1);
            warn!(
                account_id,
                timeout_ms = self.lock_timeout.as_millis() as u64,
                "Account lock timed out"
            );
            return Err(LoyaltyError::ConcurrentModification(format!(
                "account {account_id}"
            )));
        };
        f(&mut *record)
    }
}
