//! Point ledger: the single source of truth for every user's balance
//!
//! Balances live in memory behind one mutex per user and are written through
//! to the balance store before the in-memory value changes. Every
//! read-modify-write for a user runs inside that user's critical section, so
//! concurrent adjustments never lose an update.

use crate::common::types::UserId;
use crate::errors::WagerResult;
use crate::storage::{lock, MemoryStore, RecordStore, SnapshotTable};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

/// Largest balance an account can hold, so every balance fits a signed delta.
pub const MAX_BALANCE: u64 = i64::MAX as u64;

/// Signed delta for a point amount, saturating at `MAX_BALANCE`.
pub fn points(amount: u64) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}

/// Result of one committed adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub user: UserId,
    pub previous: u64,
    pub balance: u64,
}

impl Receipt {
    /// Change actually applied, after the zero floor.
    pub fn applied(&self) -> i64 {
        points(self.balance) - points(self.previous)
    }
}

pub struct Ledger {
    accounts: DashMap<UserId, Arc<Mutex<u64>>>,
    table: SnapshotTable<UserId, u64>,
}

impl Ledger {
    /// Load committed balances from `store`.
    pub fn open(store: Arc<dyn RecordStore<UserId, u64>>) -> WagerResult<Self> {
        let table = SnapshotTable::open(store)?;
        let accounts = DashMap::new();
        for (user, balance) in table.snapshot() {
            accounts.insert(user, Arc::new(Mutex::new(balance)));
        }
        debug!(accounts = accounts.len(), "Ledger opened");
        Ok(Self { accounts, table })
    }

    pub fn in_memory() -> Self {
        Self {
            accounts: DashMap::new(),
            table: SnapshotTable::empty(Arc::new(MemoryStore::<UserId, u64>::new())),
        }
    }

    fn account(&self, user: UserId) -> Arc<Mutex<u64>> {
        // Clone the handle so the map shard is released before locking.
        Arc::clone(&self.accounts.entry(user).or_insert_with(|| Arc::new(Mutex::new(0))))
    }

    /// Current balance; unknown users hold zero.
    pub fn balance(&self, user: UserId) -> u64 {
        let account = self.accounts.get(&user).map(|a| Arc::clone(a.value()));
        match account {
            Some(account) => *lock(&account),
            None => 0,
        }
    }

    /// Add `delta` to the user's balance, flooring at zero.
    pub fn adjust(&self, user: UserId, delta: i64) -> WagerResult<Receipt> {
        self.transact(user, |_| Ok((delta, ()))).map(|(receipt, _)| receipt)
    }

    pub fn credit(&self, user: UserId, amount: u64) -> WagerResult<Receipt> {
        self.adjust(user, points(amount))
    }

    /// Run a read-modify-write against one user's balance.
    ///
    /// `decide` sees the current balance and returns the delta to apply plus
    /// any value to hand back. It runs while the user's lock is held and must
    /// not touch the same user's ledger entry. If `decide` fails nothing is
    /// written; if the store write fails the balance keeps its committed value.
    pub fn transact<T, F>(&self, user: UserId, decide: F) -> WagerResult<(Receipt, T)>
    where
        F: FnOnce(u64) -> WagerResult<(i64, T)>,
    {
        let account = self.account(user);
        let mut balance = lock(&account);
        let previous = *balance;
        let (delta, value) = decide(previous)?;
        let next = apply_delta(previous, delta);

        if next != previous {
            if let Err(e) = self.table.upsert(user, next) {
                error!(user = %user, delta, error = %e, "Balance write failed");
                return Err(e);
            }
            *balance = next;
        }

        debug!(user = %user, delta, previous, balance = next, "Balance adjusted");
        Ok((
            Receipt {
                user,
                previous,
                balance: next,
            },
            value,
        ))
    }

    /// Committed balances, as last written to the store.
    pub fn snapshot(&self) -> BTreeMap<UserId, u64> {
        self.table.snapshot()
    }
}

fn apply_delta(balance: u64, delta: i64) -> u64 {
    if delta >= 0 {
        balance.saturating_add(delta.unsigned_abs()).min(MAX_BALANCE)
    } else {
        balance.saturating_sub(delta.unsigned_abs())
    }
}
