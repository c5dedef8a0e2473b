//! Per-user play statistics for profile rendering, written through to the
//! profile store.

use crate::common::types::UserId;
use crate::errors::WagerResult;
use crate::storage::{MemoryStore, RecordStore, SnapshotTable};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerStats {
    pub blackjack_hands: u64,
    pub blackjack_wins: u64,
    pub spins: u64,
    pub biggest_spin_payout: u64,
    pub prediction_wins: u64,
}

pub struct StatsBook {
    table: SnapshotTable<UserId, PlayerStats>,
}

impl StatsBook {
    /// Load saved profiles from `store`.
    pub fn open(store: Arc<dyn RecordStore<UserId, PlayerStats>>) -> WagerResult<Self> {
        let table = SnapshotTable::open(store)?;
        debug!(profiles = table.len(), "Stats book opened");
        Ok(Self { table })
    }

    pub fn in_memory() -> Self {
        Self {
            table: SnapshotTable::empty(Arc::new(MemoryStore::<UserId, PlayerStats>::new())),
        }
    }

    pub fn get(&self, user: UserId) -> PlayerStats {
        self.table.get(&user).unwrap_or_default()
    }

    /// Counters trail the ledger; a failed profile write is logged, never
    /// surfaced to the game that produced it.
    fn update(&self, user: UserId, f: impl FnOnce(&mut PlayerStats)) {
        let result = self.table.modify(user, |current| {
            let mut stats = current.copied().unwrap_or_default();
            f(&mut stats);
            stats
        });
        if let Err(e) = result {
            error!(user = %user, error = %e, "Failed to save player stats");
        }
    }

    pub fn record_hand(&self, user: UserId, won: bool) {
        self.update(user, |s| {
            s.blackjack_hands += 1;
            if won {
                s.blackjack_wins += 1;
            }
        });
    }

    pub fn record_spin(&self, user: UserId, payout: u64) {
        self.update(user, |s| {
            s.spins += 1;
            s.biggest_spin_payout = s.biggest_spin_payout.max(payout);
        });
    }

    pub fn record_prediction_win(&self, user: UserId) {
        self.update(user, |s| s.prediction_wins += 1);
    }
}
