//! Pooled prediction market
//!
//! An event moves Open -> Resolving -> Resolved. Each event has its own lock;
//! votes and resolution both run under it, and resolution removes the event
//! from the open set (durably) before any payout is made, so a racing second
//! resolver sees either `AlreadyResolved` or `NotFound`.
//!
//! Winners whose credit fails are written back to the event store as an
//! owed record carrying the outcome; `settle_owed` pays them later.

use crate::common::traits::Clock;
use crate::common::types::{Choice, EventId, UserId};
use crate::config::PredictionConfig;
use crate::errors::{Missing, WagerError, WagerResult};
use crate::ledger::{points, Ledger};
use crate::storage::{RecordStore, SnapshotTable};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub choice: Choice,
    pub stake: u64,
}

/// Durable form of one open event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub host: UserId,
    pub proposition: String,
    pub min_bet: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub votes: BTreeMap<UserId, Vote>,
    /// Set once resolved; the record then only lists winners still unpaid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Choice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Resolving,
    Resolved,
}

struct EventSlot {
    record: EventRecord,
    phase: Phase,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventView {
    pub id: EventId,
    pub handle: String,
    pub host: UserId,
    pub proposition: String,
    pub min_bet: u64,
    pub created_at: DateTime<Utc>,
    pub yes_votes: usize,
    pub no_votes: usize,
    pub pool: u64,
}

impl From<&EventRecord> for EventView {
    fn from(record: &EventRecord) -> Self {
        let count = |c: Choice| record.votes.values().filter(|v| v.choice == c).count();
        Self {
            id: record.id,
            handle: record.id.short(),
            host: record.host,
            proposition: record.proposition.clone(),
            min_bet: record.min_bet,
            created_at: record.created_at,
            yes_votes: count(Choice::Yes),
            no_votes: count(Choice::No),
            pool: record.votes.values().map(|v| v.stake).sum(),
        }
    }
}

/// Vote acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub event: EventId,
    pub voter: UserId,
    pub choice: Choice,
    pub stake: u64,
    pub balance: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Payout {
    pub user: UserId,
    pub stake: u64,
    pub amount: u64,
    /// Balance after the credit; `None` if the credit failed to commit.
    pub balance: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionView {
    pub event: EventId,
    pub proposition: String,
    pub outcome: Choice,
    pub winners: Vec<Payout>,
    pub forfeited: Vec<(UserId, u64)>,
}

impl ResolutionView {
    pub fn total_paid(&self) -> u64 {
        self.winners
            .iter()
            .filter(|p| p.balance.is_some())
            .map(|p| p.amount)
            .sum()
    }
}

pub struct PredictionMarket {
    events: DashMap<EventId, Arc<Mutex<EventSlot>>>,
    open_per_host: DashMap<UserId, usize>,
    table: SnapshotTable<EventId, EventRecord>,
    rules: PredictionConfig,
    clock: Arc<dyn Clock>,
}

impl PredictionMarket {
    /// Restore open events from `store`.
    pub fn open(
        store: Arc<dyn RecordStore<EventId, EventRecord>>,
        rules: PredictionConfig,
        clock: Arc<dyn Clock>,
    ) -> WagerResult<Self> {
        let table = SnapshotTable::open(store)?;
        let events = DashMap::new();
        let open_per_host: DashMap<UserId, usize> = DashMap::new();
        for (id, record) in table.snapshot() {
            if record.outcome.is_some() {
                continue;
            }
            *open_per_host.entry(record.host).or_insert(0) += 1;
            events.insert(
                id,
                Arc::new(Mutex::new(EventSlot {
                    record,
                    phase: Phase::Open,
                })),
            );
        }
        debug!(events = events.len(), owed = table.len() - events.len(), "Prediction market opened");
        Ok(Self {
            events,
            open_per_host,
            table,
            rules,
            clock,
        })
    }

    pub fn rules(&self) -> &PredictionConfig {
        &self.rules
    }

    fn slot(&self, id: EventId) -> WagerResult<Arc<Mutex<EventSlot>>> {
        self.events
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(WagerError::NotFound(Missing::Event(id)))
    }

    /// Open a new event hosted by `host`.
    pub async fn create(&self, host: UserId, proposition: &str, min_bet: u64) -> WagerResult<EventView> {
        let proposition = proposition.trim();
        if proposition.is_empty() {
            return Err(WagerError::action_not_allowed(
                "create prediction",
                "the proposition is empty",
            ));
        }
        if min_bet == 0 {
            return Err(WagerError::invalid_stake(0, "the minimum bet must be at least 1"));
        }

        self.reserve_host_slot(host)?;

        let record = EventRecord {
            id: EventId::new(),
            host,
            proposition: proposition.to_string(),
            min_bet,
            created_at: self.clock.now(),
            votes: BTreeMap::new(),
            outcome: None,
        };
        if let Err(e) = self.table.upsert(record.id, record.clone()) {
            error!(host = %host, error = %e, "Failed to persist new prediction event");
            self.release_host_slot(host);
            return Err(e);
        }

        let view = EventView::from(&record);
        info!(event = %record.id, host = %host, min_bet, "Prediction event opened");
        self.events.insert(
            record.id,
            Arc::new(Mutex::new(EventSlot {
                record,
                phase: Phase::Open,
            })),
        );
        Ok(view)
    }

    fn reserve_host_slot(&self, host: UserId) -> WagerResult<()> {
        let limit = self.rules.max_open_per_host;
        let mut open = self.open_per_host.entry(host).or_insert(0);
        if *open >= limit {
            return Err(WagerError::TooManyActiveEvents { host, limit });
        }
        *open += 1;
        Ok(())
    }

    fn release_host_slot(&self, host: UserId) {
        if let Entry::Occupied(mut open) = self.open_per_host.entry(host) {
            if *open.get() <= 1 {
                open.remove();
            } else {
                *open.get_mut() -= 1;
            }
        }
    }

    /// Record a vote and escrow its stake.
    pub async fn vote(
        &self,
        ledger: &Ledger,
        voter: UserId,
        id: EventId,
        choice: Choice,
        stake: u64,
    ) -> WagerResult<Ack> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;

        if slot.phase != Phase::Open {
            return Err(WagerError::AlreadyResolved { event: id });
        }
        let record = &slot.record;
        if record.host == voter {
            return Err(WagerError::HostCannotVote { event: id });
        }
        if record.votes.contains_key(&voter) {
            return Err(WagerError::AlreadyVoted { voter, event: id });
        }
        if stake < record.min_bet {
            return Err(WagerError::invalid_stake(
                stake,
                format!("this event's minimum bet is {}", record.min_bet),
            ));
        }

        let (receipt, _) = ledger.transact(voter, |balance| {
            if balance < stake {
                return Err(WagerError::InsufficientBalance {
                    required: stake,
                    available: balance,
                });
            }
            Ok((-points(stake), ()))
        })?;

        let mut updated = slot.record.clone();
        updated.votes.insert(voter, Vote { choice, stake });
        if let Err(e) = self.table.upsert(id, updated.clone()) {
            error!(event = %id, voter = %voter, error = %e, "Failed to persist vote, refunding stake");
            if let Err(refund) = ledger.credit(voter, stake) {
                error!(voter = %voter, stake, error = %refund, "Vote refund failed");
            }
            return Err(e);
        }
        slot.record = updated;

        debug!(event = %id, voter = %voter, choice = %choice, stake, "Vote recorded");
        Ok(Ack {
            event: id,
            voter,
            choice,
            stake,
            balance: receipt.balance,
        })
    }

    /// Close an event and pay every matching voter exactly once.
    pub async fn resolve(
        &self,
        ledger: &Ledger,
        resolver: UserId,
        id: EventId,
        outcome: Choice,
    ) -> WagerResult<ResolutionView> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;

        if slot.phase != Phase::Open {
            return Err(WagerError::AlreadyResolved { event: id });
        }
        if slot.record.host != resolver && !self.rules.is_moderator(resolver) {
            return Err(WagerError::Unauthorized {
                actor: resolver,
                target: format!("prediction event {}", id),
            });
        }

        let age = self.clock.now() - slot.record.created_at;
        let dwell = self.rules.min_dwell();
        if age < dwell {
            let remaining_secs = (dwell - age).num_seconds().max(1);
            debug!(event = %id, remaining_secs, "Resolve rejected, event too young");
            return Err(WagerError::TooEarlyToResolve {
                event: id,
                remaining_secs,
            });
        }

        slot.phase = Phase::Resolving;
        if let Err(e) = self.table.remove(&id) {
            error!(event = %id, error = %e, "Failed to retire prediction event");
            slot.phase = Phase::Open;
            return Err(e);
        }
        self.events.remove(&id);
        self.release_host_slot(slot.record.host);

        let (winners, forfeited) = self.pay_winners(ledger, &slot.record, outcome);
        slot.phase = Phase::Resolved;

        let view = ResolutionView {
            event: id,
            proposition: slot.record.proposition.clone(),
            outcome,
            winners,
            forfeited,
        };
        self.remember_unpaid(&slot.record, outcome, &view.winners);
        info!(
            event = %id,
            resolver = %resolver,
            outcome = %outcome,
            winners = view.winners.len(),
            paid = view.total_paid(),
            "Prediction event resolved"
        );
        Ok(view)
    }

    fn pay_winners(
        &self,
        ledger: &Ledger,
        record: &EventRecord,
        outcome: Choice,
    ) -> (Vec<Payout>, Vec<(UserId, u64)>) {
        let multiplier = self.rules.payout_multiplier;
        let mut winners = Vec::new();
        let mut forfeited = Vec::new();
        for (&user, vote) in &record.votes {
            if vote.choice != outcome {
                forfeited.push((user, vote.stake));
                continue;
            }
            let amount = vote.stake.saturating_mul(multiplier);
            let balance = match ledger.credit(user, amount) {
                Ok(receipt) => Some(receipt.balance),
                Err(e) => {
                    error!(event = %record.id, user = %user, amount, error = %e, "Prediction payout failed");
                    None
                }
            };
            winners.push(Payout {
                user,
                stake: vote.stake,
                amount,
                balance,
            });
        }
        (winners, forfeited)
    }

    /// Persist the winners whose credit failed so a later pass can pay them.
    fn remember_unpaid(&self, record: &EventRecord, outcome: Choice, winners: &[Payout]) {
        let votes: BTreeMap<UserId, Vote> = winners
            .iter()
            .filter(|p| p.balance.is_none())
            .map(|p| (p.user, Vote { choice: outcome, stake: p.stake }))
            .collect();
        if votes.is_empty() {
            return;
        }
        let unpaid = votes.len();
        let owed = EventRecord {
            votes,
            outcome: Some(outcome),
            ..record.clone()
        };
        match self.table.upsert(record.id, owed) {
            Ok(()) => warn!(event = %record.id, unpaid, "Prediction resolved with unpaid winners, kept as owed"),
            Err(e) => error!(event = %record.id, unpaid, error = %e, "Failed to record unpaid prediction winners"),
        }
    }

    /// Pay winners left unpaid by an earlier resolution.
    ///
    /// Each owed record is removed before its credits run, so a payout is
    /// never made twice; credits that fail again are written back.
    pub fn settle_owed(&self, ledger: &Ledger) -> Vec<Payout> {
        let owed: Vec<EventRecord> = self
            .table
            .snapshot()
            .into_values()
            .filter(|r| r.outcome.is_some())
            .collect();

        let mut paid = Vec::new();
        for record in owed {
            let Some(outcome) = record.outcome else {
                continue;
            };
            match self.table.remove(&record.id) {
                Ok(Some(_)) => {}
                Ok(None) => continue,
                Err(e) => {
                    error!(event = %record.id, error = %e, "Failed to claim owed prediction payouts");
                    continue;
                }
            }
            let (winners, _) = self.pay_winners(ledger, &record, outcome);
            self.remember_unpaid(&record, outcome, &winners);
            paid.extend(winners.into_iter().filter(|p| p.balance.is_some()));
        }
        if !paid.is_empty() {
            info!(paid = paid.len(), "Settled owed prediction payouts");
        }
        paid
    }

    /// Events resolved with winners still waiting for their credit.
    pub fn owed_count(&self) -> usize {
        self.table.snapshot().values().filter(|r| r.outcome.is_some()).count()
    }

    /// Every open event, oldest first.
    pub fn open_events(&self) -> Vec<EventView> {
        let mut views: Vec<EventView> = self
            .table
            .snapshot()
            .values()
            .filter(|r| r.outcome.is_none())
            .map(EventView::from)
            .collect();
        views.sort_by_key(|v| v.created_at);
        views
    }

    pub fn open_count(&self, host: UserId) -> usize {
        self.open_per_host.get(&host).map(|n| *n).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::test_framework::{FailingStore, ManualClock};
    use crate::storage::MemoryStore;

    fn market(clock: Arc<ManualClock>) -> PredictionMarket {
        PredictionMarket::open(
            Arc::new(MemoryStore::<EventId, EventRecord>::new()),
            PredictionConfig::default(),
            clock,
        )
        .unwrap()
    }

    fn funded(users: &[(u64, u64)]) -> Ledger {
        let ledger = Ledger::in_memory();
        for &(user, amount) in users {
            ledger.credit(UserId(user), amount).unwrap();
        }
        ledger
    }

    #[tokio::test]
    async fn test_host_cap() {
        let market = market(Arc::new(ManualClock::default()));
        for i in 0..5 {
            market.create(UserId(1), &format!("event {}", i), 5).await.unwrap();
        }
        let err = market.create(UserId(1), "one too many", 5).await.unwrap_err();
        assert!(matches!(err, WagerError::TooManyActiveEvents { limit: 5, .. }));
        assert_eq!(market.open_count(UserId(1)), 5);
        market.create(UserId(2), "someone else", 5).await.unwrap();
    }

    #[tokio::test]
    async fn test_vote_rules() {
        let market = market(Arc::new(ManualClock::default()));
        let ledger = funded(&[(2, 100), (3, 3)]);
        let event = market.create(UserId(1), "rain tomorrow", 5).await.unwrap();

        let err = market.vote(&ledger, UserId(1), event.id, Choice::Yes, 10).await.unwrap_err();
        assert!(matches!(err, WagerError::HostCannotVote { .. }));

        let err = market.vote(&ledger, UserId(2), event.id, Choice::Yes, 4).await.unwrap_err();
        assert!(matches!(err, WagerError::InvalidStake { stake: 4, .. }));

        let err = market.vote(&ledger, UserId(3), event.id, Choice::No, 5).await.unwrap_err();
        assert!(matches!(err, WagerError::InsufficientBalance { required: 5, available: 3 }));

        let ack = market.vote(&ledger, UserId(2), event.id, Choice::Yes, 30).await.unwrap();
        assert_eq!(ack.balance, 70);

        let err = market.vote(&ledger, UserId(2), event.id, Choice::No, 5).await.unwrap_err();
        assert!(matches!(err, WagerError::AlreadyVoted { .. }));
        assert_eq!(ledger.balance(UserId(2)), 70);
    }

    #[tokio::test]
    async fn test_resolution_pays_matching_voters_once() {
        let clock = Arc::new(ManualClock::default());
        let market = market(clock.clone());
        let ledger = funded(&[(2, 100), (3, 100)]);
        let event = market.create(UserId(1), "launch on time", 5).await.unwrap();
        market.vote(&ledger, UserId(2), event.id, Choice::Yes, 20).await.unwrap();
        market.vote(&ledger, UserId(3), event.id, Choice::No, 40).await.unwrap();

        clock.advance_secs(30);
        let err = market.resolve(&ledger, UserId(1), event.id, Choice::Yes).await.unwrap_err();
        assert!(matches!(err, WagerError::TooEarlyToResolve { remaining_secs: 30, .. }));
        assert_eq!(market.open_events().len(), 1);

        clock.advance_secs(31);
        let resolution = market.resolve(&ledger, UserId(1), event.id, Choice::Yes).await.unwrap();
        assert_eq!(resolution.total_paid(), 40);
        assert_eq!(resolution.forfeited, vec![(UserId(3), 40)]);
        assert_eq!(ledger.balance(UserId(2)), 120);
        assert_eq!(ledger.balance(UserId(3)), 60);

        let err = market.resolve(&ledger, UserId(1), event.id, Choice::Yes).await.unwrap_err();
        assert!(matches!(err, WagerError::NotFound(Missing::Event(_))));
        assert_eq!(ledger.balance(UserId(2)), 120);
        assert_eq!(market.open_count(UserId(1)), 0);
    }

    #[tokio::test]
    async fn test_only_host_or_moderator_resolves() {
        let clock = Arc::new(ManualClock::default());
        let rules = PredictionConfig {
            moderators: vec![UserId(99)],
            ..PredictionConfig::default()
        };
        let market = PredictionMarket::open(
            Arc::new(MemoryStore::<EventId, EventRecord>::new()),
            rules,
            clock.clone(),
        )
        .unwrap();
        let ledger = Ledger::in_memory();
        let event = market.create(UserId(1), "moderated", 5).await.unwrap();
        clock.advance_secs(60);

        let err = market.resolve(&ledger, UserId(2), event.id, Choice::No).await.unwrap_err();
        assert!(matches!(err, WagerError::Unauthorized { .. }));
        market.resolve(&ledger, UserId(99), event.id, Choice::No).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_vote_write_refunds_stake() {
        let store: Arc<FailingStore<EventId, EventRecord>> = Arc::new(FailingStore::new());
        let market = PredictionMarket::open(
            store.clone(),
            PredictionConfig::default(),
            Arc::new(ManualClock::default()),
        )
        .unwrap();
        let ledger = funded(&[(2, 50)]);
        let event = market.create(UserId(1), "flaky disk", 5).await.unwrap();

        store.fail_writes(true);
        let err = market.vote(&ledger, UserId(2), event.id, Choice::Yes, 10).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(ledger.balance(UserId(2)), 50);

        store.fail_writes(false);
        market.vote(&ledger, UserId(2), event.id, Choice::Yes, 10).await.unwrap();
        assert_eq!(market.open_events()[0].yes_votes, 1);
    }

    #[tokio::test]
    async fn test_events_survive_reopen() {
        let store: Arc<MemoryStore<EventId, EventRecord>> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let ledger = funded(&[(2, 50)]);
        let event = {
            let market =
                PredictionMarket::open(store.clone(), PredictionConfig::default(), clock.clone()).unwrap();
            let event = market.create(UserId(1), "persisted", 5).await.unwrap();
            market.vote(&ledger, UserId(2), event.id, Choice::No, 10).await.unwrap();
            event
        };

        let market = PredictionMarket::open(store, PredictionConfig::default(), clock.clone()).unwrap();
        assert_eq!(market.open_count(UserId(1)), 1);
        let views = market.open_events();
        assert_eq!(views[0].id, event.id);
        assert_eq!(views[0].pool, 10);

        clock.advance_secs(60);
        market.resolve(&ledger, UserId(1), event.id, Choice::No).await.unwrap();
        assert_eq!(ledger.balance(UserId(2)), 60);
    }

    #[tokio::test]
    async fn test_unpaid_winners_are_settled_later() {
        let balances: Arc<FailingStore<UserId, u64>> = Arc::new(FailingStore::new());
        let events: Arc<MemoryStore<EventId, EventRecord>> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let ledger = Ledger::open(balances.clone()).unwrap();
        ledger.credit(UserId(2), 100).unwrap();
        ledger.credit(UserId(3), 100).unwrap();

        let market = PredictionMarket::open(events.clone(), PredictionConfig::default(), clock.clone()).unwrap();
        let event = market.create(UserId(1), "ledger outage", 5).await.unwrap();
        market.vote(&ledger, UserId(2), event.id, Choice::Yes, 20).await.unwrap();
        market.vote(&ledger, UserId(3), event.id, Choice::Yes, 10).await.unwrap();
        clock.advance_secs(60);

        balances.fail_writes(true);
        let resolution = market.resolve(&ledger, UserId(1), event.id, Choice::Yes).await.unwrap();
        assert_eq!(resolution.total_paid(), 0);
        assert!(market.open_events().is_empty());
        assert_eq!(market.owed_count(), 1);
        assert_eq!(market.open_count(UserId(1)), 0);
        let err = market.resolve(&ledger, UserId(1), event.id, Choice::Yes).await.unwrap_err();
        assert!(matches!(err, WagerError::NotFound(_)));

        // The owed record outlives the market and is not an open event.
        let market = PredictionMarket::open(events, PredictionConfig::default(), clock).unwrap();
        assert!(market.open_events().is_empty());
        assert!(market.settle_owed(&ledger).is_empty());
        assert_eq!(market.owed_count(), 1);

        balances.fail_writes(false);
        let paid = market.settle_owed(&ledger);
        assert_eq!(paid.len(), 2);
        assert_eq!(ledger.balance(UserId(2)), 120);
        assert_eq!(ledger.balance(UserId(3)), 110);
        assert_eq!(market.owed_count(), 0);
        assert!(market.settle_owed(&ledger).is_empty());
        assert_eq!(ledger.balance(UserId(2)), 120);
    }
}
