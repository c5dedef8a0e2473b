//! Entry point for transport: one `Casino` per deployment
//!
//! Wires the ledger, the session registry and the prediction market to
//! their stores, and exposes every operation the chat front end calls.

use crate::common::traits::{Clock, OutcomeSource, RandomSource, SystemClock};
use crate::common::types::{Choice, EventId, GameKind, SessionId, UserId};
use crate::config::WagerConfig;
use crate::errors::WagerResult;
use crate::games::slots::ReelStrip;
use crate::ledger::{Ledger, Receipt};
use crate::prediction::{Ack, EventRecord, EventView, Payout, PredictionMarket, ResolutionView};
use crate::sessions::{Action, ReapedSession, SessionRegistry, SessionView, TableRules};
use crate::stats::{PlayerStats, StatsBook};
use crate::storage::{JsonFileStore, MemoryStore, RecordStore};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

pub struct Casino {
    config: WagerConfig,
    ledger: Arc<Ledger>,
    sessions: Arc<SessionRegistry>,
    market: PredictionMarket,
    stats: Arc<StatsBook>,
}

/// Builder for swapping in stores, randomness or time
pub struct CasinoBuilder {
    config: WagerConfig,
    source: Arc<dyn OutcomeSource>,
    clock: Arc<dyn Clock>,
    balances: Option<Arc<dyn RecordStore<UserId, u64>>>,
    events: Option<Arc<dyn RecordStore<EventId, EventRecord>>>,
    profiles: Option<Arc<dyn RecordStore<UserId, PlayerStats>>>,
}

impl CasinoBuilder {
    pub fn new(config: WagerConfig) -> Self {
        Self {
            config,
            source: Arc::new(RandomSource),
            clock: Arc::new(SystemClock),
            balances: None,
            events: None,
            profiles: None,
        }
    }

    pub fn source(mut self, source: Arc<dyn OutcomeSource>) -> Self {
        self.source = source;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn balance_store(mut self, store: Arc<dyn RecordStore<UserId, u64>>) -> Self {
        self.balances = Some(store);
        self
    }

    pub fn event_store(mut self, store: Arc<dyn RecordStore<EventId, EventRecord>>) -> Self {
        self.events = Some(store);
        self
    }

    pub fn profile_store(mut self, store: Arc<dyn RecordStore<UserId, PlayerStats>>) -> Self {
        self.profiles = Some(store);
        self
    }

    /// Open the stores named by the config unless overridden.
    pub fn build(self) -> WagerResult<Casino> {
        let storage = &self.config.storage;
        let balances: Arc<dyn RecordStore<UserId, u64>> = match self.balances {
            Some(store) => store,
            None if storage.in_memory => Arc::new(MemoryStore::<UserId, u64>::new()),
            None => Arc::new(JsonFileStore::new(storage.balances_path())),
        };
        let events: Arc<dyn RecordStore<EventId, EventRecord>> = match self.events {
            Some(store) => store,
            None if storage.in_memory => Arc::new(MemoryStore::<EventId, EventRecord>::new()),
            None => Arc::new(JsonFileStore::new(storage.predictions_path())),
        };
        let profiles: Arc<dyn RecordStore<UserId, PlayerStats>> = match self.profiles {
            Some(store) => store,
            None if storage.in_memory => Arc::new(MemoryStore::<UserId, PlayerStats>::new()),
            None => Arc::new(JsonFileStore::new(storage.profiles_path())),
        };

        let ledger = Arc::new(Ledger::open(balances)?);
        let stats = Arc::new(StatsBook::open(profiles)?);
        let rules = TableRules {
            min_stake: self.config.blackjack.min_stake,
            ladder: self.config.slots.ladder()?,
            strip: ReelStrip::standard()?,
            idle_timeout: self.config.sessions.idle_timeout(),
        };
        let sessions = Arc::new(SessionRegistry::new(
            ledger.clone(),
            stats.clone(),
            self.source,
            self.clock.clone(),
            rules,
        ));
        let market = PredictionMarket::open(events, self.config.prediction.clone(), self.clock)?;

        info!(
            in_memory = storage.in_memory,
            data_dir = %storage.data_dir,
            open_events = market.open_events().len(),
            owed_events = market.owed_count(),
            "Casino ready"
        );
        let casino = Casino {
            config: self.config,
            ledger,
            sessions,
            market,
            stats,
        };
        casino.settle_owed_payouts();
        Ok(casino)
    }
}

impl Casino {
    /// Open with the configured stores, real randomness and the wall clock.
    pub fn open(config: WagerConfig) -> WagerResult<Self> {
        CasinoBuilder::new(config).build()
    }

    pub fn in_memory(mut config: WagerConfig) -> WagerResult<Self> {
        config.storage.in_memory = true;
        CasinoBuilder::new(config).build()
    }

    pub fn builder(config: WagerConfig) -> CasinoBuilder {
        CasinoBuilder::new(config)
    }

    pub fn config(&self) -> &WagerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub async fn start_game(&self, user: UserId, kind: GameKind, stake: u64) -> WagerResult<SessionView> {
        self.sessions.start(user, kind, stake).await
    }

    pub async fn apply_action(
        &self,
        user: UserId,
        session: SessionId,
        action: Action,
    ) -> WagerResult<SessionView> {
        self.sessions.apply(user, session, action).await
    }

    pub async fn create_prediction(
        &self,
        host: UserId,
        proposition: &str,
        min_bet: u64,
    ) -> WagerResult<EventView> {
        self.market.create(host, proposition, min_bet).await
    }

    pub async fn vote(&self, user: UserId, event: EventId, choice: Choice, stake: u64) -> WagerResult<Ack> {
        self.market.vote(&self.ledger, user, event, choice, stake).await
    }

    pub async fn resolve_prediction(
        &self,
        user: UserId,
        event: EventId,
        outcome: Choice,
    ) -> WagerResult<ResolutionView> {
        let resolution = self.market.resolve(&self.ledger, user, event, outcome).await?;
        self.record_prediction_wins(&resolution.winners);
        Ok(resolution)
    }

    /// Retry prediction winners whose credit failed at resolution.
    pub fn settle_owed_payouts(&self) -> Vec<Payout> {
        let paid = self.market.settle_owed(&self.ledger);
        self.record_prediction_wins(&paid);
        paid
    }

    fn record_prediction_wins(&self, winners: &[Payout]) {
        for payout in winners.iter().filter(|p| p.balance.is_some()) {
            self.stats.record_prediction_win(payout.user);
        }
    }

    pub fn balance(&self, user: UserId) -> u64 {
        self.ledger.balance(user)
    }

    /// Credit the configured reward for one unit of chat activity.
    pub fn reward_activity(&self, user: UserId) -> WagerResult<Receipt> {
        self.ledger.credit(user, self.config.ledger.activity_reward)
    }

    pub fn open_predictions(&self) -> Vec<EventView> {
        self.market.open_events()
    }

    pub fn stats(&self, user: UserId) -> PlayerStats {
        self.stats.get(user)
    }

    pub async fn reap_idle(&self) -> Vec<ReapedSession> {
        self.sessions.reap_idle().await
    }

    /// Refund every live session before the process exits.
    pub async fn shutdown(&self) -> Vec<ReapedSession> {
        self.sessions.retire_all().await
    }

    /// Start the background idle reaper at the configured interval.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        Arc::clone(&self.sessions).spawn_reaper(self.config.sessions.reap_interval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::WagerError;
    use crate::games::cards::Rank;
    use crate::games::test_framework::{FailingStore, ManualClock, ScriptedSource};

    #[tokio::test]
    async fn test_activity_reward_uses_config() {
        let mut config = WagerConfig::default();
        config.ledger.activity_reward = 3;
        let casino = Casino::in_memory(config).unwrap();
        casino.reward_activity(UserId(1)).unwrap();
        let receipt = casino.reward_activity(UserId(1)).unwrap();
        assert_eq!(receipt.balance, 6);
        assert_eq!(casino.balance(UserId(1)), 6);
    }

    #[tokio::test]
    async fn test_stats_follow_play() {
        let source = Arc::new(ScriptedSource::new().with_cards(&[
            Rank::Ace,
            Rank::Queen,
            Rank::Nine,
            Rank::Eight,
        ]));
        let clock = Arc::new(ManualClock::default());
        let casino = Casino::builder(WagerConfig {
            storage: crate::config::StorageConfig {
                in_memory: true,
                ..Default::default()
            },
            ..Default::default()
        })
        .source(source)
        .clock(clock.clone())
        .build()
        .unwrap();
        casino.ledger().adjust(UserId(1), 100).unwrap();
        casino.ledger().adjust(UserId(2), 100).unwrap();

        let hand = casino.start_game(UserId(1), GameKind::Blackjack, 10).await.unwrap();
        assert!(hand.finished);

        let slots = casino.start_game(UserId(1), GameKind::Slots, 10).await.unwrap();
        casino.apply_action(UserId(1), slots.id, Action::Spin).await.unwrap();

        let event = casino.create_prediction(UserId(1), "stats", 5).await.unwrap();
        casino.vote(UserId(2), event.id, Choice::No, 5).await.unwrap();
        clock.advance_secs(60);
        casino.resolve_prediction(UserId(1), event.id, Choice::No).await.unwrap();

        let stats = casino.stats(UserId(1));
        assert_eq!(stats.blackjack_wins, 1);
        assert_eq!(stats.spins, 1);
        assert_eq!(casino.stats(UserId(2)).prediction_wins, 1);
        assert!(casino.open_predictions().is_empty());
    }

    #[tokio::test]
    async fn test_prediction_is_not_started_as_a_session() {
        let casino = Casino::in_memory(WagerConfig::default()).unwrap();
        let err = casino.start_game(UserId(1), GameKind::Prediction, 10).await.unwrap_err();
        assert!(matches!(err, WagerError::ActionNotAllowed { .. }));
    }

    #[tokio::test]
    async fn test_owed_payouts_count_as_wins_once_paid() {
        let balances: Arc<FailingStore<UserId, u64>> = Arc::new(FailingStore::new());
        let clock = Arc::new(ManualClock::default());
        let casino = Casino::builder(WagerConfig {
            storage: crate::config::StorageConfig {
                in_memory: true,
                ..Default::default()
            },
            ..Default::default()
        })
        .balance_store(balances.clone())
        .clock(clock.clone())
        .build()
        .unwrap();
        casino.ledger().adjust(UserId(2), 50).unwrap();

        let event = casino.create_prediction(UserId(1), "outage", 5).await.unwrap();
        casino.vote(UserId(2), event.id, Choice::Yes, 10).await.unwrap();
        clock.advance_secs(60);

        balances.fail_writes(true);
        let resolution = casino.resolve_prediction(UserId(1), event.id, Choice::Yes).await.unwrap();
        assert_eq!(resolution.total_paid(), 0);
        assert_eq!(casino.stats(UserId(2)).prediction_wins, 0);

        balances.fail_writes(false);
        let paid = casino.settle_owed_payouts();
        assert_eq!(paid.len(), 1);
        assert_eq!(casino.balance(UserId(2)), 60);
        assert_eq!(casino.stats(UserId(2)).prediction_wins, 1);
    }
}
