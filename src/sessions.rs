//! Session registry for interactive games
//!
//! Every live blackjack table and slot machine sits behind its own async
//! mutex, so actions on one session are applied one at a time while
//! different sessions proceed in parallel. A session that is replaced or
//! reaped is marked retired under its lock; an action that was already
//! waiting on that lock then fails with `NotFound`.
//!
//! Lock order is always session, then ledger account, then store.

use crate::common::traits::{Clock, OutcomeSource};
use crate::common::types::{GameKind, SessionId, UserId};
use crate::errors::{Missing, WagerError, WagerResult};
use crate::games::blackjack::{BlackjackTable, Outcome, RoundResult};
use crate::games::cards::Hand;
use crate::games::slots::{BetLadder, ReelStrip, SlotMachine, SpinOutcome};
use crate::ledger::{points, Ledger};
use crate::stats::StatsBook;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Every action a player can send to an interactive session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Hit,
    Stand,
    DoubleDown,
    SpinIncreaseBet,
    SpinDecreaseBet,
    Spin,
}

impl Action {
    /// The game this action belongs to.
    pub fn game_kind(self) -> GameKind {
        match self {
            Action::Hit | Action::Stand | Action::DoubleDown => GameKind::Blackjack,
            Action::SpinIncreaseBet | Action::SpinDecreaseBet | Action::Spin => GameKind::Slots,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Hit => "hit",
            Action::Stand => "stand",
            Action::DoubleDown => "double down",
            Action::SpinIncreaseBet => "increase bet",
            Action::SpinDecreaseBet => "decrease bet",
            Action::Spin => "spin",
        };
        f.write_str(name)
    }
}

enum GameState {
    Blackjack(BlackjackTable),
    Slots(SlotMachine),
}

impl GameState {
    fn kind(&self) -> GameKind {
        match self {
            GameState::Blackjack(_) => GameKind::Blackjack,
            GameState::Slots(_) => GameKind::Slots,
        }
    }

    fn stake(&self) -> u64 {
        match self {
            GameState::Blackjack(table) => table.stake(),
            GameState::Slots(machine) => machine.bet(),
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            GameState::Blackjack(table) => table.is_finished(),
            GameState::Slots(_) => false,
        }
    }

    /// Points held in escrow that must go back if the session is torn down.
    fn escrow(&self) -> u64 {
        match self {
            GameState::Blackjack(table) => table.refund(),
            GameState::Slots(_) => 0,
        }
    }
}

struct Session {
    id: SessionId,
    owner: UserId,
    state: GameState,
    last_action: DateTime<Utc>,
    retired: bool,
}

type SessionSlot = Arc<Mutex<Session>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlackjackView {
    pub hand: Hand,
    pub total: u32,
    pub can_double: bool,
    pub doubled: bool,
    pub result: Option<RoundResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotsView {
    pub bet: u64,
    pub spins: u64,
    pub last_spin: Option<SpinOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "game", rename_all = "snake_case")]
pub enum GameView {
    Blackjack(BlackjackView),
    Slots(SlotsView),
}

/// Render state handed back to presentation after every call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub id: SessionId,
    pub owner: UserId,
    pub kind: GameKind,
    pub stake: u64,
    /// The session is gone from the registry; further actions get `NotFound`.
    pub finished: bool,
    pub balance: u64,
    pub game: GameView,
}

impl SessionView {
    pub fn blackjack(&self) -> Option<&BlackjackView> {
        match &self.game {
            GameView::Blackjack(view) => Some(view),
            GameView::Slots(_) => None,
        }
    }

    pub fn slots(&self) -> Option<&SlotsView> {
        match &self.game {
            GameView::Slots(view) => Some(view),
            GameView::Blackjack(_) => None,
        }
    }
}

/// A session removed for inactivity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReapedSession {
    pub id: SessionId,
    pub owner: UserId,
    pub kind: GameKind,
    pub refunded: u64,
}

/// Fixed game parameters the registry applies to new sessions
#[derive(Debug, Clone)]
pub struct TableRules {
    pub min_stake: u64,
    pub ladder: BetLadder,
    pub strip: ReelStrip,
    pub idle_timeout: chrono::Duration,
}

pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionSlot>,
    owners: DashMap<(UserId, GameKind), SessionId>,
    ledger: Arc<Ledger>,
    stats: Arc<StatsBook>,
    source: Arc<dyn OutcomeSource>,
    clock: Arc<dyn Clock>,
    rules: TableRules,
}

impl SessionRegistry {
    pub fn new(
        ledger: Arc<Ledger>,
        stats: Arc<StatsBook>,
        source: Arc<dyn OutcomeSource>,
        clock: Arc<dyn Clock>,
        rules: TableRules,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            owners: DashMap::new(),
            ledger,
            stats,
            source,
            clock,
            rules,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// The user's live session of `kind`, if any.
    pub fn active_session(&self, user: UserId, kind: GameKind) -> Option<SessionId> {
        self.owners.get(&(user, kind)).map(|id| *id.value())
    }

    fn slot(&self, id: SessionId) -> WagerResult<SessionSlot> {
        self.sessions
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(WagerError::NotFound(Missing::Session(id)))
    }

    /// Open a new session, replacing the user's previous one of the same kind.
    pub async fn start(&self, user: UserId, kind: GameKind, stake: u64) -> WagerResult<SessionView> {
        match kind {
            GameKind::Blackjack => {
                if stake < self.rules.min_stake {
                    return Err(WagerError::invalid_stake(
                        stake,
                        format!("the table minimum is {}", self.rules.min_stake),
                    ));
                }
            }
            GameKind::Slots => {
                self.rules.ladder.position(stake)?;
            }
            GameKind::Prediction => {
                return Err(WagerError::action_not_allowed(
                    "start prediction",
                    "prediction events are opened with create_prediction",
                ));
            }
        }

        // Tear the old session down first so its escrow can fund the new one.
        if let Some(previous) = self.active_session(user, kind) {
            self.retire(previous, "replaced").await?;
        }

        let state = match kind {
            GameKind::Blackjack => GameState::Blackjack(self.open_table(user, stake)?),
            _ => {
                let available = self.ledger.balance(user);
                if available < stake {
                    return Err(WagerError::InsufficientBalance {
                        required: stake,
                        available,
                    });
                }
                GameState::Slots(SlotMachine::new(self.rules.ladder.clone(), stake)?)
            }
        };

        let session = Session {
            id: SessionId::new(),
            owner: user,
            state,
            last_action: self.clock.now(),
            retired: false,
        };
        let id = session.id;

        if session.state.is_finished() {
            self.record_hand(&session);
            info!(user = %user, session = %id, "Natural dealt, hand settled at the deal");
            return Ok(self.view(&session, true));
        }

        let view = self.view(&session, false);
        self.sessions.insert(id, Arc::new(Mutex::new(session)));
        // A concurrent start may have slipped in; whichever loses is retired.
        if let Some(displaced) = self.owners.insert((user, kind), id) {
            if displaced != id {
                self.retire(displaced, "replaced").await?;
            }
        }

        debug!(user = %user, session = %id, kind = %kind, stake, "Session started");
        Ok(view)
    }

    fn open_table(&self, user: UserId, stake: u64) -> WagerResult<BlackjackTable> {
        self.ledger.transact(user, |balance| {
            if balance < stake {
                return Err(WagerError::InsufficientBalance {
                    required: stake,
                    available: balance,
                });
            }
            Ok((-points(stake), ()))
        })?;

        let mut table = BlackjackTable::deal(self.source.as_ref(), stake);
        // The session is never registered, so a failed natural voids the round.
        if let Err(e) = table.settle_natural(user, &self.ledger, self.source.as_ref()) {
            if let Err(refund) = self.ledger.credit(user, stake) {
                error!(user = %user, stake, error = %refund, "Escrow refund failed");
            }
            return Err(e);
        }
        Ok(table)
    }

    /// Apply one action to a live session owned by `user`.
    pub async fn apply(&self, user: UserId, id: SessionId, action: Action) -> WagerResult<SessionView> {
        let slot = self.slot(id)?;
        let mut session = slot.lock().await;

        if session.retired {
            return Err(WagerError::NotFound(Missing::Session(id)));
        }
        if session.owner != user {
            warn!(user = %user, session = %id, owner = %session.owner, "Action on someone else's session");
            return Err(WagerError::Unauthorized {
                actor: user,
                target: format!("session {}", id),
            });
        }

        session.last_action = self.clock.now();
        let source = self.source.as_ref();
        let ledger = self.ledger.as_ref();
        match (&mut session.state, action) {
            (GameState::Blackjack(table), Action::Hit) => table.hit(user, ledger, source)?,
            (GameState::Blackjack(table), Action::Stand) => table.stand(user, ledger, source)?,
            (GameState::Blackjack(table), Action::DoubleDown) => table.double_down(user, ledger, source)?,
            (GameState::Slots(machine), Action::SpinIncreaseBet) => {
                machine.raise_bet();
            }
            (GameState::Slots(machine), Action::SpinDecreaseBet) => {
                machine.lower_bet();
            }
            (GameState::Slots(machine), Action::Spin) => {
                let (_, outcome) = machine.spin(user, ledger, source, &self.rules.strip)?;
                self.stats.record_spin(user, outcome.payout);
            }
            (state, action) => {
                return Err(WagerError::action_not_allowed(
                    action.to_string(),
                    format!("it is a {} action and this is a {} session", action.game_kind(), state.kind()),
                ));
            }
        }

        let finished = session.state.is_finished();
        if finished {
            session.retired = true;
            self.sessions.remove(&id);
            self.owners.remove_if(&(user, session.state.kind()), |_, current| *current == id);
            self.record_hand(&session);
            debug!(user = %user, session = %id, "Session finished");
        }
        Ok(self.view(&session, finished))
    }

    /// Tear a session down, refunding any escrow. Unknown ids are a no-op.
    async fn retire(&self, id: SessionId, reason: &str) -> WagerResult<u64> {
        let Some((_, slot)) = self.sessions.remove(&id) else {
            return Ok(0);
        };
        let mut session = slot.lock().await;
        self.teardown(&mut session, &slot, reason)
    }

    fn teardown(&self, session: &mut Session, slot: &SessionSlot, reason: &str) -> WagerResult<u64> {
        if session.retired {
            return Ok(0);
        }
        let refund = session.state.escrow();
        if refund > 0 {
            if let Err(e) = self.ledger.credit(session.owner, refund) {
                // Keep the session so a later reap can return the escrow.
                error!(session = %session.id, user = %session.owner, refund, error = %e, "Escrow refund failed");
                self.sessions.insert(session.id, Arc::clone(slot));
                return Err(e);
            }
        }
        session.retired = true;
        self.sessions.remove(&session.id);
        let kind = session.state.kind();
        self.owners.remove_if(&(session.owner, kind), |_, current| *current == session.id);
        warn!(
            session = %session.id,
            user = %session.owner,
            kind = %kind,
            refund,
            reason,
            "Session retired"
        );
        Ok(refund)
    }

    /// Retire every session idle for longer than the configured window.
    ///
    /// Sessions busy with an action are skipped; the action refreshes them.
    pub async fn reap_idle(&self) -> Vec<ReapedSession> {
        let now = self.clock.now();
        let slots: Vec<SessionSlot> = self.sessions.iter().map(|s| Arc::clone(s.value())).collect();

        let mut reaped = Vec::new();
        for slot in slots {
            let Ok(mut session) = slot.try_lock() else {
                continue;
            };
            if session.retired || now - session.last_action < self.rules.idle_timeout {
                continue;
            }
            match self.teardown(&mut session, &slot, "idle") {
                Ok(refunded) => reaped.push(ReapedSession {
                    id: session.id,
                    owner: session.owner,
                    kind: session.state.kind(),
                    refunded,
                }),
                Err(e) => error!(session = %session.id, error = %e, "Failed to reap session"),
            }
        }
        reaped
    }

    /// Retire every live session and return its escrow. Used at shutdown,
    /// since sessions do not outlive the process.
    pub async fn retire_all(&self) -> Vec<ReapedSession> {
        let slots: Vec<SessionSlot> = self.sessions.iter().map(|s| Arc::clone(s.value())).collect();

        let mut retired = Vec::new();
        for slot in slots {
            let mut session = slot.lock().await;
            if session.retired {
                continue;
            }
            match self.teardown(&mut session, &slot, "shutdown") {
                Ok(refunded) => retired.push(ReapedSession {
                    id: session.id,
                    owner: session.owner,
                    kind: session.state.kind(),
                    refunded,
                }),
                Err(e) => error!(session = %session.id, error = %e, "Failed to retire session"),
            }
        }
        retired
    }

    /// Reap idle sessions every `interval` until the task is aborted.
    pub fn spawn_reaper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let reaped = self.reap_idle().await;
                if !reaped.is_empty() {
                    info!(count = reaped.len(), "Reaped idle sessions");
                }
            }
        })
    }

    fn record_hand(&self, session: &Session) {
        if let GameState::Blackjack(table) = &session.state {
            if let Some(result) = table.result() {
                let won = matches!(result.outcome, Outcome::Natural | Outcome::Win);
                self.stats.record_hand(session.owner, won);
            }
        }
    }

    fn view(&self, session: &Session, finished: bool) -> SessionView {
        let game = match &session.state {
            GameState::Blackjack(table) => GameView::Blackjack(BlackjackView {
                hand: table.hand().clone(),
                total: table.hand().total(),
                can_double: table.can_double(),
                doubled: table.doubled(),
                result: table.result().cloned(),
            }),
            GameState::Slots(machine) => GameView::Slots(SlotsView {
                bet: machine.bet(),
                spins: machine.spins(),
                last_spin: machine.last_spin().cloned(),
            }),
        };
        SessionView {
            id: session.id,
            owner: session.owner,
            kind: session.state.kind(),
            stake: session.state.stake(),
            finished,
            balance: self.ledger.balance(session.owner),
            game,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::cards::Rank;
    use crate::games::slots::Symbol::*;
    use crate::games::test_framework::{FailingStore, ManualClock, ScriptedSource};

    struct Fixture {
        registry: Arc<SessionRegistry>,
        ledger: Arc<Ledger>,
        source: Arc<ScriptedSource>,
        clock: Arc<ManualClock>,
    }

    fn fixture(source: ScriptedSource) -> Fixture {
        fixture_with_ledger(source, Ledger::in_memory())
    }

    fn fixture_with_ledger(source: ScriptedSource, ledger: Ledger) -> Fixture {
        let ledger = Arc::new(ledger);
        let source = Arc::new(source);
        let clock = Arc::new(ManualClock::default());
        let rules = TableRules {
            min_stake: 10,
            ladder: BetLadder::default(),
            strip: ReelStrip::standard().unwrap(),
            idle_timeout: chrono::Duration::seconds(180),
        };
        let registry = Arc::new(SessionRegistry::new(
            ledger.clone(),
            Arc::new(StatsBook::in_memory()),
            source.clone(),
            clock.clone(),
            rules,
        ));
        Fixture {
            registry,
            ledger,
            source,
            clock,
        }
    }

    #[tokio::test]
    async fn test_start_escrows_blackjack_stake() {
        let f = fixture(ScriptedSource::new().with_cards(&[Rank::Five, Rank::Six]));
        f.ledger.adjust(UserId(1), 100).unwrap();

        let view = f.registry.start(UserId(1), GameKind::Blackjack, 20).await.unwrap();
        assert!(!view.finished);
        assert_eq!(view.balance, 80);
        assert_eq!(view.blackjack().unwrap().total, 11);
        assert_eq!(f.registry.active_session(UserId(1), GameKind::Blackjack), Some(view.id));
    }

    #[tokio::test]
    async fn test_start_rejections() {
        let f = fixture(ScriptedSource::new());
        f.ledger.adjust(UserId(1), 5).unwrap();

        let err = f.registry.start(UserId(1), GameKind::Blackjack, 5).await.unwrap_err();
        assert!(matches!(err, WagerError::InvalidStake { stake: 5, .. }));
        let err = f.registry.start(UserId(1), GameKind::Blackjack, 10).await.unwrap_err();
        assert!(matches!(err, WagerError::InsufficientBalance { required: 10, available: 5 }));
        let err = f.registry.start(UserId(1), GameKind::Slots, 30).await.unwrap_err();
        assert!(matches!(err, WagerError::InvalidStake { stake: 30, .. }));
        let err = f.registry.start(UserId(1), GameKind::Slots, 10).await.unwrap_err();
        assert!(matches!(err, WagerError::InsufficientBalance { .. }));
        let err = f.registry.start(UserId(1), GameKind::Prediction, 10).await.unwrap_err();
        assert!(matches!(err, WagerError::ActionNotAllowed { .. }));
        assert!(f.registry.is_empty());
        assert_eq!(f.ledger.balance(UserId(1)), 5);
    }

    #[tokio::test]
    async fn test_replacement_refunds_escrow_once() {
        let f = fixture(ScriptedSource::new().with_cards(&[Rank::Five, Rank::Six, Rank::Four, Rank::Six]));
        f.ledger.adjust(UserId(1), 10).unwrap();

        let first = f.registry.start(UserId(1), GameKind::Blackjack, 10).await.unwrap();
        assert_eq!(f.ledger.balance(UserId(1)), 0);
        // The old escrow funds the new hand.
        let second = f.registry.start(UserId(1), GameKind::Blackjack, 10).await.unwrap();
        assert_eq!(f.ledger.balance(UserId(1)), 0);
        assert_eq!(f.registry.len(), 1);

        let err = f.registry.apply(UserId(1), first.id, Action::Hit).await.unwrap_err();
        assert!(matches!(err, WagerError::NotFound(Missing::Session(_))));
        assert_eq!(f.registry.active_session(UserId(1), GameKind::Blackjack), Some(second.id));
    }

    #[tokio::test]
    async fn test_wrong_owner_and_wrong_game() {
        let f = fixture(ScriptedSource::new().with_cards(&[Rank::Five, Rank::Six]));
        f.ledger.adjust(UserId(1), 100).unwrap();
        let view = f.registry.start(UserId(1), GameKind::Blackjack, 10).await.unwrap();

        let err = f.registry.apply(UserId(2), view.id, Action::Hit).await.unwrap_err();
        assert!(matches!(err, WagerError::Unauthorized { .. }));
        let err = f.registry.apply(UserId(1), view.id, Action::Spin).await.unwrap_err();
        assert!(matches!(err, WagerError::ActionNotAllowed { .. }));
        assert_eq!(f.ledger.balance(UserId(1)), 90);
    }

    #[tokio::test]
    async fn test_stand_finishes_and_removes_session() {
        // Player 10+9, dealer 10+7.
        let f = fixture(ScriptedSource::new().with_cards(&[Rank::Ten, Rank::Nine, Rank::Ten, Rank::Seven]));
        f.ledger.adjust(UserId(1), 100).unwrap();
        let view = f.registry.start(UserId(1), GameKind::Blackjack, 10).await.unwrap();

        let done = f.registry.apply(UserId(1), view.id, Action::Stand).await.unwrap();
        assert!(done.finished);
        assert_eq!(done.blackjack().unwrap().result.as_ref().unwrap().outcome, Outcome::Win);
        assert_eq!(done.balance, 105);
        assert!(f.registry.is_empty());
        assert_eq!(f.registry.active_session(UserId(1), GameKind::Blackjack), None);

        let err = f.registry.apply(UserId(1), view.id, Action::Stand).await.unwrap_err();
        assert!(matches!(err, WagerError::NotFound(_)));
        assert_eq!(f.ledger.balance(UserId(1)), 105);
    }

    #[tokio::test]
    async fn test_failed_settlement_is_retried_by_stand() {
        let store: Arc<FailingStore<UserId, u64>> = Arc::new(FailingStore::new());
        let f = fixture_with_ledger(
            ScriptedSource::new().with_cards(&[
                Rank::Two,
                Rank::Three,
                Rank::Two,
                Rank::Ten,
                Rank::Ten,
                Rank::Six,
                Rank::Ten,
            ]),
            Ledger::open(store.clone()).unwrap(),
        );
        f.ledger.adjust(UserId(1), 100).unwrap();
        let id = f.registry.start(UserId(1), GameKind::Blackjack, 10).await.unwrap().id;
        f.registry.apply(UserId(1), id, Action::Hit).await.unwrap();

        store.fail_after(1);
        assert!(f.registry.apply(UserId(1), id, Action::DoubleDown).await.is_err());
        assert_eq!(f.registry.len(), 1);
        let err = f.registry.apply(UserId(1), id, Action::DoubleDown).await.unwrap_err();
        assert!(matches!(err, WagerError::ActionNotAllowed { .. }));
        assert_eq!(f.ledger.balance(UserId(1)), 80);

        store.fail_writes(false);
        let done = f.registry.apply(UserId(1), id, Action::Stand).await.unwrap();
        assert!(done.finished);
        assert_eq!(done.stake, 20);
        assert_eq!(done.blackjack().unwrap().hand.len(), 4);
        assert_eq!(done.balance, 110);
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_slots_session_survives_spins() {
        let f = fixture(ScriptedSource::new());
        f.ledger.adjust(UserId(1), 100).unwrap();
        let view = f.registry.start(UserId(1), GameKind::Slots, 10).await.unwrap();
        assert_eq!(view.balance, 100);

        let up = f.registry.apply(UserId(1), view.id, Action::SpinIncreaseBet).await.unwrap();
        assert_eq!(up.slots().unwrap().bet, 25);
        let down = f.registry.apply(UserId(1), view.id, Action::SpinDecreaseBet).await.unwrap();
        let down = f.registry.apply(UserId(1), down.id, Action::SpinDecreaseBet).await.unwrap();
        assert_eq!(down.slots().unwrap().bet, 10);

        f.source.push_grid([
            [MoneyBag, MoneyBag, MoneyBag],
            [Cherry, Lemon, Orange],
            [Watermelon, Bell, Cherry],
        ]);
        let spun = f.registry.apply(UserId(1), view.id, Action::Spin).await.unwrap();
        assert!(!spun.finished);
        assert_eq!(spun.slots().unwrap().last_spin.as_ref().unwrap().payout, 500);
        assert_eq!(spun.balance, 590);

        let lost = f.registry.apply(UserId(1), view.id, Action::Spin).await.unwrap();
        assert_eq!(lost.balance, 580);
        assert_eq!(lost.slots().unwrap().spins, 2);
    }

    #[tokio::test]
    async fn test_idle_sessions_are_reaped_with_refund() {
        let f = fixture(ScriptedSource::new().with_cards(&[Rank::Five, Rank::Six]));
        f.ledger.adjust(UserId(1), 100).unwrap();
        f.ledger.adjust(UserId(2), 100).unwrap();
        let table = f.registry.start(UserId(1), GameKind::Blackjack, 40).await.unwrap();
        f.registry.start(UserId(2), GameKind::Slots, 10).await.unwrap();

        f.clock.advance_secs(179);
        assert!(f.registry.reap_idle().await.is_empty());

        f.clock.advance_secs(1);
        let mut reaped = f.registry.reap_idle().await;
        reaped.sort_by_key(|r| r.owner);
        assert_eq!(reaped.len(), 2);
        assert_eq!(reaped[0].refunded, 40);
        assert_eq!(reaped[1].refunded, 0);
        assert_eq!(f.ledger.balance(UserId(1)), 100);
        assert_eq!(f.ledger.balance(UserId(2)), 100);
        assert!(f.registry.is_empty());

        // Reaping again moves nothing.
        assert!(f.registry.reap_idle().await.is_empty());
        let err = f.registry.apply(UserId(1), table.id, Action::Stand).await.unwrap_err();
        assert!(matches!(err, WagerError::NotFound(_)));
        assert_eq!(f.ledger.balance(UserId(1)), 100);
    }

    #[tokio::test]
    async fn test_reaper_task_retires_idle_sessions() {
        let f = fixture(ScriptedSource::new().with_cards(&[Rank::Five, Rank::Six]));
        f.ledger.adjust(UserId(1), 100).unwrap();
        f.registry.start(UserId(1), GameKind::Blackjack, 30).await.unwrap();
        f.clock.advance_secs(180);

        let reaper = Arc::clone(&f.registry).spawn_reaper(Duration::from_millis(10));
        for _ in 0..100 {
            if f.registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        reaper.abort();
        assert!(f.registry.is_empty());
        assert_eq!(f.ledger.balance(UserId(1)), 100);
    }

    #[tokio::test]
    async fn test_retire_all_returns_every_escrow() {
        let f = fixture(ScriptedSource::new().with_cards(&[Rank::Five, Rank::Six, Rank::Two, Rank::Three]));
        f.ledger.adjust(UserId(1), 50).unwrap();
        f.ledger.adjust(UserId(2), 50).unwrap();
        f.registry.start(UserId(1), GameKind::Blackjack, 25).await.unwrap();
        f.registry.start(UserId(2), GameKind::Blackjack, 10).await.unwrap();

        let retired = f.registry.retire_all().await;
        assert_eq!(retired.len(), 2);
        assert_eq!(f.ledger.balance(UserId(1)), 50);
        assert_eq!(f.ledger.balance(UserId(2)), 50);
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_stands_settle_once() {
        let f = fixture(ScriptedSource::new().with_cards(&[
            Rank::Ten,
            Rank::Nine,
            Rank::Ten,
            Rank::Seven,
        ]));
        f.ledger.adjust(UserId(1), 100).unwrap();
        let id = f.registry.start(UserId(1), GameKind::Blackjack, 10).await.unwrap().id;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&f.registry);
                tokio::spawn(async move { registry.apply(UserId(1), id, Action::Stand).await })
            })
            .collect();
        let mut settled = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                settled += 1;
            }
        }
        assert_eq!(settled, 1);
        assert_eq!(f.ledger.balance(UserId(1)), 105);
    }
}
