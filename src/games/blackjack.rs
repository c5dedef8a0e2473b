//! Blackjack session: deal, hit, stand, double down, settle
//!
//! The stake is escrowed by the caller when the table is opened. Settling
//! credits `stake + net` back, so a loss simply credits nothing.

use crate::common::traits::OutcomeSource;
use crate::common::types::UserId;
use crate::errors::{WagerError, WagerResult};
use crate::games::cards::{dealer_play, draw, Hand, BLACKJACK};
use crate::ledger::{points, Ledger};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Two-card 21 against a dealer without one.
    Natural,
    Win,
    Push,
    Loss,
}

impl Outcome {
    /// Winnings above the stake: natural 3:2, win 1:2, push even.
    fn winnings(self, stake: u64) -> u64 {
        match self {
            Outcome::Natural => u64::try_from(u128::from(stake) * 3 / 2).unwrap_or(u64::MAX),
            Outcome::Win => stake / 2,
            Outcome::Push | Outcome::Loss => 0,
        }
    }

    /// Net change relative to the stake.
    pub fn net(self, stake: u64) -> i64 {
        match self {
            Outcome::Loss => -points(stake),
            _ => points(self.winnings(stake)),
        }
    }

    /// Amount returned against an escrowed stake.
    pub fn credit(self, stake: u64) -> u64 {
        match self {
            Outcome::Loss => 0,
            _ => stake.saturating_add(self.winnings(stake)),
        }
    }
}

/// Compare a finished player hand with the dealer's.
pub fn judge(player: &Hand, dealer: Option<&Hand>) -> Outcome {
    if player.is_bust() {
        return Outcome::Loss;
    }
    let Some(dealer) = dealer else {
        return Outcome::Loss;
    };
    if player.is_natural() {
        return if dealer.is_natural() { Outcome::Push } else { Outcome::Natural };
    }
    let (ours, theirs) = (player.total(), dealer.total());
    if theirs > BLACKJACK || ours > theirs {
        Outcome::Win
    } else if ours == theirs {
        Outcome::Push
    } else {
        Outcome::Loss
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResult {
    pub outcome: Outcome,
    pub player_total: u32,
    pub dealer_hand: Option<Hand>,
    pub dealer_total: Option<u32>,
    pub stake: u64,
    pub net: i64,
    pub balance: u64,
}

/// One player's hand against the house
///
/// Once the player's card draws are over the round is decided: the dealer
/// hand (if any) is fixed and only the settlement credit remains. A decided
/// table accepts no more cards; standing retries the credit.
#[derive(Debug, Clone)]
pub struct BlackjackTable {
    stake: u64,
    hand: Hand,
    doubled: bool,
    decided: Option<Decided>,
    result: Option<RoundResult>,
}

#[derive(Debug, Clone)]
struct Decided {
    /// `None` when the player bust and the dealer never drew.
    dealer: Option<Hand>,
}

impl BlackjackTable {
    /// Deal two cards against an already escrowed stake.
    pub fn deal<S: OutcomeSource + ?Sized>(source: &S, stake: u64) -> Self {
        Self {
            stake,
            hand: draw(source, 2),
            doubled: false,
            decided: None,
            result: None,
        }
    }

    pub fn stake(&self) -> u64 {
        self.stake
    }

    pub fn hand(&self) -> &Hand {
        &self.hand
    }

    pub fn result(&self) -> Option<&RoundResult> {
        self.result.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.result.is_some()
    }

    /// The round is decided but its credit has not committed yet.
    pub fn is_awaiting_settlement(&self) -> bool {
        self.decided.is_some() && self.result.is_none()
    }

    pub fn doubled(&self) -> bool {
        self.doubled
    }

    /// Double down opens after the first hit.
    pub fn can_double(&self) -> bool {
        self.result.is_none() && self.decided.is_none() && self.hand.len() > 2
    }

    /// Points to hand back if the table is torn down unfinished: the stake
    /// while the hand is in play, the decided credit once it is not.
    pub fn refund(&self) -> u64 {
        match (&self.result, &self.decided) {
            (Some(_), _) => 0,
            (None, Some(decided)) => judge(&self.hand, decided.dealer.as_ref()).credit(self.stake),
            (None, None) => self.stake,
        }
    }

    fn ensure_open(&self, action: &str) -> WagerResult<()> {
        if self.is_finished() {
            return Err(WagerError::action_not_allowed(action, "the hand is already settled"));
        }
        Ok(())
    }

    fn ensure_in_play(&self, action: &str) -> WagerResult<()> {
        self.ensure_open(action)?;
        if self.decided.is_some() {
            return Err(WagerError::action_not_allowed(
                action,
                "the hand is decided, stand to collect the settlement",
            ));
        }
        Ok(())
    }

    /// Settle straight away when the deal is a natural.
    pub fn settle_natural<S: OutcomeSource + ?Sized>(
        &mut self,
        user: UserId,
        ledger: &Ledger,
        source: &S,
    ) -> WagerResult<bool> {
        if !self.hand.is_natural() {
            return Ok(false);
        }
        self.decide(Some(dealer_hand(source)));
        self.settle(user, ledger)?;
        Ok(true)
    }

    pub fn hit<S: OutcomeSource + ?Sized>(
        &mut self,
        user: UserId,
        ledger: &Ledger,
        source: &S,
    ) -> WagerResult<()> {
        self.ensure_in_play("hit")?;
        self.hand.push(source.draw_card());
        let total = self.hand.total();
        if total > BLACKJACK {
            self.decide(None);
        } else if total == BLACKJACK {
            self.decide(Some(dealer_hand(source)));
        } else {
            return Ok(());
        }
        self.settle(user, ledger)
    }

    /// Finish the hand, or retry the credit of a hand already decided.
    pub fn stand<S: OutcomeSource + ?Sized>(
        &mut self,
        user: UserId,
        ledger: &Ledger,
        source: &S,
    ) -> WagerResult<()> {
        self.ensure_open("stand")?;
        if self.decided.is_none() {
            self.decide(Some(dealer_hand(source)));
        }
        self.settle(user, ledger)
    }

    /// Escrow a second stake, take exactly one card, and settle.
    pub fn double_down<S: OutcomeSource + ?Sized>(
        &mut self,
        user: UserId,
        ledger: &Ledger,
        source: &S,
    ) -> WagerResult<()> {
        self.ensure_in_play("double down")?;
        if !self.can_double() {
            return Err(WagerError::action_not_allowed(
                "double down",
                "only allowed after your first hit",
            ));
        }

        let extra = self.stake;
        ledger.transact(user, |balance| {
            if balance < extra {
                return Err(WagerError::InsufficientBalance {
                    required: extra,
                    available: balance,
                });
            }
            Ok((-points(extra), ()))
        })?;
        self.stake = self.stake.saturating_add(extra);
        self.doubled = true;

        self.hand.push(source.draw_card());
        if self.hand.is_bust() {
            self.decide(None);
        } else {
            self.decide(Some(dealer_hand(source)));
        }
        self.settle(user, ledger)
    }

    fn decide(&mut self, dealer: Option<Hand>) {
        self.decided = Some(Decided { dealer });
    }

    fn settle(&mut self, user: UserId, ledger: &Ledger) -> WagerResult<()> {
        let dealer = self.decided.as_ref().and_then(|d| d.dealer.clone());
        let outcome = judge(&self.hand, dealer.as_ref());
        let receipt = ledger.credit(user, outcome.credit(self.stake)).map_err(|e| {
            warn!(user = %user, stake = self.stake, error = %e, "Blackjack settlement failed, hand stays decided");
            e
        })?;

        info!(
            user = %user,
            stake = self.stake,
            outcome = ?outcome,
            balance = receipt.balance,
            "Blackjack hand settled"
        );
        self.result = Some(RoundResult {
            outcome,
            player_total: self.hand.total(),
            dealer_total: dealer.as_ref().map(Hand::total),
            dealer_hand: dealer,
            stake: self.stake,
            net: outcome.net(self.stake),
            balance: receipt.balance,
        });
        Ok(())
    }
}

/// Two fresh cards, then the house policy.
fn dealer_hand<S: OutcomeSource + ?Sized>(source: &S) -> Hand {
    let (dealer, _) = dealer_play(source, draw(source, 2));
    dealer
}
