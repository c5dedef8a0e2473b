//! Shared traits and interfaces
//!
//! The engine never reads the wall clock or the thread RNG directly. Both are
//! injected through these traits so game flows can be replayed exactly in
//! tests.

use crate::games::cards::{Card, Rank, Suit};
use crate::games::slots::{ReelStrip, Symbol};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;

/// Time source for event dwell checks and session idle tracking
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Source of card and reel outcomes
///
/// Implementations must be callable from many sessions at once; the engine
/// does not serialize draws across sessions.
pub trait OutcomeSource: Send + Sync {
    /// One card from an infinite shoe.
    fn draw_card(&self) -> Card;

    /// One reel cell, weighted by the strip.
    fn draw_symbol(&self, strip: &ReelStrip) -> Symbol;
}

/// Thread-local RNG backed outcomes
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSource;

impl OutcomeSource for RandomSource {
    fn draw_card(&self) -> Card {
        let mut rng = rand::thread_rng();
        // Rank and suit are drawn independently, duplicates allowed.
        let rank = *Rank::ALL.choose(&mut rng).unwrap_or(&Rank::Ace);
        let suit = *Suit::ALL.choose(&mut rng).unwrap_or(&Suit::Spades);
        Card { rank, suit }
    }

    fn draw_symbol(&self, strip: &ReelStrip) -> Symbol {
        strip.sample(&mut rand::thread_rng())
    }
}
