pub mod blackjack;
pub mod cards;
pub mod slots;
pub mod test_framework;

pub use blackjack::{BlackjackTable, Outcome, RoundResult};
pub use cards::{Card, Hand, Rank, Suit};
pub use slots::{BetLadder, Grid, ReelStrip, SlotMachine, SpinOutcome, Symbol, WinTier};
