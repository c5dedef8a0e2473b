//! Wager - concurrent game sessions over a shared point ledger
//!
//! Runs blackjack tables, slot machines and pooled prediction events for
//! many chat users at once. The ledger is the single source of truth for
//! balances; every game reads and writes it through per-user critical
//! sections, and each live session is advanced by one action at a time.

pub mod casino;
pub mod common;
pub mod config;
pub mod errors;
pub mod games;
pub mod ledger;
pub mod prediction;
pub mod sessions;
pub mod stats;
pub mod storage;

pub use casino::{Casino, CasinoBuilder};
pub use common::traits::{Clock, OutcomeSource, RandomSource, SystemClock};
pub use common::types::{Choice, EventId, GameKind, SessionId, UserId};
pub use config::{ConfigLoader, WagerConfig};
pub use errors::{WagerError, WagerResult};
pub use ledger::{Ledger, Receipt};
pub use prediction::{Ack, EventView, Payout, ResolutionView};
pub use stats::PlayerStats;
pub use sessions::{Action, SessionView};
