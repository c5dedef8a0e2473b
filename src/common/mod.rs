//! Common utilities and shared functionality
//!
//! Identifiers, game kinds and the seams (clock, randomness) shared by every
//! component of the engine.

pub mod types;
pub mod traits;
