//! Error types for the wager engine
//!
//! Every game-rule rejection is recoverable and carries enough context for the
//! presentation layer to render a message. Storage failures are the one class
//! that aborts the in-flight request.

use crate::common::types::{EventId, GameKind, SessionId, UserId};
use thiserror::Error;

/// Root error type for all wager operations
#[derive(Debug, Error)]
pub enum WagerError {
    #[error("insufficient balance: {required} points required, {available} available")]
    InsufficientBalance { required: u64, available: u64 },

    #[error("user {actor} is not allowed to act on {target}")]
    Unauthorized { actor: UserId, target: String },

    #[error("{0} not found")]
    NotFound(Missing),

    #[error("invalid stake {stake}: {reason}")]
    InvalidStake { stake: u64, reason: String },

    #[error("user {voter} has already voted on event {event}")]
    AlreadyVoted { voter: UserId, event: EventId },

    #[error("the host of event {event} cannot vote on it")]
    HostCannotVote { event: EventId },

    #[error("event {event} can be resolved in {remaining_secs}s")]
    TooEarlyToResolve { event: EventId, remaining_secs: i64 },

    #[error("event {event} has already been resolved")]
    AlreadyResolved { event: EventId },

    #[error("user {host} already has {limit} open prediction events")]
    TooManyActiveEvents { host: UserId, limit: usize },

    #[error("{action} is not allowed: {reason}")]
    ActionNotAllowed { action: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

/// What an operation failed to find
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    Session(SessionId),
    Event(EventId),
    GameKind(GameKind),
}

impl std::fmt::Display for Missing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Missing::Session(id) => write!(f, "session {}", id),
            Missing::Event(id) => write!(f, "prediction event {}", id),
            Missing::GameKind(kind) => write!(f, "{} session", kind),
        }
    }
}

/// Storage system errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),
}

/// Configuration and validation errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue { field: String, value: String, reason: String },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

impl WagerError {
    /// Storage failures abort the request; everything else is a rule rejection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WagerError::Storage(_))
    }

    pub fn action_not_allowed(action: impl Into<String>, reason: impl Into<String>) -> Self {
        WagerError::ActionNotAllowed {
            action: action.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_stake(stake: u64, reason: impl Into<String>) -> Self {
        WagerError::InvalidStake {
            stake,
            reason: reason.into(),
        }
    }
}

// External error conversions
impl From<std::io::Error> for WagerError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => WagerError::Storage(StorageError::ReadFailed(e.to_string())),
            _ => WagerError::Storage(StorageError::WriteFailed(e.to_string())),
        }
    }
}

impl From<serde_json::Error> for WagerError {
    fn from(e: serde_json::Error) -> Self {
        WagerError::Storage(StorageError::CorruptedData(e.to_string()))
    }
}

// Convenience type alias for Results
pub type WagerResult<T> = Result<T, WagerError>;
