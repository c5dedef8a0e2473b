//! Shared type definitions
//!
//! Canonical identifiers used by the ledger, the session registry and the
//! prediction market. Transport hands these to the engine already
//! authenticated.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable chat-platform user identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        UserId(id)
    }
}

/// Identifier of one live interactive game session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SessionId(Uuid::parse_str(s)?))
    }
}

/// Identifier of one prediction event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        EventId(Uuid::new_v4())
    }

    /// Last four hex digits, the short handle shown in event listings
    pub fn short(&self) -> String {
        let s = self.0.simple().to_string();
        s[s.len() - 4..].to_string()
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(EventId(Uuid::parse_str(s)?))
    }
}

/// Supported game types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GameKind {
    Blackjack,
    Slots,
    Prediction,
}

impl fmt::Display for GameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameKind::Blackjack => write!(f, "blackjack"),
            GameKind::Slots => write!(f, "slots"),
            GameKind::Prediction => write!(f, "prediction"),
        }
    }
}

/// Side taken on a prediction event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Choice {
    Yes,
    No,
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Choice::Yes => write!(f, "YES"),
            Choice::No => write!(f, "NO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choice_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Choice::Yes).unwrap(), "\"YES\"");
        assert_eq!(serde_json::from_str::<Choice>("\"NO\"").unwrap(), Choice::No);
    }

    #[test]
    fn test_ids_round_trip_through_strings() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);

        let event = EventId::new();
        assert_eq!(event.short().len(), 4);
        assert!(event.to_string().replace('-', "").ends_with(&event.short()));
    }

    #[test]
    fn test_user_id_is_a_json_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(UserId(42), 7u64);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, "{\"42\":7}");
        let back: std::collections::BTreeMap<UserId, u64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(&UserId(42)), Some(&7));
    }
}
