//! Card engine: infinite-shoe draws, hand totals and the dealer policy.

use crate::common::traits::OutcomeSource;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Best total a hand may reach without busting.
pub const BLACKJACK: u32 = 21;

/// Dealer draws below this total and stands at or above it, soft or hard.
pub const DEALER_STANDS_AT: u32 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rank {
    Ace,
    Two,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
    Nine,
    Ten,
    Jack,
    Queen,
    King,
}

impl Rank {
    pub const ALL: [Rank; 13] = [
        Rank::Ace,
        Rank::Two,
        Rank::Three,
        Rank::Four,
        Rank::Five,
        Rank::Six,
        Rank::Seven,
        Rank::Eight,
        Rank::Nine,
        Rank::Ten,
        Rank::Jack,
        Rank::Queen,
        Rank::King,
    ];

    /// Face value with the Ace counted high.
    pub fn value(self) -> u32 {
        match self {
            Rank::Ace => 11,
            Rank::Two => 2,
            Rank::Three => 3,
            Rank::Four => 4,
            Rank::Five => 5,
            Rank::Six => 6,
            Rank::Seven => 7,
            Rank::Eight => 8,
            Rank::Nine => 9,
            Rank::Ten | Rank::Jack | Rank::Queen | Rank::King => 10,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Rank::Ace => "Ace",
            Rank::Two => "2",
            Rank::Three => "3",
            Rank::Four => "4",
            Rank::Five => "5",
            Rank::Six => "6",
            Rank::Seven => "7",
            Rank::Eight => "8",
            Rank::Nine => "9",
            Rank::Ten => "10",
            Rank::Jack => "Jack",
            Rank::Queen => "Queen",
            Rank::King => "King",
        }
    }
}

/// Cosmetic only; never affects a total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Suit {
    Hearts,
    Spades,
    Clubs,
    Diamonds,
}

impl Suit {
    pub const ALL: [Suit; 4] = [Suit::Hearts, Suit::Spades, Suit::Clubs, Suit::Diamonds];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Card {
    pub rank: Rank,
    pub suit: Suit,
}

impl Card {
    pub fn new(rank: Rank, suit: Suit) -> Self {
        Self { rank, suit }
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {:?}", self.rank.label(), self.suit)
    }
}

/// Ordered cards held by the player or the dealer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hand {
    cards: Vec<Card>,
}

impl Hand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cards(cards: Vec<Card>) -> Self {
        Self { cards }
    }

    pub fn push(&mut self, card: Card) {
        self.cards.push(card);
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Sum with every Ace high, then demote Aces one at a time while busting.
    ///
    /// The result is the smallest total not above 21 reachable by demoting
    /// Aces, or the all-Aces-low total when even that busts.
    pub fn total(&self) -> u32 {
        let mut total: u32 = self.cards.iter().map(|c| c.rank.value()).sum();
        let mut high_aces = self.cards.iter().filter(|c| c.rank == Rank::Ace).count();
        while total > BLACKJACK && high_aces > 0 {
            total -= 10;
            high_aces -= 1;
        }
        total
    }

    /// True while at least one Ace still counts as 11.
    pub fn is_soft(&self) -> bool {
        let hard: u32 = self
            .cards
            .iter()
            .map(|c| if c.rank == Rank::Ace { 1 } else { c.rank.value() })
            .sum();
        self.cards.iter().any(|c| c.rank == Rank::Ace) && hard + 10 == self.total()
    }

    pub fn is_natural(&self) -> bool {
        self.cards.len() == 2 && self.total() == BLACKJACK
    }

    pub fn is_bust(&self) -> bool {
        self.total() > BLACKJACK
    }
}

impl fmt::Display for Hand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cards: Vec<String> = self.cards.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", cards.join(", "))
    }
}

/// Draw `n` independent cards.
pub fn draw<S: OutcomeSource + ?Sized>(source: &S, n: usize) -> Hand {
    Hand::from_cards((0..n).map(|_| source.draw_card()).collect())
}

/// Play out the dealer's hand: hit while below 17, stand on any 17.
pub fn dealer_play<S: OutcomeSource + ?Sized>(source: &S, mut hand: Hand) -> (Hand, u32) {
    let mut total = hand.total();
    while total < DEALER_STANDS_AT {
        hand.push(source.draw_card());
        total = hand.total();
    }
    (hand, total)
}
