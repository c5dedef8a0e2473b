//! Deterministic doubles for game tests
//!
//! `ScriptedSource` replays queued cards and reel cells, `ManualClock` only
//! moves when told to, and `FailingStore` can be switched to reject writes.

use crate::common::traits::{Clock, OutcomeSource};
use crate::errors::{StorageError, WagerResult};
use crate::games::cards::{Card, Rank, Suit};
use crate::games::slots::{Grid, ReelStrip, Symbol};
use crate::storage::{lock, MemoryStore, RecordStore};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Cells used once the symbol script runs dry. No line of the resulting
/// grid matches, so unscripted spins always lose.
const LOSING_CELLS: [Symbol; 9] = [
    Symbol::Cherry,
    Symbol::Lemon,
    Symbol::Orange,
    Symbol::Watermelon,
    Symbol::Bell,
    Symbol::Cherry,
    Symbol::Lemon,
    Symbol::Orange,
    Symbol::Watermelon,
];

/// Outcome source that replays a fixed script
///
/// Cards come out in the order queued; an exhausted card script deals
/// Two of Spades.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    cards: Mutex<VecDeque<Card>>,
    symbols: Mutex<VecDeque<Symbol>>,
    fallback_cell: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue cards by rank; suits cycle so hands read naturally.
    pub fn with_cards(self, ranks: &[Rank]) -> Self {
        {
            let mut cards = lock(&self.cards);
            for (i, rank) in ranks.iter().enumerate() {
                cards.push_back(Card::new(*rank, Suit::ALL[i % Suit::ALL.len()]));
            }
        }
        self
    }

    pub fn with_symbols(self, symbols: &[Symbol]) -> Self {
        lock(&self.symbols).extend(symbols.iter().copied());
        self
    }

    /// Queue a whole grid, row by row.
    pub fn with_grid(self, grid: Grid) -> Self {
        let cells: Vec<Symbol> = grid.iter().flatten().copied().collect();
        self.with_symbols(&cells)
    }

    /// Queue more cards on a source already shared with the engine.
    pub fn push_cards(&self, ranks: &[Rank]) {
        let mut cards = lock(&self.cards);
        cards.extend(ranks.iter().map(|r| Card::new(*r, Suit::Clubs)));
    }

    pub fn push_grid(&self, grid: Grid) {
        lock(&self.symbols).extend(grid.iter().flatten().copied());
    }
}

impl OutcomeSource for ScriptedSource {
    fn draw_card(&self) -> Card {
        lock(&self.cards)
            .pop_front()
            .unwrap_or(Card::new(Rank::Two, Suit::Spades))
    }

    fn draw_symbol(&self, _strip: &ReelStrip) -> Symbol {
        lock(&self.symbols).pop_front().unwrap_or_else(|| {
            let i = self.fallback_cell.fetch_add(1, Ordering::Relaxed);
            LOSING_CELLS[i % LOSING_CELLS.len()]
        })
    }
}

/// Clock that stands still until advanced
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self::new(start)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

const UNLIMITED: usize = usize::MAX;

/// In-memory store whose writes can be made to fail
pub struct FailingStore<K, V> {
    inner: MemoryStore<K, V>,
    failing: AtomicBool,
    budget: AtomicUsize,
}

impl<K, V> FailingStore<K, V> {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            failing: AtomicBool::new(false),
            budget: AtomicUsize::new(UNLIMITED),
        }
    }

    /// Fail every write, or with `false` go back to accepting all of them.
    pub fn fail_writes(&self, failing: bool) {
        self.budget.store(UNLIMITED, Ordering::SeqCst);
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Accept the next `writes` saves, then fail every one after.
    pub fn fail_after(&self, writes: usize) {
        self.failing.store(false, Ordering::SeqCst);
        self.budget.store(writes, Ordering::SeqCst);
    }

    fn take_write(&self) -> bool {
        self.budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                UNLIMITED => Some(UNLIMITED),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok()
    }
}

impl<K, V> Default for FailingStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> RecordStore<K, V> for FailingStore<K, V>
where
    K: Clone + Ord + Send,
    V: Clone + Send,
{
    fn load(&self) -> WagerResult<BTreeMap<K, V>> {
        self.inner.load()
    }

    fn save(&self, records: &BTreeMap<K, V>) -> WagerResult<()> {
        if self.failing.load(Ordering::SeqCst) || !self.take_write() {
            return Err(StorageError::WriteFailed("injected write failure".to_string()).into());
        }
        self.inner.save(records)
    }
}
