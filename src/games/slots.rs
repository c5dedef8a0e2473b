//! Reel engine and the slot machine session
//!
//! A spin fills a 3x3 grid from a weighted symbol strip. Every row, column
//! and main diagonal whose three cells match pays `stake x multiplier`, and
//! simultaneous matches add up.

use crate::common::traits::OutcomeSource;
use crate::common::types::UserId;
use crate::errors::{ConfigurationError, WagerError, WagerResult};
use crate::ledger::{points, Ledger, Receipt};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const GRID_SIZE: usize = 3;

pub type Grid = [[Symbol; GRID_SIZE]; GRID_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Symbol {
    Cherry,
    Lemon,
    Orange,
    Watermelon,
    Bell,
    MoneyBag,
}

impl Symbol {
    pub const ALL: [Symbol; 6] = [
        Symbol::Cherry,
        Symbol::Lemon,
        Symbol::Orange,
        Symbol::Watermelon,
        Symbol::Bell,
        Symbol::MoneyBag,
    ];

    /// Payout multiplier in tenths of the stake.
    pub fn multiplier_tenths(self) -> u64 {
        match self {
            Symbol::Cherry => 14,
            Symbol::Lemon => 18,
            Symbol::Orange => 25,
            Symbol::Watermelon => 30,
            Symbol::Bell => 50,
            Symbol::MoneyBag => 500,
        }
    }

    /// Relative draw weight in hundredths; the jackpot symbol is rarest.
    pub fn weight(self) -> u32 {
        match self {
            Symbol::Cherry | Symbol::Lemon | Symbol::Orange | Symbol::Watermelon => 100,
            Symbol::Bell => 70,
            Symbol::MoneyBag => 50,
        }
    }

    /// Payout for one matched line, truncated like every other point amount.
    pub fn line_payout(self, stake: u64) -> u64 {
        stake.saturating_mul(self.multiplier_tenths()) / 10
    }

    pub fn glyph(self) -> &'static str {
        match self {
            Symbol::Cherry => "🍒",
            Symbol::Lemon => "🍋",
            Symbol::Orange => "🍊",
            Symbol::Watermelon => "🍉",
            Symbol::Bell => "🔔",
            Symbol::MoneyBag => "💰",
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.glyph())
    }
}

/// Weighted symbol alphabet every cell is drawn from
#[derive(Debug, Clone)]
pub struct ReelStrip {
    symbols: Vec<Symbol>,
    index: WeightedIndex<u32>,
}

impl ReelStrip {
    pub fn new(entries: &[(Symbol, u32)]) -> WagerResult<Self> {
        let index = WeightedIndex::new(entries.iter().map(|(_, w)| *w)).map_err(|e| {
            ConfigurationError::InvalidValue {
                field: "reel weights".to_string(),
                value: format!("{:?}", entries),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            symbols: entries.iter().map(|(s, _)| *s).collect(),
            index,
        })
    }

    pub fn standard() -> WagerResult<Self> {
        let entries: Vec<(Symbol, u32)> = Symbol::ALL.iter().map(|s| (*s, s.weight())).collect();
        Self::new(&entries)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Symbol {
        self.symbols[self.index.sample(rng)]
    }
}

/// Fill a grid row by row.
pub fn spin<S: OutcomeSource + ?Sized>(source: &S, strip: &ReelStrip) -> Grid {
    let mut grid = [[Symbol::Cherry; GRID_SIZE]; GRID_SIZE];
    for row in grid.iter_mut() {
        for cell in row.iter_mut() {
            *cell = source.draw_symbol(strip);
        }
    }
    grid
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Line {
    Row(usize),
    Column(usize),
    /// Top-left to bottom-right.
    Diagonal,
    /// Bottom-left to top-right.
    AntiDiagonal,
}

impl Line {
    fn cells(self) -> [(usize, usize); GRID_SIZE] {
        match self {
            Line::Row(r) => [(r, 0), (r, 1), (r, 2)],
            Line::Column(c) => [(0, c), (1, c), (2, c)],
            Line::Diagonal => [(0, 0), (1, 1), (2, 2)],
            Line::AntiDiagonal => [(2, 0), (1, 1), (0, 2)],
        }
    }

    pub fn all() -> [Line; 8] {
        [
            Line::Row(0),
            Line::Row(1),
            Line::Row(2),
            Line::Column(0),
            Line::Column(1),
            Line::Column(2),
            Line::Diagonal,
            Line::AntiDiagonal,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineWin {
    pub line: Line,
    pub symbol: Symbol,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub payout: u64,
    pub lines: Vec<LineWin>,
}

/// Score every line of `grid` at `stake`. Pure in grid and stake.
pub fn evaluate(grid: &Grid, stake: u64) -> Evaluation {
    let lines: Vec<LineWin> = Line::all()
        .into_iter()
        .filter_map(|line| {
            let [a, b, c] = line.cells();
            let symbol = grid[a.0][a.1];
            (symbol == grid[b.0][b.1] && symbol == grid[c.0][c.1]).then(|| LineWin {
                line,
                symbol,
                amount: symbol.line_payout(stake),
            })
        })
        .collect();
    let payout = lines.iter().map(|w| w.amount).sum();
    Evaluation { payout, lines }
}

/// Size of a win relative to the stake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinTier {
    NoWin,
    SmallWin,
    LargeWin,
    HugeWin,
    MassiveWin,
    SmallJackpot,
    Jackpot,
}

impl WinTier {
    pub fn classify(payout: u64, stake: u64) -> Self {
        if payout == 0 || stake == 0 {
            return WinTier::NoWin;
        }
        let ratio = payout as f64 / stake as f64;
        if ratio < 2.0 {
            WinTier::SmallWin
        } else if ratio < 3.5 {
            WinTier::LargeWin
        } else if ratio < 5.0 {
            WinTier::HugeWin
        } else if ratio < 10.0 {
            WinTier::MassiveWin
        } else if ratio < 20.0 {
            WinTier::SmallJackpot
        } else {
            WinTier::Jackpot
        }
    }
}

/// Ascending list of permitted reel stakes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BetLadder(Vec<u64>);

impl BetLadder {
    pub fn new(rungs: Vec<u64>) -> WagerResult<Self> {
        if rungs.is_empty() {
            return Err(ConfigurationError::MissingRequired("slots.bet_ladder".to_string()).into());
        }
        if rungs[0] == 0 || rungs.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigurationError::InvalidValue {
                field: "slots.bet_ladder".to_string(),
                value: format!("{:?}", rungs),
                reason: "rungs must be positive and strictly ascending".to_string(),
            }
            .into());
        }
        Ok(Self(rungs))
    }

    pub fn rungs(&self) -> &[u64] {
        &self.0
    }

    pub fn lowest(&self) -> u64 {
        self.0[0]
    }

    pub fn position(&self, stake: u64) -> WagerResult<usize> {
        self.0.iter().position(|&r| r == stake).ok_or_else(|| {
            WagerError::invalid_stake(stake, format!("slot bets must be one of {:?}", self.0))
        })
    }

    /// One rung up, clamped at the top.
    pub fn raise(&self, index: usize) -> usize {
        (index + 1).min(self.0.len() - 1)
    }

    /// One rung down, clamped at the bottom.
    pub fn lower(&self, index: usize) -> usize {
        index.saturating_sub(1)
    }

    pub fn at(&self, index: usize) -> u64 {
        self.0[index.min(self.0.len() - 1)]
    }
}

impl Default for BetLadder {
    fn default() -> Self {
        Self(vec![10, 25, 50, 100, 250, 500, 1000])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinOutcome {
    pub grid: Grid,
    pub stake: u64,
    pub payout: u64,
    pub lines: Vec<LineWin>,
    pub tier: WinTier,
}

/// State of one open slot machine: the current rung and the last spin
#[derive(Debug, Clone)]
pub struct SlotMachine {
    ladder: BetLadder,
    rung: usize,
    last_spin: Option<SpinOutcome>,
    spins: u64,
}

impl SlotMachine {
    pub fn new(ladder: BetLadder, stake: u64) -> WagerResult<Self> {
        let rung = ladder.position(stake)?;
        Ok(Self {
            ladder,
            rung,
            last_spin: None,
            spins: 0,
        })
    }

    pub fn bet(&self) -> u64 {
        self.ladder.at(self.rung)
    }

    pub fn last_spin(&self) -> Option<&SpinOutcome> {
        self.last_spin.as_ref()
    }

    pub fn spins(&self) -> u64 {
        self.spins
    }

    pub fn raise_bet(&mut self) -> u64 {
        self.rung = self.ladder.raise(self.rung);
        self.bet()
    }

    pub fn lower_bet(&mut self) -> u64 {
        self.rung = self.ladder.lower(self.rung);
        self.bet()
    }

    /// Debit the bet and credit the payout in one ledger critical section.
    pub fn spin<S: OutcomeSource + ?Sized>(
        &mut self,
        user: UserId,
        ledger: &Ledger,
        source: &S,
        strip: &ReelStrip,
    ) -> WagerResult<(Receipt, SpinOutcome)> {
        let stake = self.bet();
        let (receipt, outcome) = ledger.transact(user, |balance| {
            if balance < stake {
                return Err(WagerError::InsufficientBalance {
                    required: stake,
                    available: balance,
                });
            }
            let grid = spin(source, strip);
            let Evaluation { payout, lines } = evaluate(&grid, stake);
            let delta = points(payout) - points(stake);
            Ok((
                delta,
                SpinOutcome {
                    grid,
                    stake,
                    payout,
                    lines,
                    tier: WinTier::classify(payout, stake),
                },
            ))
        })?;

        tracing::debug!(
            user = %user,
            stake,
            payout = outcome.payout,
            balance = receipt.balance,
            "Slot spin settled"
        );
        self.spins += 1;
        self.last_spin = Some(outcome.clone());
        Ok((receipt, outcome))
    }
}
