use std::sync::atomic::{AtomicI64, Ordering};

use thiserror::Error;

const UNSET: i64 = i64::MIN;
const DISCARD: i64 = i64::MIN + 1;
const AMBIGUOUS_OTHER_WINS: i64 = i64::MIN + 2;

/// State of one ordinal between passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreState {
    /// Not aligned in the forward stream.
    Unset,
    /// Alignment score seen in the forward stream.
    Score(i32),
    /// The forward alignment loses or ties and must not be emitted.
    Discard,
    /// The reverse alignment lost; the forward one is kept.
    AmbiguousOtherWins,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Discard,
    OtherWins,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("ordinal {ordinal} outside table of {size} entries")]
    OutOfRange { ordinal: u32, size: usize },

    #[error("ordinal {0} already has a score")]
    AlreadyDecided(u32),

    #[error("{0} reads do not fit in memory on this platform")]
    TooLarge(u64),
}

/// Ordinal-indexed decisions shared by the reconciliation passes. Cells
/// are independent atomics so workers writing disjoint ordinals need no
/// lock; a pass only reads what earlier, joined passes wrote.
pub struct ScoreTable {
    cells: Vec<AtomicI64>,
}

impl ScoreTable {
    /// Table for ordinals `1..=total_reads`; slot 0 is never used.
    pub fn new(total_reads: u64) -> Result<Self, TableError> {
        let size = usize::try_from(total_reads)
            .ok()
            .and_then(|n| n.checked_add(1))
            .ok_or(TableError::TooLarge(total_reads))?;
        let mut cells = Vec::with_capacity(size);
        cells.resize_with(size, || AtomicI64::new(UNSET));
        Ok(Self { cells })
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn cell(&self, ordinal: u32) -> Result<&AtomicI64, TableError> {
        self.cells
            .get(ordinal as usize)
            .ok_or(TableError::OutOfRange {
                ordinal,
                size: self.cells.len(),
            })
    }

    /// Records the forward-stream score. Fails if the ordinal was already
    /// seen.
    pub fn set_score(&self, ordinal: u32, score: i32) -> Result<(), TableError> {
        self.cell(ordinal)?
            .compare_exchange(UNSET, i64::from(score), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| TableError::AlreadyDecided(ordinal))
    }

    pub fn get(&self, ordinal: u32) -> Result<ScoreState, TableError> {
        let state = match self.cell(ordinal)?.load(Ordering::Acquire) {
            UNSET => ScoreState::Unset,
            DISCARD => ScoreState::Discard,
            AMBIGUOUS_OTHER_WINS => ScoreState::AmbiguousOtherWins,
            score => ScoreState::Score(score as i32),
        };
        Ok(state)
    }

    pub fn mark(&self, ordinal: u32, resolution: Resolution) -> Result<(), TableError> {
        let value = match resolution {
            Resolution::Discard => DISCARD,
            Resolution::OtherWins => AMBIGUOUS_OTHER_WINS,
        };
        self.cell(ordinal)?.store(value, Ordering::Release);
        Ok(())
    }
}
