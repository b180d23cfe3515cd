//! Quality and adapter trimming ahead of conversion.
//!
//! Sequencing model:
//!
//! ```text
//!               *read1 -->
//! 5'adapter - NNNNNNNNNNsequenceNNNNNNNNNN - 3'adapter
//!                               <-- read2*
//! ```
//!
//! so read 1 may run into the 3' adapter and read 2 into the reverse
//! complement of the 5' adapter.

use clap::ValueEnum;

use crate::readcounts::TrimCounters;
use crate::seqreader::Sequence;

pub struct AdapterInfo {
    pub adapter_r1: &'static [u8],
    pub adapter_r2: &'static [u8],
    /// Number of adapter bases compared against the read.
    pub adapter_len: usize,
    /// Seed motif searched for in the read.
    pub adapter_index: &'static [u8],
}

static ILLUMINA_ADAPTER: AdapterInfo = AdapterInfo {
    adapter_r1: b"AGATCGGAAGAGC",
    adapter_r2: b"AGATCGGAAGAGC",
    adapter_len: 13,
    adapter_index: b"AGA",
};

static NEXTERA_ADAPTER: AdapterInfo = AdapterInfo {
    adapter_r1: b"CTGTCTCTTATACACATCT",
    adapter_r2: b"CTGTCTCTTATACACATCT",
    adapter_len: 19,
    adapter_index: b"CTG",
};

static BGI_ADAPTER: AdapterInfo = AdapterInfo {
    adapter_r1: b"AAGTCGGAGGCCAAGCGGTC",
    adapter_r2: b"AAGTCGGATCGTAGCCATGT",
    adapter_len: 19,
    adapter_index: b"AAG",
};

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdapterKit {
    #[default]
    Illumina,
    Nextera,
    Bgi,
}

impl AdapterKit {
    pub fn info(self) -> &'static AdapterInfo {
        match self {
            AdapterKit::Illumina => &ILLUMINA_ADAPTER,
            AdapterKit::Nextera => &NEXTERA_ADAPTER,
            AdapterKit::Bgi => &BGI_ADAPTER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mate {
    First,
    Second,
}

#[derive(Debug, Clone, Copy)]
pub struct TrimOptions {
    pub min_length: usize,
    /// Raw ASCII quality threshold (53 is Q20 in phred+33).
    pub min_quality: u8,
    pub kit: AdapterKit,
}

impl Default for TrimOptions {
    fn default() -> Self {
        Self {
            min_length: 36,
            min_quality: 53,
            kit: AdapterKit::Illumina,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterHit {
    None,
    Seed,
    Tail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimResult {
    pub kept: bool,
    pub hit: AdapterHit,
}

impl TrimResult {
    fn kept(hit: AdapterHit) -> Self {
        Self { kept: true, hit }
    }

    fn dropped(hit: AdapterHit) -> Self {
        Self { kept: false, hit }
    }

    /// Adds this outcome to the adapter counters. Drops are counted per
    /// fragment by the caller.
    pub fn count(&self, counters: &mut TrimCounters) {
        match self.hit {
            AdapterHit::Seed => counters.adapter += 1,
            AdapterHit::Tail if self.kept => counters.tail_adapter += 1,
            _ => {}
        }
    }
}

/// Length after cutting low-quality bases from the tail. At least one base
/// is always kept from a non-empty read.
pub fn quality_trim_len(quals: &[u8], min_quality: u8) -> usize {
    if quals.is_empty() {
        return 0;
    }
    let mut i = quals.len() - 1;
    while i > 0 && quals[i] < min_quality {
        i -= 1;
    }
    i + 1
}

/// Whether the read matches the adapter from `pos`, allowing one mismatch
/// per four compared bases (rounded up).
pub fn matches_adapter(seq: &[u8], pos: usize, adapter: &[u8], adapter_len: usize) -> bool {
    let len = (seq.len() - pos).min(adapter_len).min(adapter.len());
    let max_mismatch = len.div_ceil(4);
    let mut mismatches = 0;
    for (read_base, adapter_base) in seq[pos..pos + len].iter().zip(adapter) {
        if read_base != adapter_base {
            mismatches += 1;
            if mismatches > max_mismatch {
                return false;
            }
        }
    }
    true
}

/// First seed position accepted as an adapter boundary.
pub fn find_adapter(seq: &[u8], info: &AdapterInfo, mate: Mate) -> Option<usize> {
    let adapter = match mate {
        Mate::First => info.adapter_r1,
        Mate::Second => info.adapter_r2,
    };
    let index = info.adapter_index;
    if seq.len() < index.len() {
        return None;
    }
    (0..=seq.len() - index.len())
        .filter(|&pos| &seq[pos..pos + index.len()] == index)
        .find(|&pos| matches_adapter(seq, pos, adapter, info.adapter_len))
}

/// Trims `read` in place. On a drop the read is left partially trimmed.
pub fn trim_read(read: &mut Sequence, mate: Mate, opts: &TrimOptions) -> TrimResult {
    if read.seq.len() != read.quals.len() {
        return TrimResult::dropped(AdapterHit::None);
    }

    let len = quality_trim_len(&read.quals, opts.min_quality);
    if len < opts.min_length {
        return TrimResult::dropped(AdapterHit::None);
    }
    read.truncate(len);

    let info = opts.kit.info();
    if let Some(pos) = find_adapter(&read.seq, info, mate) {
        if pos < opts.min_length {
            return TrimResult::dropped(AdapterHit::Seed);
        }
        read.truncate(pos);
        return TrimResult::kept(AdapterHit::Seed);
    }

    // No seed; a two-base adapter prefix at the very end still counts.
    let adapter = match mate {
        Mate::First => info.adapter_r1,
        Mate::Second => info.adapter_r2,
    };
    let len = read.seq.len();
    if len >= 2 && read.seq[len - 2..] == adapter[..2] {
        if len - 2 < opts.min_length {
            return TrimResult::dropped(AdapterHit::Tail);
        }
        read.truncate(len - 2);
        return TrimResult::kept(AdapterHit::Tail);
    }

    TrimResult::kept(AdapterHit::None)
}
