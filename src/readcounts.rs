use serde::Serialize;
use std::ops::AddAssign;

/// Base counts at one sequencing cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BaseCounts {
    pub a: u64,
    pub c: u64,
    pub g: u64,
    pub t: u64,
    pub n: u64,
}

impl BaseCounts {
    pub fn add_base(&mut self, base: u8) {
        match base {
            b'A' | b'a' => self.a += 1,
            b'C' | b'c' => self.c += 1,
            b'G' | b'g' => self.g += 1,
            b'T' | b't' => self.t += 1,
            _ => self.n += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.a + self.c + self.g + self.t + self.n
    }
}

impl AddAssign for BaseCounts {
    fn add_assign(&mut self, other: Self) {
        self.a += other.a;
        self.c += other.c;
        self.g += other.g;
        self.t += other.t;
        self.n += other.n;
    }
}

/// Per-cycle base composition of one mate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleComposition {
    cycles: Vec<BaseCounts>,
}

impl CycleComposition {
    pub fn new(cycle: usize) -> Self {
        Self {
            cycles: vec![BaseCounts::default(); cycle],
        }
    }

    /// Counts the bases of `seq` up to the configured cycle count.
    pub fn add_read(&mut self, seq: &[u8]) {
        for (counts, &base) in self.cycles.iter_mut().zip(seq) {
            counts.add_base(base);
        }
    }

    pub fn cycles(&self) -> &[BaseCounts] {
        &self.cycles
    }

    pub fn merge(&mut self, other: &CycleComposition) {
        if self.cycles.len() < other.cycles.len() {
            self.cycles.resize(other.cycles.len(), BaseCounts::default());
        }
        for (mine, theirs) in self.cycles.iter_mut().zip(&other.cycles) {
            *mine += *theirs;
        }
    }
}

/// Trimming outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrimCounters {
    pub dropped: u64,
    pub adapter: u64,
    pub tail_adapter: u64,
}

impl AddAssign for TrimCounters {
    fn add_assign(&mut self, other: Self) {
        self.dropped += other.dropped;
        self.adapter += other.adapter;
        self.tail_adapter += other.tail_adapter;
    }
}

/// Everything one worker counts while encoding its share of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadCounts {
    n_reads: u64,
    pub trim: TrimCounters,
    pub mate1: CycleComposition,
    pub mate2: Option<CycleComposition>,
}

impl ReadCounts {
    pub fn new(cycle: usize, paired: bool) -> Self {
        Self {
            n_reads: 0,
            trim: TrimCounters::default(),
            mate1: CycleComposition::new(cycle),
            mate2: paired.then(|| CycleComposition::new(cycle)),
        }
    }

    pub fn read_count(&self) -> u64 {
        self.n_reads
    }

    pub fn increment_read_count(&mut self) {
        self.n_reads += 1;
    }

    pub fn kept(&self) -> u64 {
        self.n_reads - self.trim.dropped
    }

    pub fn merge(&mut self, other: &ReadCounts) {
        self.n_reads += other.n_reads;
        self.trim += other.trim;
        self.mate1.merge(&other.mate1);
        match (self.mate2.as_mut(), other.mate2.as_ref()) {
            (Some(mine), Some(theirs)) => mine.merge(theirs),
            (None, Some(theirs)) => self.mate2 = Some(theirs.clone()),
            _ => {}
        }
    }
}

impl AddAssign for ReadCounts {
    fn add_assign(&mut self, other: Self) {
        self.merge(&other);
    }
}
