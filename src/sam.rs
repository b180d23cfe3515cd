//! Field access and in-place edits on noodles alignment records, limited to
//! what the reconciler judges and restores.

use noodles::core::Position;
use noodles::sam::alignment::record::cigar::{op::Kind, Op};
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record::MappingQuality;
use noodles::sam::alignment::record_buf::data::field::Value;
use noodles::sam::alignment::record_buf::Data;
use noodles::sam::alignment::RecordBuf;

use crate::errors::RecordError;

/// Offset between ASCII quality characters and phred scores.
pub const PHRED_OFFSET: u8 = 33;

/// MAPQ the aligner reports when it has none.
const MISSING_MAPQ: u8 = 255;

fn alignment_score_tag() -> Tag {
    Tag::from([b'A', b'S'])
}

fn suboptimal_score_tag() -> Tag {
    Tag::from([b'X', b'S'])
}

fn strand_tag() -> Tag {
    Tag::from([b'X', b'G'])
}

/// Alignment strand recorded in the `XG` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strand {
    /// Forward-converted (C>T) reference; `XG:Z:CT`.
    Watson,
    /// Reverse-converted (G>A) reference; `XG:Z:GA`.
    Crick,
}

impl Strand {
    pub fn tag_value(self) -> &'static str {
        match self {
            Strand::Watson => "CT",
            Strand::Crick => "GA",
        }
    }
}

/// Read name as bytes; empty when the record has none.
pub fn name(record: &RecordBuf) -> &[u8] {
    match record.name() {
        Some(name) => <_ as AsRef<[u8]>>::as_ref(name),
        None => &[],
    }
}

pub fn mapq(record: &RecordBuf) -> u8 {
    record.mapping_quality().map_or(MISSING_MAPQ, u8::from)
}

pub fn halve_mapq(record: &mut RecordBuf) {
    let halved = mapq(record) >> 1;
    *record.mapping_quality_mut() = MappingQuality::new(halved);
}

/// Not a primary mapped alignment.
pub fn is_policy_drop(record: &RecordBuf) -> bool {
    let flags = record.flags();
    flags.is_unmapped() || flags.is_secondary() || flags.is_supplementary()
}

fn int_value(value: &Value) -> Option<i64> {
    match value {
        Value::Int8(n) => Some(i64::from(*n)),
        Value::UInt8(n) => Some(i64::from(*n)),
        Value::Int16(n) => Some(i64::from(*n)),
        Value::UInt16(n) => Some(i64::from(*n)),
        Value::Int32(n) => Some(i64::from(*n)),
        Value::UInt32(n) => Some(i64::from(*n)),
        _ => None,
    }
}

/// The aligner's `AS:i` score.
pub fn alignment_score(record: &RecordBuf) -> Result<i32, RecordError> {
    let value = record
        .data()
        .get(&alignment_score_tag())
        .ok_or(RecordError::MissingScore)?;
    int_value(value)
        .and_then(|n| i32::try_from(n).ok())
        .ok_or_else(|| RecordError::InvalidField {
            field: "AS",
            value: format!("{:?}", value),
        })
}

/// Whether the aligner reported a second-best hit, wherever the tag sits.
pub fn has_suboptimal_hit(record: &RecordBuf) -> bool {
    record.data().get(&suboptimal_score_tag()).is_some()
}

/// Replaces every optional field with the strand tag.
pub fn set_strand(record: &mut RecordBuf, strand: Strand) {
    let mut data = Data::default();
    data.insert(strand_tag(), Value::from(strand.tag_value()));
    *record.data_mut() = data;
}

/// Only `M`, `I`, `D` and `S` can be patched.
pub fn check_cigar(record: &RecordBuf) -> Result<(), RecordError> {
    for op in record.cigar().as_ref() {
        match op.kind() {
            Kind::Match | Kind::Insertion | Kind::Deletion | Kind::SoftClip => {}
            kind => return Err(RecordError::UnsupportedCigarOp(kind)),
        }
    }
    Ok(())
}

/// Accounts for one base added before the first aligned base and returns
/// the new alignment start. A leading soft clip takes the base; otherwise
/// it is aligned one position earlier, unless that would fall off the
/// start of the reference.
pub fn prepend_base(ops: &mut Vec<Op>, start: Option<Position>) -> Option<Position> {
    let Some(first) = ops.first().copied() else {
        return start;
    };
    let pos = start.map_or(0, usize::from);
    match first.kind() {
        Kind::SoftClip => {
            ops[0] = Op::new(Kind::SoftClip, first.len() + 1);
            start
        }
        _ if pos <= 1 => {
            ops.insert(0, Op::new(Kind::SoftClip, 1));
            start
        }
        Kind::Match => {
            ops[0] = Op::new(Kind::Match, first.len() + 1);
            Position::new(pos - 1)
        }
        _ => {
            ops.insert(0, Op::new(Kind::Match, 1));
            Position::new(pos - 1)
        }
    }
}

/// Accounts for one base added after the last aligned base.
pub fn append_base(ops: &mut Vec<Op>) {
    let Some(last) = ops.last().copied() else {
        return;
    };
    match last.kind() {
        Kind::Match | Kind::SoftClip => {
            let i = ops.len() - 1;
            ops[i] = Op::new(last.kind(), last.len() + 1);
        }
        _ => ops.push(Op::new(Kind::Match, 1)),
    }
}
