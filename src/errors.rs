use std::path::PathBuf;

use noodles::sam::alignment::record::cigar::op::Kind;
use thiserror::Error;

use crate::conversion_log::CodecError;
use crate::score_table::TableError;

/// Failures that end a run, each with its own exit status.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("cannot open input file {}", path.display())]
    MissingInput { path: PathBuf },

    #[error("corrupt run summary {}: {reason}", path.display())]
    CorruptSummary { path: PathBuf, reason: String },

    #[error("unparseable SAM header in {}: {reason}", path.display())]
    BadHeader { path: PathBuf, reason: String },

    #[error("input mismatch: {0}")]
    InputMismatch(String),

    #[error("cannot write {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("output file {} exists and cannot be removed", path.display())]
    OutputExists {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Usage(_) => 2,
            RunError::MissingInput { .. } => 10,
            RunError::CorruptSummary { .. } | RunError::BadHeader { .. } => 11,
            RunError::Write { .. } => 13,
            RunError::OutputExists { .. } => 100,
            RunError::InputMismatch(_) => 1,
        }
    }
}

/// Why one alignment record was skipped.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("invalid {field} field: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("unsupported CIGAR operation {0:?}")]
    UnsupportedCigarOp(Kind),

    #[error("missing AS tag")]
    MissingScore,

    #[error("identifier: {0}")]
    Identifier(#[from] CodecError),

    #[error("substitution offset {offset} outside read of length {len}")]
    OffsetOutOfRange { offset: u32, len: usize },

    #[error("score table: {0}")]
    Table(#[from] TableError),

    #[error("reference sequence {0} missing from the output header")]
    UnknownReference(usize),

    #[error("cannot format record: {0}")]
    Unwritable(String),
}

/// Exit code for an error chain: the first `RunError` found decides,
/// anything else is a generic failure.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<RunError>())
        .map_or(1, RunError::exit_code)
}

pub fn exit_with_error(err: &anyhow::Error) -> ! {
    log::error!("{:#}", err);
    std::process::exit(exit_code_for(err));
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_exit_codes() {
        let missing = RunError::MissingInput {
            path: PathBuf::from("x.fq"),
        };
        assert_eq!(missing.exit_code(), 10);
        let corrupt = RunError::CorruptSummary {
            path: PathBuf::from("x.trim.log"),
            reason: "empty".into(),
        };
        assert_eq!(corrupt.exit_code(), 11);
        assert_eq!(RunError::Usage("bad".into()).exit_code(), 2);
    }

    #[test]
    fn test_exit_code_found_through_context() {
        let err = Err::<(), _>(RunError::Write {
            path: PathBuf::from("out.sam"),
            source: std::io::Error::other("disk full"),
        })
        .context("writing merged alignments")
        .unwrap_err();
        assert_eq!(exit_code_for(&err), 13);

        let plain = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&plain), 1);
    }
}
