//! Conversion log carried in read identifiers.
//!
//! Every base substitution made before alignment is recorded in front of the
//! read name so that it survives the aligner untouched:
//!
//! ```text
//! <ordinal> '+' [<qual> '|'] [<off> (';' <off>)*] '#' <original name>
//! ```
//!
//! All numbers are lowercase hex. `<qual>|` is present only when a terminal
//! base was removed before conversion; `<qual>` is that base's quality.
//! An empty log followed by a name starting with `|` (`"5+#|name"`) reads
//! as a trailing base of quality `#`, so encoders must not produce one; see
//! [`is_unambiguous`].

use std::fmt::Write as _;
use thiserror::Error;

pub const ORDINAL_DELIMITER: u8 = b'+';
pub const SUBSTITUTION_SEPARATOR: u8 = b';';
pub const LOG_TERMINATOR: u8 = b'#';
pub const KEEP_QUALITY_MARKER: u8 = b'|';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("missing '{delimiter}' before end of identifier")]
    MissingDelimiter { delimiter: char },

    #[error("invalid hex digit '{found}' at byte {position}")]
    InvalidHexDigit { found: char, position: usize },

    #[error("empty number at byte {position}")]
    EmptyNumber { position: usize },

    #[error("number at byte {position} does not fit in 32 bits")]
    Overflow { position: usize },

    #[error("substitution offset {offset:#x} does not follow {previous:#x}")]
    OffsetOrder { previous: u32, offset: u32 },
}

/// Decoded prefix of an identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionLog {
    pub ordinal: u32,
    /// Quality character of a terminal base removed before conversion.
    pub trailing: Option<u8>,
    pub substitutions: Vec<u32>,
}

impl ConversionLog {
    pub fn new(ordinal: u32, trailing: Option<u8>, substitutions: Vec<u32>) -> Self {
        Self {
            ordinal,
            trailing,
            substitutions,
        }
    }

    pub fn encode(&self) -> String {
        encode(self.ordinal, self.trailing, &self.substitutions)
    }
}

/// Encodes a conversion log, terminator included.
pub fn encode(ordinal: u32, trailing: Option<u8>, substitutions: &[u32]) -> String {
    let mut out = String::with_capacity(16 + substitutions.len() * 3);
    encode_into(&mut out, ordinal, trailing, substitutions);
    out
}

/// Appends the encoded log to `out`.
pub fn encode_into(out: &mut String, ordinal: u32, trailing: Option<u8>, substitutions: &[u32]) {
    // Writing to a String cannot fail.
    let _ = write!(out, "{:x}", ordinal);
    out.push(ORDINAL_DELIMITER as char);
    if let Some(qual) = trailing {
        out.push(qual as char);
        out.push(KEEP_QUALITY_MARKER as char);
    }
    for (i, offset) in substitutions.iter().enumerate() {
        if i > 0 {
            out.push(SUBSTITUTION_SEPARATOR as char);
        }
        let _ = write!(out, "{:x}", offset);
    }
    out.push(LOG_TERMINATOR as char);
}

fn hex_value(byte: u8, position: usize) -> Result<u32, CodecError> {
    match byte {
        b'0'..=b'9' => Ok((byte - b'0') as u32),
        b'a'..=b'f' => Ok((byte - (b'a' - 10)) as u32),
        _ => Err(CodecError::InvalidHexDigit {
            found: byte as char,
            position,
        }),
    }
}

/// Reads hex digits from `start` up to (not including) the first byte in
/// `stops`. Returns the value and the index of the stop byte.
fn read_hex(text: &[u8], start: usize, stops: &[u8]) -> Result<(u32, usize), CodecError> {
    let mut value: u32 = 0;
    let mut i = start;
    loop {
        let Some(&byte) = text.get(i) else {
            // Ran off the end; the caller's terminator is what is missing.
            return Err(CodecError::MissingDelimiter {
                delimiter: *stops.last().unwrap_or(&LOG_TERMINATOR) as char,
            });
        };
        if stops.contains(&byte) {
            break;
        }
        let digit = hex_value(byte, i)?;
        if value > (u32::MAX >> 4) {
            return Err(CodecError::Overflow { position: start });
        }
        value = (value << 4) + digit;
        i += 1;
    }
    if i == start {
        return Err(CodecError::EmptyNumber { position: start });
    }
    Ok((value, i))
}

/// Decodes the log at the start of `text`.
///
/// Returns the log and the index where the original free-text name resumes.
pub fn decode(text: &[u8]) -> Result<(ConversionLog, usize), CodecError> {
    let (ordinal, delim) = read_hex(text, 0, &[ORDINAL_DELIMITER])?;
    let mut i = delim + 1;

    let trailing = match (text.get(i), text.get(i + 1)) {
        (Some(&qual), Some(&KEEP_QUALITY_MARKER)) => {
            i += 2;
            Some(qual)
        }
        (Some(_), _) => None,
        (None, _) => {
            return Err(CodecError::MissingDelimiter {
                delimiter: LOG_TERMINATOR as char,
            })
        }
    };

    let mut substitutions = Vec::new();
    match text.get(i) {
        None => {
            return Err(CodecError::MissingDelimiter {
                delimiter: LOG_TERMINATOR as char,
            })
        }
        Some(&LOG_TERMINATOR) => i += 1,
        Some(_) => loop {
            let (offset, stop) = read_hex(text, i, &[SUBSTITUTION_SEPARATOR, LOG_TERMINATOR])?;
            if let Some(&previous) = substitutions.last() {
                if offset <= previous {
                    return Err(CodecError::OffsetOrder { previous, offset });
                }
            }
            substitutions.push(offset);
            i = stop + 1;
            if text[stop] == LOG_TERMINATOR {
                break;
            }
        },
    }

    Ok((ConversionLog::new(ordinal, trailing, substitutions), i))
}

/// Whether `name` can follow this log and still be told apart from it.
pub fn is_unambiguous(trailing: Option<u8>, substitutions: &[u32], name: &[u8]) -> bool {
    trailing.is_some() || !substitutions.is_empty() || name.first() != Some(&KEEP_QUALITY_MARKER)
}

/// Decodes only the ordinal; used where the rest of the log is not needed.
pub fn decode_ordinal(text: &[u8]) -> Result<u32, CodecError> {
    read_hex(text, 0, &[ORDINAL_DELIMITER]).map(|(ordinal, _)| ordinal)
}
