use clap::ValueEnum;

use crate::conversion_log::ConversionLog;
use crate::seqreader::Sequence;
use crate::trimmer::Mate;

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConversionMode {
    /// No conversion; plain DNA/RNA-seq alignment.
    #[default]
    #[value(alias = "0")]
    None,
    /// C>T (G>A) at every C (G) of read 1 (read 2); 3-letter BS-seq.
    #[value(alias = "3")]
    Global,
    /// C>T (G>A) at CpG sites only; 4-letter TAPS.
    #[value(alias = "4")]
    Cpg,
}

/// Substitutions made to one read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversion {
    pub trailing: Option<u8>,
    pub substitutions: Vec<u32>,
}

impl Conversion {
    pub fn into_log(self, ordinal: u32) -> ConversionLog {
        ConversionLog::new(ordinal, self.trailing, self.substitutions)
    }
}

/// Converts `read` in place.
///
/// Read 1 has `C` turned into `T`; read 2 has `G` turned into `A`. In CpG
/// mode the half site at the open end (a trailing `C` on read 1, a leading
/// `G` on read 2) cannot be classified, so that base is removed and its
/// quality kept in the log. Offsets refer to the returned read.
pub fn convert_read(read: &mut Sequence, mate: Mate, mode: ConversionMode) -> Conversion {
    let mut conversion = Conversion::default();
    match (mode, mate) {
        (ConversionMode::None, _) => {}
        (ConversionMode::Global, Mate::First) => {
            substitute(&mut read.seq, &mut conversion.substitutions, b'C', b'T', |_, _| true);
        }
        (ConversionMode::Global, Mate::Second) => {
            substitute(&mut read.seq, &mut conversion.substitutions, b'G', b'A', |_, _| true);
        }
        (ConversionMode::Cpg, Mate::First) => {
            if read.seq.last() == Some(&b'C') {
                read.seq.pop();
                conversion.trailing = read.quals.pop();
            }
            substitute(&mut read.seq, &mut conversion.substitutions, b'C', b'T', |seq, i| {
                seq.get(i + 1) == Some(&b'G')
            });
        }
        (ConversionMode::Cpg, Mate::Second) => {
            if read.seq.first() == Some(&b'G') {
                read.seq.remove(0);
                conversion.trailing = Some(read.quals.remove(0));
            }
            substitute(&mut read.seq, &mut conversion.substitutions, b'G', b'A', |seq, i| {
                i > 0 && seq[i - 1] == b'C'
            });
        }
    }
    conversion
}

fn substitute<F>(seq: &mut [u8], log: &mut Vec<u32>, from: u8, to: u8, in_context: F)
where
    F: Fn(&[u8], usize) -> bool,
{
    // Context bases are never the converted base, so converting while
    // scanning cannot change a later decision.
    for i in 0..seq.len() {
        if seq[i] == from && in_context(seq, i) {
            seq[i] = to;
            log.push(i as u32);
        }
    }
}

/// Undoes `substitutions` on a read in its sequencing orientation.
pub fn restore_read(read: &mut Sequence, mate: Mate, conversion: &Conversion) {
    let original = match mate {
        Mate::First => b'C',
        Mate::Second => b'G',
    };
    for &offset in &conversion.substitutions {
        read.seq[offset as usize] = original;
    }
    if let Some(qual) = conversion.trailing {
        match mate {
            Mate::First => {
                read.seq.push(b'C');
                read.quals.push(qual);
            }
            Mate::Second => {
                read.seq.insert(0, b'G');
                read.quals.insert(0, qual);
            }
        }
    }
}
