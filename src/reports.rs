use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, IsTerminal, Write};
use std::path::Path;

use crate::errors::RunError;
use crate::readcounts::{CycleComposition, TrimCounters};

fn write_file<F>(path: &Path, body: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    let failed = |source: io::Error| RunError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut ofs = BufWriter::new(File::create(path).map_err(failed)?);
    body(&mut ofs).and_then(|_| ofs.flush()).map_err(failed)?;
    Ok(())
}

/// Removes a leftover output file from an earlier run.
pub fn remove_existing_output(path: &Path) -> Result<(), RunError> {
    if !path.exists() {
        return Ok(());
    }
    log::warn!("output file {} exists and will be overwritten", path.display());
    std::fs::remove_file(path).map_err(|source| RunError::OutputExists {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes the trimming summary. The first line is the number of reads
/// (pairs) seen; the reconciler sizes its score table from it.
pub fn write_trim_log(path: &Path, total_reads: u64, trim: &TrimCounters) -> Result<()> {
    write_file(path, |ofs| {
        writeln!(ofs, "{}", total_reads)?;
        writeln!(ofs, "Dropped : {}", trim.dropped)?;
        writeln!(ofs, "Adapter : {}", trim.adapter)?;
        writeln!(ofs, "Tail Hit: {}", trim.tail_adapter)
    })
}

/// Reads the read total back from a trimming summary.
pub fn read_total_reads(path: &Path) -> Result<u64> {
    let file = File::open(path).map_err(|_| RunError::MissingInput {
        path: path.to_path_buf(),
    })?;
    let mut first = String::new();
    BufReader::new(file)
        .read_line(&mut first)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let total = first.trim().parse::<u64>().map_err(|_| RunError::CorruptSummary {
        path: path.to_path_buf(),
        reason: format!("first line is not a read count: {:?}", first.trim_end()),
    })?;
    // Ordinals are 32-bit.
    if total > u64::from(u32::MAX) {
        return Err(RunError::CorruptSummary {
            path: path.to_path_buf(),
            reason: format!("read count {} exceeds {}", total, u32::MAX),
        }
        .into());
    }
    Ok(total)
}

/// Writes the per-cycle base composition table.
pub fn write_fqstat(path: &Path, composition: &CycleComposition) -> Result<()> {
    write_file(path, |ofs| {
        writeln!(ofs, "Cycle\tA\tC\tG\tT\tN")?;
        for (i, counts) in composition.cycles().iter().enumerate() {
            writeln!(
                ofs,
                "{}\t{}\t{}\t{}\t{}\t{}",
                i + 1,
                counts.a,
                counts.c,
                counts.g,
                counts.t,
                counts.n
            )?;
        }
        Ok(())
    })
}

pub fn write_json_summary<T: Serialize>(path: &Path, summary: &T) -> Result<()> {
    write_file(path, |ofs| {
        serde_json::to_writer_pretty(&mut *ofs, summary)?;
        writeln!(ofs)
    })
}

/// Overwrites the progress line on a terminal.
pub fn report_progress(what: &str, count: u64) {
    if std::io::stderr().is_terminal() {
        eprint!("\r{} {} processed", count, what);
    }
}

pub fn report_stats(what: &str, duration_secs: f64, total: u64, kept: u64) {
    if std::io::stderr().is_terminal() {
        eprint!("\r");
    }
    let rate = if duration_secs > 0.0 {
        total as f64 / 1.0e3 / (duration_secs / 60.0)
    } else {
        0.0
    };
    log::info!(
        "{} {} processed in {:.3}s ({:.1} K/m), {} kept ({:.2}%)",
        total,
        what,
        duration_secs,
        rate,
        kept,
        percent(kept, total)
    );
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}
