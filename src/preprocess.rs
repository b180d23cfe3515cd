//! Batch encoder: trims, converts and renames reads for alignment.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::conversion_log;
use crate::converter::{convert_read, Conversion, ConversionMode};
use crate::errors::RunError;
use crate::gz_stream::GzInputStream;
use crate::readcounts::{CycleComposition, ReadCounts, TrimCounters};
use crate::reports;
use crate::seqreader::{BatchSequenceReader, Sequence};
use crate::threadpool::{self, BATCH_SIZE};
use crate::trimmer::{trim_read, Mate, TrimOptions};

#[derive(Debug, Clone)]
pub struct PreprocessOptions {
    pub mode: ConversionMode,
    /// Reads are cut to this many cycles before anything else.
    pub cycle: usize,
    pub trim: TrimOptions,
    pub threads: usize,
    pub batch_size: usize,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            mode: ConversionMode::None,
            cycle: 150,
            trim: TrimOptions::default(),
            threads: 1,
            batch_size: BATCH_SIZE,
        }
    }
}

/// Files written by one run.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub r1: PathBuf,
    pub r2: Option<PathBuf>,
    pub trim_log: PathBuf,
    pub stat_r1: PathBuf,
    pub stat_r2: Option<PathBuf>,
}

impl OutputPaths {
    pub fn from_prefix(prefix: &str, paired: bool) -> Self {
        let path = |suffix: &str| PathBuf::from(format!("{}.{}", prefix, suffix));
        Self {
            r1: path("R1.fq"),
            r2: paired.then(|| path("R2.fq")),
            trim_log: path("trim.log"),
            stat_r1: path("R1.fqstat"),
            stat_r2: paired.then(|| path("R2.fqstat")),
        }
    }

    pub fn all(&self) -> Vec<&Path> {
        let mut paths = vec![self.r1.as_path(), self.trim_log.as_path(), self.stat_r1.as_path()];
        paths.extend(self.r2.as_deref());
        paths.extend(self.stat_r2.as_deref());
        paths
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreprocessSummary {
    pub reads: u64,
    pub kept: u64,
    pub trim: TrimCounters,
    pub elapsed_secs: f64,
}

/// One read or read pair.
#[derive(Debug, Default, Clone)]
pub struct Fragment {
    pub mate1: Sequence,
    pub mate2: Option<Sequence>,
}

/// Trims and records statistics for one mate; false if it is dropped.
fn prepare_mate(
    read: &mut Sequence,
    mate: Mate,
    opts: &PreprocessOptions,
    composition: &mut CycleComposition,
    trim: &mut TrimCounters,
) -> bool {
    read.truncate(opts.cycle);
    composition.add_read(&read.seq);
    let result = trim_read(read, mate, &opts.trim);
    result.count(trim);
    result.kept
}

/// Converts one mate; `None` when its name would run into the log.
fn convert_mate(read: &mut Sequence, mate: Mate, mode: ConversionMode) -> Option<Conversion> {
    let conversion = convert_read(read, mate, mode);
    let decodable = mode == ConversionMode::None
        || conversion_log::is_unambiguous(
            conversion.trailing,
            &conversion.substitutions,
            read.name().as_bytes(),
        );
    decodable.then_some(conversion)
}

fn write_encoded(
    read: &Sequence,
    conversion: &Conversion,
    ordinal: u32,
    mode: ConversionMode,
    out: &mut String,
) {
    let mut header = String::with_capacity(read.header.len() + 16);
    header.push('@');
    if mode != ConversionMode::None {
        conversion_log::encode_into(
            &mut header,
            ordinal,
            conversion.trailing,
            &conversion.substitutions,
        );
    }
    header.push_str(read.name());
    read.write_fastq(&header, out);
}

/// Encodes one fragment into `out1`/`out2`, or counts it as dropped when
/// either mate fails trimming or cannot be named unambiguously.
pub fn encode_fragment(
    fragment: &mut Fragment,
    ordinal: u32,
    opts: &PreprocessOptions,
    counts: &mut ReadCounts,
    out1: &mut String,
    out2: &mut String,
) {
    counts.increment_read_count();
    let kept1 = prepare_mate(
        &mut fragment.mate1,
        Mate::First,
        opts,
        &mut counts.mate1,
        &mut counts.trim,
    );
    let kept2 = match fragment.mate2.as_mut() {
        Some(mate2) => prepare_mate(
            mate2,
            Mate::Second,
            opts,
            counts
                .mate2
                .get_or_insert_with(|| CycleComposition::new(opts.cycle)),
            &mut counts.trim,
        ),
        None => true,
    };
    if !(kept1 && kept2) {
        counts.trim.dropped += 1;
        return;
    }

    let conversion1 = convert_mate(&mut fragment.mate1, Mate::First, opts.mode);
    let conversion2 = fragment
        .mate2
        .as_mut()
        .map(|mate2| convert_mate(mate2, Mate::Second, opts.mode));
    let (Some(conversion1), Some(conversion2)) =
        (conversion1, conversion2.unwrap_or(Some(Conversion::default())))
    else {
        log::warn!(
            "read {} has no conversions and a name starting with '|'; dropped",
            fragment.mate1.name()
        );
        counts.trim.dropped += 1;
        return;
    };

    write_encoded(&fragment.mate1, &conversion1, ordinal, opts.mode, out1);
    if let Some(mate2) = &fragment.mate2 {
        write_encoded(mate2, &conversion2, ordinal, opts.mode, out2);
    }
}

struct WorkerOutput {
    out1: String,
    out2: String,
    counts: ReadCounts,
}

fn open_reads(arg: &str) -> Result<BatchSequenceReader<BufReader<GzInputStream>>> {
    let stream = GzInputStream::from_arg(arg).map_err(|_| RunError::MissingInput {
        path: PathBuf::from(arg),
    })?;
    Ok(BatchSequenceReader::new(BufReader::new(stream)))
}

fn create_output(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).map_err(|source| RunError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufWriter::new(file))
}

fn write_buffer(writer: &mut BufWriter<File>, path: &Path, buffer: &str) -> Result<()> {
    writer
        .write_all(buffer.as_bytes())
        .map_err(|source| RunError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(())
}

/// Reads FASTQ from `r1` (and `r2` for pairs), comma-separated lists
/// allowed, and writes the encoded reads and summaries to `outputs`.
pub fn run_preprocess(
    r1: &str,
    r2: Option<&str>,
    outputs: &OutputPaths,
    opts: &PreprocessOptions,
) -> Result<PreprocessSummary> {
    let start_time = Instant::now();
    let paired = r2.is_some();
    let mut reader1 = open_reads(r1)?;
    let mut reader2 = r2.map(open_reads).transpose()?;

    let pool = threadpool::build_pool(opts.threads)?;
    log::info!(
        "preprocessing {} in {:?} mode with {} threads",
        if paired { "paired-end reads" } else { "single-end reads" },
        opts.mode,
        pool.current_num_threads()
    );

    let mut fout1 = create_output(&outputs.r1)?;
    let mut fout2 = match (&outputs.r2, paired) {
        (Some(path), true) => Some(create_output(path)?),
        _ => None,
    };

    let mut total = ReadCounts::new(opts.cycle, paired);
    // Ordinal of the first fragment in the next batch.
    let mut line: u64 = 1;
    loop {
        let batch1 = reader1
            .load_batch(opts.batch_size)
            .with_context(|| format!("failed to read {}", r1))?;
        let batch2 = match reader2.as_mut() {
            Some(reader) => Some(
                reader
                    .load_batch(opts.batch_size)
                    .with_context(|| format!("failed to read {}", r2.unwrap_or_default()))?,
            ),
            None => None,
        };
        if let Some(batch2) = &batch2 {
            if batch2.len() != batch1.len() {
                return Err(RunError::InputMismatch(format!(
                    "read 1 and read 2 files differ in record count after {} records",
                    line - 1 + batch1.len().min(batch2.len()) as u64
                ))
                .into());
            }
        }
        if batch1.is_empty() {
            break;
        }
        let last_ordinal = line + batch1.len() as u64 - 1;
        if last_ordinal > u64::from(u32::MAX) {
            anyhow::bail!("too many reads: ordinal {} does not fit in 32 bits", last_ordinal);
        }

        let mut fragments: Vec<Fragment> = match batch2 {
            Some(batch2) => batch1
                .into_iter()
                .zip(batch2)
                .map(|(mate1, mate2)| Fragment {
                    mate1,
                    mate2: Some(mate2),
                })
                .collect(),
            None => batch1
                .into_iter()
                .map(|mate1| Fragment { mate1, mate2: None })
                .collect(),
        };

        let base = line as u32;
        let results = threadpool::run_chunks(&pool, &mut fragments, |offset, chunk| {
            let mut output = WorkerOutput {
                out1: String::new(),
                out2: String::new(),
                counts: ReadCounts::new(opts.cycle, paired),
            };
            for (i, fragment) in chunk.iter_mut().enumerate() {
                let ordinal = base + (offset + i) as u32;
                encode_fragment(
                    fragment,
                    ordinal,
                    opts,
                    &mut output.counts,
                    &mut output.out1,
                    &mut output.out2,
                );
            }
            output
        });

        for output in results {
            write_buffer(&mut fout1, &outputs.r1, &output.out1)?;
            if let (Some(fout2), Some(path)) = (fout2.as_mut(), outputs.r2.as_ref()) {
                write_buffer(fout2, path, &output.out2)?;
            }
            total += output.counts;
        }
        line = last_ordinal + 1;
        reports::report_progress("reads", total.read_count());
    }

    fout1.flush().map_err(|source| RunError::Write {
        path: outputs.r1.clone(),
        source,
    })?;
    if let (Some(mut fout2), Some(path)) = (fout2, outputs.r2.as_ref()) {
        fout2.flush().map_err(|source| RunError::Write {
            path: path.clone(),
            source,
        })?;
    }

    reports::write_trim_log(&outputs.trim_log, total.read_count(), &total.trim)?;
    reports::write_fqstat(&outputs.stat_r1, &total.mate1)?;
    if let (Some(path), Some(composition)) = (outputs.stat_r2.as_ref(), total.mate2.as_ref()) {
        reports::write_fqstat(path, composition)?;
    }

    let elapsed_secs = start_time.elapsed().as_secs_f64();
    reports::report_stats("reads", elapsed_secs, total.read_count(), total.kept());
    log::info!(
        "dropped {}, adapter hits {}, tail hits {}",
        total.trim.dropped,
        total.trim.adapter,
        total.trim.tail_adapter
    );

    Ok(PreprocessSummary {
        reads: total.read_count(),
        kept: total.kept(),
        trim: total.trim,
        elapsed_secs,
    })
}
