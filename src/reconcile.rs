//! Merges the alignments of the two conversion directions into one SAM
//! stream.
//!
//! The forward stream holds alignments against the C>T converted genome
//! (read 1 on Watson), the reverse stream those against the G>A converted
//! genome (read 1 on Crick). A read may align in both; the score table
//! decides which copy survives:
//!
//! 1. index: record the `AS` score of every forward read 1;
//! 2. resolve: walk the reverse stream, emit reverse winners and mark the
//!    forward copies that lose or tie;
//! 3. finish: walk the forward stream again and emit what was not marked.
//!
//! Each pass is only reachable from the previous one's return value.

use anyhow::{Context, Result};
use noodles::sam::alignment::io::Write as _;
use noodles::sam::alignment::record_buf::{QualityScores, Sequence};
use noodles::sam::alignment::RecordBuf;
use noodles::sam::{self as noodles_sam, Header};
use rayon::ThreadPool;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::marker::PhantomData;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::conversion_log::{self, ConversionLog};
use crate::errors::{RecordError, RunError};
use crate::gz_stream::open_maybe_gz;
use crate::reports;
use crate::sam::{self, Strand};
use crate::score_table::{Resolution, ScoreState, ScoreTable};
use crate::threadpool::{self, BATCH_SIZE};
use crate::trimmer::Mate;

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Winners of an ambiguous pair below this MAPQ are dropped.
    pub min_score_ambiguous: u8,
    /// Unique hits below this MAPQ are dropped if the aligner saw a
    /// second-best hit.
    pub min_score_unique: u8,
    pub threads: usize,
    pub batch_size: usize,
    /// Recorded in the `@PG` header line.
    pub command_line: Option<String>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            min_score_ambiguous: 2,
            min_score_unique: 2,
            threads: 1,
            batch_size: BATCH_SIZE,
            command_line: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// C>T converted alignments.
    Forward,
    /// G>A converted alignments.
    Reverse,
}

impl Stream {
    pub fn strand(self) -> Strand {
        match self {
            Stream::Forward => Strand::Watson,
            Stream::Reverse => Strand::Crick,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Stream::Forward => "forward",
            Stream::Reverse => "reverse",
        }
    }
}

/// Per-stream template counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub templates: u64,
    pub kept: u64,
    pub unmapped: u64,
    pub low_score: u64,
    pub ambiguous: u64,
    /// Templates that could not be judged or restored, plus records the
    /// SAM reader could not parse.
    pub malformed: u64,
}

impl AddAssign for StreamStats {
    fn add_assign(&mut self, other: Self) {
        self.templates += other.templates;
        self.kept += other.kept;
        self.unmapped += other.unmapped;
        self.low_score += other.low_score;
        self.ambiguous += other.ambiguous;
        self.malformed += other.malformed;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileStats {
    pub total_reads: u64,
    /// Forward read 1 records entered into the score table.
    pub indexed: u64,
    pub watson: StreamStats,
    pub crick: StreamStats,
    pub orphan_mates: u64,
    pub elapsed_secs: f64,
}

/// Mate 1 and, for pairs, the mate 2 record right after it.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub first: RecordBuf,
    pub second: Option<RecordBuf>,
}

impl Template {
    fn records(&self) -> impl Iterator<Item = &RecordBuf> {
        std::iter::once(&self.first).chain(self.second.as_ref())
    }

    fn records_mut(&mut self) -> impl Iterator<Item = &mut RecordBuf> {
        std::iter::once(&mut self.first).chain(self.second.as_mut())
    }
}

/// Groups SAM records into templates, batch by batch. Records the parser
/// rejects are skipped and counted.
pub struct TemplateReader<R: BufRead> {
    inner: noodles_sam::io::Reader<R>,
    header: Header,
    path: PathBuf,
    pending: Option<RecordBuf>,
    records: u64,
    orphans: u64,
    malformed: u64,
    quiet: bool,
}

impl<R: BufRead> TemplateReader<R> {
    /// Reads the header; a header noodles cannot parse is fatal.
    pub fn new(reader: R, path: &Path) -> Result<Self> {
        let mut inner = noodles_sam::io::Reader::new(reader);
        let header = match inner.read_header() {
            Ok(header) => header,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                return Err(RunError::BadHeader {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                }
                .into());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        Ok(Self {
            inner,
            header,
            path: path.to_path_buf(),
            pending: None,
            records: 0,
            orphans: 0,
            malformed: 0,
            quiet: false,
        })
    }

    /// Stops warning about skipped records; they are still counted.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn orphans(&self) -> u64 {
        self.orphans
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    fn next_record(&mut self) -> Result<Option<RecordBuf>> {
        if let Some(record) = self.pending.take() {
            return Ok(Some(record));
        }
        loop {
            let mut record = RecordBuf::default();
            match self.inner.read_record_buf(&self.header, &mut record) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.records += 1;
                    return Ok(Some(record));
                }
                // The line is consumed even when it does not parse.
                Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                    self.records += 1;
                    self.malformed += 1;
                    if !self.quiet {
                        log::warn!(
                            "{}: record {} skipped: {}",
                            self.path.display(),
                            self.records,
                            err
                        );
                    }
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to read {}", self.path.display()));
                }
            }
        }
    }

    /// Loads up to `template_count` templates. An empty batch means end of
    /// input.
    pub fn load_batch(&mut self, template_count: usize) -> Result<Vec<Template>> {
        let mut batch = Vec::with_capacity(template_count.min(1 << 16));
        while batch.len() < template_count {
            let Some(first) = self.next_record()? else {
                break;
            };
            if first.flags().is_last_segment() {
                if !self.quiet {
                    log::warn!(
                        "{}: record {}: mate 2 without a preceding mate 1, skipped",
                        self.path.display(),
                        self.records
                    );
                }
                self.orphans += 1;
                continue;
            }
            let second = if first.flags().is_segmented() {
                match self.next_record()? {
                    Some(record) if record.flags().is_last_segment() => Some(record),
                    Some(record) => {
                        self.pending = Some(record);
                        None
                    }
                    None => None,
                }
            } else {
                None
            };
            batch.push(Template { first, second });
        }
        Ok(batch)
    }
}

fn open_sam(path: &Path) -> Result<TemplateReader<Box<dyn BufRead + Send>>> {
    let reader = open_maybe_gz(path).map_err(|_| RunError::MissingInput {
        path: path.to_path_buf(),
    })?;
    TemplateReader::new(reader, path)
}

/// Index of each `from` reference in `to`, or `None` when both headers
/// list the same references in the same order.
fn reference_map(from: &Header, to: &Header) -> Option<Vec<Option<usize>>> {
    let source = from.reference_sequences();
    let target = to.reference_sequences();
    if source.keys().eq(target.keys()) {
        return None;
    }
    Some(source.keys().map(|name| target.get_index_of(name)).collect())
}

fn remap_reference(map: &[Option<usize>], id: &mut Option<usize>) -> Result<(), RecordError> {
    if let Some(old) = *id {
        let new = map
            .get(old)
            .copied()
            .flatten()
            .ok_or(RecordError::UnknownReference(old))?;
        *id = Some(new);
    }
    Ok(())
}

/// Destination of merged records.
pub struct SamSink<W: Write> {
    writer: W,
    path: PathBuf,
}

impl<W: Write> SamSink<W> {
    pub fn new(writer: W, path: &Path) -> Self {
        Self {
            writer,
            path: path.to_path_buf(),
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), RunError> {
        self.writer
            .write_all(bytes)
            .map_err(|source| self.failed(source))
    }

    fn flush(&mut self) -> Result<(), RunError> {
        self.writer.flush().map_err(|source| self.failed(source))
    }

    fn failed(&self, source: io::Error) -> RunError {
        RunError::Write {
            path: self.path.clone(),
            source,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    Unmapped,
    LowScore,
    Ambiguous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Keep { halve_mapq: bool },
    Drop(DropReason),
}

impl StreamStats {
    fn count_drop(&mut self, reason: DropReason) {
        match reason {
            DropReason::Unmapped => self.unmapped += 1,
            DropReason::LowScore => self.low_score += 1,
            DropReason::Ambiguous => self.ambiguous += 1,
        }
    }
}

/// Only one stream aligned this read. Low MAPQ is tolerated unless the
/// aligner reported a second-best hit.
fn unique_hit(rec: &RecordBuf, opts: &ReconcileOptions) -> Verdict {
    if sam::mapq(rec) < opts.min_score_unique && sam::has_suboptimal_hit(rec) {
        Verdict::Drop(DropReason::LowScore)
    } else {
        Verdict::Keep { halve_mapq: false }
    }
}

/// Both streams aligned this read and this copy won.
fn ambiguous_winner(rec: &RecordBuf, opts: &ReconcileOptions) -> Verdict {
    if sam::mapq(rec) < opts.min_score_ambiguous {
        Verdict::Drop(DropReason::LowScore)
    } else {
        Verdict::Keep { halve_mapq: true }
    }
}

fn judge_reverse(
    rec: &RecordBuf,
    ordinal: u32,
    table: &ScoreTable,
    opts: &ReconcileOptions,
) -> Result<Verdict, RecordError> {
    let score = sam::alignment_score(rec)?;
    let verdict = match table.get(ordinal)? {
        ScoreState::Unset => unique_hit(rec, opts),
        ScoreState::Score(forward) if score > forward => {
            table.mark(ordinal, Resolution::Discard)?;
            ambiguous_winner(rec, opts)
        }
        ScoreState::Score(forward) if score == forward => {
            table.mark(ordinal, Resolution::Discard)?;
            Verdict::Drop(DropReason::Ambiguous)
        }
        ScoreState::Score(_) => {
            table.mark(ordinal, Resolution::OtherWins)?;
            Verdict::Drop(DropReason::Ambiguous)
        }
        // A second reverse record for the same read.
        ScoreState::Discard | ScoreState::AmbiguousOtherWins => {
            Verdict::Drop(DropReason::Ambiguous)
        }
    };
    Ok(verdict)
}

fn judge_forward(
    rec: &RecordBuf,
    ordinal: u32,
    table: &ScoreTable,
    opts: &ReconcileOptions,
) -> Result<Verdict, RecordError> {
    // Records without a score were never indexed; keep them out here too.
    sam::alignment_score(rec)?;
    let verdict = match table.get(ordinal)? {
        ScoreState::Discard => Verdict::Drop(DropReason::Ambiguous),
        ScoreState::AmbiguousOtherWins => ambiguous_winner(rec, opts),
        ScoreState::Unset | ScoreState::Score(_) => unique_hit(rec, opts),
    };
    Ok(verdict)
}

/// Where substitutions and a removed terminal base sit in a SAM record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Orientation {
    /// Base written back, as it reads in the record.
    base: u8,
    /// Offsets count from the record's last base.
    from_tail: bool,
    /// The removed base goes in front of the record.
    prepend: bool,
}

fn orientation(stream: Stream, mate: Mate, unmapped: bool) -> Orientation {
    let (base, from_tail, prepend) = match (stream, mate) {
        // Unplaced reads keep their sequencing orientation.
        (_, Mate::First) if unmapped => (b'C', false, false),
        (_, Mate::Second) if unmapped => (b'G', false, true),
        (Stream::Forward, Mate::First) => (b'C', false, false),
        (Stream::Forward, Mate::Second) => (b'C', true, false),
        (Stream::Reverse, Mate::First) => (b'G', true, true),
        (Stream::Reverse, Mate::Second) => (b'G', false, true),
    };
    Orientation {
        base,
        from_tail,
        prepend,
    }
}

/// Undoes the conversion of one record in place: original bases, the
/// removed terminal base, CIGAR and position. The name loses its log.
/// Returns the record's ordinal.
pub fn restore_record(
    rec: &mut RecordBuf,
    mate: Mate,
    stream: Stream,
) -> Result<u32, RecordError> {
    let (log, suffix) = conversion_log::decode(sam::name(rec))?;
    let name = sam::name(rec)[suffix..].to_vec();
    *rec.name_mut() = (!name.is_empty()).then(|| name.into());
    let unmapped = rec.flags().is_unmapped();
    apply_log(rec, &log, orientation(stream, mate, unmapped))?;
    Ok(log.ordinal)
}

fn apply_log(
    rec: &mut RecordBuf,
    log: &ConversionLog,
    orientation: Orientation,
) -> Result<(), RecordError> {
    let mut seq = rec.sequence().as_ref().to_vec();
    let len = seq.len();
    for &offset in &log.substitutions {
        let off = offset as usize;
        if off >= len {
            return Err(RecordError::OffsetOutOfRange { offset, len });
        }
        let idx = if orientation.from_tail { len - 1 - off } else { off };
        seq[idx] = orientation.base;
    }

    if let Some(qual) = log.trailing {
        let mut quals = rec.quality_scores().as_ref().to_vec();
        let has_quals = !quals.is_empty();
        let score = qual.saturating_sub(sam::PHRED_OFFSET);
        if orientation.prepend {
            seq.insert(0, orientation.base);
            if has_quals {
                quals.insert(0, score);
            }
            let start = rec.alignment_start();
            let start = sam::prepend_base(rec.cigar_mut().as_mut(), start);
            *rec.alignment_start_mut() = start;
        } else {
            seq.push(orientation.base);
            if has_quals {
                quals.push(score);
            }
            sam::append_base(rec.cigar_mut().as_mut());
        }
        *rec.quality_scores_mut() = QualityScores::from(quals);
    }
    *rec.sequence_mut() = Sequence::from(seq);
    Ok(())
}

/// Mate positions after restoration may have moved by one base. An
/// unmapped mate 2 placed for sorting follows mate 1.
fn sync_mates(mate1: &mut RecordBuf, mate2: &mut RecordBuf) {
    if mate2.flags().is_unmapped() && mate2.alignment_start().is_some() {
        *mate2.alignment_start_mut() = mate1.alignment_start();
    }
    if same_reference(mate1) {
        *mate1.mate_alignment_start_mut() = mate2.alignment_start();
    }
    if same_reference(mate2) {
        *mate2.mate_alignment_start_mut() = mate1.alignment_start();
    }
}

/// RNEXT is `=`.
fn same_reference(rec: &RecordBuf) -> bool {
    rec.mate_reference_sequence_id().is_some()
        && rec.mate_reference_sequence_id() == rec.reference_sequence_id()
}

/// What the workers of one emit pass share.
struct EmitContext<'a> {
    stream: Stream,
    table: &'a ScoreTable,
    opts: &'a ReconcileOptions,
    /// Header records are formatted against.
    header: &'a Header,
    /// Stream-to-output reference ids, when the headers differ.
    references: Option<&'a [Option<usize>]>,
}

impl EmitContext<'_> {
    fn remap(&self, rec: &mut RecordBuf) -> Result<(), RecordError> {
        let Some(map) = self.references else {
            return Ok(());
        };
        remap_reference(map, rec.reference_sequence_id_mut())?;
        remap_reference(map, rec.mate_reference_sequence_id_mut())
    }
}

/// Judges and restores one template in place.
fn try_reconcile_template(
    template: &mut Template,
    ctx: &EmitContext,
) -> Result<Verdict, RecordError> {
    let mate1 = &mut template.first;
    if sam::is_policy_drop(mate1) {
        return Ok(Verdict::Drop(DropReason::Unmapped));
    }
    sam::check_cigar(mate1)?;
    let ordinal = conversion_log::decode_ordinal(sam::name(mate1))?;
    let verdict = match ctx.stream {
        Stream::Reverse => judge_reverse(mate1, ordinal, ctx.table, ctx.opts)?,
        Stream::Forward => judge_forward(mate1, ordinal, ctx.table, ctx.opts)?,
    };
    let Verdict::Keep { halve_mapq } = verdict else {
        return Ok(verdict);
    };

    restore_record(mate1, Mate::First, ctx.stream)?;
    if halve_mapq {
        sam::halve_mapq(mate1);
    }

    if let Some(mate2) = template.second.as_mut() {
        sam::check_cigar(mate2)?;
        if conversion_log::decode_ordinal(sam::name(mate2))? != ordinal {
            return Err(RecordError::InvalidField {
                field: "QNAME",
                value: String::from_utf8_lossy(sam::name(mate2)).into_owned(),
            });
        }
        restore_record(mate2, Mate::Second, ctx.stream)?;
        sync_mates(mate1, mate2);
    }

    for rec in template.records_mut() {
        sam::set_strand(rec, ctx.stream.strand());
        ctx.remap(rec)?;
    }
    Ok(verdict)
}

/// Appends both mates or neither.
fn write_template(
    template: &Template,
    header: &Header,
    writer: &mut noodles_sam::io::Writer<Vec<u8>>,
) -> Result<(), RecordError> {
    let mark = writer.get_ref().len();
    for rec in template.records() {
        if let Err(err) = writer.write_alignment_record(header, rec) {
            writer.get_mut().truncate(mark);
            return Err(RecordError::Unwritable(err.to_string()));
        }
    }
    Ok(())
}

fn reconcile_template(
    template: &mut Template,
    ctx: &EmitContext,
    writer: &mut noodles_sam::io::Writer<Vec<u8>>,
    stats: &mut StreamStats,
) {
    stats.templates += 1;
    let outcome = try_reconcile_template(template, ctx).and_then(|verdict| {
        if let Verdict::Keep { .. } = verdict {
            write_template(template, ctx.header, writer)?;
        }
        Ok(verdict)
    });
    match outcome {
        Ok(Verdict::Keep { .. }) => stats.kept += 1,
        Ok(Verdict::Drop(reason)) => stats.count_drop(reason),
        Err(err) => {
            log::warn!(
                "skipping {} record {}: {}",
                ctx.stream.name(),
                String::from_utf8_lossy(sam::name(&template.first)),
                err
            );
            stats.malformed += 1;
        }
    }
}

/// Enters one forward read 1 into the table. Records that cannot be
/// judged are left for the final pass to report.
fn index_template(template: &Template, table: &ScoreTable) -> bool {
    let rec = &template.first;
    if sam::is_policy_drop(rec) || sam::check_cigar(rec).is_err() {
        return false;
    }
    let (Ok(ordinal), Ok(score)) = (
        conversion_log::decode_ordinal(sam::name(rec)),
        sam::alignment_score(rec),
    ) else {
        return false;
    };
    match table.set_score(ordinal, score) {
        Ok(()) => true,
        Err(err) => {
            log::warn!(
                "forward record {}: {}",
                String::from_utf8_lossy(sam::name(rec)),
                err
            );
            false
        }
    }
}

pub struct Unindexed;
pub struct Indexed;
pub struct Resolved;

pub struct Reconciler<State> {
    forward: PathBuf,
    reverse: PathBuf,
    table: ScoreTable,
    opts: ReconcileOptions,
    pool: ThreadPool,
    stats: ReconcileStats,
    /// The reverse stream's header; set when it is written.
    output_header: Header,
    started: Instant,
    _state: PhantomData<State>,
}

impl<State> Reconciler<State> {
    pub fn table(&self) -> &ScoreTable {
        &self.table
    }

    pub fn stats(&self) -> &ReconcileStats {
        &self.stats
    }

    fn into_state<Next>(self) -> Reconciler<Next> {
        Reconciler {
            forward: self.forward,
            reverse: self.reverse,
            table: self.table,
            opts: self.opts,
            pool: self.pool,
            stats: self.stats,
            output_header: self.output_header,
            started: self.started,
            _state: PhantomData,
        }
    }

    fn pg_line(&self) -> String {
        let mut line = format!(
            "@PG\tID:msuite-reconcile\tPN:reconcile\tVN:{}",
            env!("CARGO_PKG_VERSION")
        );
        if let Some(cl) = &self.opts.command_line {
            line.push_str("\tCL:");
            line.push_str(cl);
        }
        line.push('\n');
        line
    }

    /// Streams one SAM file through the workers into `sink`.
    fn emit_pass<W: Write>(
        &mut self,
        stream: Stream,
        sink: &mut SamSink<W>,
    ) -> Result<StreamStats> {
        let path = match stream {
            Stream::Forward => self.forward.clone(),
            Stream::Reverse => self.reverse.clone(),
        };
        let mut reader = open_sam(&path)?;
        if stream == Stream::Reverse {
            let mut text = Vec::new();
            noodles_sam::io::Writer::new(&mut text)
                .write_header(reader.header())
                .context("failed to format the output header")?;
            text.extend_from_slice(self.pg_line().as_bytes());
            sink.write_bytes(&text)?;
            self.output_header = reader.header().clone();
        }
        let references = reference_map(reader.header(), &self.output_header);

        let ctx = EmitContext {
            stream,
            table: &self.table,
            opts: &self.opts,
            header: &self.output_header,
            references: references.as_deref(),
        };
        let mut total = StreamStats::default();
        loop {
            let mut batch = reader.load_batch(self.opts.batch_size)?;
            if batch.is_empty() {
                break;
            }
            let results = threadpool::run_chunks(&self.pool, &mut batch, |_, templates| {
                let mut writer = noodles_sam::io::Writer::new(Vec::new());
                let mut stats = StreamStats::default();
                for template in templates {
                    reconcile_template(template, &ctx, &mut writer, &mut stats);
                }
                (writer.into_inner(), stats)
            });
            for (out, stats) in results {
                sink.write_bytes(&out)?;
                total += stats;
            }
            reports::report_progress("templates", total.templates);
        }
        total.malformed += reader.malformed();
        self.stats.orphan_mates += reader.orphans();
        log::info!(
            "{} stream: {} templates, {} kept, {} ambiguous, {} low score, {} unmapped, {} malformed",
            stream.name(),
            total.templates,
            total.kept,
            total.ambiguous,
            total.low_score,
            total.unmapped,
            total.malformed
        );
        Ok(total)
    }
}

impl Reconciler<Unindexed> {
    /// Prepares a run over `forward` and `reverse` for reads numbered
    /// `1..=total_reads`.
    pub fn new(
        forward: &Path,
        reverse: &Path,
        total_reads: u64,
        opts: ReconcileOptions,
    ) -> Result<Self> {
        for path in [forward, reverse] {
            if !path.is_file() {
                return Err(RunError::MissingInput {
                    path: path.to_path_buf(),
                }
                .into());
            }
        }
        let table = ScoreTable::new(total_reads)?;
        let pool = threadpool::build_pool(opts.threads)?;
        Ok(Reconciler {
            forward: forward.to_path_buf(),
            reverse: reverse.to_path_buf(),
            table,
            opts,
            pool,
            stats: ReconcileStats {
                total_reads,
                ..ReconcileStats::default()
            },
            output_header: Header::default(),
            started: Instant::now(),
            _state: PhantomData,
        })
    }

    /// Pass 1: scores of forward read 1 alignments. Unreadable records are
    /// reported by the final pass.
    pub fn index(mut self) -> Result<Reconciler<Indexed>> {
        let mut reader = open_sam(&self.forward)?.quiet();
        loop {
            let batch = reader.load_batch(self.opts.batch_size)?;
            if batch.is_empty() {
                break;
            }
            let table = &self.table;
            let counts = threadpool::run_partitioned(&self.pool, batch.len(), |range| {
                batch[range]
                    .iter()
                    .filter(|template| index_template(template, table))
                    .count() as u64
            });
            self.stats.indexed += counts.iter().sum::<u64>();
        }
        log::info!("indexed {} forward alignments", self.stats.indexed);
        Ok(self.into_state())
    }
}

impl Reconciler<Indexed> {
    /// Pass 2: writes the header and the reverse stream's survivors.
    pub fn resolve<W: Write>(mut self, sink: &mut SamSink<W>) -> Result<Reconciler<Resolved>> {
        self.stats.crick = self.emit_pass(Stream::Reverse, sink)?;
        Ok(self.into_state())
    }
}

impl Reconciler<Resolved> {
    /// Pass 3: writes the forward stream's survivors.
    pub fn finish<W: Write>(mut self, sink: &mut SamSink<W>) -> Result<ReconcileStats> {
        self.stats.watson = self.emit_pass(Stream::Forward, sink)?;
        sink.flush()?;
        self.stats.elapsed_secs = self.started.elapsed().as_secs_f64();
        Ok(self.stats)
    }
}

/// Runs all three passes, sizing the table from the trimming summary.
pub fn run_reconcile(
    forward: &Path,
    reverse: &Path,
    trim_log: &Path,
    output: &Path,
    opts: ReconcileOptions,
) -> Result<ReconcileStats> {
    let total_reads = reports::read_total_reads(trim_log)?;
    let reconciler = Reconciler::new(forward, reverse, total_reads, opts)?;

    let file = File::create(output).map_err(|source| RunError::Write {
        path: output.to_path_buf(),
        source,
    })?;
    let mut sink = SamSink::new(BufWriter::new(file), output);

    let stats = reconciler.index()?.resolve(&mut sink)?.finish(&mut sink)?;
    let emitted = stats.watson.kept + stats.crick.kept;
    reports::report_stats("reads", stats.elapsed_secs, total_reads, emitted);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "@HD\tVN:1.6\n@SQ\tSN:chr1\tLN:1000\n";

    fn opts() -> ReconcileOptions {
        ReconcileOptions {
            threads: 2,
            batch_size: 3,
            ..ReconcileOptions::default()
        }
    }

    fn header() -> Header {
        HEADER.parse().unwrap()
    }

    fn line(qname: &str, mapq: u8, cigar: &str, seq: &str, tags: &str) -> String {
        let quals = "I".repeat(seq.len());
        let mut line = format!("{qname}\t0\tchr1\t100\t{mapq}\t{cigar}\t*\t0\t0\t{seq}\t{quals}");
        if !tags.is_empty() {
            line.push('\t');
            line.push_str(tags);
        }
        line
    }

    fn templates(lines: &[&str]) -> Vec<Template> {
        let mut text = String::from(HEADER);
        for line in lines {
            text.push_str(line);
            text.push('\n');
        }
        let mut reader = TemplateReader::new(text.as_bytes(), Path::new("test.sam")).unwrap();
        reader.load_batch(lines.len()).unwrap()
    }

    fn single(line: String) -> Template {
        templates(&[&line]).remove(0)
    }

    fn pair(first: &str, second: &str) -> Template {
        let template = templates(&[first, second]).remove(0);
        assert!(template.second.is_some());
        template
    }

    fn judge(stream: Stream, template: &Template, table: &ScoreTable) -> (String, StreamStats) {
        let opts = opts();
        let header = header();
        let ctx = EmitContext {
            stream,
            table,
            opts: &opts,
            header: &header,
            references: None,
        };
        let mut template = template.clone();
        let mut writer = noodles_sam::io::Writer::new(Vec::new());
        let mut stats = StreamStats::default();
        reconcile_template(&mut template, &ctx, &mut writer, &mut stats);
        (String::from_utf8(writer.into_inner()).unwrap(), stats)
    }

    #[test]
    fn test_forward_wins_and_is_halved() {
        let table = ScoreTable::new(10).unwrap();
        let forward = single(line("7+#r7", 30, "4M", "ACGT", "AS:i:30"));
        let reverse = single(line("7+#r7", 30, "4M", "ACGT", "AS:i:12"));
        assert!(index_template(&forward, &table));

        let (out, stats) = judge(Stream::Reverse, &reverse, &table);
        assert!(out.is_empty());
        assert_eq!(stats.ambiguous, 1);
        assert_eq!(table.get(7).unwrap(), ScoreState::AmbiguousOtherWins);

        let (out, stats) = judge(Stream::Forward, &forward, &table);
        assert_eq!(stats.kept, 1);
        assert_eq!(out, "r7\t0\tchr1\t100\t15\t4M\t*\t0\t0\tACGT\tIIII\tXG:Z:CT\n");
    }

    #[test]
    fn test_tie_drops_both() {
        let table = ScoreTable::new(10).unwrap();
        let forward = single(line("3+#r3", 40, "4M", "ACGT", "AS:i:20"));
        let reverse = single(line("3+#r3", 40, "4M", "ACGT", "AS:i:20"));
        index_template(&forward, &table);

        let (out, _) = judge(Stream::Reverse, &reverse, &table);
        assert!(out.is_empty());
        assert_eq!(table.get(3).unwrap(), ScoreState::Discard);
        let (out, stats) = judge(Stream::Forward, &forward, &table);
        assert!(out.is_empty());
        assert_eq!(stats.ambiguous, 1);
    }

    #[test]
    fn test_reverse_wins() {
        let table = ScoreTable::new(10).unwrap();
        let forward = single(line("4+#r4", 40, "4M", "ACGT", "AS:i:-10"));
        let reverse = single(line("4+#r4", 40, "4M", "ACGT", "AS:i:-2"));
        index_template(&forward, &table);

        let (out, stats) = judge(Stream::Reverse, &reverse, &table);
        assert_eq!(stats.kept, 1);
        assert_eq!(out, "r4\t0\tchr1\t100\t20\t4M\t*\t0\t0\tACGT\tIIII\tXG:Z:GA\n");
        assert_eq!(table.get(4).unwrap(), ScoreState::Discard);

        let (out, _) = judge(Stream::Forward, &forward, &table);
        assert!(out.is_empty());
    }

    #[test]
    fn test_ambiguous_winner_with_low_mapq_dropped() {
        let table = ScoreTable::new(10).unwrap();
        index_template(&single(line("5+#r5", 1, "4M", "ACGT", "AS:i:1")), &table);
        let reverse = single(line("5+#r5", 1, "4M", "ACGT", "AS:i:9"));
        let (out, stats) = judge(Stream::Reverse, &reverse, &table);
        assert!(out.is_empty());
        assert_eq!(stats.low_score, 1);
        assert_eq!(table.get(5).unwrap(), ScoreState::Discard);
    }

    #[test]
    fn test_unique_low_mapq_rescue() {
        let table = ScoreTable::new(10).unwrap();
        let without_xs = single(line("1+#r1", 0, "4M", "ACGT", "AS:i:-5"));
        let (out, stats) = judge(Stream::Reverse, &without_xs, &table);
        assert_eq!(stats.kept, 1);
        assert!(out.starts_with("r1\t0\tchr1\t100\t0\t4M"));

        let with_xs = single(line("2+#r2", 1, "4M", "ACGT", "AS:i:-5\tXS:i:-5"));
        let (out, stats) = judge(Stream::Reverse, &with_xs, &table);
        assert!(out.is_empty());
        assert_eq!(stats.low_score, 1);
    }

    #[test]
    fn test_forward_restoration_appends_trailing_c() {
        let table = ScoreTable::new(10).unwrap();
        let forward = single(line("1+H|1;5#read1", 40, "8M", "ATGTTTGA", "AS:i:0"));
        index_template(&forward, &table);
        let (out, _) = judge(Stream::Forward, &forward, &table);
        assert_eq!(
            out,
            "read1\t0\tchr1\t100\t40\t9M\t*\t0\t0\tACGTTCGAC\tIIIIIIIIH\tXG:Z:CT\n"
        );
    }

    #[test]
    fn test_reverse_restoration_prepends_trailing_g() {
        // Read ACGTTCGAC, converted to ATGTTTGA, aligned reverse-complemented.
        let table = ScoreTable::new(10).unwrap();
        let reverse = single(line("1+H|1;5#read1", 40, "8M", "TCAAACAT", "AS:i:0"));
        let (out, _) = judge(Stream::Reverse, &reverse, &table);
        assert_eq!(
            out,
            "read1\t0\tchr1\t99\t40\t9M\t*\t0\t0\tGTCGAACGT\tHIIIIIIII\tXG:Z:GA\n"
        );
    }

    #[test]
    fn test_soft_clip_absorbs_trailing_base() {
        let table = ScoreTable::new(10).unwrap();
        let reverse = single(line("1+H|#r", 40, "2S6M", "TCAAACAT", "AS:i:0"));
        let (out, _) = judge(Stream::Reverse, &reverse, &table);
        assert!(out.starts_with("r\t0\tchr1\t100\t40\t3S6M\t"));
    }

    #[test]
    fn test_unmapped_mate1_keeps_sequencing_orientation() {
        // In either stream an unplaced read 1 is indexed from its head and
        // gets its C back at the end.
        let mut rec = single(
            "1+H|1;5#r\t4\t*\t0\t0\t*\t*\t0\t0\tATGTTTGA\tIIIIIIII".to_string(),
        )
        .first;
        assert_eq!(restore_record(&mut rec, Mate::First, Stream::Reverse), Ok(1));
        assert_eq!(sam::name(&rec), b"r");
        assert_eq!(rec.sequence().as_ref(), b"ACGTTCGAC");
        assert_eq!(rec.quality_scores().as_ref().last(), Some(&(b'H' - sam::PHRED_OFFSET)));
        assert!(rec.alignment_start().is_none());
        assert!(rec.cigar().as_ref().is_empty());
    }

    #[test]
    fn test_malformed_records_are_counted() {
        let table = ScoreTable::new(2).unwrap();
        let cases = [
            line("1+#r", 40, "4N", "ACGT", "AS:i:0"),
            line("1+zz#r", 40, "4M", "ACGT", "AS:i:0"),
            line("1+#r", 40, "4M", "ACGT", ""),
            line("9+#r", 40, "4M", "ACGT", "AS:i:0"),
            line("1+10#r", 40, "4M", "ACGT", "AS:i:0"),
        ];
        for case in cases {
            let (out, stats) = judge(Stream::Reverse, &single(case), &table);
            assert!(out.is_empty());
            assert_eq!(stats.malformed, 1);
        }
    }

    #[test]
    fn test_unmapped_is_policy_drop() {
        let table = ScoreTable::new(2).unwrap();
        let unmapped = single("1+#r\t4\t*\t0\t0\t*\t*\t0\t0\tACGT\tIIII\tYT:Z:UU".to_string());
        assert!(!index_template(&unmapped, &table));
        let (out, stats) = judge(Stream::Forward, &unmapped, &table);
        assert!(out.is_empty());
        assert_eq!(stats.unmapped, 1);
    }

    #[test]
    fn test_pair_restored_and_mate_positions_synced() {
        // Read 1 CCGA (cpg: no trailing C, CG at 1) emitted as CTGA.
        // Read 2 GACGTT (cpg: leading G removed, CG at 2) emitted as ACATT,
        // reported reverse-complemented as AATGT.
        let table = ScoreTable::new(10).unwrap();
        let template = pair(
            "2+1#p\t99\tchr1\t100\t42\t4M\t=\t200\t106\tCTGA\tIIII\tAS:i:0",
            "2+F|2#p\t147\tchr1\t200\t42\t5M\t=\t100\t-106\tAATGT\tJJJJJ\tAS:i:0",
        );
        index_template(&template, &table);
        let (out, stats) = judge(Stream::Forward, &template, &table);
        assert_eq!(stats.kept, 1);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines[0],
            "p\t99\tchr1\t100\t42\t4M\t=\t200\t106\tCCGA\tIIII\tXG:Z:CT"
        );
        // Read 2 is reverse-complemented here: tail-indexed, removed G
        // appended as C.
        assert_eq!(
            lines[1],
            "p\t147\tchr1\t200\t42\t6M\t=\t100\t-106\tAACGTC\tJJJJJF\tXG:Z:CT"
        );
    }

    #[test]
    fn test_reverse_pair_shifts_mate_position() {
        let table = ScoreTable::new(10).unwrap();
        let template = pair(
            "3+H|#q\t83\tchr1\t150\t42\t4M\t=\t100\t-54\tTTTT\tIIII\tAS:i:0",
            "3+#q\t163\tchr1\t100\t42\t4M\t=\t150\t54\tAAAA\tIIII\tAS:i:0",
        );
        let (out, _) = judge(Stream::Reverse, &template, &table);
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[0].starts_with("q\t83\tchr1\t149\t42\t5M\t=\t100\t"));
        assert!(lines[1].starts_with("q\t163\tchr1\t100\t42\t4M\t=\t149\t"));
    }

    #[test]
    fn test_reverse_mate2_restored_from_head() {
        // Read 2 GACGTT (cpg: leading G removed, CG at 2) emitted as ACATT
        // and aligned as is on the G>A genome.
        let table = ScoreTable::new(10).unwrap();
        let template = pair(
            "3+#q\t83\tchr1\t300\t42\t4M\t=\t200\t-104\tTTTT\tIIII\tAS:i:0",
            "3+F|2#q\t163\tchr1\t200\t42\t5M\t=\t300\t104\tACATT\tJJJJJ\tAS:i:0",
        );
        let (out, stats) = judge(Stream::Reverse, &template, &table);
        assert_eq!(stats.kept, 1);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines[0],
            "q\t83\tchr1\t300\t42\t4M\t=\t199\t-104\tTTTT\tIIII\tXG:Z:GA"
        );
        assert_eq!(
            lines[1],
            "q\t163\tchr1\t199\t42\t6M\t=\t300\t104\tGACGTT\tFJJJJJ\tXG:Z:GA"
        );
    }

    #[test]
    fn test_unmapped_mate2_follows_mate1() {
        let table = ScoreTable::new(10).unwrap();
        let template = pair(
            "4+H|#u\t89\tchr1\t100\t42\t4M\t=\t100\t0\tTTTT\tIIII\tAS:i:0",
            "4+F|2#u\t165\tchr1\t100\t0\t*\t=\t100\t0\tACATT\tJJJJJ",
        );
        let (out, stats) = judge(Stream::Reverse, &template, &table);
        assert_eq!(stats.kept, 1);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines[0],
            "u\t89\tchr1\t99\t42\t5M\t=\t99\t0\tGTTTT\tHIIII\tXG:Z:GA"
        );
        // Unplaced: head-indexed, G put back in front, CIGAR untouched.
        assert_eq!(
            lines[1],
            "u\t165\tchr1\t99\t0\t*\t=\t99\t0\tGACGTT\tFJJJJJ\tXG:Z:GA"
        );
    }

    #[test]
    fn test_mate_ordinal_mismatch_is_malformed() {
        let table = ScoreTable::new(10).unwrap();
        let template = pair(
            "2+#p\t99\tchr1\t100\t42\t4M\t=\t200\t104\tCTGA\tIIII\tAS:i:0",
            "3+#p\t147\tchr1\t200\t42\t4M\t=\t100\t-104\tAATG\tJJJJ\tAS:i:0",
        );
        let (out, stats) = judge(Stream::Reverse, &template, &table);
        assert!(out.is_empty());
        assert_eq!(stats.malformed, 1);
    }

    #[test]
    fn test_template_reader_groups_mates() {
        let text = "@HD\tVN:1.0\n@SQ\tSN:chr1\tLN:1000\n\
                    1+#a\t99\tchr1\t1\t1\t1M\t=\t5\t5\tA\tI\n\
                    1+#a\t147\tchr1\t5\t1\t1M\t=\t1\t-5\tA\tI\n\
                    2+#b\t0\tchr1\t1\t1\t1M\t*\t0\t0\tA\tI\n\
                    3+#c\t128\tchr1\t1\t1\t1M\t*\t0\t0\tA\tI\n\
                    4+#d\t0\tchr1\t1\t1\t1M\t*\t0\t0\tA\tI\n";
        let mut reader = TemplateReader::new(text.as_bytes(), Path::new("test.sam")).unwrap();
        assert_eq!(reader.header().reference_sequences().len(), 1);

        let batch = reader.load_batch(2).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch[0].second.is_some());
        assert!(batch[1].second.is_none());

        let batch = reader.load_batch(2).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(sam::name(&batch[0].first), b"4+#d");
        assert_eq!(reader.orphans(), 1);
        assert!(reader.load_batch(2).unwrap().is_empty());
    }

    #[test]
    fn test_non_utf8_record_skipped() {
        let mut text = HEADER.as_bytes().to_vec();
        text.extend_from_slice(b"1+#a\t0\tchr1\t1\t1\t1M\t*\t0\t0\tA\tI\n");
        text.extend_from_slice(b"2+#b\t0\xff\tchr1\t1\t1\t1M\t*\t0\t0\tA\tI\n");
        text.extend_from_slice(b"3+#c\t0\tchr1\t1\t1\t1M\t*\t0\t0\tA\tI\n");
        let mut reader = TemplateReader::new(text.as_slice(), Path::new("test.sam")).unwrap();
        let batch = reader.load_batch(10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(sam::name(&batch[0].first), b"1+#a");
        assert_eq!(sam::name(&batch[1].first), b"3+#c");
        assert_eq!(reader.malformed(), 1);
    }

    #[test]
    fn test_bad_header_is_fatal() {
        let text = "@HD\tVN:1.0\n@SQ\tSN:chr1\tLN:zero\n";
        let err = TemplateReader::new(text.as_bytes(), Path::new("bad.sam"))
            .err()
            .unwrap();
        assert_eq!(err.downcast_ref::<RunError>().unwrap().exit_code(), 11);
    }

    #[test]
    fn test_reference_remapped_to_output_header() {
        let reverse: Header = "@SQ\tSN:chr1\tLN:1000\n@SQ\tSN:chr2\tLN:1000\n"
            .parse()
            .unwrap();
        let forward: Header = "@SQ\tSN:chr2\tLN:1000\n@SQ\tSN:chr3\tLN:10\n"
            .parse()
            .unwrap();
        assert_eq!(reference_map(&reverse, &reverse), None);
        let map = reference_map(&forward, &reverse).unwrap();
        assert_eq!(map, vec![Some(1), None]);

        let mut id = Some(0);
        remap_reference(&map, &mut id).unwrap();
        assert_eq!(id, Some(1));
        let mut unknown = Some(1);
        assert_eq!(
            remap_reference(&map, &mut unknown),
            Err(RecordError::UnknownReference(1))
        );
    }

    #[test]
    fn test_passes_in_order_never_double_keep() {
        let dir = tempfile::tempdir().unwrap();
        let forward = dir.path().join("CG2TG.sam");
        let reverse = dir.path().join("CG2CA.sam");
        let header = "@HD\tVN:1.0\tSO:unsorted\n@SQ\tSN:chr1\tLN:1000\n";
        let mut forward_text = String::from(header);
        let mut reverse_text = String::from("@HD\tVN:1.0\tSO:unsorted\n@SQ\tSN:chr1\tLN:1000\n@PG\tID:bowtie2\n");
        // Ordinal i: forward score i, reverse score 5.
        for i in 1..=9u32 {
            forward_text.push_str(&line(&format!("{:x}+#r{}", i, i), 40, "4M", "ACGT", &format!("AS:i:{}", i)));
            forward_text.push('\n');
            reverse_text.push_str(&line(&format!("{:x}+#r{}", i, i), 40, "4M", "ACGT", "AS:i:5"));
            reverse_text.push('\n');
        }
        let mut reverse_bytes = reverse_text.into_bytes();
        reverse_bytes.extend_from_slice(b"a+#r10\t0\xff\tchr1\t100\t40\t4M\t*\t0\t0\tACGT\tIIII\tAS:i:5\n");
        std::fs::write(&forward, forward_text).unwrap();
        std::fs::write(&reverse, reverse_bytes).unwrap();

        let reconciler = Reconciler::new(&forward, &reverse, 10, opts()).unwrap();
        let mut sink = SamSink::new(Vec::new(), Path::new("merged.sam"));
        let indexed = reconciler.index().unwrap();
        assert_eq!(indexed.stats().indexed, 9);
        let resolved = indexed.resolve(&mut sink).unwrap();
        assert_eq!(resolved.table().get(5).unwrap(), ScoreState::Discard);
        let stats = resolved.finish(&mut sink).unwrap();

        let merged = String::from_utf8(sink.into_inner()).unwrap();
        let records: Vec<&str> = merged.lines().filter(|l| !l.starts_with('@')).collect();
        assert_eq!(records.len(), 8);
        let mut names: Vec<&str> = records.iter().map(|r| r.split('\t').next().unwrap()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8);
        assert!(!names.contains(&"r5"));

        assert_eq!(stats.crick.kept, 4);
        assert_eq!(stats.crick.malformed, 1);
        assert_eq!(stats.watson.kept, 4);
        assert!(merged.starts_with("@HD\tVN:1.0\tSO:unsorted\n@SQ\tSN:chr1\tLN:1000\n@PG\tID:bowtie2\n@PG\tID:msuite-reconcile"));
    }
}
