use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use env_logger::Env;

use msuite_rs::converter::ConversionMode;
use msuite_rs::errors::{exit_with_error, RunError};
use msuite_rs::preprocess::{run_preprocess, OutputPaths, PreprocessOptions};
use msuite_rs::reports;
use msuite_rs::threadpool::BATCH_SIZE;
use msuite_rs::trimmer::{AdapterKit, TrimOptions};

/// Per-cycle statistics, quality and adapter trimming, and C>T (G>A)
/// conversion of reads ahead of conversion-aware alignment.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Options {
    /// Read 1 FASTQ file(s), plain or gzipped; separate several with ','
    #[clap(short = '1', long, value_parser)]
    read1: String,

    /// Read 2 FASTQ file(s) for paired-end data
    #[clap(short = '2', long, value_parser)]
    read2: Option<String>,

    /// Sequencing cycles; longer reads are truncated
    #[clap(short, long, value_parser)]
    cycle: usize,

    /// Prefix of the output files
    #[clap(short = 'o', long, value_parser)]
    out_prefix: String,

    /// Conversion mode
    #[clap(short, long, value_enum, default_value_t = ConversionMode::None)]
    mode: ConversionMode,

    /// Number of threads (0 for all cores)
    #[clap(short = 't', long, default_value_t = 1, value_parser)]
    threads: usize,

    /// Reads shorter than this after trimming are dropped
    #[clap(short = 'l', long, default_value_t = 36, value_parser)]
    min_length: usize,

    /// Quality threshold as a raw ASCII value (53 is Q20 in phred+33)
    #[clap(short = 'q', long, default_value_t = 53, value_parser)]
    min_quality: u8,

    /// Library kit, selects the adapter sequences
    #[clap(short = 'k', long, value_enum, default_value_t = AdapterKit::Illumina)]
    kit: AdapterKit,

    /// Write run statistics as JSON to this file
    #[clap(long, value_parser)]
    json_summary: Option<PathBuf>,
}

fn run(opts: Options) -> Result<()> {
    if opts.cycle == 0 {
        return Err(RunError::Usage("cycle must be a positive number".to_string()).into());
    }

    let outputs = OutputPaths::from_prefix(&opts.out_prefix, opts.read2.is_some());
    for path in outputs.all() {
        reports::remove_existing_output(path)?;
    }

    let preprocess_opts = PreprocessOptions {
        mode: opts.mode,
        cycle: opts.cycle,
        trim: TrimOptions {
            min_length: opts.min_length,
            min_quality: opts.min_quality,
            kit: opts.kit,
        },
        threads: opts.threads,
        batch_size: BATCH_SIZE,
    };
    let summary = run_preprocess(
        &opts.read1,
        opts.read2.as_deref(),
        &outputs,
        &preprocess_opts,
    )?;

    if let Some(path) = &opts.json_summary {
        reports::write_json_summary(path, &summary)?;
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let opts = Options::parse();
    if let Err(err) = run(opts) {
        exit_with_error(&err);
    }
}
