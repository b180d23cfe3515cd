use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use env_logger::Env;

use msuite_rs::errors::exit_with_error;
use msuite_rs::reconcile::{run_reconcile, ReconcileOptions};
use msuite_rs::reports;
use msuite_rs::threadpool::BATCH_SIZE;

/// Restores converted reads in two alignment outputs and merges them,
/// keeping at most one alignment per read.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Options {
    /// Alignments against the C>T converted genome
    #[clap(value_parser)]
    forward_sam: PathBuf,

    /// Alignments against the G>A converted genome
    #[clap(value_parser)]
    reverse_sam: PathBuf,

    /// Trimming summary written by preprocess
    #[clap(value_parser)]
    trim_log: PathBuf,

    /// Merged SAM output
    #[clap(value_parser)]
    output: PathBuf,

    /// Number of threads (0 for all cores)
    #[clap(short = 't', long, default_value_t = 1, value_parser)]
    threads: usize,

    /// Minimum MAPQ for the winner of a read aligned in both streams
    #[clap(long, default_value_t = 2, value_parser)]
    min_score_ambiguous: u8,

    /// Minimum MAPQ for a read aligned in one stream with a second-best hit
    #[clap(long, default_value_t = 2, value_parser)]
    min_score_unique: u8,

    /// Write run statistics as JSON to this file
    #[clap(long, value_parser)]
    json_summary: Option<PathBuf>,
}

fn run(opts: Options) -> Result<()> {
    reports::remove_existing_output(&opts.output)?;

    let reconcile_opts = ReconcileOptions {
        min_score_ambiguous: opts.min_score_ambiguous,
        min_score_unique: opts.min_score_unique,
        threads: opts.threads,
        batch_size: BATCH_SIZE,
        command_line: Some(std::env::args().collect::<Vec<_>>().join(" ")),
    };
    let stats = run_reconcile(
        &opts.forward_sam,
        &opts.reverse_sam,
        &opts.trim_log,
        &opts.output,
        reconcile_opts,
    )?;

    println!("WATSON\t{}", stats.watson.kept);
    println!("CRICK\t{}", stats.crick.kept);

    if let Some(path) = &opts.json_summary {
        reports::write_json_summary(path, &stats)?;
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
