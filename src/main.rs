//! Compare a file of probands against a sample and write one result row per
//! proband, in input order.
//!
//! Three arrangements are supported: plaintext against plaintext, hashed
//! against hashed (`--hashed`), and hashed probands against a locally-held
//! plaintext sample (`--hashed-probands`), where the sample is hashed in
//! memory under the shared key before any comparison. The calibration file
//! is needed in every mode because error rates and the prior never travel
//! with the records.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use rayon::prelude::*;

use idlink::calibration::Calibration;
use idlink::decision::DecisionConfig;
use idlink::driver::{run_matching, CancelToken};
use idlink::engine::Sample;
use idlink::error::LinkError;
use idlink::hashing::{resolve_key, KeyedHasher};
use idlink::io::{build_persons, HashedReader, PlaintextReader, ResultWriter};
use idlink::person::Person;
use idlink::progress::{create_spinner, format_duration, log_phase, set_log_only};
use idlink::safety::validate_output_path;

/// Probabilistic identity linkage: find each proband's best candidate in a
/// sample, or conclude that none is good enough.
#[derive(Parser)]
#[command(name = "idlink")]
#[command(about = "Compare proband records against a sample and score candidate matches")]
struct Args {
    /// Proband records (CSV; JSONL with --hashed or --hashed-probands)
    #[arg(long)]
    probands: PathBuf,

    /// Sample records the probands are looked up in (CSV, or JSONL with --hashed)
    #[arg(long)]
    sample: PathBuf,

    /// Output path for the comparison result CSV
    #[arg(long)]
    output: PathBuf,

    /// Calibration tables (JSON)
    #[arg(long)]
    calibration: PathBuf,

    /// Treat both inputs as hashed person JSONL instead of plaintext CSV
    #[arg(long, conflicts_with = "hashed_probands")]
    hashed: bool,

    /// Probands are hashed JSONL but the sample is plaintext CSV; the
    /// sample is hashed in memory under --key before comparison
    #[arg(long)]
    hashed_probands: bool,

    /// Secret key the probands were hashed under (with --hashed-probands).
    /// Never logged, never emitted.
    #[arg(long, requires = "hashed_probands")]
    key: Option<String>,

    /// Use the well-known development key instead of --key. Development
    /// fixtures only; provides no privacy.
    #[arg(long, requires = "hashed_probands")]
    allow_default_key: bool,

    /// Significant figures the proband side kept on its frequencies; the
    /// sample is rounded identically (with --hashed-probands)
    #[arg(long, default_value = "3")]
    sig_figs: u32,

    /// Minimum posterior log odds for an accepted match (θ₁)
    #[arg(long, default_value = "5.0")]
    min_log_odds: f64,

    /// Required log-odds margin over the second-best candidate (θ₂)
    #[arg(long, default_value = "10.0")]
    min_superiority: f64,

    /// Worker threads; 0 = one per core, 1 = serial
    #[arg(long, default_value = "0")]
    workers: usize,

    /// Scan the full sample for every proband instead of blocking on
    /// date-of-birth overlap
    #[arg(long)]
    no_blocking: bool,

    /// Disable progress bars, use log output only (for background runs)
    #[arg(long)]
    log_only: bool,

    /// Export run statistics to a JSON file
    #[arg(long)]
    export_stats: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();
    set_log_only(args.log_only);
    if let Err(e) = run(&args) {
        eprintln!("error: {e:#}");
        let code = e.downcast_ref::<LinkError>().map_or(1, LinkError::exit_code);
        std::process::exit(code);
    }
}

fn run(args: &Args) -> Result<()> {
    let started = Instant::now();
    validate_output_path(&args.output, &[&args.probands, &args.sample, &args.calibration])?;
    if args.sig_figs == 0 {
        return Err(LinkError::config("--sig-figs must be at least 1").into());
    }

    let cal = Calibration::from_path(&args.calibration)?;
    log_phase("CAL", &format!("calibration loaded from {}", args.calibration.display()));

    let spinner = create_spinner("Loading sample");
    let load_start = Instant::now();
    let sample_persons = load_sample(args, &cal)?;
    spinner.finish_and_clear();
    log_phase(
        "SAMPLE",
        &format!(
            "loaded {} candidates ({})",
            sample_persons.len(),
            format_duration(load_start.elapsed())
        ),
    );
    let sample = Sample::new(sample_persons, !args.no_blocking);

    let decision = DecisionConfig {
        min_log_odds: args.min_log_odds,
        min_superiority: args.min_superiority,
        ..Default::default()
    };
    let cancel = CancelToken::new();

    let output = File::create(&args.output)
        .map_err(|e| LinkError::input(format!("cannot create {}: {e}", args.output.display())))?;
    let mut writer = ResultWriter::new(BufWriter::new(output))?;

    let progress = create_spinner("Comparing probands");
    let hashed_probands = args.hashed || args.hashed_probands;
    let stats = if hashed_probands {
        let probands = HashedReader::open(&args.probands)?;
        run_matching(probands, &sample, &cal, &decision, args.workers, &cancel, |outcome| {
            progress.inc(1);
            writer.write_outcome(outcome)
        })?
    } else {
        let probands = PlaintextReader::open(&args.probands)?
            .map(|record| record.and_then(|raw| Person::from_record(&raw, &cal)));
        run_matching(probands, &sample, &cal, &decision, args.workers, &cancel, |outcome| {
            progress.inc(1);
            writer.write_outcome(outcome)
        })?
    };
    writer.flush()?;
    progress.finish_and_clear();

    stats.log();
    if let Some(path) = &args.export_stats {
        stats.write_to_file(path)?;
    }
    log_phase(
        "DONE",
        &format!(
            "{} probands, {} matched, {} unmatchable ({})",
            stats.probands,
            stats.matched,
            stats.unmatchable,
            format_duration(started.elapsed())
        ),
    );
    Ok(())
}

/// Load the sample in whichever form the mode dictates. With
/// `--hashed-probands` the plaintext sample is hashed here, token for
/// token, so both sides of every comparison are in hashed form.
fn load_sample(args: &Args, cal: &Calibration) -> Result<Vec<Person>, LinkError> {
    if args.hashed {
        return HashedReader::open(&args.sample)?.collect();
    }
    let records = PlaintextReader::open(&args.sample)?.collect::<Result<Vec<_>, _>>()?;
    let persons = build_persons(records, cal)?;
    if !args.hashed_probands {
        return Ok(persons);
    }
    let key = resolve_key(args.key.as_deref(), args.allow_default_key)?;
    let hasher = KeyedHasher::new(key)?;
    persons
        .par_iter()
        .map(|p| p.to_hashed(&hasher, args.sig_figs, false))
        .collect()
}
