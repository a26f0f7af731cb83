//! Derive hashed person records (JSONL) from a plaintext record CSV.
//!
//! Every comparison token is keyed-hashed and every frequency rounded, so
//! the output can be shared with a site holding the same key without
//! exchanging plaintext identifiers.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use rayon::prelude::*;

use idlink::calibration::Calibration;
use idlink::error::LinkError;
use idlink::hashing::{resolve_key, KeyedHasher};
use idlink::io::{build_persons, read_raw_records, write_hashed_person};
use idlink::person::Person;
use idlink::progress::{create_progress_bar, format_duration, log_phase, set_log_only};
use idlink::safety::validate_output_path;

/// Produce the pseudonymised form of a plaintext record file.
#[derive(Parser)]
#[command(name = "idlink-hash")]
#[command(about = "Derive keyed-hashed person records from a plaintext record CSV")]
struct Args {
    /// Plaintext record CSV
    #[arg(long)]
    input: PathBuf,

    /// Output path for the hashed person JSONL
    #[arg(long)]
    output: PathBuf,

    /// Calibration tables (JSON); frequencies are resolved before hashing
    #[arg(long)]
    calibration: PathBuf,

    /// Secret key for the keyed hash. Never logged, never emitted.
    #[arg(long)]
    key: Option<String>,

    /// Use the well-known development key instead of --key. Development
    /// fixtures only; provides no privacy.
    #[arg(long)]
    allow_default_key: bool,

    /// Significant figures retained on emitted frequencies
    #[arg(long, default_value = "3")]
    sig_figs: u32,

    /// Carry the opaque other_info field through into the hashed records
    #[arg(long)]
    include_other_info: bool,

    /// Worker threads for hashing; 0 = one per core
    #[arg(long, default_value = "0")]
    workers: usize,

    /// Disable progress bars, use log output only (for background runs)
    #[arg(long)]
    log_only: bool,
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
    validate_output_path(&args.output, &[&args.input, &args.calibration])?;

    let key = resolve_key(args.key.as_deref(), args.allow_default_key)?;
    let hasher = KeyedHasher::new(key)?;
    if args.sig_figs == 0 {
        return Err(LinkError::config("--sig-figs must be at least 1").into());
    }

    if args.workers > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.workers)
            .build_global()
            .map_err(|e| LinkError::config(format!("cannot size worker pool: {e}")))?;
    }

    let cal = Calibration::from_path(&args.calibration)?;

    let read_start = Instant::now();
    let input = File::open(&args.input)
        .map_err(|e| LinkError::input(format!("cannot open {}: {e}", args.input.display())))?;
    let records = read_raw_records(input)?;
    log_phase(
        "READ",
        &format!("{} records ({})", records.len(), format_duration(read_start.elapsed())),
    );

    let hash_start = Instant::now();
    let persons = build_persons(records, &cal)?;
    let hashed: Vec<Person> = persons
        .par_iter()
        .map(|p| p.to_hashed(&hasher, args.sig_figs, args.include_other_info))
        .collect::<Result<Vec<_>, _>>()?;
    log_phase(
        "HASH",
        &format!("{} persons hashed ({})", hashed.len(), format_duration(hash_start.elapsed())),
    );

    let output = File::create(&args.output)
        .map_err(|e| LinkError::input(format!("cannot create {}: {e}", args.output.display())))?;
    let mut sink = BufWriter::new(output);
    let pb = create_progress_bar(hashed.len() as u64, "Writing hashed records");
    for person in &hashed {
        write_hashed_person(&mut sink, person)?;
        pb.inc(1);
    }
    sink.flush().map_err(|e| LinkError::input(format!("cannot write output: {e}")))?;
    pb.finish_and_clear();

    log_phase(
        "DONE",
        &format!("{} hashed records written ({})", hashed.len(), format_duration(started.elapsed())),
    );
    Ok(())
}
