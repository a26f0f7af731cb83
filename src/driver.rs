//! Parallel driver: streams probands through a worker pool and emits
//! results strictly in ingestion order.
//!
//! Each proband gets a monotonic sequence number at ingestion. Workers pull
//! probands from a bounded queue, score them against the shared sample, and
//! push `(sequence, outcome)` pairs to the writer, which holds them in a
//! reorder buffer until the next-expected sequence arrives. Output is
//! therefore byte-identical for any worker count, including one.
//!
//! The reorder buffer is the only cross-thread mutable structure; the
//! calibration and the sample are shared read-only.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::bounded;
use serde::Serialize;

use crate::calibration::Calibration;
use crate::decision::DecisionConfig;
use crate::engine::{match_one, MatchOutcome, Sample};
use crate::error::LinkError;
use crate::person::Person;

/// Queue slots per worker; bounds memory while keeping the pool busy.
const QUEUE_DEPTH_PER_WORKER: usize = 4;

/// Cooperative cancellation signal, checked between candidate comparisons
/// and at proband boundaries. Cancelling mid-run leaves a valid prefix of
/// the full output.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Run summary, serialisable for `--export-stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub probands: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub unmatchable: usize,
    pub sample_size: usize,
    pub workers: usize,
    pub elapsed_seconds: f64,
}

impl RunStats {
    fn record(&mut self, outcome: &MatchOutcome) {
        self.probands += 1;
        if outcome.matched {
            self.matched += 1;
        } else if outcome.log_odds.is_nan() {
            self.unmatchable += 1;
        } else {
            self.unmatched += 1;
        }
    }

    /// Log the summary to stderr in JSON format.
    pub fn log(&self) {
        if let Ok(json) = serde_json::to_string_pretty(self) {
            eprintln!("[STATS]\n{json}");
        }
    }

    pub fn write_to_file(&self, path: &std::path::Path) -> Result<(), LinkError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| LinkError::internal(format!("cannot serialise stats: {e}")))?;
        std::fs::write(path, json)
            .map_err(|e| LinkError::input(format!("cannot write stats file: {e}")))
    }
}

/// Resolve a worker-count option: 0 means one worker per core.
pub fn resolve_workers(requested: usize) -> usize {
    if requested > 0 {
        requested
    } else {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }
}

/// An outcome tagged with its ingestion sequence number, ordered for the
/// reorder buffer.
struct Sequenced(u64, MatchOutcome);

impl PartialEq for Sequenced {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for Sequenced {}
impl PartialOrd for Sequenced {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Sequenced {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

/// Stream probands through `workers` threads and emit each outcome, in
/// ingestion order, through `emit`.
///
/// The proband source yields `Result` so ingest errors (malformed records,
/// duplicate ids) surface here and abort the run.
pub fn run_matching<I, F>(
    probands: I,
    sample: &Sample,
    cal: &Calibration,
    decision: &DecisionConfig,
    workers: usize,
    cancel: &CancelToken,
    mut emit: F,
) -> Result<RunStats, LinkError>
where
    I: Iterator<Item = Result<Person, LinkError>> + Send,
    F: FnMut(&MatchOutcome) -> Result<(), LinkError>,
{
    let started = Instant::now();
    let workers = resolve_workers(workers);
    let mut stats = RunStats { workers, sample_size: sample.len(), ..Default::default() };

    if workers == 1 {
        for record in probands {
            if cancel.is_cancelled() {
                return Err(LinkError::Cancelled);
            }
            let proband = record?;
            let outcome = match_one(&proband, sample, cal, decision, cancel)?;
            stats.record(&outcome);
            emit(&outcome)?;
        }
        stats.elapsed_seconds = started.elapsed().as_secs_f64();
        return Ok(stats);
    }

    let (work_tx, work_rx) = bounded::<(u64, Person)>(workers * QUEUE_DEPTH_PER_WORKER);
    let (done_tx, done_rx) = bounded::<(u64, Result<MatchOutcome, LinkError>)>(
        workers * QUEUE_DEPTH_PER_WORKER,
    );

    let mut run_error: Option<LinkError> = None;

    thread::scope(|scope| {
        for _ in 0..workers {
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            scope.spawn(move || {
                for (seq, proband) in work_rx.iter() {
                    let result = match_one(&proband, sample, cal, decision, cancel);
                    let failed = result.is_err();
                    if done_tx.send((seq, result)).is_err() || failed {
                        break;
                    }
                }
            });
        }
        // The clones held by the workers keep the channels alive; dropping
        // the originals lets `done_rx` close once every worker is done.
        drop(work_rx);
        drop(done_tx);

        let producer = scope.spawn(move || -> Result<(), LinkError> {
            for (seq, record) in (0u64..).zip(probands) {
                if cancel.is_cancelled() {
                    return Err(LinkError::Cancelled);
                }
                let proband = record?;
                if work_tx.send((seq, proband)).is_err() {
                    // Workers are gone; the writer already saw the error.
                    break;
                }
            }
            Ok(())
        });

        let mut pending: BinaryHeap<Reverse<Sequenced>> = BinaryHeap::new();
        let mut next_seq = 0u64;
        while let Ok((seq, result)) = done_rx.recv() {
            match result {
                Ok(outcome) => {
                    pending.push(Reverse(Sequenced(seq, outcome)));
                    while pending.peek().map_or(false, |Reverse(s)| s.0 == next_seq) {
                        let Some(Reverse(Sequenced(_, outcome))) = pending.pop() else { break };
                        stats.record(&outcome);
                        if let Err(e) = emit(&outcome) {
                            run_error = Some(e);
                            break;
                        }
                        next_seq += 1;
                    }
                }
                Err(e) => run_error = Some(e),
            }
            if run_error.is_some() {
                break;
            }
        }
        if run_error.is_some() {
            // Unblock the producer and workers so the scope can join.
            cancel.cancel();
            drop(done_rx);
        }

        match producer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if run_error.is_none() {
                    run_error = Some(e);
                }
            }
            Err(_) => {
                if run_error.is_none() {
                    run_error = Some(LinkError::internal("proband reader thread panicked"));
                }
            }
        }
    });

    if let Some(e) = run_error {
        return Err(e);
    }
    stats.elapsed_seconds = started.elapsed().as_secs_f64();
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::test_support::calibration;
    use crate::person::test_support::person;

    fn decision() -> DecisionConfig {
        DecisionConfig { min_log_odds: 0.0, min_superiority: 0.0, ..Default::default() }
    }

    fn sample_persons() -> Vec<Person> {
        (0..20)
            .map(|i| {
                person(
                    &format!("s{i}"),
                    if i % 2 == 0 { "Elizabeth" } else { "Mary" },
                    if i % 3 == 0 { "Smith" } else { "Jones" },
                    &format!("19{:02}-01-{:02}", 50 + i % 40, 1 + i % 28),
                    if i % 2 == 0 { "F" } else { "M" },
                )
            })
            .collect()
    }

    fn probands() -> Vec<Person> {
        let mut list = sample_persons();
        list.push(person("absent", "Charlotte", "Brown", "1999-09-09", "F"));
        for (i, p) in list.iter_mut().enumerate() {
            p.local_id = format!("p{i}");
        }
        list
    }

    fn run_with(workers: usize) -> (Vec<MatchOutcome>, RunStats) {
        let cal = calibration();
        let sample = Sample::new(sample_persons(), true);
        let mut rows = Vec::new();
        let stats = run_matching(
            probands().into_iter().map(Ok),
            &sample,
            &cal,
            &decision(),
            workers,
            &CancelToken::new(),
            |outcome| {
                rows.push(outcome.clone());
                Ok(())
            },
        )
        .unwrap();
        (rows, stats)
    }

    #[test]
    fn test_output_is_identical_for_any_worker_count() {
        let (serial, serial_stats) = run_with(1);
        assert_eq!(serial.len(), probands().len());
        for workers in [2, 4, 8] {
            let (parallel, stats) = run_with(workers);
            assert_eq!(
                format!("{serial:?}"),
                format!("{parallel:?}"),
                "outputs diverge at {workers} workers"
            );
            assert_eq!(stats.matched, serial_stats.matched);
            assert_eq!(stats.probands, serial_stats.probands);
        }
    }

    #[test]
    fn test_rows_are_in_ingestion_order() {
        let (rows, _) = run_with(4);
        let ids: Vec<&str> = rows.iter().map(|r| r.proband_local_id.as_str()).collect();
        let expected: Vec<String> = (0..rows.len()).map(|i| format!("p{i}")).collect();
        assert_eq!(ids, expected.iter().map(|s| s.as_str()).collect::<Vec<_>>());
    }

    #[test]
    fn test_stats_counts() {
        let (rows, stats) = run_with(2);
        assert_eq!(stats.probands, rows.len());
        assert_eq!(stats.matched + stats.unmatched + stats.unmatchable, stats.probands);
        assert!(stats.matched >= 1);
        assert!(stats.unmatched >= 1);
    }

    #[test]
    fn test_input_error_aborts_run() {
        let cal = calibration();
        let sample = Sample::new(sample_persons(), false);
        let feed: Vec<Result<Person, LinkError>> = vec![
            Ok(person("ok", "Elizabeth", "Smith", "1950-01-01", "F")),
            Err(LinkError::input("duplicate local_id 'ok'")),
        ];
        let result = run_matching(
            feed.into_iter(),
            &sample,
            &cal,
            &decision(),
            2,
            &CancelToken::new(),
            |_| Ok(()),
        );
        assert!(matches!(result, Err(LinkError::Input(_))));
    }

    #[test]
    fn test_pre_cancelled_run_reports_cancellation() {
        let cal = calibration();
        let sample = Sample::new(sample_persons(), false);
        let cancel = CancelToken::new();
        cancel.cancel();
        for workers in [1, 4] {
            let result = run_matching(
                probands().into_iter().map(Ok),
                &sample,
                &cal,
                &decision(),
                workers,
                &cancel,
                |_| Ok(()),
            );
            assert!(matches!(result, Err(LinkError::Cancelled)), "{workers} workers");
        }
    }

    #[test]
    fn test_resolve_workers() {
        assert_eq!(resolve_workers(3), 3);
        assert!(resolve_workers(0) >= 1);
    }
}
