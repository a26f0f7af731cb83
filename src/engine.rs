//! Matching engine: one proband against a sample of candidates.
//!
//! The sample is loaded once and shared read-only. With blocking enabled the
//! sample is pre-partitioned on date-of-birth components; a candidate whose
//! year, month and day all differ from the proband's would be rejected by
//! the kernel anyway, so it can be skipped without changing any result.
//! Candidates are always visited in ascending sample position, blocked or
//! not, so blocking never changes which of two tied candidates is reported.

use rustc_hash::FxHashMap;

use crate::calibration::Calibration;
use crate::comparator::{compare, REJECTED};
use crate::decision::{accept, DecisionConfig};
use crate::driver::CancelToken;
use crate::error::LinkError;
use crate::person::Person;

/// Sentinel log odds reported for a proband too sparse to compare.
pub const UNMATCHABLE_SENTINEL: f64 = f64::NAN;

/// One result row per proband. The best candidate and both log odds are
/// recorded even when no match is accepted, for audit.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub proband_local_id: String,
    pub matched: bool,
    pub best_candidate_local_id: Option<String>,
    pub log_odds: f64,
    pub second_best_log_odds: f64,
}

/// The candidate collection, with an optional date-of-birth block index.
#[derive(Debug)]
pub struct Sample {
    persons: Vec<Person>,
    block: Option<DobBlockIndex>,
}

/// Candidate positions keyed by each DOB component value. Candidates with
/// any missing component can never differ in all three, so they are always
/// scanned.
#[derive(Debug, Default)]
struct DobBlockIndex {
    by_year: FxHashMap<String, Vec<u32>>,
    by_month: FxHashMap<String, Vec<u32>>,
    by_day: FxHashMap<String, Vec<u32>>,
    always: Vec<u32>,
}

impl Sample {
    pub fn new(persons: Vec<Person>, blocking: bool) -> Self {
        let block = blocking.then(|| {
            let mut index = DobBlockIndex::default();
            for (i, person) in persons.iter().enumerate() {
                let i = i as u32;
                match (&person.dob.year, &person.dob.month, &person.dob.day) {
                    (Some(y), Some(m), Some(d)) => {
                        index.by_year.entry(y.clone()).or_default().push(i);
                        index.by_month.entry(m.clone()).or_default().push(i);
                        index.by_day.entry(d.clone()).or_default().push(i);
                    }
                    _ => index.always.push(i),
                }
            }
            index
        });
        Sample { persons, block }
    }

    pub fn len(&self) -> usize {
        self.persons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.persons.is_empty()
    }

    pub fn persons(&self) -> &[Person] {
        &self.persons
    }

    /// Candidate positions to scan for this proband, in ascending order, or
    /// `None` for a full scan. Blocking only applies when the proband has a
    /// complete date of birth; with any component missing, no candidate can
    /// differ in all three.
    fn blocked_candidates(&self, proband: &Person) -> Option<Vec<u32>> {
        let index = self.block.as_ref()?;
        let (year, month, day) = match (&proband.dob.year, &proband.dob.month, &proband.dob.day) {
            (Some(y), Some(m), Some(d)) => (y, m, d),
            _ => return None,
        };
        let empty: &[u32] = &[];
        let sources = [
            index.always.as_slice(),
            index.by_year.get(year).map_or(empty, |v| v.as_slice()),
            index.by_month.get(month).map_or(empty, |v| v.as_slice()),
            index.by_day.get(day).map_or(empty, |v| v.as_slice()),
        ];
        let mut candidates: Vec<u32> = sources.concat();
        candidates.sort_unstable();
        candidates.dedup();
        Some(candidates)
    }
}

/// Compare one proband against the sample, track the top two log odds, and
/// apply the decision rule. Cancellation is checked between candidate
/// comparisons.
pub fn match_one(
    proband: &Person,
    sample: &Sample,
    cal: &Calibration,
    decision: &DecisionConfig,
    cancel: &CancelToken,
) -> Result<MatchOutcome, LinkError> {
    if proband.is_unmatchable() {
        return Ok(MatchOutcome {
            proband_local_id: proband.local_id.clone(),
            matched: false,
            best_candidate_local_id: None,
            log_odds: UNMATCHABLE_SENTINEL,
            second_best_log_odds: UNMATCHABLE_SENTINEL,
        });
    }

    let blocked = sample.blocked_candidates(proband);

    let mut best = REJECTED;
    let mut best_index: Option<usize> = None;
    let mut second_best = REJECTED;

    let mut visit = |index: usize, sample: &Sample| -> Result<(), LinkError> {
        if cancel.is_cancelled() {
            return Err(LinkError::Cancelled);
        }
        let candidate = &sample.persons[index];
        let log_odds = compare(proband, candidate, cal)?;
        if best_index.is_none() || log_odds > best {
            second_best = best;
            best = log_odds;
            best_index = Some(index);
        } else if log_odds > second_best {
            second_best = log_odds;
        }
        Ok(())
    };

    match blocked {
        Some(indices) => {
            for i in indices {
                visit(i as usize, sample)?;
            }
        }
        None => {
            for i in 0..sample.persons.len() {
                visit(i, sample)?;
            }
        }
    }

    let matched = accept(best, second_best, decision);
    Ok(MatchOutcome {
        proband_local_id: proband.local_id.clone(),
        matched,
        best_candidate_local_id: best_index.map(|i| sample.persons[i].local_id.clone()),
        log_odds: best,
        second_best_log_odds: second_best,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::test_support::calibration;
    use crate::person::test_support::person;
    use crate::person::RawRecord;

    fn decision(theta1: f64, theta2: f64) -> DecisionConfig {
        DecisionConfig { min_log_odds: theta1, min_superiority: theta2, ..Default::default() }
    }

    fn small_sample() -> Vec<Person> {
        vec![
            person("s1", "Elizabeth", "Smith", "1950-01-01", "F"),
            person("s2", "Mary", "Jones", "1964-03-12", "F"),
            person("s3", "James", "Smith", "1971-11-30", "M"),
        ]
    }

    #[test]
    fn test_self_match_is_best() {
        let cal = calibration();
        let sample = Sample::new(small_sample(), false);
        let proband = person("p", "Elizabeth", "Smith", "1950-01-01", "F");
        let outcome =
            match_one(&proband, &sample, &cal, &decision(0.0, 0.0), &CancelToken::new()).unwrap();

        assert!(outcome.matched);
        assert_eq!(outcome.best_candidate_local_id.as_deref(), Some("s1"));
        // The score equals a direct perfect self-comparison.
        let direct = compare(&proband, &sample.persons()[0], &cal).unwrap();
        assert_eq!(outcome.log_odds, direct);
        assert!(outcome.log_odds > 5.0);
    }

    #[test]
    fn test_absent_proband_matches_nothing() {
        let cal = calibration();
        let sample = Sample::new(small_sample(), false);
        let proband = person("p", "Charlotte", "Brown", "1990-06-15", "F");
        let outcome =
            match_one(&proband, &sample, &cal, &decision(0.0, 0.0), &CancelToken::new()).unwrap();
        assert!(!outcome.matched);
        // Every candidate mismatches outright on surname or DOB.
        assert_eq!(outcome.log_odds, REJECTED);
        // The best candidate is still recorded for audit.
        assert!(outcome.best_candidate_local_id.is_some());
    }

    #[test]
    fn test_empty_sample() {
        let cal = calibration();
        let sample = Sample::new(Vec::new(), false);
        let proband = person("p", "Elizabeth", "Smith", "1950-01-01", "F");
        let outcome =
            match_one(&proband, &sample, &cal, &decision(0.0, 0.0), &CancelToken::new()).unwrap();
        assert!(!outcome.matched);
        assert_eq!(outcome.best_candidate_local_id, None);
        assert_eq!(outcome.log_odds, REJECTED);
        assert_eq!(outcome.second_best_log_odds, REJECTED);
    }

    #[test]
    fn test_tie_reports_no_match() {
        let cal = calibration();
        // Identical twins in the sample: same name, same DOB.
        let sample = Sample::new(
            vec![
                person("twin-a", "Elizabeth", "Smith", "1950-01-01", "F"),
                person("twin-b", "Elizabeth", "Smith", "1950-01-01", "F"),
            ],
            false,
        );
        let proband = person("p", "Elizabeth", "Smith", "1950-01-01", "F");
        let outcome =
            match_one(&proband, &sample, &cal, &decision(0.0, 0.0), &CancelToken::new()).unwrap();
        assert!(!outcome.matched);
        // First of the tied pair is reported, deterministically.
        assert_eq!(outcome.best_candidate_local_id.as_deref(), Some("twin-a"));
        assert_eq!(outcome.log_odds, outcome.second_best_log_odds);
    }

    #[test]
    fn test_margin_threshold_rejects_close_seconds() {
        let cal = calibration();
        let sample = Sample::new(
            vec![
                person("exact", "Elizabeth", "Smith", "1950-01-01", "F"),
                person("variant", "Elisabeth", "Smith", "1950-01-01", "F"),
            ],
            false,
        );
        let proband = person("p", "Elizabeth", "Smith", "1950-01-01", "F");
        // Margin between the exact and the phonetic variant is ~3.1 units.
        let strict =
            match_one(&proband, &sample, &cal, &decision(0.0, 10.0), &CancelToken::new()).unwrap();
        assert!(!strict.matched);
        assert_eq!(strict.best_candidate_local_id.as_deref(), Some("exact"));

        let lenient =
            match_one(&proband, &sample, &cal, &decision(0.0, 1.0), &CancelToken::new()).unwrap();
        assert!(lenient.matched);
    }

    #[test]
    fn test_unmatchable_proband_sentinel_row() {
        let cal = calibration();
        let sample = Sample::new(small_sample(), false);
        let record = RawRecord { local_id: "sparse".to_string(), ..Default::default() };
        let proband = Person::from_record(&record, &cal).unwrap();
        let outcome =
            match_one(&proband, &sample, &cal, &decision(0.0, 0.0), &CancelToken::new()).unwrap();
        assert!(!outcome.matched);
        assert_eq!(outcome.best_candidate_local_id, None);
        assert!(outcome.log_odds.is_nan());
    }

    #[test]
    fn test_blocking_does_not_change_outcomes() {
        let cal = calibration();
        let persons = vec![
            person("s1", "Elizabeth", "Smith", "1950-01-01", "F"),
            person("s2", "Elizabeth", "Smith", "1950-01-02", "F"),
            person("s3", "Mary", "Jones", "1964-03-12", "F"),
            person("s4", "James", "Smith", "1971-01-30", "M"),
            // Partial DOB: must never be skipped by blocking.
            person("s5", "Elizabeth", "Smith", "1950", "F"),
        ];
        let unblocked = Sample::new(persons.clone(), false);
        let blocked = Sample::new(persons, true);

        let probands = [
            person("p1", "Elizabeth", "Smith", "1950-01-01", "F"),
            person("p2", "Mary", "Jones", "1964-03-12", "F"),
            // Proband with partial DOB disables blocking for itself.
            person("p3", "James", "Smith", "1971-01", "M"),
        ];
        for proband in &probands {
            let a = match_one(proband, &unblocked, &cal, &decision(0.0, 0.0), &CancelToken::new())
                .unwrap();
            let b = match_one(proband, &blocked, &cal, &decision(0.0, 0.0), &CancelToken::new())
                .unwrap();
            assert_eq!(format!("{a:?}"), format!("{b:?}"), "proband {}", proband.local_id);
        }
    }

    #[test]
    fn test_blocking_skips_only_triple_mismatches() {
        let persons = vec![
            person("same-year", "A", "B", "1950-06-20", "F"),
            person("same-day", "A", "B", "1980-12-01", "F"),
            person("no-overlap", "A", "B", "1980-12-02", "F"),
            person("partial", "A", "B", "1980", "F"),
        ];
        let sample = Sample::new(persons, true);
        let proband = person("p", "A", "B", "1950-01-01", "F");
        let candidates = sample.blocked_candidates(&proband).unwrap();
        // same-year (year), same-day (day), partial (always); no-overlap skipped.
        assert_eq!(candidates, vec![0, 1, 3]);
    }

    #[test]
    fn test_cancellation_aborts_scan() {
        let cal = calibration();
        let sample = Sample::new(small_sample(), false);
        let proband = person("p", "Elizabeth", "Smith", "1950-01-01", "F");
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            match_one(&proband, &sample, &cal, &decision(0.0, 0.0), &cancel),
            Err(LinkError::Cancelled)
        ));
    }
}
