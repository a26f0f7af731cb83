//! External adapters: plaintext CSV, hashed JSON-lines and the comparison
//! result CSV.
//!
//! Plaintext records travel as CSV because that is what clinical extracts
//! look like; hashed persons travel as newline-delimited JSON because the
//! banded frequencies must survive with full precision. Readers validate
//! eagerly: a malformed record or duplicate `local_id` fails the file, so
//! data-quality faults can never silently thin the output.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use rayon::prelude::*;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::calibration::Calibration;
use crate::comparator::posterior_probability;
use crate::engine::MatchOutcome;
use crate::error::LinkError;
use crate::person::{
    DateToken, GenderToken, NameToken, Person, PersonMode, PostcodeToken, RawRecord,
};

/// Required columns of a plaintext record file, in order.
pub const PLAINTEXT_HEADERS: [&str; 8] = [
    "local_id",
    "first_name",
    "middle_names",
    "surname",
    "dob",
    "gender",
    "postcodes",
    "other_info",
];

// ============================================================================
// Plaintext CSV reader
// ============================================================================

/// Streaming reader of plaintext records with duplicate-id detection.
pub struct PlaintextReader<R: Read> {
    reader: csv::Reader<R>,
    seen_ids: FxHashSet<String>,
    row: u64,
}

impl PlaintextReader<File> {
    pub fn open(path: &Path) -> Result<Self, LinkError> {
        let file = File::open(path)
            .map_err(|e| LinkError::input(format!("cannot open {}: {e}", path.display())))?;
        Self::new(file)
    }
}

impl<R: Read> PlaintextReader<R> {
    pub fn new(source: R) -> Result<Self, LinkError> {
        let mut reader = csv::ReaderBuilder::new().flexible(false).from_reader(source);
        let headers = reader.headers()?;
        let actual: Vec<&str> = headers.iter().collect();
        if actual != PLAINTEXT_HEADERS {
            return Err(LinkError::input(format!(
                "bad header row: expected {:?}, got {actual:?}",
                PLAINTEXT_HEADERS
            )));
        }
        Ok(PlaintextReader { reader, seen_ids: FxHashSet::default(), row: 1 })
    }

    fn parse_row(&mut self, record: &csv::StringRecord) -> Result<RawRecord, LinkError> {
        let cell = |i: usize| record.get(i).unwrap_or("").to_string();
        let raw = RawRecord {
            local_id: cell(0).trim().to_string(),
            first_name: cell(1),
            middle_names: cell(2).split_whitespace().map(str::to_string).collect(),
            surname: cell(3),
            dob: cell(4),
            gender: cell(5),
            postcodes: cell(6).split_whitespace().map(str::to_string).collect(),
            other_info: cell(7),
        };
        if raw.local_id.is_empty() {
            return Err(LinkError::input(format!("row {}: empty local_id", self.row)));
        }
        if !self.seen_ids.insert(raw.local_id.clone()) {
            return Err(LinkError::input(format!(
                "row {}: duplicate local_id '{}'",
                self.row, raw.local_id
            )));
        }
        Ok(raw)
    }
}

impl<R: Read> Iterator for PlaintextReader<R> {
    type Item = Result<RawRecord, LinkError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut record = csv::StringRecord::new();
        self.row += 1;
        match self.reader.read_record(&mut record) {
            Ok(false) => None,
            Ok(true) => Some(self.parse_row(&record)),
            Err(e) => Some(Err(LinkError::input(format!("row {}: {e}", self.row)))),
        }
    }
}

/// Read a whole plaintext file into raw records.
pub fn read_raw_records<R: Read>(source: R) -> Result<Vec<RawRecord>, LinkError> {
    PlaintextReader::new(source)?.collect()
}

/// Build persons from raw records in parallel, preserving input order.
pub fn build_persons(records: Vec<RawRecord>, cal: &Calibration) -> Result<Vec<Person>, LinkError> {
    records.into_par_iter().map(|r| Person::from_record(&r, cal)).collect()
}

// ============================================================================
// Comparison result CSV
// ============================================================================

/// Writer for the fixed-schema comparison result CSV. The header row is
/// emitted once, on construction.
pub struct ResultWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ResultWriter<W> {
    pub fn new(sink: W) -> Result<Self, LinkError> {
        let mut writer = csv::Writer::from_writer(sink);
        writer.write_record([
            "proband_local_id",
            "matched",
            "best_candidate_local_id",
            "log_odds_match",
            "second_best_log_odds",
            "p_match",
        ])?;
        Ok(ResultWriter { writer })
    }

    pub fn write_outcome(&mut self, outcome: &MatchOutcome) -> Result<(), LinkError> {
        let log_odds = format_log_odds(outcome.log_odds);
        let second_best = format_log_odds(outcome.second_best_log_odds);
        let p_match = format_log_odds(posterior_probability(outcome.log_odds));
        self.writer.write_record([
            outcome.proband_local_id.as_str(),
            if outcome.matched { "true" } else { "false" },
            outcome.best_candidate_local_id.as_deref().unwrap_or(""),
            log_odds.as_str(),
            second_best.as_str(),
            p_match.as_str(),
        ])?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), LinkError> {
        self.writer.flush().map_err(|e| LinkError::input(format!("cannot write results: {e}")))
    }
}

/// Shortest round-trip representation; `-inf` marks a rejected pairing and
/// `NaN` the unmatchable sentinel.
fn format_log_odds(value: f64) -> String {
    format!("{value}")
}

// ============================================================================
// Hashed person JSON-lines
// ============================================================================

/// One hashed person as serialised to a JSON line. Nullable keys are
/// emitted as `null` rather than omitted so the schema stays fixed;
/// `other_info` is the exception, omitted unless pass-through was requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HashedPersonRecord {
    pub local_id: String,
    pub hashed_first_name: Option<String>,
    pub first_name_frequency: Option<f64>,
    pub first_name_metaphone_hash: Option<String>,
    pub first_name_metaphone_frequency: Option<f64>,
    pub hashed_surname: Option<String>,
    pub surname_frequency: Option<f64>,
    pub surname_metaphone_hash: Option<String>,
    pub surname_metaphone_frequency: Option<f64>,
    #[serde(default)]
    pub middle_names: Vec<HashedMiddleName>,
    pub hashed_gender: Option<String>,
    pub gender_frequency: Option<f64>,
    pub dob: HashedDob,
    #[serde(default)]
    pub postcodes: Vec<HashedPostcode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_info: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HashedMiddleName {
    pub hashed_name: String,
    pub name_frequency: f64,
    pub hashed_metaphone: Option<String>,
    pub metaphone_frequency: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HashedDob {
    pub hashed_year: Option<String>,
    pub hashed_month: Option<String>,
    pub hashed_day: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HashedPostcode {
    pub hashed_unit: String,
    pub unit_frequency: f64,
    pub hashed_sector: String,
    pub sector_frequency: f64,
}

/// Serialise a hashed person to its JSON-line record.
pub fn hashed_person_to_record(person: &Person) -> Result<HashedPersonRecord, LinkError> {
    if person.mode != PersonMode::Hashed {
        return Err(LinkError::internal(format!(
            "refusing to serialise plaintext person '{}' as a hashed record",
            person.local_id
        )));
    }
    let name_fields = |t: &Option<NameToken>| match t {
        Some(t) => (
            Some(t.surface.clone()),
            Some(t.frequency),
            t.phonetic.clone(),
            t.phonetic.is_some().then_some(t.phonetic_frequency),
        ),
        None => (None, None, None, None),
    };
    let (hashed_first_name, first_name_frequency, first_name_metaphone_hash, first_name_metaphone_frequency) =
        name_fields(&person.first_name);
    let (hashed_surname, surname_frequency, surname_metaphone_hash, surname_metaphone_frequency) =
        name_fields(&person.surname);

    Ok(HashedPersonRecord {
        local_id: person.local_id.clone(),
        hashed_first_name,
        first_name_frequency,
        first_name_metaphone_hash,
        first_name_metaphone_frequency,
        hashed_surname,
        surname_frequency,
        surname_metaphone_hash,
        surname_metaphone_frequency,
        middle_names: person
            .middle_names
            .iter()
            .map(|t| HashedMiddleName {
                hashed_name: t.surface.clone(),
                name_frequency: t.frequency,
                hashed_metaphone: t.phonetic.clone(),
                metaphone_frequency: t.phonetic.is_some().then_some(t.phonetic_frequency),
            })
            .collect(),
        hashed_gender: person.gender.as_ref().map(|g| g.value.clone()),
        gender_frequency: person.gender.as_ref().map(|g| g.frequency),
        dob: HashedDob {
            hashed_year: person.dob.year.clone(),
            hashed_month: person.dob.month.clone(),
            hashed_day: person.dob.day.clone(),
        },
        postcodes: person
            .postcodes
            .iter()
            .map(|p| HashedPostcode {
                hashed_unit: p.unit.clone(),
                unit_frequency: p.unit_frequency,
                hashed_sector: p.sector.clone(),
                sector_frequency: p.sector_frequency,
            })
            .collect(),
        other_info: person.other_info.clone(),
    })
}

/// Rebuild a hashed person from its JSON-line record, validating the parts
/// the kernel depends on.
pub fn record_to_hashed_person(record: HashedPersonRecord) -> Result<Person, LinkError> {
    let id = record.local_id.clone();

    let first_name = match record.hashed_first_name {
        Some(surface) => Some(read_name_token(
            &id,
            "first_name",
            surface,
            record.first_name_frequency,
            record.first_name_metaphone_hash,
            record.first_name_metaphone_frequency,
        )?),
        None => None,
    };
    let surname = match record.hashed_surname {
        Some(surface) => Some(read_name_token(
            &id,
            "surname",
            surface,
            record.surname_frequency,
            record.surname_metaphone_hash,
            record.surname_metaphone_frequency,
        )?),
        None => None,
    };
    let middle_names = record
        .middle_names
        .into_iter()
        .map(|m| {
            read_name_token(
                &id,
                "middle_name",
                m.hashed_name,
                Some(m.name_frequency),
                m.hashed_metaphone,
                m.metaphone_frequency,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let gender = match (record.hashed_gender, record.gender_frequency) {
        (None, _) => None,
        (Some(value), Some(frequency)) => {
            check_recorded_frequency(&id, "gender", frequency)?;
            Some(GenderToken { value, frequency })
        }
        (Some(_), None) => {
            return Err(LinkError::input(format!(
                "hashed record '{id}': gender hash without frequency"
            )))
        }
    };

    let postcodes = record
        .postcodes
        .into_iter()
        .map(|p| {
            check_recorded_frequency(&id, "postcode unit", p.unit_frequency)?;
            check_recorded_frequency(&id, "postcode sector", p.sector_frequency)?;
            Ok(PostcodeToken {
                unit: p.hashed_unit,
                sector: p.hashed_sector,
                unit_frequency: p.unit_frequency,
                sector_frequency: p.sector_frequency,
            })
        })
        .collect::<Result<Vec<_>, LinkError>>()?;

    Person::assemble(
        PersonMode::Hashed,
        record.local_id,
        first_name,
        middle_names,
        surname,
        DateToken {
            year: record.dob.hashed_year,
            month: record.dob.hashed_month,
            day: record.dob.hashed_day,
        },
        gender,
        postcodes,
        record.other_info,
    )
}

fn read_name_token(
    id: &str,
    what: &str,
    surface: String,
    frequency: Option<f64>,
    phonetic: Option<String>,
    phonetic_frequency: Option<f64>,
) -> Result<NameToken, LinkError> {
    if surface.is_empty() {
        return Err(LinkError::input(format!("hashed record '{id}': {what}: empty hash")));
    }
    let frequency = frequency.ok_or_else(|| {
        LinkError::input(format!("hashed record '{id}': {what}: missing frequency"))
    })?;
    check_recorded_frequency(id, what, frequency)?;
    let phonetic_frequency = match (&phonetic, phonetic_frequency) {
        (Some(_), Some(f)) => {
            check_recorded_frequency(id, what, f)?;
            f
        }
        (Some(_), None) => {
            return Err(LinkError::input(format!(
                "hashed record '{id}': {what}: metaphone hash without frequency"
            )))
        }
        (None, _) => 0.0,
    };
    Ok(NameToken { surface, phonetic, frequency, phonetic_frequency })
}

fn check_recorded_frequency(id: &str, what: &str, freq: f64) -> Result<(), LinkError> {
    if freq > 0.0 && freq < 1.0 {
        Ok(())
    } else {
        Err(LinkError::input(format!(
            "hashed record '{id}': {what}: frequency {freq} is outside (0, 1)"
        )))
    }
}

/// Streaming reader of hashed persons with duplicate-id detection.
pub struct HashedReader<R: BufRead> {
    lines: std::io::Lines<R>,
    seen_ids: FxHashSet<String>,
    line: u64,
}

impl HashedReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, LinkError> {
        let file = File::open(path)
            .map_err(|e| LinkError::input(format!("cannot open {}: {e}", path.display())))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> HashedReader<R> {
    pub fn new(source: R) -> Self {
        HashedReader { lines: source.lines(), seen_ids: FxHashSet::default(), line: 0 }
    }

    fn parse_line(&mut self, line: &str) -> Result<Person, LinkError> {
        let record: HashedPersonRecord = serde_json::from_str(line)
            .map_err(|e| LinkError::input(format!("line {}: {e}", self.line)))?;
        let person = record_to_hashed_person(record)?;
        if !self.seen_ids.insert(person.local_id.clone()) {
            return Err(LinkError::input(format!(
                "line {}: duplicate local_id '{}'",
                self.line, person.local_id
            )));
        }
        Ok(person)
    }
}

impl<R: BufRead> Iterator for HashedReader<R> {
    type Item = Result<Person, LinkError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line += 1;
            match self.lines.next()? {
                Err(e) => {
                    return Some(Err(LinkError::input(format!("line {}: {e}", self.line))))
                }
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => return Some(self.parse_line(&line)),
            }
        }
    }
}

/// Write one hashed person as a JSON line.
pub fn write_hashed_person<W: Write>(sink: &mut W, person: &Person) -> Result<(), LinkError> {
    let record = hashed_person_to_record(person)?;
    let json = serde_json::to_string(&record)
        .map_err(|e| LinkError::internal(format!("cannot serialise hashed person: {e}")))?;
    writeln!(sink, "{json}")
        .map_err(|e| LinkError::input(format!("cannot write hashed record: {e}")))
}
