//! Normalisation of raw record attributes to comparison form.
//!
//! Every attribute is canonicalised before it is frequency-looked-up, hashed
//! or compared: names fold to uppercase ASCII letters, postcodes lose their
//! internal space, dates split into independently-optional components.
//! Bad values yield `None` rather than aborting the record; the person model
//! decides whether the record as a whole is still usable.

use any_ascii::any_ascii;
use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// A postcode unit after cleaning: letters and digits only.
static POSTCODE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z0-9]+$").unwrap());

/// ISO date, with month and day independently optional: `YYYY`, `YYYY-MM`
/// or `YYYY-MM-DD`.
static PARTIAL_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})(?:-(\d{2})(?:-(\d{2}))?)?$").unwrap());

/// Check if a character is a Unicode combining mark (diacritical mark).
fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0xFE20..=0xFE2F)
}

/// Fold Unicode text to uppercase ASCII: NFKD decomposition, combining marks
/// removed, remaining non-ASCII transliterated.
/// e.g. "José" → "JOSE", "Müller" → "MULLER"
pub fn fold_to_ascii(s: &str) -> String {
    let stripped: String = s.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    any_ascii(&stripped).to_uppercase()
}

/// Canonical comparison form of a personal name: uppercase ASCII letters
/// only, apostrophes, hyphens and whitespace removed.
///
/// Returns `None` when nothing survives cleaning; a name that vanishes is
/// treated as absent, never as an empty match.
pub fn normalize_name(raw: &str) -> Option<String> {
    let folded = fold_to_ascii(raw);
    let cleaned: String = folded.chars().filter(|c| c.is_ascii_alphabetic()).collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Canonical postcode: uppercase, whitespace removed. Accepted only when at
/// least 5 characters long, made of letters and digits, with an alphanumeric
/// final pair. Returns `(unit, sector)` where the sector is the unit minus
/// its final two characters.
pub fn normalize_postcode(raw: &str) -> Option<(String, String)> {
    let unit: String = fold_to_ascii(raw).chars().filter(|c| !c.is_whitespace()).collect();
    if unit.len() < 5 || !POSTCODE_CHARS.is_match(&unit) {
        return None;
    }
    let split = unit.len() - 2;
    if !unit[split..].chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    let sector = unit[..split].to_string();
    Some((unit, sector))
}

/// Date-of-birth components, each independently optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateParts {
    pub year: Option<u16>,
    pub month: Option<u8>,
    pub day: Option<u8>,
}

impl DateParts {
    pub fn is_empty(&self) -> bool {
        self.year.is_none() && self.month.is_none() && self.day.is_none()
    }
}

/// Parse an ISO date that may be partial (`YYYY`, `YYYY-MM`, `YYYY-MM-DD`)
/// or empty. Out-of-range components are an error, not a null: a record
/// claiming month 13 is malformed input, not a missing value.
pub fn parse_partial_date(raw: &str) -> Result<DateParts, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(DateParts::default());
    }
    let caps = PARTIAL_DATE
        .captures(trimmed)
        .ok_or_else(|| format!("bad date '{trimmed}': expected YYYY[-MM[-DD]]"))?;
    let year: u16 = caps[1].parse().map_err(|_| format!("bad year in '{trimmed}'"))?;
    let month = match caps.get(2) {
        Some(m) => {
            let m: u8 = m.as_str().parse().map_err(|_| format!("bad month in '{trimmed}'"))?;
            if !(1..=12).contains(&m) {
                return Err(format!("month out of range in '{trimmed}'"));
            }
            Some(m)
        }
        None => None,
    };
    let day = match caps.get(3) {
        Some(d) => {
            let d: u8 = d.as_str().parse().map_err(|_| format!("bad day in '{trimmed}'"))?;
            if !(1..=31).contains(&d) {
                return Err(format!("day out of range in '{trimmed}'"));
            }
            Some(d)
        }
        None => None,
    };
    Ok(DateParts { year: Some(year), month, day })
}

/// Administrative sex/gender marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gender {
    Female,
    Male,
    Other,
}

impl Gender {
    /// The symbol used in files and as the frequency-table key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Female => "F",
            Gender::Male => "M",
            Gender::Other => "X",
        }
    }
}

/// Parse a gender cell. Empty means unknown; anything other than F, M or X
/// is malformed input.
pub fn parse_gender(raw: &str) -> Result<Option<Gender>, String> {
    match fold_to_ascii(raw.trim()).as_str() {
        "" => Ok(None),
        "F" => Ok(Some(Gender::Female)),
        "M" => Ok(Some(Gender::Male)),
        "X" => Ok(Some(Gender::Other)),
        other => Err(format!("unknown gender symbol '{other}'")),
    }
}
