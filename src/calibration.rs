//! Calibration tables: prior, error rates and frequency tables.
//!
//! Loaded once at startup from a JSON file, validated eagerly, then shared
//! read-only with every worker. Nothing here is mutated after load.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::error::LinkError;
use crate::normalize::Gender;

fn default_min_name_frequency() -> f64 {
    5e-6
}
fn default_min_metaphone_frequency() -> f64 {
    1e-5
}
fn default_min_postcode_unit_frequency() -> f64 {
    1e-5
}
fn default_min_postcode_sector_frequency() -> f64 {
    1e-4
}

/// P(typo | same person), per attribute kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorRates {
    pub forename: f64,
    pub surname: f64,
    pub dob: f64,
    pub gender: f64,
    pub postcode: f64,
}

/// On-disk calibration format. Unknown keys are rejected so a typo in a
/// calibration file fails the run instead of silently using a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationSpec {
    /// P(a randomly drawn proband/candidate pair is a true match).
    pub match_prior: f64,
    pub error_rates: ErrorRates,
    /// Population frequency of each gender symbol (keys F, M, X).
    pub gender_frequencies: FxHashMap<String, f64>,
    pub forename_frequencies: FxHashMap<String, f64>,
    #[serde(default)]
    pub forename_frequencies_by_gender: FxHashMap<String, FxHashMap<String, f64>>,
    pub forename_metaphone_frequencies: FxHashMap<String, f64>,
    #[serde(default)]
    pub forename_metaphone_frequencies_by_gender: FxHashMap<String, FxHashMap<String, f64>>,
    pub surname_frequencies: FxHashMap<String, f64>,
    pub surname_metaphone_frequencies: FxHashMap<String, f64>,
    /// P(two random people share an exact date of birth).
    pub dob_frequency: f64,
    #[serde(default)]
    pub postcode_unit_frequencies: FxHashMap<String, f64>,
    #[serde(default)]
    pub postcode_sector_frequencies: FxHashMap<String, f64>,
    /// Floors applied when a value is absent from its table.
    #[serde(default = "default_min_name_frequency")]
    pub minimum_name_frequency: f64,
    #[serde(default = "default_min_metaphone_frequency")]
    pub minimum_metaphone_frequency: f64,
    #[serde(default = "default_min_postcode_unit_frequency")]
    pub minimum_postcode_unit_frequency: f64,
    #[serde(default = "default_min_postcode_sector_frequency")]
    pub minimum_postcode_sector_frequency: f64,
}

/// Per-component chance frequencies for partial date-of-birth comparison,
/// derived from the scalar DOB frequency: day and month are taken uniform
/// (1/31, 1/12) and the year absorbs the remainder.
#[derive(Debug, Clone, Copy)]
pub struct DobComponentFrequencies {
    pub year: f64,
    pub month: f64,
    pub day: f64,
}

/// Validated, immutable calibration handed by reference to every worker.
#[derive(Debug, Clone)]
pub struct Calibration {
    spec: CalibrationSpec,
    prior_log_odds: f64,
    dob_components: DobComponentFrequencies,
}

impl Calibration {
    pub fn from_path(path: &Path) -> Result<Self, LinkError> {
        let file = File::open(path).map_err(|e| {
            LinkError::config(format!("cannot open calibration file {}: {e}", path.display()))
        })?;
        let spec: CalibrationSpec = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            LinkError::config(format!("malformed calibration file {}: {e}", path.display()))
        })?;
        Self::from_spec(spec)
    }

    pub fn from_spec(spec: CalibrationSpec) -> Result<Self, LinkError> {
        validate_probability("match_prior", spec.match_prior)?;
        validate_probability("error_rates.forename", spec.error_rates.forename)?;
        validate_probability("error_rates.surname", spec.error_rates.surname)?;
        validate_probability("error_rates.dob", spec.error_rates.dob)?;
        validate_probability("error_rates.gender", spec.error_rates.gender)?;
        validate_probability("error_rates.postcode", spec.error_rates.postcode)?;
        validate_probability("dob_frequency", spec.dob_frequency)?;
        for (symbol, freq) in &spec.gender_frequencies {
            if !matches!(symbol.as_str(), "F" | "M" | "X") {
                return Err(LinkError::config(format!(
                    "gender_frequencies has unknown symbol '{symbol}'"
                )));
            }
            validate_probability(&format!("gender_frequencies.{symbol}"), *freq)?;
        }
        let tables: [(&str, &FxHashMap<String, f64>); 4] = [
            ("forename_frequencies", &spec.forename_frequencies),
            ("forename_metaphone_frequencies", &spec.forename_metaphone_frequencies),
            ("surname_frequencies", &spec.surname_frequencies),
            ("surname_metaphone_frequencies", &spec.surname_metaphone_frequencies),
        ];
        for (table, map) in tables {
            for (key, freq) in map {
                validate_probability(&format!("{table}.{key}"), *freq)?;
            }
        }

        let prior_log_odds = (spec.match_prior / (1.0 - spec.match_prior)).ln();

        let day = 1.0 / 31.0;
        let month = 1.0 / 12.0;
        let year = spec.dob_frequency / (day * month);
        if !(year > 0.0 && year < 1.0) {
            return Err(LinkError::config(format!(
                "dob_frequency {} implies an impossible per-year frequency {year}",
                spec.dob_frequency
            )));
        }
        let dob_components = DobComponentFrequencies { year, month, day };

        Ok(Calibration { spec, prior_log_odds, dob_components })
    }

    /// Prior log odds that an arbitrary proband/candidate pair is a match.
    pub fn prior_log_odds(&self) -> f64 {
        self.prior_log_odds
    }

    pub fn error_rates(&self) -> &ErrorRates {
        &self.spec.error_rates
    }

    pub fn dob_frequency(&self) -> f64 {
        self.spec.dob_frequency
    }

    pub fn dob_component_frequencies(&self) -> DobComponentFrequencies {
        self.dob_components
    }

    pub fn gender_frequency(&self, gender: Gender) -> Result<f64, LinkError> {
        self.spec.gender_frequencies.get(gender.as_str()).copied().ok_or_else(|| {
            LinkError::config(format!(
                "calibration has no gender frequency for '{}'",
                gender.as_str()
            ))
        })
    }

    /// Forename frequency, conditioned on the record's own gender when a
    /// conditional table covers it, unconditional otherwise, floored when
    /// the name is absent from both tables.
    pub fn forename_frequency(&self, name: &str, gender: Option<Gender>) -> f64 {
        lookup_conditional(
            name,
            gender,
            &self.spec.forename_frequencies,
            &self.spec.forename_frequencies_by_gender,
        )
        .unwrap_or(self.spec.minimum_name_frequency)
    }

    pub fn forename_metaphone_frequency(&self, code: &str, gender: Option<Gender>) -> f64 {
        lookup_conditional(
            code,
            gender,
            &self.spec.forename_metaphone_frequencies,
            &self.spec.forename_metaphone_frequencies_by_gender,
        )
        .unwrap_or(self.spec.minimum_metaphone_frequency)
    }

    pub fn surname_frequency(&self, name: &str) -> f64 {
        self.spec
            .surname_frequencies
            .get(name)
            .copied()
            .unwrap_or(self.spec.minimum_name_frequency)
    }

    pub fn surname_metaphone_frequency(&self, code: &str) -> f64 {
        self.spec
            .surname_metaphone_frequencies
            .get(code)
            .copied()
            .unwrap_or(self.spec.minimum_metaphone_frequency)
    }

    pub fn postcode_unit_frequency(&self, unit: &str) -> f64 {
        self.spec
            .postcode_unit_frequencies
            .get(unit)
            .copied()
            .unwrap_or(self.spec.minimum_postcode_unit_frequency)
    }

    pub fn postcode_sector_frequency(&self, sector: &str) -> f64 {
        self.spec
            .postcode_sector_frequencies
            .get(sector)
            .copied()
            .unwrap_or(self.spec.minimum_postcode_sector_frequency)
    }
}

fn lookup_conditional(
    key: &str,
    gender: Option<Gender>,
    unconditional: &FxHashMap<String, f64>,
    by_gender: &FxHashMap<String, FxHashMap<String, f64>>,
) -> Option<f64> {
    if let Some(g) = gender {
        if let Some(freq) = by_gender.get(g.as_str()).and_then(|t| t.get(key)) {
            return Some(*freq);
        }
    }
    unconditional.get(key).copied()
}

fn validate_probability(field: &str, value: f64) -> Result<(), LinkError> {
    if value.is_finite() && value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(LinkError::config(format!(
            "{field} must be a probability strictly between 0 and 1, got {value}"
        )))
    }
}

/// Calibration used throughout the engine's own tests: the worked-example
/// numbers for SMITH/SM0 and ELIZABETH/ALSP.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn spec() -> CalibrationSpec {
        let json = r#"{
            "match_prior": 1e-6,
            "error_rates": {
                "forename": 0.001,
                "surname": 0.001,
                "dob": 0.001,
                "gender": 0.0001,
                "postcode": 0.003
            },
            "gender_frequencies": { "F": 0.51, "M": 0.489, "X": 0.001 },
            "forename_frequencies": {
                "ELIZABETH": 0.00949,
                "MARY": 0.0262,
                "JAMES": 0.0354
            },
            "forename_metaphone_frequencies": {
                "ALSP": 0.00971,
                "MR": 0.0297,
                "JMS": 0.0361
            },
            "surname_frequencies": {
                "SMITH": 0.01172,
                "JONES": 0.00892
            },
            "surname_metaphone_frequencies": {
                "SM0": 0.01183,
                "JNS": 0.00901
            },
            "dob_frequency": 3.04e-5,
            "postcode_unit_frequencies": {
                "CB20QQ": 1.2e-5,
                "CB99ZZ": 1.1e-5
            },
            "postcode_sector_frequencies": {
                "CB20": 2.1e-4,
                "CB99": 1.9e-4
            }
        }"#;
        serde_json::from_str(json).unwrap()
    }

    pub fn calibration() -> Calibration {
        Calibration::from_spec(spec()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loads_and_derives_prior() {
        let cal = test_support::calibration();
        let expected = (1e-6_f64 / (1.0 - 1e-6)).ln();
        assert!((cal.prior_log_odds() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_frequency_lookup_with_floor() {
        let cal = test_support::calibration();
        assert_eq!(cal.surname_frequency("SMITH"), 0.01172);
        assert_eq!(cal.surname_frequency("UNLISTED"), 5e-6);
        assert_eq!(cal.postcode_unit_frequency("CB20QQ"), 1.2e-5);
        assert_eq!(cal.postcode_sector_frequency("ZZ99"), 1e-4);
    }

    #[test]
    fn test_gender_conditional_fallback() {
        let mut spec = test_support::spec();
        spec.forename_frequencies_by_gender.insert(
            "F".to_string(),
            [("ELIZABETH".to_string(), 0.0186)].into_iter().collect(),
        );
        let cal = Calibration::from_spec(spec).unwrap();
        // Conditioned when the record's gender has a table entry.
        assert_eq!(cal.forename_frequency("ELIZABETH", Some(Gender::Female)), 0.0186);
        // Unconditional when the gender is unknown or uncovered.
        assert_eq!(cal.forename_frequency("ELIZABETH", None), 0.00949);
        assert_eq!(cal.forename_frequency("ELIZABETH", Some(Gender::Male)), 0.00949);
    }

    #[test]
    fn test_dob_component_frequencies() {
        let cal = test_support::calibration();
        let c = cal.dob_component_frequencies();
        assert!((c.day - 1.0 / 31.0).abs() < 1e-12);
        assert!((c.month - 1.0 / 12.0).abs() < 1e-12);
        assert!((c.year * c.month * c.day - cal.dob_frequency()).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_out_of_range_probability() {
        let mut spec = test_support::spec();
        spec.match_prior = 1.5;
        assert!(matches!(Calibration::from_spec(spec), Err(LinkError::Config(_))));

        let mut spec = test_support::spec();
        spec.error_rates.gender = 0.0;
        assert!(matches!(Calibration::from_spec(spec), Err(LinkError::Config(_))));
    }

    #[test]
    fn test_rejects_unknown_gender_symbol() {
        let mut spec = test_support::spec();
        spec.gender_frequencies.insert("Q".to_string(), 0.1);
        assert!(matches!(Calibration::from_spec(spec), Err(LinkError::Config(_))));
    }

    #[test]
    fn test_rejects_unknown_json_keys() {
        let err = serde_json::from_str::<CalibrationSpec>(r#"{ "match_prior": 0.1, "typo": 1 }"#);
        assert!(err.is_err());
    }
}
