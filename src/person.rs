//! The person model: one proband's or candidate's comparison-ready
//! attributes, in either plaintext or hashed form.
//!
//! Both forms share one token representation. A token's `surface` is the
//! normalised plaintext in plaintext mode and a keyed hash in hashed mode;
//! the comparator only ever tests surface equality and reads the stored
//! frequencies, so a single kernel serves both modes and the two can never
//! drift apart numerically.
//!
//! Persons are created on ingest and never mutated.

use crate::calibration::Calibration;
use crate::error::LinkError;
use crate::hashing::{round_sig_figs, KeyedHasher};
use crate::metaphone;
use crate::normalize::{
    normalize_name, normalize_postcode, parse_gender, parse_partial_date, Gender,
};

/// Whether a person's tokens are plaintext or keyed hashes. A record-level
/// tag: mixing forms within one person is impossible by construction, and
/// the kernel refuses to compare across modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonMode {
    Plaintext,
    Hashed,
}

/// A name with its phonetic code and the frequencies resolved at build time.
#[derive(Debug, Clone, PartialEq)]
pub struct NameToken {
    /// Normalised name, or its keyed hash.
    pub surface: String,
    /// Primary Double Metaphone code, or its keyed hash. `None` when the
    /// name produced no code; an absent code never matches anything.
    pub phonetic: Option<String>,
    /// P(a random person carries this name).
    pub frequency: f64,
    /// P(a random person's name shares this phonetic code).
    pub phonetic_frequency: f64,
}

/// Date of birth with independently-nullable components, kept as strings so
/// hashed components drop in without a second representation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DateToken {
    pub year: Option<String>,
    pub month: Option<String>,
    pub day: Option<String>,
}

impl DateToken {
    pub fn is_empty(&self) -> bool {
        self.year.is_none() && self.month.is_none() && self.day.is_none()
    }
}

/// A postcode unit and its sector, each with a population frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct PostcodeToken {
    pub unit: String,
    pub sector: String,
    pub unit_frequency: f64,
    pub sector_frequency: f64,
}

/// A gender value (F, M or X symbol, or its hash) with its population
/// frequency. An unknown gender is represented by the absence of the token.
#[derive(Debug, Clone, PartialEq)]
pub struct GenderToken {
    pub value: String,
    pub frequency: f64,
}

/// A raw input record as read from a plaintext file, before normalisation.
#[derive(Debug, Clone, Default)]
pub struct RawRecord {
    pub local_id: String,
    pub first_name: String,
    pub middle_names: Vec<String>,
    pub surname: String,
    pub dob: String,
    pub gender: String,
    pub postcodes: Vec<String>,
    pub other_info: String,
}

/// One comparison-ready person.
#[derive(Debug, Clone)]
pub struct Person {
    pub local_id: String,
    pub mode: PersonMode,
    pub first_name: Option<NameToken>,
    pub middle_names: Vec<NameToken>,
    pub surname: Option<NameToken>,
    pub dob: DateToken,
    pub gender: Option<GenderToken>,
    pub postcodes: Vec<PostcodeToken>,
    /// Opaque pass-through; never consulted by the comparator.
    pub other_info: Option<String>,
    unmatchable: bool,
}

impl Person {
    /// Assemble a person from already-built tokens, enforcing the record
    /// invariants. Used by the plaintext builder, the hashing derivation and
    /// the hashed-record reader alike.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        mode: PersonMode,
        local_id: String,
        first_name: Option<NameToken>,
        middle_names: Vec<NameToken>,
        surname: Option<NameToken>,
        dob: DateToken,
        gender: Option<GenderToken>,
        postcodes: Vec<PostcodeToken>,
        other_info: Option<String>,
    ) -> Result<Self, LinkError> {
        if local_id.is_empty() {
            return Err(LinkError::input("record with empty local_id"));
        }
        let unmatchable =
            first_name.is_none() && surname.is_none() && dob.is_empty() && postcodes.is_empty();
        Ok(Person {
            local_id,
            mode,
            first_name,
            middle_names,
            surname,
            dob,
            gender,
            postcodes,
            other_info,
            unmatchable,
        })
    }

    /// Build a plaintext person from a raw record, resolving frequencies
    /// against the calibration tables.
    ///
    /// Names and postcodes that fail normalisation become absent tokens; a
    /// malformed date or gender symbol fails the record, because those are
    /// data-quality faults rather than missing values.
    pub fn from_record(record: &RawRecord, cal: &Calibration) -> Result<Self, LinkError> {
        let fail = |msg: String| LinkError::input(format!("record '{}': {msg}", record.local_id));

        let gender_value = parse_gender(&record.gender).map_err(|e| fail(e))?;
        let gender = match gender_value {
            Some(g) => Some(GenderToken {
                value: g.as_str().to_string(),
                frequency: cal.gender_frequency(g)?,
            }),
            None => None,
        };

        let first_name = build_forename(&record.first_name, gender_value, cal);
        let middle_names = record
            .middle_names
            .iter()
            .filter_map(|raw| build_forename(raw, gender_value, cal))
            .collect();
        let surname = normalize_name(&record.surname).map(|name| {
            let phonetic = metaphone::primary(&name);
            NameToken {
                frequency: cal.surname_frequency(&name),
                phonetic_frequency: phonetic
                    .as_deref()
                    .map(|code| cal.surname_metaphone_frequency(code))
                    .unwrap_or(0.0),
                surface: name,
                phonetic,
            }
        });

        let parts = parse_partial_date(&record.dob).map_err(fail)?;
        let dob = DateToken {
            year: parts.year.map(|y| format!("{y:04}")),
            month: parts.month.map(|m| format!("{m:02}")),
            day: parts.day.map(|d| format!("{d:02}")),
        };

        let postcodes = record
            .postcodes
            .iter()
            .filter_map(|raw| normalize_postcode(raw))
            .map(|(unit, sector)| PostcodeToken {
                unit_frequency: cal.postcode_unit_frequency(&unit),
                sector_frequency: cal.postcode_sector_frequency(&sector),
                unit,
                sector,
            })
            .collect();

        let other_info = if record.other_info.is_empty() {
            None
        } else {
            Some(record.other_info.clone())
        };

        Person::assemble(
            PersonMode::Plaintext,
            record.local_id.clone(),
            first_name,
            middle_names,
            surname,
            dob,
            gender,
            postcodes,
            other_info,
        )
    }

    /// Derive the hashed form of a plaintext person: every comparison token
    /// keyed-hashed, every frequency rounded to `sig_figs` significant
    /// figures. Date components are hashed individually so partial-date
    /// comparison still works post-hash; the sector is hashed alongside the
    /// unit so a unit-mismatch/sector-match stays detectable.
    pub fn to_hashed(
        &self,
        hasher: &KeyedHasher,
        sig_figs: u32,
        include_other_info: bool,
    ) -> Result<Person, LinkError> {
        if self.mode != PersonMode::Plaintext {
            return Err(LinkError::internal(format!(
                "person '{}' is already hashed",
                self.local_id
            )));
        }
        let hash_name = |t: &NameToken| NameToken {
            surface: hasher.hash(&t.surface),
            phonetic: t.phonetic.as_deref().map(|code| hasher.hash(code)),
            frequency: round_sig_figs(t.frequency, sig_figs),
            phonetic_frequency: round_sig_figs(t.phonetic_frequency, sig_figs),
        };

        Person::assemble(
            PersonMode::Hashed,
            self.local_id.clone(),
            self.first_name.as_ref().map(hash_name),
            self.middle_names.iter().map(hash_name).collect(),
            self.surname.as_ref().map(hash_name),
            DateToken {
                year: self.dob.year.as_deref().map(|v| hasher.hash(v)),
                month: self.dob.month.as_deref().map(|v| hasher.hash(v)),
                day: self.dob.day.as_deref().map(|v| hasher.hash(v)),
            },
            self.gender.as_ref().map(|g| GenderToken {
                value: hasher.hash(&g.value),
                frequency: round_sig_figs(g.frequency, sig_figs),
            }),
            self.postcodes
                .iter()
                .map(|p| PostcodeToken {
                    unit: hasher.hash(&p.unit),
                    sector: hasher.hash(&p.sector),
                    unit_frequency: round_sig_figs(p.unit_frequency, sig_figs),
                    sector_frequency: round_sig_figs(p.sector_frequency, sig_figs),
                })
                .collect(),
            if include_other_info { self.other_info.clone() } else { None },
        )
    }

    /// True when the record is too sparse to compare: no forename, no
    /// surname, no date-of-birth component and no postcode.
    pub fn is_unmatchable(&self) -> bool {
        self.unmatchable
    }
}

fn build_forename(raw: &str, gender: Option<Gender>, cal: &Calibration) -> Option<NameToken> {
    let name = normalize_name(raw)?;
    let phonetic = metaphone::primary(&name);
    Some(NameToken {
        frequency: cal.forename_frequency(&name, gender),
        phonetic_frequency: phonetic
            .as_deref()
            .map(|code| cal.forename_metaphone_frequency(code, gender))
            .unwrap_or(0.0),
        surface: name,
        phonetic,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::test_support::calibration;

    fn full_record() -> RawRecord {
        RawRecord {
            local_id: "p1".to_string(),
            first_name: "Elizabeth".to_string(),
            middle_names: vec!["Mary".to_string()],
            surname: "Smith".to_string(),
            dob: "1950-01-01".to_string(),
            gender: "F".to_string(),
            postcodes: vec!["CB2 0QQ".to_string()],
            other_info: "{\"ward\":\"A\"}".to_string(),
        }
    }

    #[test]
    fn test_plaintext_build() {
        let p = Person::from_record(&full_record(), &calibration()).unwrap();
        assert_eq!(p.mode, PersonMode::Plaintext);
        let surname = p.surname.as_ref().unwrap();
        assert_eq!(surname.surface, "SMITH");
        assert_eq!(surname.phonetic.as_deref(), Some("SM0"));
        assert_eq!(surname.frequency, 0.01172);
        assert_eq!(surname.phonetic_frequency, 0.01183);
        assert_eq!(p.dob.year.as_deref(), Some("1950"));
        assert_eq!(p.dob.month.as_deref(), Some("01"));
        assert_eq!(p.postcodes[0].sector, "CB20");
        assert!(!p.is_unmatchable());
    }

    #[test]
    fn test_bad_names_become_absent_not_fatal() {
        let mut record = full_record();
        record.first_name = "123".to_string();
        record.postcodes = vec!["??".to_string()];
        let p = Person::from_record(&record, &calibration()).unwrap();
        assert!(p.first_name.is_none());
        assert!(p.postcodes.is_empty());
    }

    #[test]
    fn test_bad_date_or_gender_is_fatal() {
        let mut record = full_record();
        record.dob = "01/01/1950".to_string();
        assert!(matches!(
            Person::from_record(&record, &calibration()),
            Err(LinkError::Input(_))
        ));

        let mut record = full_record();
        record.gender = "Q".to_string();
        assert!(matches!(
            Person::from_record(&record, &calibration()),
            Err(LinkError::Input(_))
        ));
    }

    #[test]
    fn test_unmatchable_detection() {
        let record = RawRecord { local_id: "sparse".to_string(), ..Default::default() };
        let p = Person::from_record(&record, &calibration()).unwrap();
        assert!(p.is_unmatchable());

        // A single postcode is enough to be comparable.
        let record = RawRecord {
            local_id: "pc-only".to_string(),
            postcodes: vec!["CB2 0QQ".to_string()],
            ..Default::default()
        };
        assert!(!Person::from_record(&record, &calibration()).unwrap().is_unmatchable());
    }

    #[test]
    fn test_empty_local_id_rejected() {
        let record = RawRecord { local_id: String::new(), ..Default::default() };
        assert!(matches!(
            Person::from_record(&record, &calibration()),
            Err(LinkError::Input(_))
        ));
    }

    #[test]
    fn test_hashed_derivation_replaces_every_token() {
        let hasher = KeyedHasher::new("test-key").unwrap();
        let plain = Person::from_record(&full_record(), &calibration()).unwrap();
        let hashed = plain.to_hashed(&hasher, 3, false).unwrap();

        assert_eq!(hashed.mode, PersonMode::Hashed);
        assert_eq!(hashed.local_id, "p1");
        let surname = hashed.surname.as_ref().unwrap();
        assert_ne!(surname.surface, "SMITH");
        assert_eq!(surname.surface.len(), 64);
        assert_ne!(surname.phonetic.as_deref(), Some("SM0"));
        // Component nullability survives hashing.
        assert!(hashed.dob.year.is_some());
        assert_ne!(hashed.dob.year.as_deref(), Some("1950"));
        // Frequencies are banded, not exact.
        assert_eq!(surname.frequency, 0.0117);
        assert_eq!(surname.phonetic_frequency, 0.0118);
        // other_info omitted unless requested.
        assert!(hashed.other_info.is_none());
    }

    #[test]
    fn test_hashed_derivation_preserves_partial_dob() {
        let hasher = KeyedHasher::new("test-key").unwrap();
        let mut record = full_record();
        record.dob = "1950-07".to_string();
        let hashed = Person::from_record(&record, &calibration())
            .unwrap()
            .to_hashed(&hasher, 3, false)
            .unwrap();
        assert!(hashed.dob.year.is_some());
        assert!(hashed.dob.month.is_some());
        assert!(hashed.dob.day.is_none());
    }

    #[test]
    fn test_rehashing_a_hashed_person_is_an_error() {
        let hasher = KeyedHasher::new("test-key").unwrap();
        let hashed = Person::from_record(&full_record(), &calibration())
            .unwrap()
            .to_hashed(&hasher, 3, false)
            .unwrap();
        assert!(matches!(
            hashed.to_hashed(&hasher, 3, false),
            Err(LinkError::Internal(_))
        ));
    }

    #[test]
    fn test_no_plaintext_survives_hashing() {
        let hasher = KeyedHasher::new("test-key").unwrap();
        let plain = Person::from_record(&full_record(), &calibration()).unwrap();
        let hashed = plain.to_hashed(&hasher, 3, true).unwrap();

        let mut fields: Vec<String> = Vec::new();
        for token in [&hashed.first_name, &hashed.surname] {
            if let Some(t) = token {
                fields.push(t.surface.clone());
                fields.extend(t.phonetic.clone());
            }
        }
        fields.extend(hashed.dob.year.clone());
        fields.extend(hashed.dob.month.clone());
        fields.extend(hashed.dob.day.clone());
        fields.extend(hashed.gender.as_ref().map(|g| g.value.clone()));
        for pc in &hashed.postcodes {
            fields.push(pc.unit.clone());
            fields.push(pc.sector.clone());
        }
        for plaintext in ["ELIZABETH", "SMITH", "SM0", "CB20QQ"] {
            for field in &fields {
                assert!(
                    !field.to_uppercase().contains(plaintext),
                    "hashed field {field} leaks {plaintext}"
                );
            }
        }
        // other_info is deliberate pass-through, nothing else is.
        assert_eq!(hashed.other_info.as_deref(), Some("{\"ward\":\"A\"}"));
    }
}
