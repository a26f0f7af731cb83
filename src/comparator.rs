//! Comparator kernel: per-attribute log-likelihood ratios combined into a
//! posterior log odds.
//!
//! All probabilities are held and combined as log odds. The accumulation
//! order is fixed (prior, forename, middle names, surname, date of birth,
//! gender, postcode) and identical in plaintext and hashed mode, so the two
//! modes and any worker count produce bit-identical sums.
//!
//! Chance probabilities are anchored on the proband: the candidate is the
//! random draw, so P(D|¬H) asks how likely a random person is to produce the
//! observed agreement with the proband's attributes.

use crate::calibration::Calibration;
use crate::error::LinkError;
use crate::person::{DateToken, GenderToken, NameToken, Person, PostcodeToken};

/// Posterior log odds of a rejected pairing. Any outright mismatch on a
/// name, the full date of birth or every postcode pair short-circuits to
/// this; the decision rule can never accept it.
pub const REJECTED: f64 = f64::NEG_INFINITY;

/// P(match | evidence), derived from posterior log odds.
pub fn posterior_probability(log_odds: f64) -> f64 {
    1.0 / (1.0 + (-log_odds).exp())
}

/// Posterior log odds that `proband` and `candidate` are the same person.
///
/// Returns [`REJECTED`] when an attribute mismatches outright. Errors only
/// on invariant breaches: mixed modes or a non-positive stored frequency.
pub fn compare(proband: &Person, candidate: &Person, cal: &Calibration) -> Result<f64, LinkError> {
    if proband.mode != candidate.mode {
        return Err(LinkError::internal(format!(
            "cannot compare {:?} proband '{}' against {:?} candidate '{}'",
            proband.mode, proband.local_id, candidate.mode, candidate.local_id
        )));
    }
    let errors = cal.error_rates();
    let mut log_odds = cal.prior_log_odds();

    if let (Some(p), Some(c)) = (&proband.first_name, &candidate.first_name) {
        match name_lr(p, c, errors.forename)? {
            Some(lr) => log_odds += lr,
            None => return Ok(REJECTED),
        }
    }

    if !proband.middle_names.is_empty() && !candidate.middle_names.is_empty() {
        log_odds += middle_names_lr(&proband.middle_names, &candidate.middle_names, errors.forename)?;
    }

    if let (Some(p), Some(c)) = (&proband.surname, &candidate.surname) {
        match name_lr(p, c, errors.surname)? {
            Some(lr) => log_odds += lr,
            None => return Ok(REJECTED),
        }
    }

    match dob_lr(&proband.dob, &candidate.dob, cal)? {
        Some(lr) => log_odds += lr,
        None => return Ok(REJECTED),
    }

    if let (Some(p), Some(c)) = (&proband.gender, &candidate.gender) {
        log_odds += gender_lr(p, c, errors.gender)?;
    }

    if !proband.postcodes.is_empty() && !candidate.postcodes.is_empty() {
        match postcode_lr(&proband.postcodes, &candidate.postcodes, errors.postcode)? {
            Some(lr) => log_odds += lr,
            None => return Ok(REJECTED),
        }
    }

    Ok(log_odds)
}

/// Log likelihood ratio for one name attribute present on both sides, or
/// `None` when the pairing must be rejected (surface and phonetic both
/// mismatch, or the phonetic branch is unsupported by calibration).
fn name_lr(proband: &NameToken, candidate: &NameToken, p_err: f64) -> Result<Option<f64>, LinkError> {
    check_frequency(proband.frequency, "name")?;
    if proband.surface == candidate.surface {
        return Ok(Some(((1.0 - p_err) / proband.frequency).ln()));
    }
    if proband.phonetic.is_some() && proband.phonetic == candidate.phonetic {
        // Chance of sharing the proband's phonetic class without sharing
        // the exact name.
        let chance = proband.phonetic_frequency - proband.frequency;
        if chance > 0.0 {
            return Ok(Some((p_err / chance).ln()));
        }
    }
    Ok(None)
}

/// Middle names: each proband middle pairs greedily with its strongest
/// remaining counterpart; anything unpaired (including outright mismatches)
/// is neutral. Middle names add evidence but never reject a candidate, so
/// differently-recorded middles cost nothing.
fn middle_names_lr(
    proband: &[NameToken],
    candidate: &[NameToken],
    p_err: f64,
) -> Result<f64, LinkError> {
    let mut used = vec![false; candidate.len()];
    let mut total = 0.0;
    for p in proband {
        let mut best: Option<(usize, f64)> = None;
        for (i, c) in candidate.iter().enumerate() {
            if used[i] {
                continue;
            }
            if let Some(lr) = name_lr(p, c, p_err)? {
                if best.map_or(true, |(_, b)| lr > b) {
                    best = Some((i, lr));
                }
            }
        }
        if let Some((i, lr)) = best {
            used[i] = true;
            total += lr;
        }
    }
    Ok(total)
}

/// Date of birth. Exact three-component equality is conclusive up to the
/// population DOB frequency; a mix of equal and unequal components is a
/// partial match; all compared components unequal rejects the pairing
/// (which is what makes DOB blocking sound). Components missing on either
/// side contribute a neutral factor of 1.
fn dob_lr(proband: &DateToken, candidate: &DateToken, cal: &Calibration) -> Result<Option<f64>, LinkError> {
    let comp = cal.dob_component_frequencies();
    let p_err = cal.error_rates().dob;
    let pairs = [
        (&proband.year, &candidate.year, comp.year),
        (&proband.month, &candidate.month, comp.month),
        (&proband.day, &candidate.day, comp.day),
    ];

    let mut equal = 0u32;
    let mut unequal = 0u32;
    let mut p_given_match = 1.0;
    let mut p_given_chance = 1.0;
    for (p, c, freq) in pairs {
        match (p, c) {
            (Some(a), Some(b)) if a == b => {
                equal += 1;
                p_given_match *= 1.0 - p_err;
                p_given_chance *= freq;
            }
            (Some(_), Some(_)) => {
                unequal += 1;
                p_given_match *= p_err;
                p_given_chance *= 1.0 - freq;
            }
            _ => {}
        }
    }

    if equal + unequal == 0 {
        return Ok(Some(0.0));
    }
    if unequal == 0 && equal == 3 {
        return Ok(Some((1.0 / cal.dob_frequency()).ln()));
    }
    if equal == 0 {
        return Ok(None);
    }
    Ok(Some((p_given_match / p_given_chance).ln()))
}

fn gender_lr(proband: &GenderToken, candidate: &GenderToken, p_err: f64) -> Result<f64, LinkError> {
    check_frequency(proband.frequency, "gender")?;
    if proband.value == candidate.value {
        Ok(((1.0 - p_err) / proband.frequency).ln())
    } else {
        Ok((p_err / (1.0 - proband.frequency)).ln())
    }
}

/// Postcodes: the best pair across both lists counts, so a non-current
/// postcode never penalises a match. If both sides carry postcodes and no
/// pair reaches at least a sector match, the pairing is rejected.
fn postcode_lr(
    proband: &[PostcodeToken],
    candidate: &[PostcodeToken],
    p_err: f64,
) -> Result<Option<f64>, LinkError> {
    let mut best: Option<f64> = None;
    for p in proband {
        check_frequency(p.unit_frequency, "postcode unit")?;
        for c in candidate {
            let lr = if p.unit == c.unit {
                Some(((1.0 - p_err) / p.unit_frequency).ln())
            } else if p.sector == c.sector {
                let chance = p.sector_frequency - p.unit_frequency;
                if chance > 0.0 {
                    Some((p_err / chance).ln())
                } else {
                    None
                }
            } else {
                None
            };
            if let Some(lr) = lr {
                if best.map_or(true, |b| lr > b) {
                    best = Some(lr);
                }
            }
        }
    }
    Ok(best)
}

fn check_frequency(freq: f64, what: &str) -> Result<(), LinkError> {
    if freq > 0.0 && freq < 1.0 {
        Ok(())
    } else {
        Err(LinkError::internal(format!(
            "{what} frequency {freq} is outside (0, 1); likelihoods would be invalid"
        )))
    }
}
