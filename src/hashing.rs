//! Keyed one-way hashing of comparison tokens.
//!
//! Hashed mode replaces every comparison token with HMAC-SHA-256 under a
//! caller-supplied key, so two sites holding the same key can compare records
//! without exchanging plaintext. Equality of tokens is all the hash preserves;
//! frequencies are rounded before emission so that the leak is banded.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::LinkError;

type HmacSha256 = Hmac<Sha256>;

/// Well-known key accepted only behind an explicit opt-in flag. Fine for
/// development fixtures, useless for privacy.
pub const DEFAULT_DEV_KEY: &str = "idlink-development-key-do-not-use";

/// Deterministic keyed hasher over comparison tokens.
///
/// The key is never logged or serialised; `Debug` is deliberately opaque.
#[derive(Clone)]
pub struct KeyedHasher {
    key: Vec<u8>,
}

impl KeyedHasher {
    pub fn new(key: &str) -> Result<Self, LinkError> {
        if key.is_empty() {
            return Err(LinkError::config("hash key must not be empty"));
        }
        Ok(KeyedHasher { key: key.as_bytes().to_vec() })
    }

    /// Hash one token to 64 lowercase hex characters.
    pub fn hash(&self, token: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any length");
        mac.update(token.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl fmt::Debug for KeyedHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyedHasher(..)")
    }
}

/// Resolve the hash key from the command line: an explicit key, or the
/// development key behind its opt-in flag, or a configuration error.
pub fn resolve_key(key: Option<&str>, allow_default_key: bool) -> Result<&str, LinkError> {
    match (key, allow_default_key) {
        (Some(key), _) => Ok(key),
        (None, true) => Ok(DEFAULT_DEV_KEY),
        (None, false) => Err(LinkError::config(
            "no --key given; pass --allow-default-key only for development data",
        )),
    }
}

/// Round to `figures` significant figures. Used on every frequency emitted
/// into a hashed person record so the exact table value does not leak.
///
/// A probability strictly below 1 never rounds up to 1: emitted frequencies
/// must stay inside the open interval (0, 1) or the kernel would reject the
/// hashed record outright.
pub fn round_sig_figs(value: f64, figures: u32) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }
    let magnitude = value.abs().log10().floor() as i32;
    let factor = 10f64.powi(figures as i32 - 1 - magnitude);
    let rounded = (value * factor).round() / factor;
    if value < 1.0 && rounded >= 1.0 {
        (value * factor).floor() / factor
    } else {
        rounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_same_output() {
        let h = KeyedHasher::new("key-one").unwrap();
        assert_eq!(h.hash("SMITH"), h.hash("SMITH"));
    }

    #[test]
    fn test_different_keys_diverge() {
        let a = KeyedHasher::new("key-one").unwrap();
        let b = KeyedHasher::new("key-two").unwrap();
        assert_ne!(a.hash("SMITH"), b.hash("SMITH"));
    }

    #[test]
    fn test_output_is_fixed_width_hex() {
        let h = KeyedHasher::new("key").unwrap();
        for token in ["SMITH", "X", ""] {
            let out = h.hash(token);
            assert_eq!(out.len(), 64);
            assert!(out.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_hash_does_not_contain_input() {
        let h = KeyedHasher::new("key").unwrap();
        let out = h.hash("ELIZABETH");
        assert!(!out.to_uppercase().contains("ELIZABETH"));
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(KeyedHasher::new(""), Err(LinkError::Config(_))));
    }

    #[test]
    fn test_debug_never_prints_key() {
        let h = KeyedHasher::new("very-secret").unwrap();
        let printed = format!("{h:?}");
        assert!(!printed.contains("very-secret"));
    }

    #[test]
    fn test_resolve_key() {
        assert_eq!(resolve_key(Some("secret"), false).unwrap(), "secret");
        assert_eq!(resolve_key(None, true).unwrap(), DEFAULT_DEV_KEY);
        assert!(matches!(resolve_key(None, false), Err(LinkError::Config(_))));
    }

    #[test]
    fn test_round_sig_figs() {
        assert_eq!(round_sig_figs(0.0117234, 3), 0.0117);
        assert_eq!(round_sig_figs(0.00949, 2), 0.0095);
        assert_eq!(round_sig_figs(3.04e-5, 3), 3.04e-5);
        assert_eq!(round_sig_figs(0.0, 3), 0.0);
    }

    #[test]
    fn test_rounding_never_reaches_one() {
        // A frequency just under 1 rounds down, not up out of (0, 1).
        assert_eq!(round_sig_figs(0.9999, 3), 0.999);
        assert_eq!(round_sig_figs(0.996, 2), 0.99);
        assert!(round_sig_figs(0.9999999, 1) < 1.0);
    }
}
