//! Difficulty type with lossless 256-bit representation.

use std::fmt;
use std::str::FromStr;

use ruint::aliases::U256;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Largest decimal exponent accepted when expanding scientific notation.
///
/// 10^78 already exceeds 2^256, so anything larger can only overflow.
const MAX_EXPONENT: i64 = 78;

/// Share difficulty as reported by a device.
///
/// AxeOS firmwares report `bestDiff` in several textual forms depending
/// on version: plain integers (`"1234567"`), SI-suffixed values
/// (`"4.29G"`, `"512k"`), scientific notation (`"1.5e9"`), or bare JSON
/// numbers. All of them parse to the same exact integer so that records
/// compare numerically, never as text.
///
/// Fractional parts are truncated: `"1.9"` is difficulty 1. This matches
/// how the devices themselves count difficulty (whole shares), and keeps
/// comparison exact without floating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Difficulty(U256);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseDifficultyError {
    #[error("empty difficulty")]
    Empty,

    #[error("negative difficulty: {0}")]
    Negative(String),

    #[error("malformed difficulty: {0}")]
    Malformed(String),

    #[error("difficulty out of range: {0}")]
    Overflow(String),
}

impl Difficulty {
    pub const ZERO: Self = Self(U256::ZERO);

    /// Exact decimal representation without suffixes.
    pub fn to_plain_string(&self) -> String {
        self.0.to_string()
    }

    /// Get difficulty as f64 (lossy for very large values).
    pub fn as_f64(&self) -> f64 {
        self.to_plain_string().parse().unwrap_or(f64::MAX)
    }
}

impl From<u64> for Difficulty {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl FromStr for Difficulty {
    type Err = ParseDifficultyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.is_empty() || text == "-" {
            return Err(ParseDifficultyError::Empty);
        }
        let malformed = || ParseDifficultyError::Malformed(s.to_string());
        let overflow = || ParseDifficultyError::Overflow(s.to_string());

        if text.starts_with('-') {
            return Err(ParseDifficultyError::Negative(s.to_string()));
        }
        let text = text.strip_prefix('+').unwrap_or(text);

        // SI suffix as printed by AxeOS (upper or lower case)
        let (text, suffix_exp) = match text.chars().last() {
            Some(c) if c.is_ascii_alphabetic() && !matches!(c, 'e' | 'E') => {
                let exp = match c.to_ascii_uppercase() {
                    'K' => 3,
                    'M' => 6,
                    'G' => 9,
                    'T' => 12,
                    'P' => 15,
                    _ => return Err(malformed()),
                };
                (text[..text.len() - 1].trim_end(), exp)
            }
            _ => (text, 0),
        };

        let (mantissa, exp) = match text.find(['e', 'E']) {
            Some(pos) => {
                let exp: i64 = text[pos + 1..].parse().map_err(|_| malformed())?;
                (&text[..pos], exp)
            }
            None => (text, 0),
        };

        let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if (int_part.is_empty() && frac_part.is_empty())
            || !all_digits(int_part)
            || !all_digits(frac_part)
        {
            return Err(malformed());
        }

        let scale = i64::try_from(frac_part.len())
            .ok()
            .and_then(|frac_len| exp.checked_add(suffix_exp)?.checked_sub(frac_len))
            .ok_or_else(overflow)?;
        if scale > MAX_EXPONENT {
            return Err(overflow());
        }

        let mut digits = format!("{int_part}{frac_part}");
        if scale >= 0 {
            digits.extend(std::iter::repeat_n('0', scale as usize));
        } else {
            let keep = digits.len().saturating_sub(scale.unsigned_abs() as usize);
            digits.truncate(keep);
        }

        let digits = digits.trim_start_matches('0');
        if digits.is_empty() {
            return Ok(Self::ZERO);
        }
        U256::from_str_radix(digits, 10)
            .map(Self)
            .map_err(|_| overflow())
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.as_f64();
        let mut unit = SI_UNITS
            .iter()
            .rposition(|(scale, _)| value >= *scale)
            .unwrap_or(0);

        loop {
            let (scale, suffix) = SI_UNITS[unit];
            let scaled = value / scale;

            // Whole numbers print without decimals: "1M", "500"
            if scaled.fract() == 0.0 {
                return write!(f, "{scaled:.0}{suffix}");
            }

            // Precision follows the rounded magnitude, so 9.999 prints as
            // "10.0" and 99.99 as "100".
            let decimals = decimals_for(scaled);
            let decimals = decimals.min(decimals_for(round_to(scaled, decimals)));
            let rounded = round_to(scaled, decimals);
            if rounded >= 1000.0 && unit + 1 < SI_UNITS.len() {
                unit += 1;
                continue;
            }
            return write!(f, "{rounded:.decimals$}{suffix}");
        }
    }
}

/// Display units, smallest first.
const SI_UNITS: [(f64, &str); 6] = [
    (1.0, ""),
    (1e3, "K"),
    (1e6, "M"),
    (1e9, "G"),
    (1e12, "T"),
    (1e15, "P"),
];

/// "112T", "11.2T", "1.12T"
fn decimals_for(scaled: f64) -> usize {
    if scaled >= 100.0 {
        0
    } else if scaled >= 10.0 {
        1
    } else {
        2
    }
}

fn round_to(value: f64, decimals: usize) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

impl Serialize for Difficulty {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_plain_string())
    }
}

impl<'de> Deserialize<'de> for Difficulty {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(DifficultyVisitor)
    }
}

/// Accepts strings in any form [`FromStr`] understands, and JSON numbers.
struct DifficultyVisitor;

impl Visitor<'_> for DifficultyVisitor {
    type Value = Difficulty;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a difficulty as a string or non-negative number")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Difficulty, E> {
        Ok(Difficulty::from(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Difficulty, E> {
        u64::try_from(v)
            .map(Difficulty::from)
            .map_err(|_| E::custom(ParseDifficultyError::Negative(v.to_string())))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Difficulty, E> {
        if !v.is_finite() {
            return Err(E::custom(ParseDifficultyError::Malformed(v.to_string())));
        }
        format!("{:.0}", v.trunc()).parse().map_err(E::custom)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Difficulty, E> {
        v.parse().map_err(E::custom)
    }
}
