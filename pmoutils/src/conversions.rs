//! Conversions des chaînes de configuration portant une unité.
//!
//! Deux familles sont reconnues : les quantités d'information
//! (`"1B"`, `"1 KB"` = 1000, `"1 KiB"` = 1024, jusqu'au TiB) et les
//! intervalles de temps (`"30 SECS"`, `"1 minute"`, `"2 HOURS"`).
//! Les deux acceptent un espace optionnel entre la valeur et l'unité
//! et ignorent la casse ; un nombre nu vaut respectivement des octets
//! ou des secondes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("failed to convert unit of information: {0}")]
    UnitOfInformation(String),
    #[error("failed to convert time interval: {0}")]
    TimeInterval(String),
}

/// Multiplicateurs vers l'octet, préfixes SI et binaires confondus.
const BYTE_MULTIPLIERS: &[(&str, u64)] = &[
    ("B", 1),
    ("KB", 1000),
    ("KIB", 1024),
    ("MB", 1000 * 1000),
    ("MIB", 1024 * 1024),
    ("GB", 1000 * 1000 * 1000),
    ("GIB", 1024 * 1024 * 1024),
    ("TB", 1000 * 1000 * 1000 * 1000),
    ("TIB", 1024 * 1024 * 1024 * 1024),
];

/// Multiplicateurs vers la seconde. Le pluriel (`S` final) est accepté
/// pour chacune des formes.
const TIME_INTERVALS: &[(&str, u64)] = &[
    ("SEC", 1),
    ("SECOND", 1),
    ("MIN", 60),
    ("MINUTE", 60),
    ("HR", 60 * 60),
    ("HOUR", 60 * 60),
    ("DAY", 60 * 60 * 24),
    ("WK", 60 * 60 * 24 * 7),
    ("WEEK", 60 * 60 * 24 * 7),
];

fn split_value_unit(in_str: &str) -> Option<(u64, String)> {
    let trimmed = in_str.trim();
    let digits_end = trimmed
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_digit())
        .map(|(i, c)| i + c.len_utf8())
        .last()?;
    let value: u64 = trimmed[..digits_end].parse().ok()?;
    let unit = trimmed[digits_end..].trim().to_ascii_uppercase();
    Some((value, unit))
}

/// Convertit une quantité d'information en nombre d'octets.
///
/// ```
/// use pmoutils::unit_of_information_in_bytes;
///
/// assert_eq!(unit_of_information_in_bytes("1").unwrap(), 1);
/// assert_eq!(unit_of_information_in_bytes("1 KB").unwrap(), 1000);
/// assert_eq!(unit_of_information_in_bytes("1 KiB").unwrap(), 1024);
/// ```
pub fn unit_of_information_in_bytes(in_str: &str) -> Result<u64, ConversionError> {
    let err = || ConversionError::UnitOfInformation(in_str.to_string());
    let (value, mut unit) = split_value_unit(in_str).ok_or_else(err)?;

    if unit.is_empty() {
        unit.push('B');
    } else if !unit.ends_with('B') {
        // "1K" est accepté comme raccourci de "1KB".
        unit.push('B');
    }

    BYTE_MULTIPLIERS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, mult)| value * mult)
        .ok_or_else(err)
}

/// Convertit un intervalle de temps en nombre de secondes.
///
/// ```
/// use pmoutils::time_interval_in_seconds;
///
/// assert_eq!(time_interval_in_seconds("1").unwrap(), 1);
/// assert_eq!(time_interval_in_seconds("60 seconds").unwrap(), 60);
/// assert_eq!(time_interval_in_seconds("1 minute").unwrap(), 60);
/// ```
pub fn time_interval_in_seconds(in_str: &str) -> Result<u64, ConversionError> {
    let err = || ConversionError::TimeInterval(in_str.to_string());
    let (value, unit) = split_value_unit(in_str).ok_or_else(err)?;

    if unit.is_empty() {
        return Ok(value);
    }

    let singular = unit.strip_suffix('S').unwrap_or(&unit);
    TIME_INTERVALS
        .iter()
        .find(|(name, _)| *name == singular)
        .map(|(_, mult)| value * mult)
        .ok_or_else(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_without_unit() {
        assert_eq!(unit_of_information_in_bytes("1").unwrap(), 1);
        assert_eq!(unit_of_information_in_bytes("1B").unwrap(), 1);
        assert_eq!(unit_of_information_in_bytes("1 B").unwrap(), 1);
    }

    #[test]
    fn bytes_si_and_binary_prefixes() {
        assert_eq!(unit_of_information_in_bytes("1 KB").unwrap(), 1000);
        assert_eq!(unit_of_information_in_bytes("1 KiB").unwrap(), 1024);
        assert_eq!(unit_of_information_in_bytes("1kb").unwrap(), 1000);
        assert_eq!(unit_of_information_in_bytes("3MB").unwrap(), 3_000_000);
        assert_eq!(
            unit_of_information_in_bytes("2 TiB").unwrap(),
            2 * 1024u64.pow(4)
        );
    }

    #[test]
    fn bytes_invalid_input() {
        assert!(unit_of_information_in_bytes("").is_err());
        assert!(unit_of_information_in_bytes("KB").is_err());
        assert!(unit_of_information_in_bytes("1 XB").is_err());
        assert!(unit_of_information_in_bytes("-1 KB").is_err());
    }

    #[test]
    fn seconds_without_unit() {
        assert_eq!(time_interval_in_seconds("1").unwrap(), 1);
        assert_eq!(time_interval_in_seconds("90").unwrap(), 90);
    }

    #[test]
    fn seconds_all_spellings() {
        for s in ["1 SECOND", "1 SECONDS", "1 SEC", "1 SECS", "1SEC", "1secs"] {
            assert_eq!(time_interval_in_seconds(s).unwrap(), 1, "input: {s}");
        }
        assert_eq!(time_interval_in_seconds("1 minute").unwrap(), 60);
        assert_eq!(time_interval_in_seconds("2 MIN").unwrap(), 120);
        assert_eq!(time_interval_in_seconds("1 HR").unwrap(), 3600);
        assert_eq!(time_interval_in_seconds("1 hour").unwrap(), 3600);
        assert_eq!(time_interval_in_seconds("1 DAY").unwrap(), 86400);
        assert_eq!(time_interval_in_seconds("2 WEEKS").unwrap(), 2 * 604800);
    }

    #[test]
    fn seconds_invalid_input() {
        assert!(time_interval_in_seconds("").is_err());
        assert!(time_interval_in_seconds("SEC").is_err());
        assert!(time_interval_in_seconds("1 LIGHTYEAR").is_err());
    }
}
