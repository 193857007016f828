//! Token lifetime parsing
//!
//! Lifetimes are written as `<n><unit>` with unit one of `s`, `m`, `h`, `d`.
//! There is no default unit and no fractional magnitudes.

use thiserror::Error;

/// Error returned when a TTL string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TtlParseError {
    /// Input shorter than one digit plus a unit
    #[error("invalid TTL format, expected a value like '365d', '12h', '30m' or '45s'")]
    TooShort,
    /// Magnitude is not a non-negative integer
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    /// Suffix is not one of s, m, h, d
    #[error("invalid TTL unit '{0}', expected 'd', 'h', 'm' or 's'")]
    UnknownUnit(char),
    /// Zero-length lifetime
    #[error("TTL must be greater than zero")]
    Zero,
    /// Lifetime does not fit in seconds
    #[error("TTL is too large")]
    Overflow,
}

/// Parse a TTL string such as `"365d"` into seconds
pub fn parse_expiration_ttl(ttl: &str) -> Result<i64, TtlParseError> {
    let ttl = ttl.trim();
    let mut chars = ttl.chars();
    let unit = chars.next_back().ok_or(TtlParseError::TooShort)?;
    let magnitude = chars.as_str();
    if magnitude.is_empty() {
        return Err(TtlParseError::TooShort);
    }

    let multiplier: i64 = match unit {
        'd' => 24 * 60 * 60,
        'h' => 60 * 60,
        'm' => 60,
        's' => 1,
        other => return Err(TtlParseError::UnknownUnit(other)),
    };

    if !magnitude.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TtlParseError::InvalidNumber(magnitude.to_string()));
    }
    let value: i64 = magnitude
        .parse()
        .map_err(|_| TtlParseError::Overflow)?;
    if value == 0 {
        return Err(TtlParseError::Zero);
    }

    value.checked_mul(multiplier).ok_or(TtlParseError::Overflow)
}
