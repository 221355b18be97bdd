//! Duration normalization.
//!
//! Resource declarations express health check timings either as human
//! strings (`"30s"`, `"1m30s"`, `"500ms"`) or as bare integers. Container
//! engine APIs use nanoseconds while hand-written declarations use seconds,
//! so integers of at least [`NANOS_THRESHOLD`] are read as nanoseconds and
//! smaller ones as seconds. Everything past this module is a [`Duration`].

use std::time::Duration;

use crate::error::{StevedoreError, StevedoreResult};

/// Integers at or above this value are interpreted as nanoseconds.
pub const NANOS_THRESHOLD: u64 = 1_000_000;

/// Interpret a bare integer duration.
#[must_use]
pub const fn from_integer(value: u64) -> Duration {
    if value >= NANOS_THRESHOLD {
        Duration::from_nanos(value)
    } else {
        Duration::from_secs(value)
    }
}

/// Parse a human duration string such as `"1m30s"` or `"250ms"`.
///
/// # Errors
///
/// Returns [`StevedoreError::Validation`] for empty input, unknown units or
/// numeric overflow.
pub fn parse(input: &str) -> StevedoreResult<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(StevedoreError::validation("empty duration"));
    }

    if let Ok(value) = s.parse::<u64>() {
        return Ok(from_integer(value));
    }

    let invalid = || StevedoreError::validation(format!("invalid duration: {input:?}"));
    let mut total = Duration::ZERO;
    let mut rest = s;

    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ns" => Duration::from_nanos(value),
            "us" | "µs" => Duration::from_micros(value),
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60).ok_or_else(invalid)?),
            "h" => Duration::from_secs(value.checked_mul(3600).ok_or_else(invalid)?),
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total = total.checked_add(part).ok_or_else(invalid)?;
    }

    Ok(total)
}

/// Format a duration in the shortest unit that represents it exactly.
#[must_use]
pub fn format(duration: Duration) -> String {
    let secs = duration.as_secs();
    if duration.subsec_nanos() == 0 {
        if secs > 0 && secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs > 0 && secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    } else if duration.subsec_nanos() % 1_000_000 == 0 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{}ns", duration.as_nanos())
    }
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Integer(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> StevedoreResult<Duration> {
        match self {
            Self::Integer(value) => Ok(from_integer(value)),
            Self::Text(text) => parse(&text),
        }
    }
}

/// Serde adapter for `Duration` fields written as human strings.
pub mod as_human {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::RawDuration;

    /// Serialize as a human string.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format(*value))
    }

    /// Deserialize from a human string or an integer.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        RawDuration::deserialize(deserializer)?
            .into_duration()
            .map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for `Option<Duration>` fields written as human strings.
pub mod as_human_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::RawDuration;

    /// Serialize as an optional human string.
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&super::format(*d)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize from an optional human string or integer.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<RawDuration>::deserialize(deserializer)?
            .map(RawDuration::into_duration)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}
