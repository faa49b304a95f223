//! Slot and action identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const SID_PREFIX: &str = "SID";
const SID_DIGITS: usize = 4;
const SID_TEXT_LEN: usize = SID_PREFIX.len() + SID_DIGITS;

/// Wildcard AID accepted by lease and selector filters.
pub const AID_WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SidParseError {
    #[error("sid must be 7 characters, got {0}")]
    Length(usize),
    #[error("sid must start with 'SID'")]
    Prefix,
    #[error("sid suffix must be ascii digits")]
    Digits,
    #[error("sid value out of range")]
    Range,
}

/// Dense per-menu identifier for an offered action.
///
/// The canonical text form is `SID` followed by four zero-padded decimal digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sid(u16);

impl Sid {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u16 {
        self.0
    }

    /// Strict parse: exact length, `SID` prefix, digits only.
    pub fn parse(text: &str) -> Result<Self, SidParseError> {
        if text.len() != SID_TEXT_LEN {
            return Err(SidParseError::Length(text.len()));
        }
        let Some(digits) = text.strip_prefix(SID_PREFIX) else {
            return Err(SidParseError::Prefix);
        };
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SidParseError::Digits);
        }
        let value: u32 = digits.parse().map_err(|_| SidParseError::Digits)?;
        let value = u16::try_from(value).map_err(|_| SidParseError::Range)?;
        Ok(Self(value))
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SID_PREFIX}{:04}", self.0)
    }
}

impl FromStr for Sid {
    type Err = SidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Sid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Sid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Sid::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Stable identifier naming a tool implementation. Equality is exact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Aid(String);

impl Aid {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == AID_WILDCARD
    }

    /// True when `self` is the wildcard or equals `other` exactly.
    pub fn matches(&self, other: &Aid) -> bool {
        self.is_wildcard() || self == other
    }
}

impl fmt::Display for Aid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Aid {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sid_round_trips_across_canonical_range() {
        for value in 0..=9999u16 {
            let sid = Sid::new(value);
            assert_eq!(Sid::parse(&sid.to_string()), Ok(sid));
        }
    }

    #[test]
    fn sid_text_is_zero_padded() {
        assert_eq!(Sid::new(4).to_string(), "SID0004");
        assert_eq!(Sid::new(1234).to_string(), "SID1234");
    }

    #[test]
    fn sid_parse_rejects_bad_shapes() {
        assert_eq!(Sid::parse("SID004"), Err(SidParseError::Length(6)));
        assert_eq!(Sid::parse("SID9999999"), Err(SidParseError::Length(10)));
        assert_eq!(Sid::parse("XID0004"), Err(SidParseError::Prefix));
        assert_eq!(Sid::parse("sid0004"), Err(SidParseError::Prefix));
        assert_eq!(Sid::parse("SID00a4"), Err(SidParseError::Digits));
        assert_eq!(Sid::parse("SID+004"), Err(SidParseError::Digits));
        assert_eq!(Sid::parse(""), Err(SidParseError::Length(0)));
    }

    #[test]
    fn aid_wildcard_matches_anything() {
        let any = Aid::new(AID_WILDCARD);
        assert!(any.matches(&Aid::new("fs.write_note")));
        assert!(Aid::new("x").matches(&Aid::new("x")));
        assert!(!Aid::new("x").matches(&Aid::new("X")));
    }
}
