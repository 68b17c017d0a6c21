// ABOUTME: Write-ahead log sequence number type
// ABOUTME: Parses and prints the HIGH/LOW hexadecimal form PostgreSQL uses

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A position in the write-ahead log.
///
/// Ordered as a single 64-bit ordinal; `high` and `low` are the two 32-bit halves shown in
/// PostgreSQL's textual form (`16/B374D848`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LsnParseError(String);

impl fmt::Display for LsnParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid LSN '{}': expected HIGH/LOW hexadecimal", self.0)
    }
}

impl std::error::Error for LsnParseError {}

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub const fn new(high: u32, low: u32) -> Self {
        Lsn(((high as u64) << 32) | low as u64)
    }

    pub const fn from_u64(value: u64) -> Self {
        Lsn(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn low(self) -> u32 {
        self.0 as u32
    }
}

fn parse_half(part: &str, input: &str) -> Result<u32, LsnParseError> {
    if part.is_empty() || part.len() > 8 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(LsnParseError(input.to_string()));
    }
    u32::from_str_radix(part, 16).map_err(|_| LsnParseError(input.to_string()))
}

impl FromStr for Lsn {
    type Err = LsnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (high, low) = trimmed
            .split_once('/')
            .ok_or_else(|| LsnParseError(s.to_string()))?;
        Ok(Lsn::new(parse_half(high, s)?, parse_half(low, s)?))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.high(), self.low())
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
