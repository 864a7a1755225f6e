//! Lookup status shared by every coalesced lookup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// State of a remotely looked-up item.
///
/// `Pending` results are re-polled; `Confirmed` and `Failed` are terminal
/// and served from cache until invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupStatus {
    /// Not yet resolved; eligible for polling
    Pending,
    /// Resolved successfully
    Confirmed,
    /// Resolved as failed
    Failed,
}

impl LookupStatus {
    /// Whether further polling can change this status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LookupStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LookupStatus::Pending => "pending",
            LookupStatus::Confirmed => "confirmed",
            LookupStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for LookupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LookupStatus {
    type Err = LookupStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(LookupStatus::Pending),
            "confirmed" => Ok(LookupStatus::Confirmed),
            "failed" => Ok(LookupStatus::Failed),
            _ => Err(LookupStatusParseError(s.to_string())),
        }
    }
}

/// Error when parsing an invalid lookup status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupStatusParseError(pub String);

impl fmt::Display for LookupStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid lookup status: {}", self.0)
    }
}

impl std::error::Error for LookupStatusParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!LookupStatus::Pending.is_terminal());
        assert!(LookupStatus::Confirmed.is_terminal());
        assert!(LookupStatus::Failed.is_terminal());
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("Confirmed".parse::<LookupStatus>().unwrap(), LookupStatus::Confirmed);
        assert!("mined".parse::<LookupStatus>().is_err());
    }
}
