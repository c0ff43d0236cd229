//! Carfile and cache-attempt domain types.

use crate::hash::CidHash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status shared by cache attempts and block records.
///
/// Blocks move `Pending -> Success | Failed` (and are stamped `Timeout`
/// when their attempt's lease expires, or `Restore` when their holder
/// quits). Attempts run in `Running` and are terminal in `Success`,
/// `Failed` or `Timeout`; `Restore` marks an attempt whose replication was
/// lost and can be resumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Restore,
}

impl CacheStatus {
    /// Whether an attempt in this status has finished for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Restore => "restore",
        }
    }

    /// Parse the stored form back. Unknown strings are an error so schema
    /// drift surfaces instead of silently misclassifying rows.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "restore" => Ok(Self::Restore),
            other => Err(crate::Error::Serialization(format!(
                "unknown cache status: {other}"
            ))),
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of one cache attempt, unique per area.
///
/// Deterministic: the carfile hash plus the attempt ordinal, so the n-th
/// attempt for a carfile always carries the same id across restarts.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheId(String);

impl CacheId {
    pub fn new(carfile_hash: &CidHash, ordinal: i64) -> Self {
        Self(format!("{}_{}", carfile_hash.as_str(), ordinal))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheId({})", self.0)
    }
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal_flags() {
        for status in [CacheStatus::Success, CacheStatus::Failed, CacheStatus::Timeout] {
            assert!(status.is_terminal());
        }
        for status in [CacheStatus::Pending, CacheStatus::Running, CacheStatus::Restore] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            CacheStatus::Pending,
            CacheStatus::Running,
            CacheStatus::Success,
            CacheStatus::Failed,
            CacheStatus::Timeout,
            CacheStatus::Restore,
        ] {
            assert_eq!(CacheStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(CacheStatus::parse("done").is_err());
    }

    #[test]
    fn test_cache_id_is_deterministic() {
        let hash = CidHash::from_hex("0a0b0c");
        assert_eq!(CacheId::new(&hash, 1), CacheId::new(&hash, 1));
        assert_ne!(CacheId::new(&hash, 1), CacheId::new(&hash, 2));
    }
}
