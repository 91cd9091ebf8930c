//! Change log: one immutable record per classified observation.
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Classification of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// First observation for this watcher.
    New,
    /// Canonical hash differs from the previous snapshot.
    Modified,
    /// Canonical hash matches the previous snapshot.
    Unchanged,
    /// The request itself failed; written by the executor, never by
    /// change detection.
    Error,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Modified => write!(f, "modified"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for ChangeType {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "modified" => Ok(Self::Modified),
            "unchanged" => Ok(Self::Unchanged),
            "error" => Ok(Self::Error),
            _ => Err("unknown change type"),
        }
    }
}

/// One classified observation.
///
/// Invariants: `new` rows have no old_* fields; `modified` rows have
/// `old_hash != new_hash`; `unchanged` rows have equal hashes and no diff;
/// `error` rows carry `error_message` and may have no content at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLog {
    pub id: i64,
    pub watcher_id: i64,
    pub change_type: ChangeType,
    pub old_hash: Option<String>,
    pub new_hash: Option<String>,
    pub old_size: Option<i64>,
    pub new_size: Option<i64>,
    pub old_content: Option<Vec<u8>>,
    pub new_content: Option<Vec<u8>>,
    /// Unified text diff, present only for `modified` rows whose both
    /// sides decode as UTF-8 and whose comparison mode allows diffing.
    pub diff: Option<Vec<u8>>,
    pub error_message: Option<String>,
    pub detected_at: OffsetDateTime,
}
