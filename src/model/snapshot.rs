//! Snapshot: the most recently observed content of a watcher.
//!
//! At most one snapshot exists per watcher; change detection overwrites it
//! in place.
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub watcher_id: i64,
    pub content: Vec<u8>,
    /// Hex SHA-256 over the raw content bytes.
    pub content_hash: String,
    pub content_size: i64,
    pub content_type: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}
