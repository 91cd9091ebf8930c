//! Change detection: normalize, hash, classify, diff.
//!
//! The pipeline is pure; persistence of its result happens in one storage
//! transaction (`Storage::commit_check`).
use sha2::{Digest, Sha256};
use similar::TextDiff;
use std::borrow::Cow;

use crate::model::{ChangeType, ComparisonMode, Snapshot};

/// Canonicalize content under a comparison mode.
///
/// `content_aware` collapses every whitespace run to a single space and
/// trims the ends; content that isn't UTF-8 is left as-is. The other
/// modes compare exact bytes.
pub fn normalize(content: &[u8], mode: ComparisonMode) -> Cow<'_, [u8]> {
    match mode {
        ComparisonMode::Hash | ComparisonMode::Disabled => Cow::Borrowed(content),
        ComparisonMode::ContentAware => match std::str::from_utf8(content) {
            Ok(text) => {
                let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
                Cow::Owned(collapsed.into_bytes())
            }
            Err(_) => Cow::Borrowed(content),
        },
    }
}

/// Hex SHA-256 of the given bytes.
pub fn content_hash(content: &[u8]) -> String {
    Sha256::digest(content)
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

/// Unified line diff with `old`/`new` headers. `None` when either side
/// isn't UTF-8 text.
pub fn diff(old: &[u8], new: &[u8]) -> Option<Vec<u8>> {
    let old = std::str::from_utf8(old).ok()?;
    let new = std::str::from_utf8(new).ok()?;

    let text = TextDiff::from_lines(old, new)
        .unified_diff()
        .header("old", "new")
        .to_string();

    if text.is_empty() {
        None
    } else {
        Some(text.into_bytes())
    }
}

/// Outcome of classifying one observation against the previous snapshot.
#[derive(Debug, Clone)]
pub struct Detection {
    pub change_type: ChangeType,
    /// Canonical hash of the previous snapshot, absent on first
    /// observation.
    pub old_hash: Option<String>,
    /// Canonical hash of the new body.
    pub new_hash: String,
    pub old_size: Option<i64>,
    pub new_size: i64,
    pub old_content: Option<Vec<u8>>,
    pub diff: Option<Vec<u8>>,
    /// The snapshot content must be (re)written. False for `unchanged`,
    /// where only `updated_at` is refreshed.
    pub write_snapshot: bool,
}

/// Classify a new response body against the watcher's snapshot.
pub fn detect(snapshot: Option<&Snapshot>, body: &[u8], mode: ComparisonMode) -> Detection {
    let new_hash = content_hash(&normalize(body, mode));
    let new_size = body.len() as i64;

    let snapshot = match snapshot {
        Some(snapshot) => snapshot,
        None => {
            return Detection {
                change_type: ChangeType::New,
                old_hash: None,
                new_hash,
                old_size: None,
                new_size,
                old_content: None,
                diff: None,
                write_snapshot: true,
            }
        }
    };

    // Renormalize the stored content: the comparison mode may have
    // changed since the snapshot was written.
    let old_hash = content_hash(&normalize(&snapshot.content, mode));

    if old_hash == new_hash {
        Detection {
            change_type: ChangeType::Unchanged,
            old_hash: Some(old_hash),
            new_hash,
            old_size: Some(snapshot.content_size),
            new_size,
            old_content: Some(snapshot.content.clone()),
            diff: None,
            write_snapshot: false,
        }
    } else {
        let diff = match mode {
            ComparisonMode::Disabled => None,
            _ => diff(&snapshot.content, body),
        };

        Detection {
            change_type: ChangeType::Modified,
            old_hash: Some(old_hash),
            new_hash,
            old_size: Some(snapshot.content_size),
            new_size,
            old_content: Some(snapshot.content.clone()),
            diff,
            write_snapshot: true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use time::OffsetDateTime;

    fn snapshot(content: &[u8]) -> Snapshot {
        Snapshot {
            id: 1,
            watcher_id: 1,
            content: content.to_vec(),
            content_hash: content_hash(content),
            content_size: content.len() as i64,
            content_type: None,
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_sha256() {
        // SHA-256 of the empty string.
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            content_hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_normalize_content_aware() {
        let normalized = normalize(b"  a   b\n", ComparisonMode::ContentAware);
        assert_eq!(normalized.as_ref(), b"a b");

        // Exact-byte modes leave content alone.
        let raw = normalize(b"  a   b\n", ComparisonMode::Hash);
        assert_eq!(raw.as_ref(), b"  a   b\n");

        // Binary content falls back to raw bytes.
        let binary = vec![0u8, 159, 146, 150];
        let normalized = normalize(&binary, ComparisonMode::ContentAware);
        assert_eq!(normalized.as_ref(), binary.as_slice());
    }

    #[test]
    fn test_first_observation() {
        let detection = detect(None, b"hello", ComparisonMode::Hash);
        assert_eq!(detection.change_type, ChangeType::New);
        assert_eq!(detection.old_hash, None);
        assert_eq!(detection.new_hash, content_hash(b"hello"));
        assert_eq!(detection.new_size, 5);
        assert!(detection.diff.is_none());
        assert!(detection.write_snapshot);
    }

    #[test]
    fn test_unchanged() {
        let snap = snapshot(b"hello");
        let detection = detect(Some(&snap), b"hello", ComparisonMode::Hash);
        assert_eq!(detection.change_type, ChangeType::Unchanged);
        assert_eq!(detection.old_hash, detection.new_hash.clone().into());
        assert!(detection.diff.is_none());
        assert!(!detection.write_snapshot);
    }

    #[test]
    fn test_modified_with_diff() {
        let snap = snapshot(b"hello");
        let detection = detect(Some(&snap), b"hello world", ComparisonMode::Hash);
        assert_eq!(detection.change_type, ChangeType::Modified);
        assert_ne!(detection.old_hash.as_deref(), Some(detection.new_hash.as_str()));

        let diff = String::from_utf8(detection.diff.unwrap()).unwrap();
        assert!(diff.contains("-hello"));
        assert!(diff.contains("+hello world"));
        assert!(diff.contains("--- old"));
        assert!(diff.contains("+++ new"));
    }

    #[test]
    fn test_modified_disabled_suppresses_diff() {
        let snap = snapshot(b"hello");
        let detection = detect(Some(&snap), b"goodbye", ComparisonMode::Disabled);
        assert_eq!(detection.change_type, ChangeType::Modified);
        assert!(detection.diff.is_none());
    }

    #[test]
    fn test_content_aware_equivalence() {
        // Whitespace-only differences are not changes.
        let snap = snapshot(b"  a   b\n");
        let detection = detect(Some(&snap), b"a b", ComparisonMode::ContentAware);
        assert_eq!(detection.change_type, ChangeType::Unchanged);
    }

    #[test]
    fn test_binary_modified_has_no_diff() {
        let snap = snapshot(&[0u8, 159, 146, 150]);
        let detection = detect(Some(&snap), &[1u8, 2, 3], ComparisonMode::Hash);
        assert_eq!(detection.change_type, ChangeType::Modified);
        assert!(detection.diff.is_none());
    }

    #[test]
    fn test_empty_body() {
        let detection = detect(None, b"", ComparisonMode::Hash);
        assert_eq!(detection.new_size, 0);
        assert_eq!(
            detection.new_hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
