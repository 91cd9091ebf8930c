//! Stored cookies, keyed by the watcher that earned them.
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One stored cookie. Uniqueness is enforced per `(watcher_id, name)`:
/// storing a watcher's cookies replaces its previous set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cookie {
    pub id: i64,
    pub watcher_id: i64,
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    /// Expiry instant. `None` marks a session cookie that never expires
    /// on its own. Stored values without a timezone are interpreted as UTC.
    pub expires: Option<OffsetDateTime>,
    pub secure: bool,
    pub http_only: bool,
    pub created_at: OffsetDateTime,
}

impl Cookie {
    /// Session cookies never expire; everything else expires when
    /// `expires` has passed.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        match self.expires {
            None => false,
            Some(expires) => expires < now,
        }
    }

    /// Seconds until expiry. `None` for session cookies, negative when
    /// already expired.
    pub fn expires_in_seconds(&self, now: OffsetDateTime) -> Option<i64> {
        self.expires.map(|expires| (expires - now).whole_seconds())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use time::Duration;

    fn cookie(expires: Option<OffsetDateTime>) -> Cookie {
        Cookie {
            id: 1,
            watcher_id: 1,
            name: "sid".into(),
            value: "abc".into(),
            domain: None,
            path: None,
            expires,
            secure: false,
            http_only: false,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_expiry() {
        let now = OffsetDateTime::now_utc();

        let session = cookie(None);
        assert!(!session.is_expired(now));
        assert_eq!(session.expires_in_seconds(now), None);

        let expired = cookie(Some(now - Duration::hours(1)));
        assert!(expired.is_expired(now));
        assert!(expired.expires_in_seconds(now).unwrap() < 0);

        let valid = cookie(Some(now + Duration::hours(2)));
        assert!(!valid.is_expired(now));
        assert!(valid.expires_in_seconds(now).unwrap() > 7000);
    }
}
