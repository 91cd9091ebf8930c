//! `Set-Cookie` header parsing.
//!
//! Response cookies are parsed into structured records before the
//! executor decides whether to absorb them into the cookie store.
use time::format_description::well_known::Rfc2822;
use time::{Duration, OffsetDateTime};

/// One cookie received in a `Set-Cookie` response header.
#[derive(Debug, Clone, PartialEq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    /// Resolved from `Max-Age` (preferred) or `Expires`. `None` marks a
    /// session cookie.
    pub expires: Option<OffsetDateTime>,
    pub secure: bool,
    pub http_only: bool,
}

impl SetCookie {
    /// Parse one `Set-Cookie` header value. Returns `None` when the
    /// leading `name=value` pair is missing.
    pub fn parse(header: &str) -> Option<Self> {
        Self::parse_at(header, OffsetDateTime::now_utc())
    }

    /// `Max-Age` is relative; `now` anchors it.
    pub fn parse_at(header: &str, now: OffsetDateTime) -> Option<Self> {
        let mut parts = header.split(';');

        let (name, value) = parts.next()?.trim().split_once('=')?;
        if name.is_empty() {
            return None;
        }

        let mut cookie = SetCookie {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
            domain: None,
            path: None,
            expires: None,
            secure: false,
            http_only: false,
        };

        let mut max_age = None;
        let mut expires = None;

        for part in parts {
            let part = part.trim();
            let (key, attr) = match part.split_once('=') {
                Some((key, attr)) => (key.trim(), Some(attr.trim())),
                None => (part, None),
            };

            match key.to_ascii_lowercase().as_str() {
                "domain" => cookie.domain = attr.map(|a| a.trim_start_matches('.').to_string()),
                "path" => cookie.path = attr.map(|a| a.to_string()),
                "max-age" => max_age = attr.and_then(|a| a.parse::<i64>().ok()),
                "expires" => expires = attr.and_then(parse_http_date),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => (),
            }
        }

        // Max-Age takes precedence over Expires.
        cookie.expires = match max_age {
            Some(seconds) => Some(now + Duration::seconds(seconds)),
            None => expires,
        };

        Some(cookie)
    }
}

/// Parse an HTTP date (IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`).
fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    let value = value.trim();

    // RFC 2822 parsing wants a numeric offset.
    let normalized = if let Some(stripped) = value.strip_suffix("GMT") {
        format!("{}+0000", stripped)
    } else if let Some(stripped) = value.strip_suffix("UTC") {
        format!("{}+0000", stripped)
    } else {
        value.to_string()
    };

    OffsetDateTime::parse(&normalized, &Rfc2822).ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let cookie = SetCookie::parse("sid=ABC").unwrap();
        assert_eq!(cookie.name, "sid");
        assert_eq!(cookie.value, "ABC");
        assert_eq!(cookie.expires, None);
        assert!(!cookie.secure);
    }

    #[test]
    fn test_parse_attributes() {
        let cookie = SetCookie::parse(
            "token=xyz; Domain=.example.com; Path=/api; Secure; HttpOnly",
        )
        .unwrap();
        assert_eq!(cookie.value, "xyz");
        assert_eq!(cookie.domain.as_deref(), Some("example.com"));
        assert_eq!(cookie.path.as_deref(), Some("/api"));
        assert!(cookie.secure);
        assert!(cookie.http_only);
    }

    #[test]
    fn test_expires() {
        let cookie =
            SetCookie::parse("a=1; Expires=Sun, 06 Nov 2044 08:49:37 GMT").unwrap();
        let expires = cookie.expires.unwrap();
        assert_eq!(expires.year(), 2044);
        assert_eq!(expires.hour(), 8);
    }

    #[test]
    fn test_max_age_wins() {
        let now = OffsetDateTime::now_utc();
        let cookie = SetCookie::parse_at(
            "a=1; Expires=Sun, 06 Nov 2044 08:49:37 GMT; Max-Age=60",
            now,
        )
        .unwrap();
        assert_eq!(cookie.expires, Some(now + Duration::seconds(60)));
    }

    #[test]
    fn test_malformed() {
        assert!(SetCookie::parse("").is_none());
        assert!(SetCookie::parse("no-equals-sign").is_none());
        assert!(SetCookie::parse("=value").is_none());
    }
}
