//! Watcher: a monitored endpoint definition plus its observable status.
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::Header;
use crate::error::Error;

/// How a watcher is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Only the scheduler runs it.
    Scheduled,
    /// Only explicit one-shot runs.
    Manual,
    /// Both.
    Both,
}

impl ExecutionMode {
    /// The scheduler may dispatch this watcher.
    pub fn schedulable(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Both)
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Manual => write!(f, "manual"),
            Self::Both => write!(f, "both"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            "both" => Ok(Self::Both),
            _ => Err("unknown execution mode"),
        }
    }
}

/// Rule for canonicalizing response bytes before hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonMode {
    /// Exact bytes.
    Hash,
    /// Whitespace-insensitive text comparison.
    ContentAware,
    /// Compare hashes but never produce a diff.
    Disabled,
}

impl std::fmt::Display for ComparisonMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Hash => write!(f, "hash"),
            Self::ContentAware => write!(f, "content_aware"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

impl std::str::FromStr for ComparisonMode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hash" => Ok(Self::Hash),
            "content_aware" => Ok(Self::ContentAware),
            "disabled" => Ok(Self::Disabled),
            _ => Err("unknown comparison mode"),
        }
    }
}

/// Watcher run state. `Running` is transient, held only while one
/// execution is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl std::fmt::Display for WatcherStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for WatcherStatus {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            _ => Err("unknown watcher status"),
        }
    }
}

/// A monitored endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watcher {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub method: super::HttpMethod,
    pub headers: Vec<Header>,
    pub body: Option<Vec<u8>>,
    pub execution_mode: ExecutionMode,
    /// Seconds between scheduled runs. Required when the watcher is
    /// schedulable.
    pub watch_interval: Option<i64>,
    pub is_active: bool,
    /// Absorb response Set-Cookie headers into the cookie store.
    pub save_cookies: bool,
    /// Attach cookies owned by `cookie_watcher_id` to outgoing requests.
    pub use_cookies: bool,
    pub cookie_watcher_id: Option<i64>,
    pub comparison_mode: ComparisonMode,
    pub status: WatcherStatus,
    pub error_message: Option<String>,
    pub check_count: i64,
    pub change_count: i64,
    pub last_checked_at: Option<OffsetDateTime>,
    pub last_changed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl Watcher {
    /// The scheduler should dispatch this watcher now.
    ///
    /// True for active, schedulable watchers with an interval that either
    /// never ran or whose interval has elapsed.
    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        if !self.is_active || !self.execution_mode.schedulable() {
            return false;
        }

        let interval = match self.watch_interval {
            Some(interval) => interval,
            None => return false,
        };

        match self.last_checked_at {
            None => true,
            Some(last) => (now - last).whole_seconds() >= interval,
        }
    }
}

/// Payload for creating a watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWatcher {
    pub name: String,
    pub url: String,
    pub method: super::HttpMethod,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub watch_interval: Option<i64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub save_cookies: bool,
    #[serde(default)]
    pub use_cookies: bool,
    #[serde(default)]
    pub cookie_watcher_id: Option<i64>,
    pub comparison_mode: ComparisonMode,
}

fn default_true() -> bool {
    true
}

impl NewWatcher {
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("watcher name is empty".into()));
        }

        let url = url::Url::parse(&self.url)
            .map_err(|err| Error::Validation(format!("invalid url \"{}\": {}", self.url, err)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Validation(format!(
                "unsupported url scheme \"{}\"",
                url.scheme()
            )));
        }

        if self.execution_mode.schedulable() {
            match self.watch_interval {
                Some(interval) if interval > 0 => (),
                _ => {
                    return Err(Error::Validation(
                        "scheduled watchers require a positive watch_interval".into(),
                    ))
                }
            }
        }

        if self.use_cookies && self.cookie_watcher_id.is_none() {
            return Err(Error::Validation(
                "use_cookies requires cookie_watcher_id".into(),
            ));
        }

        Ok(())
    }
}

/// Partial update of a watcher. `None` fields are left unchanged;
/// nullable columns use a nested `Option` to distinguish "clear" from
/// "keep".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatcherUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub method: Option<super::HttpMethod>,
    pub headers: Option<Vec<Header>>,
    pub body: Option<Option<Vec<u8>>>,
    pub execution_mode: Option<ExecutionMode>,
    pub watch_interval: Option<Option<i64>>,
    pub is_active: Option<bool>,
    pub save_cookies: Option<bool>,
    pub use_cookies: Option<bool>,
    pub cookie_watcher_id: Option<Option<i64>>,
    pub comparison_mode: Option<ComparisonMode>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::HttpMethod;
    use time::Duration;

    fn new_watcher() -> NewWatcher {
        NewWatcher {
            name: "example".into(),
            url: "https://example.com/status".into(),
            method: HttpMethod::Get,
            headers: vec![],
            body: None,
            execution_mode: ExecutionMode::Scheduled,
            watch_interval: Some(60),
            is_active: true,
            save_cookies: false,
            use_cookies: false,
            cookie_watcher_id: None,
            comparison_mode: ComparisonMode::Hash,
        }
    }

    #[test]
    fn test_validate() {
        assert!(new_watcher().validate().is_ok());

        let mut watcher = new_watcher();
        watcher.watch_interval = None;
        assert!(watcher.validate().is_err());

        let mut watcher = new_watcher();
        watcher.execution_mode = ExecutionMode::Manual;
        watcher.watch_interval = None;
        assert!(watcher.validate().is_ok());

        let mut watcher = new_watcher();
        watcher.url = "ftp://example.com".into();
        assert!(watcher.validate().is_err());

        let mut watcher = new_watcher();
        watcher.use_cookies = true;
        assert!(watcher.validate().is_err());
    }

    #[test]
    fn test_is_due() {
        let now = OffsetDateTime::now_utc();
        let watcher = Watcher {
            id: 1,
            name: "example".into(),
            url: "https://example.com".into(),
            method: HttpMethod::Get,
            headers: vec![],
            body: None,
            execution_mode: ExecutionMode::Scheduled,
            watch_interval: Some(60),
            is_active: true,
            save_cookies: false,
            use_cookies: false,
            cookie_watcher_id: None,
            comparison_mode: ComparisonMode::Hash,
            status: WatcherStatus::Pending,
            error_message: None,
            check_count: 0,
            change_count: 0,
            last_checked_at: None,
            last_changed_at: None,
            created_at: now,
        };

        // Never checked.
        assert!(watcher.is_due(now));

        let mut checked = watcher.clone();
        checked.last_checked_at = Some(now - Duration::seconds(30));
        assert!(!checked.is_due(now));

        checked.last_checked_at = Some(now - Duration::seconds(61));
        assert!(checked.is_due(now));

        let mut manual = watcher.clone();
        manual.execution_mode = ExecutionMode::Manual;
        assert!(!manual.is_due(now));

        let mut inactive = watcher;
        inactive.is_active = false;
        assert!(!inactive.is_due(now));
    }
}
