//! Process configuration handler.
//!
//! Parses the `vigil.toml` configuration file and makes settings globally
//! available. Every setting has a default, so the file is optional;
//! individual values can also come from `VIGIL_*` environment variables.
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::env::var;
use std::fs::read_to_string;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

static CONFIG: OnceCell<Config> = OnceCell::new();

/// Configuration error.
#[derive(Error, Debug)]
pub enum Error {
    /// Config file is not valid TOML.
    #[error("config: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration file doesn't exist or something went wrong
    /// while reading it.
    #[error("config file not found")]
    Io(#[from] std::io::Error),

    /// A time-of-day setting is not `HH:MM`.
    #[error("invalid time of day: \"{0}\"")]
    TimeOfDay(String),
}

/// Get process configuration.
///
/// Safe to call from anywhere. Loads the config on first use.
pub fn get_config() -> &'static Config {
    CONFIG.get_or_init(Config::load_default)
}

/// Vigil configuration file. Deserialized from TOML.
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Where the configuration file is located.
    #[serde(skip)]
    pub path: Option<PathBuf>,

    /// Outbound HTTP client settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Cookie maintenance settings.
    #[serde(default)]
    pub cookie: CookieConfig,

    /// Database connection settings.
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Config {
    /// Get the configuration.
    ///
    /// Safe to call from anywhere. Loads the config if it's not loaded yet.
    pub fn get() -> &'static Self {
        get_config()
    }

    /// Load the configuration file from the default location.
    pub fn load_default() -> Self {
        for path in ["vigil.toml", "Vigil.toml"] {
            let path = Path::new(path);
            if path.is_file() {
                return match Self::load(path) {
                    Ok(config) => config,
                    Err(err) => {
                        error!("configuration file failed to load: {:?}", err);
                        Config::default()
                    }
                };
            }
        }

        Self::default()
    }

    /// Load the configuration file from a specific path.
    pub fn load(path: impl AsRef<Path> + Copy) -> Result<Config, Error> {
        let file = read_to_string(path)?;
        let mut config: Self = toml::from_str(&file)?;
        config.path = Some(path.as_ref().to_owned());

        Ok(config)
    }

    /// Log some information about the configuration file.
    pub fn log_info(&self) {
        if let Some(ref path) = self.path {
            info!("configuration file \"{}\" loaded", path.display());
        } else {
            info!("configuration file missing, loaded from environment instead");
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match var(name) {
        Ok(value) => value.parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// Outbound HTTP client configuration.
#[derive(Serialize, Deserialize, Clone)]
pub struct HttpConfig {
    /// Total time budget for one request, in seconds.
    #[serde(default = "HttpConfig::default_total_timeout")]
    pub total_timeout: u64,
    /// Connect timeout, in seconds.
    #[serde(default = "HttpConfig::default_connect_timeout")]
    pub connect_timeout: u64,
    /// Read timeout, in seconds.
    #[serde(default = "HttpConfig::default_read_timeout")]
    pub read_timeout: u64,
    /// Maximum number of redirects to follow.
    #[serde(default = "HttpConfig::default_max_redirects")]
    pub max_redirects: usize,
    /// Default `User-Agent`, overridable per watcher via headers.
    #[serde(default = "HttpConfig::default_user_agent")]
    pub user_agent: String,
    /// The terminal where the process is running is a TTY.
    #[serde(default = "HttpConfig::default_tty", skip_serializing)]
    pub tty: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            total_timeout: Self::default_total_timeout(),
            connect_timeout: Self::default_connect_timeout(),
            read_timeout: Self::default_read_timeout(),
            max_redirects: Self::default_max_redirects(),
            user_agent: Self::default_user_agent(),
            tty: Self::default_tty(),
        }
    }
}

impl HttpConfig {
    fn default_total_timeout() -> u64 {
        env_u64("VIGIL_HTTP_TIMEOUT", 30)
    }

    fn default_connect_timeout() -> u64 {
        env_u64("VIGIL_HTTP_CONNECT_TIMEOUT", 10)
    }

    fn default_read_timeout() -> u64 {
        env_u64("VIGIL_HTTP_READ_TIMEOUT", 10)
    }

    fn default_max_redirects() -> usize {
        10
    }

    fn default_user_agent() -> String {
        match var("VIGIL_USER_AGENT") {
            Ok(agent) => agent,
            Err(_) => format!("vigil/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    fn default_tty() -> bool {
        std::io::stderr().is_terminal()
    }

    /// Total request timeout.
    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout)
    }

    /// Connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }
}

/// Scheduler configuration.
#[derive(Serialize, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// How often the scheduler checks for due watchers and workflows,
    /// in seconds.
    #[serde(default = "SchedulerConfig::default_tick_interval")]
    pub tick_interval: u64,
    /// Maximum number of runs executing concurrently.
    #[serde(default = "SchedulerConfig::default_pool_size")]
    pub pool_size: usize,
    /// Per-run wall-clock limit, as a multiple of the HTTP total timeout.
    #[serde(default = "SchedulerConfig::default_run_timeout_multiplier")]
    pub run_timeout_multiplier: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Self::default_tick_interval(),
            pool_size: Self::default_pool_size(),
            run_timeout_multiplier: Self::default_run_timeout_multiplier(),
        }
    }
}

impl SchedulerConfig {
    fn default_tick_interval() -> u64 {
        env_u64("VIGIL_TICK_INTERVAL", 1)
    }

    fn default_pool_size() -> usize {
        env_u64("VIGIL_POOL_SIZE", 5) as usize
    }

    fn default_run_timeout_multiplier() -> u64 {
        2
    }

    /// Scheduler tick interval.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval)
    }

    /// Per-run wall-clock limit.
    pub fn run_timeout(&self, http: &HttpConfig) -> Duration {
        Duration::from_secs(self.run_timeout_multiplier * http.total_timeout)
    }
}

/// Cookie maintenance configuration.
#[derive(Serialize, Deserialize, Clone)]
pub struct CookieConfig {
    /// Warn about cookies expiring within this many hours.
    #[serde(default = "CookieConfig::default_expiring_warn_hours")]
    pub expiring_warn_hours: i64,
    /// Notify about cookies expiring within this many hours.
    #[serde(default = "CookieConfig::default_expiring_notify_hours")]
    pub expiring_notify_hours: i64,
    /// Time of day (UTC, `HH:MM`) when expired cookies are deleted.
    #[serde(default = "CookieConfig::default_cleanup_at")]
    pub cleanup_at: String,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            expiring_warn_hours: Self::default_expiring_warn_hours(),
            expiring_notify_hours: Self::default_expiring_notify_hours(),
            cleanup_at: Self::default_cleanup_at(),
        }
    }
}

impl CookieConfig {
    fn default_expiring_warn_hours() -> i64 {
        24
    }

    fn default_expiring_notify_hours() -> i64 {
        48
    }

    fn default_cleanup_at() -> String {
        "03:00".to_string()
    }

    /// Parse `cleanup_at` into an `(hour, minute)` pair.
    pub fn cleanup_time(&self) -> Result<(u8, u8), Error> {
        let mut parts = self.cleanup_at.splitn(2, ':');
        let hour = parts.next().and_then(|h| h.parse::<u8>().ok());
        let minute = parts.next().and_then(|m| m.parse::<u8>().ok());

        match (hour, minute) {
            (Some(hour), Some(minute)) if hour < 24 && minute < 60 => Ok((hour, minute)),
            _ => Err(Error::TimeOfDay(self.cleanup_at.clone())),
        }
    }
}

/// Database connection configuration.
///
/// The database is optional; without a URL the in-memory backend is used
/// and nothing survives a restart.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    url: Option<String>,
    /// Maximum number of database connections in the pool.
    #[serde(default = "DatabaseConfig::default_pool_size")]
    pub pool_size: usize,
    /// Maximum amount of time to wait for a connection from the pool,
    /// in milliseconds.
    #[serde(default = "DatabaseConfig::default_checkout_timeout")]
    pub checkout_timeout: u64,
    /// How long an idle connection stays open before the pool closes it,
    /// in milliseconds.
    #[serde(default = "DatabaseConfig::default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: Self::default_pool_size(),
            checkout_timeout: Self::default_checkout_timeout(),
            idle_timeout: Self::default_idle_timeout(),
        }
    }
}

impl DatabaseConfig {
    fn default_pool_size() -> usize {
        10
    }

    fn default_checkout_timeout() -> u64 {
        env_u64("VIGIL_DATABASE_CHECKOUT_TIMEOUT", 5 * 1000)
    }

    fn default_idle_timeout() -> u64 {
        env_u64("VIGIL_DATABASE_IDLE_TIMEOUT", 3600 * 1000)
    }

    /// Maximum amount of time to wait for a connection from the pool.
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout)
    }

    /// How long an idle connection stays open before the pool closes it.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout)
    }

    /// Database URL, if one is configured.
    pub fn database_url(&self) -> Option<String> {
        match self.url {
            Some(ref url) => Some(url.clone()),
            None => var("VIGIL_DATABASE_URL").ok(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{fs::File, io::Write};
    use tempdir::TempDir;

    #[test]
    fn test_load_config() {
        let tmp_dir = TempDir::new("test").unwrap();
        let path = tmp_dir.path().join("vigil.toml");

        let config = r#"
[http]
total_timeout = 5
user_agent = "test-agent"

[scheduler]
pool_size = 2

[cookie]
cleanup_at = "04:30"
"#;
        let mut file = File::create(&path).unwrap();
        file.write_all(config.as_bytes()).unwrap();

        let config = Config::load(path.as_path()).unwrap();
        assert_eq!(config.http.total_timeout, 5);
        assert_eq!(config.http.user_agent, "test-agent");
        assert_eq!(config.scheduler.pool_size, 2);
        assert_eq!(config.scheduler.tick_interval, 1);
        assert_eq!(config.cookie.cleanup_time().unwrap(), (4, 30));
        assert_eq!(config.cookie.expiring_warn_hours, 24);
    }

    #[test]
    fn test_cleanup_time_invalid() {
        let cookie = CookieConfig {
            cleanup_at: "25:00".into(),
            ..Default::default()
        };
        assert!(cookie.cleanup_time().is_err());
    }
}
