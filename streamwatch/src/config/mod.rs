//! Process-wide configuration.
//!
//! Every recognised setting is a field of [`AppConfig`] with a default.
//! Values are layered: defaults, then an optional JSON file, then
//! environment variables.

mod duration;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Default Twitch OAuth token endpoint.
pub const DEFAULT_OAUTH_URL: &str = "https://id.twitch.tv/oauth2/token";

/// Default Twitch Helix API base URL.
pub const DEFAULT_HELIX_URL: &str = "https://api.twitch.tv/helix";

/// Longest log retention accepted, in days.
pub const MAX_LOG_RETENTION_DAYS: i64 = 3650;

/// Maximum number of logins accepted by one Helix `streams` request.
pub const HELIX_MAX_BATCH_SIZE: usize = 100;

/// Settings of the monitoring engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Time between the starts of two cycles.
    #[serde(rename = "poll_interval_secs", with = "duration::secs")]
    pub poll_interval: Duration,
    /// Maximum entity ids per status request.
    pub batch_size: usize,
    /// Attempts per batch before the batch is given up for this cycle.
    pub max_attempts: u32,
    /// First retry delay when no server hint is available.
    #[serde(rename = "backoff_base_ms", with = "duration::millis")]
    pub backoff_base: Duration,
    /// Upper bound for any single retry delay.
    #[serde(rename = "backoff_cap_ms", with = "duration::millis")]
    pub backoff_cap: Duration,
    /// Batch requests allowed in flight at once within a cycle.
    pub max_concurrent_batches: usize,
    /// Client-side request budget for the status API.
    pub requests_per_minute: u32,
    /// Tokens expiring within this margin are refreshed before use.
    #[serde(rename = "token_refresh_margin_secs", with = "duration::secs")]
    pub token_refresh_margin: Duration,
    /// Time an in-progress cycle gets to finish its I/O after shutdown is requested.
    #[serde(rename = "shutdown_grace_secs", with = "duration::secs")]
    pub shutdown_grace: Duration,
    /// Consecutive cycles with credential failures before an alert is raised.
    pub credential_alert_threshold: u32,
    /// HTTP timeout for credential and status requests.
    #[serde(rename = "request_timeout_secs", with = "duration::secs")]
    pub request_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(120),
            batch_size: HELIX_MAX_BATCH_SIZE,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            max_concurrent_batches: 4,
            requests_per_minute: 800,
            token_refresh_margin: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
            credential_alert_threshold: 5,
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl MonitorConfig {
    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(secs) = parse_env::<u64>(env, "POLL_INTERVAL_SECS")? {
            self.poll_interval = Duration::from_secs(secs);
        }
        if let Some(size) = parse_env(env, "STATUS_BATCH_SIZE")? {
            self.batch_size = size;
        }
        if let Some(attempts) = parse_env(env, "STATUS_MAX_ATTEMPTS")? {
            self.max_attempts = attempts;
        }
        if let Some(ms) = parse_env::<u64>(env, "BACKOFF_BASE_MS")? {
            self.backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>(env, "BACKOFF_CAP_MS")? {
            self.backoff_cap = Duration::from_millis(ms);
        }
        if let Some(n) = parse_env(env, "MAX_CONCURRENT_BATCHES")? {
            self.max_concurrent_batches = n;
        }
        if let Some(rpm) = parse_env(env, "REQUESTS_PER_MINUTE")? {
            self.requests_per_minute = rpm;
        }
        if let Some(secs) = parse_env::<u64>(env, "TOKEN_REFRESH_MARGIN_SECS")? {
            self.token_refresh_margin = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>(env, "SHUTDOWN_GRACE_SECS")? {
            self.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(n) = parse_env(env, "CREDENTIAL_ALERT_THRESHOLD")? {
            self.credential_alert_threshold = n;
        }
        if let Some(secs) = parse_env::<u64>(env, "REQUEST_TIMEOUT_SECS")? {
            self.request_timeout = Duration::from_secs(secs);
        }
        Ok(())
    }

    /// Check the values against each other.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::config("poll interval must be greater than zero"));
        }
        if self.batch_size == 0 || self.batch_size > HELIX_MAX_BATCH_SIZE {
            return Err(Error::config(format!(
                "batch size must be between 1 and {}, got {}",
                HELIX_MAX_BATCH_SIZE, self.batch_size
            )));
        }
        if self.max_attempts == 0 {
            return Err(Error::config("max attempts must be at least 1"));
        }
        if self.backoff_cap < self.backoff_base {
            return Err(Error::config(format!(
                "backoff cap ({:?}) is smaller than backoff base ({:?})",
                self.backoff_cap, self.backoff_base
            )));
        }
        if self.max_concurrent_batches == 0 {
            return Err(Error::config("max concurrent batches must be at least 1"));
        }
        if self.requests_per_minute == 0 {
            return Err(Error::config("requests per minute must be at least 1"));
        }
        if self.credential_alert_threshold == 0 {
            return Err(Error::config("credential alert threshold must be at least 1"));
        }
        Ok(())
    }
}

/// Twitch application credentials and endpoints.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwitchConfig {
    pub client_id: String,
    pub client_secret: String,
    pub oauth_url: String,
    pub helix_url: String,
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            oauth_url: DEFAULT_OAUTH_URL.to_string(),
            helix_url: DEFAULT_HELIX_URL.to_string(),
        }
    }
}

impl std::fmt::Debug for TwitchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwitchConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("oauth_url", &self.oauth_url)
            .field("helix_url", &self.helix_url)
            .finish()
    }
}

impl TwitchConfig {
    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) {
        if let Some(id) = env("TWITCH_CLIENT_ID") {
            self.client_id = id;
        }
        if let Some(secret) = env("TWITCH_CLIENT_SECRET") {
            self.client_secret = secret;
        }
        if let Some(url) = env("TWITCH_OAUTH_URL") {
            self.oauth_url = url;
        }
        if let Some(url) = env("TWITCH_HELIX_URL") {
            self.helix_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() || self.client_secret.trim().is_empty() {
            return Err(Error::config(
                "TWITCH_CLIENT_ID and TWITCH_CLIENT_SECRET are required",
            ));
        }
        for (name, value) in [("oauth_url", &self.oauth_url), ("helix_url", &self.helix_url)] {
            url::Url::parse(value)
                .map_err(|e| Error::config(format!("invalid {}: {} ({})", name, value, e)))?;
        }
        Ok(())
    }
}

/// Watch registry storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite URL. When unset, the registry lives in memory.
    pub database_url: Option<String>,
    /// JSON export loaded into the in-memory registry at startup.
    pub seed_path: Option<PathBuf>,
}

/// Which sink receives live notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Write notifications to the log only.
    #[default]
    Log,
    /// POST notifications to each entry's destination URL.
    Webhook,
}

impl FromStr for SinkKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "webhook" => Ok(Self::Webhook),
            other => Err(Error::config(format!("unknown notification sink: {}", other))),
        }
    }
}

/// Notification delivery settings.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub sink: SinkKind,
    /// Bearer token attached to webhook deliveries.
    pub webhook_token: Option<String>,
    #[serde(rename = "timeout_secs", with = "duration::secs")]
    pub timeout: Duration,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            sink: SinkKind::Log,
            webhook_token: None,
            timeout: Duration::from_secs(10),
        }
    }
}

impl std::fmt::Debug for NotificationSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationSettings")
            .field("sink", &self.sink)
            .field(
                "webhook_token",
                &self.webhook_token.as_ref().map(|_| "<redacted>"),
            )
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_dir: PathBuf,
    pub retention_days: i64,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            retention_days: 7,
            json: false,
        }
    }
}

/// Complete process configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub monitor: MonitorConfig,
    pub twitch: TwitchConfig,
    pub storage: StorageConfig,
    pub notification: NotificationSettings,
    pub logging: LoggingSettings,
}

impl AppConfig {
    /// Load from an optional JSON file and the process environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Same as [`AppConfig::load`] with an explicit environment lookup.
    pub fn load_with(path: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(&env)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        let config = serde_json::from_str(&raw)?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) -> Result<()> {
        self.monitor.apply_env(env)?;
        self.twitch.apply_env(env);

        if let Some(url) = env("DATABASE_URL").filter(|u| !u.trim().is_empty()) {
            self.storage.database_url = Some(url);
        }
        if let Some(path) = env("REGISTRY_SEED").filter(|p| !p.trim().is_empty()) {
            self.storage.seed_path = Some(PathBuf::from(path));
        }

        if let Some(sink) = env("NOTIFY_SINK") {
            self.notification.sink = sink.parse()?;
        }
        if let Some(token) = env("NOTIFY_WEBHOOK_TOKEN") {
            self.notification.webhook_token = Some(token);
        }
        if let Some(secs) = parse_env::<u64>(env, "NOTIFY_TIMEOUT_SECS")? {
            self.notification.timeout = Duration::from_secs(secs);
        }

        if let Some(dir) = env("LOG_DIR") {
            self.logging.log_dir = PathBuf::from(dir);
        }
        if let Some(days) = parse_env(env, "LOG_RETENTION_DAYS")? {
            self.logging.retention_days = days;
        }
        if let Some(format) = env("LOG_FORMAT") {
            self.logging.json = format.eq_ignore_ascii_case("json");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.monitor.validate()?;
        self.twitch.validate()?;
        if !(1..=MAX_LOG_RETENTION_DAYS).contains(&self.logging.retention_days) {
            return Err(Error::config(format!(
                "log retention must be between 1 and {} days",
                MAX_LOG_RETENTION_DAYS
            )));
        }
        Ok(())
    }
}

fn parse_env<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::config(format!("invalid value for {}: {:?} ({})", key, raw, e))),
        None => Ok(None),
    }
}
