//! Configuration management for the extension.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default backend API URL (can be overridden at compile time via AUTH_SYNC_BACKEND_URL).
pub const DEFAULT_BACKEND_URL: &str = match option_env!("AUTH_SYNC_BACKEND_URL") {
    Some(url) => url,
    None => "https://api.unbound.computer",
};

/// Default external auth website URL (can be overridden at compile time via AUTH_SYNC_AUTH_SITE_URL).
pub const DEFAULT_AUTH_SITE_URL: &str = match option_env!("AUTH_SYNC_AUTH_SITE_URL") {
    Some(url) => url,
    None => "https://auth.unbound.computer",
};

/// Route the foreground UI treats as the unauthenticated landing page.
pub const DEFAULT_LANDING_ROUTE: &str = "/";

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Main extension configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Backend API base URL (the domain whose cookies carry the session).
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    /// External auth website URL (where interactive login happens).
    #[serde(default = "default_auth_site_url")]
    pub auth_site_url: String,
    /// Landing route; the coordinator only runs its discovery cycle here.
    #[serde(default = "default_landing_route")]
    pub landing_route: String,
    /// Poll intervals, retry ceilings and backoff curves.
    #[serde(default)]
    pub timing: TimingConfig,
}

fn default_backend_url() -> String {
    DEFAULT_BACKEND_URL.to_string()
}

fn default_auth_site_url() -> String {
    DEFAULT_AUTH_SITE_URL.to_string()
}

fn default_landing_route() -> String {
    DEFAULT_LANDING_ROUTE.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            backend_url: default_backend_url(),
            auth_site_url: default_auth_site_url(),
            landing_route: default_landing_route(),
            timing: TimingConfig::default(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the config file, falling back to defaults,
    /// then apply environment overrides and validate.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("AUTH_SYNC_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Ok(url) = std::env::var("AUTH_SYNC_BACKEND_URL") {
            self.backend_url = url;
        }
        if let Ok(url) = std::env::var("AUTH_SYNC_AUTH_SITE_URL") {
            self.auth_site_url = url;
        }
    }

    /// Check URLs and retry ceilings.
    pub fn validate(&self) -> CoreResult<()> {
        let backend = self.backend_url()?;
        let auth_site = self.auth_site_url()?;

        if backend.host_str().is_none() || auth_site.host_str().is_none() {
            return Err(CoreError::Config(
                "backend_url and auth_site_url must include a host".to_string(),
            ));
        }
        if !self.landing_route.starts_with('/') {
            return Err(CoreError::Config(format!(
                "landing_route must start with '/': {}",
                self.landing_route
            )));
        }
        if self.timing.cookie_poll.max_attempts == 0 || self.timing.status_retry.max_attempts == 0
        {
            return Err(CoreError::Config(
                "cookie_poll and status_retry need at least one attempt".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the backend URL as a parsed URL.
    pub fn backend_url(&self) -> CoreResult<Url> {
        Url::parse(&self.backend_url).map_err(CoreError::from)
    }

    /// Get the auth website URL as a parsed URL.
    pub fn auth_site_url(&self) -> CoreResult<Url> {
        Url::parse(&self.auth_site_url).map_err(CoreError::from)
    }
}

/// Bounded retry schedule with capped exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Maximum number of attempts before giving up.
    pub max_attempts: u32,
    /// Delay after the first failed attempt in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay in milliseconds.
    pub max_delay_ms: u64,
}

impl BackoffConfig {
    pub const fn new(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            max_delay_ms,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let delay_ms = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Timer settings for the coordinator, bridge and background process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay between external-source polls while unauthenticated.
    pub external_poll_interval_ms: u64,
    /// Stop polling the external source after this many empty polls.
    pub max_external_polls: u32,
    /// Waiting for the backend access cookie to become visible after a write.
    pub cookie_poll: BackoffConfig,
    /// Retrying `status()` during verification.
    pub status_retry: BackoffConfig,
    /// Re-running the transfer after FAILED.
    pub cycle_retry: BackoffConfig,
    /// How often the page bridge looks for a changed access token.
    pub bridge_poll_interval_ms: u64,
    /// How often an authenticated coordinator confirms its cookie still exists.
    pub session_check_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            external_poll_interval_ms: 3_000,
            max_external_polls: 20,
            cookie_poll: BackoffConfig::new(5, 100, 2_000),
            status_retry: BackoffConfig::new(3, 500, 4_000),
            cycle_retry: BackoffConfig::new(3, 1_000, 8_000),
            bridge_poll_interval_ms: 1_000,
            session_check_interval_ms: 60_000,
        }
    }
}

impl TimingConfig {
    pub fn external_poll_interval(&self) -> Duration {
        Duration::from_millis(self.external_poll_interval_ms)
    }

    pub fn bridge_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bridge_poll_interval_ms)
    }

    pub fn session_check_interval(&self) -> Duration {
        Duration::from_millis(self.session_check_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.backend_url, DEFAULT_BACKEND_URL);
        assert_eq!(config.auth_site_url, DEFAULT_AUTH_SITE_URL);
        assert_eq!(config.landing_route, "/");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_load_from_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config_json = r#"{
            "log_level": "debug",
            "backend_url": "http://127.0.0.1:8080",
            "timing": { "max_external_polls": 2 }
        }"#;
        std::fs::write(&config_path, config_json).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.backend_url, "http://127.0.0.1:8080");
        assert_eq!(config.auth_site_url, DEFAULT_AUTH_SITE_URL);
        assert_eq!(config.timing.max_external_polls, 2);
        assert_eq!(config.timing.cookie_poll, TimingConfig::default().cookie_poll);
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = Config::default();
        config.landing_route = "/welcome".to_string();
        config.timing.session_check_interval_ms = 5_000;
        config.save(&paths).unwrap();

        let loaded = Config::load_from_file(&paths.config_file()).unwrap();
        assert_eq!(loaded.landing_route, "/welcome");
        assert_eq!(loaded.timing.session_check_interval_ms, 5_000);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.landing_route, DEFAULT_LANDING_ROUTE);
    }

    #[test]
    fn test_config_invalid_url() {
        let mut config = Config::default();
        config.backend_url = "not a valid url".to_string();

        assert!(config.backend_url().is_err());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_relative_landing_route() {
        let mut config = Config::default();
        config.landing_route = "landing".to_string();

        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_config_rejects_zero_attempts() {
        let mut config = Config::default();
        config.timing.cookie_poll.max_attempts = 0;

        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_backoff_delay_calculation() {
        let backoff = BackoffConfig::new(5, 100, 1_000);

        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(800));
        // Capped at max_delay_ms
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_for_attempt(80), Duration::from_millis(1_000));
    }
}
