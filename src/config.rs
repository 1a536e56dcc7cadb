//! Configuration for the odds collector.
//!
//! Values are layered: built-in defaults, then an optional `config` file
//! in the working directory, then `HKJC_*` environment variables
//! (`HKJC_SCRAPER__RACE_WORKERS=4`). A `.env` file is read before the
//! environment layer is applied.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryConfig;
use crate::scraper::recovery::RecoveryConfig;
use crate::scraper::scheduler::Grouping;

/// Source site and acquisition tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// Base of the analysis pages, without trailing slash
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_official_path")]
    pub official_path: String,
    #[serde(default = "default_market_path")]
    pub market_path: String,
    #[serde(default = "default_login_page_url")]
    pub login_page_url: String,
    #[serde(default = "default_login_url")]
    pub login_url: String,
    #[serde(default = "default_age_gate_url")]
    pub age_gate_url: String,

    /// Account used for re-login. Without both, refresh falls back to the cookie cache.
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_cookie_file")]
    pub cookie_file: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_same_path_delay_secs")]
    pub same_path_delay_secs: f64,
    #[serde(default = "default_path_change_delay_secs")]
    pub path_change_delay_secs: f64,
    /// Fraction of the delay added or removed at random (0.2 = ±20%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    #[serde(default = "default_retries")]
    pub throttle_max_retries: u32,
    #[serde(default = "default_backoff_secs")]
    pub throttle_backoff_secs: f64,
    #[serde(default = "default_retries")]
    pub network_max_retries: u32,
    #[serde(default = "default_backoff_secs")]
    pub network_backoff_base_secs: f64,
    #[serde(default = "default_relogin_pause_secs")]
    pub relogin_pause_secs: f64,
    #[serde(default = "default_retries")]
    pub max_relogins: u32,

    #[serde(default = "default_race_workers")]
    pub race_workers: usize,
    #[serde(default = "default_odds_workers")]
    pub odds_workers: usize,
    #[serde(default)]
    pub grouping: Grouping,
}

fn default_base_url() -> String {
    "https://horse.hk33.com/analysis".to_string()
}

fn default_official_path() -> String {
    "jc-wp-trends-history".to_string()
}

fn default_market_path() -> String {
    "offshore-market-trends-history".to_string()
}

fn default_login_page_url() -> String {
    "https://www.hk33.com/user/login-register".to_string()
}

fn default_login_url() -> String {
    "https://www.hk33.com/zh-yue/user-ajaj/user.login.ajaj".to_string()
}

fn default_age_gate_url() -> String {
    "https://horse.hk33.com/ajaj/landing.ajaj".to_string()
}

fn default_cookie_file() -> String {
    ".hk33_cookies".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_same_path_delay_secs() -> f64 {
    0.3
}

fn default_path_change_delay_secs() -> f64 {
    15.0
}

fn default_jitter() -> f64 {
    0.2
}

fn default_retries() -> u32 {
    3
}

fn default_backoff_secs() -> f64 {
    15.0
}

fn default_relogin_pause_secs() -> f64 {
    2.0
}

fn default_race_workers() -> usize {
    2
}

fn default_odds_workers() -> usize {
    6
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            official_path: default_official_path(),
            market_path: default_market_path(),
            login_page_url: default_login_page_url(),
            login_url: default_login_url(),
            age_gate_url: default_age_gate_url(),
            email: None,
            password: None,
            cookie_file: default_cookie_file(),
            request_timeout_secs: default_request_timeout_secs(),
            same_path_delay_secs: default_same_path_delay_secs(),
            path_change_delay_secs: default_path_change_delay_secs(),
            jitter: default_jitter(),
            throttle_max_retries: default_retries(),
            throttle_backoff_secs: default_backoff_secs(),
            network_max_retries: default_retries(),
            network_backoff_base_secs: default_backoff_secs(),
            relogin_pause_secs: default_relogin_pause_secs(),
            max_relogins: default_retries(),
            race_workers: default_race_workers(),
            odds_workers: default_odds_workers(),
            grouping: Grouping::default(),
        }
    }
}

impl ScraperConfig {
    /// Reject delays that cannot become a `Duration` and out-of-range jitter
    pub fn validate(&self) -> anyhow::Result<()> {
        let delays = [
            ("same_path_delay_secs", self.same_path_delay_secs),
            ("path_change_delay_secs", self.path_change_delay_secs),
            ("throttle_backoff_secs", self.throttle_backoff_secs),
            ("network_backoff_base_secs", self.network_backoff_base_secs),
            ("relogin_pause_secs", self.relogin_pause_secs),
        ];
        for (name, secs) in delays {
            if !secs.is_finite() || secs < 0.0 {
                anyhow::bail!("scraper.{} must be a non-negative number of seconds, got {}", name, secs);
            }
        }
        if !(0.0..1.0).contains(&self.jitter) {
            anyhow::bail!("scraper.jitter must be in [0, 1), got {}", self.jitter);
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn same_path_delay(&self) -> Duration {
        Duration::from_secs_f64(self.same_path_delay_secs)
    }

    pub fn path_change_delay(&self) -> Duration {
        Duration::from_secs_f64(self.path_change_delay_secs)
    }

    pub fn recovery(&self) -> RecoveryConfig {
        RecoveryConfig {
            throttle_max_retries: self.throttle_max_retries,
            throttle_backoff: Duration::from_secs_f64(self.throttle_backoff_secs),
            network_max_retries: self.network_max_retries,
            network_backoff_base: Duration::from_secs_f64(self.network_backoff_base_secs),
            relogin_pause: Duration::from_secs_f64(self.relogin_pause_secs),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Retries of a whole unit after lock contention
    #[serde(default = "default_retries")]
    pub unit_max_retries: u32,
}

fn default_db_path() -> String {
    "data/hkjc_racing.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            unit_max_retries: default_retries(),
        }
    }
}

impl DatabaseConfig {
    pub fn unit_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.unit_max_retries,
            ..RetryConfig::database()
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "hkjc_odds=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from defaults, config file and environment
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // HKJC_DATABASE__PATH, HKJC_SCRAPER__EMAIL, ...
            .add_source(
                config::Environment::with_prefix("HKJC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app: AppConfig = config.try_deserialize()?;
        app.scraper.validate()?;
        Ok(app)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scraper_defaults() {
        let config = ScraperConfig::default();
        assert_eq!(config.base_url, "https://horse.hk33.com/analysis");
        assert_eq!(config.same_path_delay_secs, 0.3);
        assert_eq!(config.path_change_delay_secs, 15.0);
        assert_eq!(config.max_relogins, 3);
        assert_eq!(config.race_workers, 2);
        assert_eq!(config.odds_workers, 6);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.grouping, Grouping::Subtype);
    }

    #[test]
    fn test_recovery_from_config() {
        let recovery = ScraperConfig::default().recovery();
        assert_eq!(recovery.throttle_max_retries, 3);
        assert_eq!(recovery.throttle_backoff, Duration::from_secs(15));
        assert_eq!(recovery.network_backoff_base, Duration::from_secs(15));
    }

    #[test]
    fn test_validate_rejects_bad_delays() {
        assert!(ScraperConfig::default().validate().is_ok());

        let negative = ScraperConfig {
            throttle_backoff_secs: -1.0,
            ..ScraperConfig::default()
        };
        let err = negative.validate().unwrap_err();
        assert!(err.to_string().contains("throttle_backoff_secs"));

        let nan = ScraperConfig {
            same_path_delay_secs: f64::NAN,
            ..ScraperConfig::default()
        };
        assert!(nan.validate().is_err());

        let jitter = ScraperConfig {
            jitter: 1.5,
            ..ScraperConfig::default()
        };
        assert!(jitter.validate().is_err());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: AppConfig = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default()).unwrap())
            .add_source(config::File::from_str(
                "[scraper]\nrace_workers = 4\ngrouping = \"race\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.scraper.race_workers, 4);
        assert_eq!(config.scraper.grouping, Grouping::Race);
        assert_eq!(config.scraper.odds_workers, 6);
        assert_eq!(config.database.path, "data/hkjc_racing.db");
        assert_eq!(config.logging.filter, "hkjc_odds=info");
    }
}
