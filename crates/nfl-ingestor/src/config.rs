//! Ingestor configuration

use std::path::PathBuf;
use std::time::Duration;

use nfl_common::queue::QueueConfig;
use nfl_common::retry::BackoffPolicy;

/// Default location of the source CSV inside the container
pub const DEFAULT_DATA_FILE: &str = "/app/data/nfl_basic.csv";

/// Default pause between published rows, in seconds
pub const DEFAULT_INTERVAL_SECS: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub data_file: PathBuf,
    /// Pause after each published row; zero disables pacing
    pub interval: Duration,
    pub queue: QueueConfig,
    /// Delays shared by the startup connection and publish retries
    pub backoff: BackoffPolicy,
    /// `None` keeps retrying the initial broker connection forever
    pub startup_max_retries: Option<u32>,
    /// `None` keeps retrying a failed publish forever
    pub publish_max_retries: Option<u32>,
}

impl IngestConfig {
    /// Load configuration from environment and defaults
    ///
    /// - `NFL_DATA_FILE`, `INGESTOR_INTERVAL` (seconds, fractional allowed)
    /// - `STARTUP_MAX_RETRIES`, `PUBLISH_MAX_RETRIES` (unset means unbounded)
    /// - queue variables, see [`QueueConfig::from_env`]
    /// - backoff variables, see [`BackoffPolicy::from_env`]
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let interval_secs = match std::env::var("INGESTOR_INTERVAL") {
            Ok(raw) => raw
                .trim()
                .parse::<f64>()
                .map_err(|e| anyhow::anyhow!("Invalid INGESTOR_INTERVAL '{}': {}", raw, e))?,
            Err(_) => DEFAULT_INTERVAL_SECS,
        };

        let interval = interval_from_secs(interval_secs)
            .map_err(|e| anyhow::anyhow!("Invalid INGESTOR_INTERVAL '{}': {}", interval_secs, e))?;

        let config = Self {
            data_file: std::env::var("NFL_DATA_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_FILE)),
            interval,
            queue: QueueConfig::from_env()?,
            backoff: BackoffPolicy::from_env(),
            startup_max_retries: optional_u32("STARTUP_MAX_RETRIES")?,
            publish_max_retries: optional_u32("PUBLISH_MAX_RETRIES")?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.data_file.as_os_str().is_empty() {
            anyhow::bail!("NFL_DATA_FILE cannot be empty");
        }

        self.queue.validate()?;

        Ok(())
    }

    /// Policy for establishing the broker connection at startup
    pub fn startup_policy(&self) -> BackoffPolicy {
        self.backoff.clone().with_max_retries(self.startup_max_retries)
    }

    /// Policy for republishing one game
    pub fn publish_policy(&self) -> BackoffPolicy {
        self.backoff.clone().with_max_retries(self.publish_max_retries)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            data_file: PathBuf::from(DEFAULT_DATA_FILE),
            interval: Duration::from_secs_f64(DEFAULT_INTERVAL_SECS),
            queue: QueueConfig::default(),
            backoff: BackoffPolicy::default(),
            startup_max_retries: None,
            publish_max_retries: None,
        }
    }
}

/// Pause length from a number of seconds; negative, non-finite and
/// out-of-range values are errors
pub fn interval_from_secs(secs: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| anyhow::anyhow!("must be a non-negative number of seconds ({})", e))
}

/// Unset or empty means `None`; anything else must parse
fn optional_u32(name: &str) -> anyhow::Result<Option<u32>> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {} '{}': {}", name, raw, e)),
        _ => Ok(None),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for name in [
            "NFL_DATA_FILE",
            "INGESTOR_INTERVAL",
            "STARTUP_MAX_RETRIES",
            "PUBLISH_MAX_RETRIES",
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_defaults() {
        let config = IngestConfig::default();
        assert_eq!(config.data_file, PathBuf::from("/app/data/nfl_basic.csv"));
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.startup_policy().max_retries, None);
        assert_eq!(config.publish_policy().max_retries, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_interval_from_secs_bounds() {
        assert_eq!(interval_from_secs(0.5).unwrap(), Duration::from_millis(500));
        assert!(interval_from_secs(-1.0).is_err());
        assert!(interval_from_secs(f64::NAN).is_err());
        assert!(interval_from_secs(f64::INFINITY).is_err());
        assert!(interval_from_secs(1e300).is_err());
    }

    #[test]
    #[serial]
    fn test_load_from_env() {
        clear_env();
        std::env::set_var("NFL_DATA_FILE", "/tmp/games.csv");
        std::env::set_var("INGESTOR_INTERVAL", "0.25");
        std::env::set_var("STARTUP_MAX_RETRIES", "4");

        let config = IngestConfig::load().unwrap();
        assert_eq!(config.data_file, PathBuf::from("/tmp/games.csv"));
        assert_eq!(config.interval, Duration::from_millis(250));
        assert_eq!(config.startup_policy().max_retries, Some(4));
        assert_eq!(config.publish_policy().max_retries, None);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_zero_interval_disables_pacing() {
        clear_env();
        std::env::set_var("INGESTOR_INTERVAL", "0");

        let config = IngestConfig::load().unwrap();
        assert!(config.interval.is_zero());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_errors() {
        clear_env();
        std::env::set_var("INGESTOR_INTERVAL", "-1");
        assert!(IngestConfig::load().is_err());

        std::env::set_var("INGESTOR_INTERVAL", "soon");
        assert!(IngestConfig::load().is_err());

        std::env::set_var("INGESTOR_INTERVAL", "1e300");
        assert!(IngestConfig::load().is_err());

        clear_env();
        std::env::set_var("PUBLISH_MAX_RETRIES", "many");
        assert!(IngestConfig::load().is_err());

        clear_env();
    }
}
