//! Processor configuration

use nfl_common::queue::QueueConfig;
use nfl_common::retry::BackoffPolicy;

use crate::db::DbConfig;
use crate::error::{ProcessorError, ProcessorResult};

/// Default in-process storage retries for one delivery
pub const DEFAULT_MESSAGE_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub queue: QueueConfig,
    pub database: DbConfig,
    /// Delays shared by every retry in the processor
    pub backoff: BackoffPolicy,
    /// `None` keeps retrying the initial connections forever
    pub startup_max_retries: Option<u32>,
    /// Storage retries per delivery before requeue or dead-letter
    pub message_max_retries: u32,
}

impl ProcessorConfig {
    /// Load configuration from environment and defaults
    ///
    /// - queue variables, see [`QueueConfig::from_env`]
    /// - database variables, see [`DbConfig::from_env`]
    /// - backoff variables, see [`BackoffPolicy::from_env`]
    /// - `STARTUP_MAX_RETRIES` (unset means unbounded), `MESSAGE_MAX_RETRIES`
    pub fn load() -> ProcessorResult<Self> {
        dotenvy::dotenv().ok();

        let startup_max_retries = match std::env::var("STARTUP_MAX_RETRIES") {
            Ok(raw) if !raw.trim().is_empty() => Some(parse_u32("STARTUP_MAX_RETRIES", &raw)?),
            _ => None,
        };

        let message_max_retries = match std::env::var("MESSAGE_MAX_RETRIES") {
            Ok(raw) if !raw.trim().is_empty() => parse_u32("MESSAGE_MAX_RETRIES", &raw)?,
            _ => DEFAULT_MESSAGE_MAX_RETRIES,
        };

        let config = Self {
            queue: QueueConfig::from_env().map_err(|e| ProcessorError::Config(e.to_string()))?,
            database: DbConfig::from_env()?,
            backoff: BackoffPolicy::from_env(),
            startup_max_retries,
            message_max_retries,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> ProcessorResult<()> {
        self.queue
            .validate()
            .map_err(|e| ProcessorError::Config(e.to_string()))?;
        self.database.validate()?;

        if self.backoff.base_delay.is_zero() {
            return Err(ProcessorError::Config(
                "RETRY_BASE_DELAY_MS must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Policy for the initial database and broker connections
    pub fn startup_policy(&self) -> BackoffPolicy {
        self.backoff.clone().with_max_retries(self.startup_max_retries)
    }

    /// Policy for storing one delivery
    pub fn message_policy(&self) -> BackoffPolicy {
        self.backoff.clone().with_max_retries(Some(self.message_max_retries))
    }

    /// Policy for re-establishing a lost broker connection; never gives up
    pub fn reconnect_policy(&self) -> BackoffPolicy {
        self.backoff.clone().with_max_retries(None)
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            database: DbConfig::default(),
            backoff: BackoffPolicy::default(),
            startup_max_retries: None,
            message_max_retries: DEFAULT_MESSAGE_MAX_RETRIES,
        }
    }
}

fn parse_u32(name: &str, raw: &str) -> ProcessorResult<u32> {
    raw.trim()
        .parse()
        .map_err(|e| ProcessorError::Config(format!("invalid {} '{}': {}", name, raw, e)))
}
