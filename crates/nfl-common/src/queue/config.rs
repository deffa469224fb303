//! Broker connection and topology configuration

use serde::{Deserialize, Serialize};

/// Default broker host
pub const DEFAULT_RABBITMQ_HOST: &str = "localhost";

/// Default AMQP port
pub const DEFAULT_RABBITMQ_PORT: u16 = 5672;

/// Default broker credentials
pub const DEFAULT_RABBITMQ_USER: &str = "guest";
pub const DEFAULT_RABBITMQ_PASS: &str = "guest";

/// Default virtual host
pub const DEFAULT_RABBITMQ_VHOST: &str = "/";

/// Default name of the durable game queue
pub const DEFAULT_QUEUE_NAME: &str = "game_events";

/// Suffix appended to the queue name to form the default dead-letter queue
pub const DEAD_LETTER_SUFFIX: &str = ".dead_letter";

/// Default number of unacknowledged deliveries per consumer
pub const DEFAULT_PREFETCH: u16 = 1;

/// Default AMQP heartbeat in seconds (10 minutes)
pub const DEFAULT_HEARTBEAT_SECS: u16 = 600;

/// Message queue configuration shared by the ingestor and the processor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub vhost: String,
    /// Durable queue carrying game records
    pub queue: String,
    /// Durable queue receiving messages that cannot be processed
    pub dead_letter_queue: String,
    /// Unacknowledged deliveries allowed per consumer
    pub prefetch: u16,
    pub heartbeat_secs: u16,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_RABBITMQ_HOST.to_string(),
            port: DEFAULT_RABBITMQ_PORT,
            user: DEFAULT_RABBITMQ_USER.to_string(),
            password: DEFAULT_RABBITMQ_PASS.to_string(),
            vhost: DEFAULT_RABBITMQ_VHOST.to_string(),
            queue: DEFAULT_QUEUE_NAME.to_string(),
            dead_letter_queue: format!("{}{}", DEFAULT_QUEUE_NAME, DEAD_LETTER_SUFFIX),
            prefetch: DEFAULT_PREFETCH,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
        }
    }
}

impl QueueConfig {
    /// Load queue configuration from environment variables
    ///
    /// - `RABBITMQ_HOST`, `RABBITMQ_PORT`, `RABBITMQ_USER`, `RABBITMQ_PASS`, `RABBITMQ_VHOST`
    /// - `RABBITMQ_QUEUE`: game queue name (default `game_events`)
    /// - `RABBITMQ_DEAD_LETTER_QUEUE`: defaults to `<queue>.dead_letter`
    /// - `RABBITMQ_PREFETCH`, `RABBITMQ_HEARTBEAT_SECS`
    pub fn from_env() -> anyhow::Result<Self> {
        let queue =
            std::env::var("RABBITMQ_QUEUE").unwrap_or_else(|_| DEFAULT_QUEUE_NAME.to_string());

        let config = Self {
            host: std::env::var("RABBITMQ_HOST")
                .unwrap_or_else(|_| DEFAULT_RABBITMQ_HOST.to_string()),
            port: std::env::var("RABBITMQ_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RABBITMQ_PORT),
            user: std::env::var("RABBITMQ_USER")
                .unwrap_or_else(|_| DEFAULT_RABBITMQ_USER.to_string()),
            password: std::env::var("RABBITMQ_PASS")
                .unwrap_or_else(|_| DEFAULT_RABBITMQ_PASS.to_string()),
            vhost: std::env::var("RABBITMQ_VHOST")
                .unwrap_or_else(|_| DEFAULT_RABBITMQ_VHOST.to_string()),
            dead_letter_queue: std::env::var("RABBITMQ_DEAD_LETTER_QUEUE")
                .unwrap_or_else(|_| format!("{}{}", queue, DEAD_LETTER_SUFFIX)),
            queue,
            prefetch: std::env::var("RABBITMQ_PREFETCH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_PREFETCH),
            heartbeat_secs: std::env::var("RABBITMQ_HEARTBEAT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_HEARTBEAT_SECS),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            anyhow::bail!("RabbitMQ host cannot be empty");
        }

        if self.port == 0 {
            anyhow::bail!("RabbitMQ port must be greater than 0");
        }

        if self.queue.is_empty() {
            anyhow::bail!("Queue name cannot be empty");
        }

        if self.dead_letter_queue == self.queue {
            anyhow::bail!(
                "Dead-letter queue must differ from the main queue ('{}')",
                self.queue
            );
        }

        if self.prefetch == 0 {
            anyhow::bail!("Prefetch must be at least 1");
        }

        Ok(())
    }

    /// AMQP URI including credentials; never log this
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}",
            self.user,
            self.password,
            self.host,
            self.port,
            encode_vhost(&self.vhost),
            self.heartbeat_secs
        )
    }

    /// Broker address safe for log lines
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.vhost)
    }
}

fn encode_vhost(vhost: &str) -> String {
    vhost.replace('%', "%25").replace('/', "%2f")
}
