//! Environment-driven configuration.
//!
//! Every tunable the background machinery recognizes is enumerated here with
//! its allowed range; `Config::from_env` is the single place that touches the
//! process environment, and startup fails fast on anything out of range.

use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use validator::Validate;

#[derive(Debug, Clone, Validate)]
pub struct Config {
    #[validate(nested)]
    pub app: AppConfig,
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[validate(nested)]
    pub outbox: OutboxConfig,
    #[validate(nested)]
    pub afc: AfcConfig,
    #[validate(nested)]
    pub producer: ProducerConfig,
    #[validate(nested)]
    pub scheduler: SchedulerConfig,
    #[validate(nested)]
    pub manager_load: ManagerLoadConfig,
    #[validate(nested)]
    pub websocket: WebsocketConfig,
}

#[derive(Debug, Clone, Validate)]
pub struct AppConfig {
    pub env: String,
    pub port: u16,
    pub allow_origins: Vec<String>,
}

#[derive(Debug, Clone, Validate)]
pub struct DatabaseConfig {
    pub url: String,
    #[validate(range(min = 1, max = 100))]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Validate)]
pub struct OutboxConfig {
    #[validate(range(min = 1, max = 32))]
    pub workers: usize,
    #[validate(range(min = 100, max = 10_000))]
    pub idle_time_ms: u64,
    #[validate(range(min = 1, max = 600))]
    pub reserve_for_secs: u64,
}

impl OutboxConfig {
    pub fn idle_time(&self) -> Duration {
        Duration::from_millis(self.idle_time_ms)
    }

    pub fn reserve_for(&self) -> Duration {
        Duration::from_secs(self.reserve_for_secs)
    }
}

#[derive(Debug, Clone, Validate)]
pub struct AfcConfig {
    #[validate(length(min = 1))]
    pub brokers: Vec<String>,
    #[validate(range(min = 1, max = 16))]
    pub consumers: usize,
    #[validate(length(min = 1))]
    pub consumer_group: String,
    #[validate(length(min = 1))]
    pub verdicts_topic: String,
    #[validate(length(min = 1))]
    pub verdicts_dlq_topic: String,
    /// PEM-encoded RSA public key; when empty, signature verification is
    /// skipped and record values are treated as plain JSON.
    pub verdicts_sign_key: String,
    #[validate(range(min = 1, max = 1000))]
    pub process_batch_size: usize,
    #[validate(range(min = 50, max = 10_000))]
    pub process_batch_max_timeout_ms: u64,
    #[validate(range(min = 1, max = 10))]
    pub retries: u32,
    #[validate(range(min = 50, max = 1000))]
    pub backoff_initial_interval_ms: u64,
    #[validate(range(min = 500, max = 60_000))]
    pub backoff_max_elapsed_ms: u64,
    #[validate(range(min = 1.01, max = 10.0))]
    pub backoff_factor: f64,
}

impl AfcConfig {
    pub fn process_batch_max_timeout(&self) -> Duration {
        Duration::from_millis(self.process_batch_max_timeout_ms)
    }

    pub fn backoff_initial_interval(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_interval_ms)
    }

    pub fn backoff_max_elapsed(&self) -> Duration {
        Duration::from_millis(self.backoff_max_elapsed_ms)
    }
}

#[derive(Debug, Clone, Validate)]
pub struct ProducerConfig {
    #[validate(length(min = 1))]
    pub brokers: Vec<String>,
    #[validate(length(min = 1))]
    pub topic: String,
    /// Hex-encoded AES key (16/24/32 bytes once decoded); empty disables
    /// payload sealing.
    pub encrypt_key: String,
}

#[derive(Debug, Clone, Validate)]
pub struct SchedulerConfig {
    #[validate(range(min = 100, max = 60_000))]
    pub idle_duration_ms: u64,
}

impl SchedulerConfig {
    pub fn idle_duration(&self) -> Duration {
        Duration::from_millis(self.idle_duration_ms)
    }
}

#[derive(Debug, Clone, Validate)]
pub struct ManagerLoadConfig {
    #[validate(range(min = 1, max = 30))]
    pub max_problems_at_time: i64,
}

#[derive(Debug, Clone, Validate)]
pub struct WebsocketConfig {
    #[validate(range(min = 1, max = 30))]
    pub ping_period_secs: u64,
}

impl WebsocketConfig {
    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(key: &str, default: &str) -> Result<T, AppError> {
    var_or(key, default)
        .parse()
        .map_err(|_| AppError::Config(format!("{key} is not a valid value")))
}

fn parse_list(key: &str, default: &str) -> Vec<String> {
    var_or(key, default)
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let config = Config {
            app: AppConfig {
                env: var_or("APP_ENV", "development"),
                port: parse_var("APP_PORT", "8080")?,
                allow_origins: parse_list("APP_ALLOW_ORIGINS", ""),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .map_err(|_| AppError::Config("DATABASE_URL missing".into()))?,
                max_connections: parse_var("DATABASE_MAX_CONNECTIONS", "10")?,
            },
            outbox: OutboxConfig {
                workers: parse_var("OUTBOX_WORKERS", "4")?,
                idle_time_ms: parse_var("OUTBOX_IDLE_TIME_MS", "500")?,
                reserve_for_secs: parse_var("OUTBOX_RESERVE_FOR_SECS", "60")?,
            },
            afc: AfcConfig {
                brokers: parse_list("AFC_BROKERS", "localhost:9092"),
                consumers: parse_var("AFC_CONSUMERS", "1")?,
                consumer_group: var_or("AFC_CONSUMER_GROUP", "chat-service-afc"),
                verdicts_topic: var_or("AFC_VERDICTS_TOPIC", "afc.msg-verdicts"),
                verdicts_dlq_topic: var_or("AFC_VERDICTS_DLQ_TOPIC", "afc.msg-verdicts.dlq"),
                verdicts_sign_key: env::var("AFC_VERDICTS_SIGN_KEY").unwrap_or_default(),
                process_batch_size: parse_var("AFC_PROCESS_BATCH_SIZE", "1")?,
                process_batch_max_timeout_ms: parse_var("AFC_PROCESS_BATCH_MAX_TIMEOUT_MS", "100")?,
                retries: parse_var("AFC_RETRIES", "3")?,
                backoff_initial_interval_ms: parse_var("AFC_BACKOFF_INITIAL_INTERVAL_MS", "100")?,
                backoff_max_elapsed_ms: parse_var("AFC_BACKOFF_MAX_ELAPSED_MS", "5000")?,
                backoff_factor: parse_var("AFC_BACKOFF_FACTOR", "5")?,
            },
            producer: ProducerConfig {
                brokers: parse_list("MSG_PRODUCER_BROKERS", "localhost:9092"),
                topic: var_or("MSG_PRODUCER_TOPIC", "chat.messages"),
                encrypt_key: env::var("MSG_PRODUCER_ENCRYPT_KEY").unwrap_or_default(),
            },
            scheduler: SchedulerConfig {
                idle_duration_ms: parse_var("SCHEDULER_IDLE_DURATION_MS", "1000")?,
            },
            manager_load: ManagerLoadConfig {
                max_problems_at_time: parse_var("MANAGER_MAX_PROBLEMS_AT_TIME", "5")?,
            },
            websocket: WebsocketConfig {
                ping_period_secs: parse_var("WS_PING_PERIOD_SECS", "3")?,
            },
        };

        config
            .validate()
            .map_err(|e| AppError::Config(format!("invalid configuration: {e}")))?;

        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.app.env.eq_ignore_ascii_case("production")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            app: AppConfig {
                env: "development".into(),
                port: 8080,
                allow_origins: vec![],
            },
            database: DatabaseConfig {
                url: "postgres://localhost/chat".into(),
                max_connections: 10,
            },
            outbox: OutboxConfig {
                workers: 4,
                idle_time_ms: 500,
                reserve_for_secs: 60,
            },
            afc: AfcConfig {
                brokers: vec!["localhost:9092".into()],
                consumers: 2,
                consumer_group: "chat-service-afc".into(),
                verdicts_topic: "afc.msg-verdicts".into(),
                verdicts_dlq_topic: "afc.msg-verdicts.dlq".into(),
                verdicts_sign_key: String::new(),
                process_batch_size: 1,
                process_batch_max_timeout_ms: 100,
                retries: 3,
                backoff_initial_interval_ms: 100,
                backoff_max_elapsed_ms: 5000,
                backoff_factor: 5.0,
            },
            producer: ProducerConfig {
                brokers: vec!["localhost:9092".into()],
                topic: "chat.messages".into(),
                encrypt_key: String::new(),
            },
            scheduler: SchedulerConfig {
                idle_duration_ms: 1000,
            },
            manager_load: ManagerLoadConfig {
                max_problems_at_time: 5,
            },
            websocket: WebsocketConfig {
                ping_period_secs: 3,
            },
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn outbox_worker_range_is_enforced() {
        let mut cfg = valid_config();
        cfg.outbox.workers = 0;
        assert!(cfg.validate().is_err());
        cfg.outbox.workers = 33;
        assert!(cfg.validate().is_err());
        cfg.outbox.workers = 32;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn afc_batch_ranges_are_enforced() {
        let mut cfg = valid_config();
        cfg.afc.process_batch_size = 1001;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.afc.process_batch_max_timeout_ms = 49;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.afc.retries = 11;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn manager_load_bounds() {
        let mut cfg = valid_config();
        cfg.manager_load.max_problems_at_time = 0;
        assert!(cfg.validate().is_err());
        cfg.manager_load.max_problems_at_time = 31;
        assert!(cfg.validate().is_err());
        cfg.manager_load.max_problems_at_time = 30;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn scheduler_idle_duration_bounds() {
        let mut cfg = valid_config();
        cfg.scheduler.idle_duration_ms = 99;
        assert!(cfg.validate().is_err());
        cfg.scheduler.idle_duration_ms = 60_001;
        assert!(cfg.validate().is_err());
    }
}
