use std::collections::HashMap;
use std::time::Duration;

// ============================================================================
// Configuration
// ============================================================================
//
// Everything comes from environment variables; a `.env` file in the working
// directory is loaded first when present. Only DATABASE_URL is mandatory.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("Inconsistent relay settings: {0}")]
    Inconsistent(String),

    #[error("Failed to load .env file: {0}")]
    EnvFile(#[from] dotenvy::Error),
}

/// How the outbox is split across scheduled relay tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaneMode {
    /// One lane over every topic; per-key order holds across topics
    #[default]
    Single,
    /// One lane per topic; per-key order holds within a topic only
    PerTopic,
}

impl std::str::FromStr for LaneMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(LaneMode::Single),
            "per-topic" => Ok(LaneMode::PerTopic),
            other => Err(format!("expected \"single\" or \"per-topic\", got {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Delay between the end of one cycle and the start of the next
    pub poll_interval: Duration,
    /// Maximum records fetched per cycle and lane
    pub batch_size: i64,
    /// Bound on a single publish waiting for its acknowledgement
    pub publish_timeout: Duration,
    /// Bound on a whole cycle; checked before each record
    pub cycle_timeout: Duration,
    /// Decode failures tolerated before a record is dead-lettered
    pub max_decode_failures: u32,
    /// Lifetime of a lane lease; renewed every cycle
    pub lease_ttl: Duration,
    pub lanes: LaneMode,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1_000),
            batch_size: 100,
            publish_timeout: Duration::from_millis(5_000),
            cycle_timeout: Duration::from_millis(30_000),
            max_decode_failures: 3,
            lease_ttl: Duration::from_millis(60_000),
            lanes: LaneMode::Single,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = [
            ("poll_interval", self.poll_interval),
            ("publish_timeout", self.publish_timeout),
            ("cycle_timeout", self.cycle_timeout),
            ("lease_ttl", self.lease_ttl),
        ]
        .into_iter()
        .find(|(_, d)| d.is_zero());
        if let Some((name, _)) = zero {
            return Err(ConfigError::Inconsistent(format!("{} must be positive", name)));
        }
        if self.batch_size <= 0 {
            return Err(ConfigError::Inconsistent("batch_size must be positive".to_string()));
        }
        if self.max_decode_failures == 0 {
            return Err(ConfigError::Inconsistent("max_decode_failures must be positive".to_string()));
        }
        if self.publish_timeout > self.cycle_timeout {
            return Err(ConfigError::Inconsistent(
                "publish_timeout must not exceed cycle_timeout".to_string(),
            ));
        }
        if self.lease_ttl <= self.cycle_timeout {
            return Err(ConfigError::Inconsistent(
                "lease_ttl must exceed cycle_timeout".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub kafka_brokers: String,
    pub kafka_message_timeout: Duration,
    pub metrics_port: u16,
    pub relay: RelayConfig,
}

impl AppConfig {
    /// Load `.env` (if any) and read the process environment
    pub fn load() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "Loaded .env file"),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(e.into()),
        }
        Self::from_vars(&std::env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_url = vars
            .get("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let defaults = RelayConfig::default();
        let relay = RelayConfig {
            poll_interval: millis(vars, "RELAY_POLL_INTERVAL_MS", defaults.poll_interval)?,
            batch_size: parse(vars, "RELAY_BATCH_SIZE", defaults.batch_size)?,
            publish_timeout: millis(vars, "RELAY_PUBLISH_TIMEOUT_MS", defaults.publish_timeout)?,
            cycle_timeout: millis(vars, "RELAY_CYCLE_TIMEOUT_MS", defaults.cycle_timeout)?,
            max_decode_failures: parse(vars, "RELAY_MAX_DECODE_FAILURES", defaults.max_decode_failures)?,
            lease_ttl: millis(vars, "RELAY_LEASE_TTL_MS", defaults.lease_ttl)?,
            lanes: parse(vars, "RELAY_LANES", defaults.lanes)?,
        };
        relay.validate()?;

        let kafka_message_timeout = millis(vars, "KAFKA_MESSAGE_TIMEOUT_MS", Duration::from_millis(4_000))?;
        if kafka_message_timeout.is_zero() || kafka_message_timeout >= relay.publish_timeout {
            return Err(ConfigError::Inconsistent(
                "KAFKA_MESSAGE_TIMEOUT_MS must be positive and below RELAY_PUBLISH_TIMEOUT_MS".to_string(),
            ));
        }

        Ok(Self {
            database_url,
            database_max_connections: parse(vars, "DATABASE_MAX_CONNECTIONS", 10)?,
            kafka_brokers: vars
                .get("KAFKA_BROKERS")
                .cloned()
                .unwrap_or_else(|| "127.0.0.1:9092".to_string()),
            kafka_message_timeout,
            metrics_port: parse(vars, "METRICS_PORT", 9090)?,
            relay,
        })
    }
}

fn parse<T>(vars: &HashMap<String, String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: value.clone(),
            reason: e.to_string(),
        }),
    }
}

fn millis(vars: &HashMap<String, String>, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    parse(vars, name, default.as_millis() as u64).map(Duration::from_millis)
}
