//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::game::combat::CombatRules;
use crate::game::physics::MotionParams;

/// Relational store endpoint for match results and rankings
#[derive(Clone, Debug)]
pub struct PersistenceConfig {
    pub url: String,
    pub service_key: String,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Broadcaster frequency
    pub tick_rate_hz: u32,
    pub shot_cooldown_ms: u64,
    pub max_health: u16,
    pub motion: MotionParams,

    /// Connections silent for longer than this are closed
    pub inactivity_timeout: Duration,
    pub sweep_interval: Duration,
    /// Per-connection outbound queue length
    pub outbound_queue_capacity: usize,
    /// Inbound messages per second per connection
    pub input_rate_limit: u32,

    pub ranking_interval: Duration,
    /// Unset means match stats stay in memory
    pub persistence: Option<PersistenceConfig>,

    /// Allowed client origins for CORS; empty allows any
    pub client_origins: Vec<String>,
    /// Owner id written into connection records
    pub process_id: Uuid,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load configuration from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Render provides PORT env var, fall back to SERVER_ADDR or default
        let server_addr = match lookup("PORT") {
            Some(port) => format!("0.0.0.0:{}", port),
            None => lookup("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        };
        let server_addr = server_addr
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(server_addr))?;

        let defaults = MotionParams::default();
        let motion = MotionParams {
            rotation_smoothing: parse_or(&lookup, "MOTION_SMOOTHING", defaults.rotation_smoothing)?,
            min_altitude: parse_or(&lookup, "MIN_ALTITUDE", defaults.min_altitude)?,
            cruise_speed: parse_or(&lookup, "CRUISE_SPEED", defaults.cruise_speed)?,
            max_speed: parse_or(&lookup, "MAX_SPEED", defaults.max_speed)?,
            ..defaults
        };

        let persistence = match (lookup("PERSISTENCE_URL"), lookup("PERSISTENCE_KEY")) {
            (Some(url), Some(service_key)) => Some(PersistenceConfig { url, service_key }),
            (Some(_), None) => return Err(ConfigError::Missing("PERSISTENCE_KEY")),
            (None, _) => None,
        };

        let client_origins = lookup("CLIENT_ORIGIN")
            .map(|origins| {
                origins
                    .split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let process_id = match lookup("PROCESS_ID") {
            Some(raw) => Uuid::parse_str(&raw).map_err(|_| ConfigError::Invalid {
                var: "PROCESS_ID",
                value: raw,
            })?,
            None => Uuid::new_v4(),
        };

        Ok(Self {
            server_addr,
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            tick_rate_hz: positive(parse_or(&lookup, "TICK_RATE_HZ", 60u32)?, "TICK_RATE_HZ")?,
            shot_cooldown_ms: parse_or(&lookup, "SHOT_COOLDOWN_MS", 500)?,
            max_health: positive(parse_or(&lookup, "MAX_HEALTH", 100u16)?, "MAX_HEALTH")?,
            motion,
            inactivity_timeout: Duration::from_secs(parse_or(&lookup, "INACTIVITY_TIMEOUT_SECS", 120)?),
            sweep_interval: Duration::from_secs(
                positive(parse_or(&lookup, "SWEEP_INTERVAL_SECS", 15u64)?, "SWEEP_INTERVAL_SECS")?,
            ),
            outbound_queue_capacity: positive(
                parse_or(&lookup, "OUTBOUND_QUEUE_CAPACITY", 32usize)?,
                "OUTBOUND_QUEUE_CAPACITY",
            )?,
            input_rate_limit: parse_or(&lookup, "INPUT_RATE_LIMIT", 120)?,
            ranking_interval: Duration::from_secs(
                positive(parse_or(&lookup, "RANKING_INTERVAL_SECS", 300u64)?, "RANKING_INTERVAL_SECS")?,
            ),
            persistence,
            client_origins,
            process_id,
        })
    }

    pub fn combat_rules(&self) -> CombatRules {
        CombatRules {
            max_health: self.max_health,
            shot_cooldown_ms: self.shot_cooldown_ms,
            ..CombatRules::default()
        }
    }
}

fn parse_or<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { var, value: raw }),
        None => Ok(default),
    }
}

fn positive<T: PartialOrd + Default + ToString>(value: T, var: &'static str) -> Result<T, ConfigError> {
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid server address: {0}")]
    InvalidAddress(String),

    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}
