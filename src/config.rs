// src/config.rs

use crate::error::ConfigError;
use std::str::FromStr;
use std::time::Duration;

/// Timings and limits applied to every WebSocket connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsSettings {
    /// Interval between keepalive pings. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Read deadline; reset by every inbound frame.
    pub pong_wait: Duration,
    /// Upper bound for a single socket write.
    pub write_wait: Duration,
    /// Upper bound for persisting one chat message.
    pub persist_timeout: Duration,
    pub max_message_size: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            ping_period: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            persist_timeout: Duration::from_secs(5),
            max_message_size: 512 * 1024,
            outbound_capacity: 256,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// PostgreSQL connection string. Without one, messages are kept in memory.
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub ws: WsSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            database_url: None,
            jwt_secret: String::new(),
            ws: WsSettings::default(),
        }
    }
}

impl Config {
    /// Loads `.env` (if present) and reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Config::default();

        let jwt_secret = get("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let ws = WsSettings {
            ping_period: parse_or(&get, "WS_PING_PERIOD_SECS", defaults.ws.ping_period.as_secs())
                .map(Duration::from_secs)?,
            pong_wait: parse_or(&get, "WS_PONG_WAIT_SECS", defaults.ws.pong_wait.as_secs())
                .map(Duration::from_secs)?,
            write_wait: parse_or(&get, "WS_WRITE_WAIT_SECS", defaults.ws.write_wait.as_secs())
                .map(Duration::from_secs)?,
            persist_timeout: parse_or(
                &get,
                "WS_PERSIST_TIMEOUT_SECS",
                defaults.ws.persist_timeout.as_secs(),
            )
            .map(Duration::from_secs)?,
            max_message_size: parse_or(&get, "WS_MAX_MESSAGE_SIZE", defaults.ws.max_message_size)?,
            outbound_capacity: parse_or(
                &get,
                "WS_OUTBOUND_CAPACITY",
                defaults.ws.outbound_capacity,
            )?,
        };

        if ws.outbound_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "WS_OUTBOUND_CAPACITY",
                value: "0".to_string(),
            });
        }
        if ws.ping_period >= ws.pong_wait {
            return Err(ConfigError::Timing {
                ping_secs: ws.ping_period.as_secs(),
                pong_secs: ws.pong_wait.as_secs(),
            });
        }

        Ok(Config {
            host: get("SERVER_HOST").unwrap_or(defaults.host),
            port: parse_or(&get, "SERVER_PORT", defaults.port)?,
            database_url: get("DATABASE_URL"),
            jwt_secret,
            ws,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}
