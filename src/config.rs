//! Process configuration
//!
//! Values come from the environment (optionally seeded from a `.env`
//! file) with defaults for everything, so the server starts with no
//! configuration at all.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::hub::HubConfig;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Channel buffer size for hub commands
pub const DEFAULT_HUB_CHANNEL_SIZE: usize = 256;

/// Per-connection outbound queue capacity
pub const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 10;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 4096;

/// Settings for each connection adapter
#[derive(Debug, Clone, Copy)]
pub struct AdapterConfig {
    /// Capacity of the outbound queue; envelopes beyond it are dropped
    pub outbound_queue_size: usize,
    /// How often the outbound pump pings the peer
    pub ping_interval: Duration,
    /// Silence after which the inbound pump gives up on the peer
    pub idle_timeout: Duration,
    /// Longest accepted chat content in bytes
    pub max_message_len: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            outbound_queue_size: DEFAULT_OUTBOUND_QUEUE_SIZE,
            ping_interval: DEFAULT_PING_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address
    pub addr: String,
    pub hub_channel_size: usize,
    pub hub: HubConfig,
    pub adapter: AdapterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            hub_channel_size: DEFAULT_HUB_CHANNEL_SIZE,
            hub: HubConfig::default(),
            adapter: AdapterConfig::default(),
        }
    }
}

impl Config {
    /// Load from the process environment
    ///
    /// A missing `.env` file is fine; variables already set win over it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv::dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let addr = lookup("SERVER_ADDRESS")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.addr);

        let hub_channel_size =
            parse_positive(&lookup, "HUB_CHANNEL_SIZE")?.unwrap_or(defaults.hub_channel_size);

        let echo_to_sender = match lookup("ECHO_TO_SENDER") {
            Some(value) => parse_bool("ECHO_TO_SENDER", &value)?,
            None => defaults.hub.echo_to_sender,
        };

        let adapter = AdapterConfig {
            outbound_queue_size: parse_positive(&lookup, "OUTBOUND_QUEUE_SIZE")?
                .unwrap_or(defaults.adapter.outbound_queue_size),
            ping_interval: parse_positive(&lookup, "PING_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.adapter.ping_interval),
            idle_timeout: parse_positive(&lookup, "IDLE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.adapter.idle_timeout),
            max_message_len: parse_positive(&lookup, "MAX_MESSAGE_LEN")?
                .unwrap_or(defaults.adapter.max_message_len),
        };

        Ok(Self {
            addr,
            hub_channel_size,
            hub: HubConfig { echo_to_sender },
            adapter,
        })
    }
}

/// Parse an optional variable as a number greater than zero
fn parse_positive<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default,
{
    let Some(value) = lookup(name) else {
        return Ok(None);
    };
    match value.trim().parse::<T>() {
        Ok(n) if n > T::default() => Ok(Some(n)),
        _ => Err(ConfigError::InvalidValue { name, value }),
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        }),
    }
}
