//! Pipeline configuration from environment.
//!
//! All settings are env-driven with the production defaults baked in: batches
//! of 50 or every 5 seconds, sweeps every 10 minutes, a 30 minute liveness window.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::presence::aggregator::{DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL, MAX_BATCH_SIZE};
use crate::presence::channel::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_SUBMIT_TIMEOUT, MAX_CHANNEL_CAPACITY};
use crate::presence::liveness::DEFAULT_LIVENESS_WINDOW;
use crate::presence::sweeper::DEFAULT_SWEEP_INTERVAL;
use crate::presence::MAX_TIMER_PERIOD;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{0} must be at most {1}")]
    TooLarge(&'static str, u64),
    #[error("invalid PRESENCE_BIND_ADDR {0:?}")]
    BindAddr(String),
}

#[derive(Clone, Debug)]
pub struct PresenceConfig {
    pub bind_addr: String,
    /// Size trigger for the aggregator.
    pub batch_size: usize,
    /// Time trigger for the aggregator.
    pub flush_interval: Duration,
    pub channel_capacity: usize,
    /// Bounded wait for a full ingestion channel; None = block until capacity frees.
    pub submit_timeout: Option<Duration>,
    pub sweep_interval: Duration,
    /// Shared by the sweeper and the online count.
    pub liveness_window: Duration,
    pub db_url: Option<String>,
    pub redis_url: Option<String>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            submit_timeout: Some(DEFAULT_SUBMIT_TIMEOUT),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            liveness_window: DEFAULT_LIVENESS_WINDOW,
            db_url: None,
            redis_url: None,
        }
    }
}

impl PresenceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` but reads through `lookup`; unparseable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse_u64 = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let secs = |key: &str, default: Duration| parse_u64(key).map(Duration::from_secs).unwrap_or(default);

        let submit_timeout = match parse_u64("PRESENCE_SUBMIT_TIMEOUT_MS") {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.submit_timeout,
        };

        Self {
            bind_addr: lookup("PRESENCE_BIND_ADDR")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.bind_addr),
            batch_size: parse_u64("PRESENCE_BATCH_SIZE")
                .map(|v| v as usize)
                .unwrap_or(defaults.batch_size),
            flush_interval: secs("PRESENCE_FLUSH_INTERVAL_SECS", defaults.flush_interval),
            channel_capacity: parse_u64("PRESENCE_CHANNEL_CAPACITY")
                .map(|v| v as usize)
                .unwrap_or(defaults.channel_capacity),
            submit_timeout,
            sweep_interval: secs("PRESENCE_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            liveness_window: secs("PRESENCE_LIVENESS_WINDOW_SECS", defaults.liveness_window),
            db_url: lookup("PRESENCE_DB_URL").filter(|v| !v.trim().is_empty()),
            redis_url: lookup("PRESENCE_REDIS_URL").filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("PRESENCE_BATCH_SIZE"));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Zero("PRESENCE_CHANNEL_CAPACITY"));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Zero("PRESENCE_FLUSH_INTERVAL_SECS"));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Zero("PRESENCE_SWEEP_INTERVAL_SECS"));
        }
        if self.liveness_window.is_zero() {
            return Err(ConfigError::Zero("PRESENCE_LIVENESS_WINDOW_SECS"));
        }
        if self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::TooLarge("PRESENCE_BATCH_SIZE", MAX_BATCH_SIZE as u64));
        }
        if self.channel_capacity > MAX_CHANNEL_CAPACITY {
            return Err(ConfigError::TooLarge("PRESENCE_CHANNEL_CAPACITY", MAX_CHANNEL_CAPACITY as u64));
        }
        if self.flush_interval > MAX_TIMER_PERIOD {
            return Err(ConfigError::TooLarge("PRESENCE_FLUSH_INTERVAL_SECS", MAX_TIMER_PERIOD.as_secs()));
        }
        if self.sweep_interval > MAX_TIMER_PERIOD {
            return Err(ConfigError::TooLarge("PRESENCE_SWEEP_INTERVAL_SECS", MAX_TIMER_PERIOD.as_secs()));
        }
        self.socket_addr()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_addr
            .parse()
            .map_err(|_| ConfigError::BindAddr(self.bind_addr.clone()))
    }
}
