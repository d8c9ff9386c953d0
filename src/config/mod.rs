//! Settings and configuration module
//!
//! Provides unified configuration with:
//! - JSON settings loading (API keys, proxy groups, harvest sizing)
//! - Validation of cross references between sections
//! - The timing policy consumed by the token bank

mod settings;

use std::time::Duration;

use thiserror::Error;

use crate::modules::queue::TOKEN_TTL;

pub use settings::{CaptchaSettings, HarvestSettings, Settings, TimingSettings};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed settings: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid settings: {0}")]
    Invalid(String),
    #[error("harvest references unknown proxy group {0:?}")]
    UnknownProxyGroup(String),
}

/// Intervals and bounds driving the bank's background loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankConfig {
    pub token_ttl: Duration,
    /// Delay between worker dispatch rounds.
    pub harvest_interval: Duration,
    pub sweep_interval: Duration,
    /// Pause between pops when the queue looks momentarily empty.
    pub empty_poll_backoff: Duration,
    pub max_empty_polls: u32,
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            token_ttl: TOKEN_TTL,
            harvest_interval: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(4),
            empty_poll_backoff: Duration::from_millis(100),
            max_empty_polls: 10,
        }
    }
}
