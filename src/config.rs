//! Persisted settings.
//!
//! Settings live in a TOML file. Every key is optional; missing keys take
//! their defaults and the register map can be overridden field by field
//! under `[registers]`.
//!
//! ```toml
//! ip_address = "172.20.75.180"
//! timeout_ms = 500
//! poll_interval_ms = 1000
//!
//! [registers]
//! hist_base = 0x10000
//! ```

use std::path::Path;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::address::{TargetAddress, DEFAULT_TARGET_ADDRESS};
use crate::client::TargetConfig;
use crate::command::MAX_WORDS_PER_TRANSACTION;
use crate::controller::PollPolicy;
use crate::electronics::ReadPolicy;
use crate::error::ConfigError;
use crate::register::RegisterMap;
use crate::transport::DEFAULT_IPBUS_PORT;

/// File name used when no path is given.
pub const DEFAULT_SETTINGS_FILE: &str = "FITtest.toml";

/// Everything read at startup and written back at shutdown.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    /// Last used board address.
    #[serde(default = "default_ip_address")]
    pub ip_address: String,

    /// UDP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Timeout of one request/reply exchange, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Interval between status polls while online.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// First retry interval while the board does not answer.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Factor applied to the retry interval after each failed retry.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: f64,

    /// Upper bound of the retry interval.
    #[serde(default = "default_max_retry_interval_ms")]
    pub max_retry_interval_ms: u64,

    /// Words per histogram block read.
    #[serde(default = "default_block_words")]
    pub block_words: usize,

    /// Extra attempts per histogram block.
    #[serde(default = "default_block_retries")]
    pub block_retries: u32,

    /// Register map of the board.
    #[serde(default)]
    pub registers: RegisterMap,
}

fn default_ip_address() -> String {
    DEFAULT_TARGET_ADDRESS.into()
}
fn default_port() -> u16 {
    DEFAULT_IPBUS_PORT
}
fn default_timeout_ms() -> u64 {
    500
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_retry_interval_ms() -> u64 {
    1000
}
fn default_retry_backoff() -> f64 {
    1.0
}
fn default_max_retry_interval_ms() -> u64 {
    10_000
}
fn default_block_words() -> usize {
    MAX_WORDS_PER_TRANSACTION
}
fn default_block_retries() -> u32 {
    2
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ip_address: default_ip_address(),
            port: default_port(),
            timeout_ms: default_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            retry_backoff: default_retry_backoff(),
            max_retry_interval_ms: default_max_retry_interval_ms(),
            block_words: default_block_words(),
            block_retries: default_block_retries(),
            registers: RegisterMap::default(),
        }
    }
}

impl Settings {
    /// Loads and validates settings from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or a value is
    /// out of range. An invalid `ip_address` is not an error, see
    /// [`target_address`](Self::target_address).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from `path`, falling back to defaults if the file is
    /// missing or unusable.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }
        Self::load(path).unwrap_or_else(|e| {
            warn!("{}: {}, using defaults", path.display(), e);
            Self::default()
        })
    }

    /// Writes the settings to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }

    /// Checks value ranges and the register map.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(invalid("timeout_ms", "must be greater than 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", "must be greater than 0"));
        }
        if self.retry_interval_ms == 0 {
            return Err(invalid("retry_interval_ms", "must be greater than 0"));
        }
        if !(self.retry_backoff >= 1.0 && self.retry_backoff.is_finite()) {
            return Err(invalid("retry_backoff", "must be a finite number >= 1.0"));
        }
        if self.max_retry_interval_ms < self.retry_interval_ms {
            return Err(invalid(
                "max_retry_interval_ms",
                "must not be below retry_interval_ms",
            ));
        }
        if !(1..=MAX_WORDS_PER_TRANSACTION).contains(&self.block_words) {
            return Err(invalid(
                "block_words",
                format!("must be between 1 and {}", MAX_WORDS_PER_TRANSACTION),
            ));
        }
        self.registers.validate()
    }

    /// Board address, or the compiled-in default if the stored one is invalid.
    pub fn target_address(&self) -> TargetAddress {
        TargetAddress::parse(&self.ip_address).unwrap_or_else(|_| {
            warn!(
                "stored address {:?} is invalid, using {}",
                self.ip_address, DEFAULT_TARGET_ADDRESS
            );
            TargetAddress::default()
        })
    }

    /// Connection configuration.
    pub fn target_config(&self) -> TargetConfig {
        TargetConfig::new(self.target_address())
            .with_port(self.port)
            .with_timeout(Duration::from_millis(self.timeout_ms))
    }

    /// Status poll schedule.
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            retry_backoff: self.retry_backoff,
            max_retry_interval: Duration::from_millis(self.max_retry_interval_ms),
        }
    }

    /// Histogram block read policy.
    pub fn read_policy(&self) -> ReadPolicy {
        ReadPolicy {
            block_words: self.block_words,
            block_retries: self.block_retries,
        }
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}
