//! IPC configuration
//!
//! Every tunable limit of the IPC core lives in [`IpcConfig`]. The
//! defaults are the values a booted kernel uses; a TOML document can
//! override any subset of them:
//!
//! ```toml
//! max_async_calls = 16
//! data_xfer_limit = 4096
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of capability slots a single task may hold
pub const MAX_CAPS_HARD_LIMIT: usize = 1 << 20;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse IPC configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("configuration field `{field}` must be non-zero")]
    Zero { field: &'static str },

    #[error("capability table size {0} exceeds the hard limit")]
    TooManyCaps(usize),
}

/// Tunable limits of the IPC core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Capability table size per task
    pub max_caps: usize,
    /// Outstanding asynchronous calls allowed per connection
    pub max_async_calls: usize,
    /// Largest bulk data transfer in bytes
    pub data_xfer_limit: usize,
    /// Maximum number of instructions in an IRQ program
    pub irq_max_prog_size: usize,
    /// Maximum number of I/O ranges an IRQ program may declare
    pub irq_max_range_count: usize,
    /// Number of interrupt lines
    pub irq_lines: usize,
    /// Preallocated notification calls per IRQ subscription
    pub irq_notif_pool: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            max_caps: 1024,
            max_async_calls: 64,
            data_xfer_limit: 64 * 1024,
            irq_max_prog_size: 256,
            irq_max_range_count: 8,
            irq_lines: 64,
            irq_notif_pool: 16,
        }
    }
}

impl IpcConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(doc: &str) -> Result<Self, ConfigError> {
        let config: IpcConfig = toml::from_str(doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits the kernel cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("max_caps", self.max_caps),
            ("max_async_calls", self.max_async_calls),
            ("data_xfer_limit", self.data_xfer_limit),
            ("irq_max_prog_size", self.irq_max_prog_size),
            ("irq_lines", self.irq_lines),
            ("irq_notif_pool", self.irq_notif_pool),
        ];
        for (field, value) in fields {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.max_caps > MAX_CAPS_HARD_LIMIT {
            return Err(ConfigError::TooManyCaps(self.max_caps));
        }
        Ok(())
    }
}
