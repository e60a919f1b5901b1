//! Machine configuration.
//!
//! Loaded from a JSON file; every field is optional and falls back to its
//! default. The CLI overrides individual fields after loading.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cpu::memory::{ADDRESS_MASK, MEMORY_SIZE};
use crate::cpu::stack::DEFAULT_STACK_CAPACITY;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineConfig {
    /// Size of the stack region in bytes.
    pub stack_capacity: u32,
    /// Load address of the program image; also the initial IPO.
    pub origin: u32,
    /// Initial value of HMEM's error handler slot.
    pub error_handler: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            stack_capacity: DEFAULT_STACK_CAPACITY,
            origin: 0,
            error_handler: 0,
        }
    }
}

impl MachineConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: MachineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_capacity == 0 || self.stack_capacity as usize > MEMORY_SIZE {
            return Err(ConfigError::Invalid(format!(
                "stack_capacity must be in 1..={MEMORY_SIZE}, got {}",
                self.stack_capacity
            )));
        }
        for (name, value) in [("origin", self.origin), ("error_handler", self.error_handler)] {
            if value > ADDRESS_MASK {
                return Err(ConfigError::Invalid(format!(
                    "{name} {value:#X} is outside the 24-bit address space"
                )));
            }
        }
        Ok(())
    }
}

/// Errors raised while loading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
