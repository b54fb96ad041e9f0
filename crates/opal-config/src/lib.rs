//! Interpreter Configuration
//!
//! Plain-data configuration types consumed by the Opal runtime and CLI.
//! A project may pin interpreter options in an `opal.toml` file; the CLI
//! merges its flags on top of whatever was loaded.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Heap threshold for the first garbage collection (1 MiB).
pub const DEFAULT_GC_THRESHOLD: usize = 1024 * 1024;

/// Multiplier applied to the live-byte count after each collection.
pub const DEFAULT_GC_GROW_FACTOR: usize = 2;

/// Garbage collector tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct GcConfig {
    /// Collect at every safe point instead of waiting for the threshold.
    pub stress: bool,
    /// Write collection activity to stderr.
    pub log: bool,
    /// Allocated-byte count that triggers the first collection.
    pub initial_threshold: usize,
    /// Multiplier for the next threshold after a collection.
    pub grow_factor: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            stress: false,
            log: false,
            initial_threshold: DEFAULT_GC_THRESHOLD,
            grow_factor: DEFAULT_GC_GROW_FACTOR,
        }
    }
}

/// Virtual machine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct VmConfig {
    /// Garbage collector settings
    pub gc: GcConfig,
    /// Discard `print` output instead of writing it.
    pub suppress_print: bool,
}

/// Errors raised while loading a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file was not valid TOML or did not match the schema
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

impl VmConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Convenience constructor for GC stress-test runs
    pub fn stress_gc() -> Self {
        Self {
            gc: GcConfig {
                stress: true,
                ..GcConfig::default()
            },
            ..Self::default()
        }
    }
}
