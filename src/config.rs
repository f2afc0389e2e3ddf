//! Store configuration.
//!
//! Configuration can be set programmatically through the builder or loaded
//! from environment variables.
//!
//! # Environment Variables
//!
//! All variables use the `CHUNKSTORE_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `CHUNKSTORE_HEAP_CAPACITY` | Heap region size in bytes | 134217728 (128MB) |
//! | `CHUNKSTORE_NODE_ID` | 16-bit node id stamped into issued CIDs | 0 |
//!
//! # Example
//!
//! ```rust,ignore
//! use chunkstore::StoreConfig;
//!
//! let config = StoreConfig::builder()
//!     .heap_capacity(1 << 30) // 1GB
//!     .node_id(42)
//!     .build()
//!     .unwrap();
//! ```

use std::env;

use thiserror::Error;

use crate::heap::{MAX_HEAP_CAPACITY, MIN_HEAP_CAPACITY};

/// Default heap capacity: 128MB.
pub const DEFAULT_HEAP_CAPACITY: usize = 128 * 1024 * 1024;

/// Smallest heap a store accepts; covers the node directory plus one table
/// path and leaves room for chunks.
pub const MIN_STORE_HEAP_CAPACITY: usize = 4 * 1024 * 1024;

const _: () = assert!(MIN_STORE_HEAP_CAPACITY >= MIN_HEAP_CAPACITY);

/// Configuration rejected by validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Heap capacity outside the supported range.
    #[error("heap capacity {0} out of range ({MIN_STORE_HEAP_CAPACITY}..={MAX_HEAP_CAPACITY})")]
    HeapCapacity(usize),

    /// An environment variable held an unparsable value.
    #[error("invalid value for {var}: {value}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}

/// Validated store configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    heap_capacity: usize,
    node_id: u16,
}

impl StoreConfig {
    /// Start building a configuration from defaults.
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    /// Load configuration from `CHUNKSTORE_*` environment variables, falling
    /// back to defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = Self::builder();

        if let Some(v) = read_env("CHUNKSTORE_HEAP_CAPACITY")? {
            builder = builder.heap_capacity(v as usize);
        }
        if let Some(v) = read_env("CHUNKSTORE_NODE_ID")? {
            builder = builder.node_id(v as u16);
        }

        builder.build()
    }

    /// Heap region size in bytes.
    pub fn heap_capacity(&self) -> usize {
        self.heap_capacity
    }

    /// Node id stamped into issued CIDs.
    pub fn node_id(&self) -> u16 {
        self.node_id
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            heap_capacity: DEFAULT_HEAP_CAPACITY,
            node_id: 0,
        }
    }
}

fn read_env(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(None),
    }
}

/// Builder for [`StoreConfig`].
#[derive(Debug, Clone, Default)]
pub struct StoreConfigBuilder {
    heap_capacity: Option<usize>,
    node_id: Option<u16>,
}

impl StoreConfigBuilder {
    /// Set the heap region size in bytes.
    pub fn heap_capacity(mut self, bytes: usize) -> Self {
        self.heap_capacity = Some(bytes);
        self
    }

    /// Set the node id stamped into issued CIDs.
    pub fn node_id(mut self, nid: u16) -> Self {
        self.node_id = Some(nid);
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<StoreConfig, ConfigError> {
        let defaults = StoreConfig::default();
        let heap_capacity = self.heap_capacity.unwrap_or(defaults.heap_capacity);

        if !(MIN_STORE_HEAP_CAPACITY..=MAX_HEAP_CAPACITY).contains(&heap_capacity) {
            return Err(ConfigError::HeapCapacity(heap_capacity));
        }

        Ok(StoreConfig {
            heap_capacity,
            node_id: self.node_id.unwrap_or(defaults.node_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::builder().build().unwrap();
        assert_eq!(config.heap_capacity(), DEFAULT_HEAP_CAPACITY);
        assert_eq!(config.node_id(), 0);
    }

    #[test]
    fn test_builder() {
        let config = StoreConfig::builder()
            .heap_capacity(64 << 20)
            .node_id(3)
            .build()
            .unwrap();
        assert_eq!(config.heap_capacity(), 64 << 20);
        assert_eq!(config.node_id(), 3);
    }

    #[test]
    fn test_capacity_validation() {
        assert_eq!(
            StoreConfig::builder().heap_capacity(1024).build(),
            Err(ConfigError::HeapCapacity(1024))
        );
    }
}
