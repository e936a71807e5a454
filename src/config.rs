//! Store configuration
//!
//! Configuration is layered: defaults, then an optional TOML file, then
//! `CLUSTORE__*` environment variables.
//!
//! ```toml
//! cluster_size = 512
//! reserved_streams = 2
//! preallocate = true
//!
//! [page_cache]
//! page_size = 65536
//! capacity = { pages = 32 }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Smallest cluster payload accepted
pub const MIN_CLUSTER_SIZE: u32 = 16;
/// Largest cluster payload accepted (1 MiB)
pub const MAX_CLUSTER_SIZE: u32 = 1 << 20;

/// Configuration for a clustered store and the containers built on it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Payload bytes per cluster
    pub cluster_size: u32,
    /// Descriptor slots set aside for metadata providers
    pub reserved_streams: u32,
    /// Pre-size streams to the serializer's declared size before writing
    pub preallocate: bool,
    /// Page cache settings for memory-paged lists
    pub page_cache: PageCacheConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cluster_size: 256,
            reserved_streams: 0,
            preallocate: true,
            page_cache: PageCacheConfig::default(),
        }
    }
}

/// Page cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageCacheConfig {
    /// Byte budget of a single page
    pub page_size: usize,
    /// How many pages may be loaded at once
    pub capacity: CacheCapacity,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self {
            page_size: 64 * 1024,
            capacity: CacheCapacity::Pages(16),
        }
    }
}

/// Capacity policy of the page cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCapacity {
    /// Maximum number of simultaneously loaded pages
    Pages(usize),
    /// Maximum total estimated bytes of loaded pages
    Bytes(usize),
}

impl StoreConfig {
    /// Load configuration from a TOML file, overridden by `CLUSTORE__*`
    /// environment variables (e.g. `CLUSTORE__CLUSTER_SIZE=1024`)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(config::Environment::with_prefix("CLUSTORE").separator("__"))
            .build()
            .map_err(|e| Error::Config(format!("Failed to read configuration: {}", e)))?;

        let cfg: StoreConfig = settings
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let cfg: StoreConfig = toml::from_str(source)
            .map_err(|e| Error::Config(format!("Invalid TOML configuration: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if !(MIN_CLUSTER_SIZE..=MAX_CLUSTER_SIZE).contains(&self.cluster_size) {
            return Err(Error::Config(format!(
                "cluster_size {} outside {}..={}",
                self.cluster_size, MIN_CLUSTER_SIZE, MAX_CLUSTER_SIZE
            )));
        }
        if self.page_cache.page_size == 0 {
            return Err(Error::Config("page_cache.page_size must be positive".to_string()));
        }
        match self.page_cache.capacity {
            CacheCapacity::Pages(0) | CacheCapacity::Bytes(0) => Err(Error::Config(
                "page_cache.capacity must be positive".to_string(),
            )),
            _ => Ok(()),
        }
    }
}
