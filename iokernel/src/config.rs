//! Dataplane configuration.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("mbuf_pool_size {pool} is smaller than tx_burst_size {burst}")]
    PoolTooSmall { pool: usize, burst: usize },

    #[error(
        "max_inflight_per_process {inflight} exceeds overflow_capacity + \
         completion_channel_capacity ({limit})"
    )]
    InflightTooLarge { inflight: usize, limit: usize },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Where the IO addresses of a runtime region's pages come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageTableMode {
    /// IOVA == VA (IOMMU passthrough, or no hardware at all).
    #[default]
    Identity,
    /// Physical addresses from /proc/self/pagemap. Needs hugepage-backed
    /// regions and CAP_SYS_ADMIN.
    Pagemap,
}

/// Tunables of the dataplane loop. Every field has a default, so an empty
/// file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IokernelConfig {
    /// Packets pulled from runtimes per TX iteration.
    pub tx_burst_size: usize,
    /// Commands pulled from runtimes per iteration.
    pub cmd_burst_size: usize,
    /// Overflowed completions retried per iteration.
    pub overflow_batch_drain: usize,
    /// Per-process overflow queue size.
    pub overflow_capacity: usize,
    /// Smallest completion channel a runtime thread may attach with.
    pub completion_channel_capacity: usize,
    /// Completions a runtime may have outstanding at once.
    pub max_inflight_per_process: usize,
    /// Transmit descriptors in the pool.
    pub mbuf_pool_size: usize,
    /// Statistics logging period; 0 disables it.
    pub stats_interval_ms: u64,
    pub page_table: PageTableMode,
}

impl Default for IokernelConfig {
    fn default() -> Self {
        Self {
            tx_burst_size: 64,
            cmd_burst_size: 64,
            overflow_batch_drain: 64,
            overflow_capacity: 4096,
            completion_channel_capacity: 1024,
            max_inflight_per_process: 4096,
            mbuf_pool_size: 32767,
            stats_interval_ms: 1000,
            page_table: PageTableMode::Identity,
        }
    }
}

impl IokernelConfig {
    pub fn from_toml(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&s)
    }

    /// Check the sizing rules. With a configuration that passes, the
    /// dataplane never loses a completion to a full overflow queue: it
    /// stops pulling from a process at `max_inflight_per_process` and only
    /// attaches threads with at least `completion_channel_capacity` slots.
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("tx_burst_size", self.tx_burst_size),
            ("cmd_burst_size", self.cmd_burst_size),
            ("overflow_batch_drain", self.overflow_batch_drain),
            ("overflow_capacity", self.overflow_capacity),
            ("completion_channel_capacity", self.completion_channel_capacity),
            ("max_inflight_per_process", self.max_inflight_per_process),
            ("mbuf_pool_size", self.mbuf_pool_size),
        ] {
            if v == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        if self.mbuf_pool_size < self.tx_burst_size {
            return Err(ConfigError::PoolTooSmall {
                pool: self.mbuf_pool_size,
                burst: self.tx_burst_size,
            });
        }

        let limit = self.overflow_capacity + self.completion_channel_capacity;
        if self.max_inflight_per_process > limit {
            return Err(ConfigError::InflightTooLarge {
                inflight: self.max_inflight_per_process,
                limit,
            });
        }
        Ok(())
    }
}
