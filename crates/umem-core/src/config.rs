//! Engine configuration: defaults, environment overrides, validation.

use serde::{Deserialize, Serialize};
use tracing::warn;
use umem_error::{Result, UmemError};
use umem_types::PageSize;

/// Environment variable names honored by [`EngineConfig::from_env`].
pub const ENV_BUFSIZE: &str = "UMEM_BUFSIZE";
pub const ENV_PAGESIZE: &str = "UMEM_PAGESIZE";
pub const ENV_FILL_WORKERS: &str = "UMEM_FILL_WORKERS";
pub const ENV_EVICT_WORKERS: &str = "UMEM_EVICT_WORKERS";
pub const ENV_LOW_WATER: &str = "UMEM_LOW_WATER";
pub const ENV_HIGH_WATER: &str = "UMEM_HIGH_WATER";
pub const ENV_WRITE_RETRIES: &str = "UMEM_WRITE_RETRIES";

/// Construction parameters for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Buffer capacity in pages.
    pub capacity_pages: usize,
    /// Page size shared by the buffer and every region.
    pub page_size: PageSize,
    /// Eviction drain target, as an integer percentage of capacity.
    pub low_water_percentage: u32,
    /// Eviction trigger, as an integer percentage of capacity.
    pub high_water_percentage: u32,
    /// Fill worker pool size.
    pub fill_workers: usize,
    /// Evict worker pool size.
    pub evict_workers: usize,
    /// Transient write-back failures tolerated per page before the engine
    /// gives up.
    pub write_retry_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(16, std::num::NonZeroUsize::get);
        Self {
            capacity_pages: 1024,
            page_size: PageSize::default(),
            low_water_percentage: 70,
            high_water_percentage: 90,
            fill_workers: parallelism,
            evict_workers: parallelism,
            write_retry_limit: 3,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `UMEM_*` environment variables.
    ///
    /// Unparsable values are ignored with a warning, matching the
    /// best-effort behavior of environment knobs.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn read_u64(
            lookup: &impl Fn(&str) -> Option<String>,
            name: &'static str,
        ) -> Option<u64> {
            let raw = lookup(name)?;
            match raw.parse::<u64>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(
                        target: "umem::config",
                        event = "env_value_ignored",
                        name,
                        value = %raw
                    );
                    None
                }
            }
        }

        if let Some(v) = read_u64(&lookup, ENV_BUFSIZE) {
            self.capacity_pages = usize::try_from(v).unwrap_or(usize::MAX);
        }
        if let Some(v) = read_u64(&lookup, ENV_PAGESIZE) {
            match u32::try_from(v).ok().map(PageSize::new) {
                Some(Ok(page_size)) => self.page_size = page_size,
                _ => warn!(
                    target: "umem::config",
                    event = "env_value_ignored",
                    name = ENV_PAGESIZE,
                    value = v
                ),
            }
        }
        if let Some(v) = read_u64(&lookup, ENV_FILL_WORKERS) {
            self.fill_workers = usize::try_from(v).unwrap_or(usize::MAX);
        }
        if let Some(v) = read_u64(&lookup, ENV_EVICT_WORKERS) {
            self.evict_workers = usize::try_from(v).unwrap_or(usize::MAX);
        }
        if let Some(v) = read_u64(&lookup, ENV_LOW_WATER) {
            self.low_water_percentage = u32::try_from(v).unwrap_or(u32::MAX);
        }
        if let Some(v) = read_u64(&lookup, ENV_HIGH_WATER) {
            self.high_water_percentage = u32::try_from(v).unwrap_or(u32::MAX);
        }
        if let Some(v) = read_u64(&lookup, ENV_WRITE_RETRIES) {
            self.write_retry_limit = u32::try_from(v).unwrap_or(u32::MAX);
        }
        self
    }

    pub fn validate(self) -> Result<Self> {
        if self.fill_workers == 0 {
            return Err(UmemError::Config("fill_workers must be > 0".to_owned()));
        }
        if self.evict_workers == 0 {
            return Err(UmemError::Config("evict_workers must be > 0".to_owned()));
        }
        // Capacity and watermark rules are enforced by the buffer config;
        // validate them here too so misconfiguration fails before any
        // thread is spawned.
        umem_buffer::BufferConfig {
            capacity: self.capacity_pages,
            page_size: self.page_size,
            low_water_percentage: self.low_water_percentage,
            high_water_percentage: self.high_water_percentage,
        }
        .validate()?;
        Ok(self)
    }
}
