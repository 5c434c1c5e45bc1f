//! Per-region option set and its validation.

use std::sync::OnceLock;
use std::time::Duration;

use eyre::{bail, Result};
use sysinfo::System;
use tracing::Level;

use super::constants::*;

static SYSTEM_PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Page size reported by the OS. Falls back to 4096 if `sysconf` refuses.
pub fn system_page_size() -> usize {
    *SYSTEM_PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions; a negative result is handled.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    })
}

/// Rejected configuration or map request. Reported to the caller; no region
/// is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidLength { length: usize, page_size: usize },
    Misaligned { addr: usize, page_size: usize },
    InvalidPageSize { page_size: usize, system_page_size: usize },
    InvalidOption { option: &'static str, reason: String },
    InvalidFlags { flags: u32 },
    Overlap { start: usize, len: usize },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidLength { length, page_size } => write!(
                f,
                "region length {} must be a non-zero multiple of the page size {}",
                length, page_size
            ),
            ConfigError::Misaligned { addr, page_size } => write!(
                f,
                "address {:#x} is not aligned to the page size {}",
                addr, page_size
            ),
            ConfigError::InvalidPageSize {
                page_size,
                system_page_size,
            } => write!(
                f,
                "page size {} must be a non-zero multiple of the system page size {}",
                page_size, system_page_size
            ),
            ConfigError::InvalidOption { option, reason } => {
                write!(f, "invalid value for {}: {}", option, reason)
            }
            ConfigError::InvalidFlags { flags } => write!(
                f,
                "unsupported map flags {:#x}: PRIVATE is required, only FIXED may be added",
                flags
            ),
            ConfigError::Overlap { start, len } => write!(
                f,
                "range {:#x}+{:#x} overlaps a region that is already managed",
                start, len
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Options of one mapped region.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Unit of fault resolution, eviction and store I/O.
    pub page_size: usize,
    /// Maximum number of resident pages.
    pub buffer_capacity: usize,
    /// Fault dispatcher threads.
    pub num_fillers: usize,
    /// Background evictor threads. Zero disables background eviction.
    pub num_evictors: usize,
    /// Percent of capacity at which background eviction starts.
    pub high_water: u8,
    /// Percent of capacity at which background eviction stops.
    pub low_water: u8,
    /// Messages read from the channel per read.
    pub max_fault_events: usize,
    pub poll_timeout: Duration,
    pub log_level: Level,
}

impl Default for RegionConfig {
    fn default() -> Self {
        let page_size = system_page_size();
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(FALLBACK_THREAD_COUNT);

        Self {
            page_size,
            buffer_capacity: default_buffer_capacity(page_size),
            num_fillers: threads,
            num_evictors: threads,
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
            max_fault_events: DEFAULT_MAX_FAULT_EVENTS,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            log_level: Level::INFO,
        }
    }
}

/// 90% of currently free memory, in pages, clamped to a sane range.
fn default_buffer_capacity(page_size: usize) -> usize {
    let mut sys = System::new();
    sys.refresh_memory();
    let free_pages = sys.free_memory() / page_size.max(1) as u64;
    let pages = (free_pages * DEFAULT_BUFFER_MEMORY_PERCENT / 100) as usize;
    pages.clamp(MIN_BUFFER_CAPACITY, MAX_DEFAULT_BUFFER_CAPACITY)
}

fn read_env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&v| v != 0)
}

impl RegionConfig {
    pub fn builder() -> RegionConfigBuilder {
        RegionConfigBuilder::new()
    }

    /// Defaults overlaid with any `UPAGER_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = read_env_u64(ENV_PAGE_SIZE) {
            config.page_size = v as usize;
        }
        if let Some(v) = read_env_u64(ENV_BUFFER_CAPACITY) {
            config.buffer_capacity = v as usize;
        }
        if let Some(v) = read_env_u64(ENV_FILLERS) {
            config.num_fillers = v as usize;
        }
        if let Some(v) = read_env_u64(ENV_EVICTORS) {
            config.num_evictors = v as usize;
        }
        if let Some(v) = read_env_u64(ENV_HIGH_WATER) {
            config.high_water = v.min(u8::MAX as u64) as u8;
        }
        if let Some(v) = read_env_u64(ENV_LOW_WATER) {
            config.low_water = v.min(u8::MAX as u64) as u8;
        }
        if let Some(v) = read_env_u64(ENV_MAX_FAULT_EVENTS) {
            config.max_fault_events = v as usize;
        }
        if let Some(level) = std::env::var(ENV_LOG_LEVEL)
            .ok()
            .and_then(|v| v.trim().parse::<Level>().ok())
        {
            config.log_level = level;
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        let sys = system_page_size();
        if self.page_size == 0 || self.page_size % sys != 0 {
            bail!(ConfigError::InvalidPageSize {
                page_size: self.page_size,
                system_page_size: sys,
            });
        }
        if self.buffer_capacity < MIN_BUFFER_CAPACITY {
            bail!(ConfigError::InvalidOption {
                option: "buffer_capacity",
                reason: format!("must be at least {}", MIN_BUFFER_CAPACITY),
            });
        }
        if self.num_fillers == 0 {
            bail!(ConfigError::InvalidOption {
                option: "num_fillers",
                reason: "at least one dispatcher thread is required".to_string(),
            });
        }
        if self.num_fillers > self.buffer_capacity {
            bail!(ConfigError::InvalidOption {
                option: "num_fillers",
                reason: format!(
                    "{} fillers exceed the buffer capacity of {} pages",
                    self.num_fillers, self.buffer_capacity
                ),
            });
        }
        if self.high_water > 100 || self.low_water >= self.high_water {
            bail!(ConfigError::InvalidOption {
                option: "low_water/high_water",
                reason: format!(
                    "need low < high <= 100, got low={} high={}",
                    self.low_water, self.high_water
                ),
            });
        }
        if self.max_fault_events == 0 {
            bail!(ConfigError::InvalidOption {
                option: "max_fault_events",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.poll_timeout.is_zero() {
            bail!(ConfigError::InvalidOption {
                option: "poll_timeout",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Resident page count at which background eviction starts.
    pub fn high_water_pages(&self) -> usize {
        (self.buffer_capacity * self.high_water as usize / 100).max(1)
    }

    /// Resident page count at which background eviction stops.
    pub fn low_water_pages(&self) -> usize {
        self.buffer_capacity * self.low_water as usize / 100
    }
}

/// Fluent construction of a [`RegionConfig`]. Unset options come from
/// [`RegionConfig::from_env`].
#[derive(Debug, Default)]
pub struct RegionConfigBuilder {
    page_size: Option<usize>,
    buffer_capacity: Option<usize>,
    num_fillers: Option<usize>,
    num_evictors: Option<usize>,
    high_water: Option<u8>,
    low_water: Option<u8>,
    max_fault_events: Option<usize>,
    poll_timeout: Option<Duration>,
    log_level: Option<Level>,
}

impl RegionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = Some(bytes);
        self
    }

    pub fn buffer_capacity(mut self, pages: usize) -> Self {
        self.buffer_capacity = Some(pages);
        self
    }

    pub fn num_fillers(mut self, threads: usize) -> Self {
        self.num_fillers = Some(threads);
        self
    }

    pub fn num_evictors(mut self, threads: usize) -> Self {
        self.num_evictors = Some(threads);
        self
    }

    /// Background eviction thresholds in percent of capacity.
    pub fn watermarks(mut self, low: u8, high: u8) -> Self {
        self.low_water = Some(low);
        self.high_water = Some(high);
        self
    }

    pub fn max_fault_events(mut self, events: usize) -> Self {
        self.max_fault_events = Some(events);
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn log_level(mut self, level: Level) -> Self {
        self.log_level = Some(level);
        self
    }

    pub fn build(self) -> Result<RegionConfig> {
        let mut config = RegionConfig::from_env();

        if let Some(v) = self.page_size {
            config.page_size = v;
        }
        if let Some(v) = self.buffer_capacity {
            config.buffer_capacity = v;
        }
        if let Some(v) = self.num_fillers {
            config.num_fillers = v;
        }
        if let Some(v) = self.num_evictors {
            config.num_evictors = v;
        }
        if let Some(v) = self.high_water {
            config.high_water = v;
        }
        if let Some(v) = self.low_water {
            config.low_water = v;
        }
        if let Some(v) = self.max_fault_events {
            config.max_fault_events = v;
        }
        if let Some(v) = self.poll_timeout {
            config.poll_timeout = v;
        }
        if let Some(v) = self.log_level {
            config.log_level = v;
        }

        config.validate()?;
        Ok(config)
    }
}
