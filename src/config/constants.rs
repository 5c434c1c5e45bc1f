//! # Pager Configuration Constants
//!
//! This module centralizes the numeric defaults of the pager, grouping
//! interdependent values together and documenting their relationships.
//!
//! ## Dependency Graph
//!
//! ```text
//! system page size (sysconf)
//!       │
//!       └─> page_size override (must be a multiple)
//!             Every copy-in, write-protect toggle and store transfer is
//!             exactly one page_size long.
//!
//! buffer_capacity (pages)
//!       │
//!       ├─> num_fillers (must be <=)
//!       │     A filler claims one slot for the duration of a fill. With more
//!       │     fillers than slots every slot can be mid-fill and no victim is
//!       │     left for the next miss.
//!       │
//!       └─> DEFAULT_LOW_WATER / DEFAULT_HIGH_WATER (percent of capacity)
//!             Background evictors start at high water and stop at low water.
//!
//! DEFAULT_POLL_TIMEOUT_MS
//!       │
//!       └─> Upper bound on how long unmap waits for a dispatcher to notice
//!           the stop flag.
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced at compile time below:
//!
//! 1. `DEFAULT_LOW_WATER < DEFAULT_HIGH_WATER <= 100`
//! 2. `UFFD_MSG_SIZE` matches the kernel's `struct uffd_msg`
//! 3. `MIN_BUFFER_CAPACITY <= MAX_DEFAULT_BUFFER_CAPACITY`

// ============================================================================
// FAULT CHANNEL
// ============================================================================

/// Bounded wait of a dispatcher on the fault channel before it rechecks the
/// stop flag.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 2000;

/// Messages pulled from the fault channel per read.
pub const DEFAULT_MAX_FAULT_EVENTS: usize = 256;

/// Size of one `struct uffd_msg`.
pub const UFFD_MSG_SIZE: usize = 32;

// ============================================================================
// PAGE BUFFER
// ============================================================================

/// Smallest accepted page buffer.
pub const MIN_BUFFER_CAPACITY: usize = 1;

/// Upper clamp on the auto-detected buffer capacity (pages).
pub const MAX_DEFAULT_BUFFER_CAPACITY: usize = 1 << 20;

/// Share of free system memory the auto-detected buffer may occupy.
pub const DEFAULT_BUFFER_MEMORY_PERCENT: u64 = 90;

/// Dispatcher/evictor count when parallelism cannot be queried.
pub const FALLBACK_THREAD_COUNT: usize = 16;

// ============================================================================
// BACKGROUND EVICTION
// ============================================================================

/// Residency (percent of capacity) at which background eviction starts.
pub const DEFAULT_HIGH_WATER: u8 = 90;

/// Residency (percent of capacity) at which background eviction stops.
pub const DEFAULT_LOW_WATER: u8 = 70;

/// How long an idle evictor sleeps before rechecking residency.
pub const EVICTOR_IDLE_WAIT_MS: u64 = 50;

// ============================================================================
// SPARSE STORE
// ============================================================================

/// Name of the metadata file inside a sparse store directory.
pub const SPARSE_METADATA_FILE: &str = "_metadata";

// ============================================================================
// ENVIRONMENT
// ============================================================================

pub const ENV_PAGE_SIZE: &str = "UPAGER_PAGESIZE";
pub const ENV_BUFFER_CAPACITY: &str = "UPAGER_BUFSIZE";
pub const ENV_FILLERS: &str = "UPAGER_PAGE_FILLERS";
pub const ENV_EVICTORS: &str = "UPAGER_PAGE_EVICTORS";
pub const ENV_HIGH_WATER: &str = "UPAGER_EVICT_HIGH_WATER_THRESHOLD";
pub const ENV_LOW_WATER: &str = "UPAGER_EVICT_LOW_WATER_THRESHOLD";
pub const ENV_MAX_FAULT_EVENTS: &str = "UPAGER_MAX_FAULT_EVENTS";
pub const ENV_LOG_LEVEL: &str = "UPAGER_LOG_LEVEL";

const _: () = assert!(
    DEFAULT_LOW_WATER < DEFAULT_HIGH_WATER && DEFAULT_HIGH_WATER <= 100,
    "default watermarks must satisfy low < high <= 100"
);

const _: () = assert!(UFFD_MSG_SIZE == 32, "struct uffd_msg is 32 bytes");

const _: () = assert!(
    MIN_BUFFER_CAPACITY <= MAX_DEFAULT_BUFFER_CAPACITY,
    "buffer capacity clamp is inverted"
);
