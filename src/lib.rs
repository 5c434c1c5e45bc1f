//! # upager - User-Space Paging over userfaultfd
//!
//! upager maps an arbitrary backing store into the address space as ordinary
//! memory and services its page faults in user space. Only a bounded number
//! of pages is resident at a time; modified pages are written back to the
//! store when they are evicted, flushed or unmapped.
//!
//! - **Lazy population**: nothing is read until a page is touched
//! - **Bounded residency**: at most `buffer_capacity` pages are present
//! - **Dirty tracking by write-protect**: clean pages are never written back
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use upager::{FileStore, MapFlags, Mapper, Protection, RegionConfig};
//!
//! let config = RegionConfig::builder().buffer_capacity(256).build()?;
//! let mapper = Mapper::new(config);
//! let store = Arc::new(FileStore::create("data.bin", 1 << 30)?);
//!
//! let region = mapper.map(None, 1 << 30, Protection::READ | Protection::WRITE,
//!                         MapFlags::PRIVATE, store)?;
//! unsafe { region.as_mut_ptr().add(4096).write(7) };
//! mapper.unmap(region)?;   // page 1 is written back to data.bin
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   Mapping Manager (Mapper/Region)    │
//! ├──────────────────┬──────────────────┤
//! │ Fault Dispatchers│ Background Evict │
//! ├──────────────────┴──────────────────┤
//! │   Page Buffer (slots, FIFO, dirty)   │
//! ├──────────────────┬──────────────────┤
//! │ Write-Protect    │      Store       │
//! │ Coordinator      │ file/sparse/zlib │
//! ├──────────────────┴──────────────────┤
//! │     userfaultfd channel (ioctl)      │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Fault Flow
//!
//! ```text
//! access -> kernel fault message -> dispatcher -> page buffer lookup
//!   resident: (write) mark dirty, drop write-protect, wake
//!   miss:     evict FIFO victim (write back if dirty), read store,
//!             copy in (write-protected unless a write), wake
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: `RegionConfig`, defaults, environment overrides
//! - [`store`]: `Store` trait and the file, sparse, compressed and memory
//!   backends
//! - [`uffd`]: userfaultfd channel and message decoding
//! - [`protect`]: write-protect coordinator and its simulated counterpart
//! - [`buffer`]: page buffer and eviction
//! - [`dispatch`]: dispatcher and evictor threads
//! - [`region`]: `Mapper` and `MappedRegion`
//! - [`remote`]: records exchanged with a mapping service
//!
//! ## Platform
//!
//! Linux only. Write-protect mode needs a kernel with
//! `UFFD_FEATURE_PAGEFAULT_FLAG_WP` (5.7+) and permission to create a
//! userfaultfd (`vm.unprivileged_userfaultfd` or `CAP_SYS_PTRACE`).

pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod logging;
pub mod protect;
pub mod region;
pub mod remote;
pub mod stats;
pub mod store;
pub mod uffd;

pub use config::{ConfigError, RegionConfig, RegionConfigBuilder};
pub use region::{MapFlags, MappedRegion, Mapper, Protection, RegionKey};
pub use stats::StatsSnapshot;
pub use store::{
    AnyStore, CompressedStore, FileStore, MemoryStore, SparseStore, Store, StoreError, StoreKind,
};
pub use uffd::Uffd;
