//! # Mapping Manager
//!
//! Entry point of the pager. [`Mapper::map`] reserves an address range,
//! registers it with a userfaultfd channel and starts the region's worker
//! threads; [`Mapper::unmap`] stops them, writes every dirty page back to the
//! store and releases the range.
//!
//! ## Region Lifecycle
//!
//! ```text
//! map:   validate -> mmap(NORESERVE) -> registry insert -> uffd register
//!        -> page buffer -> dispatchers + evictors
//! unmap: stop flag -> join workers -> flush_all -> uffd unregister
//!        -> munmap -> registry remove
//! ```
//!
//! Each region owns its channel, buffer and threads. Regions share nothing
//! except the [`Mapper`]'s registry, an ordered map keyed by [`RegionKey`]
//! that rejects overlapping ranges and answers [`Mapper::containing`].
//!
//! Dropping a [`MappedRegion`] unmaps it; failures on that path can only be
//! logged, so callers that care call [`Mapper::unmap`] and inspect the
//! result.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bitflags::bitflags;
use eyre::{bail, Result, WrapErr};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::buffer::PageBuffer;
use crate::config::{system_page_size, ConfigError, RegionConfig, EVICTOR_IDLE_WAIT_MS};
use crate::dispatch::{spawn_dispatchers, spawn_evictors, FaultSource};
use crate::logging;
use crate::protect::WriteProtector;
use crate::stats::{RegionStats, StatsSnapshot};
use crate::store::Store;
use crate::uffd::Uffd;

bitflags! {
    /// Access protection of a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: i32 {
        const READ = libc::PROT_READ;
        const WRITE = libc::PROT_WRITE;
        const EXEC = libc::PROT_EXEC;
    }
}

bitflags! {
    /// Map request flags. `PRIVATE` is mandatory; `FIXED` places the region
    /// exactly at the address hint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: i32 {
        const SHARED = libc::MAP_SHARED;
        const PRIVATE = libc::MAP_PRIVATE;
        const FIXED = libc::MAP_FIXED;
    }
}

impl MapFlags {
    fn check(self) -> Result<()> {
        let allowed = MapFlags::PRIVATE | MapFlags::FIXED;
        if !self.contains(MapFlags::PRIVATE) || !allowed.contains(self) {
            bail!(ConfigError::InvalidFlags {
                flags: self.bits() as u32
            });
        }
        Ok(())
    }
}

/// Address range of a managed region, ordered by start then length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionKey {
    pub start: usize,
    pub len: usize,
}

impl RegionKey {
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn overlaps(&self, other: &RegionKey) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

type Registry = Arc<Mutex<BTreeMap<RegionKey, usize>>>;

/// Predecessor of `key.end()` is the only registered range that can overlap
/// `key`, since registered ranges are disjoint.
fn find_overlap(map: &BTreeMap<RegionKey, usize>, key: &RegionKey) -> Option<RegionKey> {
    let bound = RegionKey {
        start: key.end(),
        len: 0,
    };
    map.range(..bound)
        .next_back()
        .map(|(k, _)| *k)
        .filter(|k| k.overlaps(key))
}

/// Registry entry that is removed again when dropped.
struct Registration {
    registry: Registry,
    key: RegionKey,
}

impl Registration {
    fn insert(registry: &Registry, key: RegionKey, page_size: usize) -> Result<Self> {
        let mut map = registry.lock();
        if let Some(existing) = find_overlap(&map, &key) {
            debug!(start = key.start, len = key.len, existing = existing.start, "overlapping map request");
            bail!(ConfigError::Overlap {
                start: key.start,
                len: key.len,
            });
        }
        map.insert(key, page_size);
        Ok(Self {
            registry: Arc::clone(registry),
            key,
        })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}

/// Anonymous, unpopulated address range. Unmapped when dropped.
struct Reservation {
    base: usize,
    len: usize,
}

impl Reservation {
    /// Reserves `len` bytes aligned to `align`. With `fixed`, the range must
    /// start exactly at `hint` and must not replace an existing mapping.
    fn new(
        hint: Option<usize>,
        len: usize,
        align: usize,
        prot: Protection,
        fixed: bool,
    ) -> Result<Self> {
        let sys = system_page_size();
        let padding = if fixed || align <= sys { 0 } else { align - sys };
        let total = len + padding;

        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        if fixed {
            flags |= libc::MAP_FIXED_NOREPLACE;
        }
        let addr = hint.unwrap_or(0) as *mut libc::c_void;

        // SAFETY: an anonymous mapping with no fd; MAP_FIXED_NOREPLACE never
        // replaces an existing mapping.
        let raw = unsafe { libc::mmap(addr, total, prot.bits(), flags, -1, 0) };
        if raw == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            if fixed && err.raw_os_error() == Some(libc::EEXIST) {
                bail!(ConfigError::Overlap {
                    start: hint.unwrap_or(0),
                    len,
                });
            }
            return Err(err).wrap_err_with(|| format!("failed to reserve {} bytes", total));
        }
        let raw = raw as usize;

        if fixed && Some(raw) != hint {
            // Kernels without MAP_FIXED_NOREPLACE treat it as a hint.
            unmap_range(raw, total);
            bail!(ConfigError::Overlap {
                start: hint.unwrap_or(0),
                len,
            });
        }

        let base = raw.next_multiple_of(align);
        let head = base - raw;
        let tail = total - head - len;
        if head > 0 {
            unmap_range(raw, head);
        }
        if tail > 0 {
            unmap_range(base + len, tail);
        }

        Ok(Self { base, len })
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        unmap_range(self.base, self.len);
    }
}

fn unmap_range(start: usize, len: usize) {
    // SAFETY: callers only pass ranges this module reserved.
    if unsafe { libc::munmap(start as *mut libc::c_void, len) } != 0 {
        warn!(
            start,
            len,
            error = %io::Error::last_os_error(),
            "munmap failed"
        );
    }
}

/// Creates and tracks pager-managed regions.
///
/// Region memory must not be touched from a store implementation or any
/// other code running on a dispatcher thread: the fault would wait for the
/// thread that is supposed to resolve it.
pub struct Mapper {
    config: RegionConfig,
    registry: Registry,
}

impl Default for Mapper {
    fn default() -> Self {
        Self::new(RegionConfig::from_env())
    }
}

impl Mapper {
    /// A mapper whose regions use `config` unless [`Mapper::map_with`]
    /// overrides it. Installs the log subscriber at `config.log_level`.
    pub fn new(config: RegionConfig) -> Self {
        logging::init(config.log_level);
        Self {
            config,
            registry: Arc::default(),
        }
    }

    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    pub fn map(
        &self,
        addr_hint: Option<usize>,
        length: usize,
        prot: Protection,
        flags: MapFlags,
        store: Arc<dyn Store>,
    ) -> Result<MappedRegion> {
        self.map_with(addr_hint, length, prot, flags, store, &self.config)
    }

    /// Maps `length` bytes backed by `store`, with per-region options.
    ///
    /// Byte `i` of the region corresponds to store offset `i`. The store
    /// must hold at least `length` bytes.
    pub fn map_with(
        &self,
        addr_hint: Option<usize>,
        length: usize,
        prot: Protection,
        flags: MapFlags,
        store: Arc<dyn Store>,
        config: &RegionConfig,
    ) -> Result<MappedRegion> {
        config.validate()?;
        flags.check()?;
        let page_size = config.page_size;
        let fixed = flags.contains(MapFlags::FIXED);

        if length == 0 || length % page_size != 0 {
            bail!(ConfigError::InvalidLength { length, page_size });
        }
        if let Some(addr) = addr_hint {
            if addr % page_size != 0 {
                bail!(ConfigError::Misaligned { addr, page_size });
            }
        } else if fixed {
            bail!(ConfigError::InvalidOption {
                option: "addr_hint",
                reason: "FIXED requires an address".to_string(),
            });
        }
        if prot.is_empty() {
            bail!(ConfigError::InvalidOption {
                option: "protection",
                reason: "a region must be at least readable".to_string(),
            });
        }
        if store.capacity() < length as u64 {
            bail!(ConfigError::InvalidOption {
                option: "store",
                reason: format!(
                    "store holds {} bytes, region needs {}",
                    store.capacity(),
                    length
                ),
            });
        }
        if fixed {
            if let Some(start) = addr_hint {
                let wanted = RegionKey { start, len: length };
                if find_overlap(&self.registry.lock(), &wanted).is_some() {
                    bail!(ConfigError::Overlap { start, len: length });
                }
            }
        }

        let reservation = Reservation::new(addr_hint, length, page_size, prot, fixed)?;
        let key = RegionKey {
            start: reservation.base,
            len: length,
        };
        let registration = Registration::insert(&self.registry, key, page_size)?;

        let uffd = Arc::new(Uffd::open()?);
        uffd.register(key.start, key.len, true)?;

        let control = Arc::new(WriteProtector::new(
            Arc::clone(&uffd),
            key.start,
            key.len,
            page_size,
        ));
        let stats = Arc::new(RegionStats::default());
        let buffer = Arc::new(PageBuffer::new(
            config.buffer_capacity,
            store,
            control,
            stats,
        )?);

        let mut region = MappedRegion {
            key,
            page_size,
            uffd: Arc::clone(&uffd),
            buffer,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            reservation: Some(reservation),
            registration: Some(registration),
            closed: false,
        };
        region.start_workers(uffd, config)?;

        info!(
            start = key.start,
            len = key.len,
            page_size,
            buffer_pages = config.buffer_capacity,
            fillers = config.num_fillers,
            evictors = config.num_evictors,
            "mapped region"
        );
        Ok(region)
    }

    /// Stops the region's workers, writes back its dirty pages and releases
    /// its address range.
    pub fn unmap(&self, region: MappedRegion) -> Result<()> {
        region.unmap()
    }

    /// The managed region covering `addr`, if any.
    pub fn containing(&self, addr: usize) -> Option<RegionKey> {
        let bound = RegionKey {
            start: addr,
            len: usize::MAX,
        };
        self.registry
            .lock()
            .range(..=bound)
            .next_back()
            .map(|(k, _)| *k)
            .filter(|k| k.contains(addr))
    }

    pub fn regions(&self) -> Vec<RegionKey> {
        self.registry.lock().keys().copied().collect()
    }
}

/// A live pager-managed region.
pub struct MappedRegion {
    key: RegionKey,
    page_size: usize,
    uffd: Arc<Uffd>,
    buffer: Arc<PageBuffer>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    reservation: Option<Reservation>,
    registration: Option<Registration>,
    closed: bool,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("start", &format_args!("{:#x}", self.key.start))
            .field("len", &self.key.len)
            .field("page_size", &self.page_size)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl MappedRegion {
    fn start_workers(&mut self, uffd: Arc<Uffd>, config: &RegionConfig) -> Result<()> {
        let source: Arc<dyn FaultSource> = uffd;
        let dispatchers = spawn_dispatchers(
            config.num_fillers,
            source,
            &self.buffer,
            self.key.start,
            self.key.len,
            config.max_fault_events,
            config.poll_timeout,
            &self.stop,
        );
        // Join whatever did start before reporting a spawn failure.
        match dispatchers {
            Ok(handles) => self.workers.extend(handles),
            Err(report) => {
                self.stop_workers();
                return Err(report);
            }
        }

        if config.num_evictors > 0 {
            match spawn_evictors(
                config.num_evictors,
                &self.buffer,
                config.high_water_pages(),
                config.low_water_pages(),
                Duration::from_millis(EVICTOR_IDLE_WAIT_MS),
                &self.stop,
            ) {
                Ok(handles) => self.workers.extend(handles),
                Err(report) => {
                    self.stop_workers();
                    return Err(report);
                }
            }
        }
        Ok(())
    }

    /// Sets the stop flag and joins every worker. Returns how many panicked.
    fn stop_workers(&mut self) -> usize {
        self.stop.store(true, Ordering::Release);
        self.workers
            .drain(..)
            .map(|handle| handle.join())
            .filter(|joined| joined.is_err())
            .count()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let panicked = self.stop_workers();
        if panicked > 0 {
            bail!(
                "{} worker threads of region {:#x} panicked",
                panicked,
                self.key.start
            );
        }

        let flushed = self
            .buffer
            .flush_all()
            .wrap_err_with(|| format!("failed to flush region {:#x}", self.key.start))?;
        self.uffd.unregister(self.key.start, self.key.len)?;
        self.reservation.take();
        self.registration.take();

        info!(
            start = self.key.start,
            len = self.key.len,
            flushed,
            stats = %self.buffer.stats().snapshot(),
            "unmapped region"
        );
        Ok(())
    }

    pub fn unmap(mut self) -> Result<()> {
        self.shutdown()
    }

    pub fn key(&self) -> RegionKey {
        self.key
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.key.start as *const u8
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.key.start as *mut u8
    }

    pub fn len(&self) -> usize {
        self.key.len
    }

    pub fn is_empty(&self) -> bool {
        self.key.len == 0
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn resident_pages(&self) -> usize {
        self.buffer.occupied()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.buffer.stats().snapshot()
    }

    pub fn reset_stats(&self) {
        self.buffer.stats().reset();
    }

    /// Writes every dirty resident page back to the store and marks it
    /// clean. Pages stay resident.
    pub fn flush(&self) -> Result<usize> {
        self.buffer.flush_all()
    }

    /// Reads `pages` (region-relative indices) in ahead of access. Pages
    /// already resident or being filled are skipped; the buffer's FIFO policy
    /// still applies, so prefetching more pages than it holds evicts the
    /// earliest ones. Returns how many pages were brought in.
    pub fn prefetch(&self, pages: &[usize]) -> Result<usize> {
        let count = self.key.len / self.page_size;
        if let Some(&page) = pages.iter().find(|&&page| page >= count) {
            bail!("page {} is outside region of {} pages", page, count);
        }

        let mut filled = 0;
        for &page in pages {
            if self.buffer.prefetch(page)? {
                filled += 1;
            }
        }
        debug!(start = self.key.start, requested = pages.len(), filled, "prefetched pages");
        Ok(filled)
    }

    /// Evicts every resident page, writing dirty pages back first. The
    /// region stays mapped and later accesses fault pages in again.
    pub fn evict_all(&self) -> Result<usize> {
        let evicted = self.buffer.evict_all()?;
        debug!(start = self.key.start, evicted, "evicted all pages");
        Ok(evicted)
    }

    /// Copies `buf.len()` bytes starting at `offset` out of the region,
    /// faulting pages in as needed.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        // SAFETY: the range lies inside the reservation, which lives as long
        // as `self`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copies `data` into the region at `offset`, faulting pages in as
    /// needed.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        // SAFETY: as in `read_at`.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.as_mut_ptr().add(offset), data.len());
        }
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.key.len => Ok(()),
            _ => bail!(
                "range {}+{} is outside region of {} bytes",
                offset,
                len,
                self.key.len
            ),
        }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if let Err(report) = self.shutdown() {
            error!(start = self.key.start, error = ?report, "unmap on drop failed");
        }
    }
}
