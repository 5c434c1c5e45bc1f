//! # Page Buffer
//!
//! Bounded table of the pages currently resident in a region, with FIFO
//! eviction and dirty write-back.
//!
//! ## Slot Lifecycle
//!
//! ```text
//!            claim (free slot)
//!   Free ───────────────────────> Filling{page}
//!    ^                                 │ complete_fill
//!    │ evict_oldest                    v
//!    └──── Evicting{victim,          Resident{page, dirty}
//!          next: None}  <──────────────┤      ^
//!                        pop_victim    │      │ write-back done
//!   Evicting{victim,     <─────────────┤      │
//!     next: Some(page)}  claim (full)  └─> WritingBack{page}
//!          │                              (flush_all)
//!          └── eviction done ──> Filling{page}
//! ```
//!
//! While a victim is being evicted its slot is already promised to the next
//! page, and the index maps both pages to the slot. A fault on the victim
//! waits for the eviction to finish and is then resolved as a miss; a fault on
//! the incoming page sees a fill in flight.
//!
//! ## Eviction Policy
//!
//! Strict FIFO: `fifo` records resident slots in insertion order and the
//! victim is the oldest slot that is currently `Resident`. Re-touching a page
//! does not move it. Slots being written back keep their position and are
//! skipped.
//!
//! ## Locking
//!
//! One mutex covers the slot table, the page index and the FIFO queue, so
//! lookup, insertion and victim selection are atomic per page. Store I/O and
//! copy-in run outside the lock on slots held in a transitional state; a
//! condition variable wakes threads waiting for such a slot to settle.
//!
//! Resident hits and fill completions issue their protect/wake ioctls under
//! the lock. A page therefore cannot be picked as a victim between being
//! marked dirty and losing its write protection, and cannot be written by a
//! woken thread before the table records it as resident.
//!
//! ## Write-Back
//!
//! A dirty page is re-protected before it is copied out, so no write can land
//! between the copy and the release. `write_to_store` runs exactly once per
//! dirty eviction, at `page * page_size`.

mod arena;

use std::collections::VecDeque;
use std::sync::Arc;

use eyre::{bail, Result};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::debug;

use crate::protect::PageControl;
use crate::stats::RegionStats;
use crate::store::Store;
use arena::FrameArena;

/// Position of a page in the buffer's slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotIndex(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Filling {
        page: usize,
    },
    Resident {
        page: usize,
        dirty: bool,
    },
    WritingBack {
        page: usize,
    },
    Evicting {
        page: usize,
        dirty: bool,
        next: Option<usize>,
    },
}

/// A page chosen for eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Victim {
    pub page: usize,
    pub dirty: bool,
}

/// Exclusive right to fill one slot with one page. Obtained from
/// [`PageBuffer::claim`] and consumed by [`PageBuffer::fill`].
#[derive(Debug)]
pub struct FillTicket {
    slot: usize,
    page: usize,
    victim: Option<Victim>,
}

impl FillTicket {
    pub fn page(&self) -> usize {
        self.page
    }

    pub fn victim(&self) -> Option<Victim> {
        self.victim
    }
}

/// Result of claiming a page for a fault.
#[derive(Debug)]
pub enum Claim {
    /// The page is resident and the fault has been resolved.
    Resident { slot: SlotIndex, was_dirty: bool },
    /// Another thread is filling the page; its wake covers this fault.
    InFlight,
    /// The caller must fill the page.
    Fill(FillTicket),
}

struct SlotTable {
    slots: Vec<SlotState>,
    index: HashMap<usize, usize>,
    fifo: VecDeque<usize>,
    free: Vec<usize>,
}

impl SlotTable {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![SlotState::Free; capacity],
            index: HashMap::with_capacity(capacity),
            fifo: VecDeque::with_capacity(capacity),
            free: (0..capacity).rev().collect(),
        }
    }

    /// Removes and returns the oldest resident slot.
    fn pop_victim(&mut self) -> Option<(usize, Victim)> {
        let pos = self
            .fifo
            .iter()
            .position(|&slot| matches!(self.slots[slot], SlotState::Resident { .. }))?;
        let slot = self.fifo.remove(pos)?;
        match self.slots[slot] {
            SlotState::Resident { page, dirty } => Some((slot, Victim { page, dirty })),
            _ => None,
        }
    }
}

pub struct PageBuffer {
    capacity: usize,
    page_size: usize,
    store: Arc<dyn Store>,
    control: Arc<dyn PageControl>,
    stats: Arc<RegionStats>,
    table: Mutex<SlotTable>,
    changed: Condvar,
    arena: FrameArena,
}

impl PageBuffer {
    pub fn new(
        capacity: usize,
        store: Arc<dyn Store>,
        control: Arc<dyn PageControl>,
        stats: Arc<RegionStats>,
    ) -> Result<Self> {
        if capacity == 0 {
            bail!("page buffer capacity must be at least 1");
        }
        let page_size = control.page_size();
        Ok(Self {
            capacity,
            page_size,
            store,
            control,
            stats,
            table: Mutex::new(SlotTable::new(capacity)),
            changed: Condvar::new(),
            arena: FrameArena::new(capacity, page_size)?,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn stats(&self) -> &Arc<RegionStats> {
        &self.stats
    }

    /// Slots not free: resident, filling, evicting or being written back.
    pub fn occupied(&self) -> usize {
        self.capacity - self.table.lock().free.len()
    }

    pub fn lookup(&self, page: usize) -> Option<SlotIndex> {
        let table = self.table.lock();
        let slot = *table.index.get(&page)?;
        match table.slots[slot] {
            SlotState::Resident { page: p, .. } if p == page => Some(SlotIndex(slot)),
            _ => None,
        }
    }

    /// Dirty flag of a resident page.
    pub fn is_dirty(&self, page: usize) -> Option<bool> {
        let table = self.table.lock();
        let slot = *table.index.get(&page)?;
        match table.slots[slot] {
            SlotState::Resident { page: p, dirty } if p == page => Some(dirty),
            _ => None,
        }
    }

    /// Resident pages, oldest first.
    pub fn resident_pages(&self) -> Vec<usize> {
        let table = self.table.lock();
        table
            .fifo
            .iter()
            .filter_map(|&slot| match table.slots[slot] {
                SlotState::Resident { page, .. } | SlotState::WritingBack { page } => Some(page),
                _ => None,
            })
            .collect()
    }

    /// Flags a resident slot dirty. Returns whether it was clean before.
    pub fn mark_dirty(&self, slot: SlotIndex) -> bool {
        let mut table = self.table.lock();
        match table.slots.get_mut(slot.0) {
            Some(SlotState::Resident { dirty, .. }) => !std::mem::replace(dirty, true),
            _ => false,
        }
    }

    fn offset(&self, page: usize) -> u64 {
        page as u64 * self.page_size as u64
    }

    /// Looks `page` up for a fault and either resolves it on the spot or
    /// hands out the right to fill it.
    ///
    /// A resident write fault marks the page dirty, drops its protection
    /// without waking and then wakes explicitly; a resident read fault only
    /// wakes. Blocks while the page is being evicted or written back, and
    /// while every slot is in transit.
    pub fn claim(&self, page: usize, write: bool) -> Result<Claim> {
        let mut table = self.table.lock();
        loop {
            let existing = table.index.get(&page).copied();
            if let Some(slot) = existing {
                match table.slots[slot] {
                    SlotState::Resident { page: p, dirty } if p == page => {
                        if write {
                            table.slots[slot] = SlotState::Resident { page, dirty: true };
                            self.control.disable_write_protect(page)?;
                        }
                        self.control.wake(page)?;
                        return Ok(Claim::Resident {
                            slot: SlotIndex(slot),
                            was_dirty: dirty,
                        });
                    }
                    SlotState::Filling { page: p } if p == page => return Ok(Claim::InFlight),
                    SlotState::Evicting { next: Some(n), .. } if n == page => {
                        return Ok(Claim::InFlight)
                    }
                    _ => {
                        self.changed.wait(&mut table);
                        continue;
                    }
                }
            }

            if let Some(slot) = table.free.pop() {
                table.slots[slot] = SlotState::Filling { page };
                table.index.insert(page, slot);
                return Ok(Claim::Fill(FillTicket {
                    slot,
                    page,
                    victim: None,
                }));
            }

            if let Some((slot, victim)) = table.pop_victim() {
                table.slots[slot] = SlotState::Evicting {
                    page: victim.page,
                    dirty: victim.dirty,
                    next: Some(page),
                };
                table.index.insert(page, slot);
                self.stats.inc_evict_victims();
                return Ok(Claim::Fill(FillTicket {
                    slot,
                    page,
                    victim: Some(victim),
                }));
            }

            self.changed.wait(&mut table);
        }
    }

    /// Evicts the ticket's victim if any, reads the page from the store and
    /// installs it. A write fill leaves the page unprotected and dirty.
    pub fn fill(&self, ticket: FillTicket, write: bool) -> Result<SlotIndex> {
        self.make_room(&ticket)?;

        // SAFETY: the ticket owns the slot until `complete_fill`.
        let frame = unsafe { self.arena.frame_mut(ticket.slot) };
        self.store.read_from_store(frame, self.offset(ticket.page))?;
        self.stats.inc_store_reads();

        self.install(ticket, write)
    }

    /// Installs caller-provided contents for a page that is not resident.
    pub fn insert(&self, page: usize, data: &[u8], dirty: bool) -> Result<SlotIndex> {
        if data.len() != self.page_size {
            bail!(
                "insert of {} bytes into a buffer of {}-byte pages",
                data.len(),
                self.page_size
            );
        }
        let ticket = match self.claim(page, dirty)? {
            Claim::Fill(ticket) => ticket,
            Claim::Resident { .. } | Claim::InFlight => {
                bail!("page {} is already resident", page)
            }
        };
        self.make_room(&ticket)?;

        // SAFETY: the ticket owns the slot until `complete_fill`.
        let frame = unsafe { self.arena.frame_mut(ticket.slot) };
        frame.copy_from_slice(data);

        self.install(ticket, dirty)
    }

    fn make_room(&self, ticket: &FillTicket) -> Result<()> {
        let Some(victim) = ticket.victim else {
            return Ok(());
        };

        self.evict_into(ticket.slot, victim)?;

        let mut table = self.table.lock();
        table.index.remove(&victim.page);
        table.slots[ticket.slot] = SlotState::Filling { page: ticket.page };
        self.changed.notify_all();
        Ok(())
    }

    fn install(&self, ticket: FillTicket, write: bool) -> Result<SlotIndex> {
        // SAFETY: the ticket still owns the slot.
        let frame = unsafe { self.arena.frame_mut(ticket.slot) };
        if write {
            self.control.disable_write_protect(ticket.page)?;
            self.control.copy_in(ticket.page, frame, false)?;
        } else {
            self.control.copy_in(ticket.page, frame, true)?;
        }
        self.complete_fill(ticket, write)
    }

    fn complete_fill(&self, ticket: FillTicket, dirty: bool) -> Result<SlotIndex> {
        let mut table = self.table.lock();
        table.slots[ticket.slot] = SlotState::Resident {
            page: ticket.page,
            dirty,
        };
        table.fifo.push_back(ticket.slot);

        let woke = if dirty {
            self.control.wake(ticket.page)
        } else {
            self.control.enable_write_protect(ticket.page)
        };
        self.changed.notify_all();
        woke?;
        Ok(SlotIndex(ticket.slot))
    }

    /// Writes back a dirty victim, then returns its page to the kernel. The
    /// slot's frame is the staging buffer.
    fn evict_into(&self, slot: usize, victim: Victim) -> Result<()> {
        if victim.dirty {
            self.control.enable_write_protect(victim.page)?;
            // SAFETY: the slot is held in `Evicting` by this thread.
            let frame = unsafe { self.arena.frame_mut(slot) };
            self.control.copy_out(victim.page, frame)?;
            self.store.write_to_store(frame, self.offset(victim.page))?;
            self.stats.inc_store_writes();
            self.stats.inc_dirty_evicts();
        } else {
            self.stats.inc_clean_evicts();
        }
        self.control.release(victim.page)?;
        debug!(page = victim.page, dirty = victim.dirty, "evicted page");
        Ok(())
    }

    /// Evicts the oldest resident page and frees its slot. Returns the
    /// evicted page, or `None` when nothing is evictable.
    pub fn evict_oldest(&self) -> Result<Option<usize>> {
        let (slot, victim) = {
            let mut table = self.table.lock();
            let Some((slot, victim)) = table.pop_victim() else {
                return Ok(None);
            };
            table.slots[slot] = SlotState::Evicting {
                page: victim.page,
                dirty: victim.dirty,
                next: None,
            };
            (slot, victim)
        };

        self.evict_into(slot, victim)?;

        let mut table = self.table.lock();
        table.index.remove(&victim.page);
        table.slots[slot] = SlotState::Free;
        table.free.push(slot);
        self.changed.notify_all();
        Ok(Some(victim.page))
    }

    /// Writes every dirty resident page back to the store, re-protects it and
    /// marks it clean. Pages stay resident. Returns the number written.
    pub fn flush_all(&self) -> Result<usize> {
        let dirty: SmallVec<[usize; 32]> = {
            let table = self.table.lock();
            table
                .fifo
                .iter()
                .filter_map(|&slot| match table.slots[slot] {
                    SlotState::Resident { dirty: true, .. } => Some(slot),
                    _ => None,
                })
                .collect()
        };

        let mut written = 0;
        for slot in dirty {
            let page = {
                let mut table = self.table.lock();
                match table.slots[slot] {
                    SlotState::Resident { page, dirty: true } => {
                        table.slots[slot] = SlotState::WritingBack { page };
                        page
                    }
                    _ => continue,
                }
            };

            let outcome = self.write_back(slot, page);

            let mut table = self.table.lock();
            table.slots[slot] = SlotState::Resident {
                page,
                dirty: outcome.is_err(),
            };
            self.changed.notify_all();
            drop(table);

            outcome?;
            written += 1;
        }

        self.store.sync()?;
        if written > 0 {
            debug!(pages = written, "flushed dirty pages");
        }
        Ok(written)
    }

    /// Read-fills `page` ahead of any access to it. Returns `false` when the
    /// page is already resident or another thread is filling it.
    pub fn prefetch(&self, page: usize) -> Result<bool> {
        match self.claim(page, false)? {
            Claim::Fill(ticket) => {
                self.fill(ticket, false)?;
                Ok(true)
            }
            Claim::Resident { .. } | Claim::InFlight => Ok(false),
        }
    }

    /// Evicts resident pages oldest first until none is evictable, writing
    /// dirty ones back. Returns the number evicted.
    pub fn evict_all(&self) -> Result<usize> {
        let mut evicted = 0;
        while self.evict_oldest()?.is_some() {
            evicted += 1;
        }
        Ok(evicted)
    }

    fn write_back(&self, slot: usize, page: usize) -> Result<()> {
        self.control.enable_write_protect(page)?;
        // SAFETY: the slot is held in `WritingBack` by this thread.
        let frame = unsafe { self.arena.frame_mut(slot) };
        self.control.copy_out(page, frame)?;
        self.store.write_to_store(frame, self.offset(page))?;
        self.stats.inc_store_writes();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protect::{PageOp, SimulatedPages, Waiter};
    use crate::store::MemoryStore;
    use std::sync::Barrier;
    use std::thread;
    use std::time::{Duration, Instant};

    const PS: usize = 4096;

    struct Fixture {
        store: Arc<MemoryStore>,
        sim: Arc<SimulatedPages>,
        buffer: Arc<PageBuffer>,
    }

    fn fixture(capacity: usize, pages: usize) -> Fixture {
        let data: Vec<u8> = (0..pages * PS).map(|i| (i / PS) as u8).collect();
        let store = Arc::new(MemoryStore::from_vec(data));
        let sim = Arc::new(SimulatedPages::new(pages, PS));
        let buffer = Arc::new(
            PageBuffer::new(
                capacity,
                store.clone(),
                sim.clone(),
                Arc::new(RegionStats::default()),
            )
            .unwrap(),
        );
        Fixture { store, sim, buffer }
    }

    impl Fixture {
        fn access(&self, page: usize, write: bool) {
            fault_and_wait(&self.buffer, &self.sim, page, write);
        }
    }

    fn fault(buffer: &PageBuffer, page: usize, write: bool) {
        if let Claim::Fill(ticket) = buffer.claim(page, write).unwrap() {
            buffer.fill(ticket, write).unwrap();
        }
    }

    /// Suspends a simulated thread on `page`, resolves its fault and
    /// requires that the thread gets woken.
    fn fault_and_wait(buffer: &PageBuffer, sim: &SimulatedPages, page: usize, write: bool) {
        let waiter = sim.block(page);
        fault(buffer, page, write);
        wait_released(sim, &waiter);
    }

    fn wait_released(sim: &SimulatedPages, waiter: &Waiter) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !sim.is_released(waiter) {
            assert!(
                Instant::now() < deadline,
                "fault on page {} was never woken",
                waiter.page()
            );
            thread::yield_now();
        }
    }

    #[test]
    fn test_page_buffer_read_fill_installs_protected() {
        let f = fixture(4, 8);
        f.access(3, false);

        assert_eq!(f.sim.read(3).unwrap(), vec![3u8; PS]);
        assert!(f.sim.is_protected(3));
        assert_eq!(f.buffer.is_dirty(3), Some(false));
        assert_eq!(
            f.sim.ops_for(3),
            vec![
                PageOp::CopyIn {
                    page: 3,
                    protect: true
                },
                PageOp::Protect { page: 3 },
                PageOp::Wake { page: 3 },
            ]
        );
    }

    #[test]
    fn test_page_buffer_write_fill_wakes_after_copy() {
        let f = fixture(4, 8);
        f.access(2, true);

        assert_eq!(
            f.sim.ops_for(2),
            vec![
                PageOp::Unprotect { page: 2 },
                PageOp::CopyIn {
                    page: 2,
                    protect: false
                },
                PageOp::Wake { page: 2 },
            ]
        );
        assert_eq!(f.buffer.is_dirty(2), Some(true));
        assert!(f.sim.write(2, 0, b"ok"));
    }

    #[test]
    fn test_page_buffer_resident_write_marks_dirty() {
        let f = fixture(4, 8);
        f.access(1, false);
        assert!(!f.sim.write(1, 0, b"x"));

        let waiter = f.sim.block(1);
        match f.buffer.claim(1, true).unwrap() {
            Claim::Resident { was_dirty, .. } => assert!(!was_dirty),
            other => panic!("expected resident claim, got {:?}", other),
        }
        assert!(f.sim.is_released(&waiter));

        assert_eq!(f.buffer.is_dirty(1), Some(true));
        assert!(f.sim.write(1, 0, b"x"));
        assert_eq!(f.store.reads(), 1);
    }

    #[test]
    fn test_page_buffer_residency_bound() {
        let f = fixture(4, 32);
        let order = [0, 5, 9, 5, 31, 2, 7, 0, 13, 21, 4, 4, 30, 1, 6, 17, 9, 28];

        for (i, &page) in order.iter().enumerate() {
            f.access(page, i % 3 == 0);
            assert!(f.buffer.occupied() <= 4);
        }

        assert!(f.sim.peak_present() <= 4);
        assert_eq!(f.sim.present_pages(), f.buffer.resident_pages().len());
    }

    #[test]
    fn test_page_buffer_fifo_eviction_order() {
        let f = fixture(3, 8);
        for page in 0..4 {
            f.access(page, false);
        }

        let released: Vec<usize> = f
            .sim
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                PageOp::Release { page } => Some(page),
                _ => None,
            })
            .collect();
        assert_eq!(released, vec![0]);
        assert_eq!(f.buffer.resident_pages(), vec![1, 2, 3]);
    }

    #[test]
    fn test_page_buffer_retouch_does_not_reorder() {
        let f = fixture(2, 8);
        f.access(0, false);
        f.access(1, false);
        f.access(0, true);
        f.access(2, false);

        assert_eq!(f.buffer.resident_pages(), vec![1, 2]);
        assert_eq!(f.store.write_offsets(), vec![0]);
    }

    #[test]
    fn test_page_buffer_dirty_victim_written_once() {
        let f = fixture(2, 8);
        f.access(5, true);
        assert!(f.sim.write(5, 100, &[0xAB; 16]));

        f.access(6, false);
        f.access(7, false);

        assert_eq!(f.store.write_offsets(), vec![5 * PS as u64]);
        let snap = f.store.snapshot();
        assert_eq!(&snap[5 * PS + 100..5 * PS + 116], &[0xAB; 16]);

        let ops = f.sim.ops_for(5);
        let protect = ops.iter().rposition(|op| *op == PageOp::Protect { page: 5 }).unwrap();
        let copy_out = ops.iter().position(|op| *op == PageOp::CopyOut { page: 5 }).unwrap();
        assert!(protect < copy_out);

        let stats = f.buffer.stats().snapshot();
        assert_eq!(stats.dirty_evicts, 1);
        assert_eq!(stats.clean_evicts, 0);
        assert_eq!(stats.evict_victims, 1);
    }

    #[test]
    fn test_page_buffer_clean_victim_not_written() {
        let f = fixture(1, 4);
        f.access(0, false);
        f.access(1, false);

        assert_eq!(f.store.writes(), 0);
        assert_eq!(f.buffer.stats().snapshot().clean_evicts, 1);
        assert!(!f.sim.is_present(0));
    }

    #[test]
    fn test_page_buffer_round_trip_through_eviction() {
        let f = fixture(3, 16);
        let pattern: Vec<u8> = (0..PS).map(|i| (i * 7 % 256) as u8).collect();

        f.access(9, true);
        assert!(f.sim.write(9, 0, &pattern));

        for page in 0..3 {
            f.access(page, false);
        }
        assert!(!f.sim.is_present(9));

        f.access(9, false);
        assert_eq!(f.sim.read(9).unwrap(), pattern);
    }

    #[test]
    fn test_page_buffer_concurrent_double_fault() {
        let f = fixture(4, 8);
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let buffer = Arc::clone(&f.buffer);
                let sim = Arc::clone(&f.sim);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    fault_and_wait(&buffer, &sim, 2, false);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(f.store.reads(), 1);
        let copies = f
            .sim
            .ops_for(2)
            .iter()
            .filter(|op| matches!(op, PageOp::CopyIn { .. }))
            .count();
        assert_eq!(copies, 1);
        assert_eq!(f.sim.read(2).unwrap(), vec![2u8; PS]);
        assert!(f.sim.blocked_pages().is_empty());
    }

    #[test]
    fn test_page_buffer_concurrent_faults_respect_capacity() {
        let f = fixture(4, 24);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let buffer = Arc::clone(&f.buffer);
                let sim = Arc::clone(&f.sim);
                thread::spawn(move || {
                    for i in 0..200usize {
                        let page = (i * 7 + t * 5) % 24;
                        let write = (i + t) % 4 == 0;
                        fault_and_wait(&buffer, &sim, page, write);
                        if write {
                            sim.write(page, 0, &[t as u8]);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(f.sim.peak_present() <= 4);
        assert!(f.buffer.occupied() <= 4);
        assert!(f.sim.blocked_pages().is_empty());
    }

    #[test]
    fn test_page_buffer_flush_all_cleans_and_protects() {
        let f = fixture(4, 8);
        f.access(1, true);
        f.access(2, false);
        assert!(f.sim.write(1, 0, b"flushed"));

        assert_eq!(f.buffer.flush_all().unwrap(), 1);

        assert_eq!(f.buffer.is_dirty(1), Some(false));
        assert!(f.sim.is_protected(1));
        assert!(f.sim.is_present(1));
        assert_eq!(&f.store.snapshot()[PS..PS + 7], b"flushed");
        assert_eq!(f.buffer.flush_all().unwrap(), 0);
    }

    #[test]
    fn test_page_buffer_evict_oldest_frees_slot() {
        let f = fixture(2, 8);
        f.access(4, false);
        f.access(5, true);

        assert_eq!(f.buffer.evict_oldest().unwrap(), Some(4));
        assert_eq!(f.buffer.occupied(), 1);
        assert_eq!(f.buffer.evict_oldest().unwrap(), Some(5));
        assert_eq!(f.buffer.evict_oldest().unwrap(), None);
        assert_eq!(f.store.write_offsets(), vec![5 * PS as u64]);
    }

    #[test]
    fn test_page_buffer_insert_lookup_mark_dirty() {
        let f = fixture(2, 8);
        let slot = f.buffer.insert(6, &[0x11; PS], false).unwrap();

        assert_eq!(f.buffer.lookup(6), Some(slot));
        assert_eq!(f.buffer.lookup(5), None);
        assert!(f.buffer.insert(6, &[0; PS], false).is_err());

        assert!(f.buffer.mark_dirty(slot));
        assert!(!f.buffer.mark_dirty(slot));
        assert_eq!(f.buffer.is_dirty(6), Some(true));

        f.buffer.evict_oldest().unwrap();
        assert_eq!(&f.store.snapshot()[6 * PS..7 * PS], &[0x11; PS][..]);
    }

    #[test]
    fn test_page_buffer_prefetch_fills_ahead_of_access() {
        let f = fixture(4, 8);
        let waiter = f.sim.block(3);

        assert!(f.buffer.prefetch(3).unwrap());
        assert!(f.sim.is_released(&waiter));
        assert!(f.sim.is_protected(3));
        assert_eq!(f.sim.read(3).unwrap(), vec![3u8; PS]);

        assert!(!f.buffer.prefetch(3).unwrap());
        f.access(3, false);
        assert_eq!(f.store.reads(), 1);
        assert_eq!(f.buffer.is_dirty(3), Some(false));
    }

    #[test]
    fn test_page_buffer_prefetch_evicts_in_fifo_order() {
        let f = fixture(2, 8);
        for page in [0, 1, 2] {
            assert!(f.buffer.prefetch(page).unwrap());
        }

        assert_eq!(f.buffer.resident_pages(), vec![1, 2]);
        assert!(!f.sim.is_present(0));
        assert_eq!(f.store.writes(), 0);
    }

    #[test]
    fn test_page_buffer_evict_all_writes_back_dirty_pages() {
        let f = fixture(4, 8);
        f.access(1, true);
        f.access(2, false);
        f.access(3, true);
        assert!(f.sim.write(1, 0, b"one"));
        assert!(f.sim.write(3, 0, b"three"));

        assert_eq!(f.buffer.evict_all().unwrap(), 3);

        assert_eq!(f.buffer.occupied(), 0);
        assert_eq!(f.sim.present_pages(), 0);
        assert_eq!(f.store.write_offsets(), vec![PS as u64, 3 * PS as u64]);
        assert_eq!(&f.store.snapshot()[PS..PS + 3], b"one");
        assert_eq!(&f.store.snapshot()[3 * PS..3 * PS + 5], b"three");
        assert_eq!(f.buffer.evict_all().unwrap(), 0);

        f.access(3, false);
        assert_eq!(f.sim.read(3).unwrap()[..5], *b"three");
    }
}
