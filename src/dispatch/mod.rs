//! # Fault Dispatcher
//!
//! Dispatcher threads drain the region's fault channel and resolve each
//! fault against the page buffer.
//!
//! ## Loop
//!
//! ```text
//! while !stop {
//!     poll(channel, poll_timeout)          bounded, so `stop` is seen
//!     read up to max_fault_events messages
//!     normalize to region page index, sort by (page, write-first), dedup
//!     resolve each page
//! }
//! ```
//!
//! The kernel hands each message to exactly one reader, so several
//! dispatchers can share a channel. A batch can still carry several
//! messages for one page (threads faulting on the same page, or a page size
//! larger than the system page); only the first, which is a write if any
//! message is, gets resolved. The rest are counted as dropped duplicates.
//!
//! ## Resolution
//!
//! | Buffer state     | Action                                                 |
//! |------------------|--------------------------------------------------------|
//! | resident         | write: mark dirty, unprotect (no wake), wake; read: wake |
//! | fill in flight   | nothing; the filler's wake covers this fault           |
//! | miss             | evict a victim if full, read store, copy in, wake      |
//! | evicting/flushing| wait for it to finish, then re-resolve                 |
//!
//! ## Failure
//!
//! Store and channel errors leave the page table and the buffer out of sync,
//! so a dispatcher that hits one logs it and aborts the process.

mod evictor;

pub use evictor::{spawn_evictors, Evictor};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use eyre::{Result, WrapErr};
use tracing::{debug, error, trace, warn};

use crate::buffer::{Claim, PageBuffer};
use crate::config::UFFD_MSG_SIZE;
use crate::uffd::{FaultEvent, FaultKind, Uffd};

/// Source of fault notifications for a dispatcher.
pub trait FaultSource: Send + Sync {
    /// Waits up to `timeout` for notifications; returns whether any are
    /// ready.
    fn wait(&self, timeout: Duration) -> Result<bool>;

    /// Appends up to `raw.len() / UFFD_MSG_SIZE` notifications to `out`.
    fn read(&self, raw: &mut [u8], out: &mut Vec<FaultEvent>) -> Result<usize>;
}

impl FaultSource for Uffd {
    fn wait(&self, timeout: Duration) -> Result<bool> {
        self.poll(timeout)
    }

    fn read(&self, raw: &mut [u8], out: &mut Vec<FaultEvent>) -> Result<usize> {
        self.read_events(raw, out)
    }
}

/// How a single page fault was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resident,
    InFlight,
    Filled,
}

/// Resolves one fault on region page `page`.
pub fn resolve(buffer: &PageBuffer, page: usize, kind: FaultKind) -> Result<Resolution> {
    let stats = buffer.stats();
    match kind {
        FaultKind::Read => stats.inc_read_faults(),
        FaultKind::Write => stats.inc_write_faults(),
        FaultKind::WriteProtect => stats.inc_wp_messages(),
    }

    match buffer.claim(page, kind.is_write())? {
        Claim::Resident { was_dirty, .. } => {
            if kind == FaultKind::WriteProtect && was_dirty {
                stats.inc_stuck_wp();
            }
            Ok(Resolution::Resident)
        }
        Claim::InFlight => Ok(Resolution::InFlight),
        Claim::Fill(ticket) => {
            buffer
                .fill(ticket, kind.is_write())
                .wrap_err_with(|| format!("failed to fill page {}", page))?;
            Ok(Resolution::Filled)
        }
    }
}

/// Turns raw notifications into the pages to resolve: region-relative page
/// index, ordered by page with write faults first, one entry per page.
/// Returns the number of dropped duplicates.
pub fn plan_batch(
    events: &[FaultEvent],
    base: usize,
    len: usize,
    page_size: usize,
    out: &mut Vec<(usize, FaultKind)>,
) -> usize {
    out.clear();
    for event in events {
        match event.address.checked_sub(base) {
            Some(rel) if rel < len => out.push((rel / page_size, event.kind)),
            _ => warn!(address = event.address, "fault outside managed region"),
        }
    }

    out.sort_unstable();
    let before = out.len();
    out.dedup_by_key(|&mut (page, _)| page);
    before - out.len()
}

/// Logs an unrecoverable error and terminates the process.
pub fn fatal(context: &str, report: eyre::Report) -> ! {
    error!(error = ?report, "{}; aborting", context);
    std::process::abort()
}

pub struct Dispatcher {
    id: usize,
    source: Arc<dyn FaultSource>,
    buffer: Arc<PageBuffer>,
    base: usize,
    len: usize,
    max_events: usize,
    poll_timeout: Duration,
    stop: Arc<AtomicBool>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        source: Arc<dyn FaultSource>,
        buffer: Arc<PageBuffer>,
        base: usize,
        len: usize,
        max_events: usize,
        poll_timeout: Duration,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            source,
            buffer,
            base,
            len,
            max_events: max_events.max(1),
            poll_timeout,
            stop,
        }
    }

    /// Runs until the stop flag is raised. Aborts on any error.
    pub fn run(self) {
        debug!(dispatcher = self.id, "dispatcher started");
        let mut raw = vec![0u8; self.max_events * UFFD_MSG_SIZE];
        let mut events = Vec::with_capacity(self.max_events);
        let mut batch = Vec::with_capacity(self.max_events);

        while !self.stop.load(Ordering::Acquire) {
            if let Err(report) = self.step(&mut raw, &mut events, &mut batch) {
                fatal("fault dispatcher failed", report);
            }
        }
        debug!(dispatcher = self.id, "dispatcher stopped");
    }

    /// One poll/read/resolve round. Returns the number of pages resolved.
    pub fn step(
        &self,
        raw: &mut [u8],
        events: &mut Vec<FaultEvent>,
        batch: &mut Vec<(usize, FaultKind)>,
    ) -> Result<usize> {
        if !self.source.wait(self.poll_timeout)? {
            return Ok(0);
        }

        events.clear();
        if self.source.read(raw, events)? == 0 {
            return Ok(0);
        }

        let page_size = self.buffer.page_size();
        let dropped = plan_batch(events, self.base, self.len, page_size, batch);
        if dropped > 0 {
            self.buffer.stats().add_dropped_dups(dropped as u64);
        }

        for &(page, kind) in batch.iter() {
            let resolution = resolve(&self.buffer, page, kind)?;
            trace!(dispatcher = self.id, page, ?kind, ?resolution, "resolved fault");
        }
        Ok(batch.len())
    }
}

/// Starts `count` dispatcher threads on one fault source.
#[allow(clippy::too_many_arguments)]
pub fn spawn_dispatchers(
    count: usize,
    source: Arc<dyn FaultSource>,
    buffer: &Arc<PageBuffer>,
    base: usize,
    len: usize,
    max_events: usize,
    poll_timeout: Duration,
    stop: &Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<()>>> {
    (0..count)
        .map(|id| {
            let dispatcher = Dispatcher::new(
                id,
                Arc::clone(&source),
                Arc::clone(buffer),
                base,
                len,
                max_events,
                poll_timeout,
                Arc::clone(stop),
            );
            thread::Builder::new()
                .name(format!("upager-fill-{}", id))
                .spawn(move || dispatcher.run())
                .wrap_err_with(|| format!("failed to spawn dispatcher {}", id))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protect::{PageOp, SimulatedPages};
    use crate::stats::RegionStats;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    const PS: usize = 4096;
    const BASE: usize = 0x7000_0000;

    /// Fault channel fed by the test.
    #[derive(Default)]
    struct QueueSource {
        queue: Mutex<VecDeque<FaultEvent>>,
    }

    impl QueueSource {
        fn push(&self, page: usize, kind: FaultKind) {
            self.queue.lock().push_back(FaultEvent {
                address: BASE + page * PS + 8,
                kind,
            });
        }
    }

    impl FaultSource for QueueSource {
        fn wait(&self, timeout: Duration) -> Result<bool> {
            if self.queue.lock().is_empty() {
                thread::sleep(timeout.min(Duration::from_millis(5)));
            }
            Ok(!self.queue.lock().is_empty())
        }

        fn read(&self, raw: &mut [u8], out: &mut Vec<FaultEvent>) -> Result<usize> {
            let max = raw.len() / UFFD_MSG_SIZE;
            let mut queue = self.queue.lock();
            let n = queue.len().min(max);
            out.extend(queue.drain(..n));
            Ok(n)
        }
    }

    fn setup(capacity: usize, pages: usize) -> (Arc<MemoryStore>, Arc<SimulatedPages>, Arc<PageBuffer>) {
        let data: Vec<u8> = (0..pages * PS).map(|i| (i / PS) as u8).collect();
        let store = Arc::new(MemoryStore::from_vec(data));
        let sim = Arc::new(SimulatedPages::new(pages, PS));
        let buffer = Arc::new(
            PageBuffer::new(capacity, store.clone(), sim.clone(), Arc::new(RegionStats::default()))
                .unwrap(),
        );
        (store, sim, buffer)
    }

    fn dispatcher(source: Arc<QueueSource>, buffer: &Arc<PageBuffer>, max_events: usize) -> Dispatcher {
        Dispatcher::new(
            0,
            source,
            Arc::clone(buffer),
            BASE,
            64 * PS,
            max_events,
            Duration::from_millis(10),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn plan_batch_orders_writes_first_and_dedups() {
        let events = [
            FaultEvent { address: BASE + 2 * PS, kind: FaultKind::Read },
            FaultEvent { address: BASE + PS + 100, kind: FaultKind::Read },
            FaultEvent { address: BASE + 2 * PS + 64, kind: FaultKind::Write },
            FaultEvent { address: BASE + PS, kind: FaultKind::Read },
        ];
        let mut out = Vec::new();

        let dropped = plan_batch(&events, BASE, 16 * PS, PS, &mut out);

        assert_eq!(dropped, 2);
        assert_eq!(out, vec![(1, FaultKind::Read), (2, FaultKind::Write)]);
    }

    #[test]
    fn plan_batch_skips_foreign_addresses() {
        let events = [
            FaultEvent { address: BASE - 1, kind: FaultKind::Read },
            FaultEvent { address: BASE + 16 * PS, kind: FaultKind::Read },
            FaultEvent { address: BASE, kind: FaultKind::Read },
        ];
        let mut out = Vec::new();

        assert_eq!(plan_batch(&events, BASE, 16 * PS, PS, &mut out), 0);
        assert_eq!(out, vec![(0, FaultKind::Read)]);
    }

    #[test]
    fn resolve_counts_fault_kinds() {
        let (_store, _sim, buffer) = setup(4, 8);

        assert_eq!(resolve(&buffer, 1, FaultKind::Read).unwrap(), Resolution::Filled);
        assert_eq!(resolve(&buffer, 1, FaultKind::WriteProtect).unwrap(), Resolution::Resident);
        assert_eq!(resolve(&buffer, 1, FaultKind::WriteProtect).unwrap(), Resolution::Resident);
        assert_eq!(resolve(&buffer, 2, FaultKind::Write).unwrap(), Resolution::Filled);

        let stats = buffer.stats().snapshot();
        assert_eq!(stats.read_faults, 1);
        assert_eq!(stats.write_faults, 1);
        assert_eq!(stats.wp_messages, 2);
        assert_eq!(stats.stuck_wp, 1);
        assert_eq!(stats.store_reads, 2);
    }

    #[test]
    fn step_resolves_one_fill_per_page() {
        let (store, sim, buffer) = setup(4, 64);
        let source = Arc::new(QueueSource::default());
        let mut waiters = Vec::new();
        for _ in 0..3 {
            waiters.push(sim.block(5));
            source.push(5, FaultKind::Read);
        }
        waiters.push(sim.block(5));
        source.push(5, FaultKind::Write);
        waiters.push(sim.block(9));
        source.push(9, FaultKind::Read);

        let d = dispatcher(source.clone(), &buffer, 16);
        let mut raw = vec![0u8; 16 * UFFD_MSG_SIZE];
        let (mut events, mut batch) = (Vec::new(), Vec::new());

        assert_eq!(d.step(&mut raw, &mut events, &mut batch).unwrap(), 2);
        assert_eq!(store.reads(), 2);
        assert_eq!(buffer.is_dirty(5), Some(true));
        assert_eq!(buffer.stats().snapshot().dropped_dups, 3);
        assert!(sim.is_present(9));
        assert!(waiters.iter().all(|w| sim.is_released(w)));
        assert!(sim.blocked_pages().is_empty());
    }

    #[test]
    fn resolve_wakes_every_kind_of_fault() {
        let (_store, sim, buffer) = setup(2, 8);
        let cases = [
            (1, FaultKind::Read, Resolution::Filled),
            (1, FaultKind::Read, Resolution::Resident),
            (1, FaultKind::WriteProtect, Resolution::Resident),
            (2, FaultKind::Write, Resolution::Filled),
            (3, FaultKind::Read, Resolution::Filled),
            (1, FaultKind::Read, Resolution::Filled),
        ];

        for (page, kind, expected) in cases {
            let waiter = sim.block(page);
            assert_eq!(resolve(&buffer, page, kind).unwrap(), expected);
            assert!(sim.is_released(&waiter), "{:?} fault on page {} left blocked", kind, page);
        }
        assert!(sim.blocked_pages().is_empty());
    }

    #[test]
    fn step_respects_batch_size() {
        let (_store, _sim, buffer) = setup(8, 64);
        let source = Arc::new(QueueSource::default());
        for page in 0..5 {
            source.push(page, FaultKind::Read);
        }

        let d = dispatcher(source.clone(), &buffer, 2);
        let mut raw = vec![0u8; 2 * UFFD_MSG_SIZE];
        let (mut events, mut batch) = (Vec::new(), Vec::new());

        assert_eq!(d.step(&mut raw, &mut events, &mut batch).unwrap(), 2);
        assert_eq!(source.queue.lock().len(), 3);
    }

    #[test]
    fn dispatcher_threads_stop_on_flag() {
        let (_store, sim, buffer) = setup(4, 64);
        let source = Arc::new(QueueSource::default());
        let stop = Arc::new(AtomicBool::new(false));

        let handles = spawn_dispatchers(
            2,
            source.clone(),
            &buffer,
            BASE,
            64 * PS,
            8,
            Duration::from_millis(10),
            &stop,
        )
        .unwrap();

        for page in 0..6 {
            source.push(page, FaultKind::Write);
        }
        while !source.queue.lock().is_empty() {
            thread::sleep(Duration::from_millis(1));
        }

        stop.store(true, Ordering::Release);
        for h in handles {
            h.join().unwrap();
        }

        assert!(sim.peak_present() <= 4);
        let wakes = sim
            .ops()
            .iter()
            .filter(|op| matches!(op, PageOp::Wake { .. }))
            .count();
        assert!(wakes >= 4);
    }
}
