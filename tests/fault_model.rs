//! # Fault Resolution Model Tests
//!
//! Drives the page buffer the way the kernel would: an application model
//! touches pages of a simulated address space, every access that would fault
//! is resolved through `dispatch::resolve`, then retried. Checks that
//!
//! 1. residency never exceeds the buffer capacity,
//! 2. every byte written reaches the store after a final flush,
//! 3. pages that were only read are never written back,
//! 4. concurrent faulting threads observe consistent data,
//! 5. every faulting thread is woken once its fault is resolved.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use upager::buffer::PageBuffer;
use upager::dispatch::resolve;
use upager::protect::SimulatedPages;
use upager::stats::RegionStats;
use upager::uffd::FaultKind;
use upager::MemoryStore;

const PS: usize = 4096;

struct Model {
    sim: Arc<SimulatedPages>,
    store: Arc<MemoryStore>,
    buffer: PageBuffer,
}

impl Model {
    fn new(pages: usize, capacity: usize, initial: Vec<u8>) -> Self {
        assert_eq!(initial.len(), pages * PS);
        let sim = Arc::new(SimulatedPages::new(pages, PS));
        let store = Arc::new(MemoryStore::from_vec(initial));
        let buffer = PageBuffer::new(
            capacity,
            store.clone(),
            sim.clone(),
            Arc::new(RegionStats::default()),
        )
        .unwrap();
        Self { sim, store, buffer }
    }

    fn load(&self, page: usize, offset: usize) -> u8 {
        loop {
            if let Some(data) = self.sim.read(page) {
                return data[offset];
            }
            self.fault(page, FaultKind::Read);
        }
    }

    fn store_byte(&self, page: usize, offset: usize, value: u8) {
        while !self.sim.write(page, offset, &[value]) {
            let kind = if self.sim.is_present(page) {
                FaultKind::WriteProtect
            } else {
                FaultKind::Write
            };
            self.fault(page, kind);
        }
    }

    /// Suspends the accessing thread on `page` until a wake releases it.
    fn fault(&self, page: usize, kind: FaultKind) {
        let waiter = self.sim.block(page);
        resolve(&self.buffer, page, kind).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.sim.is_released(&waiter) {
            assert!(
                Instant::now() < deadline,
                "{:?} fault on page {} was never woken",
                kind,
                page
            );
            thread::yield_now();
        }
    }
}

/// Deterministic access stream.
fn lcg(seed: &mut u64) -> u64 {
    *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    *seed >> 33
}

#[test]
fn random_access_stream_matches_shadow_copy() {
    let pages = 24;
    let capacity = 5;
    let initial: Vec<u8> = (0..pages * PS).map(|i| (i / PS) as u8).collect();
    let model = Model::new(pages, capacity, initial.clone());
    let mut shadow = initial;

    let mut seed = 0x5eed;
    for _ in 0..2000 {
        let page = (lcg(&mut seed) % pages as u64) as usize;
        let offset = (lcg(&mut seed) % PS as u64) as usize;
        if lcg(&mut seed) % 3 == 0 {
            let value = lcg(&mut seed) as u8;
            model.store_byte(page, offset, value);
            shadow[page * PS + offset] = value;
        } else {
            assert_eq!(model.load(page, offset), shadow[page * PS + offset]);
        }
        assert!(model.buffer.occupied() <= capacity);
    }

    model.buffer.flush_all().unwrap();
    assert_eq!(model.store.snapshot(), shadow);
    assert!(model.sim.peak_present() <= capacity);
    assert!(model.sim.blocked_pages().is_empty());

    let stats = model.buffer.stats().snapshot();
    assert!(stats.evict_victims > 0);
    assert_eq!(stats.evict_victims, stats.dirty_evicts + stats.clean_evicts);
}

#[test]
fn read_only_sweep_never_writes_back() {
    let pages = 16;
    let model = Model::new(pages, 3, vec![9u8; pages * PS]);

    for round in 0..3 {
        for page in 0..pages {
            assert_eq!(model.load(page, round * 7), 9);
        }
    }
    model.buffer.flush_all().unwrap();

    assert_eq!(model.store.writes(), 0);
    let stats = model.buffer.stats().snapshot();
    assert_eq!(stats.dirty_evicts, 0);
    assert_eq!(stats.read_faults, 3 * pages as u64);
}

#[test]
fn dirty_page_written_once_per_eviction() {
    let model = Model::new(8, 2, vec![0u8; 8 * PS]);

    model.store_byte(0, 0, 1);
    model.store_byte(0, 1, 2);
    model.store_byte(0, 2, 3);
    // Pages 1 and 2 push page 0 out.
    model.load(1, 0);
    model.load(2, 0);

    assert_eq!(model.store.write_offsets(), vec![0]);
    assert_eq!(&model.store.snapshot()[..3], &[1, 2, 3]);
}

#[test]
fn concurrent_faulting_threads_see_their_writes() {
    let pages = 32;
    let model = Arc::new(Model::new(pages, 6, vec![0u8; pages * PS]));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let model = Arc::clone(&model);
            thread::spawn(move || {
                // Each thread owns the pages congruent to t mod 4.
                for round in 1..=5u8 {
                    for page in (t..pages).step_by(4) {
                        model.store_byte(page, t, round);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    model.buffer.flush_all().unwrap();
    let snapshot = model.store.snapshot();
    for page in 0..pages {
        assert_eq!(snapshot[page * PS + page % 4], 5, "page {}", page);
    }
    assert!(model.sim.peak_present() <= 6);
}
