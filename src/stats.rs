//! Per-region activity counters.
//!
//! Counters are relaxed atomics bumped on the fault path; a
//! [`StatsSnapshot`] is a plain copy for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RegionStats {
    read_faults: AtomicU64,
    write_faults: AtomicU64,
    wp_messages: AtomicU64,
    dirty_evicts: AtomicU64,
    clean_evicts: AtomicU64,
    evict_victims: AtomicU64,
    stuck_wp: AtomicU64,
    dropped_dups: AtomicU64,
    store_reads: AtomicU64,
    store_writes: AtomicU64,
}

/// Point-in-time copy of [`RegionStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Missing-page read faults.
    pub read_faults: u64,
    /// Missing-page write faults.
    pub write_faults: u64,
    /// Write-protect faults on resident pages.
    pub wp_messages: u64,
    pub dirty_evicts: u64,
    pub clean_evicts: u64,
    /// Victims chosen to make room for a new page.
    pub evict_victims: u64,
    /// Write-protect faults on pages already marked dirty.
    pub stuck_wp: u64,
    /// Duplicate notifications dropped within one batch.
    pub dropped_dups: u64,
    pub store_reads: u64,
    pub store_writes: u64,
}

macro_rules! counters {
    ($($name:ident => $incr:ident),* $(,)?) => {
        impl RegionStats {
            $(
                #[inline]
                pub fn $incr(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }

            pub fn reset(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)*
            }
        }
    };
}

counters! {
    read_faults => inc_read_faults,
    write_faults => inc_write_faults,
    wp_messages => inc_wp_messages,
    dirty_evicts => inc_dirty_evicts,
    clean_evicts => inc_clean_evicts,
    evict_victims => inc_evict_victims,
    stuck_wp => inc_stuck_wp,
    dropped_dups => inc_dropped_dups,
    store_reads => inc_store_reads,
    store_writes => inc_store_writes,
}

impl RegionStats {
    pub fn add_dropped_dups(&self, n: u64) {
        self.dropped_dups.fetch_add(n, Ordering::Relaxed);
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "read_faults={} write_faults={} wp_messages={} dirty_evicts={} clean_evicts={} \
             evict_victims={} stuck_wp={} dropped_dups={} store_reads={} store_writes={}",
            self.read_faults,
            self.write_faults,
            self.wp_messages,
            self.dirty_evicts,
            self.clean_evicts,
            self.evict_victims,
            self.stuck_wp,
            self.dropped_dups,
            self.store_reads,
            self.store_writes
        )
    }
}
