//! Background eviction.
//!
//! Evictor threads keep occupancy below the high watermark so dispatchers
//! rarely have to evict inline. Once occupancy reaches `high` pages they
//! evict in FIFO order down to `low` pages, then idle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use eyre::{Result, WrapErr};
use tracing::debug;

use super::fatal;
use crate::buffer::PageBuffer;

pub struct Evictor {
    id: usize,
    buffer: Arc<PageBuffer>,
    high: usize,
    low: usize,
    idle: Duration,
    stop: Arc<AtomicBool>,
}

impl Evictor {
    pub fn new(
        id: usize,
        buffer: Arc<PageBuffer>,
        high: usize,
        low: usize,
        idle: Duration,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            buffer,
            high,
            low,
            idle,
            stop,
        }
    }

    /// Evicts down to the low watermark if the high watermark is reached.
    /// Returns the number of pages evicted.
    pub fn sweep(&self) -> Result<usize> {
        if self.buffer.occupied() < self.high {
            return Ok(0);
        }

        let mut evicted = 0;
        while self.buffer.occupied() > self.low && !self.stop.load(Ordering::Acquire) {
            match self.buffer.evict_oldest()? {
                Some(_) => evicted += 1,
                None => break,
            }
        }
        if evicted > 0 {
            debug!(evictor = self.id, pages = evicted, "background eviction");
        }
        Ok(evicted)
    }

    pub fn run(self) {
        while !self.stop.load(Ordering::Acquire) {
            match self.sweep() {
                Ok(0) => thread::sleep(self.idle),
                Ok(_) => {}
                Err(report) => fatal("background evictor failed", report),
            }
        }
    }
}

pub fn spawn_evictors(
    count: usize,
    buffer: &Arc<PageBuffer>,
    high: usize,
    low: usize,
    idle: Duration,
    stop: &Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<()>>> {
    (0..count)
        .map(|id| {
            let evictor = Evictor::new(id, Arc::clone(buffer), high, low, idle, Arc::clone(stop));
            thread::Builder::new()
                .name(format!("upager-evict-{}", id))
                .spawn(move || evictor.run())
                .wrap_err_with(|| format!("failed to spawn evictor {}", id))
        })
        .collect()
}
