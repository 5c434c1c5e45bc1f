//! In-memory page table implementing [`PageControl`].
//!
//! Models what the kernel tracks per page (presence, contents and the
//! write-protect bit) and logs every operation, so buffer and dispatcher
//! behaviour can be checked without a fault channel. Installing a page that
//! is already present is an error, like `UFFDIO_COPY`'s `EEXIST`.
//!
//! Blocked faults are modeled too. [`SimulatedPages::block`] registers a
//! thread suspended on a page, and only [`PageControl::wake`] releases it:
//! copy-in, protection changes and release never wake, matching the modes
//! the buffer issues them with.

use eyre::{bail, Result};
use parking_lot::Mutex;

use super::PageControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOp {
    CopyIn { page: usize, protect: bool },
    Protect { page: usize },
    Unprotect { page: usize },
    Wake { page: usize },
    CopyOut { page: usize },
    Release { page: usize },
}

impl PageOp {
    pub fn page(&self) -> usize {
        match *self {
            PageOp::CopyIn { page, .. }
            | PageOp::Protect { page }
            | PageOp::Unprotect { page }
            | PageOp::Wake { page }
            | PageOp::CopyOut { page }
            | PageOp::Release { page } => page,
        }
    }
}

#[derive(Default)]
struct SimPage {
    data: Option<Box<[u8]>>,
    protected: bool,
    waiters: usize,
    wakes: u64,
}

/// A thread suspended on a page until the next wake of that page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    page: usize,
    generation: u64,
}

impl Waiter {
    pub fn page(&self) -> usize {
        self.page
    }
}

struct SimState {
    pages: Vec<SimPage>,
    present: usize,
    peak_present: usize,
    log: Vec<PageOp>,
}

pub struct SimulatedPages {
    page_size: usize,
    state: Mutex<SimState>,
}

impl SimulatedPages {
    pub fn new(num_pages: usize, page_size: usize) -> Self {
        Self {
            page_size,
            state: Mutex::new(SimState {
                pages: (0..num_pages).map(|_| SimPage::default()).collect(),
                present: 0,
                peak_present: 0,
                log: Vec::new(),
            }),
        }
    }

    pub fn num_pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    pub fn is_present(&self, page: usize) -> bool {
        self.state.lock().pages[page].data.is_some()
    }

    pub fn is_protected(&self, page: usize) -> bool {
        self.state.lock().pages[page].protected
    }

    /// Contents of a present page.
    pub fn read(&self, page: usize) -> Option<Vec<u8>> {
        self.state.lock().pages[page].data.as_ref().map(|d| d.to_vec())
    }

    /// Application store into a page. Returns `false` when the access would
    /// fault: the page is missing or write-protected.
    pub fn write(&self, page: usize, offset: usize, bytes: &[u8]) -> bool {
        let mut state = self.state.lock();
        let slot = &mut state.pages[page];
        match slot.data.as_mut() {
            Some(data) if !slot.protected => {
                data[offset..offset + bytes.len()].copy_from_slice(bytes);
                true
            }
            _ => false,
        }
    }

    /// Suspends a thread on `page`, as the kernel does when it queues a
    /// fault message for it.
    pub fn block(&self, page: usize) -> Waiter {
        let mut state = self.state.lock();
        let slot = &mut state.pages[page];
        slot.waiters += 1;
        Waiter {
            page,
            generation: slot.wakes,
        }
    }

    pub fn is_released(&self, waiter: &Waiter) -> bool {
        self.state.lock().pages[waiter.page].wakes > waiter.generation
    }

    /// Pages with at least one thread still suspended on them.
    pub fn blocked_pages(&self) -> Vec<usize> {
        self.state
            .lock()
            .pages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.waiters > 0)
            .map(|(page, _)| page)
            .collect()
    }

    pub fn present_pages(&self) -> usize {
        self.state.lock().present
    }

    /// Highest number of simultaneously present pages seen so far.
    pub fn peak_present(&self) -> usize {
        self.state.lock().peak_present
    }

    pub fn ops(&self) -> Vec<PageOp> {
        self.state.lock().log.clone()
    }

    pub fn ops_for(&self, page: usize) -> Vec<PageOp> {
        self.state
            .lock()
            .log
            .iter()
            .copied()
            .filter(|op| op.page() == page)
            .collect()
    }

    fn check(&self, state: &SimState, page: usize) -> Result<()> {
        if page >= state.pages.len() {
            bail!("page {} outside simulated range of {}", page, state.pages.len());
        }
        Ok(())
    }
}

impl PageControl for SimulatedPages {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn copy_in(&self, page: usize, src: &[u8], protect: bool) -> Result<()> {
        let mut state = self.state.lock();
        self.check(&state, page)?;
        if state.pages[page].data.is_some() {
            bail!("copy into page {} that is already present", page);
        }
        let slot = &mut state.pages[page];
        slot.data = Some(src[..self.page_size].into());
        slot.protected = protect;
        state.present += 1;
        state.peak_present = state.peak_present.max(state.present);
        state.log.push(PageOp::CopyIn { page, protect });
        Ok(())
    }

    fn protect(&self, page: usize) -> Result<()> {
        let mut state = self.state.lock();
        self.check(&state, page)?;
        state.pages[page].protected = true;
        state.log.push(PageOp::Protect { page });
        Ok(())
    }

    fn disable_write_protect(&self, page: usize) -> Result<()> {
        let mut state = self.state.lock();
        self.check(&state, page)?;
        state.pages[page].protected = false;
        state.log.push(PageOp::Unprotect { page });
        Ok(())
    }

    fn wake(&self, page: usize) -> Result<()> {
        let mut state = self.state.lock();
        self.check(&state, page)?;
        let slot = &mut state.pages[page];
        slot.waiters = 0;
        slot.wakes += 1;
        state.log.push(PageOp::Wake { page });
        Ok(())
    }

    fn copy_out(&self, page: usize, dst: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        self.check(&state, page)?;
        match state.pages[page].data.as_ref() {
            Some(data) => dst[..self.page_size].copy_from_slice(data),
            None => bail!("copy out of missing page {}", page),
        }
        state.log.push(PageOp::CopyOut { page });
        Ok(())
    }

    fn release(&self, page: usize) -> Result<()> {
        let mut state = self.state.lock();
        self.check(&state, page)?;
        if state.pages[page].data.take().is_some() {
            state.present -= 1;
        }
        state.pages[page].protected = false;
        state.log.push(PageOp::Release { page });
        Ok(())
    }
}
