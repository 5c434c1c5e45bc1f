//! # Write-Protect Coordinator
//!
//! Page-granular control over a registered region: installing page contents,
//! toggling write protection, waking blocked threads and returning physical
//! pages to the kernel.
//!
//! ## Wake Semantics
//!
//! The two protection primitives are asymmetric:
//!
//! ```text
//! enable_write_protect(page)   re-arms WP, then ALWAYS wakes waiters on `page`
//! disable_write_protect(page)  drops WP, NEVER wakes
//! ```
//!
//! `UFFDIO_WRITEPROTECT` never wakes when it sets protection; only removing
//! protection without `DONTWAKE` does. [`PageControl::protect`] is that bare
//! ioctl, and [`PageControl::enable_write_protect`] follows it with an
//! explicit wake, so a read fill that is copied in protected and unwoken is
//! released when protection is re-armed.
//!
//! A dirty page is re-protected before it is copied out for write-back, and
//! a write fault on a missing page disables protection, copies the data in
//! without waking, and only then wakes the faulting thread explicitly.
//!
//! ## Page Addressing
//!
//! All methods take a page index relative to the region base. The page size
//! is fixed per region and every operation covers exactly one page.
//!
//! [`PageControl`] is the seam between the page buffer and the kernel;
//! [`WriteProtector`] implements it on a userfaultfd channel and
//! [`SimulatedPages`] implements it on an in-memory page table.

mod sim;

pub use sim::{PageOp, SimulatedPages, Waiter};

use std::sync::Arc;

use eyre::{bail, Result};

use crate::uffd::abi::{
    UFFDIO_COPY_MODE_DONTWAKE, UFFDIO_COPY_MODE_WP, UFFDIO_WRITEPROTECT_MODE_DONTWAKE,
    UFFDIO_WRITEPROTECT_MODE_WP,
};
use crate::uffd::{Uffd, UffdError};

/// Page operations the page buffer needs from the address space it manages.
pub trait PageControl: Send + Sync {
    fn page_size(&self) -> usize;

    /// Atomically installs `src` as the contents of a missing page without
    /// waking waiters. With `protect` the page is installed write-protected.
    fn copy_in(&self, page: usize, src: &[u8], protect: bool) -> Result<()>;

    /// Sets write protection. Like `UFFDIO_WRITEPROTECT`, setting protection
    /// never wakes threads blocked on the page.
    fn protect(&self, page: usize) -> Result<()>;

    /// Re-arms write protection and wakes every thread blocked on the page.
    fn enable_write_protect(&self, page: usize) -> Result<()> {
        self.protect(page)?;
        self.wake(page)
    }

    /// Drops write protection without waking.
    fn disable_write_protect(&self, page: usize) -> Result<()>;

    fn wake(&self, page: usize) -> Result<()>;

    /// Copies the current contents of a resident page into `dst`.
    fn copy_out(&self, page: usize, dst: &mut [u8]) -> Result<()>;

    /// Returns the physical page to the kernel; the next access faults as
    /// missing.
    fn release(&self, page: usize) -> Result<()>;
}

/// [`PageControl`] over a userfaultfd-registered address range.
pub struct WriteProtector {
    uffd: Arc<Uffd>,
    base: usize,
    len: usize,
    page_size: usize,
}

impl WriteProtector {
    pub fn new(uffd: Arc<Uffd>, base: usize, len: usize, page_size: usize) -> Self {
        Self {
            uffd,
            base,
            len,
            page_size,
        }
    }

    pub fn uffd(&self) -> &Arc<Uffd> {
        &self.uffd
    }

    fn addr(&self, page: usize) -> Result<usize> {
        let offset = page * self.page_size;
        if offset + self.page_size > self.len {
            bail!(
                "page {} outside region {:#x}+{:#x}",
                page,
                self.base,
                self.len
            );
        }
        Ok(self.base + offset)
    }
}

impl PageControl for WriteProtector {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn copy_in(&self, page: usize, src: &[u8], protect: bool) -> Result<()> {
        let addr = self.addr(page)?;
        let mut mode = UFFDIO_COPY_MODE_DONTWAKE;
        if protect {
            mode |= UFFDIO_COPY_MODE_WP;
        }
        self.uffd.copy(addr, src.as_ptr(), self.page_size, mode)
    }

    fn protect(&self, page: usize) -> Result<()> {
        let addr = self.addr(page)?;
        self.uffd
            .write_protect(addr, self.page_size, UFFDIO_WRITEPROTECT_MODE_WP)
    }

    fn disable_write_protect(&self, page: usize) -> Result<()> {
        let addr = self.addr(page)?;
        self.uffd
            .write_protect(addr, self.page_size, UFFDIO_WRITEPROTECT_MODE_DONTWAKE)
    }

    fn wake(&self, page: usize) -> Result<()> {
        let addr = self.addr(page)?;
        self.uffd.wake(addr, self.page_size)
    }

    fn copy_out(&self, page: usize, dst: &mut [u8]) -> Result<()> {
        let addr = self.addr(page)?;
        // SAFETY: the page lies inside the mapping and is resident, so the
        // read cannot fault; the caller holds it write-protected or otherwise
        // exclusive for the duration of the copy.
        unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, dst.as_mut_ptr(), self.page_size);
        }
        Ok(())
    }

    fn release(&self, page: usize) -> Result<()> {
        let addr = self.addr(page)?;
        // SAFETY: the range is a page-aligned part of our private mapping.
        let rc = unsafe {
            libc::madvise(
                addr as *mut libc::c_void,
                self.page_size,
                libc::MADV_DONTNEED,
            )
        };
        if rc != 0 {
            bail!(UffdError::Ioctl {
                op: "madvise(MADV_DONTNEED)",
                start: addr as u64,
                len: self.page_size as u64,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}
