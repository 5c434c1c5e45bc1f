//! # Kernel Fault-Notification Channel
//!
//! `Uffd` owns one userfaultfd descriptor. A region registers its address
//! range in `MISSING | WP` mode; afterwards every first touch of a page and
//! every write to a write-protected page suspends the faulting thread and
//! queues a message on the descriptor.
//!
//! ## Operations
//!
//! | Method          | ioctl                  | Wakes faulting threads        |
//! |-----------------|------------------------|-------------------------------|
//! | `copy`          | `UFFDIO_COPY`          | unless `DONTWAKE`             |
//! | `write_protect` | `UFFDIO_WRITEPROTECT`  | enabling never wakes; disabling wakes unless `DONTWAKE` |
//! | `wake`          | `UFFDIO_WAKE`          | yes                           |
//!
//! The descriptor is non-blocking. Dispatchers call [`Uffd::poll`] with a
//! bounded timeout and then [`Uffd::read_events`], which returns as many
//! messages as the kernel has queued, up to the caller's batch size.
//!
//! Every ioctl failure is returned as a [`UffdError`]; callers on the fault
//! path treat it as fatal.

pub mod abi;

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use eyre::{bail, Result};
use tracing::{trace, warn};
use zerocopy::FromBytes;

use crate::config::UFFD_MSG_SIZE;
use abi::*;

#[derive(Debug)]
pub enum UffdError {
    /// The kernel lacks userfaultfd or write-protect support.
    Unsupported { reason: String },
    Ioctl {
        op: &'static str,
        start: u64,
        len: u64,
        source: io::Error,
    },
    MissingIoctls { offered: u64, required: u64 },
    Channel { source: io::Error },
}

impl std::fmt::Display for UffdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UffdError::Unsupported { reason } => write!(f, "userfaultfd unavailable: {}", reason),
            UffdError::Ioctl {
                op,
                start,
                len,
                source,
            } => write!(f, "{} on {:#x}+{:#x} failed: {}", op, start, len, source),
            UffdError::MissingIoctls { offered, required } => write!(
                f,
                "registered range offers ioctls {:#x}, need {:#x}",
                offered, required
            ),
            UffdError::Channel { source } => write!(f, "fault channel failure: {}", source),
        }
    }
}

impl std::error::Error for UffdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UffdError::Ioctl { source, .. } | UffdError::Channel { source } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FaultKind {
    /// Write to a resident, write-protected page.
    WriteProtect,
    /// Write to a page that is not resident.
    Write,
    /// Read of a page that is not resident.
    Read,
}

impl FaultKind {
    pub fn from_flags(flags: u64) -> Self {
        if flags & UFFD_PAGEFAULT_FLAG_WP != 0 {
            FaultKind::WriteProtect
        } else if flags & UFFD_PAGEFAULT_FLAG_WRITE != 0 {
            FaultKind::Write
        } else {
            FaultKind::Read
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, FaultKind::Read)
    }
}

/// One decoded page-fault notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultEvent {
    pub address: usize,
    pub kind: FaultKind,
}

impl FaultEvent {
    /// Decodes one raw message. Returns `Err(event_code)` for anything other
    /// than a page fault.
    pub fn decode(raw: &[u8]) -> std::result::Result<Self, u8> {
        let msg = UffdMsg::read_from_bytes(raw).map_err(|_| 0u8)?;
        if msg.event != UFFD_EVENT_PAGEFAULT {
            return Err(msg.event);
        }
        Ok(Self {
            address: msg.address as usize,
            kind: FaultKind::from_flags(msg.flags),
        })
    }
}

/// An open userfaultfd descriptor with write-protect support negotiated.
pub struct Uffd {
    fd: OwnedFd,
    features: u64,
}

impl Uffd {
    /// Opens a descriptor and performs the API handshake, requesting
    /// write-protect fault reporting.
    pub fn open() -> Result<Self> {
        // SAFETY: plain syscall; the result is checked before use.
        let raw = unsafe {
            libc::syscall(libc::SYS_userfaultfd, libc::O_CLOEXEC | libc::O_NONBLOCK)
        };
        if raw < 0 {
            bail!(UffdError::Unsupported {
                reason: format!("userfaultfd syscall: {}", io::Error::last_os_error()),
            });
        }
        // SAFETY: the kernel just returned this descriptor to us.
        let fd = unsafe { OwnedFd::from_raw_fd(raw as RawFd) };

        let mut api = UffdioApi {
            api: UFFD_API,
            features: UFFD_FEATURE_PAGEFAULT_FLAG_WP,
            ioctls: 0,
        };
        // SAFETY: `api` is a live, correctly sized uffdio_api.
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), UFFDIO_API as _, &mut api as *mut UffdioApi) };
        if rc == -1 {
            bail!(UffdError::Unsupported {
                reason: format!(
                    "API handshake with write-protect feature: {}",
                    io::Error::last_os_error()
                ),
            });
        }
        if api.features & UFFD_FEATURE_PAGEFAULT_FLAG_WP == 0 {
            bail!(UffdError::Unsupported {
                reason: "kernel does not report write-protect faults".to_string(),
            });
        }

        Ok(Self {
            fd,
            features: api.features,
        })
    }

    /// True when a descriptor with write-protect support can be opened.
    pub fn is_supported() -> bool {
        Self::open().is_ok()
    }

    pub fn features(&self) -> u64 {
        self.features
    }

    fn ioctl<T>(&self, op: &'static str, request: u64, arg: &mut T, start: u64, len: u64) -> Result<()> {
        // SAFETY: every caller passes the struct matching `request`.
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), request as _, arg as *mut T) };
        if rc == -1 {
            bail!(UffdError::Ioctl {
                op,
                start,
                len,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Registers `[start, start + len)` for missing-page and, if requested,
    /// write-protect faults.
    pub fn register(&self, start: usize, len: usize, write_protect: bool) -> Result<()> {
        let mut mode = UFFDIO_REGISTER_MODE_MISSING;
        let mut required = REQUIRED_RANGE_IOCTLS;
        if write_protect {
            mode |= UFFDIO_REGISTER_MODE_WP;
            required |= WP_RANGE_IOCTL;
        }

        let mut reg = UffdioRegister {
            range: UffdioRange {
                start: start as u64,
                len: len as u64,
            },
            mode,
            ioctls: 0,
        };
        self.ioctl("UFFDIO_REGISTER", UFFDIO_REGISTER, &mut reg, start as u64, len as u64)?;

        if reg.ioctls & required != required {
            let _ = self.unregister(start, len);
            bail!(UffdError::MissingIoctls {
                offered: reg.ioctls,
                required,
            });
        }
        Ok(())
    }

    pub fn unregister(&self, start: usize, len: usize) -> Result<()> {
        let mut range = UffdioRange {
            start: start as u64,
            len: len as u64,
        };
        self.ioctl("UFFDIO_UNREGISTER", UFFDIO_UNREGISTER, &mut range, start as u64, len as u64)
    }

    /// Atomically installs `len` bytes from `src` at `dst`. `mode` is a
    /// combination of `UFFDIO_COPY_MODE_*`.
    pub fn copy(&self, dst: usize, src: *const u8, len: usize, mode: u64) -> Result<()> {
        let mut copy = UffdioCopy {
            dst: dst as u64,
            src: src as u64,
            len: len as u64,
            mode,
            copy: 0,
        };
        self.ioctl("UFFDIO_COPY", UFFDIO_COPY, &mut copy, dst as u64, len as u64)?;
        if copy.copy != len as i64 {
            bail!(UffdError::Ioctl {
                op: "UFFDIO_COPY",
                start: dst as u64,
                len: len as u64,
                source: io::Error::other(format!("copied {} of {} bytes", copy.copy, len)),
            });
        }
        Ok(())
    }

    /// `mode` is a combination of `UFFDIO_WRITEPROTECT_MODE_*`.
    pub fn write_protect(&self, start: usize, len: usize, mode: u64) -> Result<()> {
        let mut wp = UffdioWriteprotect {
            range: UffdioRange {
                start: start as u64,
                len: len as u64,
            },
            mode,
        };
        self.ioctl("UFFDIO_WRITEPROTECT", UFFDIO_WRITEPROTECT, &mut wp, start as u64, len as u64)
    }

    pub fn wake(&self, start: usize, len: usize) -> Result<()> {
        let mut range = UffdioRange {
            start: start as u64,
            len: len as u64,
        };
        self.ioctl("UFFDIO_WAKE", UFFDIO_WAKE, &mut range, start as u64, len as u64)
    }

    /// Waits up to `timeout` for messages. Returns whether the channel is
    /// readable; an interrupted wait counts as not readable.
    pub fn poll(&self, timeout: Duration) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

        // SAFETY: one valid pollfd.
        let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            bail!(UffdError::Channel { source: err });
        }
        if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            bail!(UffdError::Channel {
                source: io::Error::other(format!("poll revents {:#x}", pfd.revents)),
            });
        }
        Ok(rc > 0 && pfd.revents & libc::POLLIN != 0)
    }

    /// Reads up to `raw.len() / UFFD_MSG_SIZE` messages and appends the page
    /// faults to `out`. Returns the number of messages read, 0 if another
    /// dispatcher drained the channel first.
    pub fn read_events(&self, raw: &mut [u8], out: &mut Vec<FaultEvent>) -> Result<usize> {
        let want = raw.len() / UFFD_MSG_SIZE * UFFD_MSG_SIZE;
        // SAFETY: `raw` is valid for `want` bytes.
        let n = unsafe { libc::read(self.fd.as_raw_fd(), raw.as_mut_ptr().cast(), want) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) {
                return Ok(0);
            }
            bail!(UffdError::Channel { source: err });
        }

        let n = n as usize;
        if n % UFFD_MSG_SIZE != 0 {
            bail!(UffdError::Channel {
                source: io::Error::other(format!("partial message read: {} bytes", n)),
            });
        }

        for chunk in raw[..n].chunks_exact(UFFD_MSG_SIZE) {
            match FaultEvent::decode(chunk) {
                Ok(event) => {
                    trace!(address = event.address, kind = ?event.kind, "fault");
                    out.push(event);
                }
                Err(code) => warn!(event = code, "ignoring unexpected fault channel event"),
            }
        }
        Ok(n / UFFD_MSG_SIZE)
    }
}

impl AsRawFd for Uffd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
