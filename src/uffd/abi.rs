//! Kernel ABI of the userfaultfd channel (`linux/userfaultfd.h`).
//!
//! Request numbers are computed with the generic `_IOC` encoding:
//!
//! ```text
//! dir << 30 | size << 16 | type << 8 | nr
//! ```
//!
//! with `type = 0xAA` for every userfaultfd ioctl.

use std::mem::size_of;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::UFFD_MSG_SIZE;

pub const UFFD_API: u64 = 0xAA;
const UFFDIO: u64 = 0xAA;

const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, nr: u64, size: usize) -> u64 {
    (dir << 30) | ((size as u64) << 16) | (UFFDIO << 8) | nr
}

const _UFFDIO_REGISTER: u64 = 0x00;
const _UFFDIO_UNREGISTER: u64 = 0x01;
const _UFFDIO_WAKE: u64 = 0x02;
const _UFFDIO_COPY: u64 = 0x03;
const _UFFDIO_WRITEPROTECT: u64 = 0x06;
const _UFFDIO_API: u64 = 0x3F;

pub const UFFDIO_API: u64 = ioc(IOC_READ | IOC_WRITE, _UFFDIO_API, size_of::<UffdioApi>());
pub const UFFDIO_REGISTER: u64 = ioc(
    IOC_READ | IOC_WRITE,
    _UFFDIO_REGISTER,
    size_of::<UffdioRegister>(),
);
pub const UFFDIO_UNREGISTER: u64 = ioc(IOC_READ, _UFFDIO_UNREGISTER, size_of::<UffdioRange>());
pub const UFFDIO_WAKE: u64 = ioc(IOC_READ, _UFFDIO_WAKE, size_of::<UffdioRange>());
pub const UFFDIO_COPY: u64 = ioc(IOC_READ | IOC_WRITE, _UFFDIO_COPY, size_of::<UffdioCopy>());
pub const UFFDIO_WRITEPROTECT: u64 = ioc(
    IOC_READ | IOC_WRITE,
    _UFFDIO_WRITEPROTECT,
    size_of::<UffdioWriteprotect>(),
);

/// Range ioctls a registration must offer: wake and copy, plus
/// write-protect when registered in WP mode.
pub const REQUIRED_RANGE_IOCTLS: u64 = (1 << _UFFDIO_WAKE) | (1 << _UFFDIO_COPY);
pub const WP_RANGE_IOCTL: u64 = 1 << _UFFDIO_WRITEPROTECT;

pub const UFFD_FEATURE_PAGEFAULT_FLAG_WP: u64 = 1 << 0;

pub const UFFDIO_REGISTER_MODE_MISSING: u64 = 1 << 0;
pub const UFFDIO_REGISTER_MODE_WP: u64 = 1 << 1;

pub const UFFDIO_COPY_MODE_DONTWAKE: u64 = 1 << 0;
pub const UFFDIO_COPY_MODE_WP: u64 = 1 << 1;

pub const UFFDIO_WRITEPROTECT_MODE_WP: u64 = 1 << 0;
pub const UFFDIO_WRITEPROTECT_MODE_DONTWAKE: u64 = 1 << 1;

pub const UFFD_EVENT_PAGEFAULT: u8 = 0x12;

pub const UFFD_PAGEFAULT_FLAG_WRITE: u64 = 1 << 0;
pub const UFFD_PAGEFAULT_FLAG_WP: u64 = 1 << 1;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct UffdioApi {
    pub api: u64,
    pub features: u64,
    pub ioctls: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct UffdioRange {
    pub start: u64,
    pub len: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct UffdioRegister {
    pub range: UffdioRange,
    pub mode: u64,
    pub ioctls: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct UffdioCopy {
    pub dst: u64,
    pub src: u64,
    pub len: u64,
    pub mode: u64,
    pub copy: i64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct UffdioWriteprotect {
    pub range: UffdioRange,
    pub mode: u64,
}

/// `struct uffd_msg` with the pagefault arm of its argument union.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
pub struct UffdMsg {
    pub event: u8,
    pub reserved1: u8,
    pub reserved2: u16,
    pub reserved3: u32,
    pub flags: u64,
    pub address: u64,
    pub feat: u64,
}

const _: () = assert!(size_of::<UffdioApi>() == 24);
const _: () = assert!(size_of::<UffdioRange>() == 16);
const _: () = assert!(size_of::<UffdioRegister>() == 32);
const _: () = assert!(size_of::<UffdioCopy>() == 40);
const _: () = assert!(size_of::<UffdioWriteprotect>() == 24);
const _: () = assert!(size_of::<UffdMsg>() == UFFD_MSG_SIZE);
