//! # Backing Store Abstraction
//!
//! This module provides the `Store` trait, the copy-based contract every
//! backing store of a mapped region implements, together with the built-in
//! backends.
//!
//! ## Offset Contract
//!
//! ```text
//! fn read_from_store(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
//! fn write_to_store(&self, buf: &[u8], offset: u64) -> Result<usize>;
//! ```
//!
//! `offset` is always relative to the first byte of the region's backing
//! data, never an OS file cursor. A transfer must satisfy
//! `offset + buf.len() <= capacity`; anything else is a
//! [`StoreError::OutOfRange`]. A transfer that moves fewer bytes than asked is
//! a [`StoreError::ShortTransfer`]. The pager treats every store error as
//! fatal: the page table and the on-disk state can no longer be reconciled.
//!
//! ## Concurrency
//!
//! Stores are shared by every dispatcher and evictor thread of a region, so
//! the trait requires `Send + Sync`. Calls for disjoint offsets may run in
//! parallel; backends own whatever locking their lazily created resources
//! need (see the per-shard double-checked creation in `SparseStore`).
//!
//! ## Backends
//!
//! | Backend           | State                          | Notes                          |
//! |-------------------|--------------------------------|--------------------------------|
//! | `FileStore`       | one file                       | positioned I/O, no shared cursor |
//! | `SparseStore`     | directory of fixed-size shards | shards created on first touch  |
//! | `CompressedStore` | zlib blocks in memory          | block-granular recompression   |
//! | `MemoryStore`     | `Vec<u8>`                      | volatile, records write offsets |
//!
//! `AnyStore` is a type-erased wrapper over the built-in backends and
//! `StoreKind` describes how to open one.

mod compressed;
mod file;
mod memory;
mod sparse;

pub use compressed::CompressedStore;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use sparse::{SparseMetadata, SparseStore};

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use eyre::{bail, Result};

/// Backing-store contract of a mapped region.
pub trait Store: Send + Sync {
    /// Fills `buf` from the store starting at `offset`. Returns the number of
    /// bytes read, which is always `buf.len()` on success.
    fn read_from_store(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Writes `buf` to the store starting at `offset`. Only invoked for
    /// dirty pages.
    fn write_to_store(&self, buf: &[u8], offset: u64) -> Result<usize>;

    /// Size of the addressable backing data in bytes.
    fn capacity(&self) -> u64;

    /// Makes previous writes durable. Stores without a durable medium do
    /// nothing.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

impl<S: Store + ?Sized> Store for Arc<S> {
    fn read_from_store(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        (**self).read_from_store(buf, offset)
    }

    fn write_to_store(&self, buf: &[u8], offset: u64) -> Result<usize> {
        (**self).write_to_store(buf, offset)
    }

    fn capacity(&self) -> u64 {
        (**self).capacity()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

impl<S: Store + ?Sized> Store for Box<S> {
    fn read_from_store(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        (**self).read_from_store(buf, offset)
    }

    fn write_to_store(&self, buf: &[u8], offset: u64) -> Result<usize> {
        (**self).write_to_store(buf, offset)
    }

    fn capacity(&self) -> u64 {
        (**self).capacity()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Read,
    Write,
    Create,
}

impl StoreOp {
    pub fn name(&self) -> &'static str {
        match self {
            StoreOp::Read => "read",
            StoreOp::Write => "write",
            StoreOp::Create => "create",
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    IoFailure {
        op: StoreOp,
        offset: u64,
        len: usize,
        source: io::Error,
    },
    ShortTransfer {
        op: StoreOp,
        offset: u64,
        expected: usize,
        actual: usize,
    },
    OutOfRange {
        offset: u64,
        len: usize,
        capacity: u64,
    },
    ReadOnly {
        offset: u64,
    },
    Codec {
        block: u64,
        reason: String,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::IoFailure {
                op,
                offset,
                len,
                source,
            } => write!(
                f,
                "store {} of {} bytes at offset {} failed: {}",
                op.name(),
                len,
                offset,
                source
            ),
            StoreError::ShortTransfer {
                op,
                offset,
                expected,
                actual,
            } => write!(
                f,
                "short store {} at offset {}: {} of {} bytes",
                op.name(),
                offset,
                actual,
                expected
            ),
            StoreError::OutOfRange {
                offset,
                len,
                capacity,
            } => write!(
                f,
                "store access {}+{} exceeds capacity {}",
                offset, len, capacity
            ),
            StoreError::ReadOnly { offset } => {
                write!(f, "write at offset {} refused by read-only store", offset)
            }
            StoreError::Codec { block, reason } => {
                write!(f, "compressed block {}: {}", block, reason)
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::IoFailure { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub(crate) fn check_range(offset: u64, len: usize, capacity: u64) -> Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= capacity => Ok(()),
        _ => bail!(StoreError::OutOfRange {
            offset,
            len,
            capacity
        }),
    }
}

/// Positioned read until `buf` is full or the file ends. Returns the number
/// of bytes read.
pub(crate) fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// Positioned write of all of `buf`. Returns the number of bytes written.
pub(crate) fn write_full_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.write_at(&buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// Converts the outcome of a positioned transfer into the store contract.
pub(crate) fn finish_transfer(
    op: StoreOp,
    offset: u64,
    expected: usize,
    outcome: io::Result<usize>,
) -> Result<usize> {
    match outcome {
        Ok(n) if n == expected => Ok(n),
        Ok(actual) => bail!(StoreError::ShortTransfer {
            op,
            offset,
            expected,
            actual
        }),
        Err(source) => bail!(StoreError::IoFailure {
            op,
            offset,
            len: expected,
            source
        }),
    }
}

/// Describes a backing store to open.
#[derive(Debug, Clone)]
pub enum StoreKind {
    File { path: PathBuf, read_only: bool },
    NewFile { path: PathBuf, capacity: u64 },
    Sparse { root: PathBuf, read_only: bool },
    NewSparse { root: PathBuf, capacity: u64, shard_size: u64 },
    Compressed { capacity: u64, block_size: usize },
    Memory { capacity: u64 },
}

impl StoreKind {
    pub fn open(&self) -> Result<AnyStore> {
        Ok(match self {
            StoreKind::File { path, read_only } => AnyStore::File(FileStore::open(path, *read_only)?),
            StoreKind::NewFile { path, capacity } => {
                AnyStore::File(FileStore::create(path, *capacity)?)
            }
            StoreKind::Sparse { root, read_only } => {
                AnyStore::Sparse(SparseStore::open(root, *read_only)?)
            }
            StoreKind::NewSparse {
                root,
                capacity,
                shard_size,
            } => AnyStore::Sparse(SparseStore::create(root, *capacity, *shard_size)?),
            StoreKind::Compressed {
                capacity,
                block_size,
            } => AnyStore::Compressed(CompressedStore::new(*capacity, *block_size)?),
            StoreKind::Memory { capacity } => AnyStore::Memory(MemoryStore::new(*capacity as usize)),
        })
    }
}

/// Type-erased wrapper over the built-in backends.
pub enum AnyStore {
    File(FileStore),
    Sparse(SparseStore),
    Compressed(CompressedStore),
    Memory(MemoryStore),
}

impl AnyStore {
    fn inner(&self) -> &dyn Store {
        match self {
            AnyStore::File(s) => s,
            AnyStore::Sparse(s) => s,
            AnyStore::Compressed(s) => s,
            AnyStore::Memory(s) => s,
        }
    }
}

impl Store for AnyStore {
    fn read_from_store(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.inner().read_from_store(buf, offset)
    }

    fn write_to_store(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.inner().write_to_store(buf, offset)
    }

    fn capacity(&self) -> u64 {
        self.inner().capacity()
    }

    fn sync(&self) -> Result<()> {
        self.inner().sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn check_range_accepts_exact_end() {
        assert!(check_range(4096, 4096, 8192).is_ok());
    }

    #[test]
    fn check_range_rejects_overflow() {
        let err = check_range(4096, 4097, 8192).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::OutOfRange { .. })
        ));
        assert!(check_range(u64::MAX, 1, u64::MAX).is_err());
    }

    #[test]
    fn store_kind_opens_memory_store() {
        let store = StoreKind::Memory { capacity: 8192 }.open().unwrap();
        assert_eq!(store.capacity(), 8192);
        assert!(matches!(store, AnyStore::Memory(_)));
    }

    #[test]
    fn any_store_dispatches_to_file_backend() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backing.dat");

        let store = StoreKind::NewFile {
            path: path.clone(),
            capacity: 16384,
        }
        .open()
        .unwrap();

        store.write_to_store(&[7u8; 512], 4096).unwrap();
        let mut buf = [0u8; 512];
        store.read_from_store(&mut buf, 4096).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn arc_store_forwards() {
        let store = Arc::new(MemoryStore::new(4096));
        let shared: Arc<MemoryStore> = Arc::clone(&store);

        shared.write_to_store(&[1, 2, 3], 0).unwrap();
        let mut buf = [0u8; 3];
        store.read_from_store(&mut buf, 0).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }
}
