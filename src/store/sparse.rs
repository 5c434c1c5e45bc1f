//! # Sharded ("Sparse") Backing Store
//!
//! The logical address space is split into fixed-size shards, each backed by
//! its own file inside one directory:
//!
//! ```text
//! root/
//! ├── _metadata      "<shard_size> <capacity>\n"
//! ├── 0              bytes [0, shard_size)
//! ├── 1              bytes [shard_size, 2*shard_size)
//! └── ...            created on first touch, pre-allocated to shard_size
//! ```
//!
//! ## Shard Lookup
//!
//! `shard_index = offset / shard_size`, `intra = offset % shard_size`. The
//! descriptor table is a `Vec<OnceLock<File>>`: the fast path is a lock-free
//! `get`. On a miss the creation mutex is taken and the slot re-checked, so
//! two threads touching the same new shard create it once, while threads on
//! already-open shards never contend.
//!
//! ## Open Modes
//!
//! - `create`: the directory must not exist. Writes metadata once.
//! - `open(read_only = false)`: the directory must exist. Missing shards are
//!   created on first touch.
//! - `open(read_only = true)`: missing shards are never created; reads of
//!   untouched shards return zeros and writes are refused.

use std::fs::{self, File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use eyre::{bail, ensure, eyre, Result, WrapErr};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{check_range, finish_transfer, read_full_at, write_full_at, Store, StoreError, StoreOp};
use crate::config::{system_page_size, SPARSE_METADATA_FILE};

/// Persisted description of a sparse store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseMetadata {
    pub shard_size: u64,
    pub capacity: u64,
}

impl SparseMetadata {
    pub fn num_shards(&self) -> usize {
        self.capacity.div_ceil(self.shard_size) as usize
    }

    pub fn render(&self) -> String {
        format!("{} {}\n", self.shard_size, self.capacity)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut fields = text.split_whitespace();
        let shard_size = fields
            .next()
            .ok_or_else(|| eyre!("sparse metadata is empty"))?
            .parse::<u64>()
            .wrap_err("sparse metadata: bad shard size")?;
        let capacity = fields
            .next()
            .ok_or_else(|| eyre!("sparse metadata is missing the capacity"))?
            .parse::<u64>()
            .wrap_err("sparse metadata: bad capacity")?;

        ensure!(shard_size > 0, "sparse metadata: shard size is zero");
        Ok(Self {
            shard_size,
            capacity,
        })
    }
}

pub struct SparseStore {
    root: PathBuf,
    meta: SparseMetadata,
    read_only: bool,
    shards: Vec<OnceLock<File>>,
    creation: Mutex<()>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl SparseStore {
    /// Creates a new store directory. `shard_size` is rounded up to a
    /// multiple of the system page size.
    pub fn create<P: AsRef<Path>>(root: P, capacity: u64, shard_size: u64) -> Result<Self> {
        Self::create_aligned(root, capacity, shard_size, system_page_size() as u64)
    }

    /// Like [`create`](Self::create) with an explicit shard alignment.
    pub fn create_aligned<P: AsRef<Path>>(
        root: P,
        capacity: u64,
        shard_size: u64,
        alignment: u64,
    ) -> Result<Self> {
        let root = root.as_ref();
        ensure!(alignment > 0, "shard alignment must be non-zero");
        ensure!(shard_size > 0, "shard size must be non-zero");
        ensure!(
            !root.exists(),
            "sparse store directory '{}' already exists",
            root.display()
        );

        let meta = SparseMetadata {
            shard_size: shard_size.div_ceil(alignment) * alignment,
            capacity,
        };

        fs::create_dir_all(root)
            .wrap_err_with(|| format!("failed to create sparse store '{}'", root.display()))?;
        fs::write(root.join(SPARSE_METADATA_FILE), meta.render())
            .wrap_err_with(|| format!("failed to write metadata in '{}'", root.display()))?;

        info!(
            root = %root.display(),
            shard_size = meta.shard_size,
            capacity,
            shards = meta.num_shards(),
            "created sparse store"
        );

        Ok(Self::with_meta(root, meta, false))
    }

    /// Opens an existing store directory.
    pub fn open<P: AsRef<Path>>(root: P, read_only: bool) -> Result<Self> {
        let root = root.as_ref();
        ensure!(
            root.is_dir(),
            "sparse store directory '{}' does not exist",
            root.display()
        );

        let text = fs::read_to_string(root.join(SPARSE_METADATA_FILE))
            .wrap_err_with(|| format!("failed to read metadata in '{}'", root.display()))?;
        let meta = SparseMetadata::parse(&text)
            .wrap_err_with(|| format!("corrupt metadata in '{}'", root.display()))?;

        debug!(
            root = %root.display(),
            shard_size = meta.shard_size,
            capacity = meta.capacity,
            read_only,
            "opened sparse store"
        );

        Ok(Self::with_meta(root, meta, read_only))
    }

    fn with_meta(root: &Path, meta: SparseMetadata, read_only: bool) -> Self {
        let shards = (0..meta.num_shards()).map(|_| OnceLock::new()).collect();
        Self {
            root: root.to_path_buf(),
            meta,
            read_only,
            shards,
            creation: Mutex::new(()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn metadata(&self) -> SparseMetadata {
        self.meta
    }

    pub fn shard_size(&self) -> u64 {
        self.meta.shard_size
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shard_path(&self, index: usize) -> PathBuf {
        self.root.join(index.to_string())
    }

    /// Number of completed `read_from_store` calls.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of completed `write_to_store` calls.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Syncs and closes every open shard. Later accesses reopen them.
    pub fn close_files(&mut self) -> Result<()> {
        for (index, slot) in self.shards.iter_mut().enumerate() {
            if let Some(file) = slot.take() {
                if !self.read_only {
                    file.sync_all()
                        .wrap_err_with(|| format!("failed to sync shard {}", index))?;
                }
            }
        }
        Ok(())
    }

    /// Returns the open shard, creating it if allowed. `None` means the shard
    /// does not exist and the store may not create it.
    fn shard(&self, index: usize) -> Result<Option<&File>> {
        let slot = &self.shards[index];
        if let Some(file) = slot.get() {
            return Ok(Some(file));
        }

        let _guard = self.creation.lock();
        if let Some(file) = slot.get() {
            return Ok(Some(file));
        }

        let path = self.shard_path(index);
        let file = if path.exists() {
            OpenOptions::new()
                .read(true)
                .write(!self.read_only)
                .open(&path)
                .wrap_err_with(|| format!("failed to open shard '{}'", path.display()))?
        } else if self.read_only {
            return Ok(None);
        } else {
            self.create_shard(index, &path)?
        };

        Ok(Some(slot.get_or_init(|| file)))
    }

    fn create_shard(&self, index: usize, path: &Path) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .map_err(|source| StoreError::IoFailure {
                op: StoreOp::Create,
                offset: index as u64 * self.meta.shard_size,
                len: self.meta.shard_size as usize,
                source,
            })?;

        // SAFETY: fd is a valid open descriptor owned by `file`.
        let rc = unsafe {
            libc::posix_fallocate(file.as_raw_fd(), 0, self.meta.shard_size as libc::off_t)
        };
        if rc != 0 {
            bail!(StoreError::IoFailure {
                op: StoreOp::Create,
                offset: index as u64 * self.meta.shard_size,
                len: self.meta.shard_size as usize,
                source: std::io::Error::from_raw_os_error(rc),
            });
        }

        debug!(shard = index, path = %path.display(), "created shard");
        Ok(file)
    }

    /// Splits `[offset, offset + len)` at shard boundaries.
    fn chunks(&self, offset: u64, len: usize) -> impl Iterator<Item = (usize, u64, usize, usize)> {
        let shard_size = self.meta.shard_size;
        let mut done = 0usize;
        std::iter::from_fn(move || {
            if done >= len {
                return None;
            }
            let pos = offset + done as u64;
            let index = (pos / shard_size) as usize;
            let intra = pos % shard_size;
            let n = ((shard_size - intra) as usize).min(len - done);
            let item = (index, intra, done, n);
            done += n;
            Some(item)
        })
    }
}

impl Store for SparseStore {
    fn read_from_store(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        check_range(offset, buf.len(), self.meta.capacity)?;

        for (index, intra, start, n) in self.chunks(offset, buf.len()) {
            let dst = &mut buf[start..start + n];
            match self.shard(index)? {
                Some(file) => {
                    finish_transfer(
                        StoreOp::Read,
                        offset + start as u64,
                        n,
                        read_full_at(file, dst, intra),
                    )?;
                }
                None => dst.fill(0),
            }
        }

        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(buf.len())
    }

    fn write_to_store(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if self.read_only {
            bail!(StoreError::ReadOnly { offset });
        }
        check_range(offset, buf.len(), self.meta.capacity)?;

        for (index, intra, start, n) in self.chunks(offset, buf.len()) {
            let file = self
                .shard(index)?
                .ok_or_else(|| eyre!("shard {} unavailable for writing", index))?;
            finish_transfer(
                StoreOp::Write,
                offset + start as u64,
                n,
                write_full_at(file, &buf[start..start + n], intra),
            )?;
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(buf.len())
    }

    fn capacity(&self) -> u64 {
        self.meta.capacity
    }

    fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        for (index, slot) in self.shards.iter().enumerate() {
            if let Some(file) = slot.get() {
                file.sync_data()
                    .wrap_err_with(|| format!("failed to sync shard {}", index))?;
            }
        }
        Ok(())
    }
}

impl Drop for SparseStore {
    fn drop(&mut self) {
        debug!(
            root = %self.root.display(),
            reads = self.reads(),
            writes = self.writes(),
            "closing sparse store"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn metadata_round_trips_through_text() {
        let meta = SparseMetadata {
            shard_size: 65536,
            capacity: 1 << 30,
        };
        assert_eq!(SparseMetadata::parse(&meta.render()).unwrap(), meta);
        assert!(SparseMetadata::parse("0 100").is_err());
        assert!(SparseMetadata::parse("4096").is_err());
    }

    #[test]
    fn shard_size_rounds_up_to_alignment() {
        let dir = tempdir().unwrap();
        let store = SparseStore::create_aligned(dir.path().join("s"), 100_000, 5000, 4096).unwrap();

        assert_eq!(store.shard_size(), 8192);
        assert_eq!(store.metadata().num_shards(), 13);
    }

    #[test]
    fn create_refuses_existing_directory() {
        let dir = tempdir().unwrap();
        assert!(SparseStore::create(dir.path(), 4096, 4096).is_err());
    }

    #[test]
    fn open_refuses_missing_directory() {
        let dir = tempdir().unwrap();
        assert!(SparseStore::open(dir.path().join("missing"), false).is_err());
    }

    #[test]
    fn shards_created_lazily_and_preallocated() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("s");
        let store = SparseStore::create_aligned(&root, 4 * 8192, 8192, 4096).unwrap();

        assert!(!root.join("0").exists());
        store.write_to_store(&[1u8; 16], 3 * 8192).unwrap();

        assert!(!root.join("0").exists());
        assert_eq!(fs::metadata(root.join("3")).unwrap().len(), 8192);
    }

    #[test]
    fn transfer_spanning_shards_is_split() {
        let dir = tempdir().unwrap();
        let store = SparseStore::create_aligned(dir.path().join("s"), 3 * 4096, 4096, 4096).unwrap();

        let data: Vec<u8> = (0..6000).map(|i| (i % 251) as u8).collect();
        store.write_to_store(&data, 2000).unwrap();

        let mut out = vec![0u8; 6000];
        store.read_from_store(&mut out, 2000).unwrap();
        assert_eq!(out, data);
        assert_eq!(store.reads(), 1);
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn read_only_open_reads_zeros_for_untouched_shards() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("s");
        {
            let store = SparseStore::create_aligned(&root, 2 * 4096, 4096, 4096).unwrap();
            store.write_to_store(&[9u8; 4096], 0).unwrap();
        }

        let store = SparseStore::open(&root, true).unwrap();
        let mut out = vec![0xFFu8; 4096];
        store.read_from_store(&mut out, 4096).unwrap();
        assert!(out.iter().all(|&b| b == 0));
        assert!(!root.join("1").exists());

        store.read_from_store(&mut out, 0).unwrap();
        assert!(out.iter().all(|&b| b == 9));

        assert!(store.write_to_store(&out, 0).is_err());
    }

    #[test]
    fn close_files_allows_reopen_of_shards() {
        let dir = tempdir().unwrap();
        let mut store =
            SparseStore::create_aligned(dir.path().join("s"), 2 * 4096, 4096, 4096).unwrap();

        store.write_to_store(b"abc", 4096).unwrap();
        store.close_files().unwrap();

        let mut out = [0u8; 3];
        store.read_from_store(&mut out, 4096).unwrap();
        assert_eq!(&out, b"abc");
    }

    #[test]
    fn concurrent_first_touch_creates_one_shard() {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            SparseStore::create_aligned(dir.path().join("s"), 2 * 65536, 65536, 4096).unwrap(),
        );

        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store
                        .write_to_store(&[t; 1024], t as u64 * 1024)
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for t in 0..8u8 {
            let mut out = [0u8; 1024];
            store.read_from_store(&mut out, t as u64 * 1024).unwrap();
            assert!(out.iter().all(|&b| b == t));
        }
        assert_eq!(store.writes(), 8);
    }
}
