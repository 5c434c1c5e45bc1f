//! Single-file backing store.
//!
//! All transfers use positioned I/O (`pread`/`pwrite`), so concurrent
//! dispatchers never race on a shared file cursor.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use eyre::{bail, Result, WrapErr};
use tracing::debug;

use super::{check_range, finish_transfer, read_full_at, write_full_at, Store, StoreError, StoreOp};

#[derive(Debug)]
pub struct FileStore {
    file: File,
    path: PathBuf,
    capacity: u64,
    read_only: bool,
}

impl FileStore {
    /// Opens an existing file. Its current length is the store capacity.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .wrap_err_with(|| format!("failed to open backing file '{}'", path.display()))?;

        let capacity = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat backing file '{}'", path.display()))?
            .len();

        debug!(path = %path.display(), capacity, read_only, "opened file store");

        Ok(Self {
            file,
            path: path.to_path_buf(),
            capacity,
            read_only,
        })
    }

    /// Creates a new file sized to `capacity` bytes. Fails if `path` already
    /// exists; use [`open`](Self::open) for an existing backing file.
    pub fn create<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Self> {
        let path = path.as_ref();
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                bail!("backing file '{}' already exists", path.display())
            }
            Err(err) => {
                return Err(err).wrap_err_with(|| {
                    format!("failed to create backing file '{}'", path.display())
                })
            }
        };

        file.set_len(capacity)
            .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), capacity))?;

        debug!(path = %path.display(), capacity, "created file store");

        Ok(Self {
            file,
            path: path.to_path_buf(),
            capacity,
            read_only: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

impl Store for FileStore {
    fn read_from_store(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        check_range(offset, buf.len(), self.capacity)?;
        let len = buf.len();
        finish_transfer(StoreOp::Read, offset, len, read_full_at(&self.file, buf, offset))
    }

    fn write_to_store(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if self.read_only {
            bail!(StoreError::ReadOnly { offset });
        }
        check_range(offset, buf.len(), self.capacity)?;
        finish_transfer(
            StoreOp::Write,
            offset,
            buf.len(),
            write_full_at(&self.file, buf, offset),
        )
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file
            .sync_data()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_sizes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");

        let store = FileStore::create(&path, 3 * 4096).unwrap();

        assert_eq!(store.capacity(), 3 * 4096);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 3 * 4096);
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"existing contents").unwrap();

        let err = FileStore::create(&path, 4096).unwrap_err();

        assert!(err.to_string().contains("already exists"));
        assert_eq!(std::fs::read(&path).unwrap(), b"existing contents");
        assert_eq!(FileStore::open(&path, true).unwrap().capacity(), 17);
    }

    #[test]
    fn write_then_read_at_offset() {
        let dir = tempdir().unwrap();
        let store = FileStore::create(dir.path().join("data.bin"), 4 * 4096).unwrap();

        let page = vec![0x5Au8; 4096];
        assert_eq!(store.write_to_store(&page, 2 * 4096).unwrap(), 4096);

        let mut out = vec![0u8; 4096];
        assert_eq!(store.read_from_store(&mut out, 2 * 4096).unwrap(), 4096);
        assert_eq!(out, page);

        store.read_from_store(&mut out, 0).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn reopen_sees_previous_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");

        {
            let store = FileStore::create(&path, 8192).unwrap();
            store.write_to_store(b"persisted", 4096).unwrap();
            store.sync().unwrap();
        }

        let store = FileStore::open(&path, true).unwrap();
        let mut out = [0u8; 9];
        store.read_from_store(&mut out, 4096).unwrap();
        assert_eq!(&out, b"persisted");
    }

    #[test]
    fn read_past_capacity_is_out_of_range() {
        let dir = tempdir().unwrap();
        let store = FileStore::create(dir.path().join("data.bin"), 4096).unwrap();

        let mut out = vec![0u8; 4096];
        let err = store.read_from_store(&mut out, 1).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::OutOfRange { capacity: 4096, .. })
        ));
    }

    #[test]
    fn read_only_store_refuses_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        FileStore::create(&path, 4096).unwrap();

        let store = FileStore::open(&path, true).unwrap();
        let err = store.write_to_store(&[1u8; 16], 0).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::ReadOnly { offset: 0 })
        ));
    }

    #[test]
    fn short_read_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let store = FileStore::create(&path, 8192).unwrap();

        // Shrink the file behind the store's back.
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(4096 + 100)
            .unwrap();

        let mut out = vec![0u8; 4096];
        let err = store.read_from_store(&mut out, 4096).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::ShortTransfer {
                expected: 4096,
                actual: 100,
                ..
            })
        ));
    }
}
