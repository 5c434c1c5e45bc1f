//! Volatile in-memory store. Records the offset of every write so callers can
//! audit write-back traffic.

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::Result;
use parking_lot::{Mutex, RwLock};

use super::{check_range, Store};

pub struct MemoryStore {
    data: RwLock<Vec<u8>>,
    write_log: Mutex<Vec<u64>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self::from_vec(vec![0u8; capacity])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            write_log: Mutex::new(Vec::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Offsets of all writes so far, in call order.
    pub fn write_offsets(&self) -> Vec<u64> {
        self.write_log.lock().clone()
    }
}

impl Store for MemoryStore {
    fn read_from_store(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.data.read();
        check_range(offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(buf.len())
    }

    fn write_to_store(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let mut data = self.data.write();
        check_range(offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        self.write_log.lock().push(offset);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(buf.len())
    }

    fn capacity(&self) -> u64 {
        self.data.read().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_logs_writes() {
        let store = MemoryStore::new(8192);
        store.write_to_store(&[1; 10], 4096).unwrap();
        store.write_to_store(&[2; 10], 0).unwrap();

        let mut out = [0u8; 10];
        store.read_from_store(&mut out, 4096).unwrap();

        assert_eq!(out, [1; 10]);
        assert_eq!(store.write_offsets(), vec![4096, 0]);
        assert_eq!(store.reads(), 1);
        assert_eq!(store.writes(), 2);
    }

    #[test]
    fn rejects_out_of_range() {
        let store = MemoryStore::from_vec(vec![0; 100]);
        assert!(store.write_to_store(&[0; 2], 99).is_err());
        assert_eq!(store.writes(), 0);
        assert_eq!(store.snapshot().len(), 100);
    }
}
