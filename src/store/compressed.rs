//! Compressing backing store.
//!
//! The address space is divided into fixed-size blocks, each held as one zlib
//! stream. A block that was never written has no stream and reads as zeros.
//! Every transfer decompresses the owning block into a page-aligned scratch
//! frame; writes patch the frame and recompress the whole block.
//!
//! Blocks are locked individually, so transfers on different blocks proceed
//! in parallel.

use std::io::{Read, Write};
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};

use eyre::{bail, ensure, Result, WrapErr};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use memmap2::MmapMut;
use parking_lot::Mutex;

use super::{check_range, Store, StoreError};
use crate::config::system_page_size;

/// Reusable page-aligned frames of one block each.
struct ScratchPool {
    frame_len: usize,
    free: Mutex<Vec<MmapMut>>,
}

impl ScratchPool {
    fn new(frame_len: usize) -> Self {
        Self {
            frame_len,
            free: Mutex::new(Vec::new()),
        }
    }

    fn acquire(&self) -> Result<ScratchFrame<'_>> {
        let frame = match self.free.lock().pop() {
            Some(frame) => frame,
            None => MmapMut::map_anon(self.frame_len)
                .wrap_err_with(|| format!("failed to map {}-byte scratch frame", self.frame_len))?,
        };
        Ok(ScratchFrame {
            frame: ManuallyDrop::new(frame),
            pool: self,
        })
    }
}

struct ScratchFrame<'a> {
    frame: ManuallyDrop<MmapMut>,
    pool: &'a ScratchPool,
}

impl Deref for ScratchFrame<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.frame
    }
}

impl DerefMut for ScratchFrame<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.frame
    }
}

impl Drop for ScratchFrame<'_> {
    fn drop(&mut self) {
        // SAFETY: taken exactly once, here.
        let frame = unsafe { ManuallyDrop::take(&mut self.frame) };
        self.pool.free.lock().push(frame);
    }
}

pub struct CompressedStore {
    block_size: usize,
    capacity: u64,
    level: Compression,
    blocks: Vec<Mutex<Option<Vec<u8>>>>,
    scratch: ScratchPool,
}

impl CompressedStore {
    /// An all-zero store of `capacity` bytes.
    pub fn new(capacity: u64, block_size: usize) -> Result<Self> {
        let page = system_page_size();
        ensure!(
            block_size > 0 && block_size % page == 0,
            "compressed block size {} must be a non-zero multiple of the page size {}",
            block_size,
            page
        );

        let num_blocks = capacity.div_ceil(block_size as u64) as usize;
        Ok(Self {
            block_size,
            capacity,
            level: Compression::default(),
            blocks: (0..num_blocks).map(|_| Mutex::new(None)).collect(),
            scratch: ScratchPool::new(block_size),
        })
    }

    /// A store initialised with `data`; capacity is `data.len()`.
    pub fn from_bytes(data: &[u8], block_size: usize) -> Result<Self> {
        let store = Self::new(data.len() as u64, block_size)?;
        for (index, chunk) in data.chunks(block_size).enumerate() {
            if chunk.iter().any(|&b| b != 0) {
                *store.blocks[index].lock() = Some(store.compress(index as u64, chunk)?);
            }
        }
        Ok(store)
    }

    pub fn with_level(mut self, level: Compression) -> Self {
        self.level = level;
        self
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total bytes of compressed data currently held.
    pub fn compressed_len(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| b.lock().as_ref().map_or(0, Vec::len))
            .sum()
    }

    fn block_len(&self, index: usize) -> usize {
        let start = index as u64 * self.block_size as u64;
        (self.capacity - start).min(self.block_size as u64) as usize
    }

    fn compress(&self, block: u64, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 4), self.level);
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| {
                StoreError::Codec {
                    block,
                    reason: format!("compression failed: {}", e),
                }
                .into()
            })
    }

    fn decompress(&self, block: u64, stream: Option<&[u8]>, out: &mut [u8]) -> Result<()> {
        let Some(stream) = stream else {
            out.fill(0);
            return Ok(());
        };
        if let Err(e) = ZlibDecoder::new(stream).read_exact(out) {
            bail!(StoreError::Codec {
                block,
                reason: format!("decompression failed: {}", e),
            });
        }
        Ok(())
    }

    /// Splits `[offset, offset + len)` at block boundaries into
    /// `(block, offset within block, offset within buffer, length)`.
    fn spans(&self, offset: u64, len: usize) -> Vec<(usize, usize, usize, usize)> {
        let bs = self.block_size as u64;
        let mut spans = Vec::new();
        let mut done = 0usize;
        while done < len {
            let pos = offset + done as u64;
            let index = (pos / bs) as usize;
            let intra = (pos % bs) as usize;
            let n = (self.block_size - intra).min(len - done);
            spans.push((index, intra, done, n));
            done += n;
        }
        spans
    }
}

impl Store for CompressedStore {
    fn read_from_store(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        check_range(offset, buf.len(), self.capacity)?;

        for (index, intra, start, n) in self.spans(offset, buf.len()) {
            let block = self.blocks[index].lock();
            let mut frame = self.scratch.acquire()?;
            let blen = self.block_len(index);
            self.decompress(index as u64, block.as_deref(), &mut frame[..blen])?;
            buf[start..start + n].copy_from_slice(&frame[intra..intra + n]);
        }
        Ok(buf.len())
    }

    fn write_to_store(&self, buf: &[u8], offset: u64) -> Result<usize> {
        check_range(offset, buf.len(), self.capacity)?;

        for (index, intra, start, n) in self.spans(offset, buf.len()) {
            let mut block = self.blocks[index].lock();
            let mut frame = self.scratch.acquire()?;
            let blen = self.block_len(index);
            if n < blen {
                self.decompress(index as u64, block.as_deref(), &mut frame[..blen])?;
            }
            frame[intra..intra + n].copy_from_slice(&buf[start..start + n]);
            *block = Some(self.compress(index as u64, &frame[..blen])?);
        }
        Ok(buf.len())
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}
