//! Page-aligned staging frames, one per buffer slot.
//!
//! A frame holds page data only while its slot is in transit: filled from the
//! store before a copy-in, or filled from the region before a write-back.
//! One anonymous mapping backs all frames, so each frame is page aligned as
//! `UFFDIO_COPY` requires.

use std::ptr::NonNull;

use eyre::{Result, WrapErr};
use memmap2::MmapMut;

pub(crate) struct FrameArena {
    _map: MmapMut,
    base: NonNull<u8>,
    frame_len: usize,
    frames: usize,
}

// SAFETY: the arena only hands out frames through `frame_mut`, whose callers
// guarantee exclusive use of a slot's frame.
unsafe impl Send for FrameArena {}
unsafe impl Sync for FrameArena {}

impl FrameArena {
    pub(crate) fn new(frames: usize, frame_len: usize) -> Result<Self> {
        let bytes = frames
            .checked_mul(frame_len)
            .ok_or_else(|| eyre::eyre!("frame arena of {} x {} bytes overflows", frames, frame_len))?;
        let mut map = MmapMut::map_anon(bytes)
            .wrap_err_with(|| format!("failed to map {} staging frames", frames))?;
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| eyre::eyre!("anonymous mapping returned a null base"))?;

        Ok(Self {
            _map: map,
            base,
            frame_len,
            frames,
        })
    }

    /// The staging frame of `slot`.
    ///
    /// # Safety
    ///
    /// The caller must own `slot` in a transitional state (filling, evicting
    /// or writing back) so that no other thread touches the same frame.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn frame_mut(&self, slot: usize) -> &mut [u8] {
        debug_assert!(slot < self.frames);
        // SAFETY: slot < frames keeps the range inside the mapping; exclusivity
        // is the caller's contract.
        unsafe {
            std::slice::from_raw_parts_mut(self.base.as_ptr().add(slot * self.frame_len), self.frame_len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_disjoint_and_aligned() {
        let arena = FrameArena::new(3, 4096).unwrap();

        unsafe {
            arena.frame_mut(0).fill(1);
            arena.frame_mut(2).fill(3);
            assert!(arena.frame_mut(1).iter().all(|&b| b == 0));
            assert!(arena.frame_mut(2).iter().all(|&b| b == 3));
            assert_eq!(arena.frame_mut(1).as_ptr() as usize % 4096, 0);
        }
    }
}
