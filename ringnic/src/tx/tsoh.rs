//! Pre-mapped header buffers for segmentation offload.
//!
//! Each segment of a TSO burst needs its own copy of the packet headers. A
//! queue keeps a free list of 128-byte slots carved from 4 KiB mapped blocks,
//! growing one block at a time. Headers that do not fit a slot get an
//! individually allocated and mapped buffer.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use log::debug;

use crate::dma::{BlockError, DmaAddr, DmaDirection, DmaMapper, MappedBlock};

/// Size of a pooled header slot.
pub(crate) const TSOH_STD_SIZE: usize = 128;
const TSOH_BLOCK_SIZE: usize = 4096;
const SLOTS_PER_BLOCK: usize = TSOH_BLOCK_SIZE / TSOH_STD_SIZE;

struct PoolSlot {
    block: Arc<MappedBlock>,
    offset: usize,
}

pub(crate) struct TsohPool {
    mapper: Arc<dyn DmaMapper>,
    free_tx: Sender<PoolSlot>,
    free_rx: Receiver<PoolSlot>,
    blocks: usize,
}

impl TsohPool {
    pub(crate) fn new(mapper: Arc<dyn DmaMapper>) -> Self {
        let (free_tx, free_rx) = crossbeam_channel::unbounded();
        TsohPool {
            mapper,
            free_tx,
            free_rx,
            blocks: 0,
        }
    }

    /// Get a header buffer of `len` bytes.
    pub(crate) fn alloc(&mut self, len: usize) -> Result<TsoHeader, BlockError> {
        if len > TSOH_STD_SIZE {
            let block = MappedBlock::alloc(&self.mapper, len, DmaDirection::ToDevice)?;
            return Ok(TsoHeader {
                kind: HeaderKind::Heap(block),
                len,
            });
        }
        let slot = match self.free_rx.try_recv() {
            Ok(slot) => slot,
            Err(_) => {
                self.grow()?;
                self.free_rx.try_recv().map_err(|_| BlockError::NoMemory)?
            }
        };
        Ok(TsoHeader {
            kind: HeaderKind::Pooled {
                slot: Some(slot),
                free: self.free_tx.clone(),
            },
            len,
        })
    }

    fn grow(&mut self) -> Result<(), BlockError> {
        let block = Arc::new(MappedBlock::alloc(
            &self.mapper,
            TSOH_BLOCK_SIZE,
            DmaDirection::ToDevice,
        )?);
        for i in 0..SLOTS_PER_BLOCK {
            let _ = self.free_tx.send(PoolSlot {
                block: Arc::clone(&block),
                offset: i * TSOH_STD_SIZE,
            });
        }
        self.blocks += 1;
        debug!("TSO header pool grown to {} blocks", self.blocks);
        Ok(())
    }

    #[cfg(test)]
    /// Mapped blocks carved so far.
    pub(crate) fn blocks(&self) -> usize {
        self.blocks
    }

    /// Slots currently on the free list.
    #[cfg(test)]
    pub(crate) fn free_slots(&self) -> usize {
        self.free_rx.len()
    }
}

enum HeaderKind {
    Pooled {
        slot: Option<PoolSlot>,
        free: Sender<PoolSlot>,
    },
    Heap(MappedBlock),
}

/// A header buffer owned by one transmit descriptor until completion.
/// Pooled slots return to their free list on drop.
pub(crate) struct TsoHeader {
    kind: HeaderKind,
    len: usize,
}

impl TsoHeader {
    pub(crate) fn addr(&self) -> DmaAddr {
        match &self.kind {
            HeaderKind::Pooled { slot: Some(s), .. } => s.block.addr().offset(s.offset as u64),
            HeaderKind::Pooled { slot: None, .. } => DmaAddr::default(),
            HeaderKind::Heap(block) => block.addr(),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn is_pooled(&self) -> bool {
        matches!(self.kind, HeaderKind::Pooled { .. })
    }

    /// Fill the header from `src`.
    ///
    /// Must be called before the buffer is handed to hardware.
    pub(crate) fn write(&mut self, src: &[u8]) {
        let n = src.len().min(self.len);
        // Safety: the buffer is not yet visible to the device, and a pooled
        // slot is owned by exactly one header at a time.
        let dst = match &self.kind {
            HeaderKind::Pooled { slot: Some(s), .. } => unsafe { s.block.mem().slice_mut(s.offset, n) },
            HeaderKind::Pooled { slot: None, .. } => return,
            HeaderKind::Heap(block) => unsafe { block.mem().slice_mut(0, n) },
        };
        dst.copy_from_slice(&src[..n]);
    }

    /// Mutable view of the header bytes, for field patching before the
    /// buffer is handed to hardware.
    pub(crate) fn with_bytes<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let len = self.len;
        // Safety: as for `write`.
        let bytes = match &self.kind {
            HeaderKind::Pooled { slot: Some(s), .. } => unsafe { s.block.mem().slice_mut(s.offset, len) },
            HeaderKind::Pooled { slot: None, .. } => return None,
            HeaderKind::Heap(block) => unsafe { block.mem().slice_mut(0, len) },
        };
        Some(f(bytes))
    }
}

impl Drop for TsoHeader {
    fn drop(&mut self) {
        if let HeaderKind::Pooled { slot, free } = &mut self.kind
            && let Some(slot) = slot.take()
        {
            // A closed free list means the pool is gone; the slot then just
            // drops its block reference.
            let _ = free.send(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDma;

    fn pool() -> (Arc<SimDma>, TsohPool) {
        let dma = Arc::new(SimDma::new());
        let mapper: Arc<dyn DmaMapper> = dma.clone();
        (dma, TsohPool::new(mapper))
    }

    #[test]
    fn grows_one_block_at_a_time() {
        let (dma, mut pool) = pool();
        let a = pool.alloc(54).unwrap();
        assert_eq!(pool.blocks(), 1);
        assert_eq!(pool.free_slots(), SLOTS_PER_BLOCK - 1);
        let b = pool.alloc(54).unwrap();
        assert_eq!(b.addr().0 - a.addr().0, TSOH_STD_SIZE as u64);
        assert_eq!(dma.outstanding(), 1);
        drop(a);
        drop(b);
        assert_eq!(pool.free_slots(), SLOTS_PER_BLOCK);
    }

    #[test]
    fn long_headers_use_their_own_mapping() {
        let (dma, mut pool) = pool();
        let h = pool.alloc(TSOH_STD_SIZE + 1).unwrap();
        assert!(!h.is_pooled());
        assert_eq!(pool.blocks(), 0);
        assert_eq!(dma.outstanding(), 1);
        drop(h);
        assert_eq!(dma.outstanding(), 0);
    }

    #[test]
    fn header_bytes_are_written() {
        let (_dma, mut pool) = pool();
        let mut h = pool.alloc(4).unwrap();
        h.write(b"abcd");
        h.with_bytes(|b| b[0] = b'x');
        let seen = h.with_bytes(|b| b.to_vec()).unwrap();
        assert_eq!(seen, b"xbcd");
    }

    #[test]
    fn slot_outlives_pool() {
        let (dma, mut pool) = pool();
        let h = pool.alloc(10).unwrap();
        drop(pool);
        assert_eq!(dma.outstanding(), 1);
        drop(h);
        assert_eq!(dma.outstanding(), 0);
    }

    #[test]
    fn grow_failure_reported() {
        let (dma, mut pool) = pool();
        dma.fail_after(0);
        assert!(matches!(pool.alloc(54), Err(BlockError::Map(_))));
    }
}
