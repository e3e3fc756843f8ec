use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::dma::{BlockError, DmaAddr, DmaDirection, DmaMapper, DmaMemory, MappedBlock, Mapping};

/// A page mapped once and shared by up to two receive buffers.
///
/// `mapped_halves` counts halves still owned by the driver. The mapping is
/// released when the last half is handed upstream or dropped; the memory
/// lives until the last upstream reference goes away.
pub(crate) struct RxPage {
    mapping: Mutex<Option<Mapping>>,
    mapped_halves: AtomicU32,
    dma: DmaAddr,
    mem: DmaMemory,
}

impl RxPage {
    pub(crate) fn alloc(mapper: &Arc<dyn DmaMapper>, size: usize) -> Result<Arc<Self>, BlockError> {
        let block = MappedBlock::alloc(mapper, size, DmaDirection::FromDevice)?;
        let dma = block.addr();
        let (mapping, mem) = block.into_parts();
        Ok(Arc::new(RxPage {
            mapping: Mutex::new(Some(mapping)),
            mapped_halves: AtomicU32::new(0),
            dma,
            mem,
        }))
    }

    pub(crate) fn size(&self) -> usize {
        self.mem.len()
    }

    /// Carve a buffer of `len` bytes at `offset`.
    pub(crate) fn half(self: &Arc<Self>, offset: u32, len: u32) -> PageHalf {
        assert!(offset as usize + len as usize <= self.size(), "half exceeds page");
        self.mapped_halves.fetch_add(1, Ordering::AcqRel);
        PageHalf {
            page: Arc::clone(self),
            offset,
            len,
            mapped: true,
        }
    }

    fn release_half(&self) {
        if self.mapped_halves.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mapping = self.mapping.lock().unwrap_or_else(|e| e.into_inner()).take();
            drop(mapping);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_mapped(&self) -> bool {
        self.mapping
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

/// One buffer within an [`RxPage`].
pub(crate) struct PageHalf {
    page: Arc<RxPage>,
    offset: u32,
    len: u32,
    mapped: bool,
}

impl PageHalf {
    pub(crate) fn dma_addr(&self) -> DmaAddr {
        self.page.dma.offset(self.offset as u64)
    }

    pub(crate) fn len(&self) -> u32 {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn page(&self) -> &Arc<RxPage> {
        &self.page
    }

    /// Hand the first `len` bytes upstream. Gives up this half's claim on
    /// the page mapping.
    ///
    /// The device must have completed its write into this half.
    pub(crate) fn into_bytes(mut self, len: u32) -> Bytes {
        let len = len.min(self.len);
        self.mapped = false;
        self.page.release_half();
        Bytes::from_owner(PageSlice {
            page: Arc::clone(&self.page),
            offset: self.offset,
            len,
        })
    }
}

impl Drop for PageHalf {
    fn drop(&mut self) {
        if self.mapped {
            self.page.release_half();
        }
    }
}

/// Upstream view of a completed half-page.
struct PageSlice {
    page: Arc<RxPage>,
    offset: u32,
    len: u32,
}

impl AsRef<[u8]> for PageSlice {
    fn as_ref(&self) -> &[u8] {
        // Safety: the device finished writing this region before the
        // completion was reported, and the driver never reposts a half that
        // has been handed upstream.
        unsafe { self.page.mem.slice(self.offset as usize, self.len as usize) }
    }
}
