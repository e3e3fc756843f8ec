use std::sync::Arc;

use bytes::Bytes;

use super::page::{PageHalf, RxPage};
use crate::config::RxAllocMethod;
use crate::dma::{BlockError, DmaAddr, DmaDirection, DmaMapper, DmaMemory, MappedBlock};
use crate::family::RxDescriptor;

/// Memory behind a receive buffer.
pub(crate) enum RxMemory {
    /// Dedicated allocation with its own mapping.
    Single(MappedBlock),
    /// Half of a shared page.
    Half(PageHalf),
}

/// A receive buffer, owned by a ring slot while posted to hardware.
pub(crate) struct RxBuffer {
    memory: RxMemory,
    dma: DmaAddr,
    len: u32,
}

impl RxBuffer {
    #[inline]
    pub(crate) fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub(crate) fn is_page(&self) -> bool {
        matches!(self.memory, RxMemory::Half(_))
    }

    #[inline]
    pub(crate) fn descriptor(&self) -> RxDescriptor {
        RxDescriptor {
            addr: self.dma,
            len: self.len,
        }
    }

    /// Release the driver's mapping and hand the first `len` bytes upstream
    /// without copying.
    ///
    /// The device must have completed its write into the buffer.
    pub(crate) fn into_bytes(self, len: u32) -> Bytes {
        let len = len.min(self.len) as usize;
        match self.memory {
            RxMemory::Single(block) => {
                let (mapping, mem) = block.into_parts();
                drop(mapping);
                Bytes::from_owner(OwnedSlice { mem, len })
            }
            RxMemory::Half(half) => half.into_bytes(len as u32),
        }
    }
}

struct OwnedSlice {
    mem: DmaMemory,
    len: usize,
}

impl AsRef<[u8]> for OwnedSlice {
    fn as_ref(&self) -> &[u8] {
        // Safety: unmapped before construction; no device access remains.
        unsafe { self.mem.slice(0, self.len) }
    }
}

/// Allocates receive buffers of one size for one queue.
pub(crate) struct RxAllocator {
    mapper: Arc<dyn DmaMapper>,
    buffer_len: u32,
    page_size: u32,
}

impl RxAllocator {
    pub(crate) fn new(mapper: Arc<dyn DmaMapper>, buffer_len: u32, min_page: u32) -> Self {
        let page_size = min_page.max(buffer_len.next_power_of_two());
        RxAllocator {
            mapper,
            buffer_len,
            page_size,
        }
    }

    #[cfg(test)]
    pub(crate) fn buffer_len(&self) -> u32 {
        self.buffer_len
    }

    /// Whether a page yields two buffers.
    pub(crate) fn splits_pages(&self) -> bool {
        self.buffer_len <= self.page_size / 2
    }

    pub(crate) fn alloc_single(&self) -> Result<RxBuffer, BlockError> {
        let block = MappedBlock::alloc(
            &self.mapper,
            self.buffer_len as usize,
            DmaDirection::FromDevice,
        )?;
        Ok(RxBuffer {
            dma: block.addr(),
            len: self.buffer_len,
            memory: RxMemory::Single(block),
        })
    }

    /// Allocate and map one page. Returns one buffer, or two when the buffer
    /// length fits in half a page.
    pub(crate) fn alloc_page(&self) -> Result<(RxBuffer, Option<RxBuffer>), BlockError> {
        let page = RxPage::alloc(&self.mapper, self.page_size as usize)?;
        let first = Self::wrap(page.half(0, self.buffer_len));
        let second = self
            .splits_pages()
            .then(|| Self::wrap(page.half(self.page_size / 2, self.buffer_len)));
        Ok((first, second))
    }

    fn wrap(half: PageHalf) -> RxBuffer {
        RxBuffer {
            dma: half.dma_addr(),
            len: half.len(),
            memory: RxMemory::Half(half),
        }
    }
}

pub(crate) const ALLOC_LEVEL_MAX: i32 = 0x3000;
/// Level above which page sharing is selected.
pub(crate) const ALLOC_LEVEL_PAGE_ON: i32 = 0x2000;
/// Level below which per-packet allocation is restored.
pub(crate) const ALLOC_LEVEL_PAGE_OFF: i32 = 0x1000;
const ALLOC_FACTOR_AGGREGATED: i32 = 1;
const ALLOC_FACTOR_SINGLE: i32 = -2;

/// Per-channel choice between per-packet and page-sharing allocation.
///
/// Deliveries through the aggregation path push the level up, single-packet
/// deliveries pull it down twice as hard. The strategy flips only when the
/// level crosses the far watermark.
#[derive(Debug)]
pub(crate) struct AllocLevel {
    method: RxAllocMethod,
    level: i32,
    pages: bool,
}

impl AllocLevel {
    pub(crate) fn new(method: RxAllocMethod) -> Self {
        AllocLevel {
            method,
            level: 0,
            pages: method == RxAllocMethod::Page,
        }
    }

    #[inline]
    pub(crate) fn on_aggregated(&mut self) {
        self.nudge(ALLOC_FACTOR_AGGREGATED);
    }

    #[inline]
    pub(crate) fn on_single(&mut self) {
        self.nudge(ALLOC_FACTOR_SINGLE);
    }

    fn nudge(&mut self, delta: i32) {
        self.level = (self.level + delta).clamp(0, ALLOC_LEVEL_MAX);
        if self.method != RxAllocMethod::Auto {
            return;
        }
        if !self.pages && self.level > ALLOC_LEVEL_PAGE_ON {
            self.pages = true;
        } else if self.pages && self.level < ALLOC_LEVEL_PAGE_OFF {
            self.pages = false;
        }
    }

    #[inline]
    pub(crate) fn use_pages(&self) -> bool {
        self.pages
    }

    #[cfg(test)]
    pub(crate) fn level(&self) -> i32 {
        self.level
    }
}
