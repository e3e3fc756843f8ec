//! DMA mapping services.
//!
//! The data path never dereferences a bus address; it asks a [`DmaMapper`]
//! to translate host memory and later to tear the translation down. The
//! memory itself lives in [`DmaMemory`] blocks whose pointers stay stable for
//! as long as a mapping over them exists.

use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::error::DmaError;

/// A bus address as seen by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DmaAddr(pub u64);

impl DmaAddr {
    #[inline]
    pub fn offset(self, n: u64) -> Self {
        DmaAddr(self.0 + n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    ToDevice,
    FromDevice,
}

/// Host-to-bus address translation.
pub trait DmaMapper: Send + Sync + 'static {
    /// Map `len` bytes starting at `ptr` for device access.
    ///
    /// The caller keeps the memory alive until the matching [`unmap`](Self::unmap).
    fn map(&self, ptr: *const u8, len: usize, dir: DmaDirection) -> Result<DmaAddr, DmaError>;

    /// Release a mapping created by [`map`](Self::map).
    fn unmap(&self, addr: DmaAddr, len: usize, dir: DmaDirection);
}

/// Mapper for devices without an IOMMU: the bus address is the host address.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityMapper;

impl DmaMapper for IdentityMapper {
    fn map(&self, ptr: *const u8, _len: usize, _dir: DmaDirection) -> Result<DmaAddr, DmaError> {
        Ok(DmaAddr(ptr as u64))
    }

    fn unmap(&self, _addr: DmaAddr, _len: usize, _dir: DmaDirection) {}
}

/// A live mapping, released on drop.
pub(crate) struct Mapping {
    addr: DmaAddr,
    len: usize,
    dir: DmaDirection,
    mapper: Arc<dyn DmaMapper>,
}

impl Mapping {
    pub(crate) fn new(
        mapper: &Arc<dyn DmaMapper>,
        ptr: *const u8,
        len: usize,
        dir: DmaDirection,
    ) -> Result<Self, DmaError> {
        let addr = mapper.map(ptr, len, dir)?;
        Ok(Mapping {
            addr,
            len,
            dir,
            mapper: Arc::clone(mapper),
        })
    }

    #[inline]
    pub(crate) fn addr(&self) -> DmaAddr {
        self.addr
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        self.mapper.unmap(self.addr, self.len, self.dir);
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("addr", &self.addr)
            .field("len", &self.len)
            .finish()
    }
}

/// A zeroed heap block with a stable address that the device may read or
/// write while software holds only a raw view of it.
pub(crate) struct DmaMemory {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the block is plain bytes; concurrent access is coordinated by the
// ring cursors that hand regions between software and device.
unsafe impl Send for DmaMemory {}
unsafe impl Sync for DmaMemory {}

impl DmaMemory {
    /// Allocate `len` zeroed bytes, reporting exhaustion instead of aborting.
    pub(crate) fn try_alloc(len: usize) -> Option<Self> {
        let mut v: Vec<u8> = Vec::new();
        v.try_reserve_exact(len).ok()?;
        v.resize(len, 0);
        let raw = Box::into_raw(v.into_boxed_slice());
        let ptr = NonNull::new(raw.cast::<u8>())?;
        Some(DmaMemory { ptr, len })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// View `[off, off + len)`.
    ///
    /// # Safety
    ///
    /// The device must not be writing the region, and no mutable view of it
    /// may be live.
    pub(crate) unsafe fn slice(&self, off: usize, len: usize) -> &[u8] {
        assert!(off + len <= self.len, "DMA view out of bounds");
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(off), len) }
    }

    /// Mutable view of `[off, off + len)`.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive ownership of the region for the
    /// lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, off: usize, len: usize) -> &mut [u8] {
        assert!(off + len <= self.len, "DMA view out of bounds");
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(off), len) }
    }
}

impl Drop for DmaMemory {
    fn drop(&mut self) {
        // Safety: ptr/len came from Box::into_raw of a boxed slice of this length.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

/// Memory plus a mapping over all of it. The mapping is released before the
/// memory is freed.
pub(crate) struct MappedBlock {
    mapping: Mapping,
    mem: DmaMemory,
}

impl MappedBlock {
    pub(crate) fn alloc(
        mapper: &Arc<dyn DmaMapper>,
        len: usize,
        dir: DmaDirection,
    ) -> Result<Self, BlockError> {
        let mem = DmaMemory::try_alloc(len).ok_or(BlockError::NoMemory)?;
        let mapping = Mapping::new(mapper, mem.as_ptr(), len, dir).map_err(BlockError::Map)?;
        Ok(MappedBlock { mapping, mem })
    }

    #[inline]
    pub(crate) fn addr(&self) -> DmaAddr {
        self.mapping.addr()
    }

    #[inline]
    pub(crate) fn mem(&self) -> &DmaMemory {
        &self.mem
    }

    /// Split into the mapping and the memory, for owners that release the
    /// mapping earlier than the memory.
    pub(crate) fn into_parts(self) -> (Mapping, DmaMemory) {
        (self.mapping, self.mem)
    }
}

/// Why a [`MappedBlock`] could not be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BlockError {
    NoMemory,
    Map(DmaError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_mapping_is_host_address() {
        let mem = DmaMemory::try_alloc(64).unwrap();
        let mapper: Arc<dyn DmaMapper> = Arc::new(IdentityMapper);
        let m = Mapping::new(&mapper, mem.as_ptr(), mem.len(), DmaDirection::ToDevice).unwrap();
        assert_eq!(m.addr().0, mem.as_ptr() as u64);
    }

    #[test]
    fn memory_starts_zeroed() {
        let mem = DmaMemory::try_alloc(128).unwrap();
        let view = unsafe { mem.slice(0, 128) };
        assert!(view.iter().all(|&b| b == 0));
    }

    #[test]
    fn block_views_are_writable() {
        let mapper: Arc<dyn DmaMapper> = Arc::new(IdentityMapper);
        let block = MappedBlock::alloc(&mapper, 32, DmaDirection::FromDevice).unwrap();
        unsafe { block.mem().slice_mut(4, 2) }.copy_from_slice(&[7, 9]);
        assert_eq!(unsafe { block.mem().slice(4, 2) }, &[7, 9]);
        assert_eq!(block.addr().offset(4).0, block.mem().as_ptr() as u64 + 4);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn view_bounds_checked() {
        let mem = DmaMemory::try_alloc(8).unwrap();
        let _ = unsafe { mem.slice(4, 8) };
    }
}
