//! Bus/device layer consumed during probe: device enable, register window,
//! DMA addressing width and interrupt vectors.

use crate::error::BusError;

/// A mapped register BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWindow {
    pub bar: u8,
    pub base: u64,
    pub len: u64,
}

pub trait Bus: Send + Sync + 'static {
    fn enable_device(&self) -> Result<(), BusError>;

    fn disable_device(&self);

    fn map_registers(&self, bar: u8) -> Result<RegisterWindow, BusError>;

    /// Restrict device addressing to `bits` bits.
    fn set_dma_mask(&self, bits: u8) -> Result<(), BusError>;

    /// Allocate exactly `vectors` MSI-X vectors. When fewer are available the
    /// bus reports how many with [`BusError::MsixInsufficient`].
    fn enable_msix(&self, vectors: usize) -> Result<Vec<u32>, BusError>;

    /// Allocate a single MSI vector.
    fn enable_msi(&self) -> Result<u32, BusError>;

    /// The shared legacy interrupt line.
    fn legacy_irq(&self) -> u32;

    /// Release whatever MSI-X/MSI vectors are enabled.
    fn disable_interrupts(&self);

    /// CPUs available for channel interrupts.
    fn online_cpus(&self) -> usize {
        num_cpus()
    }
}

pub(crate) fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 { 1 } else { ret as usize }
}
