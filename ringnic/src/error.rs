use std::io;

use thiserror::Error;

use crate::packet::Packet;

/// Errors returned by device lifecycle and reconfiguration operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Thread spawn, CPU pinning or another OS-level operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Configuration value out of range.
    #[error("config: {0}")]
    Config(String),
    /// Bus-level setup failed (device enable, register window, DMA mask).
    #[error("bus: {0}")]
    Bus(#[from] BusError),
    /// No interrupt delivery mode could be enabled.
    #[error("interrupts: {0}")]
    Interrupts(String),
    /// A DMA mapping needed for queue setup could not be created.
    #[error("DMA mapping: {0}")]
    Dma(#[from] DmaError),
    /// Buffer or queue memory could not be allocated.
    #[error("allocation failed: {0}")]
    Alloc(String),
    /// The hardware family rejected an operation.
    #[error("hardware: {0}")]
    Hardware(#[from] HwError),
    /// Queues did not report flush completion in time.
    #[error("queue flush timed out ({pending} queues pending)")]
    FlushTimeout { pending: usize },
    /// The device failed to recover and is out of service until re-probed.
    #[error("device disabled")]
    Disabled,
    /// The device is not open.
    #[error("device not open")]
    NotOpen,
    /// Channel or queue index out of range.
    #[error("invalid channel {0}")]
    InvalidChannel(usize),
}

/// Errors reported by a [`DmaMapper`](crate::dma::DmaMapper).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DmaError {
    /// The IOMMU or bounce pool has no room for another mapping.
    #[error("mapping space exhausted")]
    Exhausted,
    /// The span lies outside the device's addressable range.
    #[error("address outside DMA mask")]
    OutOfRange,
}

/// Errors reported by a [`NicFamily`](crate::family::NicFamily).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HwError {
    /// The device did not come out of reset.
    #[error("reset failed: {0}")]
    Reset(String),
    /// Initialisation of the hardware block failed.
    #[error("init failed: {0}")]
    Init(String),
    /// Device identification or capability probe failed.
    #[error("probe failed: {0}")]
    Probe(String),
    /// MAC/filter reconfiguration was rejected.
    #[error("MAC reconfiguration failed: {0}")]
    Mac(String),
}

/// Errors reported by a [`Bus`](crate::bus::Bus).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("device enable failed")]
    EnableFailed,
    #[error("register window {0} unavailable")]
    RegisterWindow(u8),
    #[error("DMA mask of {0} bits rejected")]
    DmaMask(u8),
    /// Fewer MSI-X vectors than requested are available.
    #[error("only {available} MSI-X vectors available")]
    MsixInsufficient { available: usize },
    #[error("interrupt mode unsupported")]
    Unsupported,
}

/// Why a packet was dropped by the transmit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// A fragment or TSO header could not be DMA-mapped.
    MappingFailed,
    /// Segmentation was requested but the headers are not TCP over IPv4/IPv6.
    Malformed,
    /// The device has been disabled.
    DeviceDisabled,
    /// The packet needs more descriptors than the ring holds.
    Oversized,
    /// The addressed transmit queue does not exist.
    NoQueue,
}

/// Outcome of a failed transmit.
#[derive(Debug, Error)]
pub enum XmitError {
    /// The ring is full. The packet is handed back; the queue stays stopped
    /// until completions free at least half of the ring.
    #[error("transmit queue busy")]
    Busy(Packet),
    /// The packet was consumed and discarded.
    #[error("packet dropped: {0:?}")]
    Dropped(DropReason),
}

impl XmitError {
    /// Returns the packet for a busy result so the caller can requeue it.
    pub fn into_packet(self) -> Option<Packet> {
        match self {
            XmitError::Busy(p) => Some(p),
            XmitError::Dropped(_) => None,
        }
    }
}
