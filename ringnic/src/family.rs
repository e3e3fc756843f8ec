//! The per-generation hardware interface.
//!
//! Each controller generation implements [`NicFamily`]. The data path talks
//! to hardware only through this trait: queue and event-queue programming,
//! descriptor pushes, flushes, moderation, interrupts, MAC configuration,
//! statistics and reset.

use std::sync::Arc;

use crate::bus::RegisterWindow;
use crate::dma::DmaAddr;
use crate::error::HwError;
use crate::event::EventRing;
use crate::interrupt::IrqHandler;
use crate::metrics::MacStats;
use crate::reset::{ResetKind, ResetReason, default_reset_policy};
use crate::tx::TxQueueId;

/// A transmit descriptor as pushed to hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxDescriptor {
    pub addr: DmaAddr,
    pub len: u32,
    /// More descriptors of the same frame follow.
    pub cont: bool,
}

/// A receive descriptor as pushed to hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxDescriptor {
    pub addr: DmaAddr,
    pub len: u32,
}

/// Static properties and errata of a hardware generation.
#[derive(Debug, Clone)]
pub struct FamilyCaps {
    pub name: &'static str,
    /// Channels the event block can serve.
    pub max_channels: usize,
    /// Widest DMA mask the device supports.
    pub max_dma_bits: u8,
    /// Bytes the device may write past the frame into a receive buffer.
    pub rx_buffer_padding: u32,
    /// Transmit descriptors must not cross this boundary.
    pub tx_boundary: u32,
    /// Unaligned transmit buffers are limited to `512 - (addr & 15)` bytes
    /// per descriptor.
    pub tx_unaligned_erratum: bool,
    /// The device can write past the end of a receive buffer; such buffers
    /// must never be reused.
    pub rx_overlength_erratum: bool,
    /// Granule for page-sharing receive buffers.
    pub page_size: u32,
}

impl Default for FamilyCaps {
    fn default() -> Self {
        FamilyCaps {
            name: "generic",
            max_channels: 32,
            max_dma_bits: 64,
            rx_buffer_padding: 0,
            tx_boundary: 4096,
            tx_unaligned_erratum: false,
            rx_overlength_erratum: false,
            page_size: 4096,
        }
    }
}

/// MAC-level configuration restored after every reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacConfig {
    pub mtu: u32,
    pub address: [u8; 6],
    pub multicast: Vec<[u8; 6]>,
    pub promiscuous: bool,
}

impl Default for MacConfig {
    fn default() -> Self {
        MacConfig {
            mtu: 1500,
            address: [0x02, 0, 0, 0, 0, 1],
            multicast: Vec::new(),
            promiscuous: false,
        }
    }
}

pub trait NicFamily: Send + Sync + 'static {
    fn caps(&self) -> FamilyCaps;

    /// Identify the device behind the register window.
    fn probe(&self, regs: RegisterWindow) -> Result<(), HwError>;

    /// Bring the controller to a state where queues can be created.
    fn init(&self) -> Result<(), HwError>;

    fn fini(&self);

    fn reset(&self, kind: ResetKind) -> Result<(), HwError>;

    /// Map a diagnostic reason to the reset scope this generation needs.
    fn map_reset_reason(&self, reason: ResetReason) -> ResetKind {
        default_reset_policy(reason)
    }

    /// Fold hardware statistics into `stats`. Called under the device
    /// statistics lock.
    fn update_stats(&self, stats: &mut MacStats);

    fn reconfigure_mac(&self, mac: &MacConfig) -> Result<(), HwError>;

    // ── Event queues ────────────────────────────────────────────────

    fn init_event_queue(&self, channel: usize, ring: Arc<EventRing>, vector: u32);

    fn fini_event_queue(&self, channel: usize);

    /// Acknowledge events up to `read_count` and re-enable the channel's
    /// interrupt.
    fn rearm_event_queue(&self, channel: usize, read_count: u32);

    fn push_irq_moderation(&self, channel: usize, usecs: u32);

    /// Ask the device to post an [`Event::Refill`](crate::event::Event::Refill)
    /// on the channel's event queue.
    fn generate_refill_event(&self, channel: usize);

    // ── Transmit queues ─────────────────────────────────────────────

    fn init_tx_queue(&self, queue: TxQueueId, entries: u32);

    /// Make descriptors `first .. first + descs.len()` (ring counts, not
    /// masked) visible to hardware and ring the doorbell.
    fn push_tx_descriptors(&self, queue: TxQueueId, first: u32, descs: &[TxDescriptor]);

    /// Request a flush; completion is reported with a flush-done event.
    fn flush_tx_queue(&self, queue: TxQueueId);

    fn fini_tx_queue(&self, queue: TxQueueId);

    // ── Receive queues ──────────────────────────────────────────────

    fn init_rx_queue(&self, channel: usize, entries: u32);

    fn push_rx_descriptors(&self, channel: usize, first: u32, descs: &[RxDescriptor]);

    fn flush_rx_queue(&self, channel: usize);

    fn fini_rx_queue(&self, channel: usize);

    // ── Interrupts ──────────────────────────────────────────────────

    fn enable_interrupts(&self, handler: IrqHandler);

    fn disable_interrupts(&self);
}
