//! ringnic — the data path of a multi-queue network adapter driver.
//!
//! A [`Nic`] owns a set of channels, each with an event queue, an optional
//! receive ring and up to four transmit rings (plain, checksum offload,
//! high priority and both). Transmit packets are split into descriptors
//! that never cross the hardware's boundary, TCP segmentation is done in
//! software with per-segment header copies, receive buffers are recycled
//! and coalesced, interrupt moderation adapts to traffic, and a reset
//! worker recovers the device from faults by escalating reset severity.
//!
//! Hardware is reached only through three traits: [`Bus`] (enable,
//! register window, DMA mask, interrupt vectors), [`NicFamily`] (one
//! hardware generation) and [`DmaMapper`]. Received packets and queue
//! wakeups go to a [`NetStack`]. The [`sim`] module provides software
//! models of all four.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use ringnic::sim::{SimBus, SimDma, SimFamily, SimStack};
//! use ringnic::{ConfigBuilder, Nic, NicDeps, Packet};
//!
//! let family = Arc::new(SimFamily::new());
//! let config = ConfigBuilder::new()
//!     .channels(1)
//!     .spawn_pollers(false)
//!     .service_thread(false)
//!     .build()
//!     .unwrap();
//! let nic = Nic::probe(
//!     NicDeps {
//!         bus: Arc::new(SimBus::new(4)),
//!         family: family.clone(),
//!         mapper: Arc::new(SimDma::new()),
//!         stack: Arc::new(SimStack::new()),
//!     },
//!     config,
//! )
//! .unwrap();
//! nic.open().unwrap();
//! nic.transmit(Packet::from(vec![0u8; 60])).unwrap();
//! assert_eq!(family.wire_frames().len(), 1);
//! nic.remove();
//! ```
//!
//! # Threads
//!
//! With the default configuration `open` starts one poller thread per
//! channel (woken by its interrupt) and a service thread that executes
//! resets and runs the transmit watchdog and slow-fill timers. Both can be
//! turned off, in which case the caller drives [`Nic::poll_channel`],
//! [`Nic::process_resets`] and [`Nic::run_timers`].

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod buffer;
pub(crate) mod channel;
pub(crate) mod counter;
pub(crate) mod datapath;
pub(crate) mod moderation;
pub(crate) mod nic;
pub(crate) mod rx;
pub(crate) mod service;
pub(crate) mod worker;

// ── Public modules ──────────────────────────────────────────────────────
pub mod bus;
pub mod config;
pub mod dma;
pub mod error;
pub mod event;
pub mod family;
pub mod headers;
pub mod interrupt;
pub mod metrics;
pub mod packet;
pub mod reset;
pub mod sim;
pub mod stack;
pub mod tx;

// ── Re-exports: Device ──────────────────────────────────────────────────

pub use nic::{Nic, NicDeps};

// ── Re-exports: Configuration ───────────────────────────────────────────

pub use config::{Config, ConfigBuilder, ModerationConfig, RxAllocMethod, RxConfig, WorkerConfig};
pub use interrupt::{InterruptMode, InterruptPlan};

// ── Re-exports: Errors ──────────────────────────────────────────────────

pub use error::{BusError, DmaError, DropReason, Error, HwError, XmitError};

// ── Re-exports: Packets and queues ──────────────────────────────────────

pub use packet::{Packet, RxPacket};
pub use tx::{TxQueueId, TxQueueKind};

// ── Re-exports: Collaborator traits ─────────────────────────────────────

pub use bus::{Bus, RegisterWindow};
pub use dma::{DmaAddr, DmaDirection, DmaMapper, IdentityMapper};
pub use family::{FamilyCaps, MacConfig, NicFamily, RxDescriptor, TxDescriptor};
pub use stack::NetStack;

// ── Re-exports: Resets and statistics ───────────────────────────────────

pub use counter::Counter;
pub use metrics::{MacStats, NicMetrics, Stats};
pub use reset::{DeviceState, ResetKind, ResetReason};
