//! Interrupt mode selection, channel counts and interrupt routing.
//!
//! Preference order: one MSI-X vector per channel (retrying with however
//! many vectors the bus can grant), a single MSI vector, then the shared
//! legacy line.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_channel::Sender;
use log::{info, warn};

use crate::bus::Bus;
use crate::config::Config;
use crate::error::{BusError, Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum InterruptMode {
    Legacy,
    Msi,
    Msix,
}

/// Result of interrupt allocation: delivery mode, channel counts and the
/// vector of each channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterruptPlan {
    pub mode: InterruptMode,
    pub n_channels: usize,
    pub n_rx_channels: usize,
    pub n_tx_channels: usize,
    /// Interrupt vector per channel. Channels may share a vector.
    pub vectors: Vec<u32>,
}

impl InterruptPlan {
    /// Index of the first channel carrying transmit queues.
    pub fn tx_channel_offset(&self) -> usize {
        self.n_channels - self.n_tx_channels
    }

    pub fn has_rx(&self, channel: usize) -> bool {
        channel < self.n_rx_channels
    }

    pub fn has_tx(&self, channel: usize) -> bool {
        channel >= self.tx_channel_offset() && channel < self.n_channels
    }

    /// Same routing with a different channel count, within the vectors
    /// already allocated.
    pub(crate) fn with_channels(&self, wanted: usize, separate_tx: bool) -> Option<InterruptPlan> {
        if self.mode != InterruptMode::Msix || wanted == 0 {
            return None;
        }
        let n = if separate_tx { wanted * 2 } else { wanted };
        if n > self.vectors.len() {
            return None;
        }
        Some(split_channels(InterruptMode::Msix, self.vectors[..n].to_vec(), separate_tx))
    }
}

fn split_channels(mode: InterruptMode, vectors: Vec<u32>, separate_tx: bool) -> InterruptPlan {
    let n = vectors.len();
    let (n_rx, n_tx) = if separate_tx && n > 1 {
        let tx = (n / 2).max(1);
        ((n - tx).max(1), tx)
    } else {
        (n, n)
    };
    InterruptPlan {
        mode,
        n_channels: n,
        n_rx_channels: n_rx,
        n_tx_channels: n_tx,
        vectors,
    }
}

/// Choose an interrupt mode and channel layout.
pub fn allocate(bus: &dyn Bus, config: &Config, max_channels: usize) -> Result<InterruptPlan, Error> {
    let max_channels = max_channels.max(1);

    if config.interrupt_mode >= InterruptMode::Msix {
        let parallelism = if config.channels == 0 {
            bus.online_cpus()
        } else {
            config.channels
        };
        let mut wanted = parallelism.max(1);
        if config.separate_tx_channels {
            wanted *= 2;
        }
        wanted = wanted.min(max_channels);

        let granted = match bus.enable_msix(wanted) {
            Ok(v) => Some(v),
            Err(BusError::MsixInsufficient { available }) if available > 0 && available < wanted => {
                warn!("insufficient MSI-X vectors available ({available} < {wanted}); performance may be reduced");
                bus.enable_msix(available).ok()
            }
            Err(e) => {
                warn!("could not enable MSI-X: {e}");
                None
            }
        };
        if let Some(vectors) = granted.filter(|v| !v.is_empty()) {
            let plan = split_channels(InterruptMode::Msix, vectors, config.separate_tx_channels);
            info!(
                "MSI-X: {} channels ({} rx, {} tx)",
                plan.n_channels, plan.n_rx_channels, plan.n_tx_channels
            );
            return Ok(plan);
        }
    }

    if config.interrupt_mode >= InterruptMode::Msi {
        match bus.enable_msi() {
            Ok(vector) => {
                info!("MSI: single channel");
                return Ok(split_channels(InterruptMode::Msi, vec![vector], false));
            }
            Err(e) => warn!("could not enable MSI: {e}"),
        }
    }

    // The legacy line is shared by every channel.
    let irq = bus.legacy_irq();
    let n = if config.separate_tx_channels && max_channels > 1 {
        2
    } else {
        1
    };
    info!("legacy interrupt {irq}: {n} channels");
    Ok(split_channels(InterruptMode::Legacy, vec![irq; n], config.separate_tx_channels))
}

/// Routes hardware interrupts to channel pollers.
///
/// Handed to the hardware family when interrupts are enabled. Firing a
/// vector marks every channel on it as pending and wakes its poller, if one
/// is running.
#[derive(Clone)]
pub struct IrqHandler {
    inner: Arc<IrqInner>,
}

struct IrqInner {
    vectors: Vec<u32>,
    pending: Vec<AtomicBool>,
    wakers: RwLock<Vec<Option<Sender<()>>>>,
    fired: AtomicU64,
}

impl IrqHandler {
    pub(crate) fn new(plan: &InterruptPlan) -> Self {
        IrqHandler {
            inner: Arc::new(IrqInner {
                vectors: plan.vectors.clone(),
                pending: (0..plan.n_channels).map(|_| AtomicBool::new(false)).collect(),
                wakers: RwLock::new(vec![None; plan.n_channels]),
                fired: AtomicU64::new(0),
            }),
        }
    }

    /// Deliver an interrupt on `vector`.
    pub fn fire(&self, vector: u32) {
        self.inner.fired.fetch_add(1, Ordering::Relaxed);
        let wakers = self.inner.wakers.read().unwrap_or_else(|e| e.into_inner());
        for (channel, &v) in self.inner.vectors.iter().enumerate() {
            if v != vector {
                continue;
            }
            self.inner.pending[channel].store(true, Ordering::Release);
            if let Some(tx) = &wakers[channel] {
                // A full channel means a wakeup is already queued.
                let _ = tx.try_send(());
            }
        }
    }

    /// Vector serving `channel`.
    pub fn vector(&self, channel: usize) -> Option<u32> {
        self.inner.vectors.get(channel).copied()
    }

    /// Clear and return the pending flag of `channel`.
    pub fn take_pending(&self, channel: usize) -> bool {
        self.inner
            .pending
            .get(channel)
            .is_some_and(|p| p.swap(false, Ordering::AcqRel))
    }

    /// Interrupts delivered so far.
    pub fn fired(&self) -> u64 {
        self.inner.fired.load(Ordering::Relaxed)
    }

    pub(crate) fn set_waker(&self, channel: usize, waker: Option<Sender<()>>) {
        let mut wakers = self.inner.wakers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = wakers.get_mut(channel) {
            *slot = waker;
        }
    }
}

impl std::fmt::Debug for IrqHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrqHandler")
            .field("vectors", &self.inner.vectors)
            .field("fired", &self.fired())
            .finish()
    }
}
