//! Receive descriptor rings.
//!
//! All cursors live in the owning channel's poll context: refill, completion
//! dispatch and recycling run there, so no atomics are needed.
//! `removed_count <= notified_count <= added_count` holds throughout, and
//! `added_count - removed_count` never exceeds `max_fill`.

pub(crate) mod gro;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::buffer::{RxAllocator, RxBuffer};
use crate::config::RxConfig;
use crate::event::RxEventFlags;
use crate::family::NicFamily;
use crate::metrics::RxMetrics;

/// Buffers withheld from reuse after the device wrote past their end.
/// Shared by every receive queue of a device and emptied at removal.
pub(crate) type Quarantine = Arc<Mutex<Vec<RxBuffer>>>;

/// Outcome of one receive completion.
pub(crate) enum RxCompletion {
    /// An accepted frame of `len` bytes.
    Deliver {
        buf: RxBuffer,
        len: u32,
        csum_verified: bool,
    },
    /// Discarded; the buffer went back on the ring.
    Recycled,
    /// Overlength write on hardware with the erratum; the buffer is
    /// quarantined and the ring needs recovery.
    Leaked,
    /// The completion does not match the next expected descriptor.
    BadIndex,
}

/// Ring fill thresholds derived from the ring size and refill percentages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FillLimits {
    pub(crate) max_fill: u32,
    pub(crate) trigger: u32,
    pub(crate) limit: u32,
}

impl FillLimits {
    pub(crate) fn new(entries: u32, cfg: &RxConfig) -> Self {
        let max_fill = entries - 2;
        let trigger = max_fill * cfg.refill_threshold_pct / 100;
        let limit = (max_fill * cfg.refill_limit_pct / 100).clamp(1, max_fill);
        FillLimits {
            max_fill,
            trigger: trigger.min(limit),
            limit,
        }
    }
}

pub(crate) struct RxQueue {
    channel: usize,
    mask: u32,
    slots: Box<[Option<RxBuffer>]>,
    added_count: u32,
    notified_count: u32,
    removed_count: u32,
    fill: FillLimits,
    /// Lowest fill level seen at refill time since the last reset.
    min_fill: u32,
    batch: u32,
    allocator: RxAllocator,
    padding: u32,
    overlength_erratum: bool,
    slow_fill_delay: Duration,
    slow_fill_at: Option<Instant>,
    quarantine: Quarantine,
    family: Arc<dyn NicFamily>,
    metrics: RxMetrics,
}

pub(crate) struct RxQueueParams {
    pub(crate) entries: u32,
    pub(crate) padding: u32,
    pub(crate) overlength_erratum: bool,
}

impl RxQueue {
    pub(crate) fn new(
        channel: usize,
        params: RxQueueParams,
        cfg: &RxConfig,
        allocator: RxAllocator,
        quarantine: Quarantine,
        family: Arc<dyn NicFamily>,
        metrics: RxMetrics,
    ) -> Self {
        assert!(params.entries.is_power_of_two(), "entries must be power of 2");
        let fill = FillLimits::new(params.entries, cfg);
        RxQueue {
            channel,
            mask: params.entries - 1,
            slots: (0..params.entries).map(|_| None).collect(),
            added_count: 0,
            notified_count: 0,
            removed_count: 0,
            fill,
            min_fill: u32::MAX,
            batch: cfg.batch,
            allocator,
            padding: params.padding,
            overlength_erratum: params.overlength_erratum,
            slow_fill_delay: Duration::from_millis(cfg.slow_fill_delay_ms),
            slow_fill_at: None,
            quarantine,
            family,
            metrics,
        }
    }

    pub(crate) fn entries(&self) -> u32 {
        self.mask + 1
    }

    /// Buffers posted and not yet completed.
    pub(crate) fn fill_level(&self) -> u32 {
        self.added_count.wrapping_sub(self.removed_count)
    }

    #[cfg(test)]
    pub(crate) fn limits(&self) -> FillLimits {
        self.fill
    }

    pub(crate) fn min_fill(&self) -> Option<u32> {
        (self.min_fill != u32::MAX).then_some(self.min_fill)
    }

    #[cfg(test)]
    pub(crate) fn buffer_len(&self) -> u32 {
        self.allocator.buffer_len()
    }

    fn post(&mut self, buf: RxBuffer) {
        let idx = (self.added_count & self.mask) as usize;
        debug_assert!(self.slots[idx].is_none(), "posting over a live buffer");
        self.slots[idx] = Some(buf);
        self.added_count = self.added_count.wrapping_add(1);
    }

    /// Top the ring up to the fill limit once it has dropped below the
    /// trigger, allocating in batches. Returns the number of buffers added.
    pub(crate) fn refill(&mut self, use_pages: bool) -> u32 {
        let fill = self.fill_level();
        if fill >= self.fill.trigger {
            self.notify();
            return 0;
        }
        self.min_fill = self.min_fill.min(fill);

        let want = self.fill.limit - fill;
        let mut added = 0;
        'batches: while added < want {
            let n = self.batch.min(want - added);
            let mut got = 0;
            while got < n {
                let res = if use_pages {
                    self.allocator.alloc_page().map(|(a, b)| {
                        self.post(a);
                        got += 1;
                        // An odd count leaves the second half unused.
                        if let Some(b) = b.filter(|_| got < n) {
                            self.post(b);
                            got += 1;
                        }
                    })
                } else {
                    self.allocator.alloc_single().map(|b| {
                        self.post(b);
                        got += 1;
                    })
                };
                if let Err(e) = res {
                    added += got;
                    self.metrics.alloc_failures.increment();
                    debug!("rx{}: buffer allocation failed: {e:?}", self.channel);
                    if self.fill_level() == 0 {
                        self.schedule_slow_fill();
                    }
                    break 'batches;
                }
            }
            added += got;
        }
        self.notify();
        added
    }

    /// Hand descriptors `notified_count .. added_count` to hardware.
    fn notify(&mut self) {
        let n = self.added_count.wrapping_sub(self.notified_count);
        if n == 0 {
            return;
        }
        let first = self.notified_count;
        let descs: Vec<_> = (0..n)
            .filter_map(|i| {
                let idx = (first.wrapping_add(i) & self.mask) as usize;
                self.slots[idx].as_ref().map(RxBuffer::descriptor)
            })
            .collect();
        self.notified_count = self.added_count;
        self.family.push_rx_descriptors(self.channel, first, &descs);
    }

    fn schedule_slow_fill(&mut self) {
        if self.slow_fill_at.is_none() {
            self.metrics.slow_fills.increment();
            self.slow_fill_at = Some(Instant::now() + self.slow_fill_delay);
        }
    }

    /// Whether a delayed refill is due. Clears the deadline when it is.
    pub(crate) fn take_slow_fill(&mut self, now: Instant) -> bool {
        match self.slow_fill_at {
            Some(at) if now >= at => {
                self.slow_fill_at = None;
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn slow_fill_pending(&self) -> bool {
        self.slow_fill_at.is_some()
    }

    /// Process a receive completion for ring index `index`.
    pub(crate) fn complete(&mut self, index: u16, len: u16, flags: RxEventFlags) -> RxCompletion {
        let expected = self.removed_count & self.mask;
        if self.fill_level() == 0 || u32::from(index) & self.mask != expected {
            warn!(
                "rx{}: completion for index {index}, expected {expected}",
                self.channel
            );
            self.metrics.bad_index.increment();
            return RxCompletion::BadIndex;
        }
        let Some(buf) = self.slots[expected as usize].take() else {
            self.metrics.bad_index.increment();
            return RxCompletion::BadIndex;
        };
        self.removed_count = self.removed_count.wrapping_add(1);

        let len = u32::from(len);
        let mut discard = false;
        if flags.contains(RxEventFlags::DISCARD) {
            self.metrics.hw_discards.increment();
            discard = true;
        }
        if len > buf.len().saturating_sub(self.padding) {
            self.metrics.overlength.increment();
            discard = true;
            if self.overlength_erratum && len > buf.len() {
                warn!(
                    "rx{}: {len} byte write into {} byte buffer, quarantining it",
                    self.channel,
                    buf.len()
                );
                self.metrics.leaked.increment();
                self.quarantine
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(buf);
                return RxCompletion::Leaked;
            }
        }
        if discard {
            self.metrics.recycled.increment();
            self.post(buf);
            return RxCompletion::Recycled;
        }
        RxCompletion::Deliver {
            buf,
            len,
            csum_verified: flags.contains(RxEventFlags::CSUM_OK),
        }
    }

    /// Drop every posted buffer and reset the cursors.
    pub(crate) fn release_all(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.added_count = 0;
        self.notified_count = 0;
        self.removed_count = 0;
        self.min_fill = u32::MAX;
        self.slow_fill_at = None;
    }
}
