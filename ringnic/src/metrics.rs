//! Per-device data-path metrics.
//!
//! Counters for the transmit path, the receive path and device-level
//! recovery. Each area is one sharded [`CounterGroup`]; [`NicMetrics`] hands
//! out named [`Counter`] handles that queues and channels keep next to the
//! state they describe.

use std::sync::Arc;

use crate::counter::{Counter, CounterGroup};

/// Counter slot indices for transmit metrics.
pub mod tx {
    pub const PACKETS: usize = 0;
    pub const BYTES: usize = 1;
    pub const TSO_BURSTS: usize = 2;
    pub const TSO_SEGMENTS: usize = 3;
    pub const TSO_LONG_HEADERS: usize = 4;
    pub const MAP_FAILURES: usize = 5;
    pub const BUSY: usize = 6;
    pub const MALFORMED: usize = 7;
    pub const SPURIOUS_COMPLETIONS: usize = 8;
    pub const QUEUE_STOPS: usize = 9;
    pub const QUEUE_WAKES: usize = 10;
}

/// Counter slot indices for receive metrics.
pub mod rx {
    pub const PACKETS: usize = 0;
    pub const BYTES: usize = 1;
    pub const OVERLENGTH: usize = 2;
    pub const LEAKED: usize = 3;
    pub const HW_DISCARDS: usize = 4;
    pub const RECYCLED: usize = 5;
    pub const ALLOC_FAILURES: usize = 6;
    pub const SLOW_FILLS: usize = 7;
    pub const GRO_MERGED: usize = 8;
    pub const BAD_INDEX: usize = 9;
}

/// Counter slot indices for device-level metrics.
pub mod dev {
    pub const RESETS: usize = 0;
    pub const RESET_FAILURES: usize = 1;
    pub const FLUSH_FAILURES: usize = 2;
    pub const WATCHDOG_FIRES: usize = 3;
    pub const POLLS: usize = 4;
    pub const MODERATION_CHANGES: usize = 5;
}

/// Transmit-side counters shared by every transmit queue of a device.
#[derive(Clone, Debug)]
pub struct TxMetrics {
    pub packets: Counter,
    pub bytes: Counter,
    pub tso_bursts: Counter,
    pub tso_segments: Counter,
    pub tso_long_headers: Counter,
    pub map_failures: Counter,
    pub busy: Counter,
    pub malformed: Counter,
    pub spurious_completions: Counter,
    pub queue_stops: Counter,
    pub queue_wakes: Counter,
}

/// Receive-side counters shared by every receive queue of a device.
#[derive(Clone, Debug)]
pub struct RxMetrics {
    pub packets: Counter,
    pub bytes: Counter,
    pub overlength: Counter,
    pub leaked: Counter,
    pub hw_discards: Counter,
    pub recycled: Counter,
    pub alloc_failures: Counter,
    pub slow_fills: Counter,
    pub gro_merged: Counter,
    pub bad_index: Counter,
}

#[derive(Clone, Debug)]
pub struct DevMetrics {
    pub resets: Counter,
    pub reset_failures: Counter,
    pub flush_failures: Counter,
    pub watchdog_fires: Counter,
    pub polls: Counter,
    pub moderation_changes: Counter,
}

/// All counters of one device.
#[derive(Clone, Debug)]
pub struct NicMetrics {
    pub tx: TxMetrics,
    pub rx: RxMetrics,
    pub dev: DevMetrics,
}

impl NicMetrics {
    pub fn new() -> Self {
        let t = Arc::new(CounterGroup::new());
        let r = Arc::new(CounterGroup::new());
        let d = Arc::new(CounterGroup::new());
        Self {
            tx: TxMetrics {
                packets: Counter::new(&t, tx::PACKETS),
                bytes: Counter::new(&t, tx::BYTES),
                tso_bursts: Counter::new(&t, tx::TSO_BURSTS),
                tso_segments: Counter::new(&t, tx::TSO_SEGMENTS),
                tso_long_headers: Counter::new(&t, tx::TSO_LONG_HEADERS),
                map_failures: Counter::new(&t, tx::MAP_FAILURES),
                busy: Counter::new(&t, tx::BUSY),
                malformed: Counter::new(&t, tx::MALFORMED),
                spurious_completions: Counter::new(&t, tx::SPURIOUS_COMPLETIONS),
                queue_stops: Counter::new(&t, tx::QUEUE_STOPS),
                queue_wakes: Counter::new(&t, tx::QUEUE_WAKES),
            },
            rx: RxMetrics {
                packets: Counter::new(&r, rx::PACKETS),
                bytes: Counter::new(&r, rx::BYTES),
                overlength: Counter::new(&r, rx::OVERLENGTH),
                leaked: Counter::new(&r, rx::LEAKED),
                hw_discards: Counter::new(&r, rx::HW_DISCARDS),
                recycled: Counter::new(&r, rx::RECYCLED),
                alloc_failures: Counter::new(&r, rx::ALLOC_FAILURES),
                slow_fills: Counter::new(&r, rx::SLOW_FILLS),
                gro_merged: Counter::new(&r, rx::GRO_MERGED),
                bad_index: Counter::new(&r, rx::BAD_INDEX),
            },
            dev: DevMetrics {
                resets: Counter::new(&d, dev::RESETS),
                reset_failures: Counter::new(&d, dev::RESET_FAILURES),
                flush_failures: Counter::new(&d, dev::FLUSH_FAILURES),
                watchdog_fires: Counter::new(&d, dev::WATCHDOG_FIRES),
                polls: Counter::new(&d, dev::POLLS),
                moderation_changes: Counter::new(&d, dev::MODERATION_CHANGES),
            },
        }
    }

    /// Name, description and handle of every counter, for registration with
    /// an exposition layer.
    pub fn counters(&self) -> Vec<(&'static str, &'static str, &Counter)> {
        vec![
            ("ringnic/tx/packets", "Packets completed by hardware", &self.tx.packets),
            ("ringnic/tx/bytes", "Bytes completed by hardware", &self.tx.bytes),
            ("ringnic/tx/tso_bursts", "Segmentation requests accepted", &self.tx.tso_bursts),
            ("ringnic/tx/tso_segments", "Segments produced by TSO", &self.tx.tso_segments),
            (
                "ringnic/tx/tso_long_headers",
                "TSO headers too long for the pooled buffers",
                &self.tx.tso_long_headers,
            ),
            ("ringnic/tx/map_failures", "Packets dropped on DMA mapping failure", &self.tx.map_failures),
            ("ringnic/tx/busy", "Transmits refused with a full ring", &self.tx.busy),
            ("ringnic/tx/malformed", "Segmentation requests with unusable headers", &self.tx.malformed),
            (
                "ringnic/tx/spurious_completions",
                "Completions outside the outstanding window",
                &self.tx.spurious_completions,
            ),
            ("ringnic/tx/queue_stops", "Transmit queue stops", &self.tx.queue_stops),
            ("ringnic/tx/queue_wakes", "Transmit queue restarts", &self.tx.queue_wakes),
            ("ringnic/rx/packets", "Packets delivered upstream", &self.rx.packets),
            ("ringnic/rx/bytes", "Bytes delivered upstream", &self.rx.bytes),
            ("ringnic/rx/overlength", "Completions longer than the buffer allows", &self.rx.overlength),
            ("ringnic/rx/leaked", "Buffers quarantined after an overlength write", &self.rx.leaked),
            ("ringnic/rx/hw_discards", "Completions flagged bad by hardware", &self.rx.hw_discards),
            ("ringnic/rx/recycled", "Discarded buffers returned to the ring", &self.rx.recycled),
            ("ringnic/rx/alloc_failures", "Receive buffer allocation failures", &self.rx.alloc_failures),
            ("ringnic/rx/slow_fills", "Delayed refill retries", &self.rx.slow_fills),
            ("ringnic/rx/gro_merged", "Segments merged into a larger packet", &self.rx.gro_merged),
            ("ringnic/rx/bad_index", "Out-of-order receive completions", &self.rx.bad_index),
            ("ringnic/dev/resets", "Resets completed", &self.dev.resets),
            ("ringnic/dev/reset_failures", "Resets that left the device disabled", &self.dev.reset_failures),
            ("ringnic/dev/flush_failures", "Queue flushes that timed out", &self.dev.flush_failures),
            ("ringnic/dev/watchdog_fires", "Transmit watchdog expiries", &self.dev.watchdog_fires),
            ("ringnic/dev/polls", "Channel poll passes", &self.dev.polls),
            (
                "ringnic/dev/moderation_changes",
                "Adaptive interrupt moderation adjustments",
                &self.dev.moderation_changes,
            ),
        ]
    }
}

impl Default for NicMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// MAC-level statistics maintained by the hardware family.
///
/// Updated under the device statistics lock by
/// [`NicFamily::update_stats`](crate::family::NicFamily::update_stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MacStats {
    pub rx_frames: u64,
    pub rx_octets: u64,
    pub rx_crc_errors: u64,
    pub rx_no_buffer: u64,
    pub tx_frames: u64,
    pub tx_octets: u64,
}

/// Point-in-time statistics snapshot returned by
/// [`Nic::stats`](crate::nic::Nic::stats).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_dropped: u64,
    pub tx_busy: u64,
    pub tso_bursts: u64,
    pub tso_segments: u64,
    pub tso_long_headers: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_overlength: u64,
    pub rx_leaked: u64,
    pub rx_hw_discards: u64,
    pub rx_alloc_failures: u64,
    pub rx_gro_merged: u64,
    pub resets: u64,
    pub mac: MacStats,
}

impl Stats {
    pub(crate) fn from_counters(m: &NicMetrics, mac: MacStats) -> Self {
        Self {
            tx_packets: m.tx.packets.value(),
            tx_bytes: m.tx.bytes.value(),
            tx_dropped: m.tx.map_failures.value() + m.tx.malformed.value(),
            tx_busy: m.tx.busy.value(),
            tso_bursts: m.tx.tso_bursts.value(),
            tso_segments: m.tx.tso_segments.value(),
            tso_long_headers: m.tx.tso_long_headers.value(),
            rx_packets: m.rx.packets.value(),
            rx_bytes: m.rx.bytes.value(),
            rx_overlength: m.rx.overlength.value(),
            rx_leaked: m.rx.leaked.value(),
            rx_hw_discards: m.rx.hw_discards.value(),
            rx_alloc_failures: m.rx.alloc_failures.value(),
            rx_gro_merged: m.rx.gro_merged.value(),
            resets: m.dev.resets.value(),
            mac,
        }
    }
}
