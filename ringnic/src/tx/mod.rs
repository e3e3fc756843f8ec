//! Transmit descriptor rings.
//!
//! Producers run on any thread and are serialised by the queue's transmit
//! lock, which guards `insert_count` and is the only writer of
//! `write_count`. The owning channel's poll routine is the only consumer and
//! the only writer of `read_count`. Slots between `read_count` and
//! `write_count` belong to the consumer; every other slot belongs to the
//! producer.

pub(crate) mod tso;
pub(crate) mod tsoh;

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering, fence};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::dma::{DmaAddr, DmaDirection, DmaMapper, Mapping};
use crate::error::{DropReason, XmitError};
use crate::family::{FamilyCaps, NicFamily, TxDescriptor};
use crate::metrics::TxMetrics;
use crate::packet::Packet;
use tsoh::{TsoHeader, TsohPool};

bitflags! {
    /// Transmit queue kind within a channel: checksum offload and priority.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TxQueueKind: u8 {
        const OFFLOAD = 0x01;
        const HIGHPRI = 0x02;
    }
}

impl TxQueueKind {
    /// The kind serving a packet.
    pub fn for_packet(packet: &Packet) -> Self {
        let mut kind = TxQueueKind::empty();
        if packet.csum_offload() {
            kind |= TxQueueKind::OFFLOAD;
        }
        if packet.priority() > 0 {
            kind |= TxQueueKind::HIGHPRI;
        }
        kind
    }

    /// Every kind, in index order.
    pub fn all_kinds() -> impl Iterator<Item = TxQueueKind> {
        (0..4u8).map(TxQueueKind::from_bits_truncate)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.bits() as usize
    }
}

/// Address of a transmit queue: channel plus kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxQueueId {
    pub channel: usize,
    pub kind: TxQueueKind,
}

impl std::fmt::Display for TxQueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txq{}.{}", self.channel, self.kind.bits())
    }
}

/// One ring slot.
#[derive(Default)]
struct TxSlot {
    addr: DmaAddr,
    len: u32,
    cont: bool,
    /// Set on the final descriptor of a packet.
    packet: Option<Packet>,
    header: Option<TsoHeader>,
    /// The mapping this descriptor finishes.
    unmap: Option<Mapping>,
}

impl TxSlot {
    fn descriptor(&self) -> TxDescriptor {
        TxDescriptor {
            addr: self.addr,
            len: self.len,
            cont: self.cont,
        }
    }
}

/// State guarded by the transmit lock.
pub(crate) struct TxProducer {
    enabled: bool,
    insert_count: u32,
    /// Producer's possibly stale copy of `read_count`.
    old_read_count: u32,
    tsoh: TsohPool,
}

/// Result of processing one completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reclaim {
    Done { packets: u32, woke: bool },
    /// The index lies outside the outstanding window, or the walk met an
    /// empty slot.
    Spurious,
}

pub struct TxQueue {
    id: TxQueueId,
    mask: u32,
    slots: Box<[UnsafeCell<TxSlot>]>,
    producer: Mutex<TxProducer>,
    write_count: AtomicU32,
    read_count: AtomicU32,
    stopped: AtomicBool,
    /// Nanoseconds since `epoch` of the last completion, or of the stop that
    /// began the current stall.
    progress_ns: AtomicU64,
    epoch: Instant,
    mapper: Arc<dyn DmaMapper>,
    family: Arc<dyn NicFamily>,
    boundary: u32,
    unaligned_erratum: bool,
    /// Largest IP packet a segment may produce.
    pub(super) mtu: u32,
    metrics: TxMetrics,
}

// Safety: slot ownership is split by the cursors as described in the module
// docs; producers hold the transmit lock and the consumer is the single
// channel poll context.
unsafe impl Sync for TxQueue {}
unsafe impl Send for TxQueue {}

impl TxQueue {
    pub(crate) fn new(
        id: TxQueueId,
        entries: u32,
        mtu: u32,
        caps: &FamilyCaps,
        mapper: Arc<dyn DmaMapper>,
        family: Arc<dyn NicFamily>,
        metrics: TxMetrics,
    ) -> Self {
        assert!(entries.is_power_of_two(), "entries must be power of 2");
        let slots = (0..entries).map(|_| UnsafeCell::new(TxSlot::default())).collect();
        TxQueue {
            id,
            mask: entries - 1,
            slots,
            producer: Mutex::new(TxProducer {
                enabled: false,
                insert_count: 0,
                old_read_count: 0,
                tsoh: TsohPool::new(Arc::clone(&mapper)),
            }),
            write_count: AtomicU32::new(0),
            read_count: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            progress_ns: AtomicU64::new(0),
            epoch: Instant::now(),
            mapper,
            family,
            boundary: caps.tx_boundary.max(16),
            unaligned_erratum: caps.tx_unaligned_erratum,
            mtu,
            metrics,
        }
    }

    #[inline]
    pub fn id(&self) -> TxQueueId {
        self.id
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    /// Descriptors written to hardware and not yet completed.
    pub fn fill_level(&self) -> u32 {
        self.write_count
            .load(Ordering::Acquire)
            .wrapping_sub(self.read_count.load(Ordering::Acquire))
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::Acquire)
    }

    pub(crate) fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, TxProducer> {
        self.producer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// # Safety
    ///
    /// The caller must own slot `count & mask` under the cursor rules.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slot(&self, count: u32) -> &mut TxSlot {
        unsafe { &mut *self.slots[(count & self.mask) as usize].get() }
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    // ── Producer side ───────────────────────────────────────────────

    /// Queue a packet for transmission.
    pub(crate) fn enqueue(&self, packet: Packet) -> Result<(), XmitError> {
        let mut p = self.lock();
        if !p.enabled {
            return Err(XmitError::Busy(packet));
        }
        let start = p.insert_count;
        let res = match packet.mss() {
            Some(mss) => tso::enqueue(self, &mut p, packet, mss),
            None => self.enqueue_plain(&mut p, packet),
        };
        match res {
            Ok(()) => {
                self.push(&mut p);
                Ok(())
            }
            Err(e) => {
                self.unwind(&mut p, start);
                // A packet that does not fit an empty ring never will.
                let e = match e {
                    XmitError::Busy(_) if start == self.read_count.load(Ordering::Acquire) => {
                        self.stopped.store(false, Ordering::Release);
                        XmitError::Dropped(DropReason::Oversized)
                    }
                    e => e,
                };
                match &e {
                    XmitError::Busy(_) => self.metrics.busy.increment(),
                    XmitError::Dropped(DropReason::MappingFailed) => {
                        self.metrics.map_failures.increment()
                    }
                    XmitError::Dropped(DropReason::Malformed | DropReason::Oversized) => {
                        self.metrics.malformed.increment()
                    }
                    XmitError::Dropped(_) => {}
                }
                Err(e)
            }
        }
    }

    fn enqueue_plain(&self, p: &mut TxProducer, packet: Packet) -> Result<(), XmitError> {
        let mut full = false;
        for frag in packet.frags() {
            if frag.is_empty() {
                continue;
            }
            let mapping = match Mapping::new(
                &self.mapper,
                frag.as_ptr(),
                frag.len(),
                DmaDirection::ToDevice,
            ) {
                Ok(m) => m,
                Err(e) => {
                    debug!("{}: fragment mapping failed: {e}", self.id);
                    return Err(XmitError::Dropped(DropReason::MappingFailed));
                }
            };
            if self.push_span(p, mapping.addr(), frag.len() as u32).is_err() {
                full = true;
                break;
            }
            // Safety: just written by this producer, not yet published.
            unsafe { self.slot(p.insert_count.wrapping_sub(1)) }.unmap = Some(mapping);
        }
        if full {
            return Err(XmitError::Busy(packet));
        }
        if p.insert_count == self.write_count.load(Ordering::Relaxed) {
            // Nothing but empty fragments.
            return Err(XmitError::Dropped(DropReason::Malformed));
        }
        self.finish_frame(p, Some(packet));
        Ok(())
    }

    /// Mark the last written descriptor as the end of a frame, optionally
    /// handing it the packet.
    pub(crate) fn finish_frame(&self, p: &mut TxProducer, packet: Option<Packet>) {
        // Safety: written by this producer, not yet published.
        let slot = unsafe { self.slot(p.insert_count.wrapping_sub(1)) };
        slot.cont = false;
        if packet.is_some() {
            slot.packet = packet;
        }
    }

    /// Add descriptors covering `len` bytes at `addr`, split at the hardware
    /// boundary and, with the unaligned-buffer erratum, at
    /// `512 - (addr & 15)`. Every descriptor is written as a continuation.
    pub(crate) fn push_span(&self, p: &mut TxProducer, mut addr: DmaAddr, mut len: u32) -> Result<(), ()> {
        while len > 0 {
            let to_boundary = self.boundary - (addr.0 & (self.boundary as u64 - 1)) as u32;
            let mut chunk = len.min(to_boundary);
            let misalign = (addr.0 & 15) as u32;
            if self.unaligned_erratum && misalign != 0 {
                chunk = chunk.min(512 - misalign);
            }
            self.reserve(p)?;
            // Safety: `reserve` established the slot is producer-owned.
            let slot = unsafe { self.slot(p.insert_count) };
            debug_assert_eq!(slot.len, 0, "reusing a live slot");
            slot.addr = addr;
            slot.len = chunk;
            slot.cont = true;
            p.insert_count = p.insert_count.wrapping_add(1);
            addr = addr.offset(chunk as u64);
            len -= chunk;
        }
        Ok(())
    }

    /// Ensure one free slot at `insert_count`. On an apparently full ring
    /// the queue is stopped, then the consumer's cursor is re-read after a
    /// full barrier; the queue stays stopped only if the ring is really full.
    fn reserve(&self, p: &mut TxProducer) -> Result<(), ()> {
        let limit = self.mask;
        if p.insert_count.wrapping_sub(p.old_read_count) < limit {
            return Ok(());
        }
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.progress_ns.store(self.now_ns(), Ordering::Release);
        }
        fence(Ordering::SeqCst);
        p.old_read_count = self.read_count.load(Ordering::Acquire);
        if p.insert_count.wrapping_sub(p.old_read_count) < limit {
            self.stopped.store(false, Ordering::Release);
            return Ok(());
        }
        self.metrics.queue_stops.increment();
        trace!("{}: ring full, stopping", self.id);
        Err(())
    }

    /// Roll back every slot written since `start`.
    fn unwind(&self, p: &mut TxProducer, start: u32) {
        while p.insert_count != start {
            p.insert_count = p.insert_count.wrapping_sub(1);
            // Safety: unpublished producer slot.
            let slot = unsafe { self.slot(p.insert_count) };
            *slot = TxSlot::default();
        }
    }

    /// Publish descriptors `write_count .. insert_count` and ring the
    /// doorbell.
    fn push(&self, p: &mut TxProducer) {
        let first = self.write_count.load(Ordering::Relaxed);
        let n = p.insert_count.wrapping_sub(first);
        if n == 0 {
            return;
        }
        let descs: Vec<TxDescriptor> = (0..n)
            // Safety: unpublished producer slots.
            .map(|i| unsafe { self.slot(first.wrapping_add(i)) }.descriptor())
            .collect();
        self.write_count.store(p.insert_count, Ordering::Release);
        self.family.push_tx_descriptors(self.id, first, &descs);
    }

    pub(crate) fn set_header(&self, p: &mut TxProducer, header: TsoHeader) {
        // Safety: written by this producer, not yet published.
        unsafe { self.slot(p.insert_count.wrapping_sub(1)) }.header = Some(header);
    }

    pub(crate) fn set_unmap(&self, p: &mut TxProducer, mapping: Mapping) {
        // Safety: written by this producer, not yet published.
        unsafe { self.slot(p.insert_count.wrapping_sub(1)) }.unmap = Some(mapping);
    }

    pub(crate) fn mapper(&self) -> &Arc<dyn DmaMapper> {
        &self.mapper
    }

    #[cfg(test)]
    pub(crate) fn metrics(&self) -> &TxMetrics {
        &self.metrics
    }

    // ── Consumer side ───────────────────────────────────────────────

    /// Release every descriptor up to and including `index`.
    pub(crate) fn reclaim(&self, index: u16) -> Reclaim {
        let read = self.read_count.load(Ordering::Relaxed);
        let write = self.write_count.load(Ordering::Acquire);
        let stop = index as u32 & self.mask;

        // Completion for the last descriptor already released.
        if stop.wrapping_add(1) & self.mask == read & self.mask {
            return Reclaim::Done {
                packets: 0,
                woke: false,
            };
        }
        let n = stop.wrapping_sub(read) & self.mask;
        let n = n + 1;
        if n > write.wrapping_sub(read) {
            warn!(
                "{}: completion {index} outside window {read}..{write}",
                self.id
            );
            self.metrics.spurious_completions.increment();
            return Reclaim::Spurious;
        }

        let mut packets = 0;
        for i in 0..n {
            let count = read.wrapping_add(i);
            // Safety: consumer-owned, between read_count and write_count.
            let slot = unsafe { self.slot(count) };
            if slot.len == 0 {
                warn!("{}: empty descriptor {count} in completion walk", self.id);
                self.metrics.spurious_completions.increment();
                self.read_count.store(count, Ordering::Release);
                return Reclaim::Spurious;
            }
            if let Some(packet) = slot.packet.take() {
                packets += 1;
                self.metrics.packets.increment();
                self.metrics.bytes.add(packet.len() as u64);
            }
            *slot = TxSlot::default();
        }
        let read = read.wrapping_add(n);
        self.read_count.store(read, Ordering::Release);
        self.progress_ns.store(self.now_ns(), Ordering::Release);

        // Pairs with the barrier in `reserve`.
        fence(Ordering::SeqCst);
        let mut woke = false;
        if self.stopped.load(Ordering::Acquire) {
            let fill = self.write_count.load(Ordering::Acquire).wrapping_sub(read);
            if fill < self.capacity() / 2 && self.stopped.swap(false, Ordering::AcqRel) {
                self.metrics.queue_wakes.increment();
                woke = true;
            }
        }
        Reclaim::Done { packets, woke }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    pub(crate) fn enable(&self) {
        let mut p = self.lock();
        p.enabled = true;
        self.stopped.store(false, Ordering::Release);
        self.progress_ns.store(self.now_ns(), Ordering::Release);
    }

    /// Stop accepting packets. Returns once any in-flight producer has left.
    pub(crate) fn disable(&self) {
        self.lock().enabled = false;
    }

    /// Drop every outstanding descriptor and reset the cursors. The queue
    /// must be disabled and its channel quiesced.
    pub(crate) fn release_all(&self) {
        let mut p = self.lock();
        let read = self.read_count.load(Ordering::Acquire);
        let mut released = 0u32;
        for i in 0..p.insert_count.wrapping_sub(read) {
            // Safety: producer lock held and consumer quiesced.
            let slot = unsafe { self.slot(read.wrapping_add(i)) };
            if slot.packet.is_some() {
                released += 1;
            }
            *slot = TxSlot::default();
        }
        if released > 0 {
            debug!("{}: abandoned {released} packets", self.id);
        }
        p.insert_count = 0;
        p.old_read_count = 0;
        self.write_count.store(0, Ordering::Release);
        self.read_count.store(0, Ordering::Release);
        self.stopped.store(false, Ordering::Release);
    }

    /// A stopped queue that has made no progress for `timeout`.
    pub(crate) fn stalled(&self, timeout: Duration) -> bool {
        if !self.is_stopped() {
            return false;
        }
        let since = self.progress_ns.load(Ordering::Acquire);
        Duration::from_nanos(self.now_ns().saturating_sub(since)) >= timeout
    }

    /// Restart the stall clock, so one stall fires the watchdog once.
    pub(crate) fn touch(&self) {
        self.progress_ns.store(self.now_ns(), Ordering::Release);
    }
}

impl std::fmt::Debug for TxQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxQueue")
            .field("id", &self.id)
            .field("write_count", &self.write_count())
            .field("read_count", &self.read_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sim::{SimDma, SimFamily};
    use bytes::Bytes;

    pub(crate) fn queue_with(entries: u32, caps: FamilyCaps) -> (Arc<SimFamily>, Arc<SimDma>, TxQueue) {
        let family = Arc::new(SimFamily::with_caps(caps.clone()));
        let dma = Arc::new(SimDma::new());
        let id = TxQueueId {
            channel: 0,
            kind: TxQueueKind::empty(),
        };
        let q = TxQueue::new(
            id,
            entries,
            1500,
            &caps,
            dma.clone(),
            family.clone(),
            crate::metrics::NicMetrics::new().tx,
        );
        q.enable();
        (family, dma, q)
    }

    fn queue(entries: u32) -> (Arc<SimFamily>, Arc<SimDma>, TxQueue) {
        queue_with(entries, FamilyCaps::default())
    }

    fn last_index(q: &TxQueue) -> u16 {
        q.write_count().wrapping_sub(1) as u16
    }

    #[test]
    fn single_fragment_packet() {
        let (family, dma, q) = queue(32);
        q.enqueue(Packet::from(vec![7u8; 100])).unwrap();
        assert_eq!(q.fill_level(), 1);
        assert_eq!(dma.outstanding(), 1);
        let frames = family.wire_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, vec![7u8; 100]);

        assert_eq!(
            q.reclaim(last_index(&q)),
            Reclaim::Done {
                packets: 1,
                woke: false
            }
        );
        assert_eq!(q.fill_level(), 0);
        assert_eq!(dma.outstanding(), 0);
        assert_eq!(q.metrics().bytes.value(), 100);
    }

    #[test]
    fn zero_length_fragments_skipped() {
        let (_family, _dma, q) = queue(32);
        let pkt = Packet::new(vec![
            Bytes::from_static(b"head"),
            Bytes::new(),
            Bytes::from_static(b"tail"),
        ]);
        q.enqueue(pkt).unwrap();
        assert_eq!(q.fill_level(), 2);

        let err = q.enqueue(Packet::new(vec![Bytes::new()])).unwrap_err();
        assert!(matches!(err, XmitError::Dropped(DropReason::Malformed)));
        assert_eq!(q.fill_level(), 2);
    }

    #[test]
    fn descriptors_never_cross_boundary() {
        let (family, _dma, q) = queue(64);
        // Oversized and offset so the span straddles several 4 KiB pages.
        let buf = Bytes::from(vec![1u8; 10_000]);
        q.enqueue(Packet::new(vec![buf.slice(5..)])).unwrap();
        let descs = family.tx_descriptors(q.id());
        assert!(descs.len() >= 3);
        for d in &descs {
            let start = d.addr.0;
            let end = start + d.len as u64 - 1;
            assert_eq!(start / 4096, end / 4096, "descriptor crosses 4 KiB");
        }
        assert_eq!(descs.iter().map(|d| d.len).sum::<u32>(), 9995);
        assert!(descs[..descs.len() - 1].iter().all(|d| d.cont));
        assert!(!descs.last().unwrap().cont);
    }

    #[test]
    fn unaligned_erratum_limits_descriptor() {
        let caps = FamilyCaps {
            tx_unaligned_erratum: true,
            ..FamilyCaps::default()
        };
        let (family, _dma, q) = queue_with(64, caps);
        let buf = Bytes::from(vec![0u8; 4096]);
        let frag = buf.slice(3..1500);
        let misalign = frag.as_ptr() as u64 & 15;
        q.enqueue(Packet::new(vec![frag])).unwrap();
        let descs = family.tx_descriptors(q.id());
        if misalign != 0 {
            assert!(descs[0].len <= 512 - misalign as u32);
        }
        assert_eq!(descs.iter().map(|d| d.len).sum::<u32>(), 1497);
    }

    #[test]
    fn mapping_failure_drops_and_unwinds() {
        let (family, dma, q) = queue(32);
        dma.fail_after(1);
        let pkt = Packet::new(vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def")]);
        let err = q.enqueue(pkt).unwrap_err();
        assert!(matches!(err, XmitError::Dropped(DropReason::MappingFailed)));
        assert_eq!(dma.outstanding(), 0);
        assert_eq!(q.fill_level(), 0);
        assert!(family.tx_descriptors(q.id()).is_empty());
        assert_eq!(q.metrics().map_failures.value(), 1);

        dma.clear_failures();
        q.enqueue(Packet::from(vec![1u8; 10])).unwrap();
        assert_eq!(q.fill_level(), 1);
    }

    #[test]
    fn full_ring_returns_busy_then_wakes() {
        let (_family, dma, q) = queue(32);
        for _ in 0..31 {
            q.enqueue(Packet::from(vec![0u8; 60])).unwrap();
        }
        let err = q.enqueue(Packet::from(vec![9u8; 60])).unwrap_err();
        let pkt = err.into_packet().unwrap();
        assert_eq!(pkt.len(), 60);
        assert!(q.is_stopped());
        assert_eq!(dma.outstanding(), 31);

        // Reclaiming down to exactly half does not restart the queue.
        assert_eq!(
            q.reclaim(14),
            Reclaim::Done {
                packets: 15,
                woke: false
            }
        );
        assert!(q.is_stopped());
        assert_eq!(
            q.reclaim(15),
            Reclaim::Done {
                packets: 1,
                woke: true
            }
        );
        assert!(!q.is_stopped());
        q.enqueue(pkt).unwrap();
    }

    #[test]
    fn spurious_completion_detected() {
        let (_family, _dma, q) = queue(32);
        q.enqueue(Packet::from(vec![0u8; 60])).unwrap();
        assert_eq!(q.reclaim(5), Reclaim::Spurious);
        assert_eq!(q.fill_level(), 1);
        assert_eq!(q.metrics().spurious_completions.value(), 1);
    }

    #[test]
    fn duplicate_completion_is_noop() {
        let (_family, _dma, q) = queue(32);
        q.enqueue(Packet::from(vec![0u8; 60])).unwrap();
        q.enqueue(Packet::from(vec![0u8; 60])).unwrap();
        assert!(matches!(q.reclaim(1), Reclaim::Done { packets: 2, .. }));
        assert_eq!(
            q.reclaim(1),
            Reclaim::Done {
                packets: 0,
                woke: false
            }
        );
    }

    #[test]
    fn disabled_queue_is_busy() {
        let (_family, _dma, q) = queue(32);
        q.disable();
        assert!(matches!(
            q.enqueue(Packet::from(vec![0u8; 10])),
            Err(XmitError::Busy(_))
        ));
    }

    #[test]
    fn release_all_resets_cursors() {
        let (_family, dma, q) = queue(32);
        for _ in 0..5 {
            q.enqueue(Packet::from(vec![0u8; 60])).unwrap();
        }
        q.disable();
        q.release_all();
        assert_eq!(q.fill_level(), 0);
        assert_eq!(q.write_count(), 0);
        assert_eq!(dma.outstanding(), 0);
    }

    #[test]
    fn stall_detection() {
        let (_family, _dma, q) = queue(32);
        assert!(!q.stalled(Duration::ZERO));
        for _ in 0..31 {
            q.enqueue(Packet::from(vec![0u8; 60])).unwrap();
        }
        assert!(q.enqueue(Packet::from(vec![0u8; 60])).is_err());
        assert!(q.stalled(Duration::ZERO));
        assert!(!q.stalled(Duration::from_secs(60)));
    }

    #[test]
    fn kind_for_packet() {
        let p = Packet::from(vec![0u8; 1]).with_csum_offload(true).with_priority(3);
        assert_eq!(
            TxQueueKind::for_packet(&p),
            TxQueueKind::OFFLOAD | TxQueueKind::HIGHPRI
        );
        assert_eq!(TxQueueKind::all_kinds().count(), 4);
    }
}
