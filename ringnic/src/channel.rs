//! Channels: one event queue, at most one receive queue and up to four
//! transmit queues sharing an interrupt.
//!
//! A channel is polled under its own lock. Polling drains the event queue,
//! reclaims transmit descriptors, dispatches receive completions and, when
//! the pass ends under budget, refills the receive ring, runs adaptive
//! moderation and re-arms the event queue.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::buffer::{AllocLevel, RxBuffer};
use crate::event::{Event, EventRing, HwFault, RxEventFlags, Slot, TXQ_KINDS};
use crate::family::NicFamily;
use crate::moderation::IrqModeration;
use crate::nic::NicInner;
use crate::packet::RxPacket;
use crate::reset::ResetReason;
use crate::rx::gro::Gro;
use crate::rx::{RxCompletion, RxQueue};
use crate::tx::{Reclaim, TxQueue};

/// A completed receive buffer not yet handed upstream.
struct PendingRx {
    buf: RxBuffer,
    len: u32,
    csum_verified: bool,
}

#[derive(Debug, Default)]
struct FlushState {
    tx: [bool; TXQ_KINDS as usize],
    rx: bool,
}

pub(crate) struct Channel {
    index: usize,
    vector: u32,
    enabled: bool,
    /// Hardware queues are initialised.
    hw_ready: bool,
    evq: Arc<EventRing>,
    evq_entries: u32,
    read: u32,
    rxq: Option<RxQueue>,
    txqs: [Option<Arc<TxQueue>>; TXQ_KINDS as usize],
    /// Transmit events per pass that are not charged against the budget.
    tx_free_events: u32,
    /// Receive buffer bridging two poll passes.
    pending: Option<PendingRx>,
    alloc: AllocLevel,
    gro: Gro,
    moderation: IrqModeration,
    flushed: FlushState,
}

pub(crate) struct ChannelParams {
    pub(crate) index: usize,
    pub(crate) vector: u32,
    pub(crate) evq_entries: u32,
    pub(crate) tx_free_events: u32,
    pub(crate) alloc: AllocLevel,
    pub(crate) gro: Gro,
    pub(crate) moderation: IrqModeration,
}

impl Channel {
    pub(crate) fn new(
        params: ChannelParams,
        rxq: Option<RxQueue>,
        txqs: [Option<Arc<TxQueue>>; TXQ_KINDS as usize],
    ) -> Self {
        Channel {
            index: params.index,
            vector: params.vector,
            enabled: false,
            hw_ready: false,
            evq: Arc::new(EventRing::new(params.evq_entries)),
            evq_entries: params.evq_entries,
            read: 0,
            rxq,
            txqs,
            tx_free_events: params.tx_free_events,
            pending: None,
            alloc: params.alloc,
            gro: params.gro,
            moderation: params.moderation,
            flushed: FlushState::default(),
        }
    }

    pub(crate) fn has_rx(&self) -> bool {
        self.rxq.is_some()
    }

    #[cfg(test)]
    pub(crate) fn tx_queues(&self) -> impl Iterator<Item = &Arc<TxQueue>> {
        self.txqs.iter().flatten()
    }

    pub(crate) fn moderation_usecs(&self) -> u32 {
        self.moderation.usecs()
    }

    pub(crate) fn rx_queue(&self) -> Option<&RxQueue> {
        self.rxq.as_ref()
    }

    // ── Poll ────────────────────────────────────────────────────────

    /// Process up to `budget` receive completions. Returns the budget spent;
    /// a return below `budget` means the event queue was re-armed.
    pub(crate) fn poll(&mut self, budget: usize, nic: &NicInner) -> usize {
        if !self.enabled {
            return 0;
        }
        let mut spent = 0;
        let mut rx_events = 0;
        let mut tx_events = 0;
        let mut interrupted = false;

        while spent < budget {
            if nic.resets.is_pending() {
                interrupted = true;
                break;
            }
            let ev = match self.evq.peek(self.read) {
                Slot::Empty => break,
                Slot::Unknown(raw) => {
                    warn!("ch{}: unknown event {raw:#018x}", self.index);
                    self.read = self.read.wrapping_add(1);
                    continue;
                }
                Slot::Event(ev) => ev,
            };
            self.read = self.read.wrapping_add(1);
            trace!("ch{}: {ev:?}", self.index);

            match ev {
                Event::Rx { index, len, flags } => {
                    spent += 1;
                    rx_events += 1;
                    self.handle_rx(index, len, flags, nic);
                }
                Event::Tx { kind, index } => {
                    tx_events += 1;
                    if tx_events > self.tx_free_events {
                        spent += 1;
                    }
                    self.handle_tx(kind, index, nic);
                }
                Event::TxFlushDone { kind } => {
                    if let Some(done) = self.flushed.tx.get_mut(kind as usize) {
                        *done = true;
                    }
                }
                Event::RxFlushDone => self.flushed.rx = true,
                Event::Refill => {
                    if let Some(rxq) = self.rxq.as_mut() {
                        rxq.refill(self.alloc.use_pages());
                    }
                }
                Event::Fault(fault) => {
                    warn!("ch{}: hardware fault {fault:?}", self.index);
                    nic.schedule_reset(match fault {
                        HwFault::RxDescFetch => ResetReason::RxDescFetch,
                        HwFault::TxDescFetch => ResetReason::TxDescFetch,
                        HwFault::Interrupt => ResetReason::IntError,
                    });
                }
            }
        }

        self.moderation.on_rx(rx_events);
        self.moderation.on_tx(tx_events);
        nic.metrics.dev.polls.increment();

        if spent < budget && !interrupted {
            self.complete_pass(nic);
        }
        spent
    }

    fn handle_rx(&mut self, index: u16, len: u16, flags: RxEventFlags, nic: &NicInner) {
        let Some(rxq) = self.rxq.as_mut() else {
            warn!("ch{}: receive event on a channel without a receive queue", self.index);
            return;
        };
        match rxq.complete(index, len, flags) {
            RxCompletion::Deliver {
                buf,
                len,
                csum_verified,
            } => {
                let next = PendingRx {
                    buf,
                    len,
                    csum_verified,
                };
                if let Some(prev) = self.pending.replace(next) {
                    self.deliver(prev, nic);
                }
            }
            RxCompletion::Recycled => {}
            RxCompletion::Leaked | RxCompletion::BadIndex => {
                nic.schedule_reset(ResetReason::RxRecovery);
            }
        }
    }

    fn handle_tx(&mut self, kind: u8, index: u16, nic: &NicInner) {
        let Some(q) = self.txqs.get(kind as usize).and_then(Option::as_ref) else {
            warn!("ch{}: completion for missing transmit queue kind {kind}", self.index);
            return;
        };
        match q.reclaim(index) {
            Reclaim::Spurious => nic.schedule_reset(ResetReason::TxSkip),
            Reclaim::Done { woke: true, .. } => nic.stack.wake_queue(q.id()),
            Reclaim::Done { .. } => {}
        }
    }

    /// Hand one frame upstream, through aggregation when the checksum was
    /// verified or the buffer is page-backed.
    fn deliver(&mut self, rx: PendingRx, nic: &NicInner) {
        let page = rx.buf.is_page();
        let frame = rx.buf.into_bytes(rx.len);
        nic.metrics.rx.packets.increment();
        nic.metrics.rx.bytes.add(frame.len() as u64);
        let stack = &*nic.stack;
        if rx.csum_verified || page {
            self.alloc.on_aggregated();
            self.gro.push(frame, rx.csum_verified, &mut |p| stack.receive(p));
        } else {
            self.alloc.on_single();
            self.gro.flush(&mut |p| stack.receive(p));
            stack.receive(RxPacket {
                channel: self.index,
                frags: vec![frame],
                csum_verified: false,
                segments: 1,
            });
        }
    }

    fn complete_pass(&mut self, nic: &NicInner) {
        if let Some(prev) = self.pending.take() {
            self.deliver(prev, nic);
        }
        let stack = &*nic.stack;
        self.gro.flush(&mut |p| stack.receive(p));
        if let Some(rxq) = self.rxq.as_mut() {
            rxq.refill(self.alloc.use_pages());
        }
        if let Some(usecs) = self.moderation.end_poll() {
            debug!("ch{}: moderation now {usecs}us", self.index);
            nic.metrics.dev.moderation_changes.increment();
            nic.family.push_irq_moderation(self.index, usecs);
        }
        self.rearm(&*nic.family);
    }

    fn rearm(&self, family: &dyn NicFamily) {
        self.evq.publish_read(self.read);
        family.rearm_event_queue(self.index, self.read);
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Program the hardware queues, fill the receive ring and arm the event
    /// queue.
    pub(crate) fn start(&mut self, family: &dyn NicFamily) {
        self.evq = Arc::new(EventRing::new(self.evq_entries));
        self.read = 0;
        self.flushed = FlushState::default();
        family.init_event_queue(self.index, Arc::clone(&self.evq), self.vector);
        family.push_irq_moderation(self.index, self.moderation.usecs());
        for q in self.txqs.iter().flatten() {
            family.init_tx_queue(q.id(), q.capacity());
            q.enable();
        }
        if let Some(rxq) = self.rxq.as_mut() {
            family.init_rx_queue(self.index, rxq.entries());
            rxq.refill(self.alloc.use_pages());
        }
        self.hw_ready = true;
        self.enabled = true;
        self.rearm(family);
    }

    /// Stop polling and refuse new transmits. The caller holds the channel
    /// lock, so no poll is in flight once this returns.
    pub(crate) fn stop(&mut self) {
        self.enabled = false;
        for q in self.txqs.iter().flatten() {
            q.disable();
        }
    }

    /// Ask hardware to flush every queue and wait for the flush-done events.
    /// Returns the number of queues that did not report completion.
    pub(crate) fn flush(&mut self, family: &dyn NicFamily, attempts: u32, interval: Duration) -> usize {
        if !self.hw_ready {
            return 0;
        }
        self.flushed = FlushState::default();
        for q in self.txqs.iter().flatten() {
            family.flush_tx_queue(q.id());
        }
        if self.rxq.is_some() {
            family.flush_rx_queue(self.index);
        }

        for attempt in 0..attempts {
            self.drain_flush_events();
            if self.flushes_outstanding() == 0 {
                break;
            }
            if attempt + 1 < attempts {
                thread::sleep(interval);
            }
        }
        self.evq.publish_read(self.read);
        let left = self.flushes_outstanding();
        if left > 0 {
            warn!("ch{}: {left} queues did not flush", self.index);
        }
        left
    }

    fn drain_flush_events(&mut self) {
        loop {
            match self.evq.peek(self.read) {
                Slot::Empty => return,
                Slot::Unknown(_) => {}
                Slot::Event(Event::TxFlushDone { kind }) => {
                    if let Some(done) = self.flushed.tx.get_mut(kind as usize) {
                        *done = true;
                    }
                }
                Slot::Event(Event::RxFlushDone) => self.flushed.rx = true,
                Slot::Event(Event::Tx { kind, index }) => {
                    // Late completions still release their packets. The
                    // queue is torn down next, so a bad index needs no reset.
                    if let Some(q) = self.txqs.get(kind as usize).and_then(Option::as_ref)
                        && q.reclaim(index) == Reclaim::Spurious
                    {
                        debug!("ch{}: ignoring spurious completion {index} during flush", self.index);
                    }
                }
                Slot::Event(_) => {}
            }
            self.read = self.read.wrapping_add(1);
        }
    }

    fn flushes_outstanding(&self) -> usize {
        let tx = self
            .txqs
            .iter()
            .zip(self.flushed.tx.iter())
            .filter(|(q, done)| q.is_some() && !**done)
            .count();
        let rx = usize::from(self.rxq.is_some() && !self.flushed.rx);
        tx + rx
    }

    /// Tear down the hardware queues and release every buffer.
    pub(crate) fn fini(&mut self, family: &dyn NicFamily) {
        self.enabled = false;
        let hw = std::mem::take(&mut self.hw_ready);
        for q in self.txqs.iter().flatten() {
            if hw {
                family.fini_tx_queue(q.id());
            }
            q.release_all();
        }
        if let Some(rxq) = self.rxq.as_mut() {
            if hw {
                family.fini_rx_queue(self.index);
            }
            rxq.release_all();
        }
        if hw {
            family.fini_event_queue(self.index);
        }
        self.pending = None;
        self.gro.discard();
    }

    /// Request the delayed refill when its deadline has passed.
    pub(crate) fn run_slow_fill(&mut self, now: Instant, family: &dyn NicFamily) {
        if self.enabled
            && let Some(rxq) = self.rxq.as_mut()
            && rxq.take_slow_fill(now)
        {
            debug!("ch{}: slow fill", self.index);
            family.generate_refill_event(self.index);
        }
    }

    /// Apply an explicit moderation setting.
    pub(crate) fn set_moderation(&mut self, usecs: u32, adaptive: bool, family: &dyn NicFamily) {
        self.moderation.set(usecs, adaptive && self.rxq.is_some());
        if self.enabled {
            family.push_irq_moderation(self.index, usecs);
        }
    }
}
