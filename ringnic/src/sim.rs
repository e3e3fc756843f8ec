//! Software models of the device-side collaborators.
//!
//! [`SimFamily`] behaves like a hardware generation: it accepts descriptor
//! pushes, reads transmit buffers into whole wire frames, writes injected
//! receive frames into posted buffers and posts completion, flush and
//! driver events to the channel event queues, raising the channel's
//! interrupt as it does. [`SimBus`], [`SimDma`] and [`SimStack`] model the
//! bus, the IOMMU and the upper network stack.
//!
//! The simulated device dereferences bus addresses as host pointers, so it
//! must be paired with an identity-style mapper such as [`SimDma`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use log::trace;

use crate::bus::{Bus, RegisterWindow};
use crate::dma::{DmaAddr, DmaDirection, DmaMapper};
use crate::error::{BusError, DmaError, HwError};
use crate::event::{Event, EventRing, HwFault, RxEventFlags};
use crate::family::{FamilyCaps, MacConfig, NicFamily, RxDescriptor, TxDescriptor};
use crate::interrupt::IrqHandler;
use crate::metrics::MacStats;
use crate::packet::RxPacket;
use crate::reset::{ResetKind, ResetReason};
use crate::stack::NetStack;
use crate::tx::TxQueueId;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── DMA ─────────────────────────────────────────────────────────────

/// Identity mapper that counts live mappings and can be told to fail.
#[derive(Debug)]
pub struct SimDma {
    live: AtomicUsize,
    total: AtomicUsize,
    /// Successful mappings left before failures start; negative = unlimited.
    budget: AtomicI64,
}

impl SimDma {
    pub fn new() -> Self {
        SimDma {
            live: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            budget: AtomicI64::new(-1),
        }
    }

    /// Mappings created and not yet released.
    pub fn outstanding(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Mappings created since construction.
    pub fn total_maps(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Allow `n` more mappings, then fail every request.
    pub fn fail_after(&self, n: usize) {
        self.budget.store(n as i64, Ordering::Release);
    }

    pub fn clear_failures(&self) {
        self.budget.store(-1, Ordering::Release);
    }
}

impl Default for SimDma {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaMapper for SimDma {
    fn map(&self, ptr: *const u8, _len: usize, _dir: DmaDirection) -> Result<DmaAddr, DmaError> {
        let allowed = self
            .budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| match b {
                b if b < 0 => Some(b),
                0 => None,
                b => Some(b - 1),
            })
            .is_ok();
        if !allowed {
            return Err(DmaError::Exhausted);
        }
        self.live.fetch_add(1, Ordering::AcqRel);
        self.total.fetch_add(1, Ordering::AcqRel);
        Ok(DmaAddr(ptr as u64))
    }

    fn unmap(&self, _addr: DmaAddr, _len: usize, _dir: DmaDirection) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

// ── Bus ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct BusLog {
    enabled: bool,
    dma_mask: Option<u8>,
    msix: usize,
}

/// A bus offering a fixed number of MSI-X vectors.
#[derive(Debug)]
pub struct SimBus {
    msix_vectors: usize,
    msi: bool,
    dma_bits: u8,
    cpus: usize,
    log: Mutex<BusLog>,
}

impl SimBus {
    /// A bus with `msix_vectors` MSI-X vectors (0 = no MSI-X), MSI, a 64-bit
    /// DMA mask and four CPUs.
    pub fn new(msix_vectors: usize) -> Self {
        SimBus {
            msix_vectors,
            msi: true,
            dma_bits: 64,
            cpus: 4,
            log: Mutex::new(BusLog::default()),
        }
    }

    pub fn without_msi(mut self) -> Self {
        self.msi = false;
        self
    }

    /// Widest DMA mask the platform accepts.
    pub fn dma_bits(mut self, bits: u8) -> Self {
        self.dma_bits = bits;
        self
    }

    pub fn cpus(mut self, n: usize) -> Self {
        self.cpus = n;
        self
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.log).enabled
    }

    /// DMA mask accepted during probe.
    pub fn dma_mask(&self) -> Option<u8> {
        lock(&self.log).dma_mask
    }
}

impl Bus for SimBus {
    fn enable_device(&self) -> Result<(), BusError> {
        lock(&self.log).enabled = true;
        Ok(())
    }

    fn disable_device(&self) {
        lock(&self.log).enabled = false;
    }

    fn map_registers(&self, bar: u8) -> Result<RegisterWindow, BusError> {
        if bar != 0 {
            return Err(BusError::RegisterWindow(bar));
        }
        Ok(RegisterWindow {
            bar,
            base: 0xfe00_0000,
            len: 0x10000,
        })
    }

    fn set_dma_mask(&self, bits: u8) -> Result<(), BusError> {
        if bits > self.dma_bits {
            return Err(BusError::DmaMask(bits));
        }
        lock(&self.log).dma_mask = Some(bits);
        Ok(())
    }

    fn enable_msix(&self, vectors: usize) -> Result<Vec<u32>, BusError> {
        if self.msix_vectors == 0 {
            return Err(BusError::Unsupported);
        }
        if vectors > self.msix_vectors {
            return Err(BusError::MsixInsufficient {
                available: self.msix_vectors,
            });
        }
        lock(&self.log).msix = vectors;
        Ok((0..vectors as u32).map(|v| 32 + v).collect())
    }

    fn enable_msi(&self) -> Result<u32, BusError> {
        if self.msi { Ok(24) } else { Err(BusError::Unsupported) }
    }

    fn legacy_irq(&self) -> u32 {
        11
    }

    fn disable_interrupts(&self) {
        lock(&self.log).msix = 0;
    }

    fn online_cpus(&self) -> usize {
        self.cpus
    }
}

// ── Hardware family ─────────────────────────────────────────────────

/// A frame as it left the simulated MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub queue: TxQueueId,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct SimTxq {
    descs: Vec<TxDescriptor>,
    pushed: u32,
    completed: u32,
    partial: Vec<u8>,
}

#[derive(Default)]
struct SimRxq {
    posted: VecDeque<(u32, RxDescriptor)>,
}

struct SimEvq {
    ring: Arc<EventRing>,
    vector: u32,
}

#[derive(Default)]
struct Faults {
    reset: bool,
    init: bool,
    mac: bool,
    drop_flushes: bool,
}

#[derive(Default)]
struct SimState {
    evqs: HashMap<usize, SimEvq>,
    txqs: HashMap<TxQueueId, SimTxq>,
    rxqs: HashMap<usize, SimRxq>,
    wire: Vec<WireFrame>,
    irq: Option<IrqHandler>,
    moderation: Vec<(usize, u32)>,
    resets: Vec<ResetKind>,
    inits: usize,
    finis: usize,
    refills: usize,
    mac: Option<MacConfig>,
    stats: MacStats,
    faults: Faults,
    auto_complete: bool,
}

/// A simulated hardware generation.
pub struct SimFamily {
    caps: FamilyCaps,
    state: Mutex<SimState>,
}

impl SimFamily {
    pub fn new() -> Self {
        Self::with_caps(FamilyCaps {
            name: "sim",
            ..FamilyCaps::default()
        })
    }

    pub fn with_caps(caps: FamilyCaps) -> Self {
        SimFamily {
            caps,
            state: Mutex::new(SimState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }

    /// Post an event on `channel`'s event queue and raise its interrupt.
    /// Returns false if the queue does not exist or is full.
    pub fn inject_event(&self, channel: usize, ev: Event) -> bool {
        let (posted, fire) = {
            let st = self.state();
            post(&st, channel, ev)
        };
        if let Some((irq, vector)) = fire {
            irq.fire(vector);
        }
        posted
    }

    /// Signal a hardware fault on `channel`.
    pub fn inject_fault(&self, channel: usize, fault: HwFault) -> bool {
        self.inject_event(channel, Event::Fault(fault))
    }

    /// Deliver `data` into the next posted receive buffer of `channel`. The
    /// completion reports the full length even when the buffer is shorter,
    /// as an overlength write would.
    pub fn receive(&self, channel: usize, data: &[u8], flags: RxEventFlags) -> bool {
        let (index, fire) = {
            let mut st = self.state();
            let Some((index, desc)) = st.rxqs.get_mut(&channel).and_then(|q| q.posted.pop_front())
            else {
                return false;
            };
            let n = data.len().min(desc.len as usize);
            // Safety: descriptors point at live receive buffers of at least
            // `desc.len` bytes, mapped by an identity mapper.
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), desc.addr.0 as *mut u8, n);
            }
            st.stats.rx_frames += 1;
            st.stats.rx_octets += data.len() as u64;
            let ev = Event::Rx {
                index: index as u16,
                len: data.len().min(u16::MAX as usize) as u16,
                flags,
            };
            let (posted, fire) = post(&st, channel, ev);
            if !posted {
                return false;
            }
            (index, fire)
        };
        trace!("sim: rx{channel} frame of {} bytes into index {index}", data.len());
        if let Some((irq, vector)) = fire {
            irq.fire(vector);
        }
        true
    }

    /// Complete every descriptor pushed to `queue` so far. Returns false if
    /// nothing was outstanding.
    pub fn complete_tx(&self, queue: TxQueueId) -> bool {
        let (posted, fire) = {
            let mut st = self.state();
            let Some(q) = st.txqs.get_mut(&queue) else {
                return false;
            };
            if q.pushed == q.completed {
                return false;
            }
            q.completed = q.pushed;
            let index = q.pushed.wrapping_sub(1) as u16;
            post(
                &st,
                queue.channel,
                Event::Tx {
                    kind: queue.kind.bits(),
                    index,
                },
            )
        };
        if let Some((irq, vector)) = fire {
            irq.fire(vector);
        }
        posted
    }

    /// Complete every transmit queue.
    pub fn complete_all_tx(&self) -> usize {
        let queues: Vec<TxQueueId> = self.state().txqs.keys().copied().collect();
        queues.into_iter().filter(|&q| self.complete_tx(q)).count()
    }

    /// Complete transmits as soon as they are pushed.
    pub fn set_auto_complete(&self, enable: bool) {
        self.state().auto_complete = enable;
    }

    pub fn fail_reset(&self, fail: bool) {
        self.state().faults.reset = fail;
    }

    pub fn fail_init(&self, fail: bool) {
        self.state().faults.init = fail;
    }

    pub fn fail_mac(&self, fail: bool) {
        self.state().faults.mac = fail;
    }

    /// Never confirm queue flushes.
    pub fn drop_flushes(&self, drop: bool) {
        self.state().faults.drop_flushes = drop;
    }

    /// Frames transmitted so far.
    pub fn wire_frames(&self) -> Vec<WireFrame> {
        self.state().wire.clone()
    }

    pub fn take_wire_frames(&self) -> Vec<WireFrame> {
        std::mem::take(&mut self.state().wire)
    }

    /// Descriptors pushed to `queue` since it was initialised.
    pub fn tx_descriptors(&self, queue: TxQueueId) -> Vec<TxDescriptor> {
        self.state()
            .txqs
            .get(&queue)
            .map(|q| q.descs.clone())
            .unwrap_or_default()
    }

    /// Receive buffers posted on `channel` and not yet filled.
    pub fn rx_posted(&self, channel: usize) -> usize {
        self.state().rxqs.get(&channel).map_or(0, |q| q.posted.len())
    }

    /// Every moderation value pushed, in order.
    pub fn moderation_log(&self) -> Vec<(usize, u32)> {
        self.state().moderation.clone()
    }

    /// Every reset executed, in order.
    pub fn resets(&self) -> Vec<ResetKind> {
        self.state().resets.clone()
    }

    pub fn init_count(&self) -> usize {
        self.state().inits
    }

    pub fn fini_count(&self) -> usize {
        self.state().finis
    }

    /// Refill events requested by the driver.
    pub fn refill_requests(&self) -> usize {
        self.state().refills
    }

    pub fn mac(&self) -> Option<MacConfig> {
        self.state().mac.clone()
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.state().irq.is_some()
    }

    pub fn has_event_queue(&self, channel: usize) -> bool {
        self.state().evqs.contains_key(&channel)
    }
}

impl Default for SimFamily {
    fn default() -> Self {
        Self::new()
    }
}

/// Post `ev` and report the interrupt to raise, if interrupts are on.
fn post(st: &SimState, channel: usize, ev: Event) -> (bool, Option<(IrqHandler, u32)>) {
    let Some(evq) = st.evqs.get(&channel) else {
        return (false, None);
    };
    if !evq.ring.post(ev) {
        return (false, None);
    }
    (true, st.irq.clone().map(|irq| (irq, evq.vector)))
}

impl NicFamily for SimFamily {
    fn caps(&self) -> FamilyCaps {
        self.caps.clone()
    }

    fn probe(&self, regs: RegisterWindow) -> Result<(), HwError> {
        if regs.len == 0 {
            return Err(HwError::Probe("empty register window".into()));
        }
        Ok(())
    }

    fn init(&self) -> Result<(), HwError> {
        let mut st = self.state();
        st.inits += 1;
        if st.faults.init {
            return Err(HwError::Init("injected".into()));
        }
        Ok(())
    }

    fn fini(&self) {
        self.state().finis += 1;
    }

    fn reset(&self, kind: ResetKind) -> Result<(), HwError> {
        let mut st = self.state();
        st.resets.push(kind);
        if st.faults.reset {
            return Err(HwError::Reset("injected".into()));
        }
        Ok(())
    }

    fn map_reset_reason(&self, reason: ResetReason) -> ResetKind {
        crate::reset::default_reset_policy(reason)
    }

    fn update_stats(&self, stats: &mut MacStats) {
        *stats = self.state().stats;
    }

    fn reconfigure_mac(&self, mac: &MacConfig) -> Result<(), HwError> {
        let mut st = self.state();
        if st.faults.mac {
            return Err(HwError::Mac("injected".into()));
        }
        st.mac = Some(mac.clone());
        Ok(())
    }

    fn init_event_queue(&self, channel: usize, ring: Arc<EventRing>, vector: u32) {
        self.state().evqs.insert(channel, SimEvq { ring, vector });
    }

    fn fini_event_queue(&self, channel: usize) {
        self.state().evqs.remove(&channel);
    }

    fn rearm_event_queue(&self, channel: usize, _read_count: u32) {
        // Re-raise the interrupt when events arrived after the read point.
        let fire = {
            let st = self.state();
            st.evqs
                .get(&channel)
                .filter(|q| q.ring.outstanding() > 0)
                .and_then(|q| st.irq.clone().map(|irq| (irq, q.vector)))
        };
        if let Some((irq, vector)) = fire {
            irq.fire(vector);
        }
    }

    fn push_irq_moderation(&self, channel: usize, usecs: u32) {
        self.state().moderation.push((channel, usecs));
    }

    fn generate_refill_event(&self, channel: usize) {
        self.state().refills += 1;
        self.inject_event(channel, Event::Refill);
    }

    fn init_tx_queue(&self, queue: TxQueueId, _entries: u32) {
        self.state().txqs.insert(queue, SimTxq::default());
    }

    fn push_tx_descriptors(&self, queue: TxQueueId, first: u32, descs: &[TxDescriptor]) {
        let complete = {
            let mut st = self.state();
            let st = &mut *st;
            let q = st.txqs.entry(queue).or_default();
            for d in descs {
                // Safety: the transmit ring keeps every pushed buffer alive
                // until its completion, and the mapper is the identity.
                let bytes = unsafe { std::slice::from_raw_parts(d.addr.0 as *const u8, d.len as usize) };
                q.partial.extend_from_slice(bytes);
                q.descs.push(*d);
                if !d.cont {
                    let data = std::mem::take(&mut q.partial);
                    st.stats.tx_frames += 1;
                    st.stats.tx_octets += data.len() as u64;
                    st.wire.push(WireFrame { queue, data });
                }
            }
            q.pushed = first.wrapping_add(descs.len() as u32);
            st.auto_complete
        };
        if complete {
            self.complete_tx(queue);
        }
    }

    fn flush_tx_queue(&self, queue: TxQueueId) {
        if self.state().faults.drop_flushes {
            return;
        }
        self.inject_event(
            queue.channel,
            Event::TxFlushDone {
                kind: queue.kind.bits(),
            },
        );
    }

    fn fini_tx_queue(&self, queue: TxQueueId) {
        self.state().txqs.remove(&queue);
    }

    fn init_rx_queue(&self, channel: usize, _entries: u32) {
        self.state().rxqs.insert(channel, SimRxq::default());
    }

    fn push_rx_descriptors(&self, channel: usize, first: u32, descs: &[RxDescriptor]) {
        let mut st = self.state();
        let q = st.rxqs.entry(channel).or_default();
        for (i, d) in descs.iter().enumerate() {
            q.posted.push_back((first.wrapping_add(i as u32), *d));
        }
    }

    fn flush_rx_queue(&self, channel: usize) {
        if self.state().faults.drop_flushes {
            return;
        }
        self.inject_event(channel, Event::RxFlushDone);
    }

    fn fini_rx_queue(&self, channel: usize) {
        self.state().rxqs.remove(&channel);
    }

    fn enable_interrupts(&self, handler: IrqHandler) {
        self.state().irq = Some(handler);
    }

    fn disable_interrupts(&self) {
        self.state().irq = None;
    }
}

// ── Network stack ───────────────────────────────────────────────────

/// Upper-layer notifications recorded by [`SimStack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEvent {
    Detach,
    Attach,
    ResetDone { kind: ResetKind, recovered: bool },
}

#[derive(Default)]
struct StackLog {
    packets: Vec<RxPacket>,
    wakes: Vec<TxQueueId>,
    events: Vec<StackEvent>,
}

/// A network stack that records everything it is handed.
#[derive(Default)]
pub struct SimStack {
    log: Mutex<StackLog>,
    attached: AtomicBool,
    on_attach: Mutex<Option<AttachHook>>,
}

type AttachHook = Box<dyn Fn() + Send + Sync>;

impl SimStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_packets(&self) -> Vec<RxPacket> {
        std::mem::take(&mut lock(&self.log).packets)
    }

    pub fn packet_count(&self) -> usize {
        lock(&self.log).packets.len()
    }

    pub fn wakes(&self) -> Vec<TxQueueId> {
        lock(&self.log).wakes.clone()
    }

    pub fn events(&self) -> Vec<StackEvent> {
        lock(&self.log).events.clone()
    }

    /// Run `hook` every time the device re-attaches the stack.
    pub fn on_attach(&self, hook: impl Fn() + Send + Sync + 'static) {
        *lock(&self.on_attach) = Some(Box::new(hook));
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Wait until at least `n` packets have arrived.
    pub fn wait_for_packets(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.packet_count() < n {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl NetStack for SimStack {
    fn receive(&self, packet: RxPacket) {
        lock(&self.log).packets.push(packet);
    }

    fn wake_queue(&self, queue: TxQueueId) {
        lock(&self.log).wakes.push(queue);
    }

    fn detach(&self) {
        self.attached.store(false, Ordering::Release);
        lock(&self.log).events.push(StackEvent::Detach);
    }

    fn attach(&self) {
        self.attached.store(true, Ordering::Release);
        lock(&self.log).events.push(StackEvent::Attach);
        if let Some(hook) = lock(&self.on_attach).as_ref() {
            hook();
        }
    }

    fn reset_done(&self, kind: ResetKind, recovered: bool) {
        lock(&self.log).events.push(StackEvent::ResetDone { kind, recovered });
    }
}
