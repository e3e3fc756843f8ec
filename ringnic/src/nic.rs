//! The adapter: probe, open/close, transmit entry points, reconfiguration
//! and the reset worker.
//!
//! Lock order: control lock, then the datapath lock, then channel locks,
//! then transmit locks. Polls and transmits never take the control lock.

use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};

use crate::bus::Bus;
use crate::config::{Config, validate_mtu};
use crate::datapath::{Datapath, DatapathParams};
use crate::dma::DmaMapper;
use crate::error::{BusError, DropReason, Error, XmitError};
use crate::family::{FamilyCaps, MacConfig, NicFamily};
use crate::interrupt::{self, InterruptPlan, IrqHandler};
use crate::metrics::{MacStats, NicMetrics, Stats};
use crate::packet::Packet;
use crate::reset::{DeviceState, ResetController, ResetKind, ResetReason};
use crate::rx::Quarantine;
use crate::service::{self, ServiceHandle};
use crate::stack::NetStack;
use crate::tx::TxQueueId;
use crate::worker::{self, Pollers};

/// Narrowest DMA mask tried during probe.
const MIN_DMA_BITS: u8 = 32;

/// Collaborators handed to [`Nic::probe`].
pub struct NicDeps {
    pub bus: Arc<dyn Bus>,
    pub family: Arc<dyn NicFamily>,
    pub mapper: Arc<dyn DmaMapper>,
    pub stack: Arc<dyn NetStack>,
}

/// State guarded by the control lock.
struct Control {
    config: Config,
    mac: MacConfig,
    open: bool,
    irq: IrqHandler,
    pollers: Option<Pollers>,
    service: Option<ServiceHandle>,
}

pub(crate) struct NicInner {
    pub(crate) family: Arc<dyn NicFamily>,
    bus: Arc<dyn Bus>,
    mapper: Arc<dyn DmaMapper>,
    pub(crate) stack: Arc<dyn NetStack>,
    caps: FamilyCaps,
    ctl: Mutex<Control>,
    datapath: RwLock<Arc<Datapath>>,
    pub(crate) resets: ResetController,
    pub(crate) metrics: NicMetrics,
    mac_stats: Mutex<MacStats>,
    quarantine: Quarantine,
    kick_tx: Sender<()>,
    kick_rx: Receiver<()>,
    /// Handed to worker threads so they never keep the device alive.
    me: Weak<NicInner>,
}

/// A probed network adapter.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use ringnic::sim::{SimBus, SimDma, SimFamily, SimStack};
/// use ringnic::{ConfigBuilder, Nic, NicDeps};
///
/// let config = ConfigBuilder::new()
///     .channels(2)
///     .spawn_pollers(false)
///     .service_thread(false)
///     .build()
///     .unwrap();
/// let nic = Nic::probe(
///     NicDeps {
///         bus: Arc::new(SimBus::new(8)),
///         family: Arc::new(SimFamily::new()),
///         mapper: Arc::new(SimDma::new()),
///         stack: Arc::new(SimStack::new()),
///     },
///     config,
/// )
/// .unwrap();
/// nic.open().unwrap();
/// assert_eq!(nic.plan().n_channels, 2);
/// nic.remove();
/// ```
pub struct Nic {
    inner: Arc<NicInner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Nic {
    // ── Probe / remove ──────────────────────────────────────────────

    /// Bring up the bus, identify the device, negotiate the DMA mask,
    /// initialise the hardware and allocate interrupts and queues.
    pub fn probe(deps: NicDeps, config: Config) -> Result<Nic, Error> {
        config.validate()?;
        deps.bus.enable_device()?;
        match Self::bring_up(&deps, config) {
            Ok(nic) => Ok(nic),
            Err(e) => {
                error!("probe failed: {e}");
                deps.bus.disable_interrupts();
                deps.bus.disable_device();
                Err(e)
            }
        }
    }

    fn bring_up(deps: &NicDeps, config: Config) -> Result<Nic, Error> {
        let regs = deps.bus.map_registers(0)?;
        deps.family.probe(regs)?;
        let caps = deps.family.caps();
        let bits = negotiate_dma_mask(&*deps.bus, caps.max_dma_bits)?;
        deps.family.init()?;

        let plan = interrupt::allocate(&*deps.bus, &config, caps.max_channels)?;
        let metrics = NicMetrics::new();
        let quarantine = Quarantine::default();
        let mac = MacConfig {
            mtu: config.mtu,
            ..MacConfig::default()
        };
        let datapath = Datapath::build(
            &DatapathParams {
                family: &deps.family,
                mapper: &deps.mapper,
                caps: &caps,
                quarantine: &quarantine,
                metrics: &metrics,
                config: &config,
                mtu: mac.mtu,
            },
            plan.clone(),
        );
        info!(
            "{}: probed, {bits}-bit DMA, {:?} interrupts, {} channels",
            caps.name, plan.mode, plan.n_channels
        );

        let (kick_tx, kick_rx) = crossbeam_channel::bounded(1);
        Ok(Nic {
            inner: Arc::new_cyclic(|me| NicInner {
                family: Arc::clone(&deps.family),
                bus: Arc::clone(&deps.bus),
                mapper: Arc::clone(&deps.mapper),
                stack: Arc::clone(&deps.stack),
                caps,
                ctl: Mutex::new(Control {
                    config,
                    mac,
                    open: false,
                    irq: IrqHandler::new(&plan),
                    pollers: None,
                    service: None,
                }),
                datapath: RwLock::new(Arc::new(datapath)),
                resets: ResetController::new(),
                metrics,
                mac_stats: Mutex::new(MacStats::default()),
                quarantine,
                kick_tx,
                kick_rx,
                me: me.clone(),
            }),
        })
    }

    /// Close the device and release it from the bus. Quarantined receive
    /// buffers are freed here.
    pub fn remove(self) {
        self.close();
        let inner = &self.inner;
        inner.family.fini();
        inner.bus.disable_interrupts();
        inner.bus.disable_device();
        let leaked = std::mem::take(&mut *lock(&inner.quarantine));
        if !leaked.is_empty() {
            info!("releasing {} quarantined receive buffers", leaked.len());
        }
        info!("{}: removed", inner.caps.name);
    }

    // ── Open / close ────────────────────────────────────────────────

    /// Start every channel, enable interrupts and the worker threads.
    pub fn open(&self) -> Result<(), Error> {
        let inner = &self.inner;
        let mut ctl = lock(&inner.ctl);
        if inner.resets.state() == DeviceState::Disabled {
            return Err(Error::Disabled);
        }
        if ctl.open {
            return Ok(());
        }
        inner.family.reconfigure_mac(&ctl.mac)?;
        let dp = inner.datapath();
        inner.family.enable_interrupts(ctl.irq.clone());
        dp.start_all(&*inner.family);
        ctl.open = true;

        if ctl.config.worker.spawn_pollers {
            match worker::spawn_pollers(inner.me.clone(), &ctl.irq, dp.n_channels(), &ctl.config) {
                Ok(p) => ctl.pollers = Some(p),
                Err(e) => {
                    drop(ctl);
                    self.close();
                    return Err(e);
                }
            }
        }
        if ctl.config.service_thread {
            let tick = Duration::from_millis(ctl.config.service_tick_ms);
            match service::spawn(inner.me.clone(), inner.kick_rx.clone(), inner.kick_tx.clone(), tick) {
                Ok(s) => ctl.service = Some(s),
                Err(e) => {
                    drop(ctl);
                    self.close();
                    return Err(e);
                }
            }
        }
        inner.stack.attach();
        info!("{}: open", inner.caps.name);
        Ok(())
    }

    /// Stop every channel and the worker threads. Outstanding transmits
    /// are abandoned.
    pub fn close(&self) {
        let inner = &self.inner;
        let (pollers, service) = {
            let mut ctl = lock(&inner.ctl);
            if !ctl.open {
                return;
            }
            ctl.open = false;
            // A disabled device has already detached the stack.
            if inner.resets.state() != DeviceState::Disabled {
                inner.stack.detach();
            }
            inner.quiesce(&ctl.config, &inner.datapath());
            (ctl.pollers.take(), ctl.service.take())
        };
        // Workers take the control lock themselves; join them without it.
        if let Some(p) = pollers {
            p.shutdown();
        }
        if let Some(s) = service {
            s.shutdown();
        }
        info!("{}: closed", inner.caps.name);
    }

    // ── Transmit ────────────────────────────────────────────────────

    /// Transmit on the queue chosen by [`select_queue`](Self::select_queue).
    pub fn transmit(&self, packet: Packet) -> Result<(), XmitError> {
        if self.inner.resets.state() == DeviceState::Disabled {
            return Err(XmitError::Dropped(DropReason::DeviceDisabled));
        }
        let dp = self.inner.datapath();
        let id = dp.select_queue(&packet);
        match dp.tx_queue(id) {
            Some(q) => q.enqueue(packet),
            None => Err(XmitError::Dropped(DropReason::NoQueue)),
        }
    }

    /// Transmit on an explicit queue.
    pub fn transmit_on(&self, id: TxQueueId, packet: Packet) -> Result<(), XmitError> {
        if self.inner.resets.state() == DeviceState::Disabled {
            return Err(XmitError::Dropped(DropReason::DeviceDisabled));
        }
        let dp = self.inner.datapath();
        match dp.tx_queue(id) {
            Some(q) => q.enqueue(packet),
            None => Err(XmitError::Dropped(DropReason::NoQueue)),
        }
    }

    pub fn select_queue(&self, packet: &Packet) -> TxQueueId {
        self.inner.datapath().select_queue(packet)
    }

    // ── Polling ─────────────────────────────────────────────────────

    /// Run one poll pass on `channel`. Returns the budget spent; less than
    /// `budget` means the channel's event queue was re-armed.
    pub fn poll_channel(&self, channel: usize, budget: usize) -> Result<usize, Error> {
        self.inner.poll(channel, budget)
    }

    // ── Statistics and inspection ───────────────────────────────────

    pub fn stats(&self) -> Stats {
        let mut mac = lock(&self.inner.mac_stats);
        self.inner.family.update_stats(&mut mac);
        Stats::from_counters(&self.inner.metrics, *mac)
    }

    /// Counter handles, for registration with an exposition layer.
    pub fn metrics(&self) -> &NicMetrics {
        &self.inner.metrics
    }

    pub fn state(&self) -> DeviceState {
        self.inner.resets.state()
    }

    pub fn plan(&self) -> InterruptPlan {
        self.inner.datapath().plan().clone()
    }

    pub fn config(&self) -> Config {
        lock(&self.inner.ctl).config.clone()
    }

    pub fn mac_config(&self) -> MacConfig {
        lock(&self.inner.ctl).mac.clone()
    }

    /// Receive descriptors currently posted on `channel`.
    pub fn rx_fill_level(&self, channel: usize) -> Option<u32> {
        let dp = self.inner.datapath();
        let c = dp.channel(channel)?;
        c.rx_queue().map(|q| q.fill_level())
    }

    /// Lowest receive fill level seen on `channel` since its last start.
    pub fn rx_min_fill(&self, channel: usize) -> Option<u32> {
        let dp = self.inner.datapath();
        let c = dp.channel(channel)?;
        c.rx_queue().and_then(|q| q.min_fill())
    }

    /// Interrupt moderation currently applied to `channel`.
    pub fn moderation_usecs(&self, channel: usize) -> Option<u32> {
        let dp = self.inner.datapath();
        let c = dp.channel(channel)?;
        Some(c.moderation_usecs())
    }

    /// Descriptors outstanding on a transmit queue.
    pub fn tx_fill_level(&self, id: TxQueueId) -> Option<u32> {
        self.inner.datapath().tx_queue(id).map(|q| q.fill_level())
    }

    pub fn tx_queue_stopped(&self, id: TxQueueId) -> Option<bool> {
        self.inner.datapath().tx_queue(id).map(|q| q.is_stopped())
    }

    // ── Reconfiguration ─────────────────────────────────────────────

    pub fn set_mtu(&self, mtu: u32) -> Result<(), Error> {
        validate_mtu(mtu)?;
        let inner = &self.inner;
        let mut ctl = inner.running_ctl()?;
        if ctl.mac.mtu == mtu {
            return Ok(());
        }
        let mut mac = ctl.mac.clone();
        mac.mtu = mtu;
        let plan = inner.datapath().plan().clone();
        let dp = inner.build_datapath(&ctl.config, mtu, plan);
        ctl.mac = mac;
        inner.swap_datapath(&mut ctl, dp, None)?;
        info!("{}: MTU {mtu}", inner.caps.name);
        Ok(())
    }

    pub fn set_mac_address(&self, address: [u8; 6]) -> Result<(), Error> {
        self.update_mac(|mac| mac.address = address)
    }

    pub fn set_multicast(&self, list: Vec<[u8; 6]>, promiscuous: bool) -> Result<(), Error> {
        self.update_mac(|mac| {
            mac.multicast = list;
            mac.promiscuous = promiscuous;
        })
    }

    fn update_mac(&self, f: impl FnOnce(&mut MacConfig)) -> Result<(), Error> {
        let inner = &self.inner;
        let mut ctl = inner.running_ctl()?;
        let mut mac = ctl.mac.clone();
        f(&mut mac);
        inner.family.reconfigure_mac(&mac)?;
        ctl.mac = mac;
        Ok(())
    }

    /// Resize every ring. The replacement queues are built before the old
    /// ones are torn down.
    pub fn set_ring_sizes(&self, rxq_entries: u32, txq_entries: u32) -> Result<(), Error> {
        let inner = &self.inner;
        let mut ctl = inner.running_ctl()?;
        let mut config = ctl.config.clone();
        config.rxq_entries = rxq_entries;
        config.txq_entries = txq_entries;
        config.validate()?;
        let plan = inner.datapath().plan().clone();
        let dp = inner.build_datapath(&config, ctl.mac.mtu, plan);
        ctl.config = config;
        inner.swap_datapath(&mut ctl, dp, None)?;
        info!("{}: rings rx {rxq_entries} tx {txq_entries}", inner.caps.name);
        Ok(())
    }

    /// Change receive parallelism within the interrupt vectors already
    /// allocated. Only possible with MSI-X.
    pub fn set_channel_count(&self, channels: usize) -> Result<(), Error> {
        let inner = &self.inner;
        let mut ctl = inner.running_ctl()?;
        let current = inner.datapath().plan().clone();
        let plan = current
            .with_channels(channels, ctl.config.separate_tx_channels)
            .ok_or_else(|| {
                Error::Config(format!(
                    "{channels} channels not available with {} {:?} vectors",
                    current.vectors.len(),
                    current.mode
                ))
            })?;
        let mut config = ctl.config.clone();
        config.channels = channels;
        let dp = inner.build_datapath(&config, ctl.mac.mtu, plan.clone());
        ctl.config = config;
        inner.swap_datapath(&mut ctl, dp, Some(IrqHandler::new(&plan)))?;
        info!("{}: {} channels", inner.caps.name, plan.n_channels);
        Ok(())
    }

    /// Set interrupt moderation. With `adaptive`, `rx_usecs` becomes the
    /// ceiling of the adaptive range.
    pub fn set_irq_moderation(&self, rx_usecs: u32, tx_usecs: u32, adaptive: bool) -> Result<(), Error> {
        let inner = &self.inner;
        let mut ctl = lock(&inner.ctl);
        let mut config = ctl.config.clone();
        config.moderation.rx_usecs = rx_usecs;
        config.moderation.tx_usecs = tx_usecs;
        config.moderation.adaptive = adaptive;
        config.validate()?;
        inner
            .datapath()
            .set_moderation(rx_usecs, tx_usecs, adaptive, &*inner.family);
        ctl.config = config;
        Ok(())
    }

    // ── Recovery ────────────────────────────────────────────────────

    /// Request a reset. Requests coalesce: only the most severe pending kind
    /// runs.
    pub fn schedule_reset(&self, reason: ResetReason) {
        self.inner.schedule_reset(reason);
    }

    /// Execute pending resets. Returns the kinds executed, most severe first.
    pub fn process_resets(&self) -> Vec<ResetKind> {
        self.inner.process_resets()
    }

    /// Transmit watchdog and receive slow-fill timers.
    pub fn run_timers(&self, now: Instant) {
        self.inner.run_timers(now);
    }
}

impl Drop for Nic {
    fn drop(&mut self) {
        self.close();
    }
}

fn negotiate_dma_mask(bus: &dyn Bus, max_bits: u8) -> Result<u8, Error> {
    for bits in (MIN_DMA_BITS..=max_bits.max(MIN_DMA_BITS)).rev() {
        match bus.set_dma_mask(bits) {
            Ok(()) => return Ok(bits),
            Err(e) => debug!("DMA mask {bits}: {e}"),
        }
    }
    Err(BusError::DmaMask(MIN_DMA_BITS).into())
}

impl NicInner {
    pub(crate) fn datapath(&self) -> Arc<Datapath> {
        Arc::clone(&self.datapath.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn running_ctl(&self) -> Result<MutexGuard<'_, Control>, Error> {
        let ctl = lock(&self.ctl);
        if self.resets.state() == DeviceState::Disabled {
            return Err(Error::Disabled);
        }
        Ok(ctl)
    }

    fn build_datapath(&self, config: &Config, mtu: u32, plan: InterruptPlan) -> Datapath {
        Datapath::build(
            &DatapathParams {
                family: &self.family,
                mapper: &self.mapper,
                caps: &self.caps,
                quarantine: &self.quarantine,
                metrics: &self.metrics,
                config,
                mtu,
            },
            plan,
        )
    }

    pub(crate) fn poll(&self, channel: usize, budget: usize) -> Result<usize, Error> {
        let dp = self.datapath();
        let mut c = dp.channel(channel).ok_or(Error::InvalidChannel(channel))?;
        Ok(c.poll(budget, self))
    }

    /// Stop interrupts and polling, flush and release every queue. Returns
    /// the number of queues whose flush did not complete.
    fn quiesce(&self, config: &Config, dp: &Datapath) -> usize {
        self.family.disable_interrupts();
        dp.stop_all();
        let interval = Duration::from_micros(config.flush_poll_interval_us);
        let left = dp.flush_all(&*self.family, config.flush_poll_count, interval);
        if left > 0 {
            self.metrics.dev.flush_failures.increment();
            warn!("{left} queues did not confirm flush");
        }
        dp.fini_all(&*self.family);
        left
    }

    fn resume(&self, ctl: &Control, dp: &Datapath) {
        self.family.enable_interrupts(ctl.irq.clone());
        dp.start_all(&*self.family);
    }

    /// Replace the datapath. An open device is quiesced around the swap and
    /// restarted on the new queues; pollers are restarted when the
    /// interrupt routing changes.
    fn swap_datapath(&self, ctl: &mut Control, dp: Datapath, irq: Option<IrqHandler>) -> Result<(), Error> {
        let dp = Arc::new(dp);
        let old = self.datapath();
        let open = ctl.open;
        if open {
            self.stack.detach();
            self.quiesce(&ctl.config, &old);
        }
        let restart_pollers = irq.is_some() && ctl.pollers.is_some();
        if restart_pollers && let Some(p) = ctl.pollers.take() {
            p.shutdown();
        }
        if let Some(irq) = irq {
            ctl.irq = irq;
        }
        *self.datapath.write().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&dp);
        drop(old);

        if !open {
            return Ok(());
        }
        let res = self.family.reconfigure_mac(&ctl.mac);
        self.resume(ctl, &dp);
        if restart_pollers {
            ctl.pollers = Some(worker::spawn_pollers(
                self.me.clone(),
                &ctl.irq,
                dp.n_channels(),
                &ctl.config,
            )?);
        }
        self.stack.attach();
        res.map_err(Error::from)
    }

    // ── Recovery ────────────────────────────────────────────────────

    pub(crate) fn schedule_reset(&self, reason: ResetReason) {
        if self.resets.state() == DeviceState::Disabled {
            return;
        }
        let kind = self.family.map_reset_reason(reason);
        if self.resets.request(kind) {
            info!("{}: scheduling {kind} reset ({reason:?})", self.caps.name);
            // A full channel means the worker is already due to run.
            let _ = self.kick_tx.try_send(());
        }
    }

    pub(crate) fn process_resets(&self) -> Vec<ResetKind> {
        let mut done = Vec::new();
        while self.resets.is_pending() {
            let mut ctl = lock(&self.ctl);
            if self.resets.state() == DeviceState::Disabled {
                self.resets.clear_through(ResetKind::Disable);
                break;
            }
            // Requests may have arrived while waiting for the lock.
            let Some(kind) = self.resets.most_severe() else {
                break;
            };
            done.push(kind);
            if kind == ResetKind::Disable {
                self.disable(&mut ctl);
                self.resets.clear_through(kind);
                self.stack.reset_done(kind, false);
                break;
            }

            info!("{}: resetting ({kind})", self.caps.name);
            self.resets.set_state(DeviceState::Resetting);
            match self.reset(&mut ctl, kind) {
                Ok(()) => {
                    self.metrics.dev.resets.increment();
                    info!("{}: {kind} reset complete", self.caps.name);
                    self.stack.reset_done(kind, true);
                }
                Err(e) => {
                    error!("{}: {kind} reset failed: {e}", self.caps.name);
                    self.metrics.dev.reset_failures.increment();
                    self.disable(&mut ctl);
                    self.resets.clear_through(ResetKind::Disable);
                    self.stack.reset_done(kind, false);
                    break;
                }
            }
        }
        done
    }

    fn reset(&self, ctl: &mut Control, kind: ResetKind) -> Result<(), Error> {
        let dp = self.datapath();
        if ctl.open {
            self.stack.detach();
            if self.quiesce(&ctl.config, &dp) > 0 {
                let next = kind.escalate();
                if next > kind {
                    error!("{}: flush failed during {kind} reset, scheduling {next}", self.caps.name);
                    self.resets.request(next);
                }
            }
        }
        self.family.fini();
        self.family.reset(kind)?;
        self.family.init()?;
        self.family.reconfigure_mac(&ctl.mac)?;
        // Pollers bail out while a reset is pending, so the request must be
        // retired before the channels are re-armed.
        self.resets.set_state(DeviceState::Running);
        self.resets.clear_through(kind);
        if ctl.open {
            self.resume(ctl, &dp);
            self.stack.attach();
        }
        Ok(())
    }

    /// Take the device out of service until it is probed again.
    fn disable(&self, ctl: &mut Control) {
        // A failed reset has already detached the stack.
        let detached = self.resets.state() == DeviceState::Resetting;
        self.resets.set_state(DeviceState::Disabled);
        if ctl.open && !detached {
            self.stack.detach();
        }
        self.quiesce(&ctl.config, &self.datapath());
        self.family.fini();
        error!("{}: device disabled", self.caps.name);
    }

    pub(crate) fn run_timers(&self, now: Instant) {
        if self.resets.state() != DeviceState::Running {
            return;
        }
        let timeout = {
            let ctl = lock(&self.ctl);
            if !ctl.open {
                return;
            }
            Duration::from_millis(ctl.config.tx_timeout_ms)
        };
        let dp = self.datapath();
        for q in dp.tx_queues() {
            if q.stalled(timeout) {
                q.touch();
                self.metrics.dev.watchdog_fires.increment();
                error!("{}: transmit timed out after {timeout:?}", q.id());
                self.schedule_reset(ResetReason::TxWatchdog);
            }
        }
        dp.run_slow_fill(now, &*self.family);
    }
}
