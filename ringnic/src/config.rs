use crate::error::Error;
use crate::interrupt::InterruptMode;

/// Configuration for one adapter.
#[derive(Clone, Debug)]
pub struct Config {
    /// Receive descriptors per receive queue (power of 2).
    pub rxq_entries: u32,
    /// Transmit descriptors per transmit queue (power of 2).
    pub txq_entries: u32,
    /// Initial MTU. Sizes receive buffers.
    pub mtu: u32,
    /// Most capable interrupt mode to try. Less capable modes are used as
    /// fallbacks.
    pub interrupt_mode: InterruptMode,
    /// Receive parallelism. 0 = number of online CPUs.
    pub channels: usize,
    /// Serve transmit completions on their own channels instead of sharing
    /// channels with receive queues.
    pub separate_tx_channels: bool,
    /// Receive ring settings.
    pub rx: RxConfig,
    /// Interrupt moderation settings.
    pub moderation: ModerationConfig,
    /// Maximum receive completions handled per poll pass.
    pub napi_budget: usize,
    /// A stopped transmit queue without progress for this long triggers a
    /// reset.
    pub tx_timeout_ms: u64,
    /// Polls of the event queues while waiting for flush completion.
    pub flush_poll_count: u32,
    /// Delay between flush polls in microseconds.
    pub flush_poll_interval_us: u64,
    /// Poller thread settings.
    pub worker: WorkerConfig,
    /// Run the background service thread (reset worker, watchdog,
    /// slow-fill timers). When disabled, callers drive
    /// [`Nic::process_resets`](crate::nic::Nic::process_resets) and
    /// [`Nic::run_timers`](crate::nic::Nic::run_timers) themselves.
    pub service_thread: bool,
    /// Service thread timer period in milliseconds.
    pub service_tick_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rxq_entries: 1024,
            txq_entries: 1024,
            mtu: 1500,
            interrupt_mode: InterruptMode::Msix,
            channels: 0,
            separate_tx_channels: false,
            rx: RxConfig::default(),
            moderation: ModerationConfig::default(),
            napi_budget: 64,
            tx_timeout_ms: 5000,
            flush_poll_count: 100,
            flush_poll_interval_us: 10_000,
            worker: WorkerConfig::default(),
            service_thread: true,
            service_tick_ms: 100,
        }
    }
}

pub const MIN_RING_ENTRIES: u32 = 32;
pub const MAX_RING_ENTRIES: u32 = 65536;
pub const MIN_MTU: u32 = 68;
pub const MAX_MTU: u32 = 9216;

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        for (name, n) in [("rxq_entries", self.rxq_entries), ("txq_entries", self.txq_entries)] {
            if !n.is_power_of_two() || !(MIN_RING_ENTRIES..=MAX_RING_ENTRIES).contains(&n) {
                return Err(Error::Config(format!(
                    "{name} must be a power of two in {MIN_RING_ENTRIES}..={MAX_RING_ENTRIES}"
                )));
            }
        }
        validate_mtu(self.mtu)?;
        if self.rx.batch == 0 {
            return Err(Error::Config("rx.batch must be > 0".into()));
        }
        if self.rx.refill_threshold_pct > self.rx.refill_limit_pct || self.rx.refill_limit_pct > 100
        {
            return Err(Error::Config(
                "rx refill percentages must satisfy threshold <= limit <= 100".into(),
            ));
        }
        let m = &self.moderation;
        if m.step_usecs == 0 {
            return Err(Error::Config("moderation.step_usecs must be > 0".into()));
        }
        if m.floor_usecs > m.rx_usecs {
            return Err(Error::Config(
                "moderation.floor_usecs must not exceed rx_usecs".into(),
            ));
        }
        if m.low_thresh >= m.high_thresh {
            return Err(Error::Config(
                "moderation.low_thresh must be below high_thresh".into(),
            ));
        }
        if self.napi_budget == 0 {
            return Err(Error::Config("napi_budget must be > 0".into()));
        }
        if self.flush_poll_count == 0 {
            return Err(Error::Config("flush_poll_count must be > 0".into()));
        }
        if self.service_tick_ms == 0 {
            return Err(Error::Config("service_tick_ms must be > 0".into()));
        }
        Ok(())
    }
}

pub(crate) fn validate_mtu(mtu: u32) -> Result<(), Error> {
    if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
        return Err(Error::Config(format!(
            "mtu must be in {MIN_MTU}..={MAX_MTU}"
        )));
    }
    Ok(())
}

/// How receive buffers are allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxAllocMethod {
    /// Switch between the other two based on how traffic is delivered.
    Auto,
    /// One dedicated, individually mapped buffer per packet.
    PerPacket,
    /// Pages mapped once and shared by two buffers.
    Page,
}

/// Receive ring settings.
#[derive(Clone, Debug)]
pub struct RxConfig {
    /// Refill once the fill level drops below this percentage of the
    /// usable ring.
    pub refill_threshold_pct: u32,
    /// Refill up to this percentage of the usable ring.
    pub refill_limit_pct: u32,
    /// Buffers allocated per refill step.
    pub batch: u32,
    pub alloc_method: RxAllocMethod,
    /// Delay before retrying a refill that left the ring empty.
    pub slow_fill_delay_ms: u64,
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            refill_threshold_pct: 90,
            refill_limit_pct: 95,
            batch: 8,
            alloc_method: RxAllocMethod::Auto,
            slow_fill_delay_ms: 100,
        }
    }
}

/// Interrupt moderation settings.
#[derive(Clone, Debug)]
pub struct ModerationConfig {
    /// Adjust the receive moderation period to the observed load.
    pub adaptive: bool,
    /// Receive moderation period, and the ceiling for adaptive moderation.
    pub rx_usecs: u32,
    /// Moderation period for transmit-only channels.
    pub tx_usecs: u32,
    /// Adaptive adjustment step.
    pub step_usecs: u32,
    /// Adaptive floor.
    pub floor_usecs: u32,
    /// Score per evaluation window below which moderation is reduced.
    pub low_thresh: u32,
    /// Score per evaluation window above which moderation is increased.
    pub high_thresh: u32,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            adaptive: true,
            rx_usecs: 60,
            tx_usecs: 150,
            step_usecs: 5,
            floor_usecs: 5,
            low_thresh: 8000,
            high_thresh: 16000,
        }
    }
}

/// Configuration for per-channel poller threads.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Spawn one poller thread per channel when the device is opened. When
    /// disabled, callers drive [`Nic::poll_channel`](crate::nic::Nic::poll_channel).
    pub spawn_pollers: bool,
    /// Whether to pin each poller to a CPU core.
    pub pin_to_core: bool,
    /// Starting CPU core index for pinning.
    pub core_offset: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            spawn_pollers: true,
            pin_to_core: false,
            core_offset: 0,
        }
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use ringnic::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .ring_sizes(512, 1024)
///     .mtu(9000)
///     .channels(4)
///     .adaptive_moderation(true)
///     .build()
///     .expect("invalid config");
/// assert_eq!(config.txq_entries, 1024);
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Ring settings ────────────────────────────────────────────────

    /// Set receive and transmit ring sizes. Both must be powers of 2.
    pub fn ring_sizes(mut self, rxq_entries: u32, txq_entries: u32) -> Self {
        self.config.rxq_entries = rxq_entries;
        self.config.txq_entries = txq_entries;
        self
    }

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.config.mtu = mtu;
        self
    }

    // ── Channel settings ─────────────────────────────────────────────

    /// Set receive parallelism. 0 = number of online CPUs.
    pub fn channels(mut self, n: usize) -> Self {
        self.config.channels = n;
        self
    }

    pub fn separate_tx_channels(mut self, enable: bool) -> Self {
        self.config.separate_tx_channels = enable;
        self
    }

    pub fn interrupt_mode(mut self, mode: InterruptMode) -> Self {
        self.config.interrupt_mode = mode;
        self
    }

    pub fn napi_budget(mut self, budget: usize) -> Self {
        self.config.napi_budget = budget;
        self
    }

    // ── Receive settings ─────────────────────────────────────────────

    /// Set refill trigger and limit as percentages of the usable ring.
    pub fn rx_refill(mut self, threshold_pct: u32, limit_pct: u32) -> Self {
        self.config.rx.refill_threshold_pct = threshold_pct;
        self.config.rx.refill_limit_pct = limit_pct;
        self
    }

    pub fn rx_batch(mut self, batch: u32) -> Self {
        self.config.rx.batch = batch;
        self
    }

    pub fn rx_alloc_method(mut self, method: RxAllocMethod) -> Self {
        self.config.rx.alloc_method = method;
        self
    }

    pub fn slow_fill_delay_ms(mut self, ms: u64) -> Self {
        self.config.rx.slow_fill_delay_ms = ms;
        self
    }

    // ── Moderation settings ──────────────────────────────────────────

    pub fn adaptive_moderation(mut self, enable: bool) -> Self {
        self.config.moderation.adaptive = enable;
        self
    }

    /// Set receive and transmit moderation periods in microseconds.
    pub fn irq_moderation(mut self, rx_usecs: u32, tx_usecs: u32) -> Self {
        self.config.moderation.rx_usecs = rx_usecs;
        self.config.moderation.tx_usecs = tx_usecs;
        self
    }

    /// Set the adaptive moderation step and floor in microseconds.
    pub fn moderation_step(mut self, step_usecs: u32, floor_usecs: u32) -> Self {
        self.config.moderation.step_usecs = step_usecs;
        self.config.moderation.floor_usecs = floor_usecs;
        self
    }

    pub fn moderation_thresholds(mut self, low: u32, high: u32) -> Self {
        self.config.moderation.low_thresh = low;
        self.config.moderation.high_thresh = high;
        self
    }

    // ── Recovery settings ────────────────────────────────────────────

    pub fn tx_timeout_ms(mut self, ms: u64) -> Self {
        self.config.tx_timeout_ms = ms;
        self
    }

    /// Set how often and how long to poll for flush completion.
    pub fn flush_polling(mut self, count: u32, interval_us: u64) -> Self {
        self.config.flush_poll_count = count;
        self.config.flush_poll_interval_us = interval_us;
        self
    }

    // ── Thread settings ──────────────────────────────────────────────

    pub fn spawn_pollers(mut self, enable: bool) -> Self {
        self.config.worker.spawn_pollers = enable;
        self
    }

    pub fn pin_to_core(mut self, enable: bool) -> Self {
        self.config.worker.pin_to_core = enable;
        self
    }

    pub fn core_offset(mut self, offset: usize) -> Self {
        self.config.worker.core_offset = offset;
        self
    }

    pub fn service_thread(mut self, enable: bool) -> Self {
        self.config.service_thread = enable;
        self
    }

    pub fn service_tick_ms(mut self, ms: u64) -> Self {
        self.config.service_tick_ms = ms;
        self
    }

    /// Get a mutable reference to the underlying config for settings
    /// not covered by builder methods.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Build and validate the config.
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_ring() {
        let err = ConfigBuilder::new().ring_sizes(1000, 1024).build().unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("rxq_entries")));
    }

    #[test]
    fn rejects_inverted_refill() {
        assert!(ConfigBuilder::new().rx_refill(96, 90).build().is_err());
        assert!(ConfigBuilder::new().rx_refill(90, 101).build().is_err());
    }

    #[test]
    fn rejects_bad_moderation() {
        assert!(ConfigBuilder::new().moderation_step(0, 0).build().is_err());
        assert!(ConfigBuilder::new().moderation_thresholds(10, 10).build().is_err());
        assert!(ConfigBuilder::new().irq_moderation(4, 100).build().is_err());
    }

    #[test]
    fn rejects_mtu_out_of_range() {
        assert!(ConfigBuilder::new().mtu(10_000).build().is_err());
        assert!(ConfigBuilder::new().mtu(9000).build().is_ok());
    }
}
