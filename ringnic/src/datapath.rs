//! The per-device arena of channels and transmit queues.
//!
//! A [`Datapath`] is built complete for one configuration (ring sizes, MTU,
//! channel layout) and replaced wholesale when any of those change. Queues
//! refer to their channel by index; transmit queues are additionally shared
//! with producers through `Arc`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;

use crate::buffer::{AllocLevel, RxAllocator};
use crate::channel::{Channel, ChannelParams};
use crate::config::{Config, ModerationConfig};
use crate::dma::DmaMapper;
use crate::event::{TXQ_KINDS, event_queue_entries};
use crate::family::{FamilyCaps, NicFamily};
use crate::headers::max_frame_len;
use crate::interrupt::InterruptPlan;
use crate::metrics::NicMetrics;
use crate::moderation::IrqModeration;
use crate::packet::Packet;
use crate::rx::gro::Gro;
use crate::rx::{Quarantine, RxQueue, RxQueueParams};
use crate::tx::{TxQueue, TxQueueId, TxQueueKind};

/// Everything a datapath is built from besides the channel layout.
pub(crate) struct DatapathParams<'a> {
    pub(crate) family: &'a Arc<dyn NicFamily>,
    pub(crate) mapper: &'a Arc<dyn DmaMapper>,
    pub(crate) caps: &'a FamilyCaps,
    pub(crate) quarantine: &'a Quarantine,
    pub(crate) metrics: &'a NicMetrics,
    pub(crate) config: &'a Config,
    pub(crate) mtu: u32,
}

pub(crate) struct Datapath {
    plan: InterruptPlan,
    channels: Vec<Mutex<Channel>>,
    /// Transmit queues of the transmit channels, `TXQ_KINDS` per channel in
    /// kind order.
    txqs: Vec<Arc<TxQueue>>,
}

impl Datapath {
    pub(crate) fn build(p: &DatapathParams<'_>, plan: InterruptPlan) -> Self {
        let cfg = p.config;
        let buffer_len = max_frame_len(p.mtu) + p.caps.rx_buffer_padding;
        let evq_entries = event_queue_entries(cfg.rxq_entries, cfg.txq_entries);
        let mut channels = Vec::with_capacity(plan.n_channels);
        let mut txqs = Vec::with_capacity(plan.n_tx_channels * TXQ_KINDS as usize);

        for index in 0..plan.n_channels {
            let rxq = plan.has_rx(index).then(|| {
                RxQueue::new(
                    index,
                    RxQueueParams {
                        entries: cfg.rxq_entries,
                        padding: p.caps.rx_buffer_padding,
                        overlength_erratum: p.caps.rx_overlength_erratum,
                    },
                    &cfg.rx,
                    RxAllocator::new(Arc::clone(p.mapper), buffer_len, p.caps.page_size),
                    Arc::clone(p.quarantine),
                    Arc::clone(p.family),
                    p.metrics.rx.clone(),
                )
            });

            let mut kinds: [Option<Arc<TxQueue>>; TXQ_KINDS as usize] = Default::default();
            if plan.has_tx(index) {
                for kind in TxQueueKind::all_kinds() {
                    let q = Arc::new(TxQueue::new(
                        TxQueueId {
                            channel: index,
                            kind,
                        },
                        cfg.txq_entries,
                        p.mtu,
                        p.caps,
                        Arc::clone(p.mapper),
                        Arc::clone(p.family),
                        p.metrics.tx.clone(),
                    ));
                    txqs.push(Arc::clone(&q));
                    kinds[kind.index()] = Some(q);
                }
            }

            let has_rx = rxq.is_some();
            let usecs = if has_rx {
                cfg.moderation.rx_usecs
            } else {
                cfg.moderation.tx_usecs
            };
            let moderation = ModerationConfig {
                adaptive: cfg.moderation.adaptive && has_rx,
                ..cfg.moderation.clone()
            };
            let params = ChannelParams {
                index,
                vector: plan.vectors[index],
                evq_entries,
                tx_free_events: cfg.txq_entries,
                alloc: AllocLevel::new(cfg.rx.alloc_method),
                gro: Gro::new(index, p.metrics.rx.gro_merged.clone()),
                moderation: IrqModeration::new(&moderation, usecs),
            };
            channels.push(Mutex::new(Channel::new(params, rxq, kinds)));
        }

        debug!(
            "datapath: {} channels, rx buffers {buffer_len} bytes, event queues {evq_entries}",
            plan.n_channels
        );
        Datapath {
            plan,
            channels,
            txqs,
        }
    }

    pub(crate) fn plan(&self) -> &InterruptPlan {
        &self.plan
    }

    pub(crate) fn n_channels(&self) -> usize {
        self.channels.len()
    }

    pub(crate) fn channel(&self, index: usize) -> Option<MutexGuard<'_, Channel>> {
        self.channels
            .get(index)
            .map(|c| c.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn each_channel(&self, mut f: impl FnMut(&mut Channel)) {
        for c in &self.channels {
            f(&mut c.lock().unwrap_or_else(|e| e.into_inner()));
        }
    }

    pub(crate) fn tx_queues(&self) -> &[Arc<TxQueue>] {
        &self.txqs
    }

    pub(crate) fn tx_queue(&self, id: TxQueueId) -> Option<&Arc<TxQueue>> {
        let offset = self.plan.tx_channel_offset();
        if !self.plan.has_tx(id.channel) {
            return None;
        }
        self.txqs
            .get((id.channel - offset) * TXQ_KINDS as usize + id.kind.index())
    }

    /// Queue for a packet: transmit channel by flow hash, kind by offload
    /// and priority.
    pub(crate) fn select_queue(&self, packet: &Packet) -> TxQueueId {
        let n_tx = self.plan.n_tx_channels.max(1);
        TxQueueId {
            channel: self.plan.tx_channel_offset() + packet.flow_hash() as usize % n_tx,
            kind: TxQueueKind::for_packet(packet),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    pub(crate) fn start_all(&self, family: &dyn NicFamily) {
        self.each_channel(|c| c.start(family));
    }

    /// Stop every channel. Taking each channel lock waits out in-flight
    /// polls.
    pub(crate) fn stop_all(&self) {
        self.each_channel(Channel::stop);
    }

    /// Flush every channel's queues. Returns the number of queues that
    /// did not confirm.
    pub(crate) fn flush_all(&self, family: &dyn NicFamily, attempts: u32, interval: Duration) -> usize {
        let mut left = 0;
        self.each_channel(|c| left += c.flush(family, attempts, interval));
        left
    }

    pub(crate) fn fini_all(&self, family: &dyn NicFamily) {
        self.each_channel(|c| c.fini(family));
    }

    pub(crate) fn set_moderation(&self, rx_usecs: u32, tx_usecs: u32, adaptive: bool, family: &dyn NicFamily) {
        self.each_channel(|c| {
            let usecs = if c.has_rx() { rx_usecs } else { tx_usecs };
            c.set_moderation(usecs, adaptive, family);
        });
    }

    pub(crate) fn run_slow_fill(&self, now: std::time::Instant, family: &dyn NicFamily) {
        self.each_channel(|c| c.run_slow_fill(now, family));
    }
}
