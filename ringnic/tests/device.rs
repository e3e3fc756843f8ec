//! Integration tests: a full device against the simulated hardware, driven
//! by hand (no poller or service threads).

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ringnic::event::{HwFault, RxEventFlags};
use ringnic::headers::testing::{ipv4_tcp_frame, ipv4_tcp_header, pattern};
use ringnic::headers::{TCP_ACK, TCP_PSH, parse_tcp};
use ringnic::sim::{SimBus, SimDma, SimFamily, SimStack, StackEvent};
use ringnic::{
    BusError, ConfigBuilder, DeviceState, DropReason, Error, InterruptMode, Nic, NicDeps, Packet,
    ResetKind, ResetReason, TxQueueId, TxQueueKind, XmitError,
};

// ── Helpers ─────────────────────────────────────────────────────────

struct Rig {
    nic: Nic,
    family: Arc<SimFamily>,
    dma: Arc<SimDma>,
    stack: Arc<SimStack>,
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn manual(builder: ConfigBuilder) -> ConfigBuilder {
    builder
        .spawn_pollers(false)
        .service_thread(false)
        .adaptive_moderation(false)
        .flush_polling(3, 100)
}

fn rig_on(bus: SimBus, builder: ConfigBuilder) -> Rig {
    init_logging();
    let family = Arc::new(SimFamily::new());
    let dma = Arc::new(SimDma::new());
    let stack = Arc::new(SimStack::new());
    let nic = Nic::probe(
        NicDeps {
            bus: Arc::new(bus),
            family: family.clone(),
            mapper: dma.clone(),
            stack: stack.clone(),
        },
        manual(builder).build().unwrap(),
    )
    .unwrap();
    nic.open().unwrap();
    Rig {
        nic,
        family,
        dma,
        stack,
    }
}

fn rig(builder: ConfigBuilder) -> Rig {
    rig_on(SimBus::new(8), builder)
}

fn plain_queue(channel: usize) -> TxQueueId {
    TxQueueId {
        channel,
        kind: TxQueueKind::empty(),
    }
}

// ── Transmit ────────────────────────────────────────────────────────

#[test]
fn tso_burst_end_to_end() {
    let r = rig(ConfigBuilder::new().channels(1));
    let payload = pattern(9000, 5);
    let mut frame = ipv4_tcp_header(1000, 300, TCP_ACK | TCP_PSH, payload.len());
    frame.extend_from_slice(&payload);
    let packet = Packet::from(frame).with_tso(1460);
    let id = r.nic.select_queue(&packet);
    r.nic.transmit(packet).unwrap();

    let frames = r.family.wire_frames();
    assert_eq!(frames.len(), 7);
    let mut joined = Vec::new();
    for (k, f) in frames.iter().enumerate() {
        assert_eq!(f.queue, id);
        let h = parse_tcp(&f.data).unwrap();
        assert_eq!(h.ip_id(&f.data), 300 + k as u16);
        assert_eq!(h.seq(&f.data), 1000 + 1460 * k as u32);
        joined.extend_from_slice(&f.data[h.header_len..]);
    }
    assert_eq!(joined, payload);
    assert_eq!(frames[6].data.len() - 54, 240);

    assert!(r.nic.tx_fill_level(id).unwrap() > 0);
    assert!(r.family.complete_tx(id));
    assert!(r.nic.poll_channel(0, 64).unwrap() < 64);
    assert_eq!(r.nic.tx_fill_level(id), Some(0));

    let stats = r.nic.stats();
    assert_eq!(stats.tso_bursts, 1);
    assert_eq!(stats.tso_segments, 7);
    assert_eq!(stats.mac.tx_frames, 7);
}

#[test]
fn segment_size_follows_mtu() {
    let r = rig(ConfigBuilder::new().channels(1));
    let payload = pattern(70_000, 1);
    let burst = |mss| {
        let mut frame = ipv4_tcp_header(0, 0, TCP_ACK, payload.len());
        frame.extend_from_slice(&payload);
        Packet::from(frame).with_tso(mss)
    };
    let err = r.nic.transmit(burst(65_535)).unwrap_err();
    assert!(matches!(err, XmitError::Dropped(DropReason::Malformed)));
    let err = r.nic.transmit(burst(8960)).unwrap_err();
    assert!(matches!(err, XmitError::Dropped(DropReason::Malformed)));
    assert!(r.family.wire_frames().is_empty());

    r.nic.set_mtu(9000).unwrap();
    r.nic.transmit(burst(8960)).unwrap();
    let frames = r.family.wire_frames();
    assert_eq!(frames.len(), 8);
    let h = parse_tcp(&frames[0].data).unwrap();
    assert_eq!(h.ip_payload_len(&frames[0].data), Some(8960));
}

#[test]
fn full_queue_wakes_stack_after_completion() {
    let r = rig(ConfigBuilder::new().channels(1).ring_sizes(64, 32));
    let id = plain_queue(0);
    for _ in 0..31 {
        r.nic.transmit_on(id, Packet::from(vec![1u8; 60])).unwrap();
    }
    let busy = r.nic.transmit_on(id, Packet::from(vec![2u8; 60])).unwrap_err();
    assert!(busy.into_packet().is_some());
    assert_eq!(r.nic.tx_queue_stopped(id), Some(true));

    r.family.complete_tx(id);
    r.nic.poll_channel(0, 64).unwrap();
    assert_eq!(r.nic.tx_queue_stopped(id), Some(false));
    assert_eq!(r.stack.wakes(), vec![id]);
    assert_eq!(r.nic.stats().tx_packets, 31);
}

#[test]
fn missing_queue_is_reported() {
    let r = rig(ConfigBuilder::new().channels(2).separate_tx_channels(true));
    // Channel 0 only receives.
    let err = r.nic.transmit_on(plain_queue(0), Packet::from(vec![0u8; 60])).unwrap_err();
    assert!(matches!(err, XmitError::Dropped(DropReason::NoQueue)));
    r.nic.transmit_on(plain_queue(2), Packet::from(vec![0u8; 60])).unwrap();
}

// ── Receive ─────────────────────────────────────────────────────────

#[test]
fn receive_delivers_frame() {
    let r = rig(ConfigBuilder::new().channels(1));
    let frame = pattern(60, 9);
    assert!(r.family.receive(0, &frame, RxEventFlags::empty()));
    assert!(r.nic.poll_channel(0, 64).unwrap() < 64);

    let packets = r.stack.take_packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].to_vec(), frame);
    assert!(!packets[0].csum_verified);
    assert_eq!(packets[0].channel, 0);
    assert_eq!(r.nic.rx_fill_level(0), Some(r.family.rx_posted(0) as u32));
    assert_eq!(r.nic.stats().rx_packets, 1);
}

#[test]
fn discarded_frames_never_reach_the_stack() {
    let r = rig(ConfigBuilder::new().channels(1));
    let fill = r.nic.rx_fill_level(0).unwrap();
    r.family.receive(0, &pattern(60, 0), RxEventFlags::DISCARD);
    r.nic.poll_channel(0, 64).unwrap();
    assert_eq!(r.stack.packet_count(), 0);
    assert_eq!(r.nic.rx_fill_level(0), Some(fill));
    assert_eq!(r.nic.stats().rx_hw_discards, 1);
}

#[test]
fn verified_segments_are_aggregated() {
    let r = rig(ConfigBuilder::new().channels(1));
    let mut payload = Vec::new();
    for k in 0..4u32 {
        let seg = pattern(500, k as u8);
        let frame = ipv4_tcp_frame(1000 + 500 * k, k as u16, TCP_ACK, &seg);
        payload.extend_from_slice(&seg);
        assert!(r.family.receive(0, &frame, RxEventFlags::CSUM_OK));
    }
    r.nic.poll_channel(0, 64).unwrap();

    let packets = r.stack.take_packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].segments, 4);
    assert!(packets[0].csum_verified);
    let data = packets[0].to_vec();
    let h = parse_tcp(&data).unwrap();
    assert_eq!(h.ip_payload_len(&data), Some(2000));
    assert_eq!(&data[h.header_len..], &payload[..]);
    assert_eq!(r.nic.stats().rx_gro_merged, 3);
}

#[test]
fn budget_limits_one_pass() {
    let r = rig(ConfigBuilder::new().channels(1));
    for i in 0..10u8 {
        r.family.receive(0, &pattern(64, i), RxEventFlags::empty());
    }
    assert_eq!(r.nic.poll_channel(0, 4).unwrap(), 4);
    assert_eq!(r.nic.poll_channel(0, 4).unwrap(), 4);
    assert_eq!(r.nic.poll_channel(0, 4).unwrap(), 2);
    let packets = r.stack.take_packets();
    assert_eq!(packets.len(), 10);
    for (i, p) in packets.iter().enumerate() {
        assert_eq!(p.to_vec(), pattern(64, i as u8));
    }
}

#[test]
fn invalid_channel_rejected() {
    let r = rig(ConfigBuilder::new().channels(2));
    assert!(matches!(r.nic.poll_channel(7, 64), Err(Error::InvalidChannel(7))));
}

// ── Recovery ────────────────────────────────────────────────────────

#[test]
fn reset_requests_coalesce_to_most_severe() {
    let r = rig(ConfigBuilder::new().channels(2));
    r.nic.schedule_reset(ResetReason::RxRecovery);
    r.nic.schedule_reset(ResetReason::TxWatchdog);
    assert_eq!(r.nic.process_resets(), vec![ResetKind::Full]);
    assert_eq!(r.family.resets(), vec![ResetKind::Full]);
    assert_eq!(r.nic.state(), DeviceState::Running);
    assert!(r.nic.process_resets().is_empty());

    let events = r.stack.events();
    assert_eq!(
        events.last(),
        Some(&StackEvent::ResetDone {
            kind: ResetKind::Full,
            recovered: true
        })
    );
    assert!(r.stack.is_attached());
    assert_eq!(r.nic.stats().resets, 1);

    // The data path is live again.
    r.nic.transmit(Packet::from(vec![0u8; 60])).unwrap();
    r.family.receive(1, &pattern(60, 1), RxEventFlags::empty());
    r.nic.poll_channel(1, 64).unwrap();
    assert_eq!(r.stack.packet_count(), 1);
}

#[test]
fn failed_reset_disables_device() {
    let r = rig(ConfigBuilder::new().channels(1));
    r.family.fail_reset(true);
    r.nic.schedule_reset(ResetReason::IntError);
    assert_eq!(r.nic.process_resets(), vec![ResetKind::Full]);
    assert_eq!(r.nic.state(), DeviceState::Disabled);
    assert!(!r.stack.is_attached());
    assert_eq!(
        r.stack.events().last(),
        Some(&StackEvent::ResetDone {
            kind: ResetKind::Full,
            recovered: false
        })
    );

    let err = r.nic.transmit(Packet::from(vec![0u8; 60])).unwrap_err();
    assert!(matches!(err, XmitError::Dropped(DropReason::DeviceDisabled)));
    assert!(matches!(r.nic.set_mtu(9000), Err(Error::Disabled)));

    // Further requests are ignored.
    r.nic.schedule_reset(ResetReason::TxWatchdog);
    assert!(r.nic.process_resets().is_empty());

    r.nic.close();
    let detaches = r.stack.events().iter().filter(|e| **e == StackEvent::Detach).count();
    assert_eq!(detaches, 1);
    assert!(matches!(r.nic.open(), Err(Error::Disabled)));
}

#[test]
fn flush_failure_escalates() {
    let r = rig(ConfigBuilder::new().channels(1));
    r.family.drop_flushes(true);
    r.nic.schedule_reset(ResetReason::RxRecovery);
    assert_eq!(
        r.nic.process_resets(),
        vec![ResetKind::Invisible, ResetKind::Full, ResetKind::World]
    );
    assert_eq!(r.nic.state(), DeviceState::Running);
    assert_eq!(r.nic.metrics().dev.flush_failures.value(), 3);
}

#[test]
fn explicit_disable_request() {
    let r = rig(ConfigBuilder::new().channels(1));
    r.nic.schedule_reset(ResetReason::Kind(ResetKind::Disable));
    assert_eq!(r.nic.process_resets(), vec![ResetKind::Disable]);
    assert_eq!(r.nic.state(), DeviceState::Disabled);
    assert!(r.family.resets().is_empty());
}

#[test]
fn hardware_fault_schedules_reset() {
    let r = rig(ConfigBuilder::new().channels(1));
    assert!(r.family.inject_fault(0, HwFault::TxDescFetch));
    r.nic.poll_channel(0, 64).unwrap();
    assert_eq!(r.nic.process_resets(), vec![ResetKind::Invisible]);
}

#[test]
fn spurious_completion_schedules_reset() {
    let r = rig(ConfigBuilder::new().channels(1));
    let id = plain_queue(0);
    r.nic.transmit_on(id, Packet::from(vec![0u8; 60])).unwrap();
    r.family.inject_event(0, ringnic::event::Event::Tx { kind: 0, index: 9 });
    r.nic.poll_channel(0, 64).unwrap();
    assert_eq!(r.nic.process_resets(), vec![ResetKind::Invisible]);
}

#[test]
fn spurious_completion_during_close_is_counted_not_reset() {
    let r = rig(ConfigBuilder::new().channels(1));
    let id = plain_queue(0);
    r.nic.transmit_on(id, Packet::from(vec![0u8; 60])).unwrap();
    r.family.inject_event(0, ringnic::event::Event::Tx { kind: 0, index: 9 });
    r.nic.close();
    assert_eq!(r.nic.metrics().tx.spurious_completions.value(), 1);
    assert!(r.nic.process_resets().is_empty());
    assert_eq!(r.nic.state(), DeviceState::Running);
}

#[test]
fn watchdog_resets_stalled_queue() {
    let r = rig(ConfigBuilder::new().channels(1).ring_sizes(64, 32).tx_timeout_ms(1));
    let id = plain_queue(0);
    while r.nic.transmit_on(id, Packet::from(vec![0u8; 60])).is_ok() {}
    thread::sleep(Duration::from_millis(5));

    r.nic.run_timers(Instant::now());
    assert_eq!(r.nic.metrics().dev.watchdog_fires.value(), 1);
    assert_eq!(r.nic.process_resets(), vec![ResetKind::Full]);
    // The reset abandoned the stuck descriptors.
    assert_eq!(r.nic.tx_fill_level(id), Some(0));
    assert_eq!(r.nic.tx_queue_stopped(id), Some(false));
}

#[test]
fn reset_on_closed_device_touches_hardware_only() {
    let r = rig(ConfigBuilder::new().channels(1));
    r.nic.close();
    let before = r.stack.events().len();
    r.nic.schedule_reset(ResetReason::TxWatchdog);
    assert_eq!(r.nic.process_resets(), vec![ResetKind::Full]);
    // Only the completion notice reaches the stack.
    assert_eq!(r.stack.events().len(), before + 1);
    assert!(!r.family.has_event_queue(0));
}

// ── Reconfiguration ─────────────────────────────────────────────────

#[test]
fn ring_resize_rebuilds_queues() {
    let r = rig(ConfigBuilder::new().channels(1).ring_sizes(512, 512));
    let before = r.nic.rx_fill_level(0).unwrap();
    r.nic.set_ring_sizes(2048, 256).unwrap();
    assert_eq!(r.nic.config().rxq_entries, 2048);
    assert!(r.nic.rx_fill_level(0).unwrap() > before);
    assert_eq!(r.family.rx_posted(0) as u32, r.nic.rx_fill_level(0).unwrap());
    r.nic.transmit(Packet::from(vec![0u8; 60])).unwrap();

    assert!(matches!(r.nic.set_ring_sizes(100, 256), Err(Error::Config(_))));
    assert_eq!(r.nic.config().rxq_entries, 2048);
}

#[test]
fn jumbo_mtu() {
    let r = rig(ConfigBuilder::new().channels(1));
    r.nic.set_mtu(9000).unwrap();
    assert_eq!(r.nic.mac_config().mtu, 9000);
    assert_eq!(r.family.mac().unwrap().mtu, 9000);

    let frame = pattern(9014, 2);
    r.family.receive(0, &frame, RxEventFlags::empty());
    r.nic.poll_channel(0, 64).unwrap();
    assert_eq!(r.stack.take_packets()[0].to_vec(), frame);

    assert!(matches!(r.nic.set_mtu(20), Err(Error::Config(_))));
}

#[test]
fn mac_filters_reach_hardware() {
    let r = rig(ConfigBuilder::new().channels(1));
    let addr = [0x02, 0, 0, 0, 0, 9];
    r.nic.set_mac_address(addr).unwrap();
    r.nic.set_multicast(vec![[0x01, 0, 0x5e, 0, 0, 1]], true).unwrap();
    let mac = r.family.mac().unwrap();
    assert_eq!(mac.address, addr);
    assert_eq!(mac.multicast.len(), 1);
    assert!(mac.promiscuous);
}

#[test]
fn channel_count_within_vectors() {
    let r = rig(ConfigBuilder::new().channels(4));
    assert_eq!(r.nic.plan().n_channels, 4);
    r.nic.set_channel_count(2).unwrap();
    assert_eq!(r.nic.plan().n_channels, 2);
    assert!(!r.family.has_event_queue(3));
    r.family.receive(1, &pattern(60, 0), RxEventFlags::empty());
    r.nic.poll_channel(1, 64).unwrap();
    assert_eq!(r.stack.packet_count(), 1);

    assert!(matches!(r.nic.set_channel_count(16), Err(Error::Config(_))));
    assert_eq!(r.nic.plan().n_channels, 2);
}

#[test]
fn channel_count_needs_msix() {
    let r = rig_on(SimBus::new(0), ConfigBuilder::new().channels(4));
    assert_eq!(r.nic.plan().mode, InterruptMode::Msi);
    assert!(matches!(r.nic.set_channel_count(1), Err(Error::Config(_))));
}

#[test]
fn explicit_moderation_is_pushed() {
    let r = rig(ConfigBuilder::new().channels(2));
    r.nic.set_irq_moderation(100, 50, false).unwrap();
    assert_eq!(r.nic.moderation_usecs(0), Some(100));
    let log = r.family.moderation_log();
    assert!(log.ends_with(&[(0, 100), (1, 100)]));
    assert!(r.nic.set_irq_moderation(100, 50, true).is_ok());
}

// ── Probe and teardown ──────────────────────────────────────────────

#[test]
fn probe_negotiates_dma_mask() {
    init_logging();
    let bus = Arc::new(SimBus::new(4).dma_bits(40));
    let nic = Nic::probe(
        NicDeps {
            bus: bus.clone(),
            family: Arc::new(SimFamily::new()),
            mapper: Arc::new(SimDma::new()),
            stack: Arc::new(SimStack::new()),
        },
        manual(ConfigBuilder::new()).build().unwrap(),
    )
    .unwrap();
    assert_eq!(bus.dma_mask(), Some(40));
    nic.remove();
    assert!(!bus.is_enabled());
}

#[test]
fn probe_failure_releases_bus() {
    init_logging();
    let bus = Arc::new(SimBus::new(4).dma_bits(16));
    let res = Nic::probe(
        NicDeps {
            bus: bus.clone(),
            family: Arc::new(SimFamily::new()),
            mapper: Arc::new(SimDma::new()),
            stack: Arc::new(SimStack::new()),
        },
        manual(ConfigBuilder::new()).build().unwrap(),
    );
    assert!(matches!(res, Err(Error::Bus(BusError::DmaMask(32)))));
    assert!(!bus.is_enabled());

    let family = Arc::new(SimFamily::new());
    family.fail_init(true);
    let res = Nic::probe(
        NicDeps {
            bus: Arc::new(SimBus::new(4)),
            family,
            mapper: Arc::new(SimDma::new()),
            stack: Arc::new(SimStack::new()),
        },
        manual(ConfigBuilder::new()).build().unwrap(),
    );
    assert!(matches!(res, Err(Error::Hardware(_))));
}

#[test]
fn close_and_reopen() {
    let r = rig(ConfigBuilder::new().channels(2));
    r.nic.transmit(Packet::from(vec![0u8; 60])).unwrap();
    r.nic.close();
    assert!(!r.stack.is_attached());
    assert!(!r.family.interrupts_enabled());
    assert_eq!(r.family.rx_posted(0), 0);
    assert!(matches!(
        r.nic.transmit(Packet::from(vec![0u8; 60])),
        Err(XmitError::Busy(_))
    ));

    r.nic.open().unwrap();
    assert!(r.stack.is_attached());
    assert!(r.family.rx_posted(0) > 0);
    r.nic.transmit(Packet::from(vec![0u8; 60])).unwrap();
}

#[test]
fn remove_releases_every_mapping() {
    let r = rig(ConfigBuilder::new().channels(2));
    let payload = pattern(4000, 1);
    let mut frame = ipv4_tcp_header(0, 0, TCP_ACK, payload.len());
    frame.extend_from_slice(&payload);
    r.nic.transmit(Packet::from(frame).with_tso(1000)).unwrap();
    r.family.receive(0, &pattern(60, 0), RxEventFlags::empty());
    r.nic.poll_channel(0, 64).unwrap();
    drop(r.stack.take_packets());
    assert!(r.dma.outstanding() > 0);

    let Rig { nic, dma, .. } = r;
    nic.remove();
    assert_eq!(dma.outstanding(), 0);
}
