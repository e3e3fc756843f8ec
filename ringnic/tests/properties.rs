//! Property tests: segmentation conserves payload, receive preserves order,
//! and transmit ring accounting balances under arbitrary interleavings.

use std::sync::Arc;

use proptest::prelude::*;

use ringnic::event::RxEventFlags;
use ringnic::headers::testing::{ipv4_tcp_header, pattern};
use ringnic::headers::{TCP_ACK, parse_tcp};
use ringnic::sim::{SimBus, SimDma, SimFamily, SimStack};
use ringnic::{ConfigBuilder, Nic, NicDeps, Packet, TxQueueId, TxQueueKind, XmitError};

fn device(rxq: u32, txq: u32) -> (Nic, Arc<SimFamily>, Arc<SimStack>) {
    let family = Arc::new(SimFamily::new());
    let stack = Arc::new(SimStack::new());
    let config = ConfigBuilder::new()
        .channels(1)
        .ring_sizes(rxq, txq)
        .mtu(9000)
        .spawn_pollers(false)
        .service_thread(false)
        .build()
        .unwrap();
    let nic = Nic::probe(
        NicDeps {
            bus: Arc::new(SimBus::new(2)),
            family: family.clone(),
            mapper: Arc::new(SimDma::new()),
            stack: stack.clone(),
        },
        config,
    )
    .unwrap();
    nic.open().unwrap();
    (nic, family, stack)
}

#[derive(Debug, Clone)]
enum Op {
    Send(usize),
    Complete,
    Poll,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (60usize..1500).prop_map(Op::Send),
        1 => Just(Op::Complete),
        1 => Just(Op::Poll),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn segmentation_conserves_payload(len in 1usize..16_000, mss in 200u16..3000, ip_id in any::<u16>()) {
        let (nic, family, _stack) = device(64, 1024);
        let payload = pattern(len, 7);
        let mut frame = ipv4_tcp_header(42, ip_id, TCP_ACK, len);
        frame.extend_from_slice(&payload);
        nic.transmit(Packet::from(frame).with_tso(mss)).unwrap();

        let frames = family.wire_frames();
        prop_assert_eq!(frames.len(), len.div_ceil(usize::from(mss)));
        let mut joined = Vec::with_capacity(len);
        for (k, f) in frames.iter().enumerate() {
            let h = parse_tcp(&f.data).unwrap();
            let body = &f.data[h.header_len..];
            prop_assert!(body.len() <= usize::from(mss));
            prop_assert_eq!(h.ip_payload_len(&f.data), Some(body.len()));
            prop_assert_eq!(h.ip_id(&f.data), ip_id.wrapping_add(k as u16));
            joined.extend_from_slice(body);
        }
        prop_assert_eq!(joined, payload);
        nic.remove();
    }

    #[test]
    fn receive_preserves_order(lens in prop::collection::vec(60usize..1500, 1..48), budget in 1usize..16) {
        let (nic, family, stack) = device(64, 64);
        let frames: Vec<Vec<u8>> = lens.iter().enumerate().map(|(i, &n)| pattern(n, i as u8)).collect();
        let mut sent = 0;
        while sent < frames.len() || nic.poll_channel(0, budget).unwrap() >= budget {
            // Keep within the posted buffers.
            while sent < frames.len() && family.rx_posted(0) > 0 {
                prop_assert!(family.receive(0, &frames[sent], RxEventFlags::empty()));
                sent += 1;
            }
            if sent < frames.len() {
                nic.poll_channel(0, budget).unwrap();
            }
        }
        let got: Vec<Vec<u8>> = stack.take_packets().iter().map(|p| p.to_vec()).collect();
        prop_assert_eq!(got, frames);
        prop_assert_eq!(nic.rx_fill_level(0), Some(family.rx_posted(0) as u32));
        nic.remove();
    }

    #[test]
    fn transmit_accounting_balances(ops in prop::collection::vec(op(), 1..200)) {
        let (nic, family, _stack) = device(64, 32);
        let id = TxQueueId { channel: 0, kind: TxQueueKind::empty() };
        let mut accepted = 0u64;
        for op in ops {
            match op {
                Op::Send(len) => match nic.transmit_on(id, Packet::from(vec![0u8; len])) {
                    Ok(()) => accepted += 1,
                    Err(XmitError::Busy(_)) => prop_assert_eq!(nic.tx_queue_stopped(id), Some(true)),
                    Err(e) => return Err(TestCaseError::fail(format!("unexpected {e}"))),
                },
                Op::Complete => {
                    family.complete_tx(id);
                }
                Op::Poll => {
                    nic.poll_channel(0, 64).unwrap();
                }
            }
            prop_assert!(nic.tx_fill_level(id).unwrap() < 32);
        }
        family.complete_tx(id);
        nic.poll_channel(0, 64).unwrap();
        prop_assert_eq!(nic.tx_fill_level(id), Some(0));
        prop_assert_eq!(nic.stats().tx_packets, accepted);
        prop_assert_eq!(family.wire_frames().len() as u64, accepted);
        nic.remove();
    }
}
