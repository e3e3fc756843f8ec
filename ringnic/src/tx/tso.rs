//! TCP segmentation offload in software.
//!
//! The hardware cannot segment, so the driver emits one frame per segment:
//! a patched copy of the headers from the queue's header pool, followed by
//! descriptors for that segment's share of the payload. Payload descriptors
//! point straight into the original fragments; the fragment being consumed
//! is carried across segment boundaries.

use log::{debug, trace};

use super::{TxProducer, TxQueue};
use crate::dma::{DmaAddr, DmaDirection, Mapping};
use crate::error::{DropReason, XmitError};
use crate::headers::{TCP_FIN, TCP_PSH, TcpHeaders, parse_tcp};
use crate::packet::Packet;

/// Number of segments a payload of `payload` bytes splits into. A
/// header-only burst still produces one frame.
pub(crate) fn segment_count(payload: usize, mss: usize) -> usize {
    payload.div_ceil(mss).max(1)
}

/// The unconsumed part of the current input fragment.
struct Span {
    addr: DmaAddr,
    len: u32,
    mapping: Option<Mapping>,
}

/// Per-burst segmentation state.
struct TsoState<'a> {
    headers: TcpHeaders,
    template: &'a [u8],
    mss: usize,
    remaining: usize,
    seq: u32,
    ip_id: u16,
    /// Index of the next fragment to map.
    next_frag: usize,
    span: Option<Span>,
}

enum Fail {
    Full,
    Drop(DropReason),
}

pub(crate) fn enqueue(
    q: &TxQueue,
    p: &mut TxProducer,
    packet: Packet,
    mss: u16,
) -> Result<(), XmitError> {
    let Some(first) = packet.frags().first() else {
        return Err(XmitError::Dropped(DropReason::Malformed));
    };
    let Some(headers) = parse_tcp(first) else {
        debug!("{}: TSO request without TCP/IP headers", q.id);
        return Err(XmitError::Dropped(DropReason::Malformed));
    };
    // Each segment is one IP packet: it must fit the link and the length field.
    let seg_ip_len = headers.header_len - headers.ip_off + usize::from(mss);
    if mss == 0 || seg_ip_len > q.mtu as usize || !headers.ip_len_fits(usize::from(mss)) {
        debug!("{}: TSO segment size {mss} does not fit MTU {}", q.id, q.mtu);
        return Err(XmitError::Dropped(DropReason::Malformed));
    }

    let payload = packet.len() - headers.header_len;
    let segments = segment_count(payload, mss as usize);
    let mut st = TsoState {
        headers,
        template: &first[..headers.header_len],
        mss: mss as usize,
        remaining: payload,
        seq: headers.seq(first),
        ip_id: headers.ip_id(first),
        next_frag: 0,
        span: None,
    };

    let res = (0..segments).try_for_each(|k| emit_segment(q, p, &packet, &mut st, k + 1 == segments));
    match res {
        Ok(()) => {
            debug_assert_eq!(st.remaining, 0, "payload not fully segmented");
            drop(st);
            // The packet rides on the final descriptor so its memory
            // outlives every payload descriptor.
            // Safety: written by this producer, not yet published.
            unsafe { q.slot(p.insert_count.wrapping_sub(1)) }.packet = Some(packet);
            q.metrics.tso_bursts.increment();
            q.metrics.tso_segments.add(segments as u64);
            trace!("{}: TSO {payload} bytes as {segments} segments", q.id);
            Ok(())
        }
        Err(Fail::Full) => {
            drop(st);
            Err(XmitError::Busy(packet))
        }
        Err(Fail::Drop(reason)) => Err(XmitError::Dropped(reason)),
    }
}

fn emit_segment(
    q: &TxQueue,
    p: &mut TxProducer,
    packet: &Packet,
    st: &mut TsoState<'_>,
    last: bool,
) -> Result<(), Fail> {
    let seg_len = st.remaining.min(st.mss);

    // Header.
    let hlen = st.template.len();
    if hlen > super::tsoh::TSOH_STD_SIZE {
        q.metrics.tso_long_headers.increment();
    }
    let mut header = p
        .tsoh
        .alloc(hlen)
        .map_err(|_| Fail::Drop(DropReason::MappingFailed))?;
    header.write(st.template);
    let h = st.headers;
    let (seq, ip_id) = (st.seq, st.ip_id);
    header.with_bytes(|b| {
        h.set_seq(b, seq);
        h.set_ip_fields(b, seg_len, ip_id);
        if !last {
            let flags = h.flags(b) & !(TCP_FIN | TCP_PSH);
            h.set_flags(b, flags);
        }
    });
    let addr = header.addr();
    q.push_span(p, addr, hlen as u32).map_err(|_| Fail::Full)?;
    q.set_header(p, header);

    // Payload.
    let mut need = seg_len;
    while need > 0 {
        if st.span.as_ref().is_none_or(|s| s.len == 0) {
            let next = next_span(q, packet, st)?;
            st.span = Some(next);
        }
        let Some(span) = st.span.as_mut() else {
            return Err(Fail::Drop(DropReason::Malformed));
        };
        let take = need.min(span.len as usize) as u32;
        q.push_span(p, span.addr, take).map_err(|_| Fail::Full)?;
        span.addr = span.addr.offset(take as u64);
        span.len -= take;
        need -= take as usize;
        if span.len == 0
            && let Some(mapping) = span.mapping.take()
        {
            q.set_unmap(p, mapping);
        }
    }
    q.finish_frame(p, None);

    st.remaining -= seg_len;
    st.seq = st.seq.wrapping_add(seg_len as u32);
    st.ip_id = st.ip_id.wrapping_add(1);
    Ok(())
}

/// Map the next fragment with payload bytes. The first fragment's headers
/// are skipped.
fn next_span(q: &TxQueue, packet: &Packet, st: &mut TsoState<'_>) -> Result<Span, Fail> {
    while let Some(frag) = packet.frags().get(st.next_frag) {
        let skip = if st.next_frag == 0 {
            st.headers.header_len
        } else {
            0
        };
        st.next_frag += 1;
        let body = &frag[skip.min(frag.len())..];
        if body.is_empty() {
            continue;
        }
        let mapping = Mapping::new(q.mapper(), body.as_ptr(), body.len(), DmaDirection::ToDevice)
            .map_err(|_| Fail::Drop(DropReason::MappingFailed))?;
        return Ok(Span {
            addr: mapping.addr(),
            len: body.len() as u32,
            mapping: Some(mapping),
        });
    }
    Err(Fail::Drop(DropReason::Malformed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::FamilyCaps;
    use crate::headers::testing::{ipv4_tcp_header, ipv6_tcp_header, pattern};
    use crate::headers::{TCP_ACK, parse_tcp};
    use crate::tx::tests::queue_with;
    use bytes::Bytes;

    fn tso_packet(header: Vec<u8>, payload: &[u8], frag: usize, mss: u16) -> Packet {
        let mut frags = vec![Bytes::from(header)];
        frags.extend(payload.chunks(frag).map(Bytes::copy_from_slice));
        Packet::new(frags).with_tso(mss)
    }

    #[test]
    fn counts() {
        assert_eq!(segment_count(9000, 1460), 7);
        assert_eq!(segment_count(1460, 1460), 1);
        assert_eq!(segment_count(1461, 1460), 2);
        assert_eq!(segment_count(0, 1460), 1);
    }

    #[test]
    fn ipv4_burst_segments() {
        let (family, dma, q) = queue_with(256, FamilyCaps::default());
        let payload = pattern(9000, 3);
        let hdr = ipv4_tcp_header(1000, 77, TCP_ACK | TCP_PSH | TCP_FIN, payload.len());
        q.enqueue(tso_packet(hdr, &payload, 4000, 1460)).unwrap();

        let frames = family.wire_frames();
        assert_eq!(frames.len(), 7);
        let mut joined = Vec::new();
        for (k, f) in frames.iter().enumerate() {
            let h = parse_tcp(&f.data).unwrap();
            let body = &f.data[h.header_len..];
            let expect = if k < 6 { 1460 } else { 240 };
            assert_eq!(body.len(), expect);
            assert_eq!(h.seq(&f.data), 1000 + 1460 * k as u32);
            assert_eq!(h.ip_id(&f.data), 77 + k as u16);
            assert_eq!(h.ip_payload_len(&f.data), Some(expect));
            let flags = h.flags(&f.data);
            if k < 6 {
                assert_eq!(flags & (TCP_FIN | TCP_PSH), 0);
            } else {
                assert_eq!(flags, TCP_ACK | TCP_PSH | TCP_FIN);
            }
            joined.extend_from_slice(body);
        }
        assert_eq!(joined, payload);
        assert_eq!(q.metrics().tso_segments.value(), 7);

        let last = q.write_count().wrapping_sub(1) as u16;
        assert!(matches!(
            q.reclaim(last),
            crate::tx::Reclaim::Done { packets: 1, .. }
        ));
        // Only the header pool block remains mapped.
        assert_eq!(dma.outstanding(), 1);
    }

    #[test]
    fn ipv6_burst_has_no_identification() {
        let (family, _dma, q) = queue_with(128, FamilyCaps::default());
        let payload = pattern(3000, 1);
        let hdr = ipv6_tcp_header(5, TCP_ACK, payload.len());
        q.enqueue(tso_packet(hdr, &payload, 3000, 1000)).unwrap();
        let frames = family.wire_frames();
        assert_eq!(frames.len(), 3);
        for f in &frames {
            let h = parse_tcp(&f.data).unwrap();
            assert_eq!(h.ip_payload_len(&f.data), Some(1000));
        }
    }

    #[test]
    fn payload_in_linear_area() {
        let (family, _dma, q) = queue_with(64, FamilyCaps::default());
        let payload = pattern(2500, 9);
        let mut frame = ipv4_tcp_header(0, 1, TCP_ACK, payload.len());
        frame.extend_from_slice(&payload);
        q.enqueue(Packet::from(frame).with_tso(1000)).unwrap();
        let frames = family.wire_frames();
        assert_eq!(frames.len(), 3);
        let joined: Vec<u8> = frames.iter().flat_map(|f| f.data[54..].to_vec()).collect();
        assert_eq!(joined, payload);
    }

    #[test]
    fn non_tcp_is_malformed() {
        let (_family, _dma, q) = queue_with(64, FamilyCaps::default());
        let err = q.enqueue(Packet::from(vec![0u8; 100]).with_tso(1000)).unwrap_err();
        assert!(matches!(err, XmitError::Dropped(DropReason::Malformed)));
        assert_eq!(q.metrics().malformed.value(), 1);
    }

    #[test]
    fn segment_size_bounded_by_mtu() {
        let (family, dma, q) = queue_with(256, FamilyCaps::default());
        let payload = pattern(70_000, 4);
        for mss in [1461, 65_535] {
            let hdr = ipv4_tcp_header(0, 0, TCP_ACK, payload.len());
            let err = q.enqueue(tso_packet(hdr, &payload, 8000, mss)).unwrap_err();
            assert!(matches!(err, XmitError::Dropped(DropReason::Malformed)));
        }
        assert!(family.wire_frames().is_empty());
        assert_eq!(dma.outstanding(), 0);

        // 40 bytes of IPv4 and TCP headers plus 1460 fills a 1500 MTU.
        let hdr = ipv4_tcp_header(0, 0, TCP_ACK, 2920);
        q.enqueue(tso_packet(hdr, &payload[..2920], 2920, 1460)).unwrap();
        assert_eq!(family.wire_frames().len(), 2);
    }

    #[test]
    fn busy_unwinds_whole_burst() {
        let (family, dma, q) = queue_with(32, FamilyCaps::default());
        for _ in 0..20 {
            q.enqueue(Packet::from(vec![0u8; 60])).unwrap();
        }
        let payload = pattern(10 * 100, 0);
        let hdr = ipv4_tcp_header(0, 0, TCP_ACK, payload.len());
        let err = q.enqueue(tso_packet(hdr, &payload, 1000, 100)).unwrap_err();
        assert!(err.into_packet().is_some());
        assert_eq!(q.fill_level(), 20);
        assert_eq!(family.wire_frames().len(), 20);
        // Header slots returned; the pool block and the 20 frames stay mapped.
        assert_eq!(dma.outstanding(), 21);
    }

    #[test]
    fn burst_larger_than_ring_is_dropped() {
        let (_family, dma, q) = queue_with(32, FamilyCaps::default());
        let payload = pattern(30 * 100, 0);
        let hdr = ipv4_tcp_header(0, 0, TCP_ACK, payload.len());
        let err = q.enqueue(tso_packet(hdr, &payload, 3000, 100)).unwrap_err();
        assert!(matches!(err, XmitError::Dropped(DropReason::Oversized)));
        assert!(!q.is_stopped());
        assert_eq!(q.fill_level(), 0);
        assert_eq!(dma.outstanding(), 1);
    }
}
