//! Software receive aggregation.
//!
//! Consecutive checksum-verified IPv4/TCP segments of one flow with
//! contiguous sequence numbers are merged into a single upstream packet: one
//! rebuilt header followed by every segment's payload, still referencing the
//! receive buffers they arrived in.

use bytes::{Bytes, BytesMut};

use crate::counter::Counter;
use crate::headers::{L3, TCP_ACK, TCP_PSH, TcpHeaders, parse_tcp};
use crate::packet::RxPacket;

pub(crate) const GRO_MAX_BYTES: usize = 65536;
pub(crate) const GRO_MAX_SEGS: u16 = 16;

struct Batch {
    headers: TcpHeaders,
    /// The first frame, delivered untouched if nothing merges into it.
    first: Bytes,
    header: BytesMut,
    payload: Vec<Bytes>,
    payload_len: usize,
    next_seq: u32,
    segments: u16,
    push: bool,
}

impl Batch {
    fn accepts(&self, h: &TcpHeaders, frame: &[u8], seq: u32, len: usize) -> bool {
        self.headers == *h
            && self.segments < GRO_MAX_SEGS
            && self.headers.header_len + self.payload_len + len <= GRO_MAX_BYTES
            && seq == self.next_seq
            && self.headers.flow_key(&self.header) == h.flow_key(frame)
            && self.headers.ack_window(&self.header) == h.ack_window(frame)
    }
}

pub(crate) struct Gro {
    channel: usize,
    batch: Option<Batch>,
    merged: Counter,
}

impl Gro {
    pub(crate) fn new(channel: usize, merged: Counter) -> Self {
        Gro {
            channel,
            batch: None,
            merged,
        }
    }

    /// Offer one received frame. Packets that are complete are passed to
    /// `emit`, in arrival order.
    pub(crate) fn push(&mut self, frame: Bytes, csum_verified: bool, emit: &mut impl FnMut(RxPacket)) {
        let Some((h, seq, len, flags)) = csum_verified.then(|| mergeable(&frame)).flatten() else {
            self.flush(emit);
            emit(RxPacket {
                channel: self.channel,
                frags: vec![frame],
                csum_verified,
                segments: 1,
            });
            return;
        };

        let payload = frame.slice(h.header_len..h.header_len + len);
        match self.batch.as_mut() {
            Some(b) if b.accepts(&h, &frame, seq, len) => {
                b.payload.push(payload);
                b.payload_len += len;
                b.next_seq = seq.wrapping_add(len as u32);
                b.segments += 1;
                b.push |= flags & TCP_PSH != 0;
            }
            _ => {
                self.flush(emit);
                self.batch = Some(Batch {
                    headers: h,
                    header: BytesMut::from(&frame[..h.header_len]),
                    first: frame,
                    payload: vec![payload],
                    payload_len: len,
                    next_seq: seq.wrapping_add(len as u32),
                    segments: 1,
                    push: flags & TCP_PSH != 0,
                });
            }
        }
        if self.batch.as_ref().is_some_and(|b| b.push) {
            self.flush(emit);
        }
    }

    /// Deliver the batch in progress, if any.
    pub(crate) fn flush(&mut self, emit: &mut impl FnMut(RxPacket)) {
        let Some(b) = self.batch.take() else {
            return;
        };
        if b.segments == 1 {
            emit(RxPacket {
                channel: self.channel,
                frags: vec![b.first],
                csum_verified: true,
                segments: 1,
            });
            return;
        }
        let mut header = b.header;
        let ip_id = b.headers.ip_id(&header);
        b.headers.set_ip_fields(&mut header, b.payload_len, ip_id);
        if b.push {
            let flags = b.headers.flags(&header) | TCP_PSH;
            b.headers.set_flags(&mut header, flags);
        }
        self.merged.add(u64::from(b.segments - 1));
        let mut frags = Vec::with_capacity(b.payload.len() + 1);
        frags.push(header.freeze());
        frags.extend(b.payload);
        emit(RxPacket {
            channel: self.channel,
            frags,
            csum_verified: true,
            segments: b.segments,
        });
    }

    /// Drop any batch in progress without delivering it.
    pub(crate) fn discard(&mut self) {
        self.batch = None;
    }
}

/// Headers, sequence number, payload length and flags of a frame that may
/// take part in aggregation.
fn mergeable(frame: &[u8]) -> Option<(TcpHeaders, u32, usize, u8)> {
    let h = parse_tcp(frame)?;
    if h.l3 != L3::Ipv4 {
        return None;
    }
    let flags = h.flags(frame);
    if flags & !(TCP_ACK | TCP_PSH) != 0 || flags & TCP_ACK == 0 {
        return None;
    }
    let len = h.ip_payload_len(frame)?;
    if len == 0 || h.header_len + len > frame.len() {
        return None;
    }
    Some((h, h.seq(frame), len, flags))
}
