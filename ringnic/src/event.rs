//! Event queue entries and the event ring shared with hardware.
//!
//! The device appends 64-bit events; software consumes them in order and
//! never writes the ring. Presence is signalled by a phase bit that flips on
//! every lap, so consumed entries do not need to be cleared. Software tells
//! the device how far it has read when it re-arms the queue.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

/// Slack added to the event queue so that driver-generated and flush events
/// always fit alongside a full set of completions.
pub const EVQ_SLACK: u32 = 128;

/// Number of transmit queue kinds per channel.
pub const TXQ_KINDS: u32 = 4;

/// Event queue size for the given ring sizes: the next power of two that
/// holds one event per RX descriptor, one per descriptor of every TX queue
/// kind, and [`EVQ_SLACK`].
pub fn event_queue_entries(rxq_entries: u32, txq_entries: u32) -> u32 {
    (rxq_entries + txq_entries * TXQ_KINDS + EVQ_SLACK).next_power_of_two()
}

bitflags! {
    /// Per-completion receive status reported by hardware.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RxEventFlags: u8 {
        /// L3/L4 checksums validated.
        const CSUM_OK = 0x01;
        /// Frame error (CRC, truncation, abort); the buffer must be discarded.
        const DISCARD = 0x02;
    }
}

/// Faults the device reports through its event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HwFault {
    RxDescFetch = 1,
    TxDescFetch = 2,
    Interrupt = 3,
}

impl HwFault {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(HwFault::RxDescFetch),
            2 => Some(HwFault::TxDescFetch),
            3 => Some(HwFault::Interrupt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Code {
    Rx = 0,
    Tx = 1,
    TxFlushDone = 2,
    RxFlushDone = 3,
    Refill = 4,
    Fault = 5,
    Empty = 0xF,
}

impl Code {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Code::Rx),
            1 => Some(Code::Tx),
            2 => Some(Code::TxFlushDone),
            3 => Some(Code::RxFlushDone),
            4 => Some(Code::Refill),
            5 => Some(Code::Fault),
            0xF => Some(Code::Empty),
            _ => None,
        }
    }
}

/// A decoded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A receive descriptor completed with `len` bytes written.
    Rx {
        index: u16,
        len: u16,
        flags: RxEventFlags,
    },
    /// Transmit descriptors up to and including `index` completed on the
    /// channel's queue of the given kind.
    Tx { kind: u8, index: u16 },
    TxFlushDone { kind: u8 },
    RxFlushDone,
    /// Driver-requested refill, generated after a failed buffer allocation.
    Refill,
    Fault(HwFault),
}

/// Encoded event layout (64-bit):
/// ```text
/// Bit  63:      phase (lap parity of the slot's write)
/// Bits 62..59:  event code
/// Bits 47..40:  aux (TX queue kind, fault code)
/// Bits 39..32:  RX flags
/// Bits 31..16:  RX byte count
/// Bits 15..0:   descriptor index
/// ```
struct Raw;

impl Raw {
    const PHASE_SHIFT: u64 = 63;
    const CODE_SHIFT: u64 = 59;
    const AUX_SHIFT: u64 = 40;
    const FLAGS_SHIFT: u64 = 32;
    const LEN_SHIFT: u64 = 16;
    const CODE_MASK: u64 = 0xF << Self::CODE_SHIFT;
    const AUX_MASK: u64 = 0xFF << Self::AUX_SHIFT;
    const FLAGS_MASK: u64 = 0xFF << Self::FLAGS_SHIFT;
    const LEN_MASK: u64 = 0xFFFF << Self::LEN_SHIFT;
    const INDEX_MASK: u64 = 0xFFFF;

    #[inline]
    fn pack(code: Code, aux: u8, flags: u8, len: u16, index: u16) -> u64 {
        ((code as u64) << Self::CODE_SHIFT)
            | ((aux as u64) << Self::AUX_SHIFT)
            | ((flags as u64) << Self::FLAGS_SHIFT)
            | ((len as u64) << Self::LEN_SHIFT)
            | index as u64
    }

    #[inline]
    fn phase(raw: u64) -> u32 {
        (raw >> Self::PHASE_SHIFT) as u32
    }
}

impl Event {
    /// Encode without the phase bit.
    pub fn encode(self) -> u64 {
        match self {
            Event::Rx { index, len, flags } => Raw::pack(Code::Rx, 0, flags.bits(), len, index),
            Event::Tx { kind, index } => Raw::pack(Code::Tx, kind, 0, 0, index),
            Event::TxFlushDone { kind } => Raw::pack(Code::TxFlushDone, kind, 0, 0, 0),
            Event::RxFlushDone => Raw::pack(Code::RxFlushDone, 0, 0, 0, 0),
            Event::Refill => Raw::pack(Code::Refill, 0, 0, 0, 0),
            Event::Fault(f) => Raw::pack(Code::Fault, f as u8, 0, 0, 0),
        }
    }

    /// Decode an event, ignoring the phase bit. Returns `None` for empty
    /// slots and unknown codes.
    pub fn decode(raw: u64) -> Option<Event> {
        let code = Code::from_u8(((raw & Raw::CODE_MASK) >> Raw::CODE_SHIFT) as u8)?;
        let aux = ((raw & Raw::AUX_MASK) >> Raw::AUX_SHIFT) as u8;
        let index = (raw & Raw::INDEX_MASK) as u16;
        match code {
            Code::Rx => Some(Event::Rx {
                index,
                len: ((raw & Raw::LEN_MASK) >> Raw::LEN_SHIFT) as u16,
                flags: RxEventFlags::from_bits_truncate(
                    ((raw & Raw::FLAGS_MASK) >> Raw::FLAGS_SHIFT) as u8,
                ),
            }),
            Code::Tx => Some(Event::Tx { kind: aux, index }),
            Code::TxFlushDone => Some(Event::TxFlushDone { kind: aux }),
            Code::RxFlushDone => Some(Event::RxFlushDone),
            Code::Refill => Some(Event::Refill),
            Code::Fault => HwFault::from_u8(aux).map(Event::Fault),
            Code::Empty => None,
        }
    }
}

/// What software found at its read cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    /// Nothing new has been written.
    Empty,
    /// An entry is present but does not decode.
    Unknown(u64),
    Event(Event),
}

/// Event ring memory shared between the device (producer) and one channel
/// (consumer).
pub struct EventRing {
    slots: Box<[AtomicU64]>,
    mask: u32,
    shift: u32,
    /// Device-side write cursor.
    hw_write: AtomicU32,
    /// Software read cursor as of the last re-arm.
    sw_read: AtomicU32,
}

impl EventRing {
    /// Create a ring of `entries` slots (must be a power of two).
    pub fn new(entries: u32) -> Self {
        assert!(entries.is_power_of_two(), "entries must be power of 2");
        // Lap 0 expects phase 0; start every slot empty with phase 1.
        let empty = (1u64 << Raw::PHASE_SHIFT) | ((Code::Empty as u64) << Raw::CODE_SHIFT);
        let slots = (0..entries).map(|_| AtomicU64::new(empty)).collect();
        EventRing {
            slots,
            mask: entries - 1,
            shift: entries.trailing_zeros(),
            hw_write: AtomicU32::new(0),
            sw_read: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    #[inline]
    fn phase_of(&self, cursor: u32) -> u32 {
        (cursor >> self.shift) & 1
    }

    /// Device side: append an event. Returns `false` (and drops the event)
    /// when the ring holds a full lap of entries software has not re-armed
    /// past.
    pub fn post(&self, ev: Event) -> bool {
        let mut n = self.hw_write.load(Ordering::Relaxed);
        loop {
            let read = self.sw_read.load(Ordering::Acquire);
            if n.wrapping_sub(read) >= self.capacity() {
                return false;
            }
            match self.hw_write.compare_exchange_weak(
                n,
                n.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(cur) => n = cur,
            }
        }
        let raw = ev.encode() | ((self.phase_of(n) as u64) << Raw::PHASE_SHIFT);
        self.slots[(n & self.mask) as usize].store(raw, Ordering::Release);
        true
    }

    /// Events written by the device and not yet released by a re-arm.
    pub fn outstanding(&self) -> u32 {
        self.hw_write
            .load(Ordering::Acquire)
            .wrapping_sub(self.sw_read.load(Ordering::Acquire))
    }

    /// Software side: inspect the entry at `read_count`.
    pub(crate) fn peek(&self, read_count: u32) -> Slot {
        let raw = self.slots[(read_count & self.mask) as usize].load(Ordering::Acquire);
        if Raw::phase(raw) != self.phase_of(read_count) {
            return Slot::Empty;
        }
        match Event::decode(raw) {
            Some(ev) => Slot::Event(ev),
            None => Slot::Unknown(raw),
        }
    }

    /// Publish the software read cursor (part of re-arming).
    pub(crate) fn publish_read(&self, read_count: u32) {
        self.sw_read.store(read_count, Ordering::Release);
    }

    /// Software read cursor as of the last re-arm.
    pub fn read_count(&self) -> u32 {
        self.sw_read.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for EventRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRing")
            .field("capacity", &self.capacity())
            .field("hw_write", &self.hw_write.load(Ordering::Relaxed))
            .field("sw_read", &self.sw_read.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_each_kind() {
        let events = [
            Event::Rx {
                index: 0x1234,
                len: 9018,
                flags: RxEventFlags::CSUM_OK | RxEventFlags::DISCARD,
            },
            Event::Tx { kind: 3, index: 0xFFFF },
            Event::TxFlushDone { kind: 2 },
            Event::RxFlushDone,
            Event::Refill,
            Event::Fault(HwFault::TxDescFetch),
        ];
        for ev in events {
            assert_eq!(Event::decode(ev.encode()), Some(ev));
        }
    }

    #[test]
    fn unknown_code() {
        let raw = 0x7u64 << 59;
        assert_eq!(Event::decode(raw), None);
    }

    #[test]
    fn queue_size_rounds_up() {
        // 512 + 4 * 512 + 128 = 2688 -> 4096
        assert_eq!(event_queue_entries(512, 512), 4096);
        // 1024 + 4 * 1024 + 128 = 5248 -> 8192
        assert_eq!(event_queue_entries(1024, 1024), 8192);
        assert_eq!(event_queue_entries(64, 32), 512);
    }

    #[test]
    fn fresh_ring_is_empty() {
        let ring = EventRing::new(8);
        for i in 0..8 {
            assert_eq!(ring.peek(i), Slot::Empty);
        }
    }

    #[test]
    fn phase_detects_presence_across_laps() {
        let ring = EventRing::new(4);
        let mut read = 0u32;
        for lap in 0..3u16 {
            for i in 0..4u16 {
                assert!(ring.post(Event::Tx { kind: 0, index: lap * 4 + i }));
            }
            for i in 0..4u16 {
                assert_eq!(
                    ring.peek(read),
                    Slot::Event(Event::Tx { kind: 0, index: lap * 4 + i })
                );
                read += 1;
            }
            // Slot after the lap still holds last lap's phase.
            assert_eq!(ring.peek(read), Slot::Empty);
            ring.publish_read(read);
        }
    }

    #[test]
    fn post_refuses_overflow() {
        let ring = EventRing::new(4);
        for _ in 0..4 {
            assert!(ring.post(Event::Refill));
        }
        assert!(!ring.post(Event::Refill));
        assert_eq!(ring.outstanding(), 4);
        ring.publish_read(2);
        assert!(ring.post(Event::Refill));
    }
}
