use bytes::Bytes;

/// An outbound packet handed to [`Nic::transmit`](crate::nic::Nic::transmit).
///
/// The first fragment is the linear header area; further fragments carry
/// payload. Fragments are reference-counted, so the packet owns its memory
/// until the hardware reports completion of its last descriptor.
#[derive(Debug)]
pub struct Packet {
    frags: Vec<Bytes>,
    mss: Option<u16>,
    csum_offload: bool,
    priority: u8,
    flow_hash: u32,
}

impl Packet {
    pub fn new(frags: Vec<Bytes>) -> Self {
        Packet {
            frags,
            mss: None,
            csum_offload: false,
            priority: 0,
            flow_hash: 0,
        }
    }

    /// Request TCP segmentation into `mss`-byte payloads. Segmentation
    /// implies checksum offload.
    pub fn with_tso(mut self, mss: u16) -> Self {
        self.mss = Some(mss);
        self.csum_offload = true;
        self
    }

    pub fn with_csum_offload(mut self, enable: bool) -> Self {
        self.csum_offload = enable;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_flow_hash(mut self, hash: u32) -> Self {
        self.flow_hash = hash;
        self
    }

    #[inline]
    pub fn frags(&self) -> &[Bytes] {
        &self.frags
    }

    #[inline]
    pub fn mss(&self) -> Option<u16> {
        self.mss
    }

    #[inline]
    pub fn csum_offload(&self) -> bool {
        self.csum_offload
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.priority
    }

    #[inline]
    pub fn flow_hash(&self) -> u32 {
        self.flow_hash
    }

    /// Total length across all fragments.
    pub fn len(&self) -> usize {
        self.frags.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Bytes> for Packet {
    fn from(b: Bytes) -> Self {
        Packet::new(vec![b])
    }
}

impl From<Vec<u8>> for Packet {
    fn from(v: Vec<u8>) -> Self {
        Packet::new(vec![Bytes::from(v)])
    }
}

/// An inbound packet delivered to [`NetStack::receive`](crate::stack::NetStack::receive).
///
/// Fragments reference receive buffer memory directly; the buffer returns
/// to the allocator once every fragment is dropped.
#[derive(Debug)]
pub struct RxPacket {
    /// Channel that received the packet.
    pub channel: usize,
    pub frags: Vec<Bytes>,
    /// Hardware validated the L3/L4 checksums.
    pub csum_verified: bool,
    /// Number of wire frames merged into this packet (1 if not aggregated).
    pub segments: u16,
}

impl RxPacket {
    pub fn len(&self) -> usize {
        self.frags.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy all fragments into one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for f in &self.frags {
            out.extend_from_slice(f);
        }
        out
    }
}
