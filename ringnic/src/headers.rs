//! Ethernet / IP / TCP header offsets and in-place field rewriting, as
//! needed by segmentation offload and receive aggregation.

pub const ETH_HLEN: usize = 14;
pub const VLAN_HLEN: usize = 4;
pub const ETH_FCS_LEN: usize = 4;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const IPPROTO_TCP: u8 = 6;
const IPV6_HLEN: usize = 40;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;
pub const TCP_URG: u8 = 0x20;

/// Largest frame the MAC can hand us for a given MTU, rounded up to an
/// 8-byte multiple plus 16 bytes of slack for the receive prefix.
pub fn max_frame_len(mtu: u32) -> u32 {
    ((mtu + (ETH_HLEN + VLAN_HLEN + ETH_FCS_LEN) as u32 + 7) & !7) + 16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L3 {
    Ipv4,
    Ipv6,
}

/// Offsets of a TCP/IP header stack within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeaders {
    pub l3: L3,
    pub ip_off: usize,
    pub tcp_off: usize,
    /// Length of all headers, i.e. offset of the first payload byte.
    pub header_len: usize,
}

/// Locate the TCP/IP headers at the start of `frame`. Returns `None` for
/// anything other than TCP over IPv4 (any IHL) or IPv6 (no extension
/// headers), optionally behind one 802.1Q tag.
pub fn parse_tcp(frame: &[u8]) -> Option<TcpHeaders> {
    let mut ip_off = ETH_HLEN;
    let mut ethertype = read_u16(frame, 12)?;
    if ethertype == ETHERTYPE_VLAN {
        ethertype = read_u16(frame, 16)?;
        ip_off += VLAN_HLEN;
    }

    let (l3, tcp_off) = match ethertype {
        ETHERTYPE_IPV4 => {
            let vihl = *frame.get(ip_off)?;
            let ihl = (vihl & 0x0f) as usize * 4;
            if vihl >> 4 != 4 || ihl < 20 || *frame.get(ip_off + 9)? != IPPROTO_TCP {
                return None;
            }
            (L3::Ipv4, ip_off + ihl)
        }
        ETHERTYPE_IPV6 => {
            if *frame.get(ip_off)? >> 4 != 6 || *frame.get(ip_off + 6)? != IPPROTO_TCP {
                return None;
            }
            (L3::Ipv6, ip_off + IPV6_HLEN)
        }
        _ => return None,
    };

    let doff = (*frame.get(tcp_off + 12)? >> 4) as usize * 4;
    if doff < 20 || tcp_off + doff > frame.len() {
        return None;
    }
    Some(TcpHeaders {
        l3,
        ip_off,
        tcp_off,
        header_len: tcp_off + doff,
    })
}

impl TcpHeaders {
    pub fn seq(&self, h: &[u8]) -> u32 {
        read_u32(h, self.tcp_off + 4).unwrap_or(0)
    }

    pub fn set_seq(&self, h: &mut [u8], seq: u32) {
        write_u32(h, self.tcp_off + 4, seq);
    }

    pub fn flags(&self, h: &[u8]) -> u8 {
        h[self.tcp_off + 13]
    }

    pub fn set_flags(&self, h: &mut [u8], flags: u8) {
        h[self.tcp_off + 13] = flags;
    }

    /// IPv4 identification; 0 for IPv6.
    pub fn ip_id(&self, h: &[u8]) -> u16 {
        match self.l3 {
            L3::Ipv4 => read_u16(h, self.ip_off + 4).unwrap_or(0),
            L3::Ipv6 => 0,
        }
    }

    /// Rewrite the IP length fields for a packet carrying `payload` bytes
    /// after the headers, and the IPv4 identification when present. The IPv4
    /// header checksum is recomputed.
    pub fn set_ip_fields(&self, h: &mut [u8], payload: usize, ip_id: u16) {
        let l4_len = self.header_len - self.tcp_off + payload;
        match self.l3 {
            L3::Ipv4 => {
                let total = (self.tcp_off - self.ip_off + l4_len) as u16;
                write_u16(h, self.ip_off + 2, total);
                write_u16(h, self.ip_off + 4, ip_id);
                self.refresh_ipv4_checksum(h);
            }
            L3::Ipv6 => write_u16(h, self.ip_off + 4, l4_len as u16),
        }
    }

    /// Whether a packet carrying `payload` bytes after the headers can be
    /// described by the IP length field.
    pub fn ip_len_fits(&self, payload: usize) -> bool {
        let fixed = match self.l3 {
            L3::Ipv4 => self.header_len - self.ip_off,
            L3::Ipv6 => self.header_len - self.tcp_off,
        };
        fixed + payload <= usize::from(u16::MAX)
    }

    fn refresh_ipv4_checksum(&self, h: &mut [u8]) {
        write_u16(h, self.ip_off + 10, 0);
        let sum = ipv4_checksum(&h[self.ip_off..self.tcp_off]);
        write_u16(h, self.ip_off + 10, sum);
    }

    /// Bytes identifying the flow: addresses and ports.
    pub fn flow_key<'a>(&self, h: &'a [u8]) -> (&'a [u8], &'a [u8]) {
        let addrs = match self.l3 {
            L3::Ipv4 => &h[self.ip_off + 12..self.ip_off + 20],
            L3::Ipv6 => &h[self.ip_off + 8..self.ip_off + 40],
        };
        (addrs, &h[self.tcp_off..self.tcp_off + 4])
    }

    /// Acknowledgement number and receive window.
    pub fn ack_window(&self, h: &[u8]) -> (u32, u16) {
        (
            read_u32(h, self.tcp_off + 8).unwrap_or(0),
            read_u16(h, self.tcp_off + 14).unwrap_or(0),
        )
    }

    /// Length of the TCP payload according to the IP length field.
    pub fn ip_payload_len(&self, h: &[u8]) -> Option<usize> {
        match self.l3 {
            L3::Ipv4 => {
                let total = read_u16(h, self.ip_off + 2)? as usize;
                total.checked_sub(self.header_len - self.ip_off)
            }
            L3::Ipv6 => {
                let pl = read_u16(h, self.ip_off + 4)? as usize;
                pl.checked_sub(self.header_len - self.tcp_off)
            }
        }
    }
}

/// RFC 1071 ones' complement checksum over an IPv4 header.
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)]) as u32)
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[inline]
pub(crate) fn read_u16(b: &[u8], off: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*b.get(off)?, *b.get(off + 1)?]))
}

#[inline]
pub(crate) fn read_u32(b: &[u8], off: usize) -> Option<u32> {
    let s = b.get(off..off + 4)?;
    Some(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
}

#[inline]
pub(crate) fn write_u16(b: &mut [u8], off: usize, v: u16) {
    b[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

#[inline]
pub(crate) fn write_u32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

/// Frame builders shared by unit and integration tests.
#[doc(hidden)]
pub mod testing {
    use super::*;

    /// Ethernet + IPv4 (20 bytes) + TCP (20 bytes) header for a segment
    /// carrying `payload` bytes.
    pub fn ipv4_tcp_header(seq: u32, ip_id: u16, flags: u8, payload: usize) -> Vec<u8> {
        let mut h = vec![0u8; ETH_HLEN + 40];
        h[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 2]);
        h[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        write_u16(&mut h, 12, ETHERTYPE_IPV4);
        let ip = ETH_HLEN;
        h[ip] = 0x45;
        write_u16(&mut h, ip + 2, (40 + payload) as u16);
        write_u16(&mut h, ip + 4, ip_id);
        h[ip + 8] = 64;
        h[ip + 9] = IPPROTO_TCP;
        h[ip + 12..ip + 16].copy_from_slice(&[10, 0, 0, 1]);
        h[ip + 16..ip + 20].copy_from_slice(&[10, 0, 0, 2]);
        let sum = ipv4_checksum(&h[ip..ip + 20]);
        write_u16(&mut h, ip + 10, sum);
        let tcp = ip + 20;
        write_u16(&mut h, tcp, 40000);
        write_u16(&mut h, tcp + 2, 80);
        write_u32(&mut h, tcp + 4, seq);
        h[tcp + 12] = 5 << 4;
        h[tcp + 13] = flags;
        write_u16(&mut h, tcp + 14, 65535);
        h
    }

    /// Ethernet + IPv6 + TCP header.
    pub fn ipv6_tcp_header(seq: u32, flags: u8, payload: usize) -> Vec<u8> {
        let mut h = vec![0u8; ETH_HLEN + IPV6_HLEN + 20];
        write_u16(&mut h, 12, ETHERTYPE_IPV6);
        let ip = ETH_HLEN;
        h[ip] = 0x60;
        write_u16(&mut h, ip + 4, (20 + payload) as u16);
        h[ip + 6] = IPPROTO_TCP;
        h[ip + 7] = 64;
        h[ip + 23] = 1;
        h[ip + 39] = 2;
        let tcp = ip + IPV6_HLEN;
        write_u16(&mut h, tcp, 40000);
        write_u16(&mut h, tcp + 2, 443);
        write_u32(&mut h, tcp + 4, seq);
        h[tcp + 12] = 5 << 4;
        h[tcp + 13] = flags;
        h
    }

    /// A complete IPv4/TCP frame with a deterministic payload pattern.
    pub fn ipv4_tcp_frame(seq: u32, ip_id: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut f = ipv4_tcp_header(seq, ip_id, flags, payload.len());
        f.extend_from_slice(payload);
        f
    }

    pub fn pattern(len: usize, salt: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(salt)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn parses_ipv4_tcp() {
        let h = ipv4_tcp_header(1000, 7, TCP_ACK, 0);
        let t = parse_tcp(&h).unwrap();
        assert_eq!(t.l3, L3::Ipv4);
        assert_eq!(t.ip_off, 14);
        assert_eq!(t.tcp_off, 34);
        assert_eq!(t.header_len, 54);
        assert_eq!(t.seq(&h), 1000);
        assert_eq!(t.ip_id(&h), 7);
    }

    #[test]
    fn parses_vlan_tagged() {
        let plain = ipv4_tcp_header(1, 1, 0, 0);
        let mut h = plain[..12].to_vec();
        h.extend_from_slice(&[0x81, 0x00, 0x00, 0x05]);
        h.extend_from_slice(&plain[12..]);
        let t = parse_tcp(&h).unwrap();
        assert_eq!(t.ip_off, 18);
        assert_eq!(t.header_len, 58);
    }

    #[test]
    fn parses_ipv6_tcp() {
        let h = ipv6_tcp_header(5, TCP_PSH, 100);
        let t = parse_tcp(&h).unwrap();
        assert_eq!(t.l3, L3::Ipv6);
        assert_eq!(t.header_len, 74);
        assert_eq!(t.ip_payload_len(&h), Some(100));
    }

    #[test]
    fn rejects_udp_and_truncation() {
        let mut h = ipv4_tcp_header(1, 1, 0, 0);
        h[14 + 9] = 17;
        assert!(parse_tcp(&h).is_none());
        let h = ipv4_tcp_header(1, 1, 0, 0);
        assert!(parse_tcp(&h[..40]).is_none());
    }

    #[test]
    fn ip_rewrite_keeps_checksum_valid() {
        let mut h = ipv4_tcp_header(1, 1, 0, 0);
        let t = parse_tcp(&h).unwrap();
        t.set_ip_fields(&mut h, 1460, 99);
        assert_eq!(read_u16(&h, 16), Some(1500));
        assert_eq!(t.ip_id(&h), 99);
        assert_eq!(ipv4_checksum(&h[14..34]), 0);
        assert_eq!(t.ip_payload_len(&h), Some(1460));
    }

    #[test]
    fn ip_length_field_limits() {
        let v4 = ipv4_tcp_header(1, 1, 0, 0);
        let t = parse_tcp(&v4).unwrap();
        assert!(t.ip_len_fits(65_535 - 40));
        assert!(!t.ip_len_fits(65_535 - 39));
        let v6 = ipv6_tcp_header(1, 0, 0);
        let t = parse_tcp(&v6).unwrap();
        // The IPv6 length excludes the fixed header.
        assert!(t.ip_len_fits(65_535 - 20));
        assert!(!t.ip_len_fits(65_535 - 19));
    }

    #[test]
    fn frame_len_for_standard_mtu() {
        assert_eq!(max_frame_len(1500), 1544);
    }
}
