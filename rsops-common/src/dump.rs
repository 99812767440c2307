//! TCP connection dump.
//!
//! Picks TCP segments carrying SYN out of IPv4 frames and describes them as
//! a fixed size event for the perf buffer.

use core::fmt;
use core::mem;
use core::net::Ipv4Addr;

#[cfg(feature = "user")]
use aya::Pod;

use crate::{
    Frame, ETH_HLEN, ETH_P_IP, ETH_TYPE_OFFSET, IPPROTO_TCP, IPV4_DADDR_OFFSET, IPV4_MIN_HLEN,
    IPV4_PROTOCOL_OFFSET, IPV4_SADDR_OFFSET, TCP_DPORT_OFFSET, TCP_FLAGS_OFFSET, TCP_FLAG_SYN,
    TCP_SPORT_OFFSET,
};

/// One observed TCP connection attempt. Every field is in host order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpEvent {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
}

impl TcpEvent {
    /// Size of the record pushed into the perf buffer
    pub const LEN: usize = mem::size_of::<TcpEvent>();

    pub fn source(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_addr)
    }

    pub fn destination(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_addr)
    }

    /// Decode a perf buffer sample. Trailing bytes are ignored.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LEN {
            return None;
        }
        // SAFETY: length checked above, every bit pattern is a valid TcpEvent
        Some(unsafe { core::ptr::read_unaligned(data.as_ptr() as *const TcpEvent) })
    }
}

impl fmt::Display for TcpEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TCP:{}:{}-->{}:{}",
            self.source(),
            self.src_port,
            self.destination(),
            self.dst_port
        )
    }
}

#[cfg(feature = "user")]
unsafe impl Pod for TcpEvent {}

/// Describe a frame as a [`TcpEvent`] if it is an IPv4 TCP segment with SYN
/// set. IPv4 options are honoured through the header length field.
#[inline(always)]
pub fn tcp_event_of<F: Frame + ?Sized>(frame: &F) -> Option<TcpEvent> {
    let ethertype = frame.load_be_u16(ETH_TYPE_OFFSET)?;
    if ethertype != ETH_P_IP {
        return None;
    }

    if frame.load_u8(ETH_HLEN + IPV4_PROTOCOL_OFFSET)? != IPPROTO_TCP {
        return None;
    }

    let ihl = (frame.load_u8(ETH_HLEN)? & 0x0F) as usize * 4;
    if ihl < IPV4_MIN_HLEN {
        return None;
    }
    let tcp = ETH_HLEN + ihl;

    let flags = frame.load_u8(tcp + TCP_FLAGS_OFFSET)?;
    if flags & TCP_FLAG_SYN == 0 {
        return None;
    }

    Some(TcpEvent {
        src_addr: frame.load_be_u32(ETH_HLEN + IPV4_SADDR_OFFSET)?,
        dst_addr: frame.load_be_u32(ETH_HLEN + IPV4_DADDR_OFFSET)?,
        src_port: frame.load_be_u16(tcp + TCP_SPORT_OFFSET)?,
        dst_port: frame.load_be_u16(tcp + TCP_DPORT_OFFSET)?,
    })
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::string::ToString;
    use std::vec;
    use std::vec::Vec;

    const ACK: u8 = 0x10;

    fn tcp_frame(ihl: u8, flags: u8) -> Vec<u8> {
        let ip_len = ihl as usize * 4;
        let mut frame = vec![0u8; ETH_HLEN + ip_len.max(IPV4_MIN_HLEN) + 20];
        frame[12..14].copy_from_slice(&ETH_P_IP.to_be_bytes());

        let ip = ETH_HLEN;
        frame[ip] = 0x40 | ihl;
        frame[ip + IPV4_PROTOCOL_OFFSET] = IPPROTO_TCP;
        frame[ip + 12..ip + 16].copy_from_slice(&[192, 168, 1, 10]);
        frame[ip + 16..ip + 20].copy_from_slice(&[10, 0, 0, 1]);

        let tcp = ip + ip_len;
        frame[tcp..tcp + 2].copy_from_slice(&54321u16.to_be_bytes());
        frame[tcp + 2..tcp + 4].copy_from_slice(&443u16.to_be_bytes());
        frame[tcp + 13] = flags;
        frame
    }

    #[test]
    fn test_syn_produces_event() {
        let event = tcp_event_of(&tcp_frame(5, TCP_FLAG_SYN)[..]).unwrap();
        assert_eq!(event.source(), Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(event.destination(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(event.src_port, 54321);
        assert_eq!(event.dst_port, 443);

        // SYN-ACK is reported as well
        assert!(tcp_event_of(&tcp_frame(5, TCP_FLAG_SYN | ACK)[..]).is_some());
    }

    #[test]
    fn test_ip_options_shift_tcp_header() {
        let event = tcp_event_of(&tcp_frame(8, TCP_FLAG_SYN)[..]).unwrap();
        assert_eq!(event.src_port, 54321);
        assert_eq!(event.dst_port, 443);
    }

    #[test]
    fn test_non_syn_and_non_tcp_are_ignored() {
        assert_eq!(tcp_event_of(&tcp_frame(5, ACK)[..]), None);

        let mut udp = tcp_frame(5, TCP_FLAG_SYN);
        udp[ETH_HLEN + IPV4_PROTOCOL_OFFSET] = 17;
        assert_eq!(tcp_event_of(&udp[..]), None);

        let mut ipv6 = tcp_frame(5, TCP_FLAG_SYN);
        ipv6[12..14].copy_from_slice(&0x86DDu16.to_be_bytes());
        assert_eq!(tcp_event_of(&ipv6[..]), None);
    }

    #[test]
    fn test_bad_or_truncated_headers_are_ignored() {
        // Header length below the IPv4 minimum
        assert_eq!(tcp_event_of(&tcp_frame(4, TCP_FLAG_SYN)[..]), None);

        let frame = tcp_frame(5, TCP_FLAG_SYN);
        let cut = ETH_HLEN + IPV4_MIN_HLEN + TCP_FLAGS_OFFSET;
        assert_eq!(tcp_event_of(&frame[..cut]), None);
        assert_eq!(tcp_event_of(&frame[..10]), None);
    }

    #[test]
    fn test_event_layout_and_decode() {
        assert_eq!(TcpEvent::LEN, 12);

        let event = TcpEvent {
            src_addr: u32::from(Ipv4Addr::new(10, 1, 2, 3)),
            dst_addr: u32::from(Ipv4Addr::new(10, 4, 5, 6)),
            src_port: 40000,
            dst_port: 22,
        };
        let mut sample = Vec::new();
        sample.extend_from_slice(&event.src_addr.to_ne_bytes());
        sample.extend_from_slice(&event.dst_addr.to_ne_bytes());
        sample.extend_from_slice(&event.src_port.to_ne_bytes());
        sample.extend_from_slice(&event.dst_port.to_ne_bytes());

        assert_eq!(TcpEvent::from_bytes(&sample), Some(event));
        // Perf samples are padded to 8 bytes
        sample.extend_from_slice(&[0; 4]);
        assert_eq!(TcpEvent::from_bytes(&sample), Some(event));
        assert_eq!(TcpEvent::from_bytes(&sample[..11]), None);

        assert_eq!(event.to_string(), "TCP:10.1.2.3:40000-->10.4.5.6:22");
    }
}
