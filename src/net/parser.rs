//! Frame parsing and byte attribution.
//!
//! Capture workers hand every frame through here. The parse walks the
//! link-layer prefix, the IP header, and the first four bytes of the L4
//! header:
//!
//! ```text
//!         16 bits                16 bits
//! +----------------------+----------------------+
//! |       SRC PORT       |       DST PORT       |
//! +----------------------+----------------------+
//! ```
//!
//! Anything that is not TCP or UDP over IPv4/IPv6 is dropped silently.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const IPPROTO_TCP: u8 = 0x06;
const IPPROTO_UDP: u8 = 0x11;

/// Link-layer framing of a capture, deciding how many bytes precede the IP
/// header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// BSD-style loopback encapsulation: 4-byte protocol family prefix.
    Loopback,
    /// Ethernet II: 14-byte header.
    Ethernet,
}

impl LinkKind {
    pub fn header_len(self) -> usize {
        match self {
            LinkKind::Loopback => 4,
            LinkKind::Ethernet => 14,
        }
    }
}

/// Addresses and ports extracted from one TCP or UDP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketPorts {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

/// Which per-port counters one packet should be charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charge {
    /// Loopback traffic counts on both sides of the connection.
    Both { tx: u16, rx: u16 },
    /// Locally originated: transmitted through the source port.
    Tx(u16),
    /// Locally terminated: received through the destination port.
    Rx(u16),
}

/// Parses one captured frame down to its L4 ports.
///
/// Returns `None` for anything that should be dropped: short frames,
/// non-IP payloads, IP versions other than 4 and 6, and protocols other
/// than TCP and UDP.
pub fn parse_frame(link: LinkKind, frame: &[u8]) -> Option<PacketPorts> {
    let ip = frame.get(link.header_len()..)?;
    let version = ip.first()? >> 4;

    let (src_addr, dst_addr, protocol, header_len) = match version {
        4 => {
            let header_len = usize::from(ip.first()? & 0x0F) * 4;
            if header_len < 20 {
                return None;
            }
            let src: [u8; 4] = ip.get(12..16)?.try_into().ok()?;
            let dst: [u8; 4] = ip.get(16..20)?.try_into().ok()?;
            (
                IpAddr::V4(Ipv4Addr::from(src)),
                IpAddr::V4(Ipv4Addr::from(dst)),
                *ip.get(9)?,
                header_len,
            )
        }
        6 => {
            // No extension-header walk: ports are read right after the
            // fixed 40-byte header, matching what the attribution needs for
            // the overwhelmingly common case.
            let src: [u8; 16] = ip.get(8..24)?.try_into().ok()?;
            let dst: [u8; 16] = ip.get(24..40)?.try_into().ok()?;
            (
                IpAddr::V6(Ipv6Addr::from(src)),
                IpAddr::V6(Ipv6Addr::from(dst)),
                *ip.get(6)?,
                40,
            )
        }
        _ => return None,
    };

    if protocol != IPPROTO_TCP && protocol != IPPROTO_UDP {
        return None;
    }

    let l4 = ip.get(header_len..)?;
    let src_port = u16::from_be_bytes(l4.get(0..2)?.try_into().ok()?);
    let dst_port = u16::from_be_bytes(l4.get(2..4)?.try_into().ok()?);

    Some(PacketPorts {
        src_addr,
        dst_addr,
        src_port,
        dst_port,
    })
}

/// Decides which counters the packet belongs to.
///
/// On loopback links the same packet is both sent and received locally, so
/// it counts on both ports. Elsewhere the interface's own addresses decide
/// the direction; a packet touching neither address (seen in promiscuous
/// edge cases) is dropped.
pub fn charge_for(
    link: LinkKind,
    packet: &PacketPorts,
    local_addrs: &HashSet<IpAddr>,
) -> Option<Charge> {
    match link {
        LinkKind::Loopback => Some(Charge::Both {
            tx: packet.src_port,
            rx: packet.dst_port,
        }),
        LinkKind::Ethernet => {
            if local_addrs.contains(&packet.src_addr) {
                Some(Charge::Tx(packet.src_port))
            } else if local_addrs.contains(&packet.dst_addr) {
                Some(Charge::Rx(packet.dst_port))
            } else {
                None
            }
        }
    }
}
