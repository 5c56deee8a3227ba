//! Flow identification for link-layer frames.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use etherparse::{NetHeaders, PacketHeaders, TransportHeader};

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMPV6: u8 = 58;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

/// TCP control bits relevant to flow accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub window: u16,
}

/// Header fields of one frame, as seen on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowPacket {
    pub src: Endpoint,
    pub dst: Endpoint,
    pub proto: u8,
    pub ip_version: u8,
    pub ttl: u8,
    pub tcp: Option<TcpFlags>,
}

impl FlowPacket {
    /// Parses Ethernet (optionally VLAN-tagged) + IPv4/IPv6 + transport
    /// headers. Returns `None` for non-IP or truncated frames.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let headers = PacketHeaders::from_ethernet_slice(frame).ok()?;
        let (src_addr, dst_addr, mut proto, ip_version, ttl) = match headers.net? {
            NetHeaders::Ipv4(hdr, _) => (
                IpAddr::V4(Ipv4Addr::from(hdr.source)),
                IpAddr::V4(Ipv4Addr::from(hdr.destination)),
                hdr.protocol.0,
                4,
                hdr.time_to_live,
            ),
            NetHeaders::Ipv6(hdr, _) => (
                IpAddr::V6(Ipv6Addr::from(hdr.source)),
                IpAddr::V6(Ipv6Addr::from(hdr.destination)),
                hdr.next_header.0,
                6,
                hdr.hop_limit,
            ),
            #[allow(unreachable_patterns)]
            _ => return None,
        };
        let (src_port, dst_port, tcp) = match headers.transport {
            Some(TransportHeader::Tcp(tcp)) => {
                proto = PROTO_TCP;
                let flags = TcpFlags {
                    syn: tcp.syn,
                    ack: tcp.ack,
                    fin: tcp.fin,
                    rst: tcp.rst,
                    window: tcp.window_size,
                };
                (tcp.source_port, tcp.destination_port, Some(flags))
            }
            Some(TransportHeader::Udp(udp)) => {
                proto = PROTO_UDP;
                (udp.source_port, udp.destination_port, None)
            }
            Some(TransportHeader::Icmpv4(_)) => {
                proto = PROTO_ICMP;
                (0, 0, None)
            }
            Some(TransportHeader::Icmpv6(_)) => {
                proto = PROTO_ICMPV6;
                (0, 0, None)
            }
            _ => (0, 0, None),
        };
        Some(Self {
            src: Endpoint {
                addr: src_addr,
                port: src_port,
            },
            dst: Endpoint {
                addr: dst_addr,
                port: dst_port,
            },
            proto,
            ip_version,
            ttl,
            tcp,
        })
    }

    pub fn key(&self) -> FlowKey {
        FlowKey::new(self.src, self.dst, self.proto)
    }
}

/// Direction-independent flow identity: both directions of a conversation
/// map to the same key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowKey {
    lo: Endpoint,
    hi: Endpoint,
    proto: u8,
}

impl FlowKey {
    pub fn new(a: Endpoint, b: Endpoint, proto: u8) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self { lo, hi, proto }
    }

    pub fn proto(&self) -> u8 {
        self.proto
    }

    /// Symmetric hash used to pick a fanout member.
    pub fn fanout_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

pub fn proto_name(proto: u8) -> &'static str {
    match proto {
        PROTO_ICMP => "ICMP",
        PROTO_TCP => "TCP",
        PROTO_UDP => "UDP",
        PROTO_ICMPV6 => "ICMPv6",
        _ => "OTHER",
    }
}
