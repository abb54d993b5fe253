//! # IP Packets and the Packet Router
//!
//! The packet router is the ingress demultiplexer between the platform
//! network device and the tunnel: every raw IP packet entering or leaving
//! the node passes through [`PacketRouter::handle_ip_packet`], which picks a
//! handler by UDP destination port first, then by IP protocol, then falls
//! back to the base handler. Handlers take ownership of the packet buffer.
//!
//! [`IpPacket`] is a deliberately minimal header view: version, L4
//! protocol, addresses (host-order 128-bit, IPv4 mapped into
//! `::ffff:0:0/96`) and L4 ports where the protocol has them. Nothing here
//! reassembles fragments or follows IPv6 extension chains; packets that
//! cannot be classified fall through to the base handler.

use std::collections::HashMap;

/// IANA protocol numbers the path plane cares about.
pub mod proto {
    pub const ICMP: u8 = 0x01;
    pub const IPIP: u8 = 0x04;
    pub const TCP: u8 = 0x06;
    pub const UDP: u8 = 0x11;
    pub const GRE: u8 = 0x2F;
    pub const ICMP6: u8 = 0x3A;
}

/// Map an IPv4 address into the canonical v4-mapped IPv6 range.
#[inline]
pub fn map_v4(addr: u32) -> u128 {
    0xffff_0000_0000u128 | addr as u128
}

/// An owned raw IP packet with lazy header accessors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpPacket {
    buf: Vec<u8>,
}

impl IpPacket {
    /// Wrap a buffer. Returns `None` unless the buffer holds at least a
    /// well-formed IPv4 or IPv6 fixed header.
    pub fn new(buf: Vec<u8>) -> Option<Self> {
        let pkt = Self { buf };
        match pkt.version() {
            4 if pkt.buf.len() >= 20 && pkt.header_len() >= 20 && pkt.buf.len() >= pkt.header_len() => {
                Some(pkt)
            }
            6 if pkt.buf.len() >= 40 => Some(pkt),
            _ => None,
        }
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.buf.first().map(|b| b >> 4).unwrap_or(0)
    }

    fn header_len(&self) -> usize {
        match self.version() {
            4 => ((self.buf[0] & 0x0F) as usize) * 4,
            6 => 40,
            _ => 0,
        }
    }

    /// The L4 protocol byte (IPv6: the fixed-header next-header field).
    pub fn protocol(&self) -> u8 {
        match self.version() {
            4 => self.buf[9],
            6 => self.buf[6],
            _ => 0,
        }
    }

    /// Source address, host order, IPv4 mapped.
    pub fn src(&self) -> u128 {
        self.addr_at(if self.version() == 4 { 12 } else { 8 })
    }

    /// Destination address, host order, IPv4 mapped.
    pub fn dst(&self) -> u128 {
        self.addr_at(if self.version() == 4 { 16 } else { 24 })
    }

    fn addr_at(&self, offset: usize) -> u128 {
        match self.version() {
            4 => {
                let mut v4 = [0u8; 4];
                v4.copy_from_slice(&self.buf[offset..offset + 4]);
                map_v4(u32::from_be_bytes(v4))
            }
            6 => {
                let mut v6 = [0u8; 16];
                v6.copy_from_slice(&self.buf[offset..offset + 16]);
                u128::from_be_bytes(v6)
            }
            _ => 0,
        }
    }

    fn port_at(&self, l4_offset: usize) -> Option<u16> {
        let base = self.header_len();
        let start = base.checked_add(l4_offset)?;
        let bytes = self.buf.get(start..start + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// L4 source port for TCP/UDP, `None` otherwise.
    pub fn src_port(&self) -> Option<u16> {
        match self.protocol() {
            proto::TCP | proto::UDP => self.port_at(0),
            _ => None,
        }
    }

    /// L4 destination port for TCP/UDP, `None` otherwise.
    pub fn dst_port(&self) -> Option<u16> {
        match self.protocol() {
            proto::TCP | proto::UDP => self.port_at(2),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// A packet handler owning the packet it is handed.
pub type PacketHandler = Box<dyn FnMut(IpPacket) + Send>;

/// Ingress demultiplexer: base handler plus per-protocol and per-UDP-port
/// overrides.
pub struct PacketRouter {
    base: PacketHandler,
    proto_handlers: HashMap<u8, PacketHandler>,
    udp_handlers: HashMap<u16, PacketHandler>,
}

impl PacketRouter {
    /// `base` is called for every packet no other handler matches.
    pub fn new(base: PacketHandler) -> Self {
        Self {
            base,
            proto_handlers: HashMap::new(),
            udp_handlers: HashMap::new(),
        }
    }

    /// Dispatch one packet: UDP destination port match wins, then the IP
    /// protocol match, then the base handler.
    pub fn handle_ip_packet(&mut self, pkt: IpPacket) {
        if pkt.protocol() == proto::UDP {
            if let Some(port) = pkt.dst_port() {
                if let Some(handler) = self.udp_handlers.get_mut(&port) {
                    handler(pkt);
                    return;
                }
            }
        }
        let protocol = pkt.protocol();
        if let Some(handler) = self.proto_handlers.get_mut(&protocol) {
            handler(pkt);
            return;
        }
        (self.base)(pkt);
    }

    /// Route all packets of an IP protocol to `handler`.
    pub fn add_ip_proto_handler(&mut self, protocol: u8, handler: PacketHandler) {
        self.proto_handlers.insert(protocol, handler);
    }

    /// Route UDP packets destined for `port` to `handler`.
    pub fn add_udp_handler(&mut self, port: u16, handler: PacketHandler) {
        self.udp_handlers.insert(port, handler);
    }

    /// Remove a UDP port handler installed with [`add_udp_handler`].
    ///
    /// [`add_udp_handler`]: PacketRouter::add_udp_handler
    pub fn remove_udp_handler(&mut self, port: u16) {
        self.udp_handlers.remove(&port);
    }
}

impl std::fmt::Debug for PacketRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketRouter")
            .field("proto_handlers", &self.proto_handlers.len())
            .field("udp_handlers", &self.udp_handlers.len())
            .finish()
    }
}

/// Build a minimal IPv4 packet, for tests and loopback injection.
pub fn build_ipv4(src: [u8; 4], dst: [u8; 4], protocol: u8, l4: &[u8]) -> IpPacket {
    let mut buf = vec![0u8; 20];
    buf[0] = 0x45; // version 4, ihl 5
    let total = (20 + l4.len()) as u16;
    buf[2..4].copy_from_slice(&total.to_be_bytes());
    buf[8] = 64; // ttl
    buf[9] = protocol;
    buf[12..16].copy_from_slice(&src);
    buf[16..20].copy_from_slice(&dst);
    buf.extend_from_slice(l4);
    IpPacket::new(buf).expect("constructed header is well-formed")
}

/// Build a minimal UDP datagram header followed by `payload`.
pub fn build_udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut l4 = Vec::with_capacity(8 + payload.len());
    l4.extend_from_slice(&src_port.to_be_bytes());
    l4.extend_from_slice(&dst_port.to_be_bytes());
    l4.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    l4.extend_from_slice(&[0, 0]); // checksum elided
    l4.extend_from_slice(payload);
    l4
}
