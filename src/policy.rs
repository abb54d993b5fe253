//! # Traffic Policy and IP Ranges
//!
//! Exit endpoints advertise and enforce what traffic they will carry. A
//! [`TrafficPolicy`] is a pair of sets: CIDR-style [`IpRange`]s the
//! destination must fall in, and [`ProtocolInfo`] entries (protocol byte
//! plus optional L4 port) the packet must match. An empty set places no
//! constraint; an empty policy allows everything.
//!
//! Ranges are 128-bit address/netmask pairs. IPv4 lives in the canonical
//! v4-mapped subrange `::ffff:0:0/96`, so one representation covers both
//! families. Policies bencode canonically so they can be embedded in router
//! contacts and service descriptors.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::bencode::{self, DictBuilder, Value};
use crate::packet::{proto, IpPacket};

/// Error type for policy and range parsing failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// Not a recognizable address, range, or protocol spec.
    BadSpec(String),
    /// Bencoded form did not decode or had the wrong shape.
    BadEncoding,
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyError::BadSpec(s) => write!(f, "cannot parse '{}'", s),
            PolicyError::BadEncoding => write!(f, "malformed policy encoding"),
        }
    }
}

impl std::error::Error for PolicyError {}

// ============================================================================
// IpRange
// ============================================================================

/// Number of leading mask bits set, expressed as a 128-bit netmask.
#[inline]
const fn netmask_bits(bits: u32) -> u128 {
    if bits == 0 {
        0
    } else if bits >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - bits)
    }
}

/// A 128-bit address range: base address plus netmask, host byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpRange {
    pub addr: u128,
    pub netmask: u128,
}

impl IpRange {
    pub const fn new(addr: u128, netmask: u128) -> Self {
        Self { addr, netmask }
    }

    /// The canonical v4-mapped range `::ffff:0:0/96`.
    pub const fn v4_mapped() -> Self {
        Self::new(0xffff_0000_0000, netmask_bits(96))
    }

    /// An IPv4 range, e.g. `IpRange::from_ipv4(10, 0, 0, 0, 8)`.
    pub const fn from_ipv4(a: u8, b: u8, c: u8, d: u8, mask: u32) -> Self {
        Self::new(
            0xffff_0000_0000 | u32::from_be_bytes([a, b, c, d]) as u128,
            netmask_bits(mask + 96),
        )
    }

    /// True if this range sits inside the v4-mapped subrange.
    pub fn is_v4(&self) -> bool {
        Self::v4_mapped().contains(self.addr)
    }

    /// Host-mask bit count as written in CIDR notation.
    pub fn hostmask_bits(&self) -> u32 {
        let bits = self.netmask.count_ones();
        if self.is_v4() {
            bits.saturating_sub(96)
        } else {
            bits
        }
    }

    /// True if `ip` (128-bit, v4-mapped for IPv4) falls in this range.
    #[inline]
    pub fn contains(&self, ip: u128) -> bool {
        (self.addr & self.netmask) == (ip & self.netmask)
    }

    /// True if `other` is entirely inside this range.
    pub fn contains_range(&self, other: &IpRange) -> bool {
        self.contains(other.addr) && self.contains(other.highest_addr())
    }

    /// The highest address in this range.
    pub fn highest_addr(&self) -> u128 {
        (self.addr & self.netmask) | !self.netmask
    }

    pub fn bt_encode(&self) -> Value {
        Value::List(vec![
            Value::Bytes(self.addr.to_be_bytes().to_vec()),
            Value::Bytes(self.netmask.to_be_bytes().to_vec()),
        ])
    }

    pub fn bt_decode(value: &Value) -> Result<Self, PolicyError> {
        let items = value.as_list().ok_or(PolicyError::BadEncoding)?;
        if items.len() != 2 {
            return Err(PolicyError::BadEncoding);
        }
        let mut parts = [0u128; 2];
        for (slot, item) in parts.iter_mut().zip(items) {
            let bytes = item.as_bytes().ok_or(PolicyError::BadEncoding)?;
            let arr: [u8; 16] = bytes.try_into().map_err(|_| PolicyError::BadEncoding)?;
            *slot = u128::from_be_bytes(arr);
        }
        Ok(Self::new(parts[0], parts[1]))
    }
}

impl FromStr for IpRange {
    type Err = PolicyError;

    /// Parse `10.0.0.0/8`, `10.1.2.3`, `fd00::/8`, or `::1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_part, mask_part) = match s.split_once('/') {
            Some((a, m)) => (a, Some(m)),
            None => (s, None),
        };
        let bad = || PolicyError::BadSpec(s.to_string());

        if let Ok(v4) = addr_part.parse::<Ipv4Addr>() {
            let mask: u32 = match mask_part {
                Some(m) => m.parse().map_err(|_| bad())?,
                None => 32,
            };
            if mask > 32 {
                return Err(bad());
            }
            let [a, b, c, d] = v4.octets();
            return Ok(Self::from_ipv4(a, b, c, d, mask));
        }
        if let Ok(v6) = addr_part.parse::<Ipv6Addr>() {
            let mask: u32 = match mask_part {
                Some(m) => m.parse().map_err(|_| bad())?,
                None => 128,
            };
            if mask > 128 {
                return Err(bad());
            }
            return Ok(Self::new(u128::from_be_bytes(v6.octets()), netmask_bits(mask)));
        }
        Err(bad())
    }
}

impl std::fmt::Display for IpRange {
    /// v4 ranges print in dotted form, everything else as v6 CIDR.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_v4() {
            let v4 = Ipv4Addr::from((self.addr & 0xffff_ffff) as u32);
            write!(f, "{}/{}", v4, self.hostmask_bits())
        } else {
            let v6 = Ipv6Addr::from(self.addr.to_be_bytes());
            write!(f, "{}/{}", v6, self.hostmask_bits())
        }
    }
}

impl PartialOrd for IpRange {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IpRange {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.addr & self.netmask, self.netmask).cmp(&(other.addr & other.netmask, other.netmask))
    }
}

// ============================================================================
// ProtocolInfo
// ============================================================================

/// One allowed protocol: the IP protocol byte plus an optional L4 port
/// (host order) for TCP/UDP.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolInfo {
    pub protocol: u8,
    pub port: Option<u16>,
}

impl ProtocolInfo {
    pub const fn new(protocol: u8, port: Option<u16>) -> Self {
        Self { protocol, port }
    }

    /// True if the packet's protocol matches, and its destination port too
    /// when one is specified.
    pub fn matches_packet(&self, pkt: &IpPacket) -> bool {
        if pkt.protocol() != self.protocol {
            return false;
        }
        match self.port {
            Some(port) => pkt.dst_port() == Some(port),
            None => true,
        }
    }

    pub fn bt_encode(&self) -> Value {
        let mut items = vec![Value::Int(self.protocol as i64)];
        if let Some(port) = self.port {
            items.push(Value::Int(port as i64));
        }
        Value::List(items)
    }

    pub fn bt_decode(value: &Value) -> Result<Self, PolicyError> {
        let items = value.as_list().ok_or(PolicyError::BadEncoding)?;
        let protocol = items
            .first()
            .and_then(Value::as_int)
            .filter(|p| (0..=255).contains(p))
            .ok_or(PolicyError::BadEncoding)? as u8;
        let port = match items.get(1) {
            Some(v) => Some(
                v.as_int()
                    .filter(|p| (0..=65535).contains(p))
                    .ok_or(PolicyError::BadEncoding)? as u16,
            ),
            None => None,
        };
        if items.len() > 2 {
            return Err(PolicyError::BadEncoding);
        }
        Ok(Self::new(protocol, port))
    }
}

impl FromStr for ProtocolInfo {
    type Err = PolicyError;

    /// Parse `udp/53`, `tcp`, or a raw protocol number like `47`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || PolicyError::BadSpec(s.to_string());
        let (proto_part, port_part) = match s.split_once('/') {
            Some((p, port)) => (p, Some(port)),
            None => (s, None),
        };
        let protocol = match proto_part.to_ascii_lowercase().as_str() {
            "icmp" => proto::ICMP,
            "tcp" => proto::TCP,
            "udp" => proto::UDP,
            "gre" => proto::GRE,
            other => other.parse::<u8>().map_err(|_| bad())?,
        };
        let port = match port_part {
            Some(p) => Some(p.parse::<u16>().map_err(|_| bad())?),
            None => None,
        };
        Ok(Self::new(protocol, port))
    }
}

// ============================================================================
// TrafficPolicy
// ============================================================================

/// What traffic an exit will carry. Empty sets allow everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrafficPolicy {
    pub ranges: BTreeSet<IpRange>,
    pub protocols: BTreeSet<ProtocolInfo>,
}

impl TrafficPolicy {
    pub fn new(ranges: BTreeSet<IpRange>, protocols: BTreeSet<ProtocolInfo>) -> Self {
        Self { ranges, protocols }
    }

    /// True if we allow the traffic in this IP packet: the destination must
    /// fall in some range (if any are set) and some protocol entry must
    /// match (if any are set).
    pub fn allow(&self, pkt: &IpPacket) -> bool {
        let range_ok =
            self.ranges.is_empty() || self.ranges.iter().any(|r| r.contains(pkt.dst()));
        let proto_ok = self.protocols.is_empty()
            || self.protocols.iter().any(|p| p.matches_packet(pkt));
        range_ok && proto_ok
    }

    /// Canonical bencoded form, embeddable in contacts and descriptors.
    pub fn bt_encode(&self) -> Value {
        DictBuilder::new()
            .insert(
                "p",
                Value::List(self.protocols.iter().map(ProtocolInfo::bt_encode).collect()),
            )
            .insert(
                "r",
                Value::List(self.ranges.iter().map(IpRange::bt_encode).collect()),
            )
            .build()
    }

    pub fn bt_decode(value: &Value) -> Result<Self, PolicyError> {
        let protocols = value
            .get("p")
            .and_then(Value::as_list)
            .ok_or(PolicyError::BadEncoding)?
            .iter()
            .map(ProtocolInfo::bt_decode)
            .collect::<Result<BTreeSet<_>, _>>()?;
        let ranges = value
            .get("r")
            .and_then(Value::as_list)
            .ok_or(PolicyError::BadEncoding)?
            .iter()
            .map(IpRange::bt_decode)
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Self::new(ranges, protocols))
    }

    pub fn encode(&self) -> Vec<u8> {
        self.bt_encode().encode()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PolicyError> {
        let value = bencode::decode(buf).map_err(|_| PolicyError::BadEncoding)?;
        Self::bt_decode(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{build_ipv4, build_udp, map_v4};

    fn udp_to(dst: [u8; 4], port: u16) -> IpPacket {
        build_ipv4([192, 168, 0, 1], dst, proto::UDP, &build_udp(40000, port, b"x"))
    }

    fn tcp_to(dst: [u8; 4], port: u16) -> IpPacket {
        build_ipv4([192, 168, 0, 1], dst, proto::TCP, &build_udp(40000, port, b""))
    }

    #[test]
    fn range_contains_v4() {
        let range: IpRange = "10.0.0.0/8".parse().unwrap();
        assert!(range.is_v4());
        assert_eq!(range.hostmask_bits(), 8);
        assert!(range.contains(map_v4(u32::from_be_bytes([10, 1, 2, 3]))));
        assert!(!range.contains(map_v4(u32::from_be_bytes([11, 1, 2, 3]))));
    }

    #[test]
    fn range_contains_v6() {
        let range: IpRange = "fd00::/8".parse().unwrap();
        assert!(!range.is_v4());
        let inside: IpRange = "fd12:3456::1".parse().unwrap();
        let outside: IpRange = "fe00::1".parse().unwrap();
        assert!(range.contains(inside.addr));
        assert!(!range.contains(outside.addr));
    }

    #[test]
    fn v4_mapped_range_covers_all_v4() {
        let mapped = IpRange::v4_mapped();
        assert!(mapped.contains(map_v4(0)));
        assert!(mapped.contains(map_v4(u32::MAX)));
        let v6: IpRange = "2001:db8::1".parse().unwrap();
        assert!(!mapped.contains(v6.addr));
    }

    #[test]
    fn range_nesting() {
        let outer: IpRange = "10.0.0.0/8".parse().unwrap();
        let inner: IpRange = "10.1.0.0/16".parse().unwrap();
        assert!(outer.contains_range(&inner));
        assert!(!inner.contains_range(&outer));
    }

    #[test]
    fn range_parse_rejects_garbage() {
        assert!("10.0.0.0/33".parse::<IpRange>().is_err());
        assert!("not-an-ip".parse::<IpRange>().is_err());
        assert!("fd00::/129".parse::<IpRange>().is_err());
    }

    #[test]
    fn range_display_roundtrip() {
        for spec in ["10.0.0.0/8", "192.168.1.0/24", "fd00::/8"] {
            let range: IpRange = spec.parse().unwrap();
            assert_eq!(range.to_string(), spec);
        }
    }

    #[test]
    fn protocol_spec_parsing() {
        assert_eq!(
            "udp/53".parse::<ProtocolInfo>().unwrap(),
            ProtocolInfo::new(proto::UDP, Some(53))
        );
        assert_eq!(
            "tcp".parse::<ProtocolInfo>().unwrap(),
            ProtocolInfo::new(proto::TCP, None)
        );
        assert_eq!(
            "47".parse::<ProtocolInfo>().unwrap(),
            ProtocolInfo::new(47, None)
        );
        assert!("udp/99999".parse::<ProtocolInfo>().is_err());
    }

    #[test]
    fn empty_policy_allows_all_wellformed_packets() {
        let policy = TrafficPolicy::default();
        assert!(policy.allow(&udp_to([8, 8, 8, 8], 53)));
        assert!(policy.allow(&tcp_to([10, 1, 2, 3], 80)));
        assert!(policy.allow(&build_ipv4([1; 4], [2; 4], proto::ICMP, &[0; 8])));
    }

    #[test]
    fn exit_denial_matrix() {
        // ranges [10.0.0.0/8], protocols [{UDP, 53}]
        let policy = TrafficPolicy::new(
            ["10.0.0.0/8".parse().unwrap()].into_iter().collect(),
            [ProtocolInfo::new(proto::UDP, Some(53))].into_iter().collect(),
        );

        assert!(policy.allow(&udp_to([10, 1, 2, 3], 53)));
        assert!(!policy.allow(&tcp_to([10, 1, 2, 3], 80)));
        assert!(!policy.allow(&udp_to([8, 8, 8, 8], 53)));
    }

    #[test]
    fn port_unconstrained_protocol_matches_any_port() {
        let policy = TrafficPolicy::new(
            BTreeSet::new(),
            [ProtocolInfo::new(proto::UDP, None)].into_iter().collect(),
        );
        assert!(policy.allow(&udp_to([8, 8, 8, 8], 53)));
        assert!(policy.allow(&udp_to([8, 8, 8, 8], 9999)));
        assert!(!policy.allow(&tcp_to([8, 8, 8, 8], 53)));
    }

    #[test]
    fn policy_encoding_roundtrip() {
        let policy = TrafficPolicy::new(
            ["10.0.0.0/8".parse().unwrap(), "fd00::/8".parse().unwrap()]
                .into_iter()
                .collect(),
            [
                ProtocolInfo::new(proto::UDP, Some(53)),
                ProtocolInfo::new(proto::TCP, None),
            ]
            .into_iter()
            .collect(),
        );
        let encoded = policy.encode();
        assert_eq!(TrafficPolicy::decode(&encoded).unwrap(), policy);
        // canonical: byte-identical across encodes
        assert_eq!(encoded, policy.encode());
    }

    #[test]
    fn policy_decode_rejects_malformed() {
        assert!(TrafficPolicy::decode(b"garbage").is_err());
        assert!(TrafficPolicy::decode(b"le").is_err());
        // protocol entry with out-of-range byte
        let bad = DictBuilder::new()
            .insert("p", Value::List(vec![Value::List(vec![Value::Int(300)])]))
            .insert("r", Value::List(vec![]))
            .build()
            .encode();
        assert!(TrafficPolicy::decode(&bad).is_err());
    }
}
