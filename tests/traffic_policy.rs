//! Traffic policy enforcement at the exit boundary (S5), policy
//! embedding in router contacts, and packet-router dispatch.

use std::collections::BTreeSet;

use mixroute::contact::{AddressInfo, ExitInfo, RouterContact};
use mixroute::endpoint::{ExitEndpoint, TunEndpoint};
use mixroute::identity::Keypair;
use mixroute::messages::HopId;
use mixroute::packet::{build_ipv4, build_udp, proto, IpPacket, PacketRouter};
use mixroute::policy::{IpRange, ProtocolInfo, TrafficPolicy};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn dns_policy() -> TrafficPolicy {
    TrafficPolicy::new(
        ["10.0.0.0/8".parse().unwrap()].into_iter().collect(),
        [ProtocolInfo::new(proto::UDP, Some(53))].into_iter().collect(),
    )
}

fn udp_to(dst: [u8; 4], port: u16) -> IpPacket {
    build_ipv4([192, 168, 1, 1], dst, proto::UDP, &build_udp(40000, port, b"q"))
}

fn tcp_to(dst: [u8; 4], port: u16) -> IpPacket {
    build_ipv4([192, 168, 1, 1], dst, proto::TCP, &build_udp(40000, port, b""))
}

#[test]
fn exit_denial_matrix() {
    // { ranges: [10.0.0.0/8], protocols: [{UDP, 53}] }
    let policy = dns_policy();

    assert!(policy.allow(&udp_to([10, 1, 2, 3], 53)));
    assert!(!policy.allow(&tcp_to([10, 1, 2, 3], 80)));
    assert!(!policy.allow(&udp_to([8, 8, 8, 8], 53)));
}

#[test]
fn empty_policy_allows_everything() {
    let policy = TrafficPolicy::default();
    assert!(policy.allow(&udp_to([8, 8, 8, 8], 53)));
    assert!(policy.allow(&tcp_to([1, 1, 1, 1], 443)));
    assert!(policy.allow(&build_ipv4([9, 9, 9, 9], [1, 2, 3, 4], proto::ICMP, &[0u8; 8])));
}

#[test]
fn policy_survives_embedding_in_a_router_contact() {
    let keypair = Keypair::generate();
    let mut exit_info = ExitInfo::new("10.0.0.0/8".parse().unwrap());
    exit_info.policy = Some(dns_policy());

    let rc = RouterContact::new_signed(
        &keypair,
        vec![AddressInfo::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 1090)],
        vec![exit_info],
        None,
        1_000,
    );

    let decoded = RouterContact::decode(&rc.encode()).expect("decode");
    assert!(decoded.verify().is_ok());
    let embedded = decoded.exits[0].policy.as_ref().expect("policy embedded");
    assert_eq!(embedded, &dns_policy());

    // the embedded policy enforces the same matrix
    assert!(embedded.allow(&udp_to([10, 1, 2, 3], 53)));
    assert!(!embedded.allow(&tcp_to([10, 1, 2, 3], 80)));
}

#[test]
fn exit_endpoint_applies_policy_per_session() {
    let router = PacketRouter::new(Box::new(|_pkt| {}));
    let tun = TunEndpoint::new("exit0", "10.10.0.0/16".parse().unwrap(), router);
    let mut exit = ExitEndpoint::new(tun, dns_policy());

    let path = HopId::random();
    exit.allocate_exit([1u8; 32], path, true, 0).expect("allocate");

    assert!(exit
        .handle_outbound(&path, udp_to([10, 1, 2, 3], 53), 10)
        .is_some());
    assert!(exit
        .handle_outbound(&path, tcp_to([10, 1, 2, 3], 80), 10)
        .is_none());
    assert!(exit
        .handle_outbound(&path, udp_to([8, 8, 8, 8], 53), 10)
        .is_none());
}

#[test]
fn packet_router_feeds_handlers_by_specificity() {
    let base = Arc::new(AtomicUsize::new(0));
    let dns = Arc::new(AtomicUsize::new(0));
    let udp = Arc::new(AtomicUsize::new(0));

    let mut router = {
        let base = base.clone();
        PacketRouter::new(Box::new(move |_pkt| {
            base.fetch_add(1, Ordering::SeqCst);
        }))
    };
    {
        let udp = udp.clone();
        router.add_ip_proto_handler(
            proto::UDP,
            Box::new(move |_pkt| {
                udp.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }
    {
        let dns = dns.clone();
        router.add_udp_handler(
            53,
            Box::new(move |pkt| {
                assert_eq!(pkt.dst_port(), Some(53));
                dns.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    router.handle_ip_packet(udp_to([10, 0, 0, 1], 53));
    router.handle_ip_packet(udp_to([10, 0, 0, 1], 123));
    router.handle_ip_packet(tcp_to([10, 0, 0, 1], 80));
    router.handle_ip_packet(udp_to([10, 0, 0, 1], 53));

    assert_eq!(dns.load(Ordering::SeqCst), 2);
    assert_eq!(udp.load(Ordering::SeqCst), 1);
    assert_eq!(base.load(Ordering::SeqCst), 1);

    // dropping the port handler reroutes to the protocol handler
    router.remove_udp_handler(53);
    router.handle_ip_packet(udp_to([10, 0, 0, 1], 53));
    assert_eq!(dns.load(Ordering::SeqCst), 2);
    assert_eq!(udp.load(Ordering::SeqCst), 2);
}

#[test]
fn range_set_semantics() {
    // ranges behave as a set keyed by masked base + mask
    let mut ranges: BTreeSet<IpRange> = BTreeSet::new();
    ranges.insert("10.0.0.0/8".parse().unwrap());
    ranges.insert("10.0.0.1/8".parse().unwrap()); // same masked base
    ranges.insert("10.0.0.0/16".parse().unwrap());
    assert_eq!(ranges.len(), 2);

    let v4_mapped = IpRange::v4_mapped();
    for range in &ranges {
        assert!(v4_mapped.contains_range(range));
    }
}
