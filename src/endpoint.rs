//! # Endpoints
//!
//! Endpoints are where tunnel traffic touches something that is not the
//! overlay: a tun-facing handler feeding the packet router, or an exit
//! bridging traffic to the Internet on behalf of remote clients.
//!
//! The shared surface is the small [`Endpoint`] capability: everything
//! drives the same `tick`/`set_option`/`name` shape. An [`ExitEndpoint`]
//! is *composed over* a [`TunEndpoint`] rather than derived from one, and
//! adds the exit-session table: which client key owns which path and
//! mapped address, gated by the endpoint's traffic policy.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::messages::HopId;
use crate::packet::{IpPacket, PacketRouter};
use crate::policy::{IpRange, TrafficPolicy};

/// Idle exit sessions are reaped after this long.
const EXIT_SESSION_IDLE_MS: u64 = 10 * 60 * 1000;

/// Capability every endpoint variant exposes to the node loop.
pub trait Endpoint: Send {
    fn name(&self) -> &str;

    /// Periodic maintenance on the loop thread.
    fn tick(&mut self, now_ms: u64);

    /// Apply a configuration option; false if the key is unknown or the
    /// value unusable.
    fn set_option(&mut self, key: &str, value: &str) -> bool;
}

// ============================================================================
// TunEndpoint
// ============================================================================

/// The tun-facing side: packets from the platform device get classified by
/// the packet router and fed into the tunnel, and vice versa.
pub struct TunEndpoint {
    name: String,
    range: IpRange,
    router: PacketRouter,
}

impl TunEndpoint {
    pub fn new(name: impl Into<String>, range: IpRange, router: PacketRouter) -> Self {
        Self {
            name: name.into(),
            range,
            router,
        }
    }

    pub fn range(&self) -> &IpRange {
        &self.range
    }

    pub fn packet_router(&mut self) -> &mut PacketRouter {
        &mut self.router
    }

    /// Ingress from the platform device.
    pub fn handle_packet(&mut self, pkt: IpPacket) {
        self.router.handle_ip_packet(pkt);
    }
}

impl Endpoint for TunEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self, _now_ms: u64) {}

    fn set_option(&mut self, key: &str, value: &str) -> bool {
        match key {
            "ifaddr" => match value.parse::<IpRange>() {
                Ok(range) => {
                    self.range = range;
                    true
                }
                Err(err) => {
                    warn!(value, error = %err, "bad ifaddr option");
                    false
                }
            },
            _ => false,
        }
    }
}

// ============================================================================
// ExitEndpoint
// ============================================================================

/// One remote client's exit session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitSession {
    pub pubkey: [u8; 32],
    pub path_id: HopId,
    pub ip: u128,
    pub permit_internet: bool,
    pub last_active_ms: u64,
}

/// An exit endpoint bridges overlay traffic to the outside, keyed by the
/// client identity that authorized the session.
pub struct ExitEndpoint {
    tun: TunEndpoint,
    permit_exit: bool,
    policy: TrafficPolicy,

    /// `path -> client key` for fast per-packet attribution.
    paths: HashMap<HopId, [u8; 32]>,
    /// `client key -> session`.
    active_exits: HashMap<[u8; 32], ExitSession>,
    next_ip_offset: u128,
}

impl ExitEndpoint {
    pub fn new(tun: TunEndpoint, policy: TrafficPolicy) -> Self {
        Self {
            tun,
            permit_exit: true,
            policy,
            paths: HashMap::new(),
            active_exits: HashMap::new(),
            next_ip_offset: 0,
        }
    }

    pub fn tun(&mut self) -> &mut TunEndpoint {
        &mut self.tun
    }

    pub fn policy(&self) -> &TrafficPolicy {
        &self.policy
    }

    pub fn num_sessions(&self) -> usize {
        self.active_exits.len()
    }

    /// Allocate an exit for `pubkey` over `path`, handing back the mapped
    /// address. Refused when exiting is disabled or the pool is exhausted.
    pub fn allocate_exit(
        &mut self,
        pubkey: [u8; 32],
        path: HopId,
        permit_internet: bool,
        now_ms: u64,
    ) -> Option<u128> {
        if !self.permit_exit {
            return None;
        }
        // one session per client key; a fresh allocation displaces the old
        if let Some(old) = self.active_exits.remove(&pubkey) {
            self.paths.remove(&old.path_id);
        }

        let base = self.tun.range.addr & self.tun.range.netmask;
        let capacity = !self.tun.range.netmask;
        self.next_ip_offset += 1;
        if self.next_ip_offset >= capacity {
            warn!(endpoint = self.tun.name(), "exit address pool exhausted");
            return None;
        }
        let ip = base + self.next_ip_offset;

        let session = ExitSession {
            pubkey,
            path_id: path,
            ip,
            permit_internet,
            last_active_ms: now_ms,
        };
        info!(
            endpoint = self.tun.name(),
            path = %path.short(),
            "allocated exit session"
        );
        self.paths.insert(path, pubkey);
        self.active_exits.insert(pubkey, session);
        Some(ip)
    }

    pub fn find_endpoint_by_path(&self, path: &HopId) -> Option<&ExitSession> {
        self.paths
            .get(path)
            .and_then(|pubkey| self.active_exits.get(pubkey))
    }

    /// Re-point an existing session at a new path (the client rebuilt).
    pub fn update_endpoint_path(&mut self, pubkey: &[u8; 32], next: HopId) -> bool {
        match self.active_exits.get_mut(pubkey) {
            Some(session) => {
                self.paths.remove(&session.path_id);
                session.path_id = next;
                self.paths.insert(next, *pubkey);
                true
            }
            None => false,
        }
    }

    /// Drop the session identified by path, mapped address, and key.
    pub fn del_endpoint_info(&mut self, path: &HopId, ip: u128, pubkey: &[u8; 32]) {
        self.paths.remove(path);
        if let Some(session) = self.active_exits.get(pubkey) {
            if session.ip == ip {
                self.active_exits.remove(pubkey);
            }
        }
    }

    /// Gate one outbound packet: exiting must be enabled, the policy must
    /// allow it, and Internet-bound traffic needs the session's permit.
    pub fn allow_traffic(&self, session: &ExitSession, pkt: &IpPacket) -> bool {
        if !self.permit_exit {
            return false;
        }
        if !self.policy.allow(pkt) {
            return false;
        }
        if !session.permit_internet && !self.tun.range.contains(pkt.dst()) {
            return false;
        }
        true
    }

    /// Attribute and gate a packet arriving from a path; returns the
    /// packet for forwarding when it passes.
    pub fn handle_outbound(&mut self, path: &HopId, pkt: IpPacket, now_ms: u64) -> Option<IpPacket> {
        let pubkey = *self.paths.get(path)?;
        let session = self.active_exits.get_mut(&pubkey)?;
        session.last_active_ms = now_ms;
        let session = session.clone();
        if self.allow_traffic(&session, &pkt) {
            Some(pkt)
        } else {
            debug!(path = %path.short(), "exit traffic denied by policy");
            None
        }
    }
}

impl Endpoint for ExitEndpoint {
    fn name(&self) -> &str {
        self.tun.name()
    }

    fn tick(&mut self, now_ms: u64) {
        self.tun.tick(now_ms);
        let idle: Vec<[u8; 32]> = self
            .active_exits
            .values()
            .filter(|s| now_ms.saturating_sub(s.last_active_ms) > EXIT_SESSION_IDLE_MS)
            .map(|s| s.pubkey)
            .collect();
        for pubkey in idle {
            if let Some(session) = self.active_exits.remove(&pubkey) {
                debug!(path = %session.path_id.short(), "reaping idle exit session");
                self.paths.remove(&session.path_id);
            }
        }
    }

    fn set_option(&mut self, key: &str, value: &str) -> bool {
        match key {
            "exit" => match value.parse::<bool>() {
                Ok(flag) => {
                    self.permit_exit = flag;
                    true
                }
                Err(_) => false,
            },
            "policy" => match TrafficPolicy::decode(value.as_bytes()) {
                Ok(policy) => {
                    self.policy = policy;
                    true
                }
                Err(err) => {
                    warn!(error = %err, "bad policy option");
                    false
                }
            },
            _ => self.tun.set_option(key, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{build_ipv4, build_udp, proto, PacketRouter};
    use crate::policy::ProtocolInfo;

    fn test_exit() -> ExitEndpoint {
        let router = PacketRouter::new(Box::new(|_pkt| {}));
        let tun = TunEndpoint::new("exit0", "10.0.0.0/16".parse().unwrap(), router);
        ExitEndpoint::new(tun, TrafficPolicy::default())
    }

    #[test]
    fn allocate_find_update_delete() {
        let mut exit = test_exit();
        let pubkey = [7u8; 32];
        let path = HopId::random();

        let ip = exit.allocate_exit(pubkey, path, true, 0).unwrap();
        assert!(exit.tun.range().contains(ip));
        assert_eq!(exit.find_endpoint_by_path(&path).unwrap().pubkey, pubkey);

        // rebuilt client moves to a new path
        let next = HopId::random();
        assert!(exit.update_endpoint_path(&pubkey, next));
        assert!(exit.find_endpoint_by_path(&path).is_none());
        assert_eq!(exit.find_endpoint_by_path(&next).unwrap().ip, ip);

        exit.del_endpoint_info(&next, ip, &pubkey);
        assert_eq!(exit.num_sessions(), 0);
        assert!(exit.find_endpoint_by_path(&next).is_none());
    }

    #[test]
    fn allocations_get_distinct_addresses() {
        let mut exit = test_exit();
        let a = exit.allocate_exit([1u8; 32], HopId::random(), true, 0).unwrap();
        let b = exit.allocate_exit([2u8; 32], HopId::random(), true, 0).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn reallocation_displaces_previous_session() {
        let mut exit = test_exit();
        let pubkey = [3u8; 32];
        let old_path = HopId::random();
        let new_path = HopId::random();
        exit.allocate_exit(pubkey, old_path, false, 0).unwrap();
        exit.allocate_exit(pubkey, new_path, false, 0).unwrap();
        assert_eq!(exit.num_sessions(), 1);
        assert!(exit.find_endpoint_by_path(&old_path).is_none());
        assert!(exit.find_endpoint_by_path(&new_path).is_some());
    }

    #[test]
    fn policy_gates_exit_traffic() {
        let mut exit = test_exit();
        exit.policy = TrafficPolicy::new(
            ["10.0.0.0/8".parse().unwrap()].into_iter().collect(),
            [ProtocolInfo::new(proto::UDP, Some(53))].into_iter().collect(),
        );
        let pubkey = [9u8; 32];
        let path = HopId::random();
        exit.allocate_exit(pubkey, path, true, 0).unwrap();

        let allowed = build_ipv4([10, 9, 9, 9], [10, 1, 2, 3], proto::UDP, &build_udp(1, 53, b""));
        let denied = build_ipv4([10, 9, 9, 9], [10, 1, 2, 3], proto::TCP, &build_udp(1, 80, b""));
        assert!(exit.handle_outbound(&path, allowed, 10).is_some());
        assert!(exit.handle_outbound(&path, denied, 10).is_none());

        // unknown path never passes
        let stray = build_ipv4([1; 4], [10, 1, 2, 3], proto::UDP, &build_udp(1, 53, b""));
        assert!(exit.handle_outbound(&HopId::random(), stray, 10).is_none());
    }

    #[test]
    fn internet_permit_restricts_range() {
        let mut exit = test_exit();
        let pubkey = [4u8; 32];
        let path = HopId::random();
        exit.allocate_exit(pubkey, path, false, 0).unwrap();

        // in-range traffic passes without the internet permit
        let local = build_ipv4([10, 0, 1, 1], [10, 0, 2, 2], proto::UDP, &build_udp(1, 53, b""));
        assert!(exit.handle_outbound(&path, local, 5).is_some());

        // off-range traffic needs the permit
        let internet = build_ipv4([10, 0, 1, 1], [8, 8, 8, 8], proto::UDP, &build_udp(1, 53, b""));
        assert!(exit.handle_outbound(&path, internet, 5).is_none());
    }

    #[test]
    fn exit_disabled_refuses_everything() {
        let mut exit = test_exit();
        assert!(exit.set_option("exit", "false"));
        assert!(exit
            .allocate_exit([5u8; 32], HopId::random(), true, 0)
            .is_none());
    }

    #[test]
    fn idle_sessions_are_reaped() {
        let mut exit = test_exit();
        let path = HopId::random();
        exit.allocate_exit([6u8; 32], path, true, 0).unwrap();
        exit.tick(EXIT_SESSION_IDLE_MS);
        assert_eq!(exit.num_sessions(), 1);
        exit.tick(EXIT_SESSION_IDLE_MS + 1);
        assert_eq!(exit.num_sessions(), 0);
    }

    #[test]
    fn endpoint_options() {
        let mut exit = test_exit();
        assert!(exit.set_option("ifaddr", "192.168.0.0/24"));
        assert_eq!(exit.tun.range().to_string(), "192.168.0.0/24");
        assert!(!exit.set_option("ifaddr", "junk"));
        assert!(!exit.set_option("unknown", "x"));

        // a protocols-only policy bencodes to plain ASCII, so it can ride
        // the string option channel
        let policy = TrafficPolicy::new(
            Default::default(),
            [ProtocolInfo::new(proto::UDP, Some(53))].into_iter().collect(),
        );
        let as_str = String::from_utf8(policy.encode()).unwrap();
        assert!(exit.set_option("policy", &as_str));
        assert_eq!(exit.policy, policy);
    }
}
