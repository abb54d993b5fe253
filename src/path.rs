//! # Client Paths
//!
//! A [`Path`] is an ordered sequence of hops a client has onion-routed
//! through the relay fleet, with per-hop symmetric keys agreed during the
//! build round trip. The path owns the client half of everything the
//! protocol needs: hop-ID splicing, the build frame, onion wrap/strip for
//! control and data, the pending-callback table for control responses, and
//! the liveness state machine.
//!
//! ## Lifecycle
//!
//! A path is born `Building`, becomes `Established` on a verified build
//! confirmation, may enter `Timeout` after silence (revivable for 45 s by
//! any valid inbound frame), and ends `Expired` or `Failed`. Readiness
//! additionally requires a measured latency, so the periodic latency probe
//! is part of the protocol, not optional telemetry.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::bencode::DictBuilder;
use crate::contact::RouterContact;
use crate::crypto::{self, NonceXor, SharedSecret, SymmNonce};
use crate::identity::{Keypair, RouterId};
use crate::messages::{
    encode_build_slots, onion_chain, BuildRecord, Envelope, HopId, HopMaterial, InnerFrame,
    LinkFrame, WireError,
};
use crate::transit::{status, DEFAULT_LIFETIME_MS};

/// Default number of hops in a freshly built path.
pub const DEFAULT_HOPS: usize = 4;

/// Hard cap on hops, bounded by the build frame's slot count.
pub const MAX_HOPS: usize = crate::messages::SLOT_COUNT;

/// How long a build may remain unanswered.
pub const BUILD_TIMEOUT_MS: u64 = 10_000;

/// Interval between latency probes on an established path.
pub const LATENCY_INTERVAL_MS: u64 = 20_000;

/// Silence after which an established path is considered dead.
pub const ALIVE_TIMEOUT_MS: u64 = 60_000;

/// How long a timed-out path may be revived by fresh traffic.
pub const REANIMATION_TIMEOUT_MS: u64 = 45_000;

/// Deadline for control-response callbacks.
pub const CONTROL_TIMEOUT_MS: u64 = 10_000;

/// Path lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathStatus {
    Building,
    Established,
    Timeout,
    Expired,
    Failed,
}

/// `(router, path_id)` pair advertised as a rendezvous point at the pivot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Introduction {
    pub router: RouterId,
    pub path_id: HopId,
}

/// Outcome of a control request, delivered to its callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlResponse {
    /// The decrypted response payload.
    Payload(Vec<u8>),
    /// No response before the deadline.
    Timeout,
    /// The path died, was rebuilt, or the response failed to decrypt.
    Error,
}

/// Callback invoked exactly once with the outcome of a control request.
pub type ResponseCallback = Box<dyn FnOnce(ControlResponse) + Send>;

struct Pending {
    callback: ResponseCallback,
    deadline_ms: u64,
}

/// One hop of a client path: the relay's contact, the spliced IDs, and the
/// key material agreed with that relay.
pub struct Hop {
    pub rc: RouterContact,
    pub tx_id: HopId,
    pub rx_id: HopId,
    pub upstream: RouterId,
    pub lifetime_ms: u64,
    eph_pub: [u8; 32],
    record_nonce: SymmNonce,
    pub shared: SharedSecret,
    pub nonce_xor: NonceXor,
}

/// What [`Path::handle_inbound`] did with a frame.
#[derive(Debug, PartialEq, Eq)]
pub enum PathInbound {
    /// Tunneled data for the packet layer.
    Data(Vec<u8>),
    /// Control response or probe, consumed internally.
    Handled,
    /// Undecodable after full layer stripping.
    Invalid,
}

/// Result of processing a build status frame.
#[derive(Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    Established,
    Failed(u64),
}

// ============================================================================
// Path
// ============================================================================

/// An onion circuit under construction or in use by this client.
pub struct Path {
    hops: Vec<Hop>,
    intro: Introduction,
    status: PathStatus,
    short_name: String,

    pub build_started_ms: u64,
    pub expires_at_ms: u64,
    pub last_recv_ms: u64,
    last_latency_test_ms: u64,
    pub latency_ms: u64,

    /// Outstanding latency probe: request nonce and send time.
    probe: Option<([u8; 16], u64)>,
    probe_misses: u8,
    /// When the path last entered `Timeout`; anchors the revival window.
    timeout_at_ms: u64,
    /// Whether this path ever completed its build round trip.
    ever_established: bool,

    pending: HashMap<[u8; 16], Pending>,
}

impl Path {
    /// Assemble a path over `rcs`, allocating non-zero path IDs and
    /// splicing adjacent hops: `hops[i].tx_id == hops[i+1].rx_id`.
    /// Per-hop ephemeral keys and shared secrets are derived here, so the
    /// path is ready to emit its build frame.
    pub fn new(rcs: Vec<RouterContact>, now_ms: u64) -> Result<Self, WireError> {
        if rcs.is_empty() || rcs.len() > MAX_HOPS {
            return Err(WireError::BadHopCount);
        }

        let count = rcs.len();
        let mut hops: Vec<Hop> = Vec::with_capacity(count);
        for rc in rcs {
            let eph = x25519_dalek::StaticSecret::from(crypto::randbytes::<32>());
            let eph_pub = x25519_dalek::PublicKey::from(&eph).to_bytes();
            let shared = crypto::dh(&eph, &rc.encryption);
            let nonce_xor = crypto::hash_shared(&shared);
            hops.push(Hop {
                rc,
                tx_id: HopId::random(),
                rx_id: HopId::random(),
                upstream: RouterId::ZERO, // spliced below
                lifetime_ms: DEFAULT_LIFETIME_MS,
                eph_pub,
                record_nonce: SymmNonce::random(),
                shared,
                nonce_xor,
            });
        }
        for i in 0..count - 1 {
            hops[i].tx_id = hops[i + 1].rx_id;
            hops[i].upstream = hops[i + 1].rc.router_id;
        }

        let intro = Introduction {
            router: hops[count - 1].rc.router_id,
            path_id: hops[count - 1].tx_id,
        };
        let short_name = format!(
            "TX={} RX={}",
            hops[0].tx_id.short(),
            hops[0].rx_id.short()
        );

        Ok(Self {
            hops,
            intro,
            status: PathStatus::Building,
            short_name,
            build_started_ms: now_ms,
            expires_at_ms: now_ms + DEFAULT_LIFETIME_MS,
            last_recv_ms: now_ms,
            last_latency_test_ms: 0,
            latency_ms: 0,
            probe: None,
            probe_misses: 0,
            timeout_at_ms: 0,
            ever_established: false,
            pending: HashMap::new(),
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    pub fn num_hops(&self) -> usize {
        self.hops.len()
    }

    pub fn intro(&self) -> &Introduction {
        &self.intro
    }

    pub fn status(&self) -> PathStatus {
        self.status
    }

    pub fn is_established(&self) -> bool {
        self.status == PathStatus::Established
    }

    /// Whether the build round trip ever completed, regardless of the
    /// current state.
    pub fn ever_established(&self) -> bool {
        self.ever_established
    }

    /// First relay of the path, where all our frames enter the overlay.
    pub fn upstream_router(&self) -> RouterId {
        self.hops[0].rc.router_id
    }

    /// Pivot (terminal) relay of the path.
    pub fn pivot_router(&self) -> RouterId {
        self.intro.router
    }

    /// The hop ID stamped on envelopes we emit, and on envelopes addressed
    /// to us: the downstream-facing ID of the first hop.
    pub fn upstream_id(&self) -> HopId {
        self.hops[0].rx_id
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    /// `a -> b -> c` rendering of the hop routers for logs.
    pub fn hops_string(&self) -> String {
        self.hops
            .iter()
            .map(|hop| hop.rc.router_id.short())
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Ready to carry traffic: established, not expired, and with a
    /// measured latency.
    pub fn is_ready(&self, now_ms: u64) -> bool {
        !self.is_expired(now_ms) && self.is_established() && self.latency_ms > 0
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.status {
            PathStatus::Failed | PathStatus::Expired => true,
            PathStatus::Building => now_ms >= self.build_started_ms + BUILD_TIMEOUT_MS,
            PathStatus::Timeout => {
                now_ms >= self.timeout_at_ms.max(self.last_recv_ms) + REANIMATION_TIMEOUT_MS
            }
            PathStatus::Established => now_ms >= self.expires_at_ms,
        }
    }

    pub fn expires_soon(&self, now_ms: u64, within_ms: u64) -> bool {
        self.status == PathStatus::Established
            && now_ms + within_ms >= self.expires_at_ms
    }

    /// The relay contacts, in order, for rebuilding over the same route.
    pub fn hop_contacts(&self) -> Vec<RouterContact> {
        self.hops.iter().map(|hop| hop.rc.clone()).collect()
    }

    // ------------------------------------------------------------------
    // Build
    // ------------------------------------------------------------------

    /// The build frame for this path, addressed to the first hop.
    pub fn build_frame(&self) -> Result<(RouterId, LinkFrame), WireError> {
        let count = self.hops.len();
        let materials: Vec<HopMaterial> = self
            .hops
            .iter()
            .enumerate()
            .map(|(i, hop)| HopMaterial {
                eph_pub: hop.eph_pub,
                record_nonce: hop.record_nonce,
                shared: hop.shared,
                xor: hop.nonce_xor,
                record: BuildRecord {
                    lifetime_ms: hop.lifetime_ms,
                    next: if i + 1 < count {
                        hop.upstream
                    } else {
                        RouterId::ZERO
                    },
                    rx_id: hop.rx_id,
                    tx_id: hop.tx_id,
                },
            })
            .collect();
        let slots = encode_build_slots(&materials)?;
        Ok((
            self.upstream_router(),
            LinkFrame::Build {
                path_id: self.hops[0].rx_id,
                slots,
            },
        ))
    }

    /// Process the build status that came back down the path.
    ///
    /// Non-SUCCESS clear bits fail the build outright (the failing hop has
    /// no usable key, so there is nothing to decrypt). For SUCCESS we strip
    /// our layers and verify the embedded record before trusting it.
    pub fn handle_build_status(
        &mut self,
        bits: u64,
        nonce: SymmNonce,
        mut payload: Vec<u8>,
        now_ms: u64,
    ) -> BuildOutcome {
        if self.status != PathStatus::Building {
            debug!(path = %self.short_name, "stray build status ignored");
            return BuildOutcome::Failed(bits);
        }

        if bits & status::SUCCESS == 0 {
            warn!(
                path = %self.short_name,
                status = %status::describe(bits),
                "path build failed"
            );
            self.status = PathStatus::Failed;
            return BuildOutcome::Failed(bits);
        }

        // Strip one layer per hop, walking the nonce chain exactly as the
        // relays mutated it, and accept the first well-formed record.
        let mut chain = nonce;
        let mut verified = false;
        for hop in &self.hops {
            crypto::xor_keystream(&mut payload, &hop.shared, &chain, 0);
            chain = chain.xored(&hop.nonce_xor);
            if let Ok(InnerFrame::StatusRecord { status: s, path_id }) =
                InnerFrame::decode(&payload)
            {
                verified = s & status::SUCCESS != 0 && path_id == self.intro.path_id;
                break;
            }
        }
        if !verified {
            warn!(path = %self.short_name, "build confirmation failed verification");
            self.status = PathStatus::Failed;
            return BuildOutcome::Failed(status::FAIL_DECRYPT_ERROR);
        }

        self.status = PathStatus::Established;
        self.ever_established = true;
        self.last_recv_ms = now_ms;
        self.expires_at_ms = now_ms + DEFAULT_LIFETIME_MS;
        debug!(path = %self.short_name, hops = %self.hops_string(), "path established");
        BuildOutcome::Established
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Onion-wrap a plaintext payload for the full path. The emitted nonce
    /// is the first layer's, so each relay's observed nonce matches the
    /// layer the client encrypted for it.
    fn make_outer_payload(&self, mut payload: Vec<u8>) -> Envelope {
        let start = SymmNonce::random();
        onion_chain(
            &mut payload,
            start,
            self.hops.iter().map(|h| (&h.shared, &h.nonce_xor)),
        );
        Envelope::new(start, self.upstream_id(), payload)
    }

    /// Wrap an opaque data payload. Returns the addressed frame, or `None`
    /// when the path cannot carry traffic.
    pub fn send_data(&self, body: Vec<u8>, now_ms: u64) -> Option<(RouterId, LinkFrame)> {
        if !self.is_established() || self.is_expired(now_ms) {
            return None;
        }
        let envelope = self.make_outer_payload(InnerFrame::Data { payload: body }.encode());
        Some((
            self.upstream_router(),
            LinkFrame::Traffic { envelope },
        ))
    }

    /// Send a control request and register `callback` for its response,
    /// matched by an embedded request nonce with a deadline.
    pub fn send_control(
        &mut self,
        method: &str,
        body: Vec<u8>,
        callback: ResponseCallback,
        now_ms: u64,
    ) -> Option<(RouterId, LinkFrame)> {
        if self.is_expired(now_ms) {
            callback(ControlResponse::Error);
            return None;
        }
        let request: [u8; 16] = crypto::randbytes();
        let inner = InnerFrame::Control {
            method: method.to_string(),
            body,
            request,
        };
        self.pending.insert(
            request,
            Pending {
                callback,
                deadline_ms: now_ms + CONTROL_TIMEOUT_MS,
            },
        );
        let envelope = self.make_outer_payload(inner.encode());
        Some((
            self.upstream_router(),
            LinkFrame::Traffic { envelope },
        ))
    }

    /// `obtain_exit`: ask the pivot to become our exit. The request is
    /// signed with our identity key so the exit can hold us accountable.
    pub fn obtain_exit(
        &mut self,
        keypair: &Keypair,
        permit_internet: bool,
        exit_tx: &str,
        callback: ResponseCallback,
        now_ms: u64,
    ) -> Option<(RouterId, LinkFrame)> {
        let body = sign_exit_body(keypair, permit_internet as i64, exit_tx);
        self.send_control("obtain_exit", body, callback, now_ms)
    }

    /// `close_exit`: release an exit session previously obtained.
    pub fn close_exit(
        &mut self,
        keypair: &Keypair,
        exit_tx: &str,
        callback: ResponseCallback,
        now_ms: u64,
    ) -> Option<(RouterId, LinkFrame)> {
        let body = sign_exit_body(keypair, -1, exit_tx);
        self.send_control("close_exit", body, callback, now_ms)
    }

    /// `find_intro`: look up an introduction set near a DHT key.
    pub fn find_intro(
        &mut self,
        location: &RouterId,
        relayed: bool,
        order: u64,
        callback: ResponseCallback,
        now_ms: u64,
    ) -> Option<(RouterId, LinkFrame)> {
        let body = DictBuilder::new()
            .insert_bytes("K", location.as_bytes())
            .insert_int("O", order as i64)
            .insert_int("R", relayed as i64)
            .build()
            .encode();
        self.send_control("find_intro", body, callback, now_ms)
    }

    /// `find_name`: resolve a name to an address record.
    pub fn find_name(
        &mut self,
        name: &str,
        callback: ResponseCallback,
        now_ms: u64,
    ) -> Option<(RouterId, LinkFrame)> {
        let body = DictBuilder::new()
            .insert_bytes("N", name.as_bytes())
            .build()
            .encode();
        self.send_control("find_name", body, callback, now_ms)
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Strip all layers from an inbound envelope and dispatch the inner
    /// frame. An undecodable payload fires the oldest pending callback with
    /// `Error` but never tears the path.
    pub fn handle_inbound(&mut self, envelope: Envelope, now_ms: u64) -> PathInbound {
        let mut payload = envelope.payload;
        onion_chain(
            &mut payload,
            envelope.nonce,
            self.hops.iter().map(|h| (&h.shared, &h.nonce_xor)),
        );

        match InnerFrame::decode(&payload) {
            Ok(InnerFrame::Response { body, request }) => {
                self.note_alive(now_ms);
                if let Some((probe_id, sent_ms)) = self.probe {
                    if probe_id == request {
                        self.latency_ms = now_ms.saturating_sub(sent_ms).max(1);
                        self.probe = None;
                        self.probe_misses = 0;
                        trace!(path = %self.short_name, latency_ms = self.latency_ms, "latency probe answered");
                        return PathInbound::Handled;
                    }
                }
                match self.pending.remove(&request) {
                    Some(pending) => (pending.callback)(ControlResponse::Payload(body)),
                    None => {
                        debug!(path = %self.short_name, "response with unknown request nonce")
                    }
                }
                PathInbound::Handled
            }
            Ok(InnerFrame::Data { payload }) => {
                self.note_alive(now_ms);
                PathInbound::Data(payload)
            }
            Ok(_) => PathInbound::Invalid,
            Err(_) => {
                warn!(path = %self.short_name, "undecodable path response");
                if let Some(request) = self
                    .pending
                    .iter()
                    .min_by_key(|(_, p)| p.deadline_ms)
                    .map(|(k, _)| *k)
                {
                    if let Some(pending) = self.pending.remove(&request) {
                        (pending.callback)(ControlResponse::Error);
                    }
                }
                PathInbound::Invalid
            }
        }
    }

    fn note_alive(&mut self, now_ms: u64) {
        self.last_recv_ms = now_ms;
        if self.status == PathStatus::Timeout {
            debug!(path = %self.short_name, "timed-out path revived");
            self.status = PathStatus::Established;
        }
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    /// Drive timers: expire pending callbacks, schedule latency probes,
    /// detect silence. Returns frames to transmit.
    pub fn tick(&mut self, now_ms: u64) -> Vec<(RouterId, LinkFrame)> {
        let mut out = Vec::new();

        // Control deadlines fire regardless of path state.
        let expired: Vec<[u8; 16]> = self
            .pending
            .iter()
            .filter(|(_, p)| now_ms >= p.deadline_ms)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            if let Some(pending) = self.pending.remove(&key) {
                (pending.callback)(ControlResponse::Timeout);
            }
        }

        match self.status {
            PathStatus::Building => {
                if now_ms >= self.build_started_ms + BUILD_TIMEOUT_MS {
                    warn!(path = %self.short_name, "path build timed out");
                    self.status = PathStatus::Timeout;
                    self.timeout_at_ms = now_ms;
                }
            }
            PathStatus::Established => {
                if now_ms >= self.expires_at_ms {
                    self.status = PathStatus::Expired;
                } else if now_ms.saturating_sub(self.last_recv_ms) >= ALIVE_TIMEOUT_MS {
                    warn!(path = %self.short_name, "path looks dead");
                    self.status = PathStatus::Timeout;
                    self.timeout_at_ms = now_ms;
                } else if now_ms.saturating_sub(self.last_latency_test_ms) >= LATENCY_INTERVAL_MS {
                    if self.probe.is_some() {
                        self.probe_misses += 1;
                        if self.probe_misses >= 2 {
                            warn!(path = %self.short_name, "latency probes unanswered");
                            self.status = PathStatus::Timeout;
                            self.timeout_at_ms = now_ms;
                            return out;
                        }
                    }
                    let request: [u8; 16] = crypto::randbytes();
                    self.probe = Some((request, now_ms));
                    self.last_latency_test_ms = now_ms;
                    let inner = InnerFrame::Control {
                        method: "path_latency".to_string(),
                        body: now_ms.to_be_bytes().to_vec(),
                        request,
                    };
                    let envelope = self.make_outer_payload(inner.encode());
                    out.push((
                        self.upstream_router(),
                        LinkFrame::Traffic { envelope },
                    ));
                }
            }
            PathStatus::Timeout => {
                if now_ms >= self.timeout_at_ms.max(self.last_recv_ms) + REANIMATION_TIMEOUT_MS {
                    self.status = PathStatus::Expired;
                }
            }
            PathStatus::Expired | PathStatus::Failed => {}
        }
        out
    }

    /// Fire every pending callback with `reason` and clear the table.
    /// Called on teardown, rebuild, and shutdown.
    pub fn drain_pending(&mut self, reason: ControlResponse) {
        for (_, pending) in self.pending.drain() {
            (pending.callback)(reason.clone());
        }
        self.probe = None;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Force the lifecycle state; the handler uses this when it fails or
    /// retires a path from outside.
    pub fn set_status(&mut self, status: PathStatus) {
        self.status = status;
    }
}

impl Drop for Path {
    fn drop(&mut self) {
        // Callbacks must never dangle: anything still pending errors out.
        self.drain_pending(ControlResponse::Error);
    }
}

impl std::fmt::Debug for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Path")
            .field("name", &self.short_name)
            .field("status", &self.status)
            .field("hops", &self.hops.len())
            .field("pivot", &self.intro.router.short())
            .finish()
    }
}

fn sign_exit_body(keypair: &Keypair, flag: i64, exit_tx: &str) -> Vec<u8> {
    let unsigned = DictBuilder::new()
        .insert_int("E", flag)
        .insert_bytes("I", keypair.router_id().as_bytes())
        .insert_bytes("T", exit_tx.as_bytes())
        .insert_bytes("Z", &[0u8; crypto::SIG_SIZE])
        .build()
        .encode();
    let signature = keypair.sign(&unsigned);
    DictBuilder::new()
        .insert_int("E", flag)
        .insert_bytes("I", keypair.router_id().as_bytes())
        .insert_bytes("T", exit_tx.as_bytes())
        .insert_bytes("Z", &signature)
        .build()
        .encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::AddressInfo;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn test_rc(index: u8) -> (Keypair, RouterContact) {
        let keypair = Keypair::generate();
        let rc = RouterContact::new_signed(
            &keypair,
            vec![AddressInfo::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, index)),
                1090,
            )],
            vec![],
            None,
            1_000,
        );
        (keypair, rc)
    }

    fn test_path(hops: usize, now_ms: u64) -> Path {
        let rcs = (0..hops).map(|i| test_rc(i as u8 + 1).1).collect();
        Path::new(rcs, now_ms).unwrap()
    }

    #[test]
    fn adjacent_hops_are_spliced() {
        // hops[i].tx_id == hops[i+1].rx_id
        for len in 1..=MAX_HOPS {
            let path = test_path(len, 0);
            for i in 0..len - 1 {
                assert_eq!(path.hops()[i].tx_id, path.hops()[i + 1].rx_id);
            }
            for hop in path.hops() {
                assert!(!hop.tx_id.is_zero());
                assert!(!hop.rx_id.is_zero());
            }
        }
    }

    #[test]
    fn intro_names_the_pivot() {
        let path = test_path(3, 0);
        let last = &path.hops()[2];
        assert_eq!(path.intro().router, last.rc.router_id);
        assert_eq!(path.intro().path_id, last.tx_id);
        assert_eq!(path.pivot_router(), last.rc.router_id);
    }

    #[test]
    fn path_rejects_bad_hop_counts() {
        assert!(Path::new(vec![], 0).is_err());
        let rcs = (0..MAX_HOPS + 1).map(|i| test_rc(i as u8 + 1).1).collect();
        assert!(Path::new(rcs, 0).is_err());
    }

    #[test]
    fn outer_payload_peels_at_each_hop() {
        // Simulate the relays: decrypt with observed nonce, mutate, pass on.
        let path = test_path(3, 0);
        let plaintext = InnerFrame::Data {
            payload: b"hello across the overlay".to_vec(),
        }
        .encode();
        let envelope = path.make_outer_payload(plaintext.clone());
        assert_eq!(envelope.hop_id, path.upstream_id());

        let mut buf = envelope.payload;
        let mut nonce = envelope.nonce;
        for hop in path.hops() {
            nonce = crypto::onion(&mut buf, &hop.shared, &nonce, &hop.nonce_xor);
        }
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn established_path_sends_data() {
        let mut path = test_path(2, 0);
        assert!(path.send_data(b"too early".to_vec(), 0).is_none());

        path.set_status(PathStatus::Established);
        path.latency_ms = 5;
        let (to, frame) = path.send_data(b"payload".to_vec(), 0).unwrap();
        assert_eq!(to, path.upstream_router());
        assert!(matches!(frame, LinkFrame::Traffic { .. }));
    }

    fn reply_through(path: &Path, inner: InnerFrame) -> Envelope {
        // Pivot originates; relays mutate-then-encrypt on the way down.
        let hops = path.hops();
        let last = hops.len() - 1;
        let mut payload = inner.encode();
        let mut nonce = SymmNonce::random();
        crypto::xor_keystream(&mut payload, &hops[last].shared, &nonce, 0);
        for hop in hops[..last].iter().rev() {
            nonce = nonce.xored(&hop.nonce_xor);
            crypto::xor_keystream(&mut payload, &hop.shared, &nonce, 0);
        }
        Envelope::new(nonce, path.upstream_id(), payload)
    }

    #[test]
    fn control_response_reaches_callback() {
        let mut path = test_path(3, 0);
        path.set_status(PathStatus::Established);

        let got: Arc<Mutex<Option<ControlResponse>>> = Arc::new(Mutex::new(None));
        let got_cb = got.clone();
        let (_, frame) = path
            .send_control(
                "find_name",
                b"body".to_vec(),
                Box::new(move |resp| {
                    *got_cb.lock().unwrap() = Some(resp);
                }),
                100,
            )
            .unwrap();
        assert!(matches!(frame, LinkFrame::Traffic { .. }));
        assert_eq!(path.pending_count(), 1);

        // extract the request nonce by stripping our own envelope
        let request = match frame {
            LinkFrame::Traffic { envelope } => {
                let mut payload = envelope.payload;
                onion_chain(
                    &mut payload,
                    envelope.nonce,
                    path.hops().iter().map(|h| (&h.shared, &h.nonce_xor)),
                );
                match InnerFrame::decode(&payload).unwrap() {
                    InnerFrame::Control { request, .. } => request,
                    other => panic!("unexpected inner frame {:?}", other),
                }
            }
            _ => unreachable!(),
        };

        let reply = reply_through(
            &path,
            InnerFrame::Response {
                body: b"answer".to_vec(),
                request,
            },
        );
        assert_eq!(path.handle_inbound(reply, 150), PathInbound::Handled);
        assert_eq!(path.pending_count(), 0);
        assert_eq!(
            got.lock().unwrap().take(),
            Some(ControlResponse::Payload(b"answer".to_vec()))
        );
    }

    #[test]
    fn inbound_data_is_surfaced() {
        let mut path = test_path(2, 0);
        path.set_status(PathStatus::Established);
        let reply = reply_through(
            &path,
            InnerFrame::Data {
                payload: b"returned packet".to_vec(),
            },
        );
        assert_eq!(
            path.handle_inbound(reply, 10),
            PathInbound::Data(b"returned packet".to_vec())
        );
        assert_eq!(path.last_recv_ms, 10);
    }

    #[test]
    fn garbled_response_errors_oldest_callback_without_teardown() {
        let mut path = test_path(2, 0);
        path.set_status(PathStatus::Established);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = fired.clone();
        path.send_control(
            "find_intro",
            vec![],
            Box::new(move |resp| {
                assert_eq!(resp, ControlResponse::Error);
                fired_cb.fetch_add(1, Ordering::SeqCst);
            }),
            0,
        )
        .unwrap();

        let garbage = Envelope::new(SymmNonce::random(), path.upstream_id(), vec![0xFF; 300]);
        assert_eq!(path.handle_inbound(garbage, 5), PathInbound::Invalid);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // the path is still alive
        assert_eq!(path.status(), PathStatus::Established);
    }

    #[test]
    fn pending_callbacks_time_out() {
        let mut path = test_path(2, 0);
        path.set_status(PathStatus::Established);
        path.last_recv_ms = 0;

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = fired.clone();
        path.send_control(
            "find_name",
            vec![],
            Box::new(move |resp| {
                assert_eq!(resp, ControlResponse::Timeout);
                fired_cb.fetch_add(1, Ordering::SeqCst);
            }),
            0,
        )
        .unwrap();

        path.tick(CONTROL_TIMEOUT_MS - 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        path.tick(CONTROL_TIMEOUT_MS);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(path.pending_count(), 0);
    }

    #[test]
    fn build_timeout_marks_path() {
        let mut path = test_path(2, 1_000);
        path.tick(1_000 + BUILD_TIMEOUT_MS - 1);
        assert_eq!(path.status(), PathStatus::Building);
        path.tick(1_000 + BUILD_TIMEOUT_MS);
        assert_eq!(path.status(), PathStatus::Timeout);
    }

    #[test]
    fn silence_marks_timeout_then_expiry() {
        let mut path = test_path(2, 0);
        path.set_status(PathStatus::Established);
        path.last_recv_ms = 0;
        path.latency_ms = 10;
        path.last_latency_test_ms = 0;

        path.tick(ALIVE_TIMEOUT_MS);
        assert_eq!(path.status(), PathStatus::Timeout);
        assert!(!path.is_expired(ALIVE_TIMEOUT_MS + 1));

        // revivable window passes with no traffic
        assert!(path.is_expired(ALIVE_TIMEOUT_MS + REANIMATION_TIMEOUT_MS));
    }

    #[test]
    fn timed_out_path_revives_on_traffic() {
        let mut path = test_path(2, 0);
        path.set_status(PathStatus::Timeout);
        path.last_recv_ms = 0;

        let reply = reply_through(
            &path,
            InnerFrame::Data {
                payload: b"alive".to_vec(),
            },
        );
        path.handle_inbound(reply, 10_000);
        assert_eq!(path.status(), PathStatus::Established);
    }

    #[test]
    fn latency_probe_cycle() {
        let mut path = test_path(2, 0);
        path.set_status(PathStatus::Established);
        path.last_recv_ms = 0;

        // first probe goes out
        let frames = path.tick(LATENCY_INTERVAL_MS);
        assert_eq!(frames.len(), 1);
        assert!(!path.is_ready(LATENCY_INTERVAL_MS)); // no latency yet

        // the probe comes back through the reply helper
        let (request, sent_ms) = path.probe.unwrap();
        let reply = reply_through(
            &path,
            InnerFrame::Response {
                body: sent_ms.to_be_bytes().to_vec(),
                request,
            },
        );
        path.handle_inbound(reply, LATENCY_INTERVAL_MS + 40);
        assert_eq!(path.latency_ms, 40);
        assert!(path.is_ready(LATENCY_INTERVAL_MS + 41));
    }

    #[test]
    fn two_missed_probes_time_out() {
        let mut path = test_path(2, 0);
        path.set_status(PathStatus::Established);
        path.latency_ms = 5;

        let mut now = LATENCY_INTERVAL_MS;
        path.last_recv_ms = now;
        assert_eq!(path.tick(now).len(), 1); // probe 1, unanswered

        now += LATENCY_INTERVAL_MS;
        path.last_recv_ms = now;
        assert_eq!(path.tick(now).len(), 1); // miss 1, probe 2

        now += LATENCY_INTERVAL_MS;
        path.last_recv_ms = now;
        path.tick(now); // miss 2
        assert_eq!(path.status(), PathStatus::Timeout);
    }

    #[test]
    fn obtain_exit_body_verifies_at_the_pivot() {
        let mut path = test_path(2, 0);
        path.set_status(PathStatus::Established);
        let client_keys = Keypair::generate();

        let (_, frame) = path
            .obtain_exit(&client_keys, true, "tx-9", Box::new(|_| {}), 50)
            .unwrap();
        let body = match frame {
            LinkFrame::Traffic { envelope } => {
                let mut payload = envelope.payload;
                onion_chain(
                    &mut payload,
                    envelope.nonce,
                    path.hops().iter().map(|h| (&h.shared, &h.nonce_xor)),
                );
                match InnerFrame::decode(&payload).unwrap() {
                    InnerFrame::Control { method, body, .. } => {
                        assert_eq!(method, "obtain_exit");
                        body
                    }
                    other => panic!("unexpected inner frame {:?}", other),
                }
            }
            _ => unreachable!(),
        };

        assert_eq!(
            crate::node::verify_exit_authorization(&body).unwrap(),
            *client_keys.router_id().as_bytes()
        );
    }

    #[test]
    fn convenience_wrappers_carry_their_methods() {
        let mut path = test_path(2, 0);
        path.set_status(PathStatus::Established);
        let keys = Keypair::generate();

        let strip_method = |path: &Path, frame: LinkFrame| -> String {
            match frame {
                LinkFrame::Traffic { envelope } => {
                    let mut payload = envelope.payload;
                    onion_chain(
                        &mut payload,
                        envelope.nonce,
                        path.hops().iter().map(|h| (&h.shared, &h.nonce_xor)),
                    );
                    match InnerFrame::decode(&payload).unwrap() {
                        InnerFrame::Control { method, .. } => method,
                        other => panic!("unexpected inner frame {:?}", other),
                    }
                }
                _ => unreachable!(),
            }
        };

        let (_, frame) = path
            .close_exit(&keys, "tx-1", Box::new(|_| {}), 10)
            .unwrap();
        assert_eq!(strip_method(&path, frame), "close_exit");

        let location = Keypair::generate().router_id();
        let (_, frame) = path
            .find_intro(&location, false, 0, Box::new(|_| {}), 20)
            .unwrap();
        assert_eq!(strip_method(&path, frame), "find_intro");

        path.drain_pending(ControlResponse::Error);
    }

    #[test]
    fn drain_fires_everything_with_reason() {
        let mut path = test_path(2, 0);
        path.set_status(PathStatus::Established);

        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let fired_cb = fired.clone();
            path.send_control(
                "find_name",
                vec![],
                Box::new(move |resp| {
                    assert_eq!(resp, ControlResponse::Error);
                    fired_cb.fetch_add(1, Ordering::SeqCst);
                }),
                0,
            )
            .unwrap();
        }
        path.drain_pending(ControlResponse::Error);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(path.pending_count(), 0);
    }
}
