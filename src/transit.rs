//! # Transit Hops
//!
//! The relay side of the path plane. A [`TransitHop`] splices an incoming
//! path ID to an outgoing one with a symmetric onion key; the
//! [`TransitTable`] indexes every hop under both of its `(peer, hop_id)`
//! halves; [`TransitContext`] is the per-relay engine that processes build
//! frames, relays build status (tearing down on failure), and forwards
//! traffic with one onion step per packet.
//!
//! A hop lives exactly `lifetime` from creation and is refused re-use after
//! expiry. Unknown or expired traffic is dropped silently and counted —
//! never answered, so the relay leaks nothing about its table.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::crypto::{self, NonceXor, SharedSecret, SymmNonce};
use crate::identity::{Keypair, RouterId};
use crate::messages::{
    process_build_slot, BuildSlotError, Envelope, HopId, InnerFrame, LinkFrame,
};

/// Default lifetime of a transit hop and of a client path.
pub const DEFAULT_LIFETIME_MS: u64 = 10 * 60 * 1000;

/// Upper bound a build record may ask for.
/// SECURITY: A hostile client must not pin relay state for hours.
pub const MAX_LIFETIME_MS: u64 = 60 * 60 * 1000;

/// Maximum transit hops one relay will carry.
/// SECURITY: Bounds table growth; new builds are refused with
/// FAIL_CONGESTION beyond this.
pub const MAX_TRANSIT_HOPS: usize = 10_000;

/// Build/teardown status flags. Bit positions match the wire.
pub mod status {
    pub const SUCCESS: u64 = 1 << 0;
    pub const FAIL_TIMEOUT: u64 = 1 << 1;
    pub const FAIL_CONGESTION: u64 = 1 << 2;
    pub const FAIL_DEST_UNKNOWN: u64 = 1 << 3;
    pub const FAIL_DECRYPT_ERROR: u64 = 1 << 4;
    pub const FAIL_MALFORMED_RECORD: u64 = 1 << 5;
    pub const FAIL_DEST_INVALID: u64 = 1 << 6;
    pub const FAIL_CANNOT_CONNECT: u64 = 1 << 7;
    pub const FAIL_DUPLICATE_HOP: u64 = 1 << 8;

    /// Human-readable flag list for logs.
    pub fn describe(bits: u64) -> String {
        const NAMES: [(u64, &str); 9] = [
            (SUCCESS, "SUCCESS"),
            (FAIL_TIMEOUT, "FAIL_TIMEOUT"),
            (FAIL_CONGESTION, "FAIL_CONGESTION"),
            (FAIL_DEST_UNKNOWN, "FAIL_DEST_UNKNOWN"),
            (FAIL_DECRYPT_ERROR, "FAIL_DECRYPT_ERROR"),
            (FAIL_MALFORMED_RECORD, "FAIL_MALFORMED_RECORD"),
            (FAIL_DEST_INVALID, "FAIL_DEST_INVALID"),
            (FAIL_CANNOT_CONNECT, "FAIL_CANNOT_CONNECT"),
            (FAIL_DUPLICATE_HOP, "FAIL_DUPLICATE_HOP"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| bits & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            format!("UNKNOWN({:#x})", bits)
        } else {
            names.join("|")
        }
    }
}

// ============================================================================
// TransitHop / TransitTable
// ============================================================================

/// Per-relay circuit state splicing `(downstream, rx_id)` to
/// `(upstream, tx_id)`. A zero upstream marks the terminal (pivot) hop.
#[derive(Clone, Debug)]
pub struct TransitHop {
    pub downstream: RouterId,
    pub upstream: RouterId,
    pub rx_id: HopId,
    pub tx_id: HopId,
    pub shared: SharedSecret,
    pub nonce_xor: NonceXor,
    pub started_ms: u64,
    pub lifetime_ms: u64,
}

impl TransitHop {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.upstream.is_zero()
    }

    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.started_ms.saturating_add(self.lifetime_ms)
    }
}

/// Error type for transit installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallError {
    /// Either half of the splice is already in use.
    Duplicate,
    /// The table is at capacity.
    Full,
}

impl std::fmt::Display for InstallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallError::Duplicate => write!(f, "duplicate transit hop"),
            InstallError::Full => write!(f, "transit table full"),
        }
    }
}

impl std::error::Error for InstallError {}

/// All transit hops of one relay, indexed by both `(peer, hop_id)` halves.
#[derive(Default)]
pub struct TransitTable {
    hops: HashMap<(RouterId, HopId), TransitHop>,
    /// Terminal hops by their upstream-facing (intro) id, for
    /// pivot-originated sends.
    intros: HashMap<HopId, (RouterId, HopId)>,
}

impl TransitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of hop *entries*; a relayed circuit contributes two, a
    /// terminal one.
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn lookup(&self, peer: &RouterId, hop_id: &HopId) -> Option<&TransitHop> {
        self.hops.get(&(*peer, *hop_id))
    }

    pub fn lookup_intro(&self, tx_id: &HopId) -> Option<&TransitHop> {
        self.intros
            .get(tx_id)
            .and_then(|key| self.hops.get(key))
    }

    /// Install a hop under both halves; rejects if either is taken.
    pub fn install(&mut self, hop: TransitHop) -> Result<(), InstallError> {
        if self.hops.len() >= MAX_TRANSIT_HOPS {
            return Err(InstallError::Full);
        }
        let down_key = (hop.downstream, hop.rx_id);
        if self.hops.contains_key(&down_key) {
            return Err(InstallError::Duplicate);
        }
        if hop.is_terminal() {
            if self.intros.contains_key(&hop.tx_id) {
                return Err(InstallError::Duplicate);
            }
            self.intros.insert(hop.tx_id, down_key);
            self.hops.insert(down_key, hop);
        } else {
            let up_key = (hop.upstream, hop.tx_id);
            if self.hops.contains_key(&up_key) {
                return Err(InstallError::Duplicate);
            }
            self.hops.insert(down_key, hop.clone());
            self.hops.insert(up_key, hop);
        }
        Ok(())
    }

    /// Remove both halves of the hop owning `(peer, hop_id)`.
    pub fn remove(&mut self, peer: &RouterId, hop_id: &HopId) -> Option<TransitHop> {
        let hop = self.hops.remove(&(*peer, *hop_id))?;
        if hop.is_terminal() {
            self.intros.remove(&hop.tx_id);
        } else {
            // drop the partner half, whichever one we were called with
            self.hops.remove(&(hop.downstream, hop.rx_id));
            self.hops.remove(&(hop.upstream, hop.tx_id));
        }
        Some(hop)
    }

    /// Drop every hop past its lifetime. Returns entries removed.
    pub fn expire(&mut self, now_ms: u64) -> usize {
        let dead: Vec<(RouterId, HopId)> = self
            .hops
            .iter()
            .filter(|(_, hop)| hop.is_expired(now_ms))
            .map(|(key, _)| *key)
            .collect();
        let count = dead.len();
        for key in dead {
            if let Some(hop) = self.hops.remove(&key) {
                if hop.is_terminal() {
                    self.intros.remove(&hop.tx_id);
                }
            }
        }
        count
    }
}

// ============================================================================
// TransitContext
// ============================================================================

/// What a relay does with a processed frame.
#[derive(Debug, PartialEq, Eq)]
pub enum TransitEvent {
    /// Send this frame to that peer.
    Forward { to: RouterId, frame: LinkFrame },
    /// Terminal hop delivered plaintext data for the endpoint layer.
    /// `path_id` is the intro id the circuit is known by at the pivot.
    Deliver { path_id: HopId, payload: Vec<u8> },
}

/// Handler for control methods reaching a terminal hop: the circuit's
/// intro id, the method, and its body. Returns the response body, or
/// `None` for methods it does not serve.
pub type ControlHandler = Box<dyn FnMut(&HopId, &str, &[u8]) -> Option<Vec<u8>> + Send>;

/// Counters mirrored into logs and node telemetry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransitMetrics {
    pub slots_processed: u64,
    pub builds_failed: u64,
    pub status_layers_added: u64,
    pub spliced_upstream: u64,
    pub spliced_downstream: u64,
    pub delivered: u64,
    pub unknown_dropped: u64,
    pub expired_dropped: u64,
}

/// The per-relay transit engine: one instance per node, driven from the
/// event loop with whole link frames.
pub struct TransitContext {
    keypair: Keypair,
    table: TransitTable,
    metrics: TransitMetrics,
    control_handler: Option<ControlHandler>,
}

impl TransitContext {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            table: TransitTable::new(),
            metrics: TransitMetrics::default(),
            control_handler: None,
        }
    }

    pub fn local_id(&self) -> RouterId {
        self.keypair.router_id()
    }

    pub fn table(&self) -> &TransitTable {
        &self.table
    }

    pub fn metrics(&self) -> TransitMetrics {
        self.metrics
    }

    /// Install the handler terminal-hop control methods are served by.
    /// `path_latency` is always answered internally.
    pub fn set_control_handler(&mut self, handler: ControlHandler) {
        self.control_handler = Some(handler);
    }

    /// Periodic expiry; call from the loop tick.
    pub fn expire(&mut self, now_ms: u64) {
        let removed = self.table.expire(now_ms);
        if removed > 0 {
            debug!(removed, "expired transit hops");
        }
    }

    /// Process one link frame from `from`. Returns the frames to send and
    /// deliveries to make; errors never escape the relay boundary.
    pub fn handle_frame(
        &mut self,
        from: RouterId,
        frame: LinkFrame,
        now_ms: u64,
    ) -> Vec<TransitEvent> {
        match frame {
            LinkFrame::Build { path_id, slots } => self.handle_build(from, path_id, &slots, now_ms),
            LinkFrame::Status {
                status,
                path_id,
                nonce,
                payload,
            } => self.handle_status(from, status, path_id, nonce, payload),
            LinkFrame::Traffic { envelope } => self.handle_traffic(from, envelope, now_ms),
        }
    }

    fn handle_build(
        &mut self,
        from: RouterId,
        path_id: HopId,
        slots: &[u8],
        now_ms: u64,
    ) -> Vec<TransitEvent> {
        let (shared, nonce_xor, record, forward) =
            match process_build_slot(slots, self.keypair.encryption_secret()) {
                Ok(parts) => parts,
                Err(err) => {
                    let bits = match err {
                        BuildSlotError::Decrypt => status::FAIL_DECRYPT_ERROR,
                        BuildSlotError::MalformedRecord | BuildSlotError::BadFrame => {
                            status::FAIL_MALFORMED_RECORD
                        }
                    };
                    warn!(peer = %from.short(), error = %err, "path build slot rejected");
                    self.metrics.builds_failed += 1;
                    return vec![fail_status(from, path_id, bits)];
                }
            };
        self.metrics.slots_processed += 1;

        if record.rx_id != path_id || record.lifetime_ms > MAX_LIFETIME_MS {
            self.metrics.builds_failed += 1;
            return vec![fail_status(from, path_id, status::FAIL_MALFORMED_RECORD)];
        }

        let hop = TransitHop {
            downstream: from,
            upstream: record.next,
            rx_id: record.rx_id,
            tx_id: record.tx_id,
            shared,
            nonce_xor,
            started_ms: now_ms,
            lifetime_ms: record.lifetime_ms,
        };
        let terminal = hop.is_terminal();
        let tx_id = hop.tx_id;

        match self.table.install(hop) {
            Ok(()) => {}
            Err(InstallError::Duplicate) => {
                debug!(peer = %from.short(), path = %path_id.short(), "duplicate hop id in build");
                self.metrics.builds_failed += 1;
                return vec![fail_status(from, path_id, status::FAIL_DUPLICATE_HOP)];
            }
            Err(InstallError::Full) => {
                self.metrics.builds_failed += 1;
                return vec![fail_status(from, path_id, status::FAIL_CONGESTION)];
            }
        }

        if terminal {
            // Confirm back down the path: clear SUCCESS bits plus an
            // onion-layered record the client verifies end to end.
            let mut payload = InnerFrame::StatusRecord {
                status: status::SUCCESS,
                path_id: tx_id,
            }
            .encode();
            let nonce = SymmNonce::random();
            crypto::xor_keystream(&mut payload, &shared, &nonce, 0);
            trace!(peer = %from.short(), path = %path_id.short(), "terminal hop established");
            vec![TransitEvent::Forward {
                to: from,
                frame: LinkFrame::Status {
                    status: status::SUCCESS,
                    path_id,
                    nonce,
                    payload,
                },
            }]
        } else {
            vec![TransitEvent::Forward {
                to: record.next,
                frame: LinkFrame::Build {
                    path_id: tx_id,
                    slots: forward,
                },
            }]
        }
    }

    fn handle_status(
        &mut self,
        from: RouterId,
        bits: u64,
        path_id: HopId,
        nonce: SymmNonce,
        mut payload: Vec<u8>,
    ) -> Vec<TransitEvent> {
        let hop = match self.table.lookup(&from, &path_id) {
            Some(hop) => hop.clone(),
            None => {
                self.metrics.unknown_dropped += 1;
                return vec![];
            }
        };

        if from == hop.upstream && path_id == hop.tx_id {
            // Build confirmation (or failure) travelling back to the client.
            if bits & status::SUCCESS == 0 {
                debug!(
                    path = %path_id.short(),
                    status = %status::describe(bits),
                    "tearing down transit hop on failed build"
                );
                self.table.remove(&from, &path_id);
            }
            let next_nonce = nonce.xored(&hop.nonce_xor);
            crypto::xor_keystream(&mut payload, &hop.shared, &next_nonce, 0);
            self.metrics.status_layers_added += 1;
            vec![TransitEvent::Forward {
                to: hop.downstream,
                frame: LinkFrame::Status {
                    status: bits,
                    path_id: hop.rx_id,
                    nonce: next_nonce,
                    payload,
                },
            }]
        } else if from == hop.downstream && path_id == hop.rx_id {
            // Teardown notification travelling away from the client.
            self.table.remove(&from, &path_id);
            if hop.is_terminal() {
                return vec![];
            }
            vec![TransitEvent::Forward {
                to: hop.upstream,
                frame: LinkFrame::Status {
                    status: bits,
                    path_id: hop.tx_id,
                    nonce,
                    payload,
                },
            }]
        } else {
            self.metrics.unknown_dropped += 1;
            vec![]
        }
    }

    fn handle_traffic(
        &mut self,
        from: RouterId,
        envelope: Envelope,
        now_ms: u64,
    ) -> Vec<TransitEvent> {
        let hop = match self.table.lookup(&from, &envelope.hop_id) {
            Some(hop) => hop.clone(),
            None => {
                self.metrics.unknown_dropped += 1;
                return vec![];
            }
        };
        if hop.is_expired(now_ms) {
            self.metrics.expired_dropped += 1;
            return vec![];
        }

        let mut payload = envelope.payload;
        if from == hop.downstream && envelope.hop_id == hop.rx_id {
            if hop.is_terminal() {
                // Final onion layer comes off here.
                crypto::xor_keystream(&mut payload, &hop.shared, &envelope.nonce, 0);
                return self.handle_terminal_plaintext(&hop, payload);
            }
            let next_nonce = crypto::onion(&mut payload, &hop.shared, &envelope.nonce, &hop.nonce_xor);
            self.metrics.spliced_upstream += 1;
            vec![TransitEvent::Forward {
                to: hop.upstream,
                frame: LinkFrame::Traffic {
                    envelope: Envelope::new(next_nonce, hop.tx_id, payload),
                },
            }]
        } else if from == hop.upstream && envelope.hop_id == hop.tx_id {
            let next_nonce = envelope.nonce.xored(&hop.nonce_xor);
            crypto::xor_keystream(&mut payload, &hop.shared, &next_nonce, 0);
            self.metrics.spliced_downstream += 1;
            vec![TransitEvent::Forward {
                to: hop.downstream,
                frame: LinkFrame::Traffic {
                    envelope: Envelope::new(next_nonce, hop.rx_id, payload),
                },
            }]
        } else {
            self.metrics.unknown_dropped += 1;
            vec![]
        }
    }

    fn handle_terminal_plaintext(
        &mut self,
        hop: &TransitHop,
        payload: Vec<u8>,
    ) -> Vec<TransitEvent> {
        match InnerFrame::decode(&payload) {
            Ok(InnerFrame::Data { payload }) => {
                self.metrics.delivered += 1;
                vec![TransitEvent::Deliver {
                    path_id: hop.tx_id,
                    payload,
                }]
            }
            Ok(InnerFrame::Control {
                method,
                body,
                request,
            }) => {
                let response = self.serve_control(&hop.tx_id, &method, &body);
                self.originate_downstream(
                    hop,
                    InnerFrame::Response {
                        body: response,
                        request,
                    },
                )
            }
            Ok(_) | Err(_) => {
                // Data-time crypto or framing failure: silent drop.
                self.metrics.unknown_dropped += 1;
                vec![]
            }
        }
    }

    fn serve_control(&mut self, intro_id: &HopId, method: &str, body: &[u8]) -> Vec<u8> {
        if method == "path_latency" {
            return body.to_vec();
        }
        if let Some(handler) = &mut self.control_handler {
            if let Some(response) = handler(intro_id, method, body) {
                return response;
            }
        }
        crate::bencode::DictBuilder::new()
            .insert_bytes("E", b"unknown method")
            .build()
            .encode()
    }

    /// Originate a frame at the pivot, addressed down the path: encrypt our
    /// layer under a fresh nonce and forward that nonce.
    fn originate_downstream(&mut self, hop: &TransitHop, inner: InnerFrame) -> Vec<TransitEvent> {
        let mut payload = inner.encode();
        let nonce = SymmNonce::random();
        crypto::xor_keystream(&mut payload, &hop.shared, &nonce, 0);
        vec![TransitEvent::Forward {
            to: hop.downstream,
            frame: LinkFrame::Traffic {
                envelope: Envelope::new(nonce, hop.rx_id, payload),
            },
        }]
    }

    /// Send opaque data down a circuit this relay terminates, identified by
    /// its intro id. Used by exit endpoints for return traffic.
    pub fn send_downstream(&mut self, intro_id: &HopId, payload: Vec<u8>) -> Option<TransitEvent> {
        let hop = self.table.lookup_intro(intro_id)?.clone();
        Some(
            self.originate_downstream(&hop, InnerFrame::Data { payload })
                .pop()
                .expect("originate_downstream returns one event"),
        )
    }

    /// Explicit teardown of the circuit owning `(peer, hop_id)`, notifying
    /// both neighbours with `reason`.
    pub fn teardown(&mut self, peer: &RouterId, hop_id: &HopId, reason: u64) -> Vec<TransitEvent> {
        let hop = match self.table.remove(peer, hop_id) {
            Some(hop) => hop,
            None => return vec![],
        };
        let mut events = vec![TransitEvent::Forward {
            to: hop.downstream,
            frame: LinkFrame::Status {
                status: reason,
                path_id: hop.rx_id,
                nonce: SymmNonce::random(),
                payload: random_status_payload(),
            },
        }];
        if !hop.is_terminal() {
            events.push(TransitEvent::Forward {
                to: hop.upstream,
                frame: LinkFrame::Status {
                    status: reason,
                    path_id: hop.tx_id,
                    nonce: SymmNonce::random(),
                    payload: random_status_payload(),
                },
            });
        }
        events
    }
}

/// A failure status carries an indistinguishable random payload: the hop
/// has no usable key, and the clear bits say everything the client needs.
fn random_status_payload() -> Vec<u8> {
    let mut payload = vec![0u8; crate::messages::PAD_SIZE];
    crypto::fill_random(&mut payload);
    payload
}

fn fail_status(to: RouterId, path_id: HopId, bits: u64) -> TransitEvent {
    TransitEvent::Forward {
        to,
        frame: LinkFrame::Status {
            status: bits,
            path_id,
            nonce: SymmNonce::random(),
            payload: random_status_payload(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_hop(terminal: bool) -> TransitHop {
        let shared = SharedSecret::from_bytes(crypto::randbytes());
        TransitHop {
            downstream: RouterId::from_bytes(crypto::randbytes()),
            upstream: if terminal {
                RouterId::ZERO
            } else {
                RouterId::from_bytes(crypto::randbytes())
            },
            rx_id: HopId::random(),
            tx_id: HopId::random(),
            nonce_xor: crypto::hash_shared(&shared),
            shared,
            started_ms: 1_000,
            lifetime_ms: DEFAULT_LIFETIME_MS,
        }
    }

    #[test]
    fn install_and_lookup_both_halves() {
        let mut table = TransitTable::new();
        let hop = test_hop(false);
        table.install(hop.clone()).unwrap();

        assert!(table.lookup(&hop.downstream, &hop.rx_id).is_some());
        assert!(table.lookup(&hop.upstream, &hop.tx_id).is_some());
        assert!(table.lookup(&hop.downstream, &hop.tx_id).is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn duplicate_install_rejected_and_first_kept() {
        let mut table = TransitTable::new();
        let hop = test_hop(false);
        table.install(hop.clone()).unwrap();

        let mut dup = test_hop(false);
        dup.downstream = hop.downstream;
        dup.rx_id = hop.rx_id;
        assert_eq!(table.install(dup), Err(InstallError::Duplicate));

        // the original entry is untouched
        let kept = table.lookup(&hop.downstream, &hop.rx_id).unwrap();
        assert_eq!(kept.tx_id, hop.tx_id);
    }

    #[test]
    fn remove_drops_both_halves() {
        let mut table = TransitTable::new();
        let hop = test_hop(false);
        table.install(hop.clone()).unwrap();
        table.remove(&hop.upstream, &hop.tx_id).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn terminal_hops_index_their_intro() {
        let mut table = TransitTable::new();
        let hop = test_hop(true);
        table.install(hop.clone()).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.lookup_intro(&hop.tx_id).is_some());

        table.remove(&hop.downstream, &hop.rx_id).unwrap();
        assert!(table.lookup_intro(&hop.tx_id).is_none());
    }

    #[test]
    fn hop_expiry() {
        let hop = test_hop(false);
        assert!(!hop.is_expired(hop.started_ms));
        assert!(!hop.is_expired(hop.started_ms + hop.lifetime_ms));
        assert!(hop.is_expired(hop.started_ms + hop.lifetime_ms + 1));

        let mut table = TransitTable::new();
        table.install(hop.clone()).unwrap();
        assert_eq!(table.expire(hop.started_ms + hop.lifetime_ms + 1), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_traffic_dropped_silently() {
        let mut ctx = TransitContext::new(Keypair::generate());
        let events = ctx.handle_frame(
            RouterId::from_bytes(crypto::randbytes()),
            LinkFrame::Traffic {
                envelope: Envelope::new(SymmNonce::random(), HopId::random(), vec![1, 2, 3]),
            },
            0,
        );
        assert!(events.is_empty());
        assert_eq!(ctx.metrics().unknown_dropped, 1);
    }

    #[test]
    fn expired_hop_refuses_traffic() {
        let mut ctx = TransitContext::new(Keypair::generate());
        let hop = test_hop(false);
        ctx.table.install(hop.clone()).unwrap();

        let events = ctx.handle_frame(
            hop.downstream,
            LinkFrame::Traffic {
                envelope: Envelope::new(SymmNonce::random(), hop.rx_id, vec![0; 32]),
            },
            hop.started_ms + hop.lifetime_ms + 1,
        );
        assert!(events.is_empty());
        assert_eq!(ctx.metrics().expired_dropped, 1);
    }

    #[test]
    fn pivot_originated_data_decrypts_downstream() {
        let mut ctx = TransitContext::new(Keypair::generate());
        let hop = test_hop(true);
        ctx.table.install(hop.clone()).unwrap();

        let event = ctx
            .send_downstream(&hop.tx_id, b"return traffic".to_vec())
            .expect("known intro id");
        match event {
            TransitEvent::Forward { to, frame } => {
                assert_eq!(to, hop.downstream);
                let envelope = match frame {
                    LinkFrame::Traffic { envelope } => envelope,
                    other => panic!("unexpected frame {:?}", other),
                };
                assert_eq!(envelope.hop_id, hop.rx_id);
                // one onion step with the originated nonce recovers the data
                let mut payload = envelope.payload;
                crypto::xor_keystream(&mut payload, &hop.shared, &envelope.nonce, 0);
                match InnerFrame::decode(&payload).unwrap() {
                    InnerFrame::Data { payload } => assert_eq!(payload, b"return traffic"),
                    other => panic!("unexpected inner frame {:?}", other),
                }
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert!(ctx.send_downstream(&HopId::random(), vec![]).is_none());
    }

    #[test]
    fn status_describe_names_bits() {
        assert_eq!(status::describe(status::SUCCESS), "SUCCESS");
        assert_eq!(
            status::describe(status::FAIL_TIMEOUT | status::FAIL_CONGESTION),
            "FAIL_TIMEOUT|FAIL_CONGESTION"
        );
        assert!(status::describe(1 << 20).starts_with("UNKNOWN"));
    }

    #[test]
    fn teardown_notifies_both_sides() {
        let mut ctx = TransitContext::new(Keypair::generate());
        let hop = test_hop(false);
        ctx.table.install(hop.clone()).unwrap();

        let events = ctx.teardown(&hop.downstream, &hop.rx_id, status::FAIL_TIMEOUT);
        assert_eq!(events.len(), 2);
        assert!(ctx.table.is_empty());
        match &events[0] {
            TransitEvent::Forward { to, frame } => {
                assert_eq!(*to, hop.downstream);
                assert!(matches!(frame, LinkFrame::Status { status, .. } if *status == status::FAIL_TIMEOUT));
            }
            _ => panic!("expected forward"),
        }
    }
}
