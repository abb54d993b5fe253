//! # Wire Protocol Messages
//!
//! This module defines everything that crosses a link between two relays on
//! the path plane:
//!
//! | Frame | Carries |
//! |-------|---------|
//! | [`LinkFrame::Build`] | the 8-slot hop-record array of a path build |
//! | [`LinkFrame::Status`] | build confirmation/failure travelling back |
//! | [`LinkFrame::Traffic`] | an onion [`Envelope`] (control or data) |
//!
//! An [`Envelope`] is `nonce (24 B) ‖ hop_id (16 B) ‖ ciphertext`, with the
//! ciphertext bounded by the path MTU. The plaintext under the onion layers
//! is a bencoded dict: `{METHOD, BODY, NONCE}` for control requests,
//! `{NONCE, PAYLOAD}` for control responses, `{DATA}` for data, and
//! `{STATUS, PATHID}` for build status records. Control payloads shorter
//! than [`PAD_SIZE`] are right-padded with random bytes so ciphertext
//! length leaks nothing below that size.
//!
//! ## Build slots
//!
//! A build frame packs one fixed-size record per hop into
//! [`SLOT_COUNT`] slots; unused slots hold random bytes indistinguishable
//! from real ones. Each hop decrypts slot 0 via X25519 against the
//! ephemeral key in its clear header, rotates the array, and strips one
//! keystream layer from the carried slots; the client pre-applies the
//! inverse layers at build time so every hop finds its own slot in the
//! clear and nothing else.

use crate::bencode::{self, DictBuilder, Value};
use crate::crypto::{self, NonceXor, SharedSecret, SymmNonce, NONCE_SIZE};
use crate::identity::RouterId;

/// Maximum onion ciphertext per envelope.
pub const PATH_MTU: usize = 1500;

/// Control payloads are padded up to this size.
pub const PAD_SIZE: usize = 256;

/// Size of a path/hop identifier.
pub const HOP_ID_SIZE: usize = 16;

/// Number of hop-record slots in a build frame, independent of path length.
pub const SLOT_COUNT: usize = 8;

/// Fixed size of one encrypted hop record.
pub const RECORD_SIZE: usize = 128;

/// One slot: ephemeral X25519 key ‖ record nonce ‖ record ciphertext.
pub const SLOT_SIZE: usize = 32 + NONCE_SIZE + RECORD_SIZE;

/// Total size of the slot array in a build frame.
pub const BUILD_FRAME_SIZE: usize = SLOT_COUNT * SLOT_SIZE;

/// Hard bound on any decoded link frame.
/// SECURITY: Prevents memory exhaustion from hostile length prefixes.
pub const MAX_FRAME_SIZE: usize = 8 * 1024;

/// Error type for wire frame encoding and decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Structurally invalid frame.
    Malformed,
    /// Frame or payload exceeds its bound.
    TooLarge,
    /// A build frame with no hops, or more hops than slots.
    BadHopCount,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Malformed => write!(f, "malformed wire frame"),
            WireError::TooLarge => write!(f, "wire frame too large"),
            WireError::BadHopCount => write!(f, "hop count outside 1..={}", SLOT_COUNT),
        }
    }
}

impl std::error::Error for WireError {}

// ============================================================================
// HopId
// ============================================================================

/// A 16-byte opaque identifier naming one direction of a hop.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct HopId([u8; HOP_ID_SIZE]);

impl HopId {
    pub const ZERO: HopId = HopId([0u8; HOP_ID_SIZE]);

    #[inline]
    pub fn from_bytes(bytes: [u8; HOP_ID_SIZE]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; HOP_ID_SIZE] {
        &self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Random id, re-rolled until non-zero.
    pub fn random() -> Self {
        loop {
            let id = Self(crypto::randbytes());
            if !id.is_zero() {
                return id;
            }
        }
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl std::fmt::Debug for HopId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HopId({})", self.short())
    }
}

impl std::fmt::Display for HopId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// A path-borne onion frame: `nonce ‖ hop_id ‖ ciphertext`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub nonce: SymmNonce,
    pub hop_id: HopId,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(nonce: SymmNonce, hop_id: HopId, payload: Vec<u8>) -> Self {
        Self {
            nonce,
            hop_id,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_SIZE + HOP_ID_SIZE + self.payload.len());
        out.extend_from_slice(self.nonce.as_bytes());
        out.extend_from_slice(self.hop_id.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < NONCE_SIZE + HOP_ID_SIZE {
            return Err(WireError::Malformed);
        }
        let payload = &buf[NONCE_SIZE + HOP_ID_SIZE..];
        if payload.len() > PATH_MTU {
            return Err(WireError::TooLarge);
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&buf[..NONCE_SIZE]);
        let mut hop_id = [0u8; HOP_ID_SIZE];
        hop_id.copy_from_slice(&buf[NONCE_SIZE..NONCE_SIZE + HOP_ID_SIZE]);
        Ok(Self {
            nonce: SymmNonce::from_bytes(nonce),
            hop_id: HopId::from_bytes(hop_id),
            payload: payload.to_vec(),
        })
    }
}

// ============================================================================
// Link Frames
// ============================================================================

/// A message between adjacent relays on the path plane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkFrame {
    /// Path build travelling client → pivot. `path_id` names the link it
    /// just crossed in clear so a hop that cannot read its slot can still
    /// address a failure status back down the path.
    Build { path_id: HopId, slots: Vec<u8> },
    /// Build confirmation travelling pivot → client. `status` bits are
    /// clear so relaying hops can tear down on failure; `payload` carries
    /// the onion-layered `{STATUS, PATHID}` record the client verifies.
    Status {
        status: u64,
        path_id: HopId,
        nonce: SymmNonce,
        payload: Vec<u8>,
    },
    /// Onion traffic, control or data, either direction.
    Traffic { envelope: Envelope },
}

impl LinkFrame {
    pub fn method(&self) -> &'static str {
        match self {
            LinkFrame::Build { .. } => "path_build",
            LinkFrame::Status { .. } => "path_status",
            LinkFrame::Traffic { .. } => "path_traffic",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            LinkFrame::Build { path_id, slots } => DictBuilder::new()
                .insert_bytes("m", b"path_build")
                .insert_bytes("p", path_id.as_bytes())
                .insert_bytes("s", slots),
            LinkFrame::Status {
                status,
                path_id,
                nonce,
                payload,
            } => DictBuilder::new()
                .insert_bytes("f", payload)
                .insert_bytes("m", b"path_status")
                .insert_bytes("n", nonce.as_bytes())
                .insert_bytes("p", path_id.as_bytes())
                .insert_int("s", *status as i64),
            LinkFrame::Traffic { envelope } => DictBuilder::new()
                .insert_bytes("e", &envelope.encode())
                .insert_bytes("m", b"path_traffic"),
        }
        .build()
        .encode()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() > MAX_FRAME_SIZE {
            return Err(WireError::TooLarge);
        }
        let value = bencode::decode(buf).map_err(|_| WireError::Malformed)?;
        let method = value
            .get("m")
            .and_then(Value::as_bytes)
            .ok_or(WireError::Malformed)?;
        match method {
            b"path_build" => {
                let path_id = decode_hop_id(&value, "p")?;
                let slots = value
                    .get("s")
                    .and_then(Value::as_bytes)
                    .filter(|s| s.len() == BUILD_FRAME_SIZE)
                    .ok_or(WireError::Malformed)?
                    .to_vec();
                Ok(LinkFrame::Build { path_id, slots })
            }
            b"path_status" => {
                let status = value
                    .get("s")
                    .and_then(Value::as_int)
                    .filter(|s| *s >= 0)
                    .ok_or(WireError::Malformed)? as u64;
                let path_id = decode_hop_id(&value, "p")?;
                let nonce = value
                    .get("n")
                    .and_then(Value::as_bytes)
                    .and_then(|b| <[u8; NONCE_SIZE]>::try_from(b).ok())
                    .map(SymmNonce::from_bytes)
                    .ok_or(WireError::Malformed)?;
                let payload = value
                    .get("f")
                    .and_then(Value::as_bytes)
                    .filter(|p| p.len() <= PATH_MTU)
                    .ok_or(WireError::Malformed)?
                    .to_vec();
                Ok(LinkFrame::Status {
                    status,
                    path_id,
                    nonce,
                    payload,
                })
            }
            b"path_traffic" => {
                let envelope = value
                    .get("e")
                    .and_then(Value::as_bytes)
                    .ok_or(WireError::Malformed)
                    .and_then(Envelope::decode)?;
                Ok(LinkFrame::Traffic { envelope })
            }
            _ => Err(WireError::Malformed),
        }
    }
}

fn decode_hop_id(value: &Value, key: &str) -> Result<HopId, WireError> {
    value
        .get(key)
        .and_then(Value::as_bytes)
        .and_then(|b| <[u8; HOP_ID_SIZE]>::try_from(b).ok())
        .map(HopId::from_bytes)
        .ok_or(WireError::Malformed)
}

// ============================================================================
// Inner Frames (plaintext under the onion layers)
// ============================================================================

/// The decrypted payload of a path envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InnerFrame {
    /// Control request: method, body, and the request nonce responses echo.
    Control {
        method: String,
        body: Vec<u8>,
        request: [u8; 16],
    },
    /// Control response, matched to its request by the echoed nonce.
    Response { body: Vec<u8>, request: [u8; 16] },
    /// Opaque data payload.
    Data { payload: Vec<u8> },
    /// Build status record, verified by the client on path establishment.
    StatusRecord { status: u64, path_id: HopId },
}

impl InnerFrame {
    /// Encode, right-padding control/status forms with random bytes up to
    /// [`PAD_SIZE`] so ciphertext length leaks nothing below that size.
    pub fn encode(&self) -> Vec<u8> {
        let (mut out, pad) = match self {
            InnerFrame::Control {
                method,
                body,
                request,
            } => (
                DictBuilder::new()
                    .insert_bytes("BODY", body)
                    .insert_bytes("METHOD", method.as_bytes())
                    .insert_bytes("NONCE", request)
                    .build()
                    .encode(),
                true,
            ),
            InnerFrame::Response { body, request } => (
                DictBuilder::new()
                    .insert_bytes("NONCE", request)
                    .insert_bytes("PAYLOAD", body)
                    .build()
                    .encode(),
                true,
            ),
            InnerFrame::Data { payload } => (
                DictBuilder::new()
                    .insert_bytes("DATA", payload)
                    .build()
                    .encode(),
                false,
            ),
            InnerFrame::StatusRecord { status, path_id } => (
                DictBuilder::new()
                    .insert_bytes("PATHID", path_id.as_bytes())
                    .insert_int("STATUS", *status as i64)
                    .build()
                    .encode(),
                true,
            ),
        };
        if pad && out.len() < PAD_SIZE {
            let start = out.len();
            out.resize(PAD_SIZE, 0);
            crypto::fill_random(&mut out[start..]);
        }
        out
    }

    /// Decode from a padded buffer (trailing random bytes ignored).
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let (value, _) = bencode::decode_prefix(buf).map_err(|_| WireError::Malformed)?;
        if value.as_dict().is_none() {
            return Err(WireError::Malformed);
        }

        if let Some(payload) = value.get("DATA").and_then(Value::as_bytes) {
            return Ok(InnerFrame::Data {
                payload: payload.to_vec(),
            });
        }
        if let Some(status) = value.get("STATUS").and_then(Value::as_int) {
            let path_id = decode_hop_id(&value, "PATHID")?;
            if status < 0 {
                return Err(WireError::Malformed);
            }
            return Ok(InnerFrame::StatusRecord {
                status: status as u64,
                path_id,
            });
        }
        let request: [u8; 16] = value
            .get("NONCE")
            .and_then(Value::as_bytes)
            .and_then(|b| b.try_into().ok())
            .ok_or(WireError::Malformed)?;
        match value.get("METHOD") {
            Some(m) => {
                let method = m
                    .as_bytes()
                    .and_then(|b| String::from_utf8(b.to_vec()).ok())
                    .ok_or(WireError::Malformed)?;
                let body = value
                    .get("BODY")
                    .and_then(Value::as_bytes)
                    .ok_or(WireError::Malformed)?
                    .to_vec();
                Ok(InnerFrame::Control {
                    method,
                    body,
                    request,
                })
            }
            None => {
                let body = value
                    .get("PAYLOAD")
                    .and_then(Value::as_bytes)
                    .ok_or(WireError::Malformed)?
                    .to_vec();
                Ok(InnerFrame::Response { body, request })
            }
        }
    }
}

// ============================================================================
// Onion Chains
// ============================================================================

/// Apply one onion layer per hop, first hop first, walking the nonce chain.
///
/// The same loop encrypts an outgoing payload (start from a random nonce,
/// emit that nonce) and strips an incoming one (start from the observed
/// nonce). Returns the nonce after the final layer.
pub fn onion_chain<'a>(
    payload: &mut [u8],
    start: SymmNonce,
    hops: impl Iterator<Item = (&'a SharedSecret, &'a NonceXor)>,
) -> SymmNonce {
    let mut nonce = start;
    for (shared, xor) in hops {
        nonce = crypto::onion(payload, shared, &nonce, xor);
    }
    nonce
}

// ============================================================================
// Build Records and Slots
// ============================================================================

/// The plaintext a hop finds in its build slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildRecord {
    pub lifetime_ms: u64,
    /// Next router to forward the build to; zero marks the terminal hop.
    pub next: RouterId,
    pub rx_id: HopId,
    pub tx_id: HopId,
}

impl BuildRecord {
    fn encode_padded(&self) -> [u8; RECORD_SIZE] {
        let encoded = DictBuilder::new()
            .insert_int("l", self.lifetime_ms as i64)
            .insert_bytes("n", self.next.as_bytes())
            .insert_bytes("r", self.rx_id.as_bytes())
            .insert_bytes("t", self.tx_id.as_bytes())
            .build()
            .encode();
        debug_assert!(encoded.len() <= RECORD_SIZE);
        let mut out = [0u8; RECORD_SIZE];
        crypto::fill_random(&mut out);
        out[..encoded.len()].copy_from_slice(&encoded);
        out
    }

    fn decode(buf: &[u8]) -> Result<Self, BuildSlotError> {
        let (value, _) = bencode::decode_prefix(buf).map_err(|_| BuildSlotError::Decrypt)?;
        if value.as_dict().is_none() {
            return Err(BuildSlotError::Decrypt);
        }
        let lifetime_ms = value
            .get("l")
            .and_then(Value::as_int)
            .filter(|l| *l > 0)
            .ok_or(BuildSlotError::MalformedRecord)? as u64;
        let next = value
            .get("n")
            .and_then(Value::as_bytes)
            .and_then(|b| <[u8; 32]>::try_from(b).ok())
            .map(RouterId::from_bytes)
            .ok_or(BuildSlotError::MalformedRecord)?;
        let rx_id = decode_hop_id(&value, "r").map_err(|_| BuildSlotError::MalformedRecord)?;
        let tx_id = decode_hop_id(&value, "t").map_err(|_| BuildSlotError::MalformedRecord)?;
        if rx_id.is_zero() || tx_id.is_zero() {
            return Err(BuildSlotError::MalformedRecord);
        }
        Ok(Self {
            lifetime_ms,
            next,
            rx_id,
            tx_id,
        })
    }
}

/// Error type for per-hop build slot processing, mapped to status bits by
/// the transit layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSlotError {
    /// The slot did not decrypt to a bencoded record.
    Decrypt,
    /// The record decoded but carried invalid fields.
    MalformedRecord,
    /// The slot array had the wrong size.
    BadFrame,
}

impl std::fmt::Display for BuildSlotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildSlotError::Decrypt => write!(f, "build slot failed to decrypt"),
            BuildSlotError::MalformedRecord => write!(f, "build record malformed"),
            BuildSlotError::BadFrame => write!(f, "build frame has wrong size"),
        }
    }
}

impl std::error::Error for BuildSlotError {}

/// Everything the client derived for one hop of a build.
pub struct HopMaterial {
    pub eph_pub: [u8; 32],
    pub record_nonce: SymmNonce,
    pub shared: SharedSecret,
    pub xor: NonceXor,
    pub record: BuildRecord,
}

/// The keystream nonce a hop uses over the carried slots after rotating.
/// Both sides derive it the same way from material they already hold.
#[inline]
fn mix_nonce(record_nonce: &SymmNonce, xor: &NonceXor) -> SymmNonce {
    record_nonce.xored(xor)
}

/// Client side: pack hop records into the fixed slot array, fill the rest
/// with random dummies, and pre-apply the inverse of every layer the hops
/// will strip so each hop finds exactly its own slot in the clear.
pub fn encode_build_slots(materials: &[HopMaterial]) -> Result<Vec<u8>, WireError> {
    if materials.is_empty() || materials.len() > SLOT_COUNT {
        return Err(WireError::BadHopCount);
    }

    let mut slots = vec![0u8; BUILD_FRAME_SIZE];
    crypto::fill_random(&mut slots);

    for (i, material) in materials.iter().enumerate() {
        let base = i * SLOT_SIZE;
        slots[base..base + 32].copy_from_slice(&material.eph_pub);
        slots[base + 32..base + 32 + NONCE_SIZE].copy_from_slice(material.record_nonce.as_bytes());
        let mut ciphertext = material.record.encode_padded();
        crypto::xor_keystream(&mut ciphertext, &material.shared, &material.record_nonce, 0);
        slots[base + 32 + NONCE_SIZE..base + SLOT_SIZE].copy_from_slice(&ciphertext);
    }

    // Pre-compensate the layer hop i strips from the carried slots: when
    // hop i rotates, original slot j sits at position j - i - 1.
    for (i, material) in materials.iter().enumerate() {
        let nonce = mix_nonce(&material.record_nonce, &material.xor);
        for j in (i + 1)..SLOT_COUNT {
            let offset = ((j - i - 1) * SLOT_SIZE) as u64;
            let base = j * SLOT_SIZE;
            crypto::xor_keystream(
                &mut slots[base..base + SLOT_SIZE],
                &material.shared,
                &nonce,
                offset,
            );
        }
    }

    Ok(slots)
}

/// Hop side: decrypt our slot, rotate the array, strip our layer from the
/// carried slots, and append a fresh dummy. Returns our derived keys, our
/// record, and the slot array to forward.
pub fn process_build_slot(
    slots: &[u8],
    encryption_secret: &x25519_dalek::StaticSecret,
) -> Result<(SharedSecret, NonceXor, BuildRecord, Vec<u8>), BuildSlotError> {
    if slots.len() != BUILD_FRAME_SIZE {
        return Err(BuildSlotError::BadFrame);
    }

    let eph_pub: [u8; 32] = slots[..32].try_into().expect("slice length checked");
    let record_nonce = SymmNonce::from_bytes(
        slots[32..32 + NONCE_SIZE]
            .try_into()
            .expect("slice length checked"),
    );
    let shared = crypto::dh(encryption_secret, &eph_pub);
    let xor = crypto::hash_shared(&shared);

    let mut record_buf = [0u8; RECORD_SIZE];
    record_buf.copy_from_slice(&slots[32 + NONCE_SIZE..SLOT_SIZE]);
    crypto::xor_keystream(&mut record_buf, &shared, &record_nonce, 0);
    let record = BuildRecord::decode(&record_buf)?;

    let mut forward = Vec::with_capacity(BUILD_FRAME_SIZE);
    forward.extend_from_slice(&slots[SLOT_SIZE..]);
    crypto::xor_keystream(&mut forward, &shared, &mix_nonce(&record_nonce, &xor), 0);
    let mut dummy = [0u8; SLOT_SIZE];
    crypto::fill_random(&mut dummy);
    forward.extend_from_slice(&dummy);

    Ok((shared, xor, record, forward))
}
