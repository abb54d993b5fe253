//! # Router Contacts
//!
//! A [`RouterContact`] (RC) is the signed descriptor of a relay: its
//! identity key, its X25519 encryption key, the addresses it listens on,
//! the exits it offers, a millisecond timestamp, and an optional nickname.
//!
//! ## Invariants
//!
//! - The Ed25519 signature verifies under the identity key over the
//!   canonical bencoding of the record with the signature field zeroed.
//! - An RC is *public* iff it advertises at least one address.
//! - `last_updated` is monotonic across valid updates: a replacement is
//!   accepted only with a strictly newer timestamp.
//! - Equality is by identity key; a newer RC for the same relay *replaces*
//!   the old one rather than coexisting with it.
//!
//! ## Wire format
//!
//! Canonical bencoded dict: `a` (address list), `e` (encryption key, 32 B),
//! `k` (identity key, 32 B), optional `n` (nickname, UTF-8 ≤ 32 B), `u`
//! (last_updated ms), `x` (exit list), `z` (signature, 64 B).

use crate::bencode::{self, DictBuilder, Value};
use crate::crypto::{self, SignatureError, SIG_SIZE};
use crate::identity::{Keypair, RouterId};
use crate::policy::{IpRange, TrafficPolicy};

/// Maximum addresses an RC may carry.
/// SECURITY: Bounds memory for untrusted records.
const MAX_ADDRS: usize = 16;

/// Maximum exits an RC may carry.
const MAX_EXITS: usize = 16;

/// Maximum nickname length in bytes.
pub const MAX_NICKNAME_LEN: usize = 32;

/// Error type for router contact decoding and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactError {
    /// Structurally invalid: bad bencode, missing key, wrong field size.
    Malformed(&'static str),
    /// The signature did not verify.
    Signature(SignatureError),
}

impl std::fmt::Display for ContactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContactError::Malformed(what) => write!(f, "malformed router contact: {}", what),
            ContactError::Signature(err) => write!(f, "router contact signature: {}", err),
        }
    }
}

impl std::error::Error for ContactError {}

impl From<SignatureError> for ContactError {
    fn from(err: SignatureError) -> Self {
        ContactError::Signature(err)
    }
}

// ============================================================================
// AddressInfo / ExitInfo
// ============================================================================

/// One address a relay listens on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressInfo {
    pub ip: std::net::IpAddr,
    pub port: u16,
    pub version: u8,
    pub dialect: Option<String>,
}

impl AddressInfo {
    pub fn new(ip: std::net::IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            version: 0,
            dialect: None,
        }
    }

    fn bt_encode(&self) -> Value {
        let mut builder = DictBuilder::new()
            .insert_bytes("i", self.ip.to_string().as_bytes())
            .insert_int("p", self.port as i64)
            .insert_int("v", self.version as i64);
        if let Some(dialect) = &self.dialect {
            builder = builder.insert_bytes("d", dialect.as_bytes());
        }
        builder.build()
    }

    fn bt_decode(value: &Value) -> Result<Self, ContactError> {
        let ip = value
            .get("i")
            .and_then(Value::as_bytes)
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(|s| s.parse().ok())
            .ok_or(ContactError::Malformed("address ip"))?;
        let port = value
            .get("p")
            .and_then(Value::as_int)
            .filter(|p| (0..=65535).contains(p))
            .ok_or(ContactError::Malformed("address port"))? as u16;
        let version = value
            .get("v")
            .and_then(Value::as_int)
            .filter(|v| (0..=255).contains(v))
            .ok_or(ContactError::Malformed("address version"))? as u8;
        let dialect = match value.get("d") {
            Some(v) => Some(
                v.as_bytes()
                    .and_then(|b| String::from_utf8(b.to_vec()).ok())
                    .ok_or(ContactError::Malformed("address dialect"))?,
            ),
            None => None,
        };
        Ok(Self {
            ip,
            port,
            version,
            dialect,
        })
    }

    pub fn to_socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.port)
    }
}

/// One exit a relay offers: the range it will forward for, with an optional
/// embedded traffic policy narrowing what it carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitInfo {
    pub range: IpRange,
    pub policy: Option<TrafficPolicy>,
}

impl ExitInfo {
    pub fn new(range: IpRange) -> Self {
        Self {
            range,
            policy: None,
        }
    }

    fn bt_encode(&self) -> Value {
        let mut builder = DictBuilder::new().insert("r", self.range.bt_encode());
        if let Some(policy) = &self.policy {
            builder = builder.insert("o", policy.bt_encode());
        }
        builder.build()
    }

    fn bt_decode(value: &Value) -> Result<Self, ContactError> {
        let range = value
            .get("r")
            .and_then(|v| IpRange::bt_decode(v).ok())
            .ok_or(ContactError::Malformed("exit range"))?;
        let policy = match value.get("o") {
            Some(v) => Some(
                TrafficPolicy::bt_decode(v).map_err(|_| ContactError::Malformed("exit policy"))?,
            ),
            None => None,
        };
        Ok(Self { range, policy })
    }
}

// ============================================================================
// RouterContact
// ============================================================================

/// Signed relay descriptor. Immutable per version; mutated only by
/// replacement with a newer `last_updated`.
#[derive(Clone, Debug)]
pub struct RouterContact {
    pub router_id: RouterId,
    pub encryption: [u8; 32],
    pub addrs: Vec<AddressInfo>,
    pub exits: Vec<ExitInfo>,
    pub last_updated: u64,
    pub nickname: Option<String>,
    /// Ed25519 signature over the canonical encoding with `z` zeroed.
    pub signature: Vec<u8>,
}

impl RouterContact {
    /// Build and sign a contact for `keypair`.
    pub fn new_signed(
        keypair: &Keypair,
        addrs: Vec<AddressInfo>,
        exits: Vec<ExitInfo>,
        nickname: Option<String>,
        last_updated: u64,
    ) -> Self {
        let mut rc = Self {
            router_id: keypair.router_id(),
            encryption: keypair.encryption_public(),
            addrs,
            exits,
            last_updated,
            nickname,
            signature: vec![],
        };
        rc.sign(keypair);
        rc
    }

    /// An RC is public iff it advertises at least one address.
    pub fn is_public(&self) -> bool {
        !self.addrs.is_empty()
    }

    fn bt_encode_with_sig(&self, signature: &[u8]) -> Value {
        let mut builder = DictBuilder::new()
            .insert(
                "a",
                Value::List(self.addrs.iter().map(AddressInfo::bt_encode).collect()),
            )
            .insert_bytes("e", &self.encryption)
            .insert_bytes("k", self.router_id.as_bytes())
            .insert_int("u", self.last_updated as i64)
            .insert(
                "x",
                Value::List(self.exits.iter().map(ExitInfo::bt_encode).collect()),
            )
            .insert_bytes("z", signature);
        if let Some(nick) = &self.nickname {
            builder = builder.insert_bytes("n", nick.as_bytes());
        }
        builder.build()
    }

    /// Canonical encoding, byte-identical across runs for the same record.
    pub fn encode(&self) -> Vec<u8> {
        self.bt_encode_with_sig(&self.signature).encode()
    }

    /// The bytes the signature covers: the canonical encoding with `z`
    /// zeroed.
    fn signing_payload(&self) -> Vec<u8> {
        self.bt_encode_with_sig(&[0u8; SIG_SIZE]).encode()
    }

    /// Sign (or re-sign) this record with `keypair`.
    pub fn sign(&mut self, keypair: &Keypair) {
        self.signature = keypair.sign(&self.signing_payload()).to_vec();
    }

    /// Verify the signature under the identity key.
    pub fn verify(&self) -> Result<(), ContactError> {
        crypto::verify(
            self.router_id.as_bytes(),
            &self.signing_payload(),
            &self.signature,
        )?;
        Ok(())
    }

    /// Decode a canonical record. Verifies structure, not the signature;
    /// callers holding untrusted bytes follow up with [`verify`].
    ///
    /// [`verify`]: RouterContact::verify
    pub fn decode(buf: &[u8]) -> Result<Self, ContactError> {
        let value = bencode::decode(buf).map_err(|_| ContactError::Malformed("bencode"))?;

        let router_id = value
            .get("k")
            .and_then(Value::as_bytes)
            .and_then(|b| <[u8; 32]>::try_from(b).ok())
            .map(RouterId::from_bytes)
            .ok_or(ContactError::Malformed("identity key"))?;
        let encryption = value
            .get("e")
            .and_then(Value::as_bytes)
            .and_then(|b| <[u8; 32]>::try_from(b).ok())
            .ok_or(ContactError::Malformed("encryption key"))?;
        let addrs = value
            .get("a")
            .and_then(Value::as_list)
            .ok_or(ContactError::Malformed("address list"))?
            .iter()
            .map(AddressInfo::bt_decode)
            .collect::<Result<Vec<_>, _>>()?;
        let exits = value
            .get("x")
            .and_then(Value::as_list)
            .ok_or(ContactError::Malformed("exit list"))?
            .iter()
            .map(ExitInfo::bt_decode)
            .collect::<Result<Vec<_>, _>>()?;
        let last_updated = value
            .get("u")
            .and_then(Value::as_int)
            .filter(|u| *u >= 0)
            .ok_or(ContactError::Malformed("timestamp"))? as u64;
        let nickname = match value.get("n") {
            Some(v) => Some(
                v.as_bytes()
                    .filter(|b| b.len() <= MAX_NICKNAME_LEN)
                    .and_then(|b| String::from_utf8(b.to_vec()).ok())
                    .ok_or(ContactError::Malformed("nickname"))?,
            ),
            None => None,
        };
        let signature = value
            .get("z")
            .and_then(Value::as_bytes)
            .filter(|s| s.len() == SIG_SIZE)
            .ok_or(ContactError::Malformed("signature"))?
            .to_vec();

        let rc = Self {
            router_id,
            encryption,
            addrs,
            exits,
            last_updated,
            nickname,
            signature,
        };
        if !rc.validate_structure() {
            return Err(ContactError::Malformed("structure limits"));
        }
        Ok(rc)
    }

    /// Bounds checks independent of the signature.
    pub fn validate_structure(&self) -> bool {
        if self.addrs.len() > MAX_ADDRS || self.exits.len() > MAX_EXITS {
            return false;
        }
        if let Some(nick) = &self.nickname {
            if nick.len() > MAX_NICKNAME_LEN || nick.is_empty() {
                return false;
            }
        }
        if !self.signature.is_empty() && self.signature.len() != SIG_SIZE {
            return false;
        }
        true
    }

    /// Gossip acceptance: signature must verify, the update must be strictly
    /// newer than what we hold, and when a registration oracle is enforced
    /// the identity must be registered.
    pub fn accept_gossiped(
        &self,
        stored: Option<&RouterContact>,
        registered: Option<&std::collections::HashSet<RouterId>>,
    ) -> bool {
        if self.verify().is_err() {
            return false;
        }
        if let Some(existing) = stored {
            if self.last_updated <= existing.last_updated {
                return false;
            }
        }
        if let Some(registered) = registered {
            if !registered.contains(&self.router_id) {
                return false;
            }
        }
        true
    }
}

impl PartialEq for RouterContact {
    fn eq(&self, other: &Self) -> bool {
        self.router_id == other.router_id
    }
}

impl Eq for RouterContact {}

impl std::hash::Hash for RouterContact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.router_id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::now_ms;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_addr(last: u8) -> AddressInfo {
        AddressInfo::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, last)), 1090)
    }

    fn test_rc(keypair: &Keypair) -> RouterContact {
        RouterContact::new_signed(
            keypair,
            vec![test_addr(1)],
            vec![ExitInfo::new("10.0.0.0/8".parse().unwrap())],
            Some("relay-one".to_string()),
            now_ms(),
        )
    }

    #[test]
    fn signed_rc_verifies() {
        let rc = test_rc(&Keypair::generate());
        assert!(rc.verify().is_ok());
        assert!(rc.is_public());
    }

    #[test]
    fn encode_decode_verify_roundtrip() {
        // decode(encode(r)) must verify, and the canonical encoding
        // must be byte-identical across runs.
        for _ in 0..10 {
            let rc = test_rc(&Keypair::generate());
            let encoded = rc.encode();
            let decoded = RouterContact::decode(&encoded).expect("decode failed");

            assert!(decoded.verify().is_ok());
            assert_eq!(decoded.encode(), encoded);
            assert_eq!(decoded.router_id, rc.router_id);
            assert_eq!(decoded.encryption, rc.encryption);
            assert_eq!(decoded.addrs, rc.addrs);
            assert_eq!(decoded.last_updated, rc.last_updated);
            assert_eq!(decoded.nickname, rc.nickname);
        }
    }

    #[test]
    fn rc_without_nickname_roundtrips() {
        let keypair = Keypair::generate();
        let rc = RouterContact::new_signed(&keypair, vec![test_addr(9)], vec![], None, now_ms());
        let decoded = RouterContact::decode(&rc.encode()).unwrap();
        assert!(decoded.verify().is_ok());
        assert_eq!(decoded.nickname, None);
    }

    #[test]
    fn private_rc_has_no_addrs() {
        let keypair = Keypair::generate();
        let rc = RouterContact::new_signed(&keypair, vec![], vec![], None, now_ms());
        assert!(!rc.is_public());
        assert!(rc.verify().is_ok());
    }

    #[test]
    fn tampering_breaks_signature() {
        let keypair = Keypair::generate();
        let rc = test_rc(&keypair);

        let mut tampered = rc.clone();
        tampered.addrs[0].port = 9999;
        assert!(tampered.verify().is_err());

        let mut tampered = rc.clone();
        tampered.last_updated += 1;
        assert!(tampered.verify().is_err());

        let mut tampered = rc.clone();
        tampered.encryption[0] ^= 1;
        assert!(tampered.verify().is_err());

        let mut tampered = rc.clone();
        tampered.nickname = Some("evil".to_string());
        assert!(tampered.verify().is_err());

        let mut tampered = rc.clone();
        tampered.signature[0] ^= 1;
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn wrong_signer_rejected() {
        let keypair = Keypair::generate();
        let attacker = Keypair::generate();
        let mut rc = test_rc(&keypair);
        rc.sign(&attacker);
        assert!(rc.verify().is_err());
    }

    #[test]
    fn decode_rejects_malformed() {
        assert!(RouterContact::decode(b"garbage").is_err());
        assert!(RouterContact::decode(b"de").is_err());

        // truncated identity key
        let keypair = Keypair::generate();
        let rc = test_rc(&keypair);
        let bad = rc.bt_encode_with_sig(&rc.signature);
        if let Value::Dict(mut map) = bad {
            map.insert(b"k".to_vec(), Value::Bytes(vec![1; 16]));
            assert!(RouterContact::decode(&Value::Dict(map).encode()).is_err());
        } else {
            unreachable!();
        }
    }

    #[test]
    fn decode_rejects_oversized_nickname() {
        let keypair = Keypair::generate();
        let mut rc = test_rc(&keypair);
        rc.nickname = Some("n".repeat(MAX_NICKNAME_LEN + 1));
        rc.sign(&keypair);
        assert!(RouterContact::decode(&rc.encode()).is_err());
    }

    #[test]
    fn gossip_acceptance_rules() {
        let keypair = Keypair::generate();
        let older = RouterContact::new_signed(&keypair, vec![test_addr(1)], vec![], None, 1_000);
        let newer = RouterContact::new_signed(&keypair, vec![test_addr(2)], vec![], None, 2_000);

        // newer replaces older
        assert!(newer.accept_gossiped(Some(&older), None));
        // older never replaces newer, nor itself
        assert!(!older.accept_gossiped(Some(&newer), None));
        assert!(!older.accept_gossiped(Some(&older), None));

        // registration oracle enforced
        let mut registered = std::collections::HashSet::new();
        assert!(!newer.accept_gossiped(None, Some(&registered)));
        registered.insert(keypair.router_id());
        assert!(newer.accept_gossiped(None, Some(&registered)));

        // broken signature never accepted
        let mut broken = newer.clone();
        broken.signature[10] ^= 0xFF;
        assert!(!broken.accept_gossiped(None, None));
    }

    #[test]
    fn equality_is_by_identity() {
        let keypair = Keypair::generate();
        let a = RouterContact::new_signed(&keypair, vec![test_addr(1)], vec![], None, 1_000);
        let b = RouterContact::new_signed(&keypair, vec![test_addr(2)], vec![], None, 2_000);
        assert_eq!(a, b);
        assert_ne!(a, test_rc(&Keypair::generate()));
    }

    #[test]
    fn exit_info_with_policy_roundtrips() {
        let keypair = Keypair::generate();
        let mut exit = ExitInfo::new("10.0.0.0/8".parse().unwrap());
        exit.policy = Some(TrafficPolicy::new(
            ["10.0.0.0/8".parse().unwrap()].into_iter().collect(),
            Default::default(),
        ));
        let rc =
            RouterContact::new_signed(&keypair, vec![test_addr(1)], vec![exit.clone()], None, 5);
        let decoded = RouterContact::decode(&rc.encode()).unwrap();
        assert!(decoded.verify().is_ok());
        assert_eq!(decoded.exits, vec![exit]);
    }
}
