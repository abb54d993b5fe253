//! # Router Identity and Long-Term Keys
//!
//! This module defines the identity types used throughout mixroute:
//!
//! - [`RouterId`]: 32-byte Ed25519 public key serving as the relay's unique
//!   identifier and DHT routing key
//! - [`Keypair`]: the node's long-term keys — an Ed25519 signing half and an
//!   X25519 encryption half used for per-hop key agreement
//!
//! ## Identity Model
//!
//! Identity = Ed25519 public key. The same 32 bytes name the relay on the
//! wire, key its contact file on disk, and place it in XOR-metric space for
//! closest-k selection. A *separate* X25519 key is what path builders DH
//! against; it is carried in the signed router contact.
//!
//! ## Key Files
//!
//! Long-term keys live at `<root>/identity.key` and `<root>/encryption.key`.
//! The identity file is the raw 64-byte secret (seed followed by public
//! key); a raw 32-byte seed and a bencoded `{"s": seed}` dict are accepted
//! as fallbacks. Unreadable key files are backed up aside and regenerated
//! rather than aborting startup.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tracing::warn;

use crate::bencode::{self, DictBuilder, Value};
use crate::crypto;

/// Returns current time as milliseconds since Unix epoch.
/// Used for timestamp generation in signed records.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Identity file name under the node root.
pub const IDENTITY_KEY_FILE: &str = "identity.key";

/// Encryption key file name under the node root.
pub const ENCRYPTION_KEY_FILE: &str = "encryption.key";

// ============================================================================
// RouterId
// ============================================================================

/// A relay's identity: its 32-byte Ed25519 public key, doubling as its
/// DHT routing key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RouterId([u8; 32]);

impl RouterId {
    /// The all-zero id, used as the "no upstream" sentinel on terminal hops.
    pub const ZERO: RouterId = RouterId([0u8; 32]);

    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// XOR distance to another id in Kademlia metric space.
    #[inline]
    pub fn xor_distance(&self, other: &RouterId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// True if these bytes form a valid Ed25519 public key point.
    pub fn is_valid(&self) -> bool {
        if self.is_zero() || self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        ed25519_dalek::VerifyingKey::from_bytes(&self.0).is_ok()
    }
}

/// Compare two XOR distances lexicographically.
///
/// Used to order candidate relays by closeness to a DHT key.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

impl std::fmt::Debug for RouterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RouterId({})", self.short())
    }
}

impl std::fmt::Display for RouterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for RouterId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for RouterId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Keypair
// ============================================================================

/// A node's long-term keys: the Ed25519 identity half and the X25519
/// encryption half path builders DH against.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
    encryption: x25519_dalek::StaticSecret,
}

impl Keypair {
    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
            encryption: x25519_dalek::StaticSecret::from(crypto::randbytes::<32>()),
        }
    }

    pub fn from_seeds(identity_seed: &[u8; 32], encryption_seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(identity_seed),
            encryption: x25519_dalek::StaticSecret::from(*encryption_seed),
        }
    }

    pub fn router_id(&self) -> RouterId {
        RouterId(self.signing.verifying_key().to_bytes())
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn encryption_secret(&self) -> &x25519_dalek::StaticSecret {
        &self.encryption
    }

    /// The X25519 public key advertised in our router contact.
    pub fn encryption_public(&self) -> [u8; 32] {
        x25519_dalek::PublicKey::from(&self.encryption).to_bytes()
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; crypto::SIG_SIZE] {
        crypto::sign(&self.signing, msg)
    }

    /// Load both long-term keys from `<root>`, generating and persisting any
    /// that are missing. An unreadable key file is moved aside to
    /// `<name>.bak` and replaced, so a damaged file cannot brick the node.
    pub fn load_or_generate(root: &Path) -> Result<Self> {
        let identity_seed = load_or_generate_seed(&root.join(IDENTITY_KEY_FILE), true)?;
        let encryption_seed = load_or_generate_seed(&root.join(ENCRYPTION_KEY_FILE), false)?;
        Ok(Self::from_seeds(&identity_seed, &encryption_seed))
    }

    /// Persist both keys under `<root>`. The identity file carries the raw
    /// 64-byte secret (seed then public key); the encryption file the raw
    /// 32-byte seed.
    pub fn save(&self, root: &Path) -> Result<()> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("creating key root {}", root.display()))?;
        let mut identity = Vec::with_capacity(64);
        identity.extend_from_slice(&self.signing.to_bytes());
        identity.extend_from_slice(&self.signing.verifying_key().to_bytes());
        std::fs::write(root.join(IDENTITY_KEY_FILE), &identity)
            .context("writing identity key")?;
        std::fs::write(
            root.join(ENCRYPTION_KEY_FILE),
            self.encryption.to_bytes(),
        )
        .context("writing encryption key")?;
        Ok(())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("router_id", &self.router_id().short())
            .finish_non_exhaustive()
    }
}

/// Parse a key file: raw 64-byte secret, raw 32-byte seed, or a bencoded
/// `{"s": seed}` dict.
pub fn parse_key_file(data: &[u8]) -> Result<[u8; 32]> {
    match data.len() {
        64 | 32 => {
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&data[..32]);
            Ok(seed)
        }
        _ => {
            let value = bencode::decode(data).context("key file is not raw or bencoded")?;
            let seed = value
                .get("s")
                .and_then(Value::as_bytes)
                .context("bencoded key file missing \"s\"")?;
            if seed.len() != 32 {
                bail!("bencoded key seed has length {}", seed.len());
            }
            let mut out = [0u8; 32];
            out.copy_from_slice(seed);
            Ok(out)
        }
    }
}

/// Canonical bencoded form of a key seed, the fallback file format.
pub fn encode_key_file(seed: &[u8; 32]) -> Vec<u8> {
    DictBuilder::new().insert_bytes("s", seed).build().encode()
}

fn load_or_generate_seed(path: &Path, identity: bool) -> Result<[u8; 32]> {
    if let Ok(data) = std::fs::read(path) {
        match parse_key_file(&data) {
            Ok(seed) => return Ok(seed),
            Err(err) => {
                // Move the damaged file aside; a fresh key is better than a
                // node that cannot start.
                let backup = path.with_extension("key.bak");
                warn!(
                    file = %path.display(),
                    error = %err,
                    "unreadable key file, backing up and regenerating"
                );
                let _ = std::fs::rename(path, &backup);
            }
        }
    }

    let seed = crypto::randbytes::<32>();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating key directory {}", parent.display()))?;
    }
    let contents: Vec<u8> = if identity {
        let signing = SigningKey::from_bytes(&seed);
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&seed);
        buf.extend_from_slice(&signing.verifying_key().to_bytes());
        buf
    } else {
        seed.to_vec()
    };
    std::fs::write(path, contents)
        .with_context(|| format!("writing key file {}", path.display()))?;
    Ok(seed)
}
