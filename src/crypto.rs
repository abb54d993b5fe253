//! # Cryptographic Primitives
//!
//! This module provides the crypto the path plane is built from:
//!
//! - **Signatures**: Ed25519 sign and verify over canonical encodings
//! - **Key agreement**: X25519 Diffie-Hellman for per-hop shared secrets
//! - **Onion step**: XChaCha20 keystream XOR with deterministic nonce
//!   mutation, used identically for encrypt and decrypt
//! - **Digest**: SHA-512 truncated to 32 bytes for nonce-mutation constants
//! - **Randomness**: OS CSPRNG helpers
//!
//! ## The onion step
//!
//! [`onion`] XORs the XChaCha20 keystream for `(shared, nonce)` over a buffer
//! in place and returns `nonce ^ nonce_xor`. Each hop along a path applies
//! exactly this operation, so an observer at one hop cannot correlate its
//! ciphertext or nonce with an adjacent hop's, while the endpoints can
//! reconstruct the exact nonce used at any layer by walking the XOR chain.

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::XChaCha20;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};

/// Size of an onion-layer symmetric key.
pub const SHARED_SIZE: usize = 32;

/// Size of the outer envelope nonce (XChaCha20).
pub const NONCE_SIZE: usize = 24;

/// Size of the nonce-mutation constant derived from a shared secret.
pub const NONCE_XOR_SIZE: usize = 32;

/// Size of an Ed25519 signature.
pub const SIG_SIZE: usize = 64;

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures.
/// Used everywhere mixroute verifies Ed25519 signatures (router contacts,
/// exit authorizations, etc.).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty or all zero).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Core Types
// ============================================================================

/// A 32-byte symmetric key shared with one hop, produced by X25519.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SharedSecret([u8; SHARED_SIZE]);

impl SharedSecret {
    #[inline]
    pub fn from_bytes(bytes: [u8; SHARED_SIZE]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; SHARED_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        write!(f, "SharedSecret(..)")
    }
}

/// The 24-byte outer nonce of a path envelope.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SymmNonce([u8; NONCE_SIZE]);

impl SymmNonce {
    #[inline]
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Fresh random nonce.
    pub fn random() -> Self {
        Self(randbytes())
    }

    /// XOR with the leading 24 bytes of a mutation constant.
    #[inline]
    pub fn xored(&self, xor: &NonceXor) -> Self {
        let mut out = self.0;
        for (byte, x) in out.iter_mut().zip(xor.0.iter()) {
            *byte ^= x;
        }
        Self(out)
    }
}

impl std::fmt::Debug for SymmNonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmNonce({})", &hex::encode(self.0)[..12])
    }
}

/// The 32-byte nonce-mutation constant for one hop: `SHA-512(shared)[..32]`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NonceXor([u8; NONCE_XOR_SIZE]);

impl NonceXor {
    #[inline]
    pub fn from_bytes(bytes: [u8; NONCE_XOR_SIZE]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NONCE_XOR_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for NonceXor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NonceXor({})", &hex::encode(self.0)[..12])
    }
}

// ============================================================================
// Signatures
// ============================================================================

/// Sign a message with an Ed25519 signing key.
pub fn sign(key: &SigningKey, msg: &[u8]) -> [u8; SIG_SIZE] {
    key.sign(msg).to_bytes()
}

/// Verify an Ed25519 signature under a raw 32-byte public key.
pub fn verify(pubkey: &[u8; 32], msg: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
    if signature.is_empty() || signature.iter().all(|&b| b == 0) {
        return Err(SignatureError::Missing);
    }
    if signature.len() != SIG_SIZE {
        return Err(SignatureError::InvalidLength);
    }
    let key = VerifyingKey::from_bytes(pubkey).map_err(|_| SignatureError::InvalidPublicKey)?;
    let sig_bytes: [u8; SIG_SIZE] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);
    key.verify(msg, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Key Agreement
// ============================================================================

/// X25519 Diffie-Hellman between our secret and a peer's public key.
pub fn dh(our_secret: &x25519_dalek::StaticSecret, their_public: &[u8; 32]) -> SharedSecret {
    let public = x25519_dalek::PublicKey::from(*their_public);
    SharedSecret(our_secret.diffie_hellman(&public).to_bytes())
}

/// Derive the nonce-mutation constant for a hop: `SHA-512(shared)[..32]`.
pub fn hash_shared(shared: &SharedSecret) -> NonceXor {
    let digest = Sha512::digest(shared.as_bytes());
    let mut out = [0u8; NONCE_XOR_SIZE];
    out.copy_from_slice(&digest[..NONCE_XOR_SIZE]);
    NonceXor(out)
}

// ============================================================================
// Onion Step
// ============================================================================

/// One onion layer: XOR the XChaCha20 keystream for `(shared, nonce)` over
/// `buf` in place, and return the mutated nonce `nonce ^ nonce_xor`.
///
/// Involutive per hop: applying the same call to the resulting ciphertext
/// with the same `(shared, nonce)` recovers the plaintext and computes the
/// same outgoing nonce.
pub fn onion(
    buf: &mut [u8],
    shared: &SharedSecret,
    nonce: &SymmNonce,
    nonce_xor: &NonceXor,
) -> SymmNonce {
    xor_keystream(buf, shared, nonce, 0);
    nonce.xored(nonce_xor)
}

/// XOR the XChaCha20 keystream for `(shared, nonce)` over `buf`, starting at
/// `offset` bytes into the stream. Build-record layering needs the offset to
/// line slots up across the rotation each hop performs.
pub fn xor_keystream(buf: &mut [u8], shared: &SharedSecret, nonce: &SymmNonce, offset: u64) {
    let mut cipher = XChaCha20::new(shared.as_bytes().into(), nonce.as_bytes().into());
    if offset > 0 {
        cipher.seek(offset);
    }
    cipher.apply_keystream(buf);
}

// ============================================================================
// Randomness
// ============================================================================

/// Fill a fixed-size array from the OS CSPRNG.
pub fn randbytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Fill a slice from the OS CSPRNG.
pub fn fill_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// A random 64-bit integer.
pub fn randint() -> u64 {
    OsRng.next_u64()
}
