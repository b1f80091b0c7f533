//! Cryptographic helpers for HNS.
//!
//! Provides:
//!   1. SHA-256 digests and the truncated 32-bit checksum used in headers
//!      and integrity tags
//!   2. Key derivation from a configured passphrase
//!   3. AES-256-CBC + PKCS7 sealing of layer-2 bodies
//!
//! A sealed body is `IV(16) || AES-256-CBC(tag(4) || plaintext)`, where
//! `tag` is the truncated SHA-256 of the plaintext. The tag is checked after
//! decryption and before any byte of the plaintext is interpreted.
//!
//! Key material derives ZeroizeOnDrop.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::wire::{IV_LEN, KEY_LEN, TAG_LEN};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

// ── Hashing ───────────────────────────────────────────────────────────────────

/// SHA-256 digest of a byte slice.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// First four digest bytes read as a little-endian u32.
///
/// Used for the outer datagram checksum and for the inner integrity tag.
pub fn checksum32(data: &[u8]) -> u32 {
    let digest = sha256(data);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

// ── Keys ──────────────────────────────────────────────────────────────────────

/// A 256-bit symmetric key: relay pre-shared key or per-session secret.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive a key by hashing a configured passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self(sha256(passphrase.as_bytes()))
    }

    /// Fresh random key from the thread RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Random 28-bit nonce for the header word.
pub fn random_nonce() -> u32 {
    rand::thread_rng().next_u32() >> 4
}

// ── Sealing ───────────────────────────────────────────────────────────────────

/// Encrypt `plaintext` under `key` with a fresh IV and a leading tag.
pub fn seal(key: &SecretKey, plaintext: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    seal_with_iv(key, &iv, plaintext)
}

fn seal_with_iv(key: &SecretKey, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(TAG_LEN + plaintext.len());
    inner.extend_from_slice(&checksum32(plaintext).to_le_bytes());
    inner.extend_from_slice(plaintext);

    let ciphertext =
        Aes256CbcEnc::new(key.as_bytes().into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(&inner);
    inner.zeroize();

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypt a sealed body and verify its tag. Returns the plaintext after the tag.
pub fn open(key: &SecretKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    // IV plus at least one cipher block.
    if sealed.len() < IV_LEN + 16 || (sealed.len() - IV_LEN) % 16 != 0 {
        return Err(CryptoError::BadLength(sealed.len()));
    }
    let (iv, ciphertext) = sealed.split_at(IV_LEN);
    let mut inner = Aes256CbcDec::new_from_slices(key.as_bytes(), iv)
        .map_err(|_| CryptoError::BadLength(sealed.len()))?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::BadPadding)?;

    if inner.len() < TAG_LEN {
        inner.zeroize();
        return Err(CryptoError::BadLength(inner.len()));
    }
    let tag = u32::from_le_bytes([inner[0], inner[1], inner[2], inner[3]]);
    let plaintext = inner.split_off(TAG_LEN);
    if checksum32(&plaintext) != tag {
        return Err(CryptoError::TagMismatch);
    }
    Ok(plaintext)
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Integrity failures. The datagram carrying them is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("sealed body has invalid length {0}")]
    BadLength(usize),

    #[error("invalid PKCS7 padding")]
    BadPadding,

    #[error("inner integrity tag mismatch")]
    TagMismatch,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
