//! X25519 static keys and their text encodings.
//!
//! Keys travel between tools and config files as standard base64 (44
//! characters) or lowercase hex (64 characters). The engine itself only ever
//! sees fixed 32-byte arrays.
//!
//! # Example
//!
//! ```
//! use veil_crypto::keys;
//!
//! let private = keys::generate();
//! let public = keys::derive_public(&private);
//!
//! let encoded = keys::encode_base64(public.as_bytes());
//! assert!(keys::is_valid_encoded(&encoded));
//! assert_eq!(keys::decode_key(&encoded).unwrap(), *public.as_bytes());
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use veil_core::KEY_LEN;
use zeroize::Zeroize;

pub use x25519_dalek::{PublicKey, StaticSecret};

/// Key decoding errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KeyError {
    #[error("invalid base64 encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid hex encoding: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    Length(usize),

    #[error("key is all zeros")]
    AllZero,
}

/// Generate a fresh private key from the OS CSPRNG, clamped for X25519.
pub fn generate() -> StaticSecret {
    let mut bytes = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut bytes);
    clamp(&mut bytes);
    let secret = StaticSecret::from(bytes);
    bytes.zeroize();
    secret
}

/// Derive the public key for a private key.
pub fn derive_public(private: &StaticSecret) -> PublicKey {
    PublicKey::from(private)
}

/// True iff `encoded` decodes (base64 or hex) to a usable 32-byte key.
pub fn is_valid_encoded(encoded: &str) -> bool {
    decode_key(encoded).is_ok()
}

/// Decode a key from standard base64 or hex.
///
/// Hex is tried first when the input is exactly 64 hex digits; anything else
/// is treated as base64.
pub fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let encoded = encoded.trim();
    let bytes = if encoded.len() == KEY_LEN * 2 && encoded.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex::decode(encoded)?
    } else {
        STANDARD.decode(encoded)?
    };

    let key: [u8; KEY_LEN] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::Length(bytes.len()))?;
    if key.iter().all(|&b| b == 0) {
        return Err(KeyError::AllZero);
    }
    Ok(key)
}

pub fn encode_base64(key: &[u8; KEY_LEN]) -> String {
    STANDARD.encode(key)
}

pub fn encode_hex(key: &[u8; KEY_LEN]) -> String {
    hex::encode(key)
}

fn clamp(bytes: &mut [u8; KEY_LEN]) {
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
}

/// The remote side of a tunnel: its static public key and the optional
/// pre-shared key mixed into every handshake.
#[derive(Clone)]
pub struct PeerIdentity {
    pub public: PublicKey,
    pub preshared_key: Option<[u8; KEY_LEN]>,
}

impl PeerIdentity {
    pub fn new(public: PublicKey, preshared_key: Option<[u8; KEY_LEN]>) -> Self {
        Self {
            public,
            preshared_key,
        }
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("public", &encode_base64(self.public.as_bytes()))
            .field("preshared_key", &self.preshared_key.map(|_| "<redacted>"))
            .finish()
    }
}

impl Drop for PeerIdentity {
    fn drop(&mut self) {
        if let Some(psk) = self.preshared_key.as_mut() {
            psk.zeroize();
        }
    }
}
