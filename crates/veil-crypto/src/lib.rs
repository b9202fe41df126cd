//! Cryptographic primitives for Veil.
//!
//! This crate provides:
//! - X25519 static keys and their base64/hex encodings
//! - The Noise IKpsk2 handshake in the WireGuard message format
//! - Transport sessions with explicit counters and replay protection
//! - mac1/mac2 admission checks and cookie replies for load shedding
//!
//! # Design
//!
//! Uses `Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s`, which provides:
//! - Mutual authentication (the initiator already knows the responder's key)
//! - Optional symmetric hardening through a preshared key
//! - Forward secrecy (ephemeral keys per session)
//!
//! For UDP transport the counter travels in the clear and doubles as the
//! nonce, so out-of-order packets still decrypt.

#![forbid(unsafe_code)]

pub mod cookie;
pub mod handshake;
pub mod keys;
pub mod primitives;
pub mod replay;
pub mod session;

pub use cookie::{AdmissionError, RateLimiter};
pub use handshake::{Handshake, HandshakeError, HandshakeState, Tai64N};
pub use keys::{KeyError, PeerIdentity, PublicKey, StaticSecret};
pub use replay::ReplayWindow;
pub use session::{Session, SessionError};
