//! Core Veil protocol types, framing, and constants.
//!
//! This crate provides:
//! - Wire layouts for the four message types (initiation, response, cookie reply, transport data)
//! - Zero-copy parsing of inbound datagrams into borrowed message views
//! - Header writers for outbound messages
//! - IP version/length inference for decrypted payloads
//!
//! All multi-byte integers on the wire are little-endian.

#![forbid(unsafe_code)]

pub mod ip;
pub mod packet;

pub use ip::AddressFamily;
pub use packet::{CookieReply, HandshakeInitiation, HandshakeResponse, Packet, TransportData};

use std::time::Duration;

/// Message type tag of a handshake initiation.
pub const MSG_HANDSHAKE_INITIATION: u32 = 1;
/// Message type tag of a handshake response.
pub const MSG_HANDSHAKE_RESPONSE: u32 = 2;
/// Message type tag of a cookie reply.
pub const MSG_COOKIE_REPLY: u32 = 3;
/// Message type tag of a transport data packet.
pub const MSG_TRANSPORT_DATA: u32 = 4;

/// Initiation: [type 4][sender 4][ephemeral 32][static 48][timestamp 28][mac1 16][mac2 16]
pub const HANDSHAKE_INITIATION_SIZE: usize = 148;
/// Response: [type 4][sender 4][receiver 4][ephemeral 32][empty 16][mac1 16][mac2 16]
pub const HANDSHAKE_RESPONSE_SIZE: usize = 92;
/// Cookie reply: [type 4][receiver 4][nonce 24][cookie 32]
pub const COOKIE_REPLY_SIZE: usize = 64;
/// Transport header: [type 4][receiver 4][counter 8]
pub const DATA_HEADER_SIZE: usize = 16;
/// Poly1305 tag appended to every AEAD ciphertext.
pub const AEAD_TAG_SIZE: usize = 16;
/// Smallest valid transport packet: header plus tag of an empty keepalive.
pub const DATA_MIN_SIZE: usize = DATA_HEADER_SIZE + AEAD_TAG_SIZE;
/// Bytes a transport packet adds on top of its plaintext.
pub const DATA_OVERHEAD: usize = DATA_MIN_SIZE;

/// Largest buffer the engine produces or accepts.
pub const MAX_PACKET_SIZE: usize = 65536 + 64;

/// Size of X25519 keys and of the pre-shared key.
pub const KEY_LEN: usize = 32;
/// Size of the TAI64N timestamp carried in an initiation.
pub const TIMESTAMP_LEN: usize = 12;
/// Size of mac1/mac2 and of a cookie.
pub const MAC_LEN: usize = 16;

/// Session lifetime and rekey thresholds (WireGuard whitepaper, section 6.1).
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13);
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const COOKIE_EXPIRATION_TIME: Duration = Duration::from_secs(120);

/// Upper bound on plaintext packets held while a handshake is in flight.
pub const MAX_QUEUED_PACKETS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("unknown message type: {0}")]
    UnknownType(u32),
    #[error("bad length {len} for message type {kind}")]
    BadLength { kind: u32, len: usize },
    #[error("destination buffer too small: need {needed}, have {available}")]
    DestinationTooSmall { needed: usize, available: usize },
}
