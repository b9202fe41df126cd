//! Borrowed views over the four wire message types.
//!
//! Parsing never copies: each view borrows its fields from the source
//! datagram. Writers take a view and lay it out into a caller buffer, leaving
//! mac1/mac2 zeroed for the handshake layer to fill in.

use crate::{
    WireError, AEAD_TAG_SIZE, COOKIE_REPLY_SIZE, DATA_HEADER_SIZE, DATA_MIN_SIZE,
    HANDSHAKE_INITIATION_SIZE, HANDSHAKE_RESPONSE_SIZE, KEY_LEN, MAC_LEN,
    MSG_COOKIE_REPLY, MSG_HANDSHAKE_INITIATION, MSG_HANDSHAKE_RESPONSE, MSG_TRANSPORT_DATA,
    TIMESTAMP_LEN,
};

/// Size of the XChaCha20 nonce carried by a cookie reply.
pub const COOKIE_NONCE_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeInitiation<'a> {
    pub sender_index: u32,
    pub unencrypted_ephemeral: &'a [u8; KEY_LEN],
    pub encrypted_static: &'a [u8; KEY_LEN + AEAD_TAG_SIZE],
    pub encrypted_timestamp: &'a [u8; TIMESTAMP_LEN + AEAD_TAG_SIZE],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeResponse<'a> {
    pub sender_index: u32,
    pub receiver_index: u32,
    pub unencrypted_ephemeral: &'a [u8; KEY_LEN],
    pub encrypted_nothing: &'a [u8; AEAD_TAG_SIZE],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CookieReply<'a> {
    pub receiver_index: u32,
    pub nonce: &'a [u8; COOKIE_NONCE_LEN],
    pub encrypted_cookie: &'a [u8; MAC_LEN + AEAD_TAG_SIZE],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportData<'a> {
    pub receiver_index: u32,
    pub counter: u64,
    /// Ciphertext followed by the AEAD tag.
    pub encrypted: &'a [u8],
}

/// A parsed inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    HandshakeInitiation(HandshakeInitiation<'a>),
    HandshakeResponse(HandshakeResponse<'a>),
    CookieReply(CookieReply<'a>),
    TransportData(TransportData<'a>),
}

impl<'a> Packet<'a> {
    /// Classify and split a datagram. Handshake messages must have their exact
    /// size; transport packets must at least hold a header and a tag.
    pub fn parse(src: &'a [u8]) -> Result<Self, WireError> {
        if src.len() < 4 {
            return Err(WireError::TooShort(src.len()));
        }
        let kind = read_u32(src, 0)?;
        let expected = match kind {
            MSG_HANDSHAKE_INITIATION => Some(HANDSHAKE_INITIATION_SIZE),
            MSG_HANDSHAKE_RESPONSE => Some(HANDSHAKE_RESPONSE_SIZE),
            MSG_COOKIE_REPLY => Some(COOKIE_REPLY_SIZE),
            MSG_TRANSPORT_DATA => None,
            other => return Err(WireError::UnknownType(other)),
        };
        match expected {
            Some(len) if src.len() != len => {
                return Err(WireError::BadLength {
                    kind,
                    len: src.len(),
                })
            }
            None if src.len() < DATA_MIN_SIZE => {
                return Err(WireError::BadLength {
                    kind,
                    len: src.len(),
                })
            }
            _ => {}
        }

        Ok(match kind {
            MSG_HANDSHAKE_INITIATION => Packet::HandshakeInitiation(HandshakeInitiation {
                sender_index: read_u32(src, 4)?,
                unencrypted_ephemeral: field(src, 8)?,
                encrypted_static: field(src, 40)?,
                encrypted_timestamp: field(src, 88)?,
            }),
            MSG_HANDSHAKE_RESPONSE => Packet::HandshakeResponse(HandshakeResponse {
                sender_index: read_u32(src, 4)?,
                receiver_index: read_u32(src, 8)?,
                unencrypted_ephemeral: field(src, 12)?,
                encrypted_nothing: field(src, 44)?,
            }),
            MSG_COOKIE_REPLY => Packet::CookieReply(CookieReply {
                receiver_index: read_u32(src, 4)?,
                nonce: field(src, 8)?,
                encrypted_cookie: field(src, 32)?,
            }),
            _ => Packet::TransportData(TransportData {
                receiver_index: read_u32(src, 4)?,
                counter: read_u64(src, 8)?,
                encrypted: &src[DATA_HEADER_SIZE..],
            }),
        })
    }

    /// Wire type tag of this message.
    pub fn kind(&self) -> u32 {
        match self {
            Packet::HandshakeInitiation(_) => MSG_HANDSHAKE_INITIATION,
            Packet::HandshakeResponse(_) => MSG_HANDSHAKE_RESPONSE,
            Packet::CookieReply(_) => MSG_COOKIE_REPLY,
            Packet::TransportData(_) => MSG_TRANSPORT_DATA,
        }
    }
}

/// Splits a handshake message into the bytes covered by mac1, mac1, and mac2.
///
/// mac1 covers everything before it; mac2 covers everything before mac2
/// (i.e. the first slice followed by mac1).
pub fn mac_fields(msg: &[u8]) -> Option<(&[u8], &[u8; MAC_LEN], &[u8; MAC_LEN])> {
    let mac2_at = msg.len().checked_sub(MAC_LEN)?;
    let mac1_at = mac2_at.checked_sub(MAC_LEN)?;
    let mac1 = field(msg, mac1_at).ok()?;
    let mac2 = field(msg, mac2_at).ok()?;
    Some((&msg[..mac1_at], mac1, mac2))
}

/// Lays out an initiation in `dst[..148]` with both MACs zeroed.
pub fn write_initiation(dst: &mut [u8], msg: &HandshakeInitiation<'_>) -> Result<usize, WireError> {
    let out = reserve(dst, HANDSHAKE_INITIATION_SIZE)?;
    out[0..4].copy_from_slice(&MSG_HANDSHAKE_INITIATION.to_le_bytes());
    out[4..8].copy_from_slice(&msg.sender_index.to_le_bytes());
    out[8..40].copy_from_slice(msg.unencrypted_ephemeral);
    out[40..88].copy_from_slice(msg.encrypted_static);
    out[88..116].copy_from_slice(msg.encrypted_timestamp);
    out[116..148].fill(0);
    Ok(HANDSHAKE_INITIATION_SIZE)
}

/// Lays out a response in `dst[..92]` with both MACs zeroed.
pub fn write_response(dst: &mut [u8], msg: &HandshakeResponse<'_>) -> Result<usize, WireError> {
    let out = reserve(dst, HANDSHAKE_RESPONSE_SIZE)?;
    out[0..4].copy_from_slice(&MSG_HANDSHAKE_RESPONSE.to_le_bytes());
    out[4..8].copy_from_slice(&msg.sender_index.to_le_bytes());
    out[8..12].copy_from_slice(&msg.receiver_index.to_le_bytes());
    out[12..44].copy_from_slice(msg.unencrypted_ephemeral);
    out[44..60].copy_from_slice(msg.encrypted_nothing);
    out[60..92].fill(0);
    Ok(HANDSHAKE_RESPONSE_SIZE)
}

/// Lays out a cookie reply in `dst[..64]`.
pub fn write_cookie_reply(dst: &mut [u8], msg: &CookieReply<'_>) -> Result<usize, WireError> {
    let out = reserve(dst, COOKIE_REPLY_SIZE)?;
    out[0..4].copy_from_slice(&MSG_COOKIE_REPLY.to_le_bytes());
    out[4..8].copy_from_slice(&msg.receiver_index.to_le_bytes());
    out[8..32].copy_from_slice(msg.nonce);
    out[32..64].copy_from_slice(msg.encrypted_cookie);
    Ok(COOKIE_REPLY_SIZE)
}

/// Writes the 16-byte transport header at the start of `dst`.
pub fn write_transport_header(
    dst: &mut [u8],
    receiver_index: u32,
    counter: u64,
) -> Result<(), WireError> {
    let out = reserve(dst, DATA_HEADER_SIZE)?;
    out[0..4].copy_from_slice(&MSG_TRANSPORT_DATA.to_le_bytes());
    out[4..8].copy_from_slice(&receiver_index.to_le_bytes());
    out[8..16].copy_from_slice(&counter.to_le_bytes());
    Ok(())
}

fn reserve(dst: &mut [u8], needed: usize) -> Result<&mut [u8], WireError> {
    let available = dst.len();
    dst.get_mut(..needed)
        .ok_or(WireError::DestinationTooSmall { needed, available })
}

fn field<const N: usize>(src: &[u8], at: usize) -> Result<&[u8; N], WireError> {
    src.get(at..at + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(WireError::TooShort(src.len()))
}

fn read_u32(src: &[u8], at: usize) -> Result<u32, WireError> {
    field::<4>(src, at).map(|b| u32::from_le_bytes(*b))
}

fn read_u64(src: &[u8], at: usize) -> Result<u64, WireError> {
    field::<8>(src, at).map(|b| u64::from_le_bytes(*b))
}
