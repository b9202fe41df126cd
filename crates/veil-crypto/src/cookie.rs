//! Handshake admission control: mac1 verification, load detection, and
//! cookie replies.
//!
//! Every handshake message must carry a mac1 keyed by our public key, which
//! proves the sender knows who it is talking to. When more handshakes arrive
//! per second than the configured limit, a message is also required to carry
//! a mac2 keyed by a cookie bound to its source address; senders without one
//! get a cookie reply instead of a handshake.

use crate::primitives::{self, constant_time_eq, LABEL_COOKIE, LABEL_MAC1};
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;
use veil_core::packet::{mac_fields, write_cookie_reply, COOKIE_NONCE_LEN};
use veil_core::{
    CookieReply, Packet, WireError, AEAD_TAG_SIZE, COOKIE_EXPIRATION_TIME, COOKIE_REPLY_SIZE,
    KEY_LEN, MAC_LEN,
};
use x25519_dalek::PublicKey;
use zeroize::Zeroize;

const RESET_PERIOD: Duration = Duration::from_secs(1);

/// Reasons an inbound datagram was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("malformed packet: {0}")]
    Wire(#[from] WireError),

    #[error("invalid mac1")]
    InvalidMac,

    /// Under load without a valid mac2; a cookie reply of this many bytes
    /// was written to the destination buffer.
    #[error("under load, cookie reply written ({0} bytes)")]
    CookieReply(usize),

    #[error("under load and no room for a cookie reply")]
    DestinationTooSmall,
}

/// Per-tunnel handshake rate limiter.
pub struct RateLimiter {
    mac1_key: [u8; KEY_LEN],
    cookie_key: [u8; KEY_LEN],
    secret: [u8; KEY_LEN],
    secret_born: Instant,
    limit: u64,
    count: u64,
    last_reset: Instant,
}

impl RateLimiter {
    /// `local_public` is the key peers address their handshakes to; `limit` is
    /// the number of handshakes per second accepted without a cookie.
    pub fn new(local_public: &PublicKey, limit: u64, now: Instant) -> Self {
        Self {
            mac1_key: primitives::hash(&[LABEL_MAC1, local_public.as_bytes()]),
            cookie_key: primitives::hash(&[LABEL_COOKIE, local_public.as_bytes()]),
            secret: random_secret(),
            secret_born: now,
            limit,
            count: 0,
            last_reset: now,
        }
    }

    /// Zero the handshake counter once per second.
    pub fn reset_count(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_reset) >= RESET_PERIOD {
            self.count = 0;
            self.last_reset = now;
        }
    }

    pub fn is_under_load(&self) -> bool {
        self.count >= self.limit
    }

    /// Parse `src` and admit it.
    ///
    /// Transport packets and cookie replies pass through untouched. Handshake
    /// messages must carry a valid mac1, and under load a valid mac2 for
    /// `src_addr`; without one a cookie reply is written into `dst`. When the
    /// host does not know the source address, load shedding is skipped.
    pub fn verify_packet<'a>(
        &mut self,
        src_addr: Option<IpAddr>,
        src: &'a [u8],
        dst: &mut [u8],
        now: Instant,
    ) -> Result<Packet<'a>, AdmissionError> {
        let packet = Packet::parse(src)?;
        let sender_index = match &packet {
            Packet::HandshakeInitiation(p) => p.sender_index,
            Packet::HandshakeResponse(p) => p.sender_index,
            _ => return Ok(packet),
        };

        let (covered, mac1, mac2) =
            mac_fields(src).ok_or(WireError::TooShort(src.len()))?;
        let expected = primitives::mac(&self.mac1_key, &[covered]);
        if !constant_time_eq(&expected, mac1) {
            return Err(AdmissionError::InvalidMac);
        }

        self.reset_count(now);
        let under_load = self.is_under_load();
        self.count = self.count.saturating_add(1);

        if let (true, Some(addr)) = (under_load, src_addr) {
            let cookie = self.cookie_for(addr, now);
            let expected = primitives::mac(&cookie, &[covered, mac1]);
            if !constant_time_eq(&expected, mac2) {
                trace!(%addr, "handshake under load without valid mac2, sending cookie");
                let n = self.write_cookie_reply(sender_index, &cookie, mac1, dst)?;
                return Err(AdmissionError::CookieReply(n));
            }
        }

        Ok(packet)
    }

    /// The cookie a sender at `addr` must key its mac2 with. The secret
    /// rotates every two minutes.
    fn cookie_for(&mut self, addr: IpAddr, now: Instant) -> [u8; MAC_LEN] {
        if now.saturating_duration_since(self.secret_born) >= COOKIE_EXPIRATION_TIME {
            self.secret.zeroize();
            self.secret = random_secret();
            self.secret_born = now;
        }
        match addr {
            IpAddr::V4(a) => primitives::mac(&self.secret, &[&a.octets()]),
            IpAddr::V6(a) => primitives::mac(&self.secret, &[&a.octets()]),
        }
    }

    fn write_cookie_reply(
        &self,
        receiver_index: u32,
        cookie: &[u8; MAC_LEN],
        mac1: &[u8; MAC_LEN],
        dst: &mut [u8],
    ) -> Result<usize, AdmissionError> {
        if dst.len() < COOKIE_REPLY_SIZE {
            return Err(AdmissionError::DestinationTooSmall);
        }
        let mut nonce = [0u8; COOKIE_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut encrypted = [0u8; MAC_LEN + AEAD_TAG_SIZE];
        encrypted[..MAC_LEN].copy_from_slice(cookie);
        let tag = XChaCha20Poly1305::new(Key::from_slice(&self.cookie_key))
            .encrypt_in_place_detached(XNonce::from_slice(&nonce), mac1, &mut encrypted[..MAC_LEN])
            .map_err(|_| AdmissionError::DestinationTooSmall)?;
        encrypted[MAC_LEN..].copy_from_slice(&tag);

        Ok(write_cookie_reply(
            dst,
            &CookieReply {
                receiver_index,
                nonce: &nonce,
                encrypted_cookie: &encrypted,
            },
        )?)
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Decrypt the cookie carried by a reply to a message whose mac1 was `mac1`.
/// `cookie_key` is `HASH("cookie--" || responder_public)`.
pub fn open_cookie_reply(
    cookie_key: &[u8; KEY_LEN],
    mac1: &[u8; MAC_LEN],
    reply: &CookieReply<'_>,
) -> Option<[u8; MAC_LEN]> {
    let mut cookie = [0u8; MAC_LEN];
    cookie.copy_from_slice(&reply.encrypted_cookie[..MAC_LEN]);
    let tag = chacha20poly1305::Tag::from_slice(&reply.encrypted_cookie[MAC_LEN..]);
    XChaCha20Poly1305::new(Key::from_slice(cookie_key))
        .decrypt_in_place_detached(XNonce::from_slice(reply.nonce), mac1, &mut cookie, tag)
        .ok()?;
    Some(cookie)
}

fn random_secret() -> [u8; KEY_LEN] {
    let mut secret = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut secret);
    secret
}
