//! Noise IKpsk2 handshake in the WireGuard message format.
//!
//! Pattern: `Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s`, prologue
//! `WireGuard v1 zx2c4 Jason@zx2c4.com`.
//!
//! # Handshake Flow
//!
//! ```text
//! Initiator                                  Responder
//!     |                                           |
//!     |  -> e, es, s, ss, {timestamp}             |  initiation (148 bytes)
//!     |------------------------------------------>|
//!     |                                           |
//!     |  <- e, ee, se, psk, {}                    |  response (92 bytes)
//!     |<------------------------------------------|
//!     |                                           |
//!     [     transport keys split from chaining key    ]
//! ```
//!
//! The initiator knows the responder's static key in advance (IK), so the
//! first message already authenticates the initiator. The encrypted TAI64N
//! timestamp lets the responder reject replayed initiations without keeping
//! per-message state.
//!
//! Every handshake message ends with mac1 (keyed by the recipient's public
//! key) and mac2 (keyed by a cookie from the recipient, or zero).

use crate::cookie::open_cookie_reply;
use crate::keys::{PeerIdentity, PublicKey, StaticSecret};
use crate::primitives::{
    self, constant_time_eq, kdf1, kdf2, kdf3, LABEL_COOKIE, LABEL_MAC1,
};
use crate::session::Session;
use rand::rngs::OsRng;
use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;
use veil_core::packet::{write_initiation, write_response};
use veil_core::{
    CookieReply, HandshakeInitiation, HandshakeResponse, WireError, AEAD_TAG_SIZE,
    COOKIE_EXPIRATION_TIME, HANDSHAKE_INITIATION_SIZE, HANDSHAKE_RESPONSE_SIZE, KEY_LEN, MAC_LEN,
    TIMESTAMP_LEN,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";
const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";

/// TAI64 label for the Unix epoch: 2^62 plus the 1970 leap-second offset.
const TAI64_BASE: u64 = (1u64 << 62) + 10;

/// Handshake errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("destination buffer too small: need {needed}, have {available}")]
    DestinationTooSmall { needed: usize, available: usize },

    #[error("handshake authentication failed")]
    Authentication,

    #[error("initiation timestamp is not newer than the last accepted one")]
    Replay,

    #[error("no initiation pending for receiver index {0:#x}")]
    UnexpectedMessage(u32),

    #[error("cookie reply could not be decrypted")]
    InvalidCookie,

    #[error("malformed message: {0}")]
    Malformed(WireError),
}

impl From<WireError> for HandshakeError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::DestinationTooSmall { needed, available } => {
                HandshakeError::DestinationTooSmall { needed, available }
            }
            other => HandshakeError::Malformed(other),
        }
    }
}

/// External TAI64N label: big-endian seconds then big-endian nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Tai64N {
    secs: u64,
    nanos: u32,
}

impl Tai64N {
    pub fn from_unix(since_epoch: Duration) -> Self {
        Self {
            secs: TAI64_BASE.wrapping_add(since_epoch.as_secs()),
            nanos: since_epoch.subsec_nanos(),
        }
    }

    pub fn parse(bytes: &[u8; TIMESTAMP_LEN]) -> Self {
        let mut secs = [0u8; 8];
        let mut nanos = [0u8; 4];
        secs.copy_from_slice(&bytes[..8]);
        nanos.copy_from_slice(&bytes[8..]);
        Self {
            secs: u64::from_be_bytes(secs),
            nanos: u32::from_be_bytes(nanos),
        }
    }

    pub fn to_bytes(self) -> [u8; TIMESTAMP_LEN] {
        let mut out = [0u8; TIMESTAMP_LEN];
        out[..8].copy_from_slice(&self.secs.to_be_bytes());
        out[8..].copy_from_slice(&self.nanos.to_be_bytes());
        out
    }

    fn successor(self) -> Self {
        if self.nanos + 1 >= 1_000_000_000 {
            Self {
                secs: self.secs + 1,
                nanos: 0,
            }
        } else {
            Self {
                secs: self.secs,
                nanos: self.nanos + 1,
            }
        }
    }
}

/// Wall-clock timestamps anchored once and advanced by the monotonic clock,
/// so injected `Instant`s produce consistent, strictly increasing stamps.
#[derive(Debug)]
struct TimeStamper {
    wall_base: Duration,
    mono_base: Instant,
    last: Tai64N,
}

impl TimeStamper {
    fn new(now: Instant) -> Self {
        let wall_base = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            wall_base,
            mono_base: now,
            last: Tai64N::default(),
        }
    }

    fn stamp(&mut self, now: Instant) -> Tai64N {
        let elapsed = now.saturating_duration_since(self.mono_base);
        let mut stamp = Tai64N::from_unix(self.wall_base + elapsed);
        if stamp <= self.last {
            stamp = self.last.successor();
        }
        self.last = stamp;
        stamp
    }
}

/// State kept between sending an initiation and receiving its response.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct InitiationSent {
    local_index: u32,
    hash: [u8; KEY_LEN],
    chaining_key: [u8; KEY_LEN],
    #[zeroize(skip)]
    ephemeral_private: StaticSecret,
    #[zeroize(skip)]
    sent_at: Instant,
}

/// State between validating an initiation and writing the response.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct InitiationReceived {
    hash: [u8; KEY_LEN],
    chaining_key: [u8; KEY_LEN],
    peer_ephemeral: [u8; KEY_LEN],
    peer_index: u32,
}

/// Where the local side stands in the exchange. Completion is not a state:
/// it emits a [`Session`] and returns to `Idle`.
#[derive(Default)]
pub enum HandshakeState {
    #[default]
    Idle,
    InitiationSent(InitiationSent),
    InitiationReceived(InitiationReceived),
}

impl fmt::Debug for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeState::Idle => f.write_str("Idle"),
            HandshakeState::InitiationSent(s) => f
                .debug_struct("InitiationSent")
                .field("local_index", &format_args!("{:#x}", s.local_index))
                .finish_non_exhaustive(),
            HandshakeState::InitiationReceived(s) => f
                .debug_struct("InitiationReceived")
                .field("peer_index", &format_args!("{:#x}", s.peer_index))
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Default)]
struct CookieState {
    /// mac1 of the last handshake message we sent; AAD of the cookie reply.
    last_mac1: Option<[u8; MAC_LEN]>,
    cookie: Option<([u8; MAC_LEN], Instant)>,
}

/// The handshake side of one tunnel: our static key, the peer's identity,
/// and at most one exchange in flight (plus the one it replaced).
pub struct Handshake {
    static_private: StaticSecret,
    static_public: PublicKey,
    peer: PeerIdentity,
    static_shared: [u8; KEY_LEN],
    mac1_key: [u8; KEY_LEN],
    cookie_key: [u8; KEY_LEN],
    state: HandshakeState,
    previous: Option<InitiationSent>,
    last_peer_timestamp: Option<Tai64N>,
    stamper: TimeStamper,
    cookie: CookieState,
    cookie_lifetime: Duration,
    last_rtt: Option<Duration>,
}

impl Handshake {
    pub fn new(static_private: StaticSecret, peer: PeerIdentity, now: Instant) -> Self {
        let static_public = PublicKey::from(&static_private);
        let static_shared = *static_private.diffie_hellman(&peer.public).as_bytes();
        let mac1_key = primitives::hash(&[LABEL_MAC1, peer.public.as_bytes()]);
        let cookie_key = primitives::hash(&[LABEL_COOKIE, peer.public.as_bytes()]);
        Self {
            static_private,
            static_public,
            peer,
            static_shared,
            mac1_key,
            cookie_key,
            state: HandshakeState::Idle,
            previous: None,
            last_peer_timestamp: None,
            stamper: TimeStamper::new(now),
            cookie: CookieState::default(),
            cookie_lifetime: COOKIE_EXPIRATION_TIME,
            last_rtt: None,
        }
    }

    /// Override how long a cookie from the peer keys our mac2.
    pub fn with_cookie_lifetime(mut self, lifetime: Duration) -> Self {
        self.cookie_lifetime = lifetime;
        self
    }

    pub fn local_public(&self) -> &PublicKey {
        &self.static_public
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// True while an initiation of ours awaits its response.
    pub fn is_in_progress(&self) -> bool {
        matches!(self.state, HandshakeState::InitiationSent(_)) || self.previous.is_some()
    }

    /// Local indices reserved by initiations still awaiting a response.
    pub fn pending_indices(&self) -> impl Iterator<Item = u32> + '_ {
        let current = match &self.state {
            HandshakeState::InitiationSent(s) => Some(s.local_index),
            _ => None,
        };
        current
            .into_iter()
            .chain(self.previous.as_ref().map(|s| s.local_index))
    }

    /// Latency between our last completed initiation and its response.
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Forget any exchange in flight.
    pub fn abort(&mut self) {
        self.state = HandshakeState::Idle;
        self.previous = None;
    }

    /// Drop the peer's cookie once it is too old to be useful.
    pub fn expire_cookie(&mut self, now: Instant) {
        if let Some((_, received)) = self.cookie.cookie {
            if now.saturating_duration_since(received) >= self.cookie_lifetime {
                self.cookie.cookie = None;
            }
        }
    }

    /// Write a handshake initiation for `local_index` into `dst`.
    ///
    /// An initiation already in flight is kept as `previous`, so a late
    /// response to it still completes.
    pub fn initiate(
        &mut self,
        local_index: u32,
        now: Instant,
        dst: &mut [u8],
    ) -> Result<usize, HandshakeError> {
        if dst.len() < HANDSHAKE_INITIATION_SIZE {
            return Err(HandshakeError::DestinationTooSmall {
                needed: HANDSHAKE_INITIATION_SIZE,
                available: dst.len(),
            });
        }

        let ephemeral_private = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral_private);

        let (mut chaining_key, hash) = initial_state(self.peer.public.as_bytes());
        let mut hash = primitives::hash(&[&hash, ephemeral_public.as_bytes()]);
        chaining_key = kdf1(&chaining_key, ephemeral_public.as_bytes());

        // es
        let es = ephemeral_private.diffie_hellman(&self.peer.public);
        let (ck, mut key) = kdf2(&chaining_key, es.as_bytes());
        chaining_key = ck;
        let mut encrypted_static = [0u8; KEY_LEN + AEAD_TAG_SIZE];
        primitives::seal_with_key(&key, &hash, self.static_public.as_bytes(), &mut encrypted_static)
            .map_err(|_| HandshakeError::Authentication)?;
        hash = primitives::hash(&[&hash, &encrypted_static]);

        // ss
        let (ck, k) = kdf2(&chaining_key, &self.static_shared);
        chaining_key = ck;
        key.zeroize();
        key = k;
        let timestamp = self.stamper.stamp(now).to_bytes();
        let mut encrypted_timestamp = [0u8; TIMESTAMP_LEN + AEAD_TAG_SIZE];
        primitives::seal_with_key(&key, &hash, &timestamp, &mut encrypted_timestamp)
            .map_err(|_| HandshakeError::Authentication)?;
        hash = primitives::hash(&[&hash, &encrypted_timestamp]);
        key.zeroize();

        let n = write_initiation(
            dst,
            &HandshakeInitiation {
                sender_index: local_index,
                unencrypted_ephemeral: ephemeral_public.as_bytes(),
                encrypted_static: &encrypted_static,
                encrypted_timestamp: &encrypted_timestamp,
            },
        )?;
        self.append_macs(&mut dst[..n], now);

        let sent = InitiationSent {
            local_index,
            hash,
            chaining_key,
            ephemeral_private,
            sent_at: now,
        };
        chaining_key.zeroize();
        if let HandshakeState::InitiationSent(old) =
            std::mem::replace(&mut self.state, HandshakeState::InitiationSent(sent))
        {
            self.previous = Some(old);
        }
        debug!(local_index = format_args!("{local_index:#x}"), "handshake initiation written");
        Ok(n)
    }

    /// Validate an initiation from the peer, write our response into `dst`,
    /// and return the responder-side session keyed to `local_index`.
    pub fn consume_initiation(
        &mut self,
        msg: &HandshakeInitiation<'_>,
        local_index: u32,
        now: Instant,
        dst: &mut [u8],
    ) -> Result<(usize, Session), HandshakeError> {
        if dst.len() < HANDSHAKE_RESPONSE_SIZE {
            return Err(HandshakeError::DestinationTooSmall {
                needed: HANDSHAKE_RESPONSE_SIZE,
                available: dst.len(),
            });
        }

        let peer_ephemeral = PublicKey::from(*msg.unencrypted_ephemeral);
        let (mut chaining_key, hash) = initial_state(self.static_public.as_bytes());
        let mut hash = primitives::hash(&[&hash, peer_ephemeral.as_bytes()]);
        chaining_key = kdf1(&chaining_key, peer_ephemeral.as_bytes());

        // es
        let es = self.static_private.diffie_hellman(&peer_ephemeral);
        let (ck, mut key) = kdf2(&chaining_key, es.as_bytes());
        chaining_key = ck;
        let mut peer_static = [0u8; KEY_LEN];
        primitives::open_with_key(&key, &hash, msg.encrypted_static, &mut peer_static)
            .map_err(|_| HandshakeError::Authentication)?;
        hash = primitives::hash(&[&hash, msg.encrypted_static]);
        if !constant_time_eq(&peer_static, self.peer.public.as_bytes()) {
            debug!("initiation from an unexpected static key");
            return Err(HandshakeError::Authentication);
        }

        // ss
        let (ck, k) = kdf2(&chaining_key, &self.static_shared);
        chaining_key = ck;
        key.zeroize();
        key = k;
        let mut timestamp = [0u8; TIMESTAMP_LEN];
        primitives::open_with_key(&key, &hash, msg.encrypted_timestamp, &mut timestamp)
            .map_err(|_| HandshakeError::Authentication)?;
        hash = primitives::hash(&[&hash, msg.encrypted_timestamp]);
        key.zeroize();

        let timestamp = Tai64N::parse(&timestamp);
        if self.last_peer_timestamp.is_some_and(|last| timestamp <= last) {
            debug!(sender_index = format_args!("{:#x}", msg.sender_index), "replayed initiation");
            return Err(HandshakeError::Replay);
        }
        self.last_peer_timestamp = Some(timestamp);

        let received = InitiationReceived {
            hash,
            chaining_key,
            peer_ephemeral: *peer_ephemeral.as_bytes(),
            peer_index: msg.sender_index,
        };
        chaining_key.zeroize();
        if let HandshakeState::InitiationSent(ours) =
            std::mem::replace(&mut self.state, HandshakeState::InitiationReceived(received))
        {
            self.previous = Some(ours);
        }
        self.write_response(local_index, now, dst)
    }

    fn write_response(
        &mut self,
        local_index: u32,
        now: Instant,
        dst: &mut [u8],
    ) -> Result<(usize, Session), HandshakeError> {
        let received = match std::mem::take(&mut self.state) {
            HandshakeState::InitiationReceived(r) => r,
            other => {
                self.state = other;
                return Err(HandshakeError::UnexpectedMessage(local_index));
            }
        };

        let ephemeral_private = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral_private);
        let peer_ephemeral = PublicKey::from(received.peer_ephemeral);

        let mut hash = primitives::hash(&[&received.hash, ephemeral_public.as_bytes()]);
        let mut chaining_key = kdf1(&received.chaining_key, ephemeral_public.as_bytes());
        // ee
        let ee = ephemeral_private.diffie_hellman(&peer_ephemeral);
        chaining_key = kdf1(&chaining_key, ee.as_bytes());
        // se
        let se = ephemeral_private.diffie_hellman(&self.peer.public);
        chaining_key = kdf1(&chaining_key, se.as_bytes());
        // psk
        let psk = self.peer.preshared_key.unwrap_or([0u8; KEY_LEN]);
        let (ck, tau, mut key) = kdf3(&chaining_key, &psk);
        chaining_key = ck;
        hash = primitives::hash(&[&hash, &tau]);

        let mut encrypted_nothing = [0u8; AEAD_TAG_SIZE];
        primitives::seal_with_key(&key, &hash, &[], &mut encrypted_nothing)
            .map_err(|_| HandshakeError::Authentication)?;
        key.zeroize();
        hash.zeroize();

        let n = write_response(
            dst,
            &HandshakeResponse {
                sender_index: local_index,
                receiver_index: received.peer_index,
                unencrypted_ephemeral: ephemeral_public.as_bytes(),
                encrypted_nothing: &encrypted_nothing,
            },
        )?;
        self.append_macs(&mut dst[..n], now);

        let (mut receive_key, mut send_key) = kdf2(&chaining_key, &[]);
        chaining_key.zeroize();
        let session = Session::new(
            local_index,
            received.peer_index,
            &send_key,
            &receive_key,
            false,
            now,
        );
        send_key.zeroize();
        receive_key.zeroize();

        debug!(
            local_index = format_args!("{local_index:#x}"),
            peer_index = format_args!("{:#x}", received.peer_index),
            "handshake response written"
        );
        Ok((n, session))
    }

    /// Complete our pending initiation with the peer's response.
    pub fn consume_response(
        &mut self,
        msg: &HandshakeResponse<'_>,
        now: Instant,
    ) -> Result<Session, HandshakeError> {
        let from_previous = match (&self.state, &self.previous) {
            (HandshakeState::InitiationSent(s), _) if s.local_index == msg.receiver_index => false,
            (_, Some(s)) if s.local_index == msg.receiver_index => true,
            (HandshakeState::InitiationSent(_), _) | (_, Some(_)) => {
                return Err(HandshakeError::Authentication)
            }
            _ => return Err(HandshakeError::UnexpectedMessage(msg.receiver_index)),
        };
        let pending = match (&self.state, &self.previous) {
            (HandshakeState::InitiationSent(s), _) if !from_previous => s,
            (_, Some(s)) => s,
            _ => return Err(HandshakeError::UnexpectedMessage(msg.receiver_index)),
        };

        let peer_ephemeral = PublicKey::from(*msg.unencrypted_ephemeral);
        let mut hash = primitives::hash(&[&pending.hash, peer_ephemeral.as_bytes()]);
        let mut chaining_key = kdf1(&pending.chaining_key, peer_ephemeral.as_bytes());
        // ee
        let ee = pending.ephemeral_private.diffie_hellman(&peer_ephemeral);
        chaining_key = kdf1(&chaining_key, ee.as_bytes());
        // se
        let se = self.static_private.diffie_hellman(&peer_ephemeral);
        chaining_key = kdf1(&chaining_key, se.as_bytes());
        // psk
        let psk = self.peer.preshared_key.unwrap_or([0u8; KEY_LEN]);
        let (ck, tau, mut key) = kdf3(&chaining_key, &psk);
        chaining_key = ck;
        hash = primitives::hash(&[&hash, &tau]);

        let mut nothing = [0u8; 0];
        let opened = primitives::open_with_key(&key, &hash, msg.encrypted_nothing, &mut nothing);
        key.zeroize();
        hash.zeroize();
        if opened.is_err() {
            chaining_key.zeroize();
            return Err(HandshakeError::Authentication);
        }

        let local_index = pending.local_index;
        let rtt = now.saturating_duration_since(pending.sent_at);
        let (mut send_key, mut receive_key) = kdf2(&chaining_key, &[]);
        chaining_key.zeroize();
        let session = Session::new(
            local_index,
            msg.sender_index,
            &send_key,
            &receive_key,
            true,
            now,
        );
        send_key.zeroize();
        receive_key.zeroize();

        if from_previous {
            self.previous = None;
        } else {
            self.state = HandshakeState::Idle;
        }
        self.last_rtt = Some(rtt);
        debug!(
            local_index = format_args!("{local_index:#x}"),
            peer_index = format_args!("{:#x}", msg.sender_index),
            rtt_ms = rtt.as_millis() as u64,
            "handshake complete"
        );
        Ok(session)
    }

    /// Store the cookie from a reply to our last handshake message; it keys
    /// mac2 on our next messages until it expires.
    pub fn consume_cookie_reply(
        &mut self,
        reply: &CookieReply<'_>,
        now: Instant,
    ) -> Result<(), HandshakeError> {
        let mac1 = self
            .cookie
            .last_mac1
            .ok_or(HandshakeError::UnexpectedMessage(reply.receiver_index))?;
        let cookie = open_cookie_reply(&self.cookie_key, &mac1, reply)
            .ok_or(HandshakeError::InvalidCookie)?;
        self.cookie.cookie = Some((cookie, now));
        debug!(receiver_index = format_args!("{:#x}", reply.receiver_index), "cookie received");
        Ok(())
    }

    fn append_macs(&mut self, msg: &mut [u8], now: Instant) {
        let mac2_at = msg.len() - MAC_LEN;
        let mac1_at = mac2_at - MAC_LEN;

        let mac1 = primitives::mac(&self.mac1_key, &[&msg[..mac1_at]]);
        msg[mac1_at..mac2_at].copy_from_slice(&mac1);

        self.expire_cookie(now);
        let mac2 = match &self.cookie.cookie {
            Some((cookie, _)) => primitives::mac(cookie, &[&msg[..mac2_at]]),
            None => [0u8; MAC_LEN],
        };
        msg[mac2_at..].copy_from_slice(&mac2);
        self.cookie.last_mac1 = Some(mac1);
    }
}

impl Drop for Handshake {
    fn drop(&mut self) {
        self.static_shared.zeroize();
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("previous", &self.previous.as_ref().map(|s| s.local_index))
            .finish_non_exhaustive()
    }
}

/// Chaining key and hash after mixing in the responder's static key.
fn initial_state(responder_static: &[u8; KEY_LEN]) -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let chaining_key = primitives::hash(&[CONSTRUCTION]);
    let hash = primitives::hash(&[&chaining_key, IDENTIFIER]);
    let hash = primitives::hash(&[&hash, responder_static]);
    (chaining_key, hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;
    use veil_core::{Packet, TransportData};

    struct Side {
        handshake: Handshake,
    }

    fn pair(psk: Option<[u8; 32]>) -> (Side, Side, Instant) {
        let now = Instant::now();
        let a_private = keys::generate();
        let b_private = keys::generate();
        let a_public = keys::derive_public(&a_private);
        let b_public = keys::derive_public(&b_private);
        (
            Side {
                handshake: Handshake::new(a_private, PeerIdentity::new(b_public, psk), now),
            },
            Side {
                handshake: Handshake::new(b_private, PeerIdentity::new(a_public, psk), now),
            },
            now,
        )
    }

    fn parse_initiation(buf: &[u8]) -> HandshakeInitiation<'_> {
        match Packet::parse(buf).unwrap() {
            Packet::HandshakeInitiation(p) => p,
            other => panic!("unexpected packet {other:?}"),
        }
    }

    fn parse_response(buf: &[u8]) -> HandshakeResponse<'_> {
        match Packet::parse(buf).unwrap() {
            Packet::HandshakeResponse(p) => p,
            other => panic!("unexpected packet {other:?}"),
        }
    }

    fn parse_data(buf: &[u8]) -> TransportData<'_> {
        match Packet::parse(buf).unwrap() {
            Packet::TransportData(p) => p,
            other => panic!("unexpected packet {other:?}"),
        }
    }

    fn exchange(a: &mut Side, b: &mut Side, now: Instant) -> (Session, Session) {
        let mut init = [0u8; 148];
        let mut resp = [0u8; 92];
        a.handshake.initiate(0x0101, now, &mut init).unwrap();
        let (_, b_session) = b
            .handshake
            .consume_initiation(&parse_initiation(&init), 0x0202, now, &mut resp)
            .unwrap();
        let a_session = a
            .handshake
            .consume_response(&parse_response(&resp), now)
            .unwrap();
        (a_session, b_session)
    }

    fn assert_symmetric(a: &mut Session, b: &mut Session) {
        let mut wire = [0u8; 128];
        let mut plain = [0u8; 128];

        let n = a.encrypt(b"a to b", &mut wire).unwrap();
        let m = b.decrypt(&parse_data(&wire[..n]), &mut plain).unwrap();
        assert_eq!(&plain[..m], b"a to b");

        let n = b.encrypt(b"b to a", &mut wire).unwrap();
        let m = a.decrypt(&parse_data(&wire[..n]), &mut plain).unwrap();
        assert_eq!(&plain[..m], b"b to a");
    }

    #[test]
    fn test_initial_constants() {
        let (ck, _) = initial_state(&[0u8; 32]);
        assert_eq!(
            ck,
            [
                96, 226, 109, 174, 243, 39, 239, 192, 46, 195, 53, 226, 160, 37, 210, 208, 22,
                235, 66, 6, 248, 114, 119, 245, 45, 56, 209, 152, 139, 120, 205, 54
            ]
        );
        let hash = primitives::hash(&[&ck, IDENTIFIER]);
        assert_eq!(
            hash,
            [
                34, 17, 179, 97, 8, 26, 197, 102, 105, 18, 67, 219, 69, 138, 213, 50, 45, 156,
                108, 102, 34, 147, 232, 183, 14, 225, 156, 101, 186, 7, 158, 243
            ]
        );
    }

    #[test]
    fn test_full_exchange_yields_symmetric_sessions() {
        let (mut a, mut b, now) = pair(None);
        let (mut a_session, mut b_session) = exchange(&mut a, &mut b, now);

        assert!(a_session.is_initiator());
        assert!(!b_session.is_initiator());
        assert_eq!(a_session.local_index(), 0x0101);
        assert_eq!(a_session.peer_index(), 0x0202);
        assert_eq!(b_session.local_index(), 0x0202);
        assert_eq!(b_session.peer_index(), 0x0101);
        assert!(matches!(a.handshake.state(), HandshakeState::Idle));
        assert!(matches!(b.handshake.state(), HandshakeState::Idle));

        assert_symmetric(&mut a_session, &mut b_session);
    }

    #[test]
    fn test_exchange_with_preshared_key() {
        let (mut a, mut b, now) = pair(Some([5u8; 32]));
        let (mut a_session, mut b_session) = exchange(&mut a, &mut b, now);
        assert_symmetric(&mut a_session, &mut b_session);
    }

    #[test]
    fn test_mismatched_preshared_key_fails() {
        let now = Instant::now();
        let a_private = keys::generate();
        let b_private = keys::generate();
        let a_public = keys::derive_public(&a_private);
        let b_public = keys::derive_public(&b_private);
        let mut a = Side {
            handshake: Handshake::new(a_private, PeerIdentity::new(b_public, Some([5u8; 32])), now),
        };
        let mut b = Side {
            handshake: Handshake::new(b_private, PeerIdentity::new(a_public, Some([6u8; 32])), now),
        };

        let mut init = [0u8; 148];
        let mut resp = [0u8; 92];
        a.handshake.initiate(1, now, &mut init).unwrap();
        b.handshake
            .consume_initiation(&parse_initiation(&init), 2, now, &mut resp)
            .unwrap();
        assert_eq!(
            a.handshake.consume_response(&parse_response(&resp), now).err(),
            Some(HandshakeError::Authentication)
        );
        // The pending initiation survives a bad response.
        assert!(a.handshake.is_in_progress());
    }

    #[test]
    fn test_initiation_from_unknown_peer_rejected() {
        let (_, mut b, now) = pair(None);
        let stranger_private = keys::generate();
        let mut stranger = Handshake::new(
            stranger_private,
            PeerIdentity::new(*b.handshake.local_public(), None),
            now,
        );

        let mut init = [0u8; 148];
        let mut resp = [0u8; 92];
        stranger.initiate(9, now, &mut init).unwrap();
        assert_eq!(
            b.handshake
                .consume_initiation(&parse_initiation(&init), 2, now, &mut resp)
                .err(),
            Some(HandshakeError::Authentication)
        );
    }

    #[test]
    fn test_replayed_initiation_rejected() {
        let (mut a, mut b, now) = pair(None);
        let mut init = [0u8; 148];
        let mut resp = [0u8; 92];
        a.handshake.initiate(1, now, &mut init).unwrap();

        b.handshake
            .consume_initiation(&parse_initiation(&init), 2, now, &mut resp)
            .unwrap();
        assert_eq!(
            b.handshake
                .consume_initiation(&parse_initiation(&init), 3, now, &mut resp)
                .err(),
            Some(HandshakeError::Replay)
        );

        // A fresh initiation at the same instant still carries a newer stamp.
        a.handshake.initiate(4, now, &mut init).unwrap();
        assert!(b
            .handshake
            .consume_initiation(&parse_initiation(&init), 5, now, &mut resp)
            .is_ok());
    }

    #[test]
    fn test_tampered_initiation_rejected() {
        let (mut a, mut b, now) = pair(None);
        let mut init = [0u8; 148];
        let mut resp = [0u8; 92];
        a.handshake.initiate(1, now, &mut init).unwrap();
        init[50] ^= 0x01;
        assert_eq!(
            b.handshake
                .consume_initiation(&parse_initiation(&init), 2, now, &mut resp)
                .err(),
            Some(HandshakeError::Authentication)
        );
    }

    #[test]
    fn test_response_without_pending_initiation() {
        let (mut a, mut b, now) = pair(None);
        let mut init = [0u8; 148];
        let mut resp = [0u8; 92];
        a.handshake.initiate(1, now, &mut init).unwrap();
        b.handshake
            .consume_initiation(&parse_initiation(&init), 2, now, &mut resp)
            .unwrap();

        // B never initiated, so the response it wrote means nothing to it.
        assert_eq!(
            b.handshake.consume_response(&parse_response(&resp), now).err(),
            Some(HandshakeError::UnexpectedMessage(1))
        );
    }

    #[test]
    fn test_response_for_unknown_index() {
        let (mut a, mut b, now) = pair(None);
        let mut init = [0u8; 148];
        let mut resp = [0u8; 92];
        a.handshake.initiate(1, now, &mut init).unwrap();
        b.handshake
            .consume_initiation(&parse_initiation(&init), 2, now, &mut resp)
            .unwrap();
        resp[8..12].copy_from_slice(&77u32.to_le_bytes());
        assert_eq!(
            a.handshake.consume_response(&parse_response(&resp), now).err(),
            Some(HandshakeError::Authentication)
        );
    }

    #[test]
    fn test_late_response_to_previous_initiation() {
        let (mut a, mut b, now) = pair(None);
        let mut first = [0u8; 148];
        let mut second = [0u8; 148];
        let mut resp = [0u8; 92];

        a.handshake.initiate(1, now, &mut first).unwrap();
        a.handshake
            .initiate(2, now + Duration::from_secs(5), &mut second)
            .unwrap();
        assert_eq!(a.handshake.pending_indices().collect::<Vec<_>>(), vec![2, 1]);

        let (_, mut b_session) = b
            .handshake
            .consume_initiation(&parse_initiation(&first), 7, now, &mut resp)
            .unwrap();
        let mut a_session = a
            .handshake
            .consume_response(&parse_response(&resp), now + Duration::from_secs(6))
            .unwrap();
        assert_eq!(a_session.local_index(), 1);
        assert_eq!(a.handshake.pending_indices().collect::<Vec<_>>(), vec![2]);
        assert_eq!(a.handshake.last_rtt(), Some(Duration::from_secs(6)));
        assert_symmetric(&mut a_session, &mut b_session);
    }

    #[test]
    fn test_crossing_initiations_both_complete() {
        let (mut a, mut b, now) = pair(None);
        let mut a_init = [0u8; 148];
        let mut b_init = [0u8; 148];
        let mut a_resp = [0u8; 92];
        let mut b_resp = [0u8; 92];

        a.handshake.initiate(0xA1, now, &mut a_init).unwrap();
        b.handshake.initiate(0xB1, now, &mut b_init).unwrap();

        let (_, mut b_responder) = b
            .handshake
            .consume_initiation(&parse_initiation(&a_init), 0xB2, now, &mut b_resp)
            .unwrap();
        let (_, mut a_responder) = a
            .handshake
            .consume_initiation(&parse_initiation(&b_init), 0xA2, now, &mut a_resp)
            .unwrap();

        let mut a_initiator = a
            .handshake
            .consume_response(&parse_response(&b_resp), now)
            .unwrap();
        let mut b_initiator = b
            .handshake
            .consume_response(&parse_response(&a_resp), now)
            .unwrap();

        assert_symmetric(&mut a_initiator, &mut b_responder);
        assert_symmetric(&mut b_initiator, &mut a_responder);
    }

    #[test]
    fn test_destination_too_small() {
        let (mut a, _, now) = pair(None);
        let mut small = [0u8; 100];
        assert_eq!(
            a.handshake.initiate(1, now, &mut small),
            Err(HandshakeError::DestinationTooSmall {
                needed: HANDSHAKE_INITIATION_SIZE,
                available: 100
            })
        );
        assert!(!a.handshake.is_in_progress());
    }

    #[test]
    fn test_mac1_is_keyed_by_peer_public() {
        let (mut a, b, now) = pair(None);
        let mut init = [0u8; 148];
        a.handshake.initiate(1, now, &mut init).unwrap();

        let key = primitives::hash(&[LABEL_MAC1, b.handshake.local_public().as_bytes()]);
        assert_eq!(primitives::mac(&key, &[&init[..116]]), init[116..132]);
        assert_eq!(init[132..148], [0u8; 16]);
    }

    #[test]
    fn test_cookie_reply_keys_mac2_until_expiry() {
        use crate::cookie::{AdmissionError, RateLimiter};

        let (mut a, b, now) = pair(None);
        let addr: std::net::IpAddr = "10.0.0.1".parse().unwrap();
        let mut limiter = RateLimiter::new(b.handshake.local_public(), 0, now);
        let mut init = [0u8; 148];
        let mut reply = [0u8; 64];

        a.handshake.initiate(1, now, &mut init).unwrap();
        let n = match limiter.verify_packet(Some(addr), &init, &mut reply, now) {
            Err(AdmissionError::CookieReply(n)) => n,
            other => panic!("expected a cookie reply, got {other:?}"),
        };
        match Packet::parse(&reply[..n]).unwrap() {
            Packet::CookieReply(c) => a.handshake.consume_cookie_reply(&c, now).unwrap(),
            other => panic!("unexpected packet {other:?}"),
        }

        a.handshake.initiate(2, now, &mut init).unwrap();
        assert_ne!(init[132..148], [0u8; 16]);
        assert!(limiter.verify_packet(Some(addr), &init, &mut reply, now).is_ok());

        let later = now + COOKIE_EXPIRATION_TIME + Duration::from_secs(1);
        a.handshake.initiate(3, later, &mut init).unwrap();
        assert_eq!(init[132..148], [0u8; 16]);
    }

    #[test]
    fn test_cookie_reply_without_sent_message() {
        let (_, mut b, now) = pair(None);
        let reply = [0u8; 64];
        let fake = CookieReply {
            receiver_index: 1,
            nonce: reply[8..32].try_into().unwrap(),
            encrypted_cookie: reply[32..64].try_into().unwrap(),
        };
        assert_eq!(
            b.handshake.consume_cookie_reply(&fake, now),
            Err(HandshakeError::UnexpectedMessage(1))
        );
    }

    #[test]
    fn test_tai64n_ordering_and_encoding() {
        let t1 = Tai64N::from_unix(Duration::new(1_700_000_000, 5));
        let t2 = Tai64N::from_unix(Duration::new(1_700_000_000, 6));
        let t3 = Tai64N::from_unix(Duration::new(1_700_000_001, 0));
        assert!(t1 < t2 && t2 < t3);
        assert_eq!(Tai64N::parse(&t2.to_bytes()), t2);
        assert_eq!(Tai64N::from_unix(Duration::new(0, 999_999_999)).successor().nanos, 0);
    }
}
