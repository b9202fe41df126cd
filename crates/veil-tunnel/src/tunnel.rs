//! The tunnel facade.
//!
//! # Packet Flow
//!
//! ```text
//!  host interface                                   host socket
//!        |                                               ^
//!        |  write(ip packet) -------------------------->| WriteToNetwork
//!        |     (no session: queue + initiation)          |
//!        |                                               |
//!        |<------------------------------ read(datagram) |
//!  WriteToTunnel        (handshake: response/keepalive)  |
//!        |                                               |
//!        |  tick() ------------------------------------->| retransmit, rekey,
//!        |                                               | keepalive
//! ```

use crate::stats::{estimate_loss, Stats};
use crate::table::{SessionTable, Slot};
use crate::timers::{InitiateReason, TimerEvent, Timers};
use crate::{Action, TunnelError};
use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;
use std::time::Instant;
use tracing::{debug, trace, warn};
use veil_common::TunnelConfig;
use veil_core::{
    ip, CookieReply, HandshakeInitiation, HandshakeResponse, Packet, TransportData,
    AEAD_TAG_SIZE, COOKIE_REPLY_SIZE, DATA_OVERHEAD, HANDSHAKE_INITIATION_SIZE,
    HANDSHAKE_RESPONSE_SIZE, KEY_LEN, MAX_PACKET_SIZE,
};
use veil_crypto::{
    AdmissionError, Handshake, HandshakeError, PeerIdentity, PublicKey, RateLimiter,
    SessionError, StaticSecret,
};

/// One end of a point-to-point tunnel.
///
/// Every method takes `&mut self`; hosts that share a tunnel across tasks
/// wrap it in a mutex.
pub struct Tunnel {
    handshake: Handshake,
    sessions: SessionTable,
    timers: Timers,
    rate_limiter: RateLimiter,
    queue: VecDeque<Vec<u8>>,
    max_queued: usize,
    tx_bytes: u64,
    rx_bytes: u64,
    handshake_attempts: u64,
    dropped_packets: u64,
}

impl Tunnel {
    pub fn new(
        static_private: StaticSecret,
        peer_public: PublicKey,
        preshared_key: Option<[u8; KEY_LEN]>,
        persistent_keepalive_secs: u16,
        index_prefix: u32,
    ) -> Self {
        let config = TunnelConfig {
            persistent_keepalive_secs,
            index_prefix,
            ..TunnelConfig::default()
        };
        Self::build(
            static_private,
            PeerIdentity::new(peer_public, preshared_key),
            &config,
            Instant::now(),
        )
    }

    /// Build a tunnel with explicit thresholds, rejecting inconsistent ones.
    pub fn with_config(
        static_private: StaticSecret,
        peer_public: PublicKey,
        preshared_key: Option<[u8; KEY_LEN]>,
        config: &TunnelConfig,
    ) -> veil_common::Result<Self> {
        Self::with_config_at(static_private, peer_public, preshared_key, config, Instant::now())
    }

    pub fn with_config_at(
        static_private: StaticSecret,
        peer_public: PublicKey,
        preshared_key: Option<[u8; KEY_LEN]>,
        config: &TunnelConfig,
        now: Instant,
    ) -> veil_common::Result<Self> {
        config.validate()?;
        Ok(Self::build(
            static_private,
            PeerIdentity::new(peer_public, preshared_key),
            config,
            now,
        ))
    }

    fn build(
        static_private: StaticSecret,
        peer: PeerIdentity,
        config: &TunnelConfig,
        now: Instant,
    ) -> Self {
        let local_public = PublicKey::from(&static_private);
        let handshake = Handshake::new(static_private, peer, now)
            .with_cookie_lifetime(config.timers.cookie_expiration());
        Self {
            handshake,
            sessions: SessionTable::new(config.index_prefix),
            timers: Timers::new(config.timers.clone(), config.persistent_keepalive(), now),
            rate_limiter: RateLimiter::new(&local_public, config.handshake_rate_limit, now),
            queue: VecDeque::new(),
            max_queued: config.max_queued_packets,
            tx_bytes: 0,
            rx_bytes: 0,
            handshake_attempts: 0,
            dropped_packets: 0,
        }
    }

    pub fn local_public(&self) -> &PublicKey {
        self.handshake.local_public()
    }

    pub fn peer_public(&self) -> &PublicKey {
        &self.handshake.peer().public
    }

    /// Number of plaintext packets waiting for a session.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Encrypt an outbound packet from the local interface.
    pub fn write(&mut self, src: &[u8], dst: &mut [u8]) -> Action {
        self.write_at(src, dst, Instant::now())
    }

    pub fn write_at(&mut self, src: &[u8], dst: &mut [u8], now: Instant) -> Action {
        if src.len() > MAX_PACKET_SIZE {
            return Action::Error(TunnelError::SourceTooLarge {
                size: src.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        if let Some(action) = self.encrypt_on_current(src, dst, now) {
            if !matches!(action, Action::Error(_)) {
                self.timers.reset_retries();
            }
            return action;
        }

        // Checked before queuing; an error must leave no packet behind.
        let initiating = !self.timers.handshake_in_flight();
        if initiating && dst.len() < HANDSHAKE_INITIATION_SIZE {
            return Action::Error(TunnelError::DestinationTooSmall {
                needed: HANDSHAKE_INITIATION_SIZE,
                available: dst.len(),
            });
        }
        self.timers.reset_retries();

        if !src.is_empty() {
            if self.queue.len() < self.max_queued {
                self.queue.push_back(src.to_vec());
            } else {
                trace!(queued = self.queue.len(), "queue full, dropping outbound packet");
            }
        }
        if !initiating {
            return Action::Done;
        }
        self.initiate(now, dst)
    }

    /// Handle a datagram from the peer. An empty `src` sends the next queued
    /// packet instead; hosts repeat that until it returns [`Action::Done`].
    pub fn read(&mut self, src: &[u8], dst: &mut [u8]) -> Action {
        self.read_from_at(None, src, dst, Instant::now())
    }

    pub fn read_at(&mut self, src: &[u8], dst: &mut [u8], now: Instant) -> Action {
        self.read_from_at(None, src, dst, now)
    }

    /// Like [`Tunnel::read`], with the datagram's source address so that
    /// handshakes under load can be answered with a cookie.
    pub fn read_from(&mut self, addr: IpAddr, src: &[u8], dst: &mut [u8]) -> Action {
        self.read_from_at(Some(addr), src, dst, Instant::now())
    }

    pub fn read_from_at(
        &mut self,
        addr: Option<IpAddr>,
        src: &[u8],
        dst: &mut [u8],
        now: Instant,
    ) -> Action {
        if src.is_empty() {
            return self.drain_queue(dst, now);
        }
        if src.len() > MAX_PACKET_SIZE {
            return Action::Error(TunnelError::SourceTooLarge {
                size: src.len(),
                max: MAX_PACKET_SIZE,
            });
        }

        let packet = match self.rate_limiter.verify_packet(addr, src, dst, now) {
            Ok(packet) => packet,
            Err(AdmissionError::CookieReply(n)) => return Action::WriteToNetwork(n),
            Err(AdmissionError::DestinationTooSmall) => {
                return Action::Error(TunnelError::DestinationTooSmall {
                    needed: COOKIE_REPLY_SIZE,
                    available: dst.len(),
                })
            }
            Err(e) => return self.drop_packet("admission", &e),
        };

        trace!(kind = packet.kind(), len = src.len(), "inbound packet");
        match packet {
            Packet::HandshakeInitiation(p) => self.handle_initiation(&p, dst, now),
            Packet::HandshakeResponse(p) => self.handle_response(&p, dst, now),
            Packet::CookieReply(p) => self.handle_cookie_reply(&p, now),
            Packet::TransportData(p) => self.handle_data(&p, dst, now),
        }
    }

    /// Run the timer rules once. Hosts call this a few times per second.
    pub fn tick(&mut self, dst: &mut [u8]) -> Action {
        self.tick_at(dst, Instant::now())
    }

    pub fn tick_at(&mut self, dst: &mut [u8], now: Instant) -> Action {
        self.rate_limiter.reset_count(now);
        self.handshake.expire_cookie(now);
        let expired = self
            .sessions
            .expire_stale(now, self.timers.config().reject_after_time());
        if expired > 0 {
            debug!(expired, "expired stale sessions");
        }

        match self.timers.poll(now, &self.sessions) {
            TimerEvent::Idle => Action::Done,
            TimerEvent::ExpireAll => {
                debug!("no handshake for too long, clearing all session state");
                self.sessions.clear();
                self.handshake.abort();
                self.queue.clear();
                self.timers.on_expire_all();
                Action::Done
            }
            TimerEvent::GiveUp => {
                warn!(
                    attempts = self.handshake_attempts,
                    dropped = self.queue.len(),
                    "handshake did not complete, giving up"
                );
                self.handshake.abort();
                self.queue.clear();
                self.timers.on_give_up();
                Action::Done
            }
            TimerEvent::Initiate(reason) => {
                if reason == InitiateReason::Retransmit {
                    warn!("handshake unanswered, retransmitting initiation");
                } else {
                    debug!(?reason, "initiating handshake");
                }
                self.initiate(now, dst)
            }
            TimerEvent::Keepalive(reason) => {
                trace!(?reason, "sending keepalive");
                self.encrypt_on_current(&[], dst, now)
                    .unwrap_or(Action::Done)
            }
        }
    }

    /// Start a handshake now, regardless of timers.
    pub fn force_handshake(&mut self, dst: &mut [u8]) -> Action {
        self.force_handshake_at(dst, Instant::now())
    }

    pub fn force_handshake_at(&mut self, dst: &mut [u8], now: Instant) -> Action {
        self.timers.reset_retries();
        self.initiate(now, dst)
    }

    pub fn stats(&self) -> Stats {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> Stats {
        Stats {
            time_since_last_handshake: self
                .timers
                .last_handshake()
                .map(|t| now.saturating_duration_since(t)),
            tx_bytes: self.tx_bytes,
            rx_bytes: self.rx_bytes,
            loss: estimate_loss(&self.sessions),
            rtt: self.handshake.last_rtt(),
            handshake_attempts: self.handshake_attempts,
            retries_exhausted: self.timers.retries_exhausted(),
            dropped_packets: self.dropped_packets,
        }
    }

    fn initiate(&mut self, now: Instant, dst: &mut [u8]) -> Action {
        if dst.len() < HANDSHAKE_INITIATION_SIZE {
            return Action::Error(TunnelError::DestinationTooSmall {
                needed: HANDSHAKE_INITIATION_SIZE,
                available: dst.len(),
            });
        }
        let pending: Vec<u32> = self.handshake.pending_indices().collect();
        let index = self.sessions.allocate_index(&pending);
        match self.handshake.initiate(index, now, dst) {
            Ok(n) => {
                self.timers.on_handshake_initiated(now);
                self.timers.on_packet_sent(now, false);
                self.handshake_attempts += 1;
                Action::WriteToNetwork(n)
            }
            Err(e) => handshake_failure(e),
        }
    }

    /// Encrypt on the current session if it may still send. `None` means
    /// there is no such session.
    fn encrypt_on_current(&mut self, src: &[u8], dst: &mut [u8], now: Instant) -> Option<Action> {
        let reject_after = self.timers.config().reject_after_time();
        let reject_messages = self.timers.config().reject_after_messages;
        let session = self.sessions.current_mut()?;
        if session.age(now) >= reject_after || session.send_counter() >= reject_messages {
            return None;
        }

        match session.encrypt(src, dst) {
            Ok(n) => {
                self.timers.on_packet_sent(now, !src.is_empty());
                self.tx_bytes += src.len() as u64;
                Some(Action::WriteToNetwork(n))
            }
            Err(SessionError::DestinationTooSmall { needed, available }) => Some(Action::Error(
                TunnelError::DestinationTooSmall { needed, available },
            )),
            Err(e) => {
                trace!(error = %e, "current session cannot send");
                None
            }
        }
    }

    fn drain_queue(&mut self, dst: &mut [u8], now: Instant) -> Action {
        let Some(packet) = self.queue.pop_front() else {
            return Action::Done;
        };
        match self.encrypt_on_current(&packet, dst, now) {
            Some(action @ Action::WriteToNetwork(_)) => action,
            Some(action) => {
                self.queue.push_front(packet);
                action
            }
            None => {
                self.queue.push_front(packet);
                Action::Done
            }
        }
    }

    fn handle_initiation(
        &mut self,
        msg: &HandshakeInitiation<'_>,
        dst: &mut [u8],
        now: Instant,
    ) -> Action {
        if dst.len() < HANDSHAKE_RESPONSE_SIZE {
            return Action::Error(TunnelError::DestinationTooSmall {
                needed: HANDSHAKE_RESPONSE_SIZE,
                available: dst.len(),
            });
        }
        let pending: Vec<u32> = self.handshake.pending_indices().collect();
        let index = self.sessions.allocate_index(&pending);
        match self.handshake.consume_initiation(msg, index, now, dst) {
            Ok((n, session)) => {
                self.sessions.insert_next(session);
                self.timers.on_packet_received(now, false);
                self.timers.on_packet_sent(now, false);
                Action::WriteToNetwork(n)
            }
            Err(HandshakeError::DestinationTooSmall { needed, available }) => {
                Action::Error(TunnelError::DestinationTooSmall { needed, available })
            }
            Err(e) => self.drop_packet("initiation", &e),
        }
    }

    fn handle_response(
        &mut self,
        msg: &HandshakeResponse<'_>,
        dst: &mut [u8],
        now: Instant,
    ) -> Action {
        if dst.len() < DATA_OVERHEAD {
            return Action::Error(TunnelError::DestinationTooSmall {
                needed: DATA_OVERHEAD,
                available: dst.len(),
            });
        }
        match self.handshake.consume_response(msg, now) {
            Ok(session) => {
                self.sessions.insert(session);
                self.timers.on_handshake_complete(now);
                self.timers.on_packet_received(now, false);
                // Confirms the session to the responder.
                self.encrypt_on_current(&[], dst, now)
                    .unwrap_or(Action::Done)
            }
            Err(e) => self.drop_packet("response", &e),
        }
    }

    fn handle_cookie_reply(&mut self, msg: &CookieReply<'_>, now: Instant) -> Action {
        match self.handshake.consume_cookie_reply(msg, now) {
            Ok(()) => Action::Done,
            Err(e) => self.drop_packet("cookie reply", &e),
        }
    }

    fn handle_data(&mut self, msg: &TransportData<'_>, dst: &mut [u8], now: Instant) -> Action {
        let needed = msg.encrypted.len().saturating_sub(AEAD_TAG_SIZE);
        if dst.len() < needed {
            return Action::Error(TunnelError::DestinationTooSmall {
                needed,
                available: dst.len(),
            });
        }

        let reject_after = self.timers.config().reject_after_time();
        let on_next = self.sessions.slot_of(msg.receiver_index) == Some(Slot::Next);
        let session = match self.sessions.lookup(msg.receiver_index) {
            Some(session) => session,
            None => return self.drop_packet("data", &format_args!("unknown index {:#x}", msg.receiver_index)),
        };
        if session.age(now) >= reject_after {
            return self.drop_packet("data", &"session expired");
        }
        let n = match session.decrypt(msg, dst) {
            Ok(n) => n,
            Err(e) => return self.drop_packet("data", &e),
        };

        if on_next && self.sessions.promote(msg.receiver_index) {
            debug!(
                local_index = format_args!("{:#x}", msg.receiver_index),
                "peer confirmed session"
            );
            self.timers.on_handshake_complete(now);
        }
        self.timers.on_packet_received(now, n > 0);

        if n == 0 {
            trace!("keepalive received");
            return Action::Done;
        }
        match ip::inspect(&dst[..n]) {
            Some((family, len)) => {
                self.rx_bytes += len as u64;
                Action::WriteToTunnel(len, family)
            }
            None => self.drop_packet("data", &"payload is not an IP packet"),
        }
    }

    fn drop_packet(&mut self, kind: &str, reason: &dyn fmt::Display) -> Action {
        self.dropped_packets += 1;
        trace!(kind, %reason, "dropping inbound packet");
        Action::Done
    }
}

fn handshake_failure(err: HandshakeError) -> Action {
    match err {
        HandshakeError::DestinationTooSmall { needed, available } => {
            Action::Error(TunnelError::DestinationTooSmall { needed, available })
        }
        other => {
            warn!(error = %other, "could not write handshake initiation");
            Action::Done
        }
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("handshake", &self.handshake)
            .field("sessions", &self.sessions)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}
