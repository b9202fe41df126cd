//! Timer rules for one tunnel.
//!
//! [`Timers`] records when things happened and, on each poll, decides the
//! single most urgent thing to do. It never acts itself; the tunnel carries
//! out the returned [`TimerEvent`].
//!
//! Rules, most urgent first:
//!
//! | Event | Condition |
//! |---|---|
//! | `ExpireAll` | no new handshake for 3 x reject-after-time |
//! | `GiveUp` | initiations unanswered for rekey-attempt-time |
//! | `Initiate(Retransmit)` | last initiation unanswered for rekey-timeout |
//! | `Initiate(Startup)` | nothing ever established, startup grace elapsed |
//! | `Initiate(Rekey*)` | current session too old or too many messages |
//! | `Initiate(LostPeer)` | data sent, nothing heard for keepalive + rekey-timeout |
//! | `Keepalive(Passive)` | data received, nothing sent for keepalive-timeout |
//! | `Keepalive(Persistent)` | persistent interval elapsed since last send |
//! | `Initiate(PersistentKeepalive)` | as above, but no session to carry it |

use crate::table::SessionTable;
use std::time::{Duration, Instant};
use veil_common::TimerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiateReason {
    Startup,
    Retransmit,
    RekeyAfterMessages,
    RekeyAfterTime,
    /// Initiator rekeys before a receive-only session would hit its reject
    /// deadline.
    RekeyBeforeReject,
    LostPeer,
    /// Persistent keepalive came due with no session to send it on.
    PersistentKeepalive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveReason {
    Passive,
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Idle,
    ExpireAll,
    GiveUp,
    Initiate(InitiateReason),
    Keepalive(KeepaliveReason),
}

#[derive(Debug)]
pub struct Timers {
    config: TimerConfig,
    persistent_keepalive: Option<Duration>,
    created: Instant,
    /// First initiation of the current attempt cycle.
    handshake_started: Option<Instant>,
    last_initiation: Option<Instant>,
    last_handshake: Option<Instant>,
    last_data_sent: Option<Instant>,
    last_data_received: Option<Instant>,
    last_packet_sent: Option<Instant>,
    last_packet_received: Option<Instant>,
    retries_exhausted: bool,
    expired_all: bool,
}

impl Timers {
    pub fn new(config: TimerConfig, persistent_keepalive: Option<Duration>, now: Instant) -> Self {
        Self {
            config,
            persistent_keepalive,
            created: now,
            handshake_started: None,
            last_initiation: None,
            last_handshake: None,
            last_data_sent: None,
            last_data_received: None,
            last_packet_sent: None,
            last_packet_received: None,
            retries_exhausted: false,
            expired_all: false,
        }
    }

    pub fn config(&self) -> &TimerConfig {
        &self.config
    }

    pub fn handshake_in_flight(&self) -> bool {
        self.handshake_started.is_some()
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retries_exhausted
    }

    pub fn last_handshake(&self) -> Option<Instant> {
        self.last_handshake
    }

    pub fn on_handshake_initiated(&mut self, now: Instant) {
        self.handshake_started.get_or_insert(now);
        self.last_initiation = Some(now);
        self.retries_exhausted = false;
    }

    pub fn on_handshake_complete(&mut self, now: Instant) {
        self.handshake_started = None;
        self.last_initiation = None;
        self.last_handshake = Some(now);
        self.retries_exhausted = false;
        self.expired_all = false;
    }

    /// `data` is false for keepalives and handshake messages.
    pub fn on_packet_sent(&mut self, now: Instant, data: bool) {
        self.last_packet_sent = Some(now);
        if data {
            self.last_data_sent = Some(now);
        }
    }

    /// `data` is false for keepalives and handshake messages.
    pub fn on_packet_received(&mut self, now: Instant, data: bool) {
        self.last_packet_received = Some(now);
        if data {
            self.last_data_received = Some(now);
        }
    }

    pub fn on_give_up(&mut self) {
        self.handshake_started = None;
        self.last_initiation = None;
        self.retries_exhausted = true;
    }

    pub fn on_expire_all(&mut self) {
        self.handshake_started = None;
        self.last_initiation = None;
        self.expired_all = true;
    }

    /// Outbound traffic restarts a handshake cycle that gave up.
    pub fn reset_retries(&mut self) {
        self.retries_exhausted = false;
    }

    pub fn poll(&self, now: Instant, sessions: &SessionTable) -> TimerEvent {
        let since = |t: Instant| now.saturating_duration_since(t);
        let config = &self.config;

        if !self.expired_all
            && self
                .last_handshake
                .is_some_and(|t| since(t) >= config.reject_after_time() * 3)
        {
            return TimerEvent::ExpireAll;
        }

        if let Some(started) = self.handshake_started {
            if since(started) >= config.rekey_attempt_time() {
                return TimerEvent::GiveUp;
            }
            if self
                .last_initiation
                .map_or(true, |t| since(t) >= config.rekey_timeout())
            {
                return TimerEvent::Initiate(InitiateReason::Retransmit);
            }
        } else if !self.retries_exhausted {
            if let Some(reason) = self.initiate_reason(now, sessions) {
                return TimerEvent::Initiate(reason);
            }
        }

        match self.keepalive_reason(now, sessions) {
            None => TimerEvent::Idle,
            Some(KeepaliveReason::Persistent) if sessions.current().is_none() => {
                if self.handshake_started.is_some() {
                    TimerEvent::Idle
                } else {
                    TimerEvent::Initiate(InitiateReason::PersistentKeepalive)
                }
            }
            Some(reason) => TimerEvent::Keepalive(reason),
        }
    }

    fn initiate_reason(&self, now: Instant, sessions: &SessionTable) -> Option<InitiateReason> {
        let since = |t: Instant| now.saturating_duration_since(t);
        let config = &self.config;

        if sessions.is_empty() && self.last_handshake.is_none() {
            return (since(self.created) >= config.startup_grace())
                .then_some(InitiateReason::Startup);
        }

        if let Some(current) = sessions.current() {
            let established = current.established_at();
            if current.send_counter() >= config.rekey_after_messages {
                return Some(InitiateReason::RekeyAfterMessages);
            }
            if current.is_initiator() {
                let age = current.age(now);
                let sent_on_it = self.last_data_sent.is_some_and(|t| t >= established);
                let received_on_it = self.last_data_received.is_some_and(|t| t >= established);
                if sent_on_it && age >= config.rekey_after_time() {
                    return Some(InitiateReason::RekeyAfterTime);
                }
                let deadline = config
                    .reject_after_time()
                    .saturating_sub(config.keepalive_timeout() + config.rekey_timeout());
                if received_on_it && age >= deadline {
                    return Some(InitiateReason::RekeyBeforeReject);
                }
            }
        }

        let lost_after = config.keepalive_timeout() + config.rekey_timeout();
        if let Some(sent) = self.last_data_sent {
            let heard_since = self.last_packet_received.is_some_and(|r| r >= sent);
            if !heard_since && since(sent) >= lost_after {
                return Some(InitiateReason::LostPeer);
            }
        }
        None
    }

    fn keepalive_reason(&self, now: Instant, sessions: &SessionTable) -> Option<KeepaliveReason> {
        let current = sessions.current();
        let since = |t: Instant| now.saturating_duration_since(t);

        if let (Some(received), Some(_)) = (self.last_data_received, current) {
            let answered = self.last_packet_sent.is_some_and(|s| s >= received);
            if !answered && since(received) >= self.config.keepalive_timeout() {
                return Some(KeepaliveReason::Passive);
            }
        }

        let interval = self.persistent_keepalive?;
        let last_sent = self
            .last_packet_sent
            .or_else(|| current.map(|c| c.established_at()))
            .unwrap_or(self.created);
        (since(last_sent) >= interval).then_some(KeepaliveReason::Persistent)
    }
}
