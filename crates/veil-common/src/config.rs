//! Tunnel configuration.
//!
//! Every field has a default, so a config file only needs the values it
//! changes. Durations are plain integers with the unit in the field name.
//!
//! ```json
//! {
//!   "private_key": "<base64 or hex>",
//!   "peer_public_key": "<base64 or hex>",
//!   "tunnel": { "persistent_keepalive_secs": 25 }
//! }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use veil_core::{
    COOKIE_EXPIRATION_TIME, KEEPALIVE_TIMEOUT, MAX_QUEUED_PACKETS, REJECT_AFTER_MESSAGES,
    REJECT_AFTER_TIME, REKEY_AFTER_MESSAGES, REKEY_AFTER_TIME, REKEY_ATTEMPT_TIME, REKEY_TIMEOUT,
};

/// Session lifetime and retry thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Initiate a new handshake once a session has sent this many messages.
    pub rekey_after_messages: u64,
    /// Refuse to encrypt past this counter.
    pub reject_after_messages: u64,
    /// Initiator rekeys sessions older than this. Default 120s.
    pub rekey_after_time_secs: u64,
    /// Sessions older than this are unusable. Default 180s.
    pub reject_after_time_secs: u64,
    /// Give up retransmitting an initiation after this long. Default 90s.
    pub rekey_attempt_time_secs: u64,
    /// Retransmit interval for unanswered initiations. Default 5000ms.
    pub rekey_timeout_ms: u64,
    /// Passive keepalive interval. Default 10000ms.
    pub keepalive_timeout_ms: u64,
    /// Lifetime of a cookie received from the peer. Default 120s.
    pub cookie_expiration_secs: u64,
    /// Delay before the first handshake after construction. Default 0.
    pub startup_grace_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            rekey_after_messages: REKEY_AFTER_MESSAGES,
            reject_after_messages: REJECT_AFTER_MESSAGES,
            rekey_after_time_secs: REKEY_AFTER_TIME.as_secs(),
            reject_after_time_secs: REJECT_AFTER_TIME.as_secs(),
            rekey_attempt_time_secs: REKEY_ATTEMPT_TIME.as_secs(),
            rekey_timeout_ms: REKEY_TIMEOUT.as_millis() as u64,
            keepalive_timeout_ms: KEEPALIVE_TIMEOUT.as_millis() as u64,
            cookie_expiration_secs: COOKIE_EXPIRATION_TIME.as_secs(),
            startup_grace_ms: 0,
        }
    }
}

impl TimerConfig {
    pub fn rekey_after_time(&self) -> Duration {
        Duration::from_secs(self.rekey_after_time_secs)
    }

    pub fn reject_after_time(&self) -> Duration {
        Duration::from_secs(self.reject_after_time_secs)
    }

    pub fn rekey_attempt_time(&self) -> Duration {
        Duration::from_secs(self.rekey_attempt_time_secs)
    }

    pub fn rekey_timeout(&self) -> Duration {
        Duration::from_millis(self.rekey_timeout_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    pub fn cookie_expiration(&self) -> Duration {
        Duration::from_secs(self.cookie_expiration_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    /// Reject combinations that would make the timer rules contradict
    /// each other.
    pub fn validate(&self) -> Result<()> {
        if self.rekey_after_messages == 0 || self.rekey_after_messages > self.reject_after_messages
        {
            return Err(Error::config(
                "rekey_after_messages must be in 1..=reject_after_messages",
            ));
        }
        if self.reject_after_messages > REJECT_AFTER_MESSAGES {
            return Err(Error::config(format!(
                "reject_after_messages exceeds {REJECT_AFTER_MESSAGES}"
            )));
        }
        if self.rekey_after_time_secs == 0
            || self.rekey_after_time_secs >= self.reject_after_time_secs
        {
            return Err(Error::config(
                "rekey_after_time_secs must be non-zero and below reject_after_time_secs",
            ));
        }
        if self.rekey_timeout_ms == 0 || self.keepalive_timeout_ms == 0 {
            return Err(Error::config(
                "rekey_timeout_ms and keepalive_timeout_ms must be non-zero",
            ));
        }
        if self.reject_after_time() <= self.keepalive_timeout() + self.rekey_timeout() {
            return Err(Error::config(
                "reject_after_time_secs must exceed keepalive plus rekey timeout",
            ));
        }
        Ok(())
    }
}

/// Per-tunnel settings besides the keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Send a keepalive at this interval regardless of traffic; 0 disables.
    pub persistent_keepalive_secs: u16,
    /// Upper 24 bits of every local session index.
    pub index_prefix: u32,
    /// Handshake messages per second before mac2 cookies are demanded.
    pub handshake_rate_limit: u64,
    /// Plaintext packets held while a handshake is in flight.
    pub max_queued_packets: usize,
    pub timers: TimerConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            persistent_keepalive_secs: 0,
            index_prefix: 0,
            handshake_rate_limit: 100,
            max_queued_packets: MAX_QUEUED_PACKETS,
            timers: TimerConfig::default(),
        }
    }
}

impl TunnelConfig {
    pub fn persistent_keepalive(&self) -> Option<Duration> {
        match self.persistent_keepalive_secs {
            0 => None,
            secs => Some(Duration::from_secs(u64::from(secs))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.index_prefix > 0x00FF_FFFF {
            return Err(Error::config(format!(
                "index_prefix {:#x} does not fit in 24 bits",
                self.index_prefix
            )));
        }
        if self.max_queued_packets == 0 {
            return Err(Error::config("max_queued_packets must be non-zero"));
        }
        self.timers.validate()
    }
}

/// One side of a point-to-point tunnel as stored on disk.
///
/// Keys stay encoded here; decoding belongs to the key module so this
/// crate carries no cryptography.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub private_key: String,
    pub peer_public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

impl PeerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: PeerConfig = serde_json::from_str(json)?;
        config.tunnel.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
            .map_err(|e| Error::config(format!("{}: {e}", path.display())))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
