//! Transport sessions: the keys, counters, and replay window produced by one
//! completed handshake.
//!
//! Each packet carries its counter in the clear, and the counter doubles as
//! the AEAD nonce. That lets the receiver decrypt out-of-order datagrams.

use crate::primitives;
use crate::replay::ReplayWindow;
use chacha20poly1305::ChaCha20Poly1305;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use veil_core::packet::write_transport_header;
use veil_core::{TransportData, DATA_HEADER_SIZE, DATA_OVERHEAD, KEY_LEN, REJECT_AFTER_MESSAGES};

/// Session encryption errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("destination buffer too small: need {needed}, have {available}")]
    DestinationTooSmall { needed: usize, available: usize },

    #[error("send counter exhausted")]
    CounterExhausted,

    #[error("replay detected: counter {0}")]
    Replay(u64),

    #[error("authentication failed")]
    Authentication,

    #[error("packet addressed to index {0:#x}")]
    WrongIndex(u32),
}

/// One direction pair of transport keys plus their counters.
pub struct Session {
    local_index: u32,
    peer_index: u32,
    sender: ChaCha20Poly1305,
    receiver: ChaCha20Poly1305,
    send_counter: u64,
    window: ReplayWindow,
    established_at: Instant,
    initiator: bool,
}

impl Session {
    pub fn new(
        local_index: u32,
        peer_index: u32,
        send_key: &[u8; KEY_LEN],
        receive_key: &[u8; KEY_LEN],
        initiator: bool,
        now: Instant,
    ) -> Self {
        Self {
            local_index,
            peer_index,
            sender: primitives::cipher(send_key),
            receiver: primitives::cipher(receive_key),
            send_counter: 0,
            window: ReplayWindow::new(),
            established_at: now,
            initiator,
        }
    }

    /// Index the peer uses to address packets to us.
    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    /// Index we write into outbound packets.
    pub fn peer_index(&self) -> u32 {
        self.peer_index
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.established_at)
    }

    /// The counter the next `encrypt` will use.
    pub fn send_counter(&self) -> u64 {
        self.send_counter
    }

    /// `(expected, received)` inbound counters, for loss estimation.
    pub fn receive_stats(&self) -> (u64, u64) {
        (self.window.expected(), self.window.received())
    }

    /// Encrypt `plaintext` into a complete transport packet in `dst`.
    pub fn encrypt(&mut self, plaintext: &[u8], dst: &mut [u8]) -> Result<usize, SessionError> {
        let needed = plaintext.len() + DATA_OVERHEAD;
        if dst.len() < needed {
            return Err(SessionError::DestinationTooSmall {
                needed,
                available: dst.len(),
            });
        }
        if self.send_counter >= REJECT_AFTER_MESSAGES {
            return Err(SessionError::CounterExhausted);
        }

        let counter = self.send_counter;
        self.send_counter += 1;

        write_transport_header(dst, self.peer_index, counter).map_err(|_| {
            SessionError::DestinationTooSmall {
                needed,
                available: dst.len(),
            }
        })?;
        let n = primitives::seal(
            &self.sender,
            counter,
            &[],
            plaintext,
            &mut dst[DATA_HEADER_SIZE..needed],
        )
        .map_err(|_| SessionError::Authentication)?;
        Ok(DATA_HEADER_SIZE + n)
    }

    /// Decrypt a transport packet into `dst`, enforcing the replay window.
    ///
    /// The window is consulted before decryption and only updated after the
    /// tag verifies, so forged counters cannot advance it.
    pub fn decrypt(
        &mut self,
        packet: &TransportData<'_>,
        dst: &mut [u8],
    ) -> Result<usize, SessionError> {
        if packet.receiver_index != self.local_index {
            return Err(SessionError::WrongIndex(packet.receiver_index));
        }
        if !self.window.check(packet.counter) {
            return Err(SessionError::Replay(packet.counter));
        }
        let needed = packet.encrypted.len().saturating_sub(veil_core::AEAD_TAG_SIZE);
        if dst.len() < needed {
            return Err(SessionError::DestinationTooSmall {
                needed,
                available: dst.len(),
            });
        }

        let n = primitives::open(&self.receiver, packet.counter, &[], packet.encrypted, dst)
            .map_err(|_| SessionError::Authentication)?;

        if !self.window.check_and_update(packet.counter) {
            return Err(SessionError::Replay(packet.counter));
        }
        Ok(n)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("local_index", &format_args!("{:#x}", self.local_index))
            .field("peer_index", &format_args!("{:#x}", self.peer_index))
            .field("send_counter", &self.send_counter)
            .field("initiator", &self.initiator)
            .finish_non_exhaustive()
    }
}
