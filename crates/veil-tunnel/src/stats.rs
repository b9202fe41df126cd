//! Read-only tunnel statistics.

use crate::table::{SessionTable, Slot};
use serde::Serialize;
use std::time::Duration;

/// Snapshot returned by [`crate::Tunnel::stats`]. Nothing in the engine
/// reads these back.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Stats {
    /// `None` until a handshake has completed.
    pub time_since_last_handshake: Option<Duration>,
    /// Plaintext bytes encrypted and sent.
    pub tx_bytes: u64,
    /// Plaintext bytes delivered to the tunnel interface.
    pub rx_bytes: u64,
    /// Estimated fraction of inbound packets lost, 0.0 to 1.0.
    pub loss: f32,
    pub rtt: Option<Duration>,
    pub handshake_attempts: u64,
    pub retries_exhausted: bool,
    /// Inbound datagrams dropped for any protocol reason.
    pub dropped_packets: u64,
}

/// Weighted loss over the live sessions, newest weighted highest.
pub(crate) fn estimate_loss(sessions: &SessionTable) -> f32 {
    let mut weighted = 0.0f64;
    let mut total_weight = 0.0f64;
    for (slot, session) in sessions.iter() {
        let (expected, received) = session.receive_stats();
        if expected == 0 {
            continue;
        }
        let weight = match slot {
            Slot::Current => 9.0,
            Slot::Previous => 3.0,
            Slot::Next => 1.0,
        };
        let lost = expected.saturating_sub(received) as f64 / expected as f64;
        weighted += weight * lost;
        total_weight += weight;
    }
    if total_weight == 0.0 {
        0.0
    } else {
        (weighted / total_weight) as f32
    }
}
