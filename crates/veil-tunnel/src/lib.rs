//! Point-to-point tunnel engine for Veil.
//!
//! This crate provides:
//! - A three-slot session table (`current`, `previous`, `next`)
//! - The timer rules that drive rekeying, retransmission, and keepalives
//! - [`Tunnel`], the polled facade a host feeds datagrams and ticks into
//!
//! # Design
//!
//! The engine never touches sockets or clocks on its own. Every operation
//! takes caller-owned buffers and returns an [`Action`] telling the host what
//! to do with the bytes it wrote. Each operation has an `_at` variant taking
//! the current [`std::time::Instant`], so hosts and tests control time.

#![forbid(unsafe_code)]

pub mod stats;
pub mod table;
pub mod timers;
mod tunnel;

pub use stats::Stats;
pub use table::{SessionTable, Slot};
pub use timers::{InitiateReason, KeepaliveReason, TimerEvent, Timers};
pub use tunnel::Tunnel;
pub use veil_core::AddressFamily;

use thiserror::Error;

/// Caller-contract violations. Anything the peer or the network can cause
/// is dropped and counted instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    #[error("destination buffer too small: need {needed}, have {available}")]
    DestinationTooSmall { needed: usize, available: usize },

    #[error("source packet of {size} bytes exceeds {max}")]
    SourceTooLarge { size: usize, max: usize },
}

/// What the host should do after an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Nothing to send or deliver.
    Done,
    /// Send the first `n` bytes of the destination buffer to the peer.
    WriteToNetwork(usize),
    /// Deliver the first `n` bytes of the destination buffer to the local
    /// interface as a packet of the given family.
    WriteToTunnel(usize, AddressFamily),
    Error(TunnelError),
}
