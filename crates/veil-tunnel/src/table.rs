//! Sessions of one tunnel, by role.
//!
//! `current` encrypts outbound traffic. `previous` only decrypts, so packets
//! in flight during a rekey still arrive. `next` holds a responder-side
//! session until the initiator proves it has the keys by sending on it.

use std::time::{Duration, Instant};
use tracing::debug;
use veil_crypto::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Current,
    Previous,
    Next,
}

/// At most one session per [`Slot`], plus the local index allocator.
#[derive(Debug)]
pub struct SessionTable {
    current: Option<Session>,
    previous: Option<Session>,
    next: Option<Session>,
    prefix: u32,
    next_low: u8,
}

impl SessionTable {
    /// `index_prefix` supplies the upper 24 bits of every local index.
    pub fn new(index_prefix: u32) -> Self {
        Self {
            current: None,
            previous: None,
            next: None,
            prefix: index_prefix & 0x00FF_FFFF,
            next_low: rand::random(),
        }
    }

    /// Next free local index, skipping indices held by sessions or listed
    /// in `reserved`.
    pub fn allocate_index(&mut self, reserved: &[u32]) -> u32 {
        let base = self.prefix << 8;
        let start = self.next_low;
        // Three sessions and two pending initiations never fill 256 slots.
        let low = (0..=u8::MAX)
            .map(|i| start.wrapping_add(i))
            .find(|&low| {
                let index = base | u32::from(low);
                !self.contains_index(index) && !reserved.contains(&index)
            })
            .unwrap_or(start);
        self.next_low = low.wrapping_add(1);
        base | u32::from(low)
    }

    /// Install an initiator-side session: it becomes `current`, the old
    /// `current` becomes `previous`, the old `previous` is dropped.
    pub fn insert(&mut self, session: Session) {
        debug!(local_index = format_args!("{:#x}", session.local_index()), "session installed");
        self.previous = self.current.replace(session);
    }

    /// Park a responder-side session until the peer sends on it.
    pub fn insert_next(&mut self, session: Session) {
        self.next = Some(session);
    }

    /// Move `next` into `current` if it carries `index`.
    pub fn promote(&mut self, index: u32) -> bool {
        match self.next.take() {
            Some(session) if session.local_index() == index => {
                self.insert(session);
                true
            }
            other => {
                self.next = other;
                false
            }
        }
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Session> {
        self.current.as_mut()
    }

    pub fn slot_of(&self, index: u32) -> Option<Slot> {
        self.iter()
            .find(|(_, s)| s.local_index() == index)
            .map(|(slot, _)| slot)
    }

    pub fn contains_index(&self, index: u32) -> bool {
        self.slot_of(index).is_some()
    }

    pub fn lookup(&mut self, index: u32) -> Option<&mut Session> {
        [&mut self.current, &mut self.previous, &mut self.next]
            .into_iter()
            .filter_map(Option::as_mut)
            .find(|s| s.local_index() == index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Slot, &Session)> {
        [
            (Slot::Current, self.current.as_ref()),
            (Slot::Previous, self.previous.as_ref()),
            (Slot::Next, self.next.as_ref()),
        ]
        .into_iter()
        .filter_map(|(slot, s)| s.map(|s| (slot, s)))
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.previous.is_none() && self.next.is_none()
    }

    /// Drop sessions at least `reject_after` old. Returns how many went.
    pub fn expire_stale(&mut self, now: Instant, reject_after: Duration) -> usize {
        let mut expired = 0;
        for slot in [&mut self.current, &mut self.previous, &mut self.next] {
            if slot.as_ref().is_some_and(|s| s.age(now) >= reject_after) {
                *slot = None;
                expired += 1;
            }
        }
        expired
    }

    /// Drop every session; their keys are zeroized as they go.
    pub fn clear(&mut self) {
        self.current = None;
        self.previous = None;
        self.next = None;
    }
}
