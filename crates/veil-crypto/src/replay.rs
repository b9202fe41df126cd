//! Sliding window for replay protection of transport counters.
//!
//! The window is a ring of 64-bit words indexed by counter. Moving the top of
//! the window forward clears whole words, so the guaranteed window is one word
//! smaller than the bitmap: counters more than [`ReplayWindow::SIZE`] behind
//! the highest accepted counter are rejected.
//!
//! # Thread Safety
//!
//! This implementation is NOT thread-safe; it lives inside a session that is
//! only touched through `&mut`.

use veil_core::REJECT_AFTER_MESSAGES;

const WORD_BITS: u64 = 64;
const WORDS: usize = 32;
const TOTAL_BITS: u64 = WORD_BITS * WORDS as u64;

/// Tracks which counters have been accepted on a receive key.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    /// One past the highest accepted counter (0 before the first packet).
    next: u64,
    bitmap: [u64; WORDS],
    /// Number of counters accepted so far.
    received: u64,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    /// Counters this far behind the highest accepted one are always rejected.
    pub const SIZE: u64 = TOTAL_BITS - WORD_BITS;

    pub fn new() -> Self {
        Self {
            next: 0,
            bitmap: [0; WORDS],
            received: 0,
        }
    }

    /// Check whether a counter would be accepted.
    ///
    /// Does NOT update internal state. Use `check_and_update` for that.
    pub fn check(&self, counter: u64) -> bool {
        if counter >= REJECT_AFTER_MESSAGES {
            return false;
        }
        let slot = counter + 1;
        if slot + Self::SIZE < self.next {
            return false;
        }
        if slot > self.next {
            return true;
        }
        let (word, bit) = Self::position(slot);
        self.bitmap[word] & bit == 0
    }

    /// Check and update: returns true if the counter is new, false if it was
    /// already seen or has fallen out of the window.
    pub fn check_and_update(&mut self, counter: u64) -> bool {
        if !self.check(counter) {
            return false;
        }
        let slot = counter + 1;
        if slot > self.next {
            let current = self.next / WORD_BITS;
            let target = slot / WORD_BITS;
            let stale = (target - current).min(WORDS as u64);
            for i in 1..=stale {
                self.bitmap[((current + i) % WORDS as u64) as usize] = 0;
            }
            self.next = slot;
        }
        let (word, bit) = Self::position(slot);
        self.bitmap[word] |= bit;
        self.received += 1;
        true
    }

    /// Number of counters the sender has used up to the highest accepted one.
    pub fn expected(&self) -> u64 {
        self.next
    }

    /// Number of distinct counters accepted.
    pub fn received(&self) -> u64 {
        self.received
    }

    fn position(slot: u64) -> (usize, u64) {
        let word = ((slot / WORD_BITS) % WORDS as u64) as usize;
        (word, 1u64 << (slot % WORD_BITS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_packets() {
        let mut window = ReplayWindow::new();

        for i in 0..=100 {
            assert!(window.check_and_update(i), "packet {} should be valid", i);
        }
        assert_eq!(window.received(), 101);
        assert_eq!(window.expected(), 101);
    }

    #[test]
    fn test_replay_detection() {
        let mut window = ReplayWindow::new();

        assert!(window.check_and_update(0));
        assert!(window.check_and_update(1));
        assert!(window.check_and_update(2));

        assert!(!window.check_and_update(0));
        assert!(!window.check_and_update(1));
        assert!(!window.check_and_update(2));
    }

    #[test]
    fn test_out_of_order() {
        let mut window = ReplayWindow::new();

        assert!(window.check_and_update(5));
        assert!(window.check_and_update(3));
        assert!(window.check_and_update(4));
        assert!(window.check_and_update(0));
        assert!(window.check_and_update(2));
        assert!(window.check_and_update(1));

        for i in 0..=5 {
            assert!(!window.check_and_update(i));
        }
        assert_eq!(window.received(), 6);
    }

    #[test]
    fn test_old_packet_rejected() {
        let mut window = ReplayWindow::new();

        assert!(window.check_and_update(0));
        assert!(window.check_and_update(ReplayWindow::SIZE + 10));
        assert!(!window.check(0));
        assert!(!window.check_and_update(5));

        // Just inside the window.
        assert!(window.check_and_update(11));
    }

    #[test]
    fn test_large_jump_clears_window() {
        let mut window = ReplayWindow::new();

        for i in 0..64 {
            assert!(window.check_and_update(i));
        }
        assert!(window.check_and_update(1_000_000));
        assert!(!window.check_and_update(10));
        assert!(window.check_and_update(1_000_000 - 100));
        assert!(!window.check_and_update(1_000_000 - 100));
    }

    #[test]
    fn test_ring_reuse_does_not_leak_old_bits() {
        let mut window = ReplayWindow::new();

        // Walk far enough that every word has been reused several times.
        for i in (0..10 * TOTAL_BITS).step_by(3) {
            assert!(window.check_and_update(i), "counter {i}");
        }
        let top = window.expected() - 1;
        assert!(window.check_and_update(top - 1));
        assert!(!window.check_and_update(top - 1));
    }

    #[test]
    fn test_check_without_update() {
        let mut window = ReplayWindow::new();

        assert!(window.check_and_update(1));
        assert!(window.check_and_update(2));

        assert!(window.check(3));
        assert!(window.check(3));

        assert!(window.check_and_update(3));
        assert!(!window.check(3));
    }

    #[test]
    fn test_reject_after_messages() {
        let window = ReplayWindow::new();
        assert!(!window.check(REJECT_AFTER_MESSAGES));
        assert!(!window.check(u64::MAX));
        assert!(window.check(REJECT_AFTER_MESSAGES - 1));
    }
}
