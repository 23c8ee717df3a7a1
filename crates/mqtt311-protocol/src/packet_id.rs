//! Monotone packet-identifier issuance.

use std::sync::atomic::{AtomicU32, Ordering};

/// Issues packet identifiers 1…65535, skipping zero and wrapping back
/// to 1. Safe to share between threads.
#[derive(Debug)]
pub struct IdCounter {
    // Stored as u32 so fetch_update never observes a torn wrap.
    next: AtomicU32,
}

impl IdCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_next(1)
    }

    /// Seeds the counter so the next issued id is `next`.
    #[must_use]
    pub fn with_next(next: u16) -> Self {
        Self {
            next: AtomicU32::new(u32::from(next.max(1))),
        }
    }

    /// Returns the next identifier.
    pub fn next_id(&self) -> u16 {
        let id = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(if current >= u32::from(u16::MAX) {
                    1
                } else {
                    current + 1
                })
            })
            .unwrap_or(1);
        id as u16
    }

    /// Restarts issuance at 1.
    pub fn reset(&self) {
        self.next.store(1, Ordering::Release);
    }
}

impl Default for IdCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_counter_sequence_and_wrap() {
        let counter = IdCounter::new();
        assert_eq!(counter.next_id(), 1);
        assert_eq!(counter.next_id(), 2);

        for _ in 0..u16::MAX as usize - 3 {
            counter.next_id();
        }
        assert_eq!(counter.next_id(), u16::MAX);
        assert_eq!(counter.next_id(), 1);
    }

    #[test]
    fn test_id_counter_reset() {
        let counter = IdCounter::new();
        counter.next_id();
        counter.next_id();
        counter.reset();
        assert_eq!(counter.next_id(), 1);
    }

    #[test]
    fn test_id_counter_seeded() {
        let counter = IdCounter::with_next(10);
        assert_eq!(counter.next_id(), 10);
        assert_eq!(counter.next_id(), 11);
    }

    #[test]
    fn test_id_counter_full_cycle_skips_zero() {
        let counter = IdCounter::new();
        counter.reset();
        for expected in 1..=u16::MAX {
            assert_eq!(counter.next_id(), expected);
        }
        assert_eq!(counter.next_id(), 1);
    }
}
