//! Session id generation.
//!
//! Ids are monotonically increasing from a random starting point and never 0.
//! A dedicated mutex serialises generation so two threads can never observe
//! the same id.

use std::sync::{Mutex, PoisonError};

use rand::Rng;

#[derive(Debug)]
pub struct SessionIdGenerator {
    next: Mutex<u64>,
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionIdGenerator {
    /// Start at a random point in the lower 2^32 so ids from a restarted
    /// process are unlikely to collide with stale ones.
    pub fn new() -> Self {
        Self::starting_at(rand::thread_rng().gen_range(1..=u64::from(u32::MAX)))
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: Mutex::new(first.max(1)),
        }
    }

    pub fn next_id(&self) -> u64 {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let id = *next;
        *next = match next.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn ids_are_monotonic_and_nonzero() {
        let ids = SessionIdGenerator::starting_at(0);
        let a = ids.next_id();
        let b = ids.next_id();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn wrap_skips_zero() {
        let ids = SessionIdGenerator::starting_at(u64::MAX);
        assert_eq!(ids.next_id(), u64::MAX);
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn concurrent_generation_never_collides() {
        let ids = Arc::new(SessionIdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..1000).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert_ne!(id, 0);
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 8000);
    }
}
