//! Countdown timers for the ISO-TP timing parameters. Expiry is a pure
//! function of the `now` handed in by the caller; nothing here reads a clock.
use alloc::vec::Vec;
use embassy_time::{Duration, Instant};

//==================================================================================DEADLINE
/// Single countdown, armed with a budget and disarmed explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    expires_at: Option<Instant>,
}

impl Default for Deadline {
    fn default() -> Self {
        Self::new()
    }
}

impl Deadline {
    pub const fn new() -> Self {
        Self { expires_at: None }
    }

    /// (Re-)arm: expires `budget` after `now`.
    pub fn arm(&mut self, now: Instant, budget: Duration) {
        self.expires_at = Some(now + budget);
    }

    pub fn disarm(&mut self) {
        self.expires_at = None;
    }

    pub fn is_armed(&self) -> bool {
        self.expires_at.is_some()
    }

    /// `true` once `now` reaches the expiry instant.
    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }

    /// Time left before expiry; `None` when disarmed.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(now))
    }

    /// Expiry instant, when armed.
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// Disarm and report whether the deadline had fired.
    pub fn take_expired(&mut self, now: Instant) -> bool {
        if self.is_expired(now) {
            self.expires_at = None;
            true
        } else {
            false
        }
    }
}

//==================================================================================SLIDING_WINDOW
/// Several in-flight operations sharing one budget, each keyed by frame identity.
///
/// Every key gets its own start instant; removing one key leaves the others
/// untouched.
#[derive(Debug, Clone)]
pub struct SlidingWindowDeadline {
    budget: Duration,
    entries: Vec<(u32, Instant)>,
}

impl SlidingWindowDeadline {
    pub const fn new(budget: Duration) -> Self {
        Self {
            budget,
            entries: Vec::new(),
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Start tracking `key` from `now`. A key already present restarts.
    pub fn insert(&mut self, key: u32, now: Instant) {
        self.remove(key);
        self.entries.push((key, now));
    }

    /// Stop tracking `key`. Returns `false` when it was unknown.
    pub fn remove(&mut self, key: u32) -> bool {
        match self.entries.iter().position(|(k, _)| *k == key) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: u32) -> bool {
        self.entries.iter().any(|(k, _)| *k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Oldest key whose budget ran out at `now`.
    pub fn expired(&self, now: Instant) -> Option<u32> {
        self.entries
            .iter()
            .filter(|(_, started)| now >= *started + self.budget)
            .min_by_key(|(_, started)| *started)
            .map(|(key, _)| *key)
    }

    /// Earliest expiry among tracked keys.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries
            .iter()
            .map(|(_, started)| *started + self.budget)
            .min()
    }
}
