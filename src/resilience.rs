// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconnect backoff.
//!
//! [`Backoff`] tracks the delay between reconnect attempts of the reliable
//! transport: it starts at a floor, doubles after every failed attempt up to
//! a ceiling, and returns to the floor after a successful connect. Every wait
//! adds uniform jitter in `[0, 1)` seconds so that many relays restarting
//! together do not reconnect in lockstep.
//!
//! # Backoff Schedule (floor 1s, ceiling 60s)
//!
//! ```text
//! Failure  Base   Wait
//! -------  ----   ----------
//! 1        1s     1s + jitter
//! 2        2s     2s + jitter
//! 3        4s     4s + jitter
//! ...
//! 6        32s    32s + jitter
//! 7+       60s    60s + jitter (capped)
//! ```

use crate::config::ReliableConfig;
use rand::Rng;
use std::time::Duration;

/// Upper bound (exclusive) of the jitter added to each wait.
pub const MAX_JITTER: Duration = Duration::from_secs(1);

/// Capped exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    /// Create a backoff starting at `floor`, never exceeding `ceiling`.
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Backoff using the transport's configured floor and ceiling.
    pub fn from_config(config: &ReliableConfig) -> Self {
        Self::new(config.min_backoff(), config.max_backoff())
    }

    /// Base delay the next failure will wait (without jitter).
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Return to the floor after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    /// Delay to wait after a failure, then double the base for next time.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    /// [`next_delay`](Self::next_delay) with a caller-supplied RNG.
    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.current.min(self.ceiling);
        let jitter = Duration::from_nanos(rng.gen_range(0..MAX_JITTER.as_nanos() as u64));
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        base + jitter
    }
}
