//! A small xorshift PRNG, seeded from the system clock.
//!
//! Not cryptographically secure — it doesn't need to be. It exists to widen
//! the TCP initial sequence number from the source's `rand() % 100` to a
//! full 32-bit value without pulling in a dedicated `rand` dependency for
//! one call site.

use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_SEED: u64 = 0xACE1u64;

#[derive(Clone, Copy)]
pub struct Xorshift64 {
    state: u64,
}

impl Xorshift64 {
    pub fn with_seed(seed: u64) -> Self {
        let s = if seed == 0 { DEFAULT_SEED } else { seed };
        Self { state: s }
    }

    pub fn from_system_time() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(DEFAULT_SEED)
            | 1;
        Self::with_seed(seed)
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = if x == 0 { 0xfeedc0de } else { x };
        self.state
    }

    /// Draw a 32-bit value, used directly as a TCP initial sequence number.
    pub fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }
}
