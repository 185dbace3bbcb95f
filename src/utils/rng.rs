//! Seedable random number generator.
//!
//! A small xorshift PRNG drives weight initialisation and the synthetic digit
//! generator. A fixed seed reproduces a whole training run.

use std::time::{SystemTime, UNIX_EPOCH};

const FALLBACK_STATE: u64 = 0x9e3779b97f4a7c15;

/// Xorshift64 generator.
#[derive(Debug, Clone)]
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    /// Create a generator from an explicit seed (zero maps to a fixed non-zero state).
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { FALLBACK_STATE } else { seed };
        Self { state }
    }

    /// Create a generator seeded from the wall clock.
    pub fn from_time() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self::new(nanos)
    }

    /// Seeded if `seed` is given, clock-seeded otherwise.
    pub fn from_seed_or_time(seed: Option<u64>) -> Self {
        seed.map_or_else(Self::from_time, Self::new)
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 32) as u32
    }

    /// Uniform in `[0, 1)`. Uses the top 24 bits so the result is exact in `f32`.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }

    /// Uniform sample in `[low, high)`.
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        let value = low + (high - low) * self.next_f32();
        // Rounding can land exactly on `high` for wide ranges.
        if value >= high && high > low {
            low
        } else {
            value
        }
    }

    /// Integer sample in `[0, upper)`.
    pub fn gen_usize(&mut self, upper: usize) -> usize {
        if upper == 0 {
            0
        } else {
            (self.next_u32() as usize) % upper
        }
    }

    /// Draw a fresh seed for a child generator.
    pub fn split(&mut self) -> SimpleRng {
        let hi = self.next_u32() as u64;
        let lo = self.next_u32() as u64;
        SimpleRng::new((hi << 32) | lo)
    }
}
