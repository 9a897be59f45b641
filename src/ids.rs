//! Per-instance id generation.
//!
//! Ids are produced by a permuted counter: a randomly seeded counter is pushed
//! through an odd-multiplier affine map and masked to 53 bits. The map is a
//! bijection on the low 53 bits, so ids never repeat within 2^53 draws and
//! always fit in a JSON number.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

const MASK: u64 = (1 << 53) - 1;
const MULTIPLIER: u64 = 6364136223846793005;
const INCREMENT: u64 = 1442695040888963407;

/// Generator of unique, non-sequential numeric ids.
#[derive(Debug)]
pub struct IdGen {
    counter: AtomicU64,
}

impl IdGen {
    /// Creates a generator with a random seed.
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Creates a generator with a fixed seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            counter: AtomicU64::new(seed),
        }
    }

    /// Returns the next id.
    pub fn next(&self) -> u64 {
        let c = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        c.wrapping_mul(MULTIPLIER).wrapping_add(INCREMENT) & MASK
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Random instance id: 16 lowercase base-36 characters.
pub(crate) fn instance_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    (0..16)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}
