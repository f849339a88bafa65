//! Per-packet entropy for pluggable packet filters.
//!
//! The transport itself does not consume nonces; a cipher filter layered on
//! top of a session does. The trait is deliberately tiny so such a filter
//! can swap in a deterministic source under test.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// A source of per-packet nonce bytes.
pub trait Entropy {
    /// Fill `nonce` with the next bytes of the stream.
    fn fill(&mut self, nonce: &mut [u8]);
}

/// Forward-chained pseudo-random nonce stream.
///
/// Seeded once from the operating system; every `fill` advances the chain,
/// so no two packets observe the same nonce bytes.
pub struct ChainedNonce {
    rng: StdRng,
}

impl ChainedNonce {
    /// Create a source seeded from OS entropy.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a source from a fixed seed, for reproducible tests.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: StdRng::from_seed(seed),
        }
    }
}

impl Default for ChainedNonce {
    fn default() -> Self {
        Self::new()
    }
}

impl Entropy for ChainedNonce {
    fn fill(&mut self, nonce: &mut [u8]) {
        self.rng.fill_bytes(nonce);
    }
}
