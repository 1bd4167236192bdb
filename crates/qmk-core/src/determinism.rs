//! Deterministic primitives
//!
//! Measurement sampling and content hashing must be reproducible: the same
//! certified graph, seed, and backend must produce byte-identical event
//! streams. The RNG is an explicit value threaded from the job into the
//! backend; no code in the kernel consults a process-global RNG.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha3::{Digest, Sha3_256};

/// Seeded ChaCha20 stream, one per job.
#[derive(Debug, Clone)]
pub struct DeterministicRng {
    seed: u64,
    rng: ChaCha20Rng,
}

impl DeterministicRng {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: ChaCha20Rng::seed_from_u64(seed),
        }
    }

    /// Derive an independent stream for a labeled sub-purpose, so adding a
    /// consumer never shifts the draws of another.
    pub fn derive(&self, label: &str) -> Self {
        let mut hasher = ContentHash::new();
        hasher.update(&self.seed.to_le_bytes());
        hasher.update(label.as_bytes());
        Self {
            seed: self.seed,
            rng: ChaCha20Rng::from_seed(hasher.finalize()),
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    pub fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    pub fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest);
    }

    /// Uniform draw in `[0, 1)` with 53 bits of precision.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Bernoulli draw: true with probability `p`.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }
}

/// SHA3-256 content hashing for graphs and snapshots.
#[derive(Debug, Clone, Default)]
pub struct ContentHash {
    hasher: Sha3_256,
}

impl ContentHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        self.hasher.finalize().into()
    }

    /// One-shot digest.
    pub fn digest(data: &[u8]) -> [u8; 32] {
        let mut h = Self::new();
        h.update(data);
        h.finalize()
    }

    /// Lowercase hex rendering of a digest.
    pub fn hex(digest: &[u8; 32]) -> String {
        let mut out = String::with_capacity(64);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}
