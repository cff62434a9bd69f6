//! Key hashing (spec §4.1).
//!
//! Callable without the lock: the caller hashes the key once, then takes
//! the write or read lock before walking the chain (`Cache::slot_of`
//! turns the hash into `hash mod N` against the live header's `nslots`).
//! The hash must be identical across every process that maps the region
//! (two processes computing different hashes for the same key would
//! violate I1), so `KeyHasher` is seeded with fixed constants rather than
//! `ahash`'s default per-process random state.
use ahash::AHasher;
use std::hash::Hasher;

const SEED_0: u64 = 0x5d79_b2d8_a3c1_6f49;
const SEED_1: u64 = 0x1f83_d9ab_fb41_bd6b;

/// Hash a key the same way in every process: fixed seed, full byte range.
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = AHasher::new_with_keys(SEED_0 as u128, SEED_1 as u128);
    hasher.write(key);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_across_calls() {
        assert_eq!(hash_key(b"alpha"), hash_key(b"alpha"));
        assert_ne!(hash_key(b"alpha"), hash_key(b"beta"));
    }
}
