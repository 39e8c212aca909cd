//! Bloom filter over 32-byte identifiers.
//!
//! The satellite snapshots its pointer DB, folds every live derived piece id
//! into one of these, and ships it to each storage node; the node deletes
//! pieces absent from the filter and older than the `created_before`
//! watermark. False positives only retain garbage a little longer; false
//! negatives are impossible, so live pieces are never deleted.
//!
//! Identifiers are already uniform (hash-derived), so the k probe positions
//! come from double hashing over the id bytes themselves:
//! `h_i = h1 + i * h2 (mod m)` with h1, h2 read from the id.

use serde::{Deserialize, Serialize};

/// Probabilistic membership set for 32-byte ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    hash_count: u32,
}

impl BloomFilter {
    /// Size the filter for `expected` entries at `fp_rate` false-positive
    /// probability (the GC plane uses 1e-4).
    #[must_use]
    pub fn new(expected: usize, fp_rate: f64) -> Self {
        let expected = expected.max(1) as f64;
        let fp_rate = fp_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-(expected * fp_rate.ln()) / (ln2 * ln2)).ceil().max(8.0) as u64;
        let hash_count = ((num_bits as f64 / expected) * ln2).round().clamp(1.0, 32.0) as u32;
        BloomFilter {
            bits: vec![0u8; num_bits.div_ceil(8) as usize],
            num_bits,
            hash_count,
        }
    }

    fn positions(&self, id: &[u8; 32]) -> impl Iterator<Item = u64> + '_ {
        let mut word = [0u8; 8];
        word.copy_from_slice(&id[0..8]);
        let h1 = u64::from_le_bytes(word);
        word.copy_from_slice(&id[8..16]);
        let h2 = u64::from_le_bytes(word) | 1;
        let num_bits = self.num_bits;
        (0..self.hash_count as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % num_bits)
    }

    pub fn add(&mut self, id: &[u8; 32]) {
        let positions: Vec<u64> = self.positions(id).collect();
        for pos in positions {
            self.bits[(pos / 8) as usize] |= 1 << (pos % 8);
        }
    }

    #[must_use]
    pub fn contains(&self, id: &[u8; 32]) -> bool {
        self.positions(id)
            .all(|pos| self.bits[(pos / 8) as usize] & (1 << (pos % 8)) != 0)
    }

    /// Size of the bit array in bytes, for transfer accounting.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.bits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seed: u64) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        Digest::update(&mut hasher, seed.to_le_bytes());
        hasher.finalize().into()
    }

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::new(1000, 1e-4);
        for seed in 0..1000 {
            filter.add(&id(seed));
        }
        for seed in 0..1000 {
            assert!(filter.contains(&id(seed)), "live id {} missing", seed);
        }
    }

    #[test]
    fn test_false_positive_rate_bounded() {
        let mut filter = BloomFilter::new(1000, 1e-4);
        for seed in 0..1000 {
            filter.add(&id(seed));
        }
        let mut false_positives = 0;
        let probes = 20_000u64;
        for seed in 1_000_000..1_000_000 + probes {
            if filter.contains(&id(seed)) {
                false_positives += 1;
            }
        }
        // 1e-4 target; allow an order of magnitude of slack for a small sample
        assert!(
            false_positives <= (probes / 1000).max(5),
            "fp count {} too high",
            false_positives
        );
    }

    #[test]
    fn test_empty_filter_contains_nothing() {
        let filter = BloomFilter::new(10, 1e-4);
        for seed in 0..100 {
            assert!(!filter.contains(&id(seed)));
        }
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut filter = BloomFilter::new(100, 1e-4);
        filter.add(&id(42));
        let bytes = bincode::serialize(&filter).expect("encode");
        let back: BloomFilter = bincode::deserialize(&bytes).expect("decode");
        assert_eq!(filter, back);
        assert!(back.contains(&id(42)));
    }
}
