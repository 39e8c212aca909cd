//! Systematic Reed-Solomon erasure codec on GF(2^8).
//!
//! The unit of encoding is the stripe: `k * share_size` bytes in, `n` shares
//! of `share_size` bytes out, with shares `0..k` equal to the stripe chunks
//! (systematic). A segment is a sequence of stripes; piece `i` is the
//! concatenation of share `i` across all stripes.
//!
//! All operations are deterministic and pure. The codec is parameterized only
//! by `(k, n, share_size)`, so the triple stored in a pointer is sufficient
//! to reproduce shares bit-for-bit.
//!
//! ## Invariants
//!
//! - `encode` then `decode` of any k of the n shares returns the stripe.
//! - `correct` recovers the true share set when at most
//!   `(provided - k) / 2` of the provided shares are corrupted, and refuses
//!   (rather than guessing) when agreement stays below the majority bound.
//! - A short final stripe is zero-padded before encoding; readers truncate
//!   decoded output to the segment size.

use reed_solomon_erasure::galois_8::ReedSolomon;
use thiserror::Error;

use orbit_common::pointer::RedundancyScheme;

/// Attempt bound for subset search in `decode` and `correct`. Exhaustive for
/// the parameter range used in tests; large deployments hit the agreement
/// accept long before the bound.
const MAX_SUBSET_ATTEMPTS: usize = 4096;

#[derive(Debug, Error)]
pub enum ErasureError {
    #[error("not enough shares: got {got}, need {need}")]
    InsufficientShares { got: usize, need: usize },

    #[error("share {index} has size {got}, expected {expected}")]
    ShareSize { index: usize, got: usize, expected: usize },

    #[error("share index {index} out of range (total {total})")]
    ShareIndex { index: usize, total: usize },

    #[error("duplicate share index {index}")]
    DuplicateShare { index: usize },

    #[error("stripe has size {got}, expected {expected}")]
    StripeSize { got: usize, expected: usize },

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("too many corrupted shares to correct")]
    TooManyErrors,

    #[error("codec: {0}")]
    Codec(String),
}

/// Result of a correction pass over downloaded shares.
#[derive(Debug, Clone)]
pub struct Corrected {
    /// The reconstructed stripe, `k * share_size` bytes.
    pub stripe: Vec<u8>,
    /// All `n` shares re-encoded from the corrected stripe; index by
    /// piece number.
    pub shares: Vec<Vec<u8>>,
}

/// A `(k, n, share_size)` codec instance.
pub struct ErasureScheme {
    required: usize,
    total: usize,
    share_size: usize,
    rs: ReedSolomon,
}

impl std::fmt::Debug for ErasureScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErasureScheme")
            .field("required", &self.required)
            .field("total", &self.total)
            .field("share_size", &self.share_size)
            .finish()
    }
}

impl ErasureScheme {
    pub fn new(required: usize, total: usize, share_size: usize) -> Result<Self, ErasureError> {
        if required == 0 || total <= required || share_size == 0 {
            return Err(ErasureError::InvalidParameters(format!(
                "k={} n={} share_size={}",
                required, total, share_size
            )));
        }
        let rs = ReedSolomon::new(required, total - required)
            .map_err(|e| ErasureError::InvalidParameters(e.to_string()))?;
        Ok(ErasureScheme {
            required,
            total,
            share_size,
            rs,
        })
    }

    /// Build the codec matching a pointer's redundancy parameters.
    pub fn from_redundancy(scheme: &RedundancyScheme) -> Result<Self, ErasureError> {
        Self::new(
            scheme.required as usize,
            scheme.total as usize,
            scheme.share_size as usize,
        )
    }

    #[must_use]
    pub fn required(&self) -> usize {
        self.required
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    #[must_use]
    pub fn share_size(&self) -> usize {
        self.share_size
    }

    #[must_use]
    pub fn stripe_size(&self) -> usize {
        self.required * self.share_size
    }

    /// Zero-pad a short final stripe to the full stripe size.
    pub fn pad_stripe(&self, data: &[u8]) -> Result<Vec<u8>, ErasureError> {
        if data.len() > self.stripe_size() {
            return Err(ErasureError::StripeSize {
                got: data.len(),
                expected: self.stripe_size(),
            });
        }
        let mut out = data.to_vec();
        out.resize(self.stripe_size(), 0);
        Ok(out)
    }

    // ════════════════════════════════════════════════════════════════════════
    // STRIPE OPERATIONS
    // ════════════════════════════════════════════════════════════════════════

    /// Encode one full stripe into `n` shares.
    pub fn encode(&self, stripe: &[u8]) -> Result<Vec<Vec<u8>>, ErasureError> {
        if stripe.len() != self.stripe_size() {
            return Err(ErasureError::StripeSize {
                got: stripe.len(),
                expected: self.stripe_size(),
            });
        }
        let mut shares: Vec<Vec<u8>> = Vec::with_capacity(self.total);
        for chunk in stripe.chunks(self.share_size) {
            shares.push(chunk.to_vec());
        }
        shares.resize(self.total, vec![0u8; self.share_size]);
        self.rs
            .encode(&mut shares)
            .map_err(|e| ErasureError::Codec(e.to_string()))?;
        Ok(shares)
    }

    /// Rebuild a single share from a reconstructed stripe.
    pub fn encode_single(&self, stripe: &[u8], piece_num: usize) -> Result<Vec<u8>, ErasureError> {
        if piece_num >= self.total {
            return Err(ErasureError::ShareIndex {
                index: piece_num,
                total: self.total,
            });
        }
        if piece_num < self.required {
            // systematic: data shares are stripe chunks
            if stripe.len() != self.stripe_size() {
                return Err(ErasureError::StripeSize {
                    got: stripe.len(),
                    expected: self.stripe_size(),
                });
            }
            let start = piece_num * self.share_size;
            return Ok(stripe[start..start + self.share_size].to_vec());
        }
        let shares = self.encode(stripe)?;
        Ok(shares[piece_num].clone())
    }

    fn check_shares(&self, shares: &[(usize, Vec<u8>)]) -> Result<(), ErasureError> {
        let mut seen = vec![false; self.total];
        for (index, data) in shares {
            if *index >= self.total {
                return Err(ErasureError::ShareIndex {
                    index: *index,
                    total: self.total,
                });
            }
            if seen[*index] {
                return Err(ErasureError::DuplicateShare { index: *index });
            }
            seen[*index] = true;
            if data.len() != self.share_size {
                return Err(ErasureError::ShareSize {
                    index: *index,
                    got: data.len(),
                    expected: self.share_size,
                });
            }
        }
        Ok(())
    }

    fn decode_from_subset(
        &self,
        shares: &[(usize, Vec<u8>)],
        chosen: &[usize],
    ) -> Result<Vec<u8>, ErasureError> {
        let mut shards: Vec<Option<Vec<u8>>> = vec![None; self.total];
        for &pos in chosen {
            let (index, data) = &shares[pos];
            shards[*index] = Some(data.clone());
        }
        self.rs
            .reconstruct_data(&mut shards)
            .map_err(|e| ErasureError::Codec(e.to_string()))?;
        let mut stripe = Vec::with_capacity(self.stripe_size());
        for shard in shards.into_iter().take(self.required) {
            match shard {
                Some(data) => stripe.extend_from_slice(&data),
                None => return Err(ErasureError::Codec("data shard missing after rebuild".into())),
            }
        }
        Ok(stripe)
    }

    /// Reconstruct a stripe from at least `k` shares.
    ///
    /// The first k provided shares are tried first; if the codec rejects the
    /// subset, alternatives are tried in deterministic order up to a bound.
    pub fn decode(&self, shares: &[(usize, Vec<u8>)]) -> Result<Vec<u8>, ErasureError> {
        self.check_shares(shares)?;
        if shares.len() < self.required {
            return Err(ErasureError::InsufficientShares {
                got: shares.len(),
                need: self.required,
            });
        }

        let mut last_err = None;
        let mut attempts = 0usize;
        let mut combo = Combinations::new(shares.len(), self.required);
        while let Some(chosen) = combo.next() {
            attempts += 1;
            match self.decode_from_subset(shares, chosen) {
                Ok(stripe) => return Ok(stripe),
                Err(e) => last_err = Some(e),
            }
            if attempts >= MAX_SUBSET_ATTEMPTS {
                break;
            }
        }
        Err(last_err.unwrap_or(ErasureError::TooManyErrors))
    }

    /// Detect and correct corrupted shares by majority decoding.
    ///
    /// Decodes candidate subsets and accepts the first codeword that agrees
    /// with at least `provided - (provided - k) / 2` of the provided shares;
    /// at most `(provided - k) / 2` corruptions are therefore tolerated.
    /// Callers compare their share bytes to `Corrected::shares` to find the
    /// altered ones.
    pub fn correct(&self, shares: &[(usize, Vec<u8>)]) -> Result<Corrected, ErasureError> {
        self.check_shares(shares)?;
        let provided = shares.len();
        if provided < self.required {
            return Err(ErasureError::InsufficientShares {
                got: provided,
                need: self.required,
            });
        }
        let max_errors = (provided - self.required) / 2;
        let agreement_needed = provided - max_errors;

        let mut attempts = 0usize;
        // Exclusion search: decode from the first k shares that survive each
        // candidate excluded set. Excluding exactly the corrupted positions
        // is always among the enumerated candidates while within the bound.
        for excluded_count in 0..=max_errors {
            let mut excl = Combinations::new(provided, excluded_count);
            while let Some(excluded) = excl.next() {
                attempts += 1;
                if attempts > MAX_SUBSET_ATTEMPTS {
                    return Err(ErasureError::TooManyErrors);
                }
                let chosen: Vec<usize> = (0..provided)
                    .filter(|pos| !excluded.contains(pos))
                    .take(self.required)
                    .collect();
                if chosen.len() < self.required {
                    continue;
                }
                let stripe = match self.decode_from_subset(shares, &chosen) {
                    Ok(stripe) => stripe,
                    Err(_) => continue,
                };
                let reencoded = self.encode(&stripe)?;
                let agreement = shares
                    .iter()
                    .filter(|(index, data)| &reencoded[*index] == data)
                    .count();
                if agreement >= agreement_needed {
                    return Ok(Corrected {
                        stripe,
                        shares: reencoded,
                    });
                }
            }
        }
        Err(ErasureError::TooManyErrors)
    }

    // ════════════════════════════════════════════════════════════════════════
    // SEGMENT OPERATIONS
    // ════════════════════════════════════════════════════════════════════════

    /// Encode a whole segment into `n` pieces. Piece `i` is share `i` of
    /// every stripe concatenated in stripe order; the final short stripe is
    /// zero-padded.
    pub fn encode_segment(&self, segment: &[u8]) -> Result<Vec<Vec<u8>>, ErasureError> {
        if segment.is_empty() {
            return Err(ErasureError::StripeSize {
                got: 0,
                expected: self.stripe_size(),
            });
        }
        let stripe_count = segment.len().div_ceil(self.stripe_size());
        let mut pieces = vec![Vec::with_capacity(stripe_count * self.share_size); self.total];
        for stripe_raw in segment.chunks(self.stripe_size()) {
            let stripe = self.pad_stripe(stripe_raw)?;
            let shares = self.encode(&stripe)?;
            for (piece, share) in pieces.iter_mut().zip(shares) {
                piece.extend_from_slice(&share);
            }
        }
        Ok(pieces)
    }

    /// Reconstruct a segment of `segment_size` bytes from at least `k`
    /// pieces, decoding stripe by stripe and truncating the padded tail.
    pub fn decode_segment(
        &self,
        pieces: &[(usize, Vec<u8>)],
        segment_size: u64,
    ) -> Result<Vec<u8>, ErasureError> {
        if pieces.len() < self.required {
            return Err(ErasureError::InsufficientShares {
                got: pieces.len(),
                need: self.required,
            });
        }
        let stripe_count = (segment_size as usize).div_ceil(self.stripe_size());
        let piece_len = stripe_count * self.share_size;
        for (index, data) in pieces {
            if data.len() != piece_len {
                return Err(ErasureError::ShareSize {
                    index: *index,
                    got: data.len(),
                    expected: piece_len,
                });
            }
        }

        let mut segment = Vec::with_capacity(stripe_count * self.stripe_size());
        for stripe_index in 0..stripe_count {
            let offset = stripe_index * self.share_size;
            let shares: Vec<(usize, Vec<u8>)> = pieces
                .iter()
                .map(|(index, data)| (*index, data[offset..offset + self.share_size].to_vec()))
                .collect();
            segment.extend_from_slice(&self.decode(&shares)?);
        }
        segment.truncate(segment_size as usize);
        Ok(segment)
    }

    /// Rebuild whole pieces for `rebuild_nums` from surviving pieces,
    /// stripe by stripe. Used by the repair worker.
    pub fn rebuild_pieces(
        &self,
        pieces: &[(usize, Vec<u8>)],
        rebuild_nums: &[u16],
        segment_size: u64,
    ) -> Result<Vec<(u16, Vec<u8>)>, ErasureError> {
        for &num in rebuild_nums {
            if num as usize >= self.total {
                return Err(ErasureError::ShareIndex {
                    index: num as usize,
                    total: self.total,
                });
            }
        }
        let stripe_count = (segment_size as usize).div_ceil(self.stripe_size());
        let mut rebuilt: Vec<(u16, Vec<u8>)> = rebuild_nums
            .iter()
            .map(|&num| (num, Vec::with_capacity(stripe_count * self.share_size)))
            .collect();

        for stripe_index in 0..stripe_count {
            let offset = stripe_index * self.share_size;
            let shares: Vec<(usize, Vec<u8>)> = pieces
                .iter()
                .map(|(index, data)| (*index, data[offset..offset + self.share_size].to_vec()))
                .collect();
            let stripe = self.decode(&shares)?;
            for (num, piece) in rebuilt.iter_mut() {
                piece.extend_from_slice(&self.encode_single(&stripe, *num as usize)?);
            }
        }
        Ok(rebuilt)
    }
}

/// Lexicographic k-combination iterator over `0..n`, allocation-free across
/// steps. Yields indices into the caller's share slice.
struct Combinations {
    n: usize,
    k: usize,
    current: Vec<usize>,
    started: bool,
    done: bool,
}

impl Combinations {
    fn new(n: usize, k: usize) -> Self {
        Combinations {
            n,
            k,
            current: (0..k).collect(),
            started: false,
            done: k > n,
        }
    }

    fn next(&mut self) -> Option<&[usize]> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            return Some(&self.current);
        }
        if self.k == 0 {
            self.done = true;
            return None;
        }
        // advance rightmost index that can move
        let mut i = self.k;
        loop {
            if i == 0 {
                self.done = true;
                return None;
            }
            i -= 1;
            if self.current[i] + 1 <= self.n - (self.k - i) {
                self.current[i] += 1;
                for j in i + 1..self.k {
                    self.current[j] = self.current[j - 1] + 1;
                }
                return Some(&self.current);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn scheme(k: usize, n: usize, share: usize) -> ErasureScheme {
        ErasureScheme::new(k, n, share).expect("scheme")
    }

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen()).collect()
    }

    #[test]
    fn test_encode_is_systematic() {
        let s = scheme(2, 4, 8);
        let stripe = random_bytes(16, 1);
        let shares = s.encode(&stripe).expect("encode");
        assert_eq!(shares.len(), 4);
        assert_eq!(shares[0], stripe[..8]);
        assert_eq!(shares[1], stripe[8..]);
    }

    #[test]
    fn test_decode_any_k_of_n() {
        let s = scheme(2, 4, 16);
        let stripe = random_bytes(32, 2);
        let shares = s.encode(&stripe).expect("encode");

        for a in 0..4 {
            for b in a + 1..4 {
                let subset = vec![(a, shares[a].clone()), (b, shares[b].clone())];
                assert_eq!(s.decode(&subset).expect("decode"), stripe, "subset ({}, {})", a, b);
            }
        }
    }

    #[test]
    fn test_decode_rejects_short_input() {
        let s = scheme(3, 6, 4);
        let stripe = random_bytes(12, 3);
        let shares = s.encode(&stripe).expect("encode");
        let err = s.decode(&shares[..2].iter().cloned().enumerate().collect::<Vec<_>>());
        assert!(matches!(err, Err(ErasureError::InsufficientShares { .. })));
    }

    #[test]
    fn test_decode_rejects_duplicates_and_bad_sizes() {
        let s = scheme(2, 4, 4);
        let stripe = random_bytes(8, 4);
        let shares = s.encode(&stripe).expect("encode");

        let dup = vec![(0, shares[0].clone()), (0, shares[0].clone())];
        assert!(matches!(s.decode(&dup), Err(ErasureError::DuplicateShare { .. })));

        let bad = vec![(0, shares[0].clone()), (1, vec![0u8; 3])];
        assert!(matches!(s.decode(&bad), Err(ErasureError::ShareSize { .. })));

        let oor = vec![(0, shares[0].clone()), (9, shares[1].clone())];
        assert!(matches!(s.decode(&oor), Err(ErasureError::ShareIndex { .. })));
    }

    #[test]
    fn test_encode_single_matches_encode() {
        let s = scheme(3, 7, 8);
        let stripe = random_bytes(24, 5);
        let shares = s.encode(&stripe).expect("encode");
        for num in 0..7 {
            assert_eq!(s.encode_single(&stripe, num).expect("single"), shares[num]);
        }
    }

    #[test]
    fn test_correct_fixes_one_corruption() {
        let s = scheme(2, 4, 16);
        let stripe = random_bytes(32, 6);
        let shares = s.encode(&stripe).expect("encode");

        let mut provided: Vec<(usize, Vec<u8>)> =
            shares.iter().cloned().enumerate().collect();
        provided[1].1[0] ^= 0xff; // corrupt share 1

        let corrected = s.correct(&provided).expect("correct");
        assert_eq!(corrected.stripe, stripe);
        for (num, share) in shares.iter().enumerate() {
            assert_eq!(&corrected.shares[num], share);
        }
        // the caller can now spot the altered share
        assert_ne!(provided[1].1, corrected.shares[1]);
        assert_eq!(provided[0].1, corrected.shares[0]);
    }

    #[test]
    fn test_correct_within_bound_multiple_corruptions() {
        // (n - k) / 2 = 3 tolerated
        let s = scheme(4, 10, 8);
        let stripe = random_bytes(32, 7);
        let shares = s.encode(&stripe).expect("encode");
        let mut provided: Vec<(usize, Vec<u8>)> =
            shares.iter().cloned().enumerate().collect();
        for bad in [0usize, 5, 9] {
            provided[bad].1[2] ^= 0x55;
        }
        let corrected = s.correct(&provided).expect("correct");
        assert_eq!(corrected.stripe, stripe);
    }

    #[test]
    fn test_correct_at_exact_bound() {
        // provided = 6, k = 2: (6 - 2) / 2 = 2 corruptions tolerated
        let s = scheme(2, 6, 8);
        let stripe = random_bytes(16, 8);
        let shares = s.encode(&stripe).expect("encode");
        let mut provided: Vec<(usize, Vec<u8>)> =
            shares.iter().cloned().enumerate().collect();
        provided[0].1[0] ^= 1;
        provided[4].1[7] ^= 0xa0;
        let corrected = s.correct(&provided).expect("correct");
        assert_eq!(corrected.stripe, stripe);
        assert_eq!(corrected.shares, shares);
    }

    #[test]
    fn test_segment_roundtrip_with_padding() {
        let s = scheme(2, 4, 8);
        // 3 full stripes plus a 5-byte tail
        let segment = random_bytes(16 * 3 + 5, 9);
        let pieces = s.encode_segment(&segment).expect("encode segment");
        assert_eq!(pieces.len(), 4);
        for piece in &pieces {
            assert_eq!(piece.len(), 4 * 8); // 4 stripes after padding
        }

        let got = s
            .decode_segment(&[(1, pieces[1].clone()), (3, pieces[3].clone())], segment.len() as u64)
            .expect("decode segment");
        assert_eq!(got, segment);
    }

    #[test]
    fn test_rebuild_pieces() {
        let s = scheme(2, 4, 8);
        let segment = random_bytes(40, 10);
        let pieces = s.encode_segment(&segment).expect("encode");

        let survivors = vec![(0usize, pieces[0].clone()), (2, pieces[2].clone())];
        let rebuilt = s
            .rebuild_pieces(&survivors, &[1, 3], segment.len() as u64)
            .expect("rebuild");
        assert_eq!(rebuilt.len(), 2);
        assert_eq!(rebuilt[0], (1, pieces[1].clone()));
        assert_eq!(rebuilt[1], (3, pieces[3].clone()));
    }

    #[test]
    fn test_boundary_stripes_decode() {
        let s = scheme(2, 4, 8);
        let segment = random_bytes(16 * 4, 11); // exact multiple, no padding
        let pieces = s.encode_segment(&segment).expect("encode");
        let got = s
            .decode_segment(&[(0, pieces[0].clone()), (1, pieces[1].clone())], segment.len() as u64)
            .expect("decode");
        assert_eq!(got, segment);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(ErasureScheme::new(0, 4, 8).is_err());
        assert!(ErasureScheme::new(4, 4, 8).is_err());
        assert!(ErasureScheme::new(2, 4, 0).is_err());
    }
}
