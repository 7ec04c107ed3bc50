//! Interleaved Bloom Filter.
//!
//! Many equally sized Bloom filters share one bit array, interleaved bin by
//! bin: bit (row r, column b) lives at word `r * bin_words + b / 64`. With
//! this layout `bulk_count` reduces to AND-ing the h rows addressed by a
//! query value and adding per-bin popcounts, one word covering 64 bins.
//!
//! Bits are only ever set, never cleared, so `emplace` uses atomic OR and a
//! shared filter can be filled by parallel workers targeting disjoint
//! columns.

use crate::error::{RaptorError, Result};
use crate::wire;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-function multipliers; the filter supports up to five hash functions.
const HASH_SEEDS: [u64; 5] = [
    13_572_355_802_537_770_549, // 2^64 / (e/2)
    13_043_817_825_332_782_213, // 2^64 / sqrt(2)
    10_650_232_656_628_343_401, // 2^64 / sqrt(3)
    16_499_269_484_942_379_435, // 2^64 / (sqrt(5)/2)
    4_893_150_838_803_335_377,  // 2^64 / (3*pi/5)
];

const GOLDEN_RATIO: u64 = 0x9E37_79B9_7F4A_7C15;

pub const MAX_HASH_FUNS: usize = HASH_SEEDS.len();

/// Closed-form Bloom filter sizing: bits per bin so that storing `elements`
/// values with `hash_count` hash functions meets the false-positive rate.
pub fn bin_size_in_bits(fpr: f64, hash_count: usize, elements: usize) -> u64 {
    let elements = elements.max(1);
    let numerator = -((elements * hash_count) as f64);
    let denominator = (1.0 - (fpr.ln() / hash_count as f64).exp()).ln();
    (numerator / denominator).ceil() as u64
}

pub struct Ibf {
    bin_count: usize,
    bin_size: u64,
    hash_count: usize,
    bin_words: usize,
    hash_shift: u32,
    data: Vec<AtomicU64>,
}

impl Ibf {
    /// Zeroed storage for `bin_count` bins of `bin_size` bits each.
    pub fn new(bin_count: usize, bin_size: u64, hash_count: usize) -> Result<Self> {
        if bin_count == 0 {
            return Err(RaptorError::invalid("bin count must be positive"));
        }
        if bin_size == 0 {
            return Err(RaptorError::invalid("bin size must be positive"));
        }
        if hash_count == 0 || hash_count > MAX_HASH_FUNS {
            return Err(RaptorError::invalid(format!(
                "hash function count must be in [1, {}], got {}",
                MAX_HASH_FUNS, hash_count
            )));
        }
        let bin_words = (bin_count + 63) / 64;
        let words = bin_size as usize * bin_words;
        let mut data = Vec::with_capacity(words);
        data.resize_with(words, || AtomicU64::new(0));
        Ok(Self {
            bin_count,
            bin_size,
            hash_count,
            bin_words,
            hash_shift: bin_size.leading_zeros(),
            data,
        })
    }

    #[inline]
    pub fn bin_count(&self) -> usize {
        self.bin_count
    }

    #[inline]
    pub fn bin_size(&self) -> u64 {
        self.bin_size
    }

    #[inline]
    pub fn hash_count(&self) -> usize {
        self.hash_count
    }

    /// Row selected by hash function `j` for `value`.
    #[inline]
    pub fn hash_bits(&self, j: usize, value: u64) -> u64 {
        let mut h = value.wrapping_mul(HASH_SEEDS[j]);
        h ^= h >> self.hash_shift; // fold high entropy into the low bits
        h = h.wrapping_mul(GOLDEN_RATIO);
        h % self.bin_size
    }

    /// Sets the h bits of `value` in column `bin`. Idempotent.
    ///
    /// # Panics
    /// If `bin` is out of range; inserting into a foreign column is a
    /// programming error, not a runtime condition.
    #[inline]
    pub fn emplace(&self, value: u64, bin: usize) {
        assert!(bin < self.bin_count, "bin {} out of range", bin);
        let word_in_row = bin / 64;
        let bit = 1u64 << (bin % 64);
        for j in 0..self.hash_count {
            let row = self.hash_bits(j, value) as usize;
            self.data[row * self.bin_words + word_in_row].fetch_or(bit, Ordering::Relaxed);
        }
    }

    /// Counts, per bin, how many values have all their h row bits set.
    /// Duplicate values count with multiplicity.
    pub fn bulk_count(&self, values: &[u64]) -> Vec<u16> {
        let mut counts = vec![0u16; self.bin_count];
        let mut acc = vec![0u64; self.bin_words];
        for &value in values {
            let row = self.hash_bits(0, value) as usize * self.bin_words;
            for (w, slot) in acc.iter_mut().enumerate() {
                *slot = self.data[row + w].load(Ordering::Relaxed);
            }
            for j in 1..self.hash_count {
                let row = self.hash_bits(j, value) as usize * self.bin_words;
                for (w, slot) in acc.iter_mut().enumerate() {
                    *slot &= self.data[row + w].load(Ordering::Relaxed);
                }
            }
            for (w, &word) in acc.iter().enumerate() {
                let mut bits = word;
                while bits != 0 {
                    let bin = w * 64 + bits.trailing_zeros() as usize;
                    counts[bin] = counts[bin].saturating_add(1);
                    bits &= bits - 1;
                }
            }
        }
        counts
    }

    /// Bin ids whose count reaches `threshold`, ascending.
    pub fn membership(&self, values: &[u64], threshold: usize) -> Vec<usize> {
        self.bulk_count(values)
            .into_iter()
            .enumerate()
            .filter(|&(_, c)| c as usize >= threshold)
            .map(|(bin, _)| bin)
            .collect()
    }

    pub fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        wire::write_u64(w, self.bin_count as u64)?;
        wire::write_u64(w, self.bin_size)?;
        wire::write_u64(w, self.hash_count as u64)?;
        for word in &self.data {
            wire::write_u64(w, word.load(Ordering::Relaxed))?;
        }
        Ok(())
    }

    pub fn read_from(r: &mut impl Read, path: &Path) -> Result<Self> {
        let bin_count = wire::read_u64(r).map_err(|e| RaptorError::io(path, "read", e))? as usize;
        let bin_size = wire::read_u64(r).map_err(|e| RaptorError::io(path, "read", e))?;
        let hash_count = wire::read_u64(r).map_err(|e| RaptorError::io(path, "read", e))? as usize;
        let ibf = Self::new(bin_count, bin_size, hash_count)
            .map_err(|e| RaptorError::format(path, e.to_string()))?;
        for word in &ibf.data {
            let value = wire::read_u64(r).map_err(|e| RaptorError::io(path, "read", e))?;
            word.store(value, Ordering::Relaxed);
        }
        Ok(ibf)
    }
}

impl Clone for Ibf {
    fn clone(&self) -> Self {
        Self {
            bin_count: self.bin_count,
            bin_size: self.bin_size,
            hash_count: self.hash_count,
            bin_words: self.bin_words,
            hash_shift: self.hash_shift,
            data: self
                .data
                .iter()
                .map(|w| AtomicU64::new(w.load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

impl PartialEq for Ibf {
    fn eq(&self, other: &Self) -> bool {
        self.bin_count == other.bin_count
            && self.bin_size == other.bin_size
            && self.hash_count == other.hash_count
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.load(Ordering::Relaxed) == b.load(Ordering::Relaxed))
    }
}

impl std::fmt::Debug for Ibf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ibf")
            .field("bin_count", &self.bin_count)
            .field("bin_size", &self.bin_size)
            .field("hash_count", &self.hash_count)
            .finish_non_exhaustive()
    }
}
