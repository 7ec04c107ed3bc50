//! Hierarchical Interleaved Bloom Filter.
//!
//! A tree of IBFs in which a technical bin either stores (a split of) one
//! user bin's minimisers directly or stands for an entire child subtree
//! ("merged bin"). Small user bins share space this way while queries still
//! run one `bulk_count` per visited node.

pub mod build;
pub mod layout;

use crate::error::{RaptorError, Result};
use crate::ibf::Ibf;
use crate::wire;
use std::io::{Read, Write};
use std::path::Path;

const MAX_SERIALIZED_IBFS: u64 = 1 << 24;

/// Maps technical bins back to the user bins they store.
#[derive(Debug, Clone, PartialEq)]
pub struct UserBins {
    num_user_bins: u64,
    /// Per IBF, per technical bin: the user bin stored there, or -1 for
    /// merged and padding bins.
    bin_indices: Vec<Vec<i64>>,
}

impl UserBins {
    pub fn new(num_user_bins: u64, bin_indices: Vec<Vec<i64>>) -> Self {
        Self {
            num_user_bins,
            bin_indices,
        }
    }

    #[inline]
    pub fn num_user_bins(&self) -> u64 {
        self.num_user_bins
    }

    #[inline]
    pub fn bin_indices_of_ibf(&self, ibf_idx: usize) -> &[i64] {
        &self.bin_indices[ibf_idx]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hibf {
    /// IBFs of the tree; index 0 is the root.
    pub ibf_vector: Vec<Ibf>,
    /// Per IBF, per technical bin: the bin's own IBF index for leaf bins,
    /// the child IBF index for merged bins.
    pub next_ibf_id: Vec<Vec<i64>>,
    pub user_bins: UserBins,
}

impl Hibf {
    /// User bins matching `values` with at least `threshold` shared hashes
    /// on every node along their root path. Sorted, deduplicated.
    pub fn membership(&self, values: &[u64], threshold: usize) -> Vec<usize> {
        let mut hits = Vec::new();
        self.collect_hits(0, values, threshold, &mut hits);
        hits.sort_unstable();
        hits.dedup();
        hits
    }

    fn collect_hits(&self, ibf_idx: usize, values: &[u64], threshold: usize, hits: &mut Vec<usize>) {
        let counts = self.ibf_vector[ibf_idx].bulk_count(values);
        let next = &self.next_ibf_id[ibf_idx];
        let bins = self.user_bins.bin_indices_of_ibf(ibf_idx);
        for (bin, &count) in counts.iter().enumerate() {
            if (count as usize) < threshold {
                continue;
            }
            let target = next[bin] as usize;
            if target == ibf_idx {
                let user_bin = bins[bin];
                if user_bin >= 0 {
                    hits.push(user_bin as usize);
                }
            } else {
                self.collect_hits(target, values, threshold, hits);
            }
        }
    }

    /// Structural consistency: matching lengths, in-range links, and a
    /// proper tree below the root (no cycles, no shared children).
    pub fn validate(&self) -> Result<()> {
        let n = self.ibf_vector.len();
        if n == 0 {
            return Err(RaptorError::corruption("empty IBF vector".to_string()));
        }
        if self.next_ibf_id.len() != n || self.user_bins.bin_indices.len() != n {
            return Err(RaptorError::corruption(format!(
                "table lengths disagree: {} IBFs, {} link rows, {} user bin rows",
                n,
                self.next_ibf_id.len(),
                self.user_bins.bin_indices.len()
            )));
        }
        for idx in 0..n {
            let bins = self.ibf_vector[idx].bin_count();
            if self.next_ibf_id[idx].len() != bins || self.user_bins.bin_indices[idx].len() != bins {
                return Err(RaptorError::corruption(format!(
                    "IBF {} has {} bins but {} links and {} user bin entries",
                    idx,
                    bins,
                    self.next_ibf_id[idx].len(),
                    self.user_bins.bin_indices[idx].len()
                )));
            }
            for &target in &self.next_ibf_id[idx] {
                if target < 0 || target as usize >= n {
                    return Err(RaptorError::corruption(format!(
                        "IBF {} links to non-existent IBF {}",
                        idx, target
                    )));
                }
            }
            for &user_bin in &self.user_bins.bin_indices[idx] {
                if user_bin >= self.user_bins.num_user_bins as i64 {
                    return Err(RaptorError::corruption(format!(
                        "IBF {} stores unknown user bin {}",
                        idx, user_bin
                    )));
                }
            }
        }

        // every node except the root must be the merge target of exactly one bin
        let mut seen = vec![false; n];
        seen[0] = true;
        let mut stack = vec![0usize];
        while let Some(idx) = stack.pop() {
            for &target in &self.next_ibf_id[idx] {
                let target = target as usize;
                if target == idx {
                    continue;
                }
                if seen[target] {
                    return Err(RaptorError::corruption(format!(
                        "IBF {} is reachable more than once",
                        target
                    )));
                }
                seen[target] = true;
                stack.push(target);
            }
        }
        if let Some(unreachable) = seen.iter().position(|&s| !s) {
            return Err(RaptorError::corruption(format!(
                "IBF {} is not reachable from the root",
                unreachable
            )));
        }
        Ok(())
    }

    pub fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        wire::write_u64(w, self.ibf_vector.len() as u64)?;
        for ibf in &self.ibf_vector {
            ibf.write_to(w)?;
        }
        for links in &self.next_ibf_id {
            wire::write_u64(w, links.len() as u64)?;
            for &link in links {
                wire::write_i64(w, link)?;
            }
        }
        wire::write_u64(w, self.user_bins.num_user_bins)?;
        for row in &self.user_bins.bin_indices {
            wire::write_u64(w, row.len() as u64)?;
            for &idx in row {
                wire::write_i64(w, idx)?;
            }
        }
        Ok(())
    }

    pub fn read_from(r: &mut impl Read, path: &Path) -> Result<Self> {
        let count = wire::read_u64(r).map_err(|e| RaptorError::io(path, "read", e))?;
        if count == 0 || count > MAX_SERIALIZED_IBFS {
            return Err(RaptorError::format(
                path,
                format!("implausible IBF count {}", count),
            ));
        }
        let mut ibf_vector = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ibf_vector.push(Ibf::read_from(r, path)?);
        }
        let mut next_ibf_id = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = wire::read_u64(r).map_err(|e| RaptorError::io(path, "read", e))? as usize;
            let mut links = Vec::with_capacity(len);
            for _ in 0..len {
                links.push(wire::read_i64(r).map_err(|e| RaptorError::io(path, "read", e))?);
            }
            next_ibf_id.push(links);
        }
        let num_user_bins = wire::read_u64(r).map_err(|e| RaptorError::io(path, "read", e))?;
        let mut bin_indices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = wire::read_u64(r).map_err(|e| RaptorError::io(path, "read", e))? as usize;
            let mut row = Vec::with_capacity(len);
            for _ in 0..len {
                row.push(wire::read_i64(r).map_err(|e| RaptorError::io(path, "read", e))?);
            }
            bin_indices.push(row);
        }
        let hibf = Self {
            ibf_vector,
            next_ibf_id,
            user_bins: UserBins::new(num_user_bins, bin_indices),
        };
        hibf.validate()?;
        Ok(hibf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two-level tree: root with one leaf bin (user bin 0) and one merged
    /// bin pointing at a child with two leaf bins (user bins 1, 2).
    fn sample_hibf() -> (Hibf, Vec<Vec<u64>>) {
        let contents: Vec<Vec<u64>> = vec![
            (0..40u64).map(|i| i.wrapping_mul(0x9E37_79B9)).collect(),
            (100..140u64).map(|i| i.wrapping_mul(0x85EB_CA6B)).collect(),
            (200..240u64).map(|i| i.wrapping_mul(0xC2B2_AE35)).collect(),
        ];

        let root = Ibf::new(2, 4096, 2).unwrap();
        for &v in &contents[0] {
            root.emplace(v, 0);
        }
        for &v in contents[1].iter().chain(contents[2].iter()) {
            root.emplace(v, 1); // merged bin holds the child union
        }
        let child = Ibf::new(2, 4096, 2).unwrap();
        for &v in &contents[1] {
            child.emplace(v, 0);
        }
        for &v in &contents[2] {
            child.emplace(v, 1);
        }

        let hibf = Hibf {
            ibf_vector: vec![root, child],
            next_ibf_id: vec![vec![0, 1], vec![1, 1]],
            user_bins: UserBins::new(3, vec![vec![0, -1], vec![1, 2]]),
        };
        (hibf, contents)
    }

    #[test]
    fn membership_descends_into_merged_bins() {
        let (hibf, contents) = sample_hibf();
        assert!(hibf.validate().is_ok());
        assert_eq!(hibf.membership(&contents[0], contents[0].len()), vec![0]);
        assert_eq!(hibf.membership(&contents[1], contents[1].len()), vec![1]);
        assert_eq!(hibf.membership(&contents[2], contents[2].len()), vec![2]);
    }

    #[test]
    fn zero_threshold_returns_every_user_bin() {
        let (hibf, _) = sample_hibf();
        assert_eq!(hibf.membership(&[], 0), vec![0, 1, 2]);
    }

    #[test]
    fn validate_rejects_dangling_link() {
        let (mut hibf, _) = sample_hibf();
        hibf.next_ibf_id[0][1] = 7;
        assert!(hibf.validate().is_err());
    }

    #[test]
    fn validate_rejects_cycle() {
        let (mut hibf, _) = sample_hibf();
        hibf.next_ibf_id[1][1] = 0;
        assert!(hibf.validate().is_err());
    }

    #[test]
    fn validate_rejects_length_mismatch() {
        let (mut hibf, _) = sample_hibf();
        hibf.next_ibf_id[1] = vec![1];
        assert!(hibf.validate().is_err());
    }

    #[test]
    fn serialization_round_trip() {
        let (hibf, _) = sample_hibf();
        let mut buf = Vec::new();
        hibf.write_to(&mut buf).unwrap();
        let back = Hibf::read_from(&mut buf.as_slice(), Path::new("test")).unwrap();
        assert_eq!(hibf, back);
    }
}
