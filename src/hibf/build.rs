//! Bottom-up HIBF construction from a precomputed tree layout.
//!
//! Each node's IBF is sized by the minimiser count of its chosen max bin,
//! so that bin is materialised first: the favourite child subtree when the
//! max bin is a merged bin, the covering user-bin record otherwise. Every
//! child union is inserted at its merged-bin column and, below the root,
//! propagated upwards into the parent's union.

use crate::error::{RaptorError, Result};
use crate::hibf::layout::{Layout, LayoutRecord};
use crate::hibf::{Hibf, UserBins};
use crate::ibf::{bin_size_in_bits, Ibf};
use crate::input;
use crate::minimizer::MinimizerWorkspace;
use crate::shape::Shape;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct HibfBuildParams {
    pub shape: Shape,
    pub window: usize,
    pub seed: u64,
    pub hash_count: usize,
    pub fpr: f64,
}

struct BuildState<'a> {
    layout: &'a Layout,
    params: &'a HibfBuildParams,
    ibf_slots: Vec<Option<Ibf>>,
    next_ibf_id: Vec<Vec<i64>>,
    bin_indices: Vec<Vec<i64>>,
    next_free_pos: usize,
    ws: MinimizerWorkspace,
}

/// Builds the whole tree; the returned HIBF has the root at index 0.
pub fn build(layout: &Layout, params: &HibfBuildParams) -> Result<Hibf> {
    let n = layout.nodes.len();
    let mut state = BuildState {
        layout,
        params,
        ibf_slots: (0..n).map(|_| None).collect(),
        next_ibf_id: vec![Vec::new(); n],
        bin_indices: vec![Vec::new(); n],
        next_free_pos: 0,
        ws: MinimizerWorkspace::new(),
    };

    let mut root_kmers = HashSet::new();
    let root_pos = hierarchical_build(&mut root_kmers, 0, &mut state, true)?;
    if root_pos != 0 {
        return Err(RaptorError::internal(format!(
            "root IBF landed at position {}",
            root_pos
        )));
    }

    let ibf_vector = state
        .ibf_slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| {
            slot.ok_or_else(|| RaptorError::internal(format!("IBF slot {} was never filled", i)))
        })
        .collect::<Result<Vec<_>>>()?;

    let hibf = Hibf {
        ibf_vector,
        next_ibf_id: state.next_ibf_id,
        user_bins: UserBins::new(layout.num_user_bins(), state.bin_indices),
    };
    hibf.validate()?;
    Ok(hibf)
}

fn hierarchical_build(
    parent_kmers: &mut HashSet<u64>,
    node_idx: usize,
    state: &mut BuildState<'_>,
    is_root: bool,
) -> Result<usize> {
    let ibf_pos = state.next_free_pos;
    state.next_free_pos += 1;

    let node = state.layout.nodes[node_idx].clone();
    let mut ibf_positions = vec![ibf_pos as i64; node.technical_bins];
    let mut filename_indices = vec![-1i64; node.technical_bins];
    let mut kmers: HashSet<u64> = HashSet::new();

    // materialise the max bin first: it determines this node's bin size
    let max_bin_tbs = match node.favourite_child {
        Some(child) => {
            ibf_positions[node.max_bin_index] =
                hierarchical_build(&mut kmers, child, state, false)? as i64;
            1
        }
        None => {
            let record = &node.records[0];
            compute_kmers(&mut kmers, record, state)?;
            update_user_bins(&mut filename_indices, record);
            record.number_of_bins
        }
    };

    let bin_size = bin_size_in_bits(
        state.params.fpr,
        state.params.hash_count,
        kmers.len() / max_bin_tbs,
    );
    let ibf = Ibf::new(node.technical_bins, bin_size, state.params.hash_count)?;
    insert_into_ibf(&kmers, max_bin_tbs, node.max_bin_index, &ibf);
    if !is_root {
        parent_kmers.extend(kmers.iter().copied());
    }
    kmers.clear();

    // remaining child subtrees become merged bins of this IBF
    for &child in &node.children {
        if Some(child) == node.favourite_child {
            continue;
        }
        let mut child_kmers = HashSet::new();
        let child_pos = hierarchical_build(&mut child_kmers, child, state, false)?;
        let parent_bin = state.layout.nodes[child].parent_bin_index;
        ibf_positions[parent_bin] = child_pos as i64;
        insert_into_ibf(&child_kmers, 1, parent_bin, &ibf);
        if !is_root {
            parent_kmers.extend(child_kmers.iter().copied());
        }
    }

    // remaining user-bin records; the first one is already in when it seeded
    // the max bin
    let skip = if node.favourite_child.is_some() { 0 } else { 1 };
    for record in node.records.iter().skip(skip) {
        compute_kmers(&mut kmers, record, state)?;
        insert_into_ibf(&kmers, record.number_of_bins, record.bin_index, &ibf);
        if !is_root {
            parent_kmers.extend(kmers.iter().copied());
        }
        update_user_bins(&mut filename_indices, record);
        kmers.clear();
    }

    state.ibf_slots[ibf_pos] = Some(ibf);
    state.next_ibf_id[ibf_pos] = ibf_positions;
    state.bin_indices[ibf_pos] = filename_indices;
    Ok(ibf_pos)
}

fn compute_kmers(
    kmers: &mut HashSet<u64>,
    record: &LayoutRecord,
    state: &mut BuildState<'_>,
) -> Result<()> {
    input::bin_hashes_into(
        &record.paths,
        state.params.shape,
        state.params.window,
        state.params.seed,
        &mut state.ws,
        kmers,
    )
}

/// Naive splitting: `number_of_bins` contiguous chunks of `ceil(n / bins)`
/// starting at `bin_index`.
fn insert_into_ibf(kmers: &HashSet<u64>, number_of_bins: usize, bin_index: usize, ibf: &Ibf) {
    let chunk_size = kmers.len() / number_of_bins + 1;
    for (i, &value) in kmers.iter().enumerate() {
        ibf.emplace(value, bin_index + i / chunk_size);
    }
}

fn update_user_bins(filename_indices: &mut [i64], record: &LayoutRecord) {
    for slot in filename_indices
        .iter_mut()
        .skip(record.bin_index)
        .take(record.number_of_bins)
    {
        *slot = record.user_bin_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hibf::layout::Layout;
    use crate::minimizer::{adjust_seed, extract};
    use std::path::Path;
    use tempfile::tempdir;

    fn write_fasta(path: &Path, seed: u64, length: usize) {
        let bases = b"ACGT";
        let seq: String = (0..length)
            .map(|i| {
                let x = (i as u64)
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(seed.wrapping_mul(1442695040888963407));
                bases[((x >> 33) % 4) as usize] as char
            })
            .collect();
        std::fs::write(path, format!(">seq\n{}\n", seq)).unwrap();
    }

    fn params() -> HibfBuildParams {
        HibfBuildParams {
            shape: Shape::ungapped(19).unwrap(),
            window: 19,
            seed: adjust_seed(19),
            hash_count: 2,
            fpr: 0.05,
        }
    }

    #[test]
    fn flat_tree_resolves_each_bin() {
        let dir = tempdir().unwrap();
        let mut pack = String::from("#HIGH_LEVEL_IBF max_bin_id:0\n");
        for i in 0..3 {
            let path = dir.path().join(format!("bin{}.fa", i));
            write_fasta(&path, 1000 + i, 400);
            pack.push_str(&format!("{}\t{}\t1\n", path.display(), i));
        }
        let layout = Layout::parse(&pack, Path::new("pack")).unwrap();
        let p = params();
        let hibf = build(&layout, &p).unwrap();
        assert_eq!(hibf.ibf_vector.len(), 1);

        for i in 0..3u64 {
            let path = dir.path().join(format!("bin{}.fa", i));
            let text = std::fs::read_to_string(&path).unwrap();
            let seq = text.lines().nth(1).unwrap().as_bytes().to_vec();
            let query = extract(&seq[..100], p.shape, p.window, p.seed);
            let hits = hibf.membership(&query, query.len());
            assert!(hits.contains(&(i as usize)), "bin {} not found in {:?}", i, hits);
        }
    }

    #[test]
    fn nested_tree_propagates_child_kmers() {
        let dir = tempdir().unwrap();
        for i in 0..3 {
            write_fasta(&dir.path().join(format!("bin{}.fa", i)), 2000 + i, 400);
        }
        let pack = format!(
            "#HIGH_LEVEL_IBF max_bin_id:0\n\
             #MERGED_BIN_1 max_bin_id:0\n\
             {}\t0\t1\n\
             {}\t1;0\t1;1\n\
             {}\t1;1\t1;1\n",
            dir.path().join("bin0.fa").display(),
            dir.path().join("bin1.fa").display(),
            dir.path().join("bin2.fa").display(),
        );
        let layout = Layout::parse(&pack, Path::new("pack")).unwrap();
        let p = params();
        let hibf = build(&layout, &p).unwrap();
        assert_eq!(hibf.ibf_vector.len(), 2);

        for i in 0..3u64 {
            let path = dir.path().join(format!("bin{}.fa", i));
            let text = std::fs::read_to_string(&path).unwrap();
            let seq = text.lines().nth(1).unwrap().as_bytes().to_vec();
            let query = extract(&seq[..100], p.shape, p.window, p.seed);
            let hits = hibf.membership(&query, query.len());
            assert_eq!(hits, vec![i as usize], "query from bin {}", i);
        }
    }

    #[test]
    fn split_user_bin_spans_consecutive_bins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.fa");
        write_fasta(&path, 3000, 800);
        let pack = format!("#HIGH_LEVEL_IBF max_bin_id:0\n{}\t0\t3\n", path.display());
        let layout = Layout::parse(&pack, Path::new("pack")).unwrap();
        let p = params();
        let hibf = build(&layout, &p).unwrap();

        let root = &hibf.ibf_vector[0];
        assert_eq!(root.bin_count(), 3);
        assert_eq!(hibf.user_bins.bin_indices_of_ibf(0), &[0, 0, 0]);

        let text = std::fs::read_to_string(&path).unwrap();
        let seq = text.lines().nth(1).unwrap().as_bytes().to_vec();
        let query = extract(&seq, p.shape, p.window, p.seed);
        // split bins each hold a share; the union over bins covers the query
        let counts = root.bulk_count(&query);
        let total: usize = counts.iter().map(|&c| c as usize).sum();
        assert!(total >= query.len());
        // membership deduplicates the split emissions
        assert_eq!(hibf.membership(&query, 1), vec![0]);
    }
}
