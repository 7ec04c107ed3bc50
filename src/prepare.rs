//! Minimiser preparation.
//!
//! Streams each input file through the hash extractor, counts occurrences
//! with a saturating 16-bit counter, applies the optional Mantis cutoff and
//! writes a `.minimiser`/`.header` pair per file. Files are processed one
//! per worker.

use crate::error::{FirstErrorCapture, RaptorError, Result};
use crate::input;
use crate::minimizer::{extract_into, MinimizerWorkspace};
use crate::shape::Shape;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PrepareParams {
    pub shape: Shape,
    pub window: usize,
    pub seed: u64,
    pub enable_cutoffs: bool,
    pub output_dir: PathBuf,
}

/// Hashes every file of every user bin into the output directory.
pub fn compute_minimisers(bins: &[Vec<String>], params: &PrepareParams) -> Result<()> {
    std::fs::create_dir_all(&params.output_dir)
        .map_err(|e| RaptorError::io(&params.output_dir, "create", e))?;

    let files: Vec<&String> = bins.iter().flatten().collect();
    let capture = FirstErrorCapture::new();
    files.par_iter().for_each(|path| {
        if capture.has_error() {
            return;
        }
        if let Err(e) = prepare_one(Path::new(path.as_str()), params) {
            capture.store(e);
        }
    });
    match capture.get() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn prepare_one(path: &Path, params: &PrepareParams) -> Result<()> {
    let cutoff = if params.enable_cutoffs {
        mantis_cutoff(path)?
    } else {
        0
    };

    let mut counts: HashMap<u64, u16> = HashMap::new();
    let mut ws = MinimizerWorkspace::new();
    input::for_each_sequence(path, |seq| {
        extract_into(seq, params.shape, params.window, params.seed, &mut ws);
        accumulate_counts(ws.buffer.iter().copied(), &mut counts);
    })?;

    let mut surviving: Vec<u64> = counts
        .iter()
        .filter(|&(_, &count)| count as u64 > cutoff)
        .map(|(&hash, _)| hash)
        .collect();
    surviving.sort_unstable();
    log::info!(
        "{}: {} of {} minimisers survive cutoff {}",
        path.display(),
        surviving.len(),
        counts.len(),
        cutoff
    );

    let out = params.output_dir.join(output_stem(path)).with_extension(input::MINIMISER_EXTENSION);
    input::write_minimiser_file(&out, &surviving, params.shape, params.window, cutoff)
}

/// Saturating occurrence counting; counts cap at u16::MAX.
pub(crate) fn accumulate_counts(hashes: impl Iterator<Item = u64>, counts: &mut HashMap<u64, u16>) {
    for hash in hashes {
        let count = counts.entry(hash).or_insert(0);
        *count = count.saturating_add(1);
    }
}

/// File stem with a trailing `.gz` stripped first, so `sample.fa.gz` and
/// `sample.fa` share the stem `sample`.
fn output_stem(path: &Path) -> PathBuf {
    let path = if path.extension().map_or(false, |e| e == "gz") {
        path.with_extension("")
    } else {
        path.to_path_buf()
    };
    PathBuf::from(path.file_stem().unwrap_or_default())
}

/// Cutoffs and size bounds from Mantis (Pandey et al., 2018); compressed
/// files are assumed to pack three to one.
fn mantis_cutoff(path: &Path) -> Result<u64> {
    const CUTOFFS: [(u64, u64); 4] = [
        (314_572_800, 1),
        (524_288_000, 3),
        (1_073_741_824, 10),
        (3_221_225_472, 20),
    ];
    let mut filesize = std::fs::metadata(path)
        .map_err(|e| RaptorError::io(path, "stat", e))?
        .len();
    if path.extension().map_or(false, |e| e == "gz") {
        filesize *= 3;
    }
    for (bound, cutoff) in CUTOFFS {
        if filesize <= bound {
            return Ok(cutoff);
        }
    }
    Ok(50)
}
