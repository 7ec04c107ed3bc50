//! Build driver.
//!
//! Turns a bins file (one user bin per line, whitespace-separated paths)
//! into a serialized IBF index, or a layout pack file into an HIBF index.
//! IBF bins are hashed by parallel workers that `emplace` into disjoint
//! columns of one shared filter; partitioned builds run the parts
//! sequentially to cap peak memory.

use crate::error::{FirstErrorCapture, RaptorError, Result};
use crate::hibf;
use crate::hibf::layout::Layout;
use crate::ibf::{bin_size_in_bits, Ibf};
use crate::index::{IndexHeader, IndexPayload, RaptorIndex};
use crate::input;
use crate::minimizer::{adjust_seed, extract_into, MinimizerWorkspace};
use crate::shape::Shape;
use crate::timers::BuildTimers;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct BuildArguments {
    /// Bins file for an IBF build, layout pack file for an HIBF build.
    pub input: PathBuf,
    pub output: PathBuf,
    pub shape: Shape,
    pub window: usize,
    pub hash_count: usize,
    /// Total index size in bits from `--size`; inferred from minimiser
    /// headers when absent.
    pub size_bits: Option<u64>,
    pub fpr: f64,
    pub parts: u8,
    pub threads: usize,
    pub is_hibf: bool,
}

pub fn run_build(args: &BuildArguments) -> Result<()> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads)
        .build()
        .map_err(|e| RaptorError::internal(format!("cannot build thread pool: {}", e)))?;
    pool.install(|| {
        if args.is_hibf {
            build_hibf_index(args)
        } else {
            build_ibf_index(args)
        }
    })
}

/// One user bin per line; each line is one or more whitespace-separated
/// paths, all of which must exist.
pub fn parse_bins_file(path: &Path) -> Result<Vec<Vec<String>>> {
    let text = std::fs::read_to_string(path).map_err(|e| RaptorError::io(path, "read", e))?;
    let mut bins = Vec::new();
    for line in text.lines() {
        let paths: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if paths.is_empty() {
            continue;
        }
        for p in &paths {
            if !Path::new(p).exists() {
                return Err(RaptorError::invalid(format!("no such file: {}", p)));
            }
        }
        bins.push(paths);
    }
    if bins.is_empty() {
        return Err(RaptorError::invalid(format!(
            "bins file '{}' lists no user bins",
            path.display()
        )));
    }
    Ok(bins)
}

/// File name of one partition: the bare output path for a single-part
/// index, `<output>_<part>` otherwise.
pub fn part_path(output: &Path, part: u8, parts: u8) -> PathBuf {
    if parts == 1 {
        output.to_path_buf()
    } else {
        let mut name = output.as_os_str().to_os_string();
        name.push(format!("_{}", part));
        PathBuf::from(name)
    }
}

/// Partition owning a hash: the top log2(parts) bits.
#[inline]
pub fn hash_partition(value: u64, parts: u8) -> u8 {
    if parts == 1 {
        0
    } else {
        (value >> (64 - parts.trailing_zeros())) as u8
    }
}

fn build_ibf_index(args: &BuildArguments) -> Result<()> {
    let bins = parse_bins_file(&args.input)?;
    let seed = adjust_seed(args.shape.weight());
    let bits_per_bin = bits_per_bin(args, &bins)?;
    let bin_size = (bits_per_bin / args.parts as u64).max(1);
    log::info!(
        "building IBF over {} bins, {} bits per bin, {} part(s)",
        bins.len(),
        bits_per_bin,
        args.parts
    );

    let total_timers = Mutex::new(BuildTimers::default());
    for part in 0..args.parts {
        let ibf = Ibf::new(bins.len(), bin_size, args.hash_count)?;
        let capture = FirstErrorCapture::new();

        bins.par_iter().enumerate().for_each(|(bin_idx, paths)| {
            if capture.has_error() {
                return;
            }
            let mut timers = BuildTimers::default();
            if let Err(e) = fill_bin(paths, bin_idx, &ibf, part, args, seed, &mut timers) {
                capture.store(e);
            }
            total_timers.lock().unwrap().merge(&timers);
        });
        if let Some(err) = capture.get() {
            return Err(err);
        }

        let index = RaptorIndex {
            header: IndexHeader {
                window: args.window as u64,
                shape: args.shape,
                parts: args.parts,
                compressed: false,
                bin_paths: bins.clone(),
                fpr: args.fpr,
                is_hibf: false,
            },
            payload: IndexPayload::Ibf(ibf),
        };
        index.save(&part_path(&args.output, part, args.parts))?;
    }
    total_timers.into_inner().unwrap().log();
    Ok(())
}

/// Hashes one user bin into its column, keeping only this part's hashes.
fn fill_bin(
    paths: &[String],
    bin_idx: usize,
    ibf: &Ibf,
    part: u8,
    args: &BuildArguments,
    seed: u64,
    timers: &mut BuildTimers,
) -> Result<()> {
    let mut ws = MinimizerWorkspace::new();
    for path_str in paths {
        let path = Path::new(path_str);
        if input::is_minimiser_file(path) {
            input::check_minimiser_header(path, args.shape, args.window)?;
            let started = Instant::now();
            let hashes = input::read_minimiser_file(path)?;
            timers.user_bin_io += started.elapsed();
            let started = Instant::now();
            for hash in hashes {
                if hash_partition(hash, args.parts) == part {
                    ibf.emplace(hash, bin_idx);
                }
            }
            timers.fill_ibf += started.elapsed();
        } else {
            let started = Instant::now();
            input::for_each_sequence(path, |seq| {
                extract_into(seq, args.shape, args.window, seed, &mut ws);
                for &hash in &ws.buffer {
                    if hash_partition(hash, args.parts) == part {
                        ibf.emplace(hash, bin_idx);
                    }
                }
            })?;
            timers.fill_ibf += started.elapsed();
        }
    }
    Ok(())
}

/// Bits per bin: from `--size` spread across the bins, or via Bloom sizing
/// from the largest minimiser header count.
fn bits_per_bin(args: &BuildArguments, bins: &[Vec<String>]) -> Result<u64> {
    if let Some(total) = args.size_bits {
        let per_bin = total / bins.len() as u64;
        if per_bin == 0 {
            return Err(RaptorError::invalid(format!(
                "--size yields {} bits for {} bins",
                total,
                bins.len()
            )));
        }
        return Ok(per_bin);
    }

    let all_minimiser = bins
        .iter()
        .flatten()
        .all(|p| input::is_minimiser_file(Path::new(p)));
    if !all_minimiser {
        return Err(RaptorError::invalid(
            "--size is required unless every input is a .minimiser file".to_string(),
        ));
    }
    let mut max_count = 0u64;
    for path_str in bins.iter().flatten() {
        let header = input::check_minimiser_header(Path::new(path_str), args.shape, args.window)?;
        max_count = max_count.max(header.count);
    }
    Ok(bin_size_in_bits(args.fpr, args.hash_count, max_count as usize))
}

fn build_hibf_index(args: &BuildArguments) -> Result<()> {
    if args.parts != 1 {
        return Err(RaptorError::invalid(
            "HIBF indices cannot be partitioned".to_string(),
        ));
    }
    let layout = Layout::parse_file(&args.input)?;
    for paths in &layout.bin_paths {
        for p in paths {
            if !Path::new(p).exists() {
                return Err(RaptorError::invalid(format!("no such file: {}", p)));
            }
        }
    }
    log::info!(
        "building HIBF over {} user bins in {} IBFs",
        layout.num_user_bins(),
        layout.nodes.len()
    );

    let params = hibf::build::HibfBuildParams {
        shape: args.shape,
        window: args.window,
        seed: adjust_seed(args.shape.weight()),
        hash_count: args.hash_count,
        fpr: args.fpr,
    };
    let built = hibf::build::build(&layout, &params)?;

    let index = RaptorIndex {
        header: IndexHeader {
            window: args.window as u64,
            shape: args.shape,
            parts: 1,
            compressed: false,
            bin_paths: layout.bin_paths.clone(),
            fpr: args.fpr,
            is_hibf: true,
        },
        payload: IndexPayload::Hibf(built),
    };
    index.save(&args.output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bins_file_parsing_and_validation() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.fa");
        let b = dir.path().join("b.fa");
        std::fs::write(&a, ">s\nACGT\n").unwrap();
        std::fs::write(&b, ">s\nACGT\n").unwrap();

        let bins_file = dir.path().join("bins.txt");
        std::fs::write(
            &bins_file,
            format!("{} {}\n\n{}\n", a.display(), b.display(), b.display()),
        )
        .unwrap();
        let bins = parse_bins_file(&bins_file).unwrap();
        assert_eq!(bins.len(), 2);
        assert_eq!(bins[0].len(), 2);

        std::fs::write(&bins_file, "/missing/file.fa\n").unwrap();
        assert!(parse_bins_file(&bins_file).is_err());
        std::fs::write(&bins_file, "").unwrap();
        assert!(parse_bins_file(&bins_file).is_err());
    }

    #[test]
    fn part_paths_and_partitioning() {
        assert_eq!(part_path(Path::new("/x/idx"), 0, 1), PathBuf::from("/x/idx"));
        assert_eq!(part_path(Path::new("/x/idx"), 3, 4), PathBuf::from("/x/idx_3"));

        assert_eq!(hash_partition(u64::MAX, 1), 0);
        assert_eq!(hash_partition(0, 4), 0);
        assert_eq!(hash_partition(u64::MAX, 4), 3);
        assert_eq!(hash_partition(1u64 << 62, 4), 1);
        // every hash lands in exactly one of the parts
        for h in [0u64, 42, 1 << 40, u64::MAX] {
            assert!(hash_partition(h, 8) < 8);
        }
    }

    #[test]
    fn size_is_required_for_sequence_input() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.fa");
        std::fs::write(&a, ">s\nACGTACGTACGTACGTACGTACGT\n").unwrap();
        let bins_file = dir.path().join("bins.txt");
        std::fs::write(&bins_file, format!("{}\n", a.display())).unwrap();

        let args = BuildArguments {
            input: bins_file,
            output: dir.path().join("out.index"),
            shape: Shape::ungapped(19).unwrap(),
            window: 19,
            hash_count: 2,
            size_bits: None,
            fpr: 0.05,
            parts: 1,
            threads: 1,
            is_hibf: false,
        };
        assert!(matches!(
            run_build(&args),
            Err(RaptorError::InvalidArgument(_))
        ));
    }
}
