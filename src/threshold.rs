//! Probabilistic minimiser thresholds.
//!
//! Translates "at most e errors in a pattern of size p" into "at least
//! T[n] shared minimisers for a query with n minimisers". Three regimes:
//! a user-supplied percentage of the query's minimiser count, the k-mer
//! lemma closed form when the window equals the shape size, and otherwise a
//! precomputed table derived from a simple error model. Tables are cached
//! on disk next to the index.

use crate::error::{RaptorError, Result};
use crate::minimizer::{adjust_seed, minimiser_positions};
use crate::shape::Shape;
use crate::wire;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::{Path, PathBuf};

/// Iterations of the indirect-destruction simulation.
const MODEL_ITERATIONS: usize = 10_000;

/// RNG seed fixing the simulated tables across runs.
const MODEL_RNG_SEED: u64 = 0x1D2B_8284_D988_C4D0;

#[derive(Debug, Clone)]
pub struct ThresholdParams {
    pub pattern_size: usize,
    pub window: usize,
    pub shape: Shape,
    pub errors: usize,
    pub tau: f64,
    /// User-supplied fraction of the query's minimiser count; bypasses the
    /// error model entirely.
    pub percentage: Option<f64>,
    /// Directory holding the threshold cache, usually the index directory.
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum Threshold {
    Percentage(f64),
    Lemma(usize),
    Table {
        min_count: usize,
        max_count: usize,
        table: Vec<u64>,
    },
}

impl Threshold {
    pub fn new(params: &ThresholdParams) -> Result<Self> {
        if let Some(fraction) = params.percentage {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(RaptorError::invalid(format!(
                    "threshold must be in [0, 1], got {}",
                    fraction
                )));
            }
            return Ok(Threshold::Percentage(fraction));
        }
        if !(params.tau > 0.0 && params.tau <= 1.0) {
            return Err(RaptorError::invalid(format!(
                "tau must be in (0, 1], got {}",
                params.tau
            )));
        }

        let k = params.shape.size();
        if params.window < k || params.pattern_size < params.window {
            return Err(RaptorError::invalid(format!(
                "need shape size <= window <= pattern, got {} / {} / {}",
                k, params.window, params.pattern_size
            )));
        }

        if params.window == k {
            // every k-mer is a minimiser: the classic q-gram lemma applies
            let threshold = (params.pattern_size + 1).saturating_sub((params.errors + 1) * k);
            return Ok(Threshold::Lemma(threshold));
        }

        let kmers_per_window = params.window - k + 1;
        let kmers_per_pattern = params.pattern_size - k + 1;
        let min_count = kmers_per_pattern / kmers_per_window;
        let max_count = params.pattern_size - params.window + 1;

        let cache_file = params.cache_dir.as_ref().map(|dir| cache_path(dir, params));
        if let Some(path) = &cache_file {
            if let Some(table) = read_cached_table(path)? {
                if table.len() == max_count - min_count + 1 {
                    return Ok(Threshold::Table {
                        min_count,
                        max_count,
                        table,
                    });
                }
                log::warn!(
                    "Ignoring stale threshold cache '{}' with {} entries",
                    path.display(),
                    table.len()
                );
            }
        }

        let table = precompute_table(params, min_count, max_count);
        if let Some(path) = &cache_file {
            write_cached_table(path, &table)?;
        }
        Ok(Threshold::Table {
            min_count,
            max_count,
            table,
        })
    }

    /// Minimum number of shared minimisers required for a query with
    /// `minimiser_count` minimisers.
    pub fn get(&self, minimiser_count: usize) -> usize {
        if minimiser_count == 0 {
            return 0;
        }
        match self {
            Threshold::Percentage(fraction) => {
                (fraction * minimiser_count as f64).ceil() as usize
            }
            Threshold::Lemma(threshold) => *threshold,
            Threshold::Table {
                min_count,
                max_count,
                table,
            } => {
                let clamped = minimiser_count.clamp(*min_count, *max_count);
                table[clamped - min_count] as usize
            }
        }
    }
}

/// Cache filename: `binary_p<pattern>_w<window>_k<shape>_e<errors>_tau<tau>`.
fn cache_path(dir: &Path, params: &ThresholdParams) -> PathBuf {
    dir.join(format!(
        "binary_p{}_w{}_k{}_e{}_tau{:.6}",
        params.pattern_size, params.window, params.shape, params.errors, params.tau
    ))
}

fn read_cached_table(path: &Path) -> Result<Option<Vec<u64>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RaptorError::io(path, "open", e)),
    };
    let mut reader = BufReader::new(file);
    let len = wire::read_u64(&mut reader).map_err(|e| RaptorError::io(path, "read", e))? as usize;
    let mut table = Vec::with_capacity(len);
    for _ in 0..len {
        table.push(wire::read_u64(&mut reader).map_err(|e| RaptorError::io(path, "read", e))?);
    }
    Ok(Some(table))
}

/// Create-new open: the first builder wins, concurrent losers read the
/// winner's file on their next run.
fn write_cached_table(path: &Path, table: &[u64]) -> Result<()> {
    let file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(()),
        Err(e) => return Err(RaptorError::io(path, "create", e)),
    };
    let mut writer = BufWriter::new(file);
    wire::write_u64(&mut writer, table.len() as u64).map_err(|e| RaptorError::io(path, "write", e))?;
    for &value in table {
        wire::write_u64(&mut writer, value).map_err(|e| RaptorError::io(path, "write", e))?;
    }
    Ok(())
}

fn precompute_table(params: &ThresholdParams, min_count: usize, max_count: usize) -> Vec<u64> {
    let k = params.shape.size();
    let kmers_per_pattern = params.pattern_size - k + 1;
    let indirect = indirect_destruction_distribution(params.pattern_size, params.window, params.shape);

    let mut table = Vec::with_capacity(max_count - min_count + 1);
    let mut floor = 0u64; // keeps the table monotone against simulation noise
    for minimisers in min_count..=max_count {
        let density = minimisers as f64 / kmers_per_pattern as f64;
        let per_error = single_error_model(k, density, &indirect);
        let destroyed = multi_error_distribution(params.errors, &per_error);

        let mass: f64 = destroyed.iter().take(minimisers.max(1)).sum();
        let mut threshold = 0u64;
        if mass > 0.0 {
            let mut cdf = 0.0;
            for (i, p) in destroyed.iter().take(minimisers.max(1)).enumerate() {
                cdf += p / mass;
                if cdf >= params.tau {
                    threshold = (minimisers - i) as u64;
                    break;
                }
            }
        }
        floor = floor.max(threshold);
        table.push(floor);
    }
    table
}

/// Distribution of the number of minimisers destroyed by one substitution
/// without the substitution lying inside them, estimated by a seeded
/// simulation. Depends only on pattern, window and shape.
fn indirect_destruction_distribution(pattern_size: usize, window: usize, shape: Shape) -> Vec<f64> {
    let k = shape.size();
    let seed = adjust_seed(shape.weight());
    let mut rng = StdRng::seed_from_u64(MODEL_RNG_SEED);
    let mut histogram = vec![0u64; window - k + 1];

    for _ in 0..MODEL_ITERATIONS {
        let codes: Vec<u8> = (0..pattern_size).map(|_| rng.gen_range(0..4u8)).collect();
        let sequence: Vec<u8> = codes.iter().map(|&c| b"ACGT"[c as usize]).collect();
        let before = minimiser_positions(&sequence, shape, window, seed);

        let error_position = rng.gen_range(0..pattern_size);
        let mut mutated = sequence;
        let substitute = (codes[error_position] + rng.gen_range(1..4u8)) % 4;
        mutated[error_position] = b"ACGT"[substitute as usize];
        let after: HashSet<usize> =
            minimiser_positions(&mutated, shape, window, seed).into_iter().collect();

        let destroyed = before
            .iter()
            .filter(|&&p| !after.contains(&p))
            .filter(|&&p| error_position < p || error_position >= p + k)
            .count();
        let slot = destroyed.min(histogram.len() - 1);
        histogram[slot] += 1;
    }

    histogram
        .into_iter()
        .map(|count| count as f64 / MODEL_ITERATIONS as f64)
        .collect()
}

/// Distribution of the number of minimisers one substitution destroys:
/// binomial direct hits over the k overlapped k-mer positions, convolved
/// with the indirect distribution.
fn single_error_model(k: usize, density: f64, indirect: &[f64]) -> Vec<f64> {
    let mut direct = vec![0.0; k + 1];
    for (d, slot) in direct.iter_mut().enumerate() {
        *slot = binomial_pmf(k, d, density);
    }
    convolve(&direct, indirect)
}

/// e-fold convolution: probability of destroying exactly i minimisers with
/// e independent errors.
fn multi_error_distribution(errors: usize, per_error: &[f64]) -> Vec<f64> {
    let mut acc = vec![1.0];
    for _ in 0..errors {
        acc = convolve(&acc, per_error);
    }
    acc
}

fn convolve(a: &[f64], b: &[f64]) -> Vec<f64> {
    if a.is_empty() || b.is_empty() {
        return a.to_vec();
    }
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, &x) in a.iter().enumerate() {
        for (j, &y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

fn binomial_pmf(n: usize, k: usize, p: f64) -> f64 {
    let mut coeff = 1.0;
    for i in 0..k {
        coeff *= (n - i) as f64 / (i + 1) as f64;
    }
    coeff * p.powi(k as i32) * (1.0 - p).powi((n - k) as i32)
}
