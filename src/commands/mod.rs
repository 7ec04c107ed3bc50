//! Command-line interface: argument definitions, validation and dispatch.

pub mod args;

pub use args::{Cli, Commands};

use crate::build::{self, BuildArguments};
use crate::error::{RaptorError, Result};
use crate::minimizer::adjust_seed;
use crate::prepare::{self, PrepareParams};
use crate::search::{self, SearchArguments};
use crate::shape::Shape;
use crate::upgrade::{self, UpgradeArguments};
use anyhow::Context;

pub fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Build {
            bins,
            output,
            kmer,
            shape,
            window,
            hash,
            size,
            fpr,
            hibf,
            parts,
            threads,
            compute_minimiser,
            enable_cutoffs,
        } => {
            let shape = resolve_shape(kmer, shape.as_deref())?;
            let window = resolve_window(shape, window)?;
            validate_common(threads, fpr)?;

            if compute_minimiser {
                let bins = build::parse_bins_file(&bins)?;
                let params = PrepareParams {
                    shape,
                    window,
                    seed: adjust_seed(shape.weight()),
                    enable_cutoffs,
                    output_dir: output,
                };
                return with_pool(threads, || prepare::compute_minimisers(&bins, &params))
                    .context("preparing minimisers failed");
            }

            if !parts.is_power_of_two() {
                return Err(RaptorError::invalid(format!(
                    "--parts must be a power of two, got {}",
                    parts
                ))
                .into());
            }
            if hash == 0 || hash > crate::ibf::MAX_HASH_FUNS {
                return Err(RaptorError::invalid(format!(
                    "--hash must be in [1, {}], got {}",
                    crate::ibf::MAX_HASH_FUNS,
                    hash
                ))
                .into());
            }
            let size_bits = size.as_deref().map(parse_size).transpose()?;
            if hibf && size_bits.is_some() {
                return Err(
                    RaptorError::invalid("--size applies to IBF builds only".to_string()).into(),
                );
            }

            build::run_build(&BuildArguments {
                input: bins,
                output,
                shape,
                window,
                hash_count: hash,
                size_bits,
                fpr,
                parts,
                threads,
                is_hibf: hibf,
            })
            .context("building the index failed")
        }

        Commands::Search {
            index,
            query,
            output,
            error,
            threshold,
            tau,
            pattern,
            threads,
        } => {
            if threads == 0 {
                return Err(RaptorError::invalid("--threads must be positive".to_string()).into());
            }
            search::run_search(&SearchArguments {
                index,
                query,
                output,
                errors: error,
                threshold,
                tau,
                pattern_size: pattern,
                threads,
            })
            .context("searching the index failed")
        }

        Commands::Prepare {
            bins,
            output,
            kmer,
            shape,
            window,
            enable_cutoffs,
            threads,
        } => {
            let shape = resolve_shape(kmer, shape.as_deref())?;
            let window = resolve_window(shape, window)?;
            if threads == 0 {
                return Err(RaptorError::invalid("--threads must be positive".to_string()).into());
            }
            let bins = build::parse_bins_file(&bins)?;
            let params = PrepareParams {
                shape,
                window,
                seed: adjust_seed(shape.weight()),
                enable_cutoffs,
                output_dir: output,
            };
            with_pool(threads, || prepare::compute_minimisers(&bins, &params))
                .context("preparing minimisers failed")
        }

        Commands::Upgrade { index, output, fpr } => {
            if !(fpr > 0.0 && fpr < 1.0) {
                return Err(RaptorError::invalid(format!(
                    "--fpr must be in (0, 1), got {}",
                    fpr
                ))
                .into());
            }
            upgrade::run_upgrade(&UpgradeArguments { index, output, fpr })
                .context("upgrading the index failed")
        }
    }
}

fn resolve_shape(kmer: u8, shape: Option<&str>) -> Result<Shape> {
    match shape {
        Some(text) => Shape::parse(text),
        None => Shape::ungapped(kmer as usize),
    }
}

fn resolve_window(shape: Shape, window: Option<usize>) -> Result<usize> {
    let window = window.unwrap_or_else(|| shape.size());
    if window < shape.size() {
        return Err(RaptorError::invalid(format!(
            "--window ({}) must be at least the shape size ({})",
            window,
            shape.size()
        )));
    }
    Ok(window)
}

fn validate_common(threads: usize, fpr: f64) -> Result<()> {
    if threads == 0 {
        return Err(RaptorError::invalid("--threads must be positive".to_string()));
    }
    if !(fpr > 0.0 && fpr < 1.0) {
        return Err(RaptorError::invalid(format!(
            "--fpr must be in (0, 1), got {}",
            fpr
        )));
    }
    Ok(())
}

/// Total size in bytes with an optional k/m/g suffix, returned in bits.
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let (digits, multiplier) = match text.char_indices().last() {
        Some((i, 'k')) | Some((i, 'K')) => (&text[..i], 1u64 << 10),
        Some((i, 'm')) | Some((i, 'M')) => (&text[..i], 1u64 << 20),
        Some((i, 'g')) | Some((i, 'G')) => (&text[..i], 1u64 << 30),
        _ => (text, 1),
    };
    let bytes: u64 = digits
        .parse()
        .map_err(|_| RaptorError::invalid(format!("cannot parse size '{}'", text)))?;
    bytes
        .checked_mul(multiplier)
        .and_then(|b| b.checked_mul(8))
        .ok_or_else(|| RaptorError::invalid(format!("size '{}' overflows", text)))
}

fn with_pool<T>(threads: usize, f: impl FnOnce() -> Result<T> + Send) -> Result<T>
where
    T: Send,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| RaptorError::internal(format!("cannot build thread pool: {}", e)))?;
    pool.install(f)
}
