//! Command-line argument definitions for the raptor CLI.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "raptor")]
#[command(version)]
#[command(about = "Approximate membership pre-filter for nucleotide sequences")]
#[command(
    long_about = "Raptor: pre-filters collections of reference bins for a stream of queries
using (hierarchical) interleaved Bloom filters over windowed minimisers.

WORKFLOW:
  1. Build an index:    raptor build bins.txt --output index.raptor --size 8m
  2. Search queries:    raptor search --index index.raptor --query reads.fq --output out.tsv

INPUT FORMATS:
  FASTA (.fa, .fasta, .fna) and FASTQ (.fq, .fastq) files are supported.
  Gzip-compressed files (.gz) are detected and decompressed transparently.
  Precomputed .minimiser files (raptor prepare) are accepted wherever
  sequence files are.

OUTPUT FORMAT (search):
  One header line '#QUERY_NAME\tUSER_BINS', then one line per query:
  query id, a tab, and the comma-separated candidate bin ids. Queries
  without candidates print the bare id."
)]
#[command(after_help = "EXAMPLES:
  # Build a 4-bin IBF with 19-mers
  raptor build bins.txt --output index.raptor --kmer 19 --window 23 --size 8m

  # Build an HIBF from a layout pack file
  raptor build layout.pack --output index.raptor --hibf --fpr 0.05

  # Precompute minimiser files with Mantis cutoffs
  raptor prepare bins.txt --output mins/ --kmer 19 --window 23 --enable-cutoffs

  # Search with an error budget of 2
  raptor search --index index.raptor --query reads.fq --output out.tsv --error 2")]
pub struct Cli {
    /// Enable verbose progress output with timestamps
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build an IBF or HIBF index from reference bins
    Build {
        /// Bins file with one user bin per line (whitespace-separated
        /// paths); with --hibf, the layout pack file instead
        bins: PathBuf,

        /// Output index path; partitioned builds append _<part>
        #[arg(long)]
        output: PathBuf,

        /// K-mer size. Mutually exclusive with --shape.
        #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u8).range(1..=32))]
        kmer: u8,

        /// K-mer shape as a 0/1 string, parsed right to left
        #[arg(long, conflicts_with = "kmer")]
        shape: Option<String>,

        /// Window size for minimiser selection; defaults to the k-mer size
        #[arg(long)]
        window: Option<usize>,

        /// Number of Bloom filter hash functions
        #[arg(long, default_value_t = 2)]
        hash: usize,

        /// Total index size in bytes, with optional k/m/g suffix (IBF only)
        #[arg(long)]
        size: Option<String>,

        /// Target false-positive rate per bin (HIBF, or IBF without --size)
        #[arg(long, default_value_t = 0.05)]
        fpr: f64,

        /// Build a hierarchical index from a layout pack file
        #[arg(long)]
        hibf: bool,

        /// Split the index into this many partitions (power of two)
        #[arg(long, default_value_t = 1)]
        parts: u8,

        #[arg(long, default_value_t = 1)]
        threads: usize,

        /// Only compute minimiser files for the listed bins, then exit
        #[arg(long)]
        compute_minimiser: bool,

        /// Apply file-size dependent cutoffs from Mantis (Pandey et al., 2018)
        #[arg(long, requires = "compute_minimiser")]
        enable_cutoffs: bool,
    },

    /// Search queries against an index
    Search {
        #[arg(long)]
        index: PathBuf,

        /// Query file (FASTA/FASTQ, optionally gzipped)
        #[arg(long)]
        query: PathBuf,

        /// Output TSV path
        #[arg(long)]
        output: PathBuf,

        /// Hamming error budget per query
        #[arg(long, default_value_t = 0)]
        error: usize,

        /// Fixed threshold as a fraction of the query's minimiser count;
        /// overrides --error
        #[arg(long)]
        threshold: Option<f64>,

        /// Confidence level of the probabilistic threshold
        #[arg(long, default_value_t = 0.9999)]
        tau: f64,

        /// Nominal pattern size; defaults to the first query's length
        #[arg(long)]
        pattern: Option<usize>,

        #[arg(long, default_value_t = 1)]
        threads: usize,
    },

    /// Compute minimiser and header files for use with raptor build
    Prepare {
        /// Bins file with one user bin per line
        bins: PathBuf,

        /// Output directory for the .minimiser/.header pairs
        #[arg(long)]
        output: PathBuf,

        /// K-mer size. Mutually exclusive with --shape.
        #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u8).range(1..=32))]
        kmer: u8,

        /// K-mer shape as a 0/1 string, parsed right to left
        #[arg(long, conflicts_with = "kmer")]
        shape: Option<String>,

        /// Window size for minimiser selection; defaults to the k-mer size
        #[arg(long)]
        window: Option<usize>,

        /// Apply file-size dependent cutoffs from Mantis (Pandey et al., 2018)
        #[arg(long)]
        enable_cutoffs: bool,

        #[arg(long, default_value_t = 1)]
        threads: usize,
    },

    /// Upgrade a version 1 index to the current format
    Upgrade {
        #[arg(long)]
        index: PathBuf,

        #[arg(long)]
        output: PathBuf,

        /// False-positive rate to record; version 1 indices did not store it
        #[arg(long, default_value_t = 0.05)]
        fpr: f64,
    },
}
