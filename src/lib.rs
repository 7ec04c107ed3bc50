//! Raptor: an approximate-membership pre-filter for collections of
//! nucleotide sequences.
//!
//! Reference "user bins" are hashed into an [Interleaved Bloom
//! Filter](ibf::Ibf) or a [Hierarchical Interleaved Bloom
//! Filter](hibf::Hibf); for each query the index reports the bins the query
//! likely occurs in, within a Hamming error budget translated into a
//! minimiser threshold by the [threshold] oracle.
//!
//! The [build], [search] and [prepare] modules are the drivers behind the
//! `raptor` binary; the remaining modules are usable as a library.

pub mod build;
pub mod commands;
pub mod error;
pub mod hibf;
pub mod ibf;
pub mod index;
pub mod input;
pub mod logging;
pub mod minimizer;
pub mod prepare;
pub mod search;
pub mod shape;
pub mod threshold;
pub mod timers;
pub mod upgrade;
mod wire;

pub use error::{FirstErrorCapture, RaptorError, Result};
pub use ibf::Ibf;
pub use index::{IndexHeader, IndexPayload, RaptorIndex};
pub use minimizer::{adjust_seed, extract, extract_into, MinimizerWorkspace};
pub use shape::Shape;
pub use threshold::{Threshold, ThresholdParams};
