//! Input readers shared by the build pipeline.
//!
//! User bins arrive either as sequence files (FASTA/FASTQ, optionally
//! gzipped, parsed by needletail) or as precomputed `.minimiser` files with
//! their text `.header` sidecars.

use crate::error::{RaptorError, Result};
use crate::minimizer::{extract_into, MinimizerWorkspace};
use crate::shape::Shape;
use crate::wire;
use needletail::parse_fastx_file;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

pub const MINIMISER_EXTENSION: &str = "minimiser";
pub const HEADER_EXTENSION: &str = "header";

pub fn is_minimiser_file(path: &Path) -> bool {
    path.extension().map_or(false, |e| e == MINIMISER_EXTENSION)
}

pub fn header_path_for(minimiser_path: &Path) -> PathBuf {
    minimiser_path.with_extension(HEADER_EXTENSION)
}

/// Little-endian u64 stream, no in-band header.
pub fn read_minimiser_file(path: &Path) -> Result<Vec<u64>> {
    let file = File::open(path).map_err(|e| RaptorError::io(path, "open", e))?;
    let len = file
        .metadata()
        .map_err(|e| RaptorError::io(path, "stat", e))?
        .len();
    if len % 8 != 0 {
        return Err(RaptorError::format(
            path,
            format!("size {} is not a multiple of 8", len),
        ));
    }
    let mut reader = BufReader::new(file);
    let mut hashes = Vec::with_capacity((len / 8) as usize);
    let mut buf = [0u8; 8];
    loop {
        match reader.read_exact(&mut buf) {
            Ok(()) => hashes.push(u64::from_le_bytes(buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(RaptorError::io(path, "read", e)),
        }
    }
    Ok(hashes)
}

/// One text line: `shape window cutoff count`.
#[derive(Debug, Clone, PartialEq)]
pub struct MinimiserHeader {
    pub shape_string: String,
    pub window: u64,
    pub cutoff: u64,
    pub count: u64,
}

pub fn read_minimiser_header(path: &Path) -> Result<MinimiserHeader> {
    let text = std::fs::read_to_string(path).map_err(|e| RaptorError::io(path, "read", e))?;
    let mut fields = text.split_whitespace();
    let parse_err = || RaptorError::format(path, "expected 'shape window cutoff count'");
    let shape_string = fields.next().ok_or_else(parse_err)?.to_string();
    let window = fields.next().and_then(|v| v.parse().ok()).ok_or_else(parse_err)?;
    let cutoff = fields.next().and_then(|v| v.parse().ok()).ok_or_else(parse_err)?;
    let count = fields.next().and_then(|v| v.parse().ok()).ok_or_else(parse_err)?;
    Ok(MinimiserHeader {
        shape_string,
        window,
        cutoff,
        count,
    })
}

/// Checks a `.minimiser` sidecar header against the build parameters.
pub fn check_minimiser_header(path: &Path, shape: Shape, window: usize) -> Result<MinimiserHeader> {
    let header_path = header_path_for(path);
    let header = read_minimiser_header(&header_path)?;
    if header.shape_string != shape.to_string() || header.window != window as u64 {
        return Err(RaptorError::shape_mismatch(
            header_path,
            format!(
                "recorded shape {} window {}, command uses shape {} window {}",
                header.shape_string, header.window, shape, window
            ),
        ));
    }
    Ok(header)
}

/// Streams every sequence of a FASTA/FASTQ file through `f`.
pub fn for_each_sequence(path: &Path, mut f: impl FnMut(&[u8])) -> Result<()> {
    let mut reader = parse_fastx_file(path)
        .map_err(|e| RaptorError::format(path, format!("cannot parse sequence file: {}", e)))?;
    while let Some(record) = reader.next() {
        let record =
            record.map_err(|e| RaptorError::format(path, format!("invalid record: {}", e)))?;
        f(&record.seq());
    }
    Ok(())
}

/// Union of all minimisers of a user bin's files, accepting both sequence
/// files and precomputed `.minimiser` files.
pub fn bin_hashes_into(
    paths: &[String],
    shape: Shape,
    window: usize,
    seed: u64,
    ws: &mut MinimizerWorkspace,
    out: &mut HashSet<u64>,
) -> Result<()> {
    for path_str in paths {
        let path = Path::new(path_str);
        if is_minimiser_file(path) {
            check_minimiser_header(path, shape, window)?;
            out.extend(read_minimiser_file(path)?);
        } else {
            for_each_sequence(path, |seq| {
                extract_into(seq, shape, window, seed, ws);
                out.extend(ws.buffer.iter().copied());
            })?;
        }
    }
    Ok(())
}

/// Writes a `.minimiser`/`.header` pair; used by the preparer and tests.
pub fn write_minimiser_file(
    path: &Path,
    hashes: &[u64],
    shape: Shape,
    window: usize,
    cutoff: u64,
) -> Result<()> {
    let file = File::create(path).map_err(|e| RaptorError::io(path, "create", e))?;
    let mut writer = std::io::BufWriter::new(file);
    for &hash in hashes {
        wire::write_u64(&mut writer, hash).map_err(|e| RaptorError::io(path, "write", e))?;
    }
    drop(writer);

    let header_path = header_path_for(path);
    let line = format!("{} {} {} {}\n", shape, window, cutoff, hashes.len());
    std::fs::write(&header_path, line).map_err(|e| RaptorError::io(&header_path, "write", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn minimiser_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bin1.minimiser");
        let shape = Shape::ungapped(19).unwrap();
        let hashes = vec![3, 1, u64::MAX, 42];
        write_minimiser_file(&path, &hashes, shape, 23, 0).unwrap();

        assert_eq!(read_minimiser_file(&path).unwrap(), hashes);
        let header = read_minimiser_header(&header_path_for(&path)).unwrap();
        assert_eq!(header.shape_string, "1".repeat(19));
        assert_eq!(header.window, 23);
        assert_eq!(header.cutoff, 0);
        assert_eq!(header.count, 4);
    }

    #[test]
    fn header_mismatch_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bin1.minimiser");
        let shape = Shape::ungapped(19).unwrap();
        write_minimiser_file(&path, &[1, 2], shape, 23, 0).unwrap();

        assert!(check_minimiser_header(&path, shape, 23).is_ok());
        let err = check_minimiser_header(&path, shape, 31).unwrap_err();
        assert!(matches!(err, RaptorError::ShapeMismatch { .. }));
        let other_shape = Shape::ungapped(20).unwrap();
        assert!(check_minimiser_header(&path, other_shape, 23).is_err());
    }

    #[test]
    fn truncated_minimiser_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.minimiser");
        std::fs::write(&path, [0u8; 12]).unwrap();
        assert!(read_minimiser_file(&path).is_err());
    }

    #[test]
    fn fastx_sequences_are_streamed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ref.fa");
        std::fs::write(&path, ">s1\nACGT\n>s2\nTTTT\n").unwrap();
        let mut lengths = Vec::new();
        for_each_sequence(&path, |seq| lengths.push(seq.len())).unwrap();
        assert_eq!(lengths, vec![4, 4]);
    }

    #[test]
    fn bin_hashes_union_over_files() {
        let dir = tempdir().unwrap();
        let fa = dir.path().join("a.fa");
        std::fs::write(&fa, ">s\nACGTACGTACGTACGTACGTACGT\n").unwrap();
        let shape = Shape::ungapped(5).unwrap();
        let mut ws = MinimizerWorkspace::new();
        let mut out = HashSet::new();
        bin_hashes_into(
            &[fa.to_string_lossy().into_owned()],
            shape,
            9,
            crate::minimizer::adjust_seed(5),
            &mut ws,
            &mut out,
        )
        .unwrap();
        assert!(!out.is_empty());
    }
}
