//! On-disk index envelope.
//!
//! Magic bytes and a version number guard the header; the body stores the
//! build parameters followed by the IBF or HIBF payload. Version 1 lacks
//! the fpr and is-hibf fields and is accepted only by `raptor upgrade`.

use crate::error::{RaptorError, Result};
use crate::hibf::Hibf;
use crate::ibf::Ibf;
use crate::shape::Shape;
use crate::wire;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const INDEX_MAGIC: [u8; 4] = *b"RPTR";
pub const INDEX_VERSION: u32 = 2;
pub const OLD_INDEX_VERSION: u32 = 1;

const MAX_PATH_LENGTH: usize = 4096;
const MAX_BIN_COUNT: u64 = 1 << 32;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexHeader {
    pub window: u64,
    pub shape: Shape,
    pub parts: u8,
    pub compressed: bool,
    pub bin_paths: Vec<Vec<String>>,
    pub fpr: f64,
    pub is_hibf: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexPayload {
    Ibf(Ibf),
    Hibf(Hibf),
}

impl IndexPayload {
    pub fn is_hibf(&self) -> bool {
        matches!(self, IndexPayload::Hibf(_))
    }

    /// User bins matching `values` at `threshold`, ascending and unique.
    /// For a plain IBF, technical bins are the user bins.
    pub fn membership(&self, values: &[u64], threshold: usize) -> Vec<usize> {
        match self {
            IndexPayload::Ibf(ibf) => ibf.membership(values, threshold),
            IndexPayload::Hibf(hibf) => hibf.membership(values, threshold),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RaptorIndex {
    pub header: IndexHeader,
    pub payload: IndexPayload,
}

impl RaptorIndex {
    pub fn save(&self, path: &Path) -> Result<()> {
        if self.header.compressed {
            return Err(RaptorError::invalid(
                "compressed indices are not supported".to_string(),
            ));
        }
        if self.header.is_hibf != self.payload.is_hibf() {
            return Err(RaptorError::internal(
                "header and payload disagree about the index kind".to_string(),
            ));
        }
        let file = File::create(path).map_err(|e| RaptorError::io(path, "create", e))?;
        let mut writer = BufWriter::new(file);
        let io_err = |e| RaptorError::io(path, "write", e);

        writer.write_all(&INDEX_MAGIC).map_err(io_err)?;
        wire::write_u32(&mut writer, INDEX_VERSION).map_err(io_err)?;
        write_header_fields(&mut writer, &self.header).map_err(io_err)?;
        match &self.payload {
            IndexPayload::Ibf(ibf) => ibf.write_to(&mut writer).map_err(io_err)?,
            IndexPayload::Hibf(hibf) => hibf.write_to(&mut writer).map_err(io_err)?,
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| RaptorError::io(path, "open", e))?;
        let mut reader = BufReader::new(file);
        let header = read_envelope(&mut reader, path)?;
        let payload = if header.is_hibf {
            IndexPayload::Hibf(Hibf::read_from(&mut reader, path)?)
        } else {
            IndexPayload::Ibf(Ibf::read_from(&mut reader, path)?)
        };
        Ok(Self { header, payload })
    }

    /// Reads only the parameters, skipping the payload.
    pub fn load_header(path: &Path) -> Result<IndexHeader> {
        let file = File::open(path).map_err(|e| RaptorError::io(path, "open", e))?;
        let mut reader = BufReader::new(file);
        read_envelope(&mut reader, path)
    }
}

fn read_envelope(reader: &mut impl Read, path: &Path) -> Result<IndexHeader> {
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|e| RaptorError::io(path, "read", e))?;
    if magic != INDEX_MAGIC {
        return Err(RaptorError::format(path, "not a raptor index (bad magic)"));
    }
    let version = wire::read_u32(reader).map_err(|e| RaptorError::io(path, "read", e))?;
    if version != INDEX_VERSION {
        return Err(RaptorError::VersionMismatch {
            path: path.to_path_buf(),
            found: version,
        });
    }
    let header = read_header_fields(reader, path, version)?;
    if header.compressed {
        return Err(RaptorError::format(
            path,
            "index claims to be compressed; compression is not supported",
        ));
    }
    Ok(header)
}

pub(crate) fn write_header_fields(w: &mut impl Write, header: &IndexHeader) -> std::io::Result<()> {
    wire::write_u64(w, header.window)?;
    wire::write_u64(w, header.shape.mask())?;
    wire::write_u8(w, header.shape.size() as u8)?;
    wire::write_u8(w, header.parts)?;
    wire::write_u8(w, header.compressed as u8)?;
    wire::write_u64(w, header.bin_paths.len() as u64)?;
    for bin in &header.bin_paths {
        wire::write_u64(w, bin.len() as u64)?;
        for path in bin {
            wire::write_str(w, path)?;
        }
    }
    wire::write_f64(w, header.fpr)?;
    wire::write_u8(w, header.is_hibf as u8)?;
    Ok(())
}

/// Reads the header body shared by versions 1 and 2; version 1 stops after
/// the bin paths and reports fpr 0 and a plain IBF.
pub(crate) fn read_header_fields(
    reader: &mut impl Read,
    path: &Path,
    version: u32,
) -> Result<IndexHeader> {
    let io_err = |e| RaptorError::io(path, "read", e);
    let window = wire::read_u64(reader).map_err(io_err)?;
    let mask = wire::read_u64(reader).map_err(io_err)?;
    let size = wire::read_u8(reader).map_err(io_err)?;
    let shape = Shape::from_raw(mask, size).map_err(|e| RaptorError::format(path, e.to_string()))?;
    let parts = wire::read_u8(reader).map_err(io_err)?;
    let compressed = wire::read_u8(reader).map_err(io_err)? != 0;

    let bin_count = wire::read_u64(reader).map_err(io_err)?;
    if bin_count > MAX_BIN_COUNT {
        return Err(RaptorError::format(
            path,
            format!("implausible bin count {}", bin_count),
        ));
    }
    let mut bin_paths = Vec::with_capacity(bin_count as usize);
    for _ in 0..bin_count {
        let files = wire::read_u64(reader).map_err(io_err)?;
        if files > MAX_BIN_COUNT {
            return Err(RaptorError::format(
                path,
                format!("implausible file count {}", files),
            ));
        }
        let mut bin = Vec::with_capacity(files as usize);
        for _ in 0..files {
            bin.push(
                wire::read_str(reader, MAX_PATH_LENGTH)
                    .map_err(|e| RaptorError::format(path, e.to_string()))?,
            );
        }
        bin_paths.push(bin);
    }

    let (fpr, is_hibf) = if version >= INDEX_VERSION {
        let fpr = wire::read_f64(reader).map_err(io_err)?;
        let is_hibf = wire::read_u8(reader).map_err(io_err)? != 0;
        (fpr, is_hibf)
    } else {
        (0.0, false)
    };

    Ok(IndexHeader {
        window,
        shape,
        parts,
        compressed,
        bin_paths,
        fpr,
        is_hibf,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hibf::UserBins;
    use tempfile::tempdir;

    fn sample_header(is_hibf: bool) -> IndexHeader {
        IndexHeader {
            window: 23,
            shape: Shape::ungapped(19).unwrap(),
            parts: 1,
            compressed: false,
            bin_paths: vec![
                vec!["bin1.fa".to_string(), "bin1b.fa".to_string()],
                vec!["bin2.fa".to_string()],
            ],
            fpr: 0.05,
            is_hibf,
        }
    }

    #[test]
    fn ibf_index_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.index");

        let ibf = Ibf::new(2, 1024, 2).unwrap();
        ibf.emplace(42, 0);
        ibf.emplace(77, 1);
        let index = RaptorIndex {
            header: sample_header(false),
            payload: IndexPayload::Ibf(ibf),
        };
        index.save(&path).unwrap();

        let back = RaptorIndex::load(&path).unwrap();
        assert_eq!(index, back);
    }

    #[test]
    fn hibf_index_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.index");

        let root = Ibf::new(2, 512, 2).unwrap();
        root.emplace(3, 0);
        let child = Ibf::new(2, 512, 2).unwrap();
        child.emplace(9, 1);
        let hibf = Hibf {
            ibf_vector: vec![root, child],
            next_ibf_id: vec![vec![0, 1], vec![1, 1]],
            user_bins: UserBins::new(3, vec![vec![0, -1], vec![1, 2]]),
        };
        let index = RaptorIndex {
            header: sample_header(true),
            payload: IndexPayload::Hibf(hibf),
        };
        index.save(&path).unwrap();

        let back = RaptorIndex::load(&path).unwrap();
        assert_eq!(index, back);
        assert!(back.header.is_hibf);
    }

    #[test]
    fn header_only_load_skips_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.index");
        let ibf = Ibf::new(4, 64, 1).unwrap();
        let index = RaptorIndex {
            header: sample_header(false),
            payload: IndexPayload::Ibf(ibf),
        };
        index.save(&path).unwrap();

        let header = RaptorIndex::load_header(&path).unwrap();
        assert_eq!(header, index.header);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("future.index");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&INDEX_MAGIC);
        bytes.extend_from_slice(&7u32.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        match RaptorIndex::load(&path) {
            Err(RaptorError::VersionMismatch { found, .. }) => assert_eq!(found, 7),
            other => panic!("expected version mismatch, got {:?}", other),
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.index");
        std::fs::write(&path, b"GARBAGEGARBAGE").unwrap();
        assert!(matches!(
            RaptorIndex::load(&path),
            Err(RaptorError::Format { .. })
        ));
    }

    #[test]
    fn compressed_flag_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("compressed.index");
        let mut header = sample_header(false);
        header.compressed = true;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&INDEX_MAGIC);
        bytes.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        write_header_fields(&mut bytes, &header).unwrap();
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            RaptorIndex::load(&path),
            Err(RaptorError::Format { .. })
        ));
    }
}
