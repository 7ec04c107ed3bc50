//! Index upgrade from envelope version 1 to the current version.
//!
//! Version 1 stored window, shape, parts, the compressed flag and the bin
//! paths, followed by a plain IBF payload. The current version adds the
//! false-positive rate and the HIBF flag; the rate is not recoverable from
//! an old index and must be supplied on the command line.

use crate::error::{RaptorError, Result};
use crate::ibf::Ibf;
use crate::index::{self, IndexPayload, RaptorIndex, INDEX_MAGIC, INDEX_VERSION, OLD_INDEX_VERSION};
use crate::wire;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct UpgradeArguments {
    pub index: PathBuf,
    pub output: PathBuf,
    pub fpr: f64,
}

pub fn run_upgrade(args: &UpgradeArguments) -> Result<()> {
    let path = &args.index;
    let file = File::open(path).map_err(|e| RaptorError::io(path, "open", e))?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|e| RaptorError::io(path, "read", e))?;
    if magic != INDEX_MAGIC {
        return Err(RaptorError::format(path, "not a raptor index (bad magic)"));
    }
    let version = wire::read_u32(&mut reader).map_err(|e| RaptorError::io(path, "read", e))?;
    if version != OLD_INDEX_VERSION {
        return Err(RaptorError::VersionMismatch {
            path: path.clone(),
            found: version,
        });
    }

    let mut header = index::read_header_fields(&mut reader, path, version)?;
    let ibf = Ibf::read_from(&mut reader, path)?;

    header.fpr = args.fpr;
    header.is_hibf = false;
    log::info!(
        "upgrading '{}' (version {} -> {}), {} bins",
        path.display(),
        OLD_INDEX_VERSION,
        INDEX_VERSION,
        header.bin_paths.len()
    );

    RaptorIndex {
        header,
        payload: IndexPayload::Ibf(ibf),
    }
    .save(&args.output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexHeader;
    use crate::shape::Shape;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_v1(path: &std::path::Path, header: &IndexHeader, ibf: &Ibf) {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&INDEX_MAGIC);
        bytes.extend_from_slice(&OLD_INDEX_VERSION.to_le_bytes());
        wire::write_u64(&mut bytes, header.window).unwrap();
        wire::write_u64(&mut bytes, header.shape.mask()).unwrap();
        wire::write_u8(&mut bytes, header.shape.size() as u8).unwrap();
        wire::write_u8(&mut bytes, header.parts).unwrap();
        wire::write_u8(&mut bytes, header.compressed as u8).unwrap();
        wire::write_u64(&mut bytes, header.bin_paths.len() as u64).unwrap();
        for bin in &header.bin_paths {
            wire::write_u64(&mut bytes, bin.len() as u64).unwrap();
            for p in bin {
                wire::write_str(&mut bytes, p).unwrap();
            }
        }
        ibf.write_to(&mut bytes).unwrap();
        let mut file = File::create(path).unwrap();
        file.write_all(&bytes).unwrap();
    }

    fn v1_header() -> IndexHeader {
        IndexHeader {
            window: 23,
            shape: Shape::ungapped(19).unwrap(),
            parts: 1,
            compressed: false,
            bin_paths: vec![vec!["bin1.fa".to_string()]],
            fpr: 0.0,
            is_hibf: false,
        }
    }

    #[test]
    fn upgrades_v1_to_current() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old.index");
        let new = dir.path().join("new.index");

        let ibf = Ibf::new(1, 512, 2).unwrap();
        ibf.emplace(42, 0);
        write_v1(&old, &v1_header(), &ibf);

        // the plain loader refuses the old version
        assert!(matches!(
            RaptorIndex::load(&old),
            Err(RaptorError::VersionMismatch { found: 1, .. })
        ));

        run_upgrade(&UpgradeArguments {
            index: old,
            output: new.clone(),
            fpr: 0.05,
        })
        .unwrap();

        let upgraded = RaptorIndex::load(&new).unwrap();
        assert_eq!(upgraded.header.window, 23);
        assert_eq!(upgraded.header.fpr, 0.05);
        assert!(!upgraded.header.is_hibf);
        match &upgraded.payload {
            IndexPayload::Ibf(ibf) => assert_eq!(ibf.bulk_count(&[42])[0], 1),
            other => panic!("expected IBF payload, got {:?}", other),
        }
    }

    #[test]
    fn refuses_current_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("current.index");
        let index = RaptorIndex {
            header: IndexHeader {
                fpr: 0.05,
                ..v1_header()
            },
            payload: IndexPayload::Ibf(Ibf::new(1, 64, 1).unwrap()),
        };
        index.save(&path).unwrap();

        let result = run_upgrade(&UpgradeArguments {
            index: path,
            output: dir.path().join("out.index"),
            fpr: 0.05,
        });
        assert!(matches!(
            result,
            Err(RaptorError::VersionMismatch { found: 2, .. })
        ));
    }
}
