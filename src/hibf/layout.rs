//! Tree layout produced by the external layout optimizer.
//!
//! The pack file is UTF-8 text. Header lines name the root and every merged
//! bin together with the technical bin chosen to size that node's IBF:
//!
//! ```text
//! #HIGH_LEVEL_IBF max_bin_id:6
//! #MERGED_BIN_2 max_bin_id:0
//! #MERGED_BIN_2;3 max_bin_id:4
//! #FILES	BIN_INDICES	NUMBER_OF_BINS
//! ```
//!
//! Record lines assign one user bin per line: its file paths, the bin-index
//! path from the root, and the split width at each level, all
//! semicolon-separated:
//!
//! ```text
//! a.fa;a2.fa	0	1
//! b.fa	2;3;1	1;1;4
//! ```
//!
//! Parsing materialises an arena of nodes with integer child links; the tree
//! is built once and traversed read-only afterwards.

use crate::error::{RaptorError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct LayoutRecord {
    pub paths: Vec<String>,
    /// First technical bin of this user bin inside its node.
    pub bin_index: usize,
    /// Number of consecutive technical bins the user bin is split across.
    pub number_of_bins: usize,
    pub user_bin_id: i64,
}

#[derive(Debug, Clone)]
pub struct LayoutNode {
    pub technical_bins: usize,
    pub max_bin_index: usize,
    /// Technical bin of the parent that merges this node.
    pub parent_bin_index: usize,
    pub children: Vec<usize>,
    /// Child rooted at `max_bin_index`, if the max bin is a merged bin.
    pub favourite_child: Option<usize>,
    /// User bin records of this node; when the max bin is not a merged bin
    /// the record occupying it comes first.
    pub records: Vec<LayoutRecord>,
}

#[derive(Debug, Clone)]
pub struct Layout {
    /// Arena; index 0 is the root.
    pub nodes: Vec<LayoutNode>,
    /// Per user bin, in id order: the files making up the bin.
    pub bin_paths: Vec<Vec<String>>,
}

impl Layout {
    pub fn parse_file(path: &Path) -> Result<Self> {
        let text =
            fs::read_to_string(path).map_err(|e| RaptorError::io(path, "read", e))?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let mut nodes: Vec<LayoutNode> = Vec::new();
        let mut node_by_path: HashMap<Vec<usize>, usize> = HashMap::new();
        let mut bin_paths: Vec<Vec<String>> = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("#HIGH_LEVEL_IBF") {
                if !nodes.is_empty() {
                    return Err(bad_line(path, lineno, "duplicate #HIGH_LEVEL_IBF header"));
                }
                let max_bin_index = parse_max_bin_id(rest, path, lineno)?;
                node_by_path.insert(Vec::new(), 0);
                nodes.push(new_node(max_bin_index, 0));
                continue;
            }
            if let Some(rest) = line.strip_prefix("#MERGED_BIN_") {
                let (path_part, max_part) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| bad_line(path, lineno, "missing max_bin_id"))?;
                let bin_path = parse_bin_path(path_part, path, lineno)?;
                let max_bin_index = parse_max_bin_id(max_part, path, lineno)?;
                let parent = *node_by_path
                    .get(&bin_path[..bin_path.len() - 1])
                    .ok_or_else(|| bad_line(path, lineno, "merged bin without parent node"))?;
                let parent_bin_index = *bin_path.last().unwrap();
                let idx = nodes.len();
                if node_by_path.insert(bin_path, idx).is_some() {
                    return Err(bad_line(path, lineno, "duplicate merged bin"));
                }
                nodes.push(new_node(max_bin_index, parent_bin_index));
                nodes[parent].children.push(idx);
                continue;
            }
            if line.starts_with('#') {
                continue; // column header line
            }

            if nodes.is_empty() {
                return Err(bad_line(path, lineno, "record before #HIGH_LEVEL_IBF header"));
            }
            let mut columns = line.split('\t');
            let (files, indices, splits) = match (columns.next(), columns.next(), columns.next()) {
                (Some(f), Some(i), Some(s)) => (f, i, s),
                _ => return Err(bad_line(path, lineno, "expected three tab-separated columns")),
            };
            let paths: Vec<String> = files.split(';').map(str::to_string).collect();
            let indices = parse_bin_path(indices, path, lineno)?;
            let splits = parse_bin_path(splits, path, lineno)?;
            if indices.len() != splits.len() {
                return Err(bad_line(
                    path,
                    lineno,
                    "BIN_INDICES and NUMBER_OF_BINS lengths differ",
                ));
            }
            let number_of_bins = *splits.last().unwrap();
            if number_of_bins == 0 {
                return Err(bad_line(path, lineno, "a user bin must span at least one bin"));
            }
            let node = *node_by_path
                .get(&indices[..indices.len() - 1])
                .ok_or_else(|| bad_line(path, lineno, "record addresses unknown node"))?;
            let user_bin_id = bin_paths.len() as i64;
            nodes[node].records.push(LayoutRecord {
                paths: paths.clone(),
                bin_index: *indices.last().unwrap(),
                number_of_bins,
                user_bin_id,
            });
            bin_paths.push(paths);
        }

        if nodes.is_empty() {
            return Err(RaptorError::format(path, "missing #HIGH_LEVEL_IBF header"));
        }

        finalise(&mut nodes, path)?;
        Ok(Layout { nodes, bin_paths })
    }

    pub fn num_user_bins(&self) -> u64 {
        self.bin_paths.len() as u64
    }
}

fn new_node(max_bin_index: usize, parent_bin_index: usize) -> LayoutNode {
    LayoutNode {
        technical_bins: 0,
        max_bin_index,
        parent_bin_index,
        children: Vec::new(),
        favourite_child: None,
        records: Vec::new(),
    }
}

/// Derives bin counts and favourite children, and moves the max-bin record
/// to the front where the max bin is not a merged bin.
fn finalise(nodes: &mut [LayoutNode], path: &Path) -> Result<()> {
    for idx in 0..nodes.len() {
        let child_bins: Vec<usize> = nodes[idx]
            .children
            .iter()
            .map(|&c| nodes[c].parent_bin_index)
            .collect();
        let node = &mut nodes[idx];
        let mut technical_bins = node.max_bin_index + 1;
        for record in &node.records {
            technical_bins = technical_bins.max(record.bin_index + record.number_of_bins);
        }
        for &bin in &child_bins {
            technical_bins = technical_bins.max(bin + 1);
        }
        node.technical_bins = technical_bins;

        let max_bin_index = node.max_bin_index;
        node.favourite_child = None;
        for (slot, &bin) in child_bins.iter().enumerate() {
            if bin == max_bin_index {
                node.favourite_child = Some(node.children[slot]);
                break;
            }
        }

        if node.favourite_child.is_none() {
            let covering = node.records.iter().position(|r| {
                r.bin_index <= max_bin_index && max_bin_index < r.bin_index + r.number_of_bins
            });
            match covering {
                Some(0) => {}
                Some(i) => node.records.swap(0, i),
                None => {
                    return Err(RaptorError::format(
                        path,
                        format!("node has no record or child at its max bin {}", max_bin_index),
                    ))
                }
            }
        }
    }
    Ok(())
}

fn parse_max_bin_id(text: &str, path: &Path, lineno: usize) -> Result<usize> {
    text.trim()
        .strip_prefix("max_bin_id:")
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| bad_line(path, lineno, "malformed max_bin_id"))
}

fn parse_bin_path(text: &str, path: &Path, lineno: usize) -> Result<Vec<usize>> {
    text.split(';')
        .map(|part| part.trim().parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| bad_line(path, lineno, "malformed semicolon-separated index list"))
}

fn bad_line(path: &Path, lineno: usize, detail: &str) -> RaptorError {
    RaptorError::format(path, format!("line {}: {}", lineno + 1, detail))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "\
#HIGH_LEVEL_IBF max_bin_id:2
#FILES\tBIN_INDICES\tNUMBER_OF_BINS
bin1.fa\t0\t1
bin2.fa\t1\t1
bin3.fa\t2\t1
bin4.fa\t3\t1
";

    const NESTED: &str = "\
#HIGH_LEVEL_IBF max_bin_id:0
#MERGED_BIN_0 max_bin_id:3
#FILES\tBIN_INDICES\tNUMBER_OF_BINS
bin1.fa\t0;0\t1;2
bin2.fa\t0;2\t1;1
bin2b.fa\t0;3\t1;1
bin3.fa\t1\t1
";

    #[test]
    fn flat_layout_without_children() {
        let layout = Layout::parse(SIMPLE, Path::new("pack")).unwrap();
        assert_eq!(layout.nodes.len(), 1);
        assert_eq!(layout.num_user_bins(), 4);
        let root = &layout.nodes[0];
        assert_eq!(root.technical_bins, 4);
        assert!(root.favourite_child.is_none());
        // record covering the max bin moved to the front
        assert_eq!(root.records[0].bin_index, 2);
        assert_eq!(root.records[0].user_bin_id, 2);
    }

    #[test]
    fn nested_layout_builds_arena() {
        let layout = Layout::parse(NESTED, Path::new("pack")).unwrap();
        assert_eq!(layout.nodes.len(), 2);
        let root = &layout.nodes[0];
        assert_eq!(root.children, vec![1]);
        assert_eq!(root.favourite_child, Some(1));
        assert_eq!(root.technical_bins, 2);

        let child = &layout.nodes[1];
        assert_eq!(child.parent_bin_index, 0);
        assert_eq!(child.technical_bins, 4);
        assert!(child.favourite_child.is_none());
        // max bin 3 is covered by bin2b.fa
        assert_eq!(child.records[0].user_bin_id, 2);
        // split record spans bins 0..2
        let split = child.records.iter().find(|r| r.user_bin_id == 0).unwrap();
        assert_eq!((split.bin_index, split.number_of_bins), (0, 2));
    }

    #[test]
    fn multi_file_user_bin() {
        let text = "#HIGH_LEVEL_IBF max_bin_id:0\na.fa;b.fa\t0\t1\n";
        let layout = Layout::parse(text, Path::new("pack")).unwrap();
        assert_eq!(layout.bin_paths[0], vec!["a.fa".to_string(), "b.fa".to_string()]);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(Layout::parse("bin1.fa\t0\t1\n", Path::new("pack")).is_err());
        assert!(Layout::parse("#HIGH_LEVEL_IBF max_bin_id:x\n", Path::new("pack")).is_err());
        assert!(Layout::parse(
            "#HIGH_LEVEL_IBF max_bin_id:0\nbin1.fa\t0;1\t1\n",
            Path::new("pack")
        )
        .is_err());
        // record addressing a merged bin that was never declared
        assert!(Layout::parse(
            "#HIGH_LEVEL_IBF max_bin_id:0\nbin1.fa\t2;0\t1;1\n",
            Path::new("pack")
        )
        .is_err());
        // max bin neither record nor child
        assert!(Layout::parse(
            "#HIGH_LEVEL_IBF max_bin_id:5\nbin1.fa\t0\t1\n",
            Path::new("pack")
        )
        .is_err());
    }
}
