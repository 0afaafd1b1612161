//! Segment file naming and directory scanning.

use conflux_core::Result;
use std::path::{Path, PathBuf};

/// Suffix of a segment currently accepting appends.
pub const OPEN_SUFFIX: &str = ".wal";
/// Suffix of a sealed segment, ready to be drained into storage.
pub const SEALED_SUFFIX: &str = ".wal.final";

/// Parsed form of a segment file name: `<node-id>_<sequence><suffix>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentName {
    /// Owning node.
    pub node_id: String,
    /// Position in the node's segment sequence.
    pub sequence: u64,
    /// Whether the file carries the sealed suffix.
    pub sealed: bool,
}

impl SegmentName {
    /// Name for a fresh open segment.
    pub fn open(node_id: impl Into<String>, sequence: u64) -> Self {
        SegmentName {
            node_id: node_id.into(),
            sequence,
            sealed: false,
        }
    }

    /// The sealed counterpart of this name.
    pub fn sealed(&self) -> Self {
        SegmentName {
            node_id: self.node_id.clone(),
            sequence: self.sequence,
            sealed: true,
        }
    }

    /// Parse a file name; `None` when it is not a segment of ours.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (stem, sealed) = if let Some(stem) = file_name.strip_suffix(SEALED_SUFFIX) {
            (stem, true)
        } else if let Some(stem) = file_name.strip_suffix(OPEN_SUFFIX) {
            (stem, false)
        } else {
            return None;
        };
        // Node ids may themselves contain underscores; the sequence is
        // everything after the last one.
        let (node_id, seq) = stem.rsplit_once('_')?;
        let sequence = seq.parse().ok()?;
        Some(SegmentName {
            node_id: node_id.to_string(),
            sequence,
            sealed,
        })
    }

    /// Render the file name.
    pub fn file_name(&self) -> String {
        let suffix = if self.sealed { SEALED_SUFFIX } else { OPEN_SUFFIX };
        format!("{}_{}{}", self.node_id, self.sequence, suffix)
    }

    /// Full path under a WAL directory.
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }
}

/// All segment files in a directory, in no particular order. Files whose
/// names do not parse are ignored.
pub async fn scan_dir(dir: &Path) -> Result<Vec<(SegmentName, PathBuf)>> {
    let mut segments = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if let Some(name) = SegmentName::parse(file_name) {
            segments.push((name, entry.path()));
        }
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_open_and_sealed() {
        let open = SegmentName::parse("node-1_42.wal").unwrap();
        assert_eq!(open.node_id, "node-1");
        assert_eq!(open.sequence, 42);
        assert!(!open.sealed);

        let sealed = SegmentName::parse("node-1_42.wal.final").unwrap();
        assert!(sealed.sealed);
        assert_eq!(sealed.sequence, 42);
    }

    #[test]
    fn node_ids_may_contain_underscores() {
        let name = SegmentName::parse("rack_3_node_b_7.wal").unwrap();
        assert_eq!(name.node_id, "rack_3_node_b");
        assert_eq!(name.sequence, 7);
    }

    #[test]
    fn non_segments_are_ignored() {
        assert!(SegmentName::parse("README.md").is_none());
        assert!(SegmentName::parse("node.wal.tmp").is_none());
        assert!(SegmentName::parse("nounderscore.wal").is_none());
        assert!(SegmentName::parse("node_abc.wal").is_none());
    }

    #[test]
    fn render_matches_parse() {
        let name = SegmentName::open("n", 3);
        assert_eq!(name.file_name(), "n_3.wal");
        assert_eq!(name.sealed().file_name(), "n_3.wal.final");
        assert_eq!(SegmentName::parse(&name.file_name()).unwrap(), name);
    }
}
