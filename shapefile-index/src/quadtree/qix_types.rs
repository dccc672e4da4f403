//! Node, header and checksum types of the persisted quad-tree.

use serde::{Deserialize, Serialize};

use super::qix_constants::{MAGIC, VERSION};
use crate::envelope::Envelope;
use crate::errors::{ShapefileError, ShapefileResult};
use crate::fid::RecordLocation;
use crate::files::FileType;

/// Byte offset of a node inside the `.qix` file
pub type NodeOffset = u64;

// ============================================================================
// Node Types
// ============================================================================

/// An indexed record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafEntry {
    pub bbox: Envelope,
    pub location: RecordLocation,
}

/// A child reference in an internal node. `bbox` is the union of
/// everything stored beneath the child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRef {
    pub bbox: Envelope,
    pub offset: NodeOffset,
}

/// Node types in the quad-tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    /// Leaf node containing record entries
    Leaf { entries: Vec<LeafEntry> },
    /// Internal node with up to four quadrant children
    Internal { children: Vec<ChildRef> },
}

impl Node {
    /// Get the envelope enclosing all children/entries
    pub fn compute_bbox(&self) -> Envelope {
        let mut bbox = Envelope::null();
        match self {
            Node::Leaf { entries } => {
                for e in entries {
                    bbox.expand_to_include_envelope(&e.bbox);
                }
            }
            Node::Internal { children } => {
                for c in children {
                    bbox.expand_to_include_envelope(&c.bbox);
                }
            }
        }
        bbox
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Leaf { entries } => entries.len(),
            Node::Internal { children } => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Node with Checksum
// ============================================================================

/// A node wrapped with CRC32 checksum for corruption detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeWithChecksum {
    /// CRC32 checksum of the node data
    pub checksum: u32,
    /// The actual node data
    pub node: Node,
}

impl NodeWithChecksum {
    pub fn new(node: Node) -> ShapefileResult<Self> {
        let checksum = Self::calculate_checksum(&node)?;
        Ok(Self { checksum, node })
    }

    fn calculate_checksum(node: &Node) -> ShapefileResult<u32> {
        let serialized = bincode::serde::encode_to_vec(node, bincode::config::legacy())?;
        Ok(crc32(&serialized))
    }

    /// Verify checksum and consume self to return node
    pub fn into_node(self) -> ShapefileResult<Node> {
        let expected = Self::calculate_checksum(&self.node)?;
        if self.checksum != expected {
            return Err(ShapefileError::corrupt(
                FileType::Qix,
                format!(
                    "node checksum mismatch (expected: {:x}, got: {:x})",
                    expected, self.checksum
                ),
            ));
        }
        Ok(self.node)
    }
}

/// CRC-32/BZIP2 (MPEG-2 polynomial and init, inverted output)
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    const POLY: u32 = 0x04C11DB7;

    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x80000000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }

    crc ^ 0xFFFFFFFF
}

// ============================================================================
// File Header
// ============================================================================

/// File header stored at the beginning of the `.qix` file
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QixHeader {
    pub magic: u32,
    pub version: u32,
    /// Set only once every node has been written
    pub complete: bool,
    pub root_offset: NodeOffset,
    pub entry_count: u32,
    pub node_count: u32,
    pub height: u32,
    /// Union of every indexed envelope
    pub bounds: Envelope,
}

impl QixHeader {
    pub fn new() -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            complete: false,
            root_offset: 0,
            entry_count: 0,
            node_count: 0,
            height: 0,
            bounds: Envelope::null(),
        }
    }

    pub fn validate(&self) -> ShapefileResult<()> {
        if self.magic != MAGIC {
            return Err(ShapefileError::corrupt(FileType::Qix, "bad magic"));
        }
        if self.version != VERSION {
            return Err(ShapefileError::corrupt(
                FileType::Qix,
                format!("unsupported version {}", self.version),
            ));
        }
        if !self.complete {
            return Err(ShapefileError::corrupt(FileType::Qix, "incomplete index"));
        }
        Ok(())
    }
}

impl Default for QixHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::quadtree::qix_constants::HEADER_LEN;

    fn leaf() -> Node {
        Node::Leaf {
            entries: vec![
                LeafEntry {
                    bbox: Envelope::new(0.0, 0.0, 1.0, 1.0),
                    location: RecordLocation::new(1, 64),
                },
                LeafEntry {
                    bbox: Envelope::new(2.0, 2.0, 3.0, 5.0),
                    location: RecordLocation::new(2, 120),
                },
            ],
        }
    }

    #[test]
    fn test_header_fits() {
        let header = QixHeader::new();
        assert!(encode(&header).unwrap().len() as u64 <= HEADER_LEN);
    }

    #[test]
    fn test_incomplete_header_rejected() {
        let header = QixHeader::new();
        let err = header.validate().unwrap_err();
        assert!(err.is_corruption());

        let mut complete = header;
        complete.complete = true;
        assert!(complete.validate().is_ok());
    }

    #[test]
    fn test_compute_bbox() {
        assert_eq!(leaf().compute_bbox(), Envelope::new(0.0, 0.0, 3.0, 5.0));
        assert!(Node::Internal { children: vec![] }.compute_bbox().is_null());
        assert_eq!(leaf().len(), 2);
        assert!(!leaf().is_empty());
    }

    #[test]
    fn test_checksum_round_trip() {
        let wrapped = NodeWithChecksum::new(leaf()).unwrap();
        assert_eq!(wrapped.into_node().unwrap(), leaf());
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut wrapped = NodeWithChecksum::new(leaf()).unwrap();
        if let Node::Leaf { entries } = &mut wrapped.node {
            entries[0].location.record_number = 99;
        }
        let err = wrapped.into_node().unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_crc32_known_value() {
        // CRC-32/BZIP2 check value
        assert_eq!(crc32(b"123456789"), 0xFC89_1918);
    }
}
