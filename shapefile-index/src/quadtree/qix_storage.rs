//! Disk storage layer for the quad-tree.
//!
//! Nodes are variable-length: a little-endian `u32` length followed by a
//! bincode-encoded [`NodeWithChecksum`]. Reading a node is exactly one seek
//! and one read; nothing is preloaded.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};

use super::qix_constants::{HEADER_LEN, NODE_LEN_PREFIX};
use super::qix_types::{Node, NodeOffset, NodeWithChecksum, QixHeader};
use crate::codec::{decode, encode, encode_padded};
use crate::errors::{ShapefileError, ShapefileResult};
use crate::files::FileType;

/// Reads the header and verifies it describes a complete index whose root
/// lies inside the file.
pub fn read_header(file: &mut File) -> ShapefileResult<QixHeader> {
    let file_len = file.metadata()?.len();
    if file_len < HEADER_LEN {
        return Err(ShapefileError::corrupt(FileType::Qix, "truncated header"));
    }
    file.seek(SeekFrom::Start(0))?;
    let mut buffer = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut buffer)?;
    let header = parse_header(&buffer, file_len)?;
    Ok(header)
}

pub(crate) fn parse_header(bytes: &[u8], file_len: u64) -> ShapefileResult<QixHeader> {
    let header: QixHeader = decode(bytes)?;
    header.validate()?;
    if header.root_offset < HEADER_LEN || header.root_offset + NODE_LEN_PREFIX > file_len {
        return Err(ShapefileError::corrupt(
            FileType::Qix,
            "root node outside file",
        ));
    }
    Ok(header)
}

/// Decodes the node whose length prefix starts at `offset` in `bytes`.
pub(crate) fn parse_node(bytes: &[u8], offset: NodeOffset) -> ShapefileResult<Node> {
    let start = offset as usize;
    let body_start = start + NODE_LEN_PREFIX as usize;
    if offset < HEADER_LEN || body_start > bytes.len() {
        return Err(ShapefileError::corrupt(
            FileType::Qix,
            format!("node offset {} outside file", offset),
        ));
    }
    let mut len_bytes = [0u8; NODE_LEN_PREFIX as usize];
    len_bytes.copy_from_slice(&bytes[start..body_start]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    let end = body_start + len;
    if end > bytes.len() {
        return Err(ShapefileError::corrupt(
            FileType::Qix,
            format!("node at {} runs past end of file", offset),
        ));
    }
    let wrapped: NodeWithChecksum = decode(&bytes[body_start..end])?;
    wrapped.into_node()
}

/// Single-node reader over an open `.qix` file.
pub struct QixStorage {
    file: File,
    file_len: u64,
}

impl QixStorage {
    pub fn new(file: File) -> ShapefileResult<Self> {
        let file_len = file.metadata()?.len();
        Ok(Self { file, file_len })
    }

    /// Read a SINGLE node from disk (one seek + one read), verifying its checksum.
    pub fn read_node(&mut self, offset: NodeOffset) -> ShapefileResult<Node> {
        if offset < HEADER_LEN || offset + NODE_LEN_PREFIX > self.file_len {
            return Err(ShapefileError::corrupt(
                FileType::Qix,
                format!("node offset {} outside file", offset),
            ));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut len_bytes = [0u8; NODE_LEN_PREFIX as usize];
        self.file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as u64;
        if offset + NODE_LEN_PREFIX + len > self.file_len {
            return Err(ShapefileError::corrupt(
                FileType::Qix,
                format!("node at {} runs past end of file", offset),
            ));
        }

        let mut buffer = vec![0u8; len as usize];
        self.file.read_exact(&mut buffer)?;
        let wrapped: NodeWithChecksum = decode(&buffer)?;
        wrapped.into_node()
    }
}

/// Sequential node writer. Nodes must be written children-first so every
/// `ChildRef` points backwards.
pub struct QixWriter {
    out: BufWriter<File>,
    offset: NodeOffset,
    node_count: u32,
}

impl QixWriter {
    /// Writes a placeholder (incomplete) header.
    pub fn new(file: File) -> ShapefileResult<Self> {
        let mut out = BufWriter::new(file);
        out.write_all(&encode_padded(&QixHeader::new(), HEADER_LEN as usize)?)?;
        Ok(Self {
            out,
            offset: HEADER_LEN,
            node_count: 0,
        })
    }

    /// Appends a node and returns its offset.
    pub fn write_node(&mut self, node: Node) -> ShapefileResult<NodeOffset> {
        let bytes = encode(&NodeWithChecksum::new(node)?)?;
        let len = u32::try_from(bytes.len()).map_err(|_| {
            ShapefileError::Serialization(format!("Node too large: {} bytes", bytes.len()))
        })?;

        let offset = self.offset;
        self.out.write_all(&len.to_le_bytes())?;
        self.out.write_all(&bytes)?;
        self.offset += NODE_LEN_PREFIX + bytes.len() as u64;
        self.node_count += 1;
        Ok(offset)
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    /// Flushes the nodes, then marks the header complete.
    pub fn finish(self, mut header: QixHeader) -> ShapefileResult<QixHeader> {
        header.complete = true;
        header.node_count = self.node_count;

        let mut file = self.out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&encode_padded(&header, HEADER_LEN as usize)?)?;
        file.sync_all()?;
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::fid::RecordLocation;
    use crate::quadtree::qix_types::{ChildRef, LeafEntry};
    use tempfile::tempdir;

    fn leaf(n: u32) -> Node {
        Node::Leaf {
            entries: (1..=n)
                .map(|i| LeafEntry {
                    bbox: Envelope::of_point(i as f64, i as f64),
                    location: RecordLocation::new(i, 64 + i as u64 * 100),
                })
                .collect(),
        }
    }

    #[test]
    fn test_write_and_read_nodes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.qix");
        let mut writer = QixWriter::new(File::create(&path).unwrap()).unwrap();

        let a = writer.write_node(leaf(3)).unwrap();
        let b = writer.write_node(leaf(1)).unwrap();
        let root = Node::Internal {
            children: vec![
                ChildRef {
                    bbox: leaf(3).compute_bbox(),
                    offset: a,
                },
                ChildRef {
                    bbox: leaf(1).compute_bbox(),
                    offset: b,
                },
            ],
        };
        let root_offset = writer.write_node(root.clone()).unwrap();
        assert_eq!(a, HEADER_LEN);
        assert_eq!(writer.node_count(), 3);

        let mut header = QixHeader::new();
        header.root_offset = root_offset;
        header.entry_count = 4;
        header.height = 2;
        header.bounds = root.compute_bbox();
        writer.finish(header).unwrap();

        let mut file = File::open(&path).unwrap();
        let read = read_header(&mut file).unwrap();
        assert!(read.complete);
        assert_eq!(read.node_count, 3);
        assert_eq!(read.root_offset, root_offset);

        let mut storage = QixStorage::new(file).unwrap();
        assert_eq!(storage.read_node(root_offset).unwrap(), root);
        assert_eq!(storage.read_node(a).unwrap(), leaf(3));
        assert_eq!(storage.read_node(b).unwrap(), leaf(1));

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(parse_node(&bytes, b).unwrap(), leaf(1));
    }

    #[test]
    fn test_unfinished_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.qix");
        let mut writer = QixWriter::new(File::create(&path).unwrap()).unwrap();
        writer.write_node(leaf(2)).unwrap();
        // dropping flushes the buffer but never completes the header
        drop(writer);

        let mut file = File::open(&path).unwrap();
        assert!(read_header(&mut file).unwrap_err().is_corruption());
    }

    #[test]
    fn test_offset_outside_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.qix");
        let mut writer = QixWriter::new(File::create(&path).unwrap()).unwrap();
        let offset = writer.write_node(leaf(1)).unwrap();
        let mut header = QixHeader::new();
        header.root_offset = offset;
        writer.finish(header).unwrap();

        let mut storage = QixStorage::new(File::open(&path).unwrap()).unwrap();
        assert!(storage.read_node(0).unwrap_err().is_corruption());
        assert!(storage.read_node(10_000).unwrap_err().is_corruption());
    }
}
