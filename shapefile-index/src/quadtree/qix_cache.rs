//! Fully in-memory quad-tree.
//!
//! The whole `.qix` file is memory-mapped once and decoded into an arena of
//! nodes. The result is immutable and shared through `Arc`; searches over it
//! hold no file handle and no lock.

use std::sync::Arc;
use std::time::SystemTime;

use memmap2::Mmap;

use super::qix_constants::HEADER_LEN;
use super::qix_storage::{parse_header, parse_node};
use super::qix_types::{LeafEntry, Node, NodeOffset, QixHeader};
use crate::envelope::Envelope;
use crate::errors::{ShapefileError, ShapefileResult};
use crate::fid::RecordLocation;
use crate::files::{FileType, ShpFiles};
use crate::iterators::CloseableIterator;

enum CachedNode {
    Leaf(Vec<LeafEntry>),
    /// (child envelope, arena index)
    Internal(Vec<(Envelope, usize)>),
}

pub struct CachedQuadTree {
    nodes: Vec<CachedNode>,
    root: usize,
    header: QixHeader,
    /// Modification time of the `.qix` this tree was loaded from
    source_modified: Option<SystemTime>,
    source_len: u64,
}

impl std::fmt::Debug for CachedQuadTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedQuadTree")
            .field("nodes", &self.nodes.len())
            .field("header", &self.header)
            .field("source_len", &self.source_len)
            .finish()
    }
}

impl CachedQuadTree {
    /// Loads the complete `.qix` file of `files` into memory.
    pub fn load(files: &ShpFiles) -> ShapefileResult<Arc<Self>> {
        let _guard = files.acquire_read(FileType::Qix);
        let file = files.open_read(FileType::Qix)?;
        let metadata = file.metadata()?;
        let source_len = metadata.len();
        let source_modified = metadata.modified().ok();

        if source_len < HEADER_LEN {
            return Err(ShapefileError::corrupt(FileType::Qix, "truncated header"));
        }

        // SAFETY: the map is read-only and only lives while the `.qix` read
        // guard is held, so the file cannot be replaced underneath it.
        let map = unsafe { Mmap::map(&file)? };
        let bytes: &[u8] = &map;
        let header = parse_header(&bytes[..HEADER_LEN as usize], bytes.len() as u64)?;

        let mut nodes = Vec::with_capacity(header.node_count as usize);
        let root = load_node(bytes, header.root_offset, &mut nodes, 0)?;
        log::debug!(
            "Cached spatial index of {} ({} nodes, {} bytes)",
            files.type_name(),
            nodes.len(),
            source_len
        );

        Ok(Arc::new(Self {
            nodes,
            root,
            header,
            source_modified,
            source_len,
        }))
    }

    pub fn header(&self) -> &QixHeader {
        &self.header
    }

    pub fn bounds(&self) -> Envelope {
        self.header.bounds
    }

    pub fn entry_count(&self) -> u32 {
        self.header.entry_count
    }

    pub fn source_modified(&self) -> Option<SystemTime> {
        self.source_modified
    }

    pub fn source_len(&self) -> u64 {
        self.source_len
    }

    /// Same results as the on-disk search over the same file.
    pub fn search(self: &Arc<Self>, bbox: Envelope) -> CachedSearch {
        let stack = if bbox.intersects(&self.header.bounds) {
            vec![self.root]
        } else {
            Vec::new()
        };
        CachedSearch {
            tree: Some(Arc::clone(self)),
            query: bbox,
            stack,
            pending: Vec::new(),
        }
    }
}

/// Guards against cycles in a damaged file; a well-formed tree is never
/// deeper than its builder's depth limit.
const MAX_LOAD_DEPTH: usize = 64;

fn load_node(
    bytes: &[u8],
    offset: NodeOffset,
    nodes: &mut Vec<CachedNode>,
    depth: usize,
) -> ShapefileResult<usize> {
    if depth > MAX_LOAD_DEPTH {
        return Err(ShapefileError::corrupt(FileType::Qix, "tree too deep"));
    }
    let cached = match parse_node(bytes, offset)? {
        Node::Leaf { entries } => CachedNode::Leaf(entries),
        Node::Internal { children } => {
            let mut resolved = Vec::with_capacity(children.len());
            for c in children {
                if c.offset >= offset {
                    return Err(ShapefileError::corrupt(
                        FileType::Qix,
                        format!("child {} does not precede parent {}", c.offset, offset),
                    ));
                }
                resolved.push((c.bbox, load_node(bytes, c.offset, nodes, depth + 1)?));
            }
            CachedNode::Internal(resolved)
        }
    };
    nodes.push(cached);
    Ok(nodes.len() - 1)
}

/// Search over a cached tree. Never fails.
pub struct CachedSearch {
    tree: Option<Arc<CachedQuadTree>>,
    query: Envelope,
    stack: Vec<usize>,
    pending: Vec<RecordLocation>,
}

impl Iterator for CachedSearch {
    type Item = RecordLocation;

    fn next(&mut self) -> Option<Self::Item> {
        let tree = Arc::clone(self.tree.as_ref()?);
        loop {
            if let Some(location) = self.pending.pop() {
                return Some(location);
            }
            let Some(index) = self.stack.pop() else {
                self.tree = None;
                return None;
            };
            match &tree.nodes[index] {
                CachedNode::Leaf(entries) => {
                    let query = self.query;
                    self.pending.extend(
                        entries
                            .iter()
                            .rev()
                            .filter(|e| e.bbox.intersects(&query))
                            .map(|e| e.location),
                    );
                }
                CachedNode::Internal(children) => {
                    let query = self.query;
                    self.stack.extend(
                        children
                            .iter()
                            .rev()
                            .filter(|(bbox, _)| bbox.intersects(&query))
                            .map(|(_, i)| *i),
                    );
                }
            }
        }
    }
}

impl CloseableIterator for CachedSearch {
    fn close(&mut self) {
        self.tree = None;
        self.stack.clear();
        self.pending.clear();
    }

    fn is_closed(&self) -> bool {
        self.tree.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Shape, ShapeType};
    use crate::quadtree::{DiskQuadTree, QuadTreeBuilder};
    use crate::shp::ShpWriter;
    use std::fs::File;
    use tempfile::tempdir;

    fn build(dir: &std::path::Path) -> ShpFiles {
        let files = ShpFiles::new(dir.join("lines.shp")).unwrap();
        let shp = File::create(files.path(FileType::Shp)).unwrap();
        let shx = File::create(files.path(FileType::Shx)).unwrap();
        let mut writer = ShpWriter::new(shp, shx, ShapeType::LineString).unwrap();
        for i in 0..300 {
            let x = (i * 7 % 100) as f64;
            let y = (i * 13 % 100) as f64;
            writer
                .write(&Shape::line(&[(x, y), (x + 3.0, y + 1.5)]))
                .unwrap();
        }
        writer.finish().unwrap();
        let _guard = files.acquire_write(FileType::Qix);
        QuadTreeBuilder::new()
            .leaf_size(5)
            .build_from_shp(&files)
            .unwrap();
        files
    }

    #[test]
    fn test_cached_equals_disk() {
        let dir = tempdir().unwrap();
        let files = build(dir.path());
        let disk = DiskQuadTree::open(&files).unwrap();
        let cached = CachedQuadTree::load(&files).unwrap();
        assert_eq!(cached.entry_count(), 300);
        assert_eq!(cached.bounds(), disk.bounds());
        assert_eq!(cached.source_len(), files.len(FileType::Qix));

        for query in [
            Envelope::new(10.0, 10.0, 30.0, 40.0),
            Envelope::new(0.0, 0.0, 1.0, 1.0),
            Envelope::new(50.0, -10.0, 51.0, 200.0),
            disk.bounds(),
        ] {
            let mut a: Vec<RecordLocation> =
                disk.search(query).unwrap().map(|r| r.unwrap()).collect();
            let mut b: Vec<RecordLocation> = cached.search(query).collect();
            a.sort();
            b.sort();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_cached_search_holds_no_lock() {
        let dir = tempdir().unwrap();
        let files = build(dir.path());
        let cached = CachedQuadTree::load(&files).unwrap();
        let mut search = cached.search(cached.bounds());
        assert!(search.next().is_some());
        assert!(files.try_acquire_write(FileType::Qix).is_some());
        search.close();
        assert!(search.is_closed());
        assert!(search.next().is_none());
    }

    #[test]
    fn test_corrupt_file_fails_to_load() {
        let dir = tempdir().unwrap();
        let files = build(dir.path());
        let path = files.path(FileType::Qix);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let err = CachedQuadTree::load(&files).unwrap_err();
        assert!(err.is_corruption());
    }
}
