//! Builds a `.qix` file from record envelopes.
//!
//! The tree is built top-down: a node's area is cut into four quadrants
//! around its centre and every entry goes to the quadrant holding its own
//! centre. Splitting stops once a node holds at most `leaf_size` entries,
//! `max_depth` is reached, or all remaining centres coincide. Nodes are
//! written children-first so the whole file is produced in one pass.

use std::fs::File;

use super::qix_constants::{DEFAULT_LEAF_SIZE, DEFAULT_MAX_DEPTH};
use super::qix_storage::QixWriter;
use super::qix_types::{ChildRef, LeafEntry, Node, NodeOffset, QixHeader};
use crate::envelope::Envelope;
use crate::errors::ShapefileResult;
use crate::files::{FileType, ShpFiles};
use crate::shp::ShpReader;

#[derive(Debug, Clone, Copy)]
pub struct QuadTreeBuilder {
    leaf_size: usize,
    max_depth: usize,
}

impl Default for QuadTreeBuilder {
    fn default() -> Self {
        Self {
            leaf_size: DEFAULT_LEAF_SIZE,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

struct Subtree {
    offset: NodeOffset,
    bbox: Envelope,
    height: u32,
}

impl QuadTreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leaf_size(mut self, leaf_size: usize) -> Self {
        self.leaf_size = leaf_size.max(1);
        self
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// Writes a complete tree over `entries` into `file`. Entries with a null
    /// envelope are not indexed.
    pub fn build<I>(&self, entries: I, file: File) -> ShapefileResult<QixHeader>
    where
        I: IntoIterator<Item = LeafEntry>,
    {
        let entries: Vec<LeafEntry> = entries.into_iter().filter(|e| !e.bbox.is_null()).collect();
        let mut bounds = Envelope::null();
        for e in &entries {
            bounds.expand_to_include_envelope(&e.bbox);
        }

        let mut header = QixHeader::new();
        header.entry_count = entries.len() as u32;
        header.bounds = bounds;

        let mut writer = QixWriter::new(file)?;
        let root = self.write_subtree(&mut writer, entries, bounds, 1)?;
        header.root_offset = root.offset;
        header.height = root.height;
        writer.finish(header)
    }

    /// Scans every record header of the geometry file and replaces the
    /// `.qix` with a freshly built tree. The caller must hold the `.qix`
    /// write guard.
    pub fn build_from_shp(&self, files: &ShpFiles) -> ShapefileResult<QixHeader> {
        let mut entries = Vec::new();
        {
            let mut reader = ShpReader::open(files)?;
            while reader.has_next() {
                let record = reader.next_header()?;
                entries.push(LeafEntry {
                    bbox: record.envelope,
                    location: record.location(),
                });
            }
        }

        let storage = files.storage_file(FileType::Qix)?;
        let header = self.build(entries, storage.reopen()?)?;
        files.persist_all(vec![storage])?;
        log::debug!(
            "Built spatial index for {} with {} entries in {} nodes",
            files.type_name(),
            header.entry_count,
            header.node_count
        );
        Ok(header)
    }

    fn write_subtree(
        &self,
        writer: &mut QixWriter,
        entries: Vec<LeafEntry>,
        area: Envelope,
        depth: usize,
    ) -> ShapefileResult<Subtree> {
        if entries.len() <= self.leaf_size || depth >= self.max_depth || same_centre(&entries) {
            let node = Node::Leaf { entries };
            let bbox = node.compute_bbox();
            let offset = writer.write_node(node)?;
            return Ok(Subtree {
                offset,
                bbox,
                height: 1,
            });
        }

        let (mid_x, mid_y) = area.center();
        let quadrants = area.quadrants();
        let mut buckets: [Vec<LeafEntry>; 4] = Default::default();
        for e in entries {
            let (cx, cy) = e.bbox.center();
            let mut slot = 0;
            if cx >= mid_x {
                slot += 1;
            }
            if cy >= mid_y {
                slot += 2;
            }
            buckets[slot].push(e);
        }

        let mut children = Vec::with_capacity(4);
        let mut height = 0;
        for (bucket, quadrant) in buckets.into_iter().zip(quadrants) {
            if bucket.is_empty() {
                continue;
            }
            let child = self.write_subtree(writer, bucket, quadrant, depth + 1)?;
            height = height.max(child.height);
            children.push(ChildRef {
                bbox: child.bbox,
                offset: child.offset,
            });
        }

        let node = Node::Internal { children };
        let bbox = node.compute_bbox();
        let offset = writer.write_node(node)?;
        Ok(Subtree {
            offset,
            bbox,
            height: height + 1,
        })
    }
}

fn same_centre(entries: &[LeafEntry]) -> bool {
    let mut centres = Envelope::null();
    for e in entries {
        let (x, y) = e.bbox.center();
        centres.expand_to_include(x, y);
    }
    centres.width() == 0.0 && centres.height() == 0.0
}
