//! DiskQuadTree implementation.

use super::qix_storage::{read_header, QixStorage};
use super::qix_types::{Node, NodeOffset, QixHeader};
use crate::envelope::Envelope;
use crate::errors::ShapefileResult;
use crate::fid::RecordLocation;
use crate::files::{FileReadGuard, FileType, ShpFiles};
use crate::iterators::CloseableIterator;

/// A quad-tree read lazily from its `.qix` file, one node per step.
///
/// Opening reads only the header. Every [`search`](DiskQuadTree::search)
/// opens its own file handle and keeps the `.qix` read lock until the
/// returned iterator is closed or dropped.
#[derive(Debug, Clone)]
pub struct DiskQuadTree {
    files: ShpFiles,
    header: QixHeader,
}

impl DiskQuadTree {
    pub fn open(files: &ShpFiles) -> ShapefileResult<Self> {
        let _guard = files.acquire_read(FileType::Qix);
        let mut file = files.open_read(FileType::Qix)?;
        let header = read_header(&mut file)?;
        Ok(Self {
            files: files.clone(),
            header,
        })
    }

    pub fn header(&self) -> &QixHeader {
        &self.header
    }

    /// Union of every indexed envelope.
    pub fn bounds(&self) -> Envelope {
        self.header.bounds
    }

    pub fn entry_count(&self) -> u32 {
        self.header.entry_count
    }

    /// Lazily yields the locations of entries whose envelope intersects `bbox`.
    pub fn search(&self, bbox: Envelope) -> ShapefileResult<DiskSearch> {
        let guard = self.files.acquire_read(FileType::Qix);
        if !bbox.intersects(&self.header.bounds) {
            return Ok(DiskSearch { state: None });
        }

        let storage = QixStorage::new(self.files.open_read(FileType::Qix)?)?;
        Ok(DiskSearch {
            state: Some(SearchState {
                storage,
                query: bbox,
                stack: vec![self.header.root_offset],
                pending: Vec::new(),
                _guard: guard,
            }),
        })
    }
}

struct SearchState {
    storage: QixStorage,
    query: Envelope,
    /// Nodes still to visit, last on top
    stack: Vec<NodeOffset>,
    /// Matches of the current leaf, reversed
    pending: Vec<RecordLocation>,
    _guard: FileReadGuard,
}

impl SearchState {
    fn advance(&mut self) -> ShapefileResult<Option<RecordLocation>> {
        loop {
            if let Some(location) = self.pending.pop() {
                return Ok(Some(location));
            }
            let Some(offset) = self.stack.pop() else {
                return Ok(None);
            };
            match self.storage.read_node(offset)? {
                Node::Leaf { entries } => {
                    self.pending.extend(
                        entries
                            .iter()
                            .rev()
                            .filter(|e| e.bbox.intersects(&self.query))
                            .map(|e| e.location),
                    );
                }
                Node::Internal { children } => {
                    self.stack.extend(
                        children
                            .iter()
                            .rev()
                            .filter(|c| c.bbox.intersects(&self.query))
                            .map(|c| c.offset),
                    );
                }
            }
        }
    }
}

/// Lazy on-disk search. Holds a file handle and the `.qix` read lock until
/// exhausted, closed or dropped.
pub struct DiskSearch {
    state: Option<SearchState>,
}

impl Iterator for DiskSearch {
    type Item = ShapefileResult<RecordLocation>;

    fn next(&mut self) -> Option<Self::Item> {
        let state = self.state.as_mut()?;
        match state.advance() {
            Ok(Some(location)) => Some(Ok(location)),
            Ok(None) => {
                self.close();
                None
            }
            Err(e) => {
                log::warn!("Spatial index traversal failed: {}", e);
                self.close();
                Some(Err(e))
            }
        }
    }
}

impl CloseableIterator for DiskSearch {
    fn close(&mut self) {
        self.state = None;
    }

    fn is_closed(&self) -> bool {
        self.state.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Shape, ShapeType};
    use crate::quadtree::QuadTreeBuilder;
    use crate::shp::ShpWriter;
    use std::fs::File;
    use tempfile::tempdir;

    fn grid_files(dir: &std::path::Path, n: usize) -> ShpFiles {
        let files = ShpFiles::new(dir.join("grid.shp")).unwrap();
        let shp = File::create(files.path(FileType::Shp)).unwrap();
        let shx = File::create(files.path(FileType::Shx)).unwrap();
        let mut writer = ShpWriter::new(shp, shx, ShapeType::Point).unwrap();
        for i in 0..n {
            writer
                .write(&Shape::point((i % 10) as f64, (i / 10) as f64))
                .unwrap();
        }
        writer.finish().unwrap();

        let _guard = files.acquire_write(FileType::Qix);
        QuadTreeBuilder::new()
            .leaf_size(4)
            .build_from_shp(&files)
            .unwrap();
        files
    }

    fn numbers(search: DiskSearch) -> Vec<u32> {
        let mut found: Vec<u32> = search.map(|r| r.unwrap().record_number).collect();
        found.sort();
        found
    }

    #[test]
    fn test_search_matches_brute_force() {
        let dir = tempdir().unwrap();
        let files = grid_files(dir.path(), 100);
        let tree = DiskQuadTree::open(&files).unwrap();
        assert_eq!(tree.entry_count(), 100);
        assert_eq!(tree.bounds(), Envelope::new(0.0, 0.0, 9.0, 9.0));

        let query = Envelope::new(2.5, 3.0, 5.0, 4.5);
        let expected: Vec<u32> = (0..100u32)
            .filter(|i| query.contains_point((i % 10) as f64, (i / 10) as f64))
            .map(|i| i + 1)
            .collect();
        assert_eq!(numbers(tree.search(query).unwrap()), expected);
    }

    #[test]
    fn test_search_everything_and_nothing() {
        let dir = tempdir().unwrap();
        let files = grid_files(dir.path(), 50);
        let tree = DiskQuadTree::open(&files).unwrap();

        let all = numbers(tree.search(tree.bounds()).unwrap());
        assert_eq!(all, (1..=50).collect::<Vec<u32>>());

        let none = tree.search(Envelope::new(100.0, 100.0, 200.0, 200.0)).unwrap();
        assert!(none.is_closed());
        assert_eq!(numbers(none), Vec::<u32>::new());
    }

    #[test]
    fn test_close_releases_lock() {
        let dir = tempdir().unwrap();
        let files = grid_files(dir.path(), 100);
        let tree = DiskQuadTree::open(&files).unwrap();

        let mut search = tree.search(tree.bounds()).unwrap();
        assert!(search.next().is_some());
        assert!(files.try_acquire_write(FileType::Qix).is_none());

        search.close();
        search.close();
        assert!(search.is_closed());
        assert!(search.next().is_none());
        assert!(files.try_acquire_write(FileType::Qix).is_some());
    }

    #[test]
    fn test_drop_releases_lock() {
        let dir = tempdir().unwrap();
        let files = grid_files(dir.path(), 100);
        let tree = DiskQuadTree::open(&files).unwrap();
        {
            let mut search = tree.search(tree.bounds()).unwrap();
            search.next();
        }
        assert!(files.try_acquire_write(FileType::Qix).is_some());
    }

    #[test]
    fn test_exhaustion_releases_lock() {
        let dir = tempdir().unwrap();
        let files = grid_files(dir.path(), 20);
        let tree = DiskQuadTree::open(&files).unwrap();
        let mut search = tree.search(tree.bounds()).unwrap();
        while search.next().is_some() {}
        assert!(files.try_acquire_write(FileType::Qix).is_some());
    }
}
