//! Index lifecycle for one shapefile set: staleness checks, on-demand
//! (re)builds, the in-memory cache decision and query dispatch.
//!
//! Nothing here fails a query because an index is missing, stale or
//! damaged. Such conditions are logged and reported as "no index", and the
//! caller scans instead.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::ShapefileConfig;
use crate::envelope::Envelope;
use crate::errors::ShapefileResult;
use crate::fid::{FeatureId, RecordLocation};
use crate::fid_index::{FidIndexer, IndexedFidReader};
use crate::files::{FileType, ShpFiles};
use crate::iterators::CandidateIterator;
use crate::quadtree::{CachedQuadTree, DiskQuadTree, QuadTreeBuilder};
use crate::shp::ShxReader;

/// Whether a persisted index can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalenessVerdict {
    /// Present and at least as recent as the geometry and offset files
    Fresh,
    /// Present but older than the geometry or offset file
    Stale,
    /// Absent or empty
    Missing,
}

/// Decides which index serves a query. Cloning is cheap; clones share the
/// cached tree.
#[derive(Clone)]
pub struct IndexManager {
    inner: Arc<IndexManagerInner>,
}

struct IndexManagerInner {
    files: ShpFiles,
    config: ShapefileConfig,
    cached_tree: RwLock<Option<Arc<CachedQuadTree>>>,
}

impl IndexManager {
    pub fn new(files: ShpFiles, config: ShapefileConfig) -> IndexManager {
        IndexManager {
            inner: Arc::new(IndexManagerInner {
                files,
                config,
                cached_tree: RwLock::new(None),
            }),
        }
    }

    pub fn files(&self) -> &ShpFiles {
        &self.inner.files
    }

    pub fn config(&self) -> &ShapefileConfig {
        &self.inner.config
    }

    // ========================================================================
    // Staleness
    // ========================================================================

    /// Compares the modification time of `file_type` against the geometry
    /// and offset files. Base files are `Fresh` whenever they exist.
    pub fn verdict(&self, file_type: FileType) -> StalenessVerdict {
        let files = &self.inner.files;
        if !files.exists(file_type) || files.len(file_type) == 0 {
            return StalenessVerdict::Missing;
        }
        if !matches!(file_type, FileType::Qix | FileType::Fix) {
            return StalenessVerdict::Fresh;
        }

        let Some(index_modified) = files.modified(file_type) else {
            return StalenessVerdict::Stale;
        };
        let newer_base = [FileType::Shp, FileType::Shx]
            .iter()
            .any(|base| match files.modified(*base) {
                Some(base_modified) => index_modified < base_modified,
                None => false,
            });
        if newer_base {
            StalenessVerdict::Stale
        } else {
            StalenessVerdict::Fresh
        }
    }

    /// True if `file_type` is fresh and passes its structural checks.
    pub fn index_usable(&self, file_type: FileType) -> bool {
        if self.verdict(file_type) != StalenessVerdict::Fresh {
            return false;
        }
        let checked = match file_type {
            FileType::Qix => DiskQuadTree::open(&self.inner.files).map(|_| ()),
            FileType::Fix => IndexedFidReader::open(&self.inner.files).map(|_| ()),
            _ => Ok(()),
        };
        match checked {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "Ignoring {} index of {}: {}",
                    file_type,
                    self.inner.files.type_name(),
                    e
                );
                false
            }
        }
    }

    // ========================================================================
    // Building
    // ========================================================================

    /// Rebuilds the spatial index if `force` is set or the current one is
    /// not usable. Returns whether a rebuild happened. Only local sets with
    /// index creation enabled are ever rebuilt.
    pub fn ensure_spatial_index(&self, force: bool) -> bool {
        let files = &self.inner.files;
        let config = &self.inner.config;
        if !files.is_local() || !config.create_index() {
            return false;
        }
        if !force && self.index_usable(FileType::Qix) {
            return false;
        }

        let Some(_guard) = files.try_acquire_write(FileType::Qix) else {
            log::warn!(
                "Spatial index of {} is in use, skipping rebuild",
                files.type_name()
            );
            return false;
        };
        self.drop_cached_tree();

        let builder = QuadTreeBuilder::new()
            .leaf_size(config.leaf_size())
            .max_depth(config.max_depth());
        match builder.build_from_shp(files) {
            Ok(_) => true,
            Err(e) => {
                log::error!(
                    "Failed to build spatial index of {}: {}",
                    files.type_name(),
                    e
                );
                false
            }
        }
    }

    /// Returns true if the identity index is usable, building it first when
    /// it is not and `create_if_missing` allows.
    pub fn ensure_identity_index(&self, create_if_missing: bool) -> bool {
        if self.index_usable(FileType::Fix) {
            return true;
        }
        let files = &self.inner.files;
        if !create_if_missing || !files.is_local() {
            return false;
        }
        let fid_column = self.inner.config.fid_column();
        match FidIndexer::generate(files, fid_column.as_deref()) {
            Ok(_) => true,
            Err(e) => {
                log::error!(
                    "Failed to build identity index of {}: {}",
                    files.type_name(),
                    e
                );
                false
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Candidates for a bounding-box query.
    ///
    /// `None` means every record must be scanned and tested: there is no
    /// usable index, or `bbox` contains the whole indexed extent.
    pub fn query_by_bounds(&self, bbox: &Envelope) -> Option<CandidateIterator> {
        let files = &self.inner.files;
        if !self.inner.config.use_spatial_index() {
            return None;
        }
        if files.is_local() {
            self.ensure_spatial_index(false);
        }
        if !self.index_usable(FileType::Qix) {
            self.drop_cached_tree();
            return None;
        }

        if let Some(tree) = self.cached_tree_for_query() {
            if bbox.contains(&tree.bounds()) {
                return None;
            }
            return Some(CandidateIterator::Cached(tree.search(*bbox)));
        }

        let tree = match DiskQuadTree::open(files) {
            Ok(tree) => tree,
            Err(e) => {
                log::warn!("Cannot open spatial index of {}: {}", files.type_name(), e);
                return None;
            }
        };
        if bbox.contains(&tree.bounds()) {
            return None;
        }
        match tree.search(*bbox) {
            Ok(search) => Some(CandidateIterator::Disk(search)),
            Err(e) => {
                log::warn!("Cannot search spatial index of {}: {}", files.type_name(), e);
                None
            }
        }
    }

    /// The cached tree to serve a query from, loading or reloading it when
    /// the `.qix` is small enough and the held copy is missing or outdated.
    fn cached_tree_for_query(&self) -> Option<Arc<CachedQuadTree>> {
        let files = &self.inner.files;
        let limit = self.inner.config.max_qix_cache_size();
        let qix_len = files.len(FileType::Qix);
        if limit < 0 || qix_len >= limit as u64 {
            self.drop_cached_tree();
            return None;
        }

        let modified = files.modified(FileType::Qix);
        if let Some(tree) = self.inner.cached_tree.read().as_ref() {
            if tree.source_len() == qix_len && tree.source_modified() == modified {
                return Some(Arc::clone(tree));
            }
        }

        match CachedQuadTree::load(files) {
            Ok(tree) => {
                *self.inner.cached_tree.write() = Some(Arc::clone(&tree));
                Some(tree)
            }
            Err(e) => {
                log::warn!(
                    "Cannot cache spatial index of {}: {}",
                    files.type_name(),
                    e
                );
                self.drop_cached_tree();
                None
            }
        }
    }

    /// Locations of the records carrying `ids`.
    ///
    /// Identifiers are sorted before the lookup so that a batch in file
    /// order costs one pass over the index. Unknown identifiers are skipped.
    /// `Ok(None)` means no identity index is available and the caller has to
    /// scan and filter.
    pub fn query_by_identifiers<'a, I>(&self, ids: I) -> ShapefileResult<Option<Vec<RecordLocation>>>
    where
        I: IntoIterator<Item = &'a FeatureId>,
    {
        let sorted: BTreeSet<&FeatureId> = ids.into_iter().collect();
        if !self.ensure_identity_index(self.inner.config.create_index()) {
            return Ok(None);
        }

        let files = &self.inner.files;
        let mut shx = ShxReader::open(files)?;
        let mut fix = match IndexedFidReader::open(files) {
            Ok(reader) => reader,
            Err(e) => {
                log::warn!("Cannot open identity index of {}: {}", files.type_name(), e);
                return Ok(None);
            }
        };

        let mut locations = Vec::with_capacity(sorted.len());
        for id in sorted {
            let record_number = match fix.find_record_number(id.as_str()) {
                Ok(Some(n)) => n,
                Ok(None) => {
                    log::trace!("Feature {} not found in {}", id, files.type_name());
                    continue;
                }
                Err(e) => {
                    log::warn!("Identity index of {} is unreadable: {}", files.type_name(), e);
                    return Ok(None);
                }
            };
            match shx.offset_of(record_number) {
                Ok(offset) => locations.push(RecordLocation::new(record_number, offset)),
                Err(e) => log::trace!("Feature {} has no record: {}", id, e),
            }
        }
        Ok(Some(locations))
    }

    /// Root envelope of the usable spatial index, if any.
    pub fn spatial_index_bounds(&self) -> Option<Envelope> {
        if let Some(tree) = self.inner.cached_tree.read().as_ref() {
            return Some(tree.bounds());
        }
        if !self.index_usable(FileType::Qix) {
            return None;
        }
        DiskQuadTree::open(&self.inner.files)
            .ok()
            .map(|tree| tree.bounds())
    }

    pub fn has_cached_tree(&self) -> bool {
        self.inner.cached_tree.read().is_some()
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Deletes the `.qix` and drops the cached tree. Blocks until no search
    /// holds the `.qix` read lock.
    pub fn invalidate_spatial_index(&self) -> ShapefileResult<()> {
        let files = &self.inner.files;
        let _guard = files.acquire_write(FileType::Qix);
        self.drop_cached_tree();
        if files.delete(FileType::Qix)? {
            log::debug!("Deleted spatial index of {}", files.type_name());
        }
        Ok(())
    }

    /// Drops the cached tree. No file is touched.
    pub fn dispose(&self) {
        self.drop_cached_tree();
    }

    fn drop_cached_tree(&self) {
        self.inner.cached_tree.write().take();
    }
}

impl fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexManager")
            .field("files", &self.inner.files)
            .field("cached", &self.has_cached_tree())
            .finish()
    }
}
