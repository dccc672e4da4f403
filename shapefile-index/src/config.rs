use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::quadtree::{DEFAULT_LEAF_SIZE, DEFAULT_MAX_DEPTH};

/// Environment variable holding the default in-memory spatial index size
/// limit, in bytes.
pub const MAX_QIX_CACHE_SIZE_ENV: &str = "SHAPEFILE_MAX_QIX_CACHE_SIZE";

#[derive(Clone)]
/// Indexing and caching settings of a shapefile store.
///
/// A cloneable, thread-safe holder using the PIMPL pattern with
/// `Arc<ShapefileConfigInner>`; clones share the same settings. Every scalar
/// is an atomic so reads never lock.
///
/// Create via [`ShapefileConfig::new`] or [`ShapefileConfig::builder`].
pub struct ShapefileConfig {
    inner: Arc<ShapefileConfigInner>,
}

impl ShapefileConfig {
    /// Creates a configuration with default values:
    /// - in-memory spatial index limit from `SHAPEFILE_MAX_QIX_CACHE_SIZE`,
    ///   else disabled
    /// - indexes created on demand and the spatial index used for queries
    /// - quad-tree leaf size 16 and depth limit 16
    /// - identifiers synthesized from record numbers
    #[inline]
    pub fn new() -> ShapefileConfig {
        ShapefileConfig {
            inner: Arc::new(ShapefileConfigInner::new()),
        }
    }

    #[inline]
    pub fn builder() -> ShapefileConfigBuilder {
        ShapefileConfigBuilder::new()
    }

    /// Largest `.qix` (in bytes) that is loaded fully into memory. Negative
    /// disables caching.
    #[inline]
    pub fn max_qix_cache_size(&self) -> i64 {
        self.inner.max_qix_cache_size.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_max_qix_cache_size(&self, size: i64) {
        self.inner.max_qix_cache_size.store(size, Ordering::Relaxed)
    }

    /// Whether missing or stale indexes are built on demand.
    #[inline]
    pub fn create_index(&self) -> bool {
        self.inner.create_index.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_create_index(&self, v: bool) {
        self.inner.create_index.store(v, Ordering::Relaxed)
    }

    #[inline]
    pub fn use_spatial_index(&self) -> bool {
        self.inner.use_spatial_index.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_use_spatial_index(&self, v: bool) {
        self.inner.use_spatial_index.store(v, Ordering::Relaxed)
    }

    #[inline]
    pub fn leaf_size(&self) -> usize {
        self.inner.leaf_size.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_leaf_size(&self, n: usize) {
        self.inner.leaf_size.store(n.max(1), Ordering::Relaxed)
    }

    #[inline]
    pub fn max_depth(&self) -> usize {
        self.inner.max_depth.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_max_depth(&self, n: usize) {
        self.inner.max_depth.store(n.max(1), Ordering::Relaxed)
    }

    /// Attribute holding stable feature identifiers, if any.
    pub fn fid_column(&self) -> Option<String> {
        self.inner.fid_column.read().clone()
    }

    pub(crate) fn set_fid_column(&self, column: Option<String>) {
        *self.inner.fid_column.write() = column;
    }
}

impl Default for ShapefileConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShapefileConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShapefileConfig")
            .field("max_qix_cache_size", &self.max_qix_cache_size())
            .field("create_index", &self.create_index())
            .field("use_spatial_index", &self.use_spatial_index())
            .field("leaf_size", &self.leaf_size())
            .field("max_depth", &self.max_depth())
            .field("fid_column", &self.fid_column())
            .finish()
    }
}

struct ShapefileConfigInner {
    max_qix_cache_size: AtomicI64,
    create_index: AtomicBool,
    use_spatial_index: AtomicBool,
    leaf_size: AtomicUsize,
    max_depth: AtomicUsize,
    fid_column: RwLock<Option<String>>,
}

impl ShapefileConfigInner {
    /// Caching stays off unless the environment asks for it
    pub const DEFAULT_MAX_QIX_CACHE_SIZE: i64 = -1;

    fn new() -> ShapefileConfigInner {
        ShapefileConfigInner {
            max_qix_cache_size: AtomicI64::new(max_qix_cache_size_from_env()),
            create_index: AtomicBool::new(true),
            use_spatial_index: AtomicBool::new(true),
            leaf_size: AtomicUsize::new(DEFAULT_LEAF_SIZE),
            max_depth: AtomicUsize::new(DEFAULT_MAX_DEPTH),
            fid_column: RwLock::new(None),
        }
    }
}

fn max_qix_cache_size_from_env() -> i64 {
    match std::env::var(MAX_QIX_CACHE_SIZE_ENV) {
        Ok(value) => parse_cache_size(&value),
        Err(_) => ShapefileConfigInner::DEFAULT_MAX_QIX_CACHE_SIZE,
    }
}

fn parse_cache_size(value: &str) -> i64 {
    match value.trim().parse::<i64>() {
        Ok(size) => size,
        Err(e) => {
            log::error!(
                "Ignoring {}={:?}: {}",
                MAX_QIX_CACHE_SIZE_ENV,
                value,
                e
            );
            ShapefileConfigInner::DEFAULT_MAX_QIX_CACHE_SIZE
        }
    }
}

/// Fluent builder for [`ShapefileConfig`].
///
/// ```rust
/// use shapefile_index::ShapefileConfig;
///
/// let config = ShapefileConfig::builder()
///     .max_qix_cache_size(1024 * 1024)
///     .leaf_size(8)
///     .build();
/// assert_eq!(config.leaf_size(), 8);
/// ```
pub struct ShapefileConfigBuilder {
    config: ShapefileConfig,
}

impl ShapefileConfigBuilder {
    #[inline]
    pub fn new() -> ShapefileConfigBuilder {
        ShapefileConfigBuilder {
            config: ShapefileConfig::new(),
        }
    }

    /// Never builds, caches or trusts the spatial index; every bbox query
    /// scans.
    #[inline]
    pub fn scan_only_preset(self) -> Self {
        self.use_spatial_index(false).max_qix_cache_size(-1)
    }

    #[inline]
    pub fn max_qix_cache_size(self, size: i64) -> Self {
        self.config.set_max_qix_cache_size(size);
        self
    }

    #[inline]
    pub fn create_index(self, create_index: bool) -> Self {
        self.config.set_create_index(create_index);
        self
    }

    #[inline]
    pub fn use_spatial_index(self, use_spatial_index: bool) -> Self {
        self.config.set_use_spatial_index(use_spatial_index);
        self
    }

    #[inline]
    pub fn leaf_size(self, leaf_size: usize) -> Self {
        self.config.set_leaf_size(leaf_size);
        self
    }

    #[inline]
    pub fn max_depth(self, max_depth: usize) -> Self {
        self.config.set_max_depth(max_depth);
        self
    }

    #[inline]
    pub fn fid_column(self, column: &str) -> Self {
        self.config.set_fid_column(Some(column.to_string()));
        self
    }

    #[inline]
    pub fn build(self) -> ShapefileConfig {
        self.config
    }
}

impl Default for ShapefileConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
