//! # Shapefile Index - Spatial and Identity Indexing for Shapefile Sets
//!
//! This crate streams features out of a shapefile set (`.shp` geometry,
//! `.shx` offsets, `.dbf` attributes, `.prj` projection) and keeps two
//! sidecar indexes next to it:
//!
//! - **Quad-tree (`.qix`)**: answers bounding-box queries without a full
//!   scan, read lazily from disk or fully cached in memory
//! - **Identity index (`.fix`)**: stable feature identifiers mapped to
//!   record numbers, surviving deletes and rewrites
//!
//! ## Features
//!
//! - **Fail-soft indexing**: missing, stale or corrupt indexes are rebuilt
//!   on demand, or the query degrades to a scan
//! - **Per-file locking**: one read/write lock per sibling file, taken in a
//!   fixed order
//! - **Copy-on-write writers**: changes land in temp files and replace the
//!   originals atomically on close
//! - **Rendering hints**: geometry generalization and a screen map that
//!   skips features falling on an already painted pixel
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shapefile_index::{Envelope, Query, ShapefileConfig, ShapefileStore};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ShapefileConfig::builder()
//!     .max_qix_cache_size(8 * 1024 * 1024)
//!     .build();
//! let store = ShapefileStore::open("data/roads.shp", config)?;
//!
//! let query = Query::bbox(Envelope::new(10.0, 40.0, 12.0, 42.0));
//! for feature in store.reader(&query)? {
//!     let feature = feature?;
//!     println!("{} {}", feature.id(), feature.envelope());
//! }
//! # Ok(())
//! # }
//! ```

// Core data model
pub mod envelope;
pub mod errors;
pub mod feature;
pub mod fid;
pub mod geometry;
pub mod schema;

// Sibling files and their formats
pub(crate) mod codec;
pub mod dbf;
pub mod files;
pub mod shp;

// Indexes
pub mod fid_index;
pub mod index_manager;
pub mod iterators;
pub mod quadtree;

// Query-time streaming and writing
pub mod config;
pub mod reader;
pub mod screen_map;
pub mod store;
pub mod writer;

pub use config::{ShapefileConfig, ShapefileConfigBuilder, MAX_QIX_CACHE_SIZE_ENV};
pub use envelope::Envelope;
pub use errors::{ShapefileError, ShapefileResult};
pub use feature::Feature;
pub use fid::{FeatureId, RecordLocation};
pub use fid_index::{FidIndexer, IndexedFidReader};
pub use files::{FileType, ShpFiles};
pub use geometry::{Coordinate, Shape, ShapeType};
pub use index_manager::{IndexManager, StalenessVerdict};
pub use iterators::{CandidateIterator, CloseableIterator};
pub use quadtree::{CachedQuadTree, DiskQuadTree, QuadTreeBuilder};
pub use reader::FeatureReader;
pub use schema::{AttributeDescriptor, AttributeKind, FeatureType, Value};
pub use screen_map::ScreenMap;
pub use store::{Filter, Query, ShapefileStore};
pub use writer::{FeatureWriter, WriteMode};
