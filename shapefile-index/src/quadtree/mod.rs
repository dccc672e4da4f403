//! Persisted quad-tree spatial index (`.qix`).
//!
//! This module provides the quad-tree used to answer bounding-box queries:
//! - A one-pass builder that writes nodes children-first to a temp file
//! - CRC-checked, length-prefixed nodes behind a fixed header with a
//!   completion flag, so a half-written file is never mistaken for an index
//! - A lazy on-disk search reading one node per step
//! - A fully cached, memory-mapped variant with identical results

pub mod qix_constants;
pub mod qix_types;
pub mod qix_storage;
mod qix_builder;
mod qix_cache;
mod qix_impl;

pub use qix_builder::QuadTreeBuilder;
pub use qix_cache::{CachedQuadTree, CachedSearch};
pub use qix_constants::{DEFAULT_LEAF_SIZE, DEFAULT_MAX_DEPTH};
pub use qix_impl::{DiskQuadTree, DiskSearch};
pub use qix_types::{ChildRef, LeafEntry, Node, NodeOffset, NodeWithChecksum, QixHeader};
