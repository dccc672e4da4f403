//! Identity (feature id) index.
//!
//! The `.fix` file maps every feature identifier to the record number it is
//! stored at, in write order, and persists the counter new identifiers are
//! drawn from. A file without its completion flag or end marker is treated
//! as missing and rebuilt, never trusted.

mod fid_indexer;
pub mod fix_reader;
pub mod fix_types;
pub mod fix_writer;

pub use fid_indexer::FidIndexer;
pub use fix_reader::IndexedFidReader;
pub use fix_types::{FixEntry, FixHeader, FixTrailer};
pub use fix_writer::FidWriter;
