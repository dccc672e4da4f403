//! Constants for the persisted quad-tree.

/// Magic number for file format identification
pub const MAGIC: u32 = 0x5149_5846; // "QIXF"

/// File format version
pub const VERSION: u32 = 1;

/// Fixed size of the file header; the first node starts right after it
pub const HEADER_LEN: u64 = 64;

/// Each node is prefixed by its encoded length
pub const NODE_LEN_PREFIX: u64 = 4;

/// Maximum number of entries a node holds before it is split
pub const DEFAULT_LEAF_SIZE: usize = 16;

/// Nodes at this depth are never split, however many entries they hold
pub const DEFAULT_MAX_DEPTH: usize = 16;
