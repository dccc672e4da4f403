//! On-disk layout of the identity index (`.fix`).
//!
//! ```text
//! [header: 32 bytes][entry 0]...[entry n-1][trailer: 12 bytes]
//! ```
//!
//! Entries are fixed-width (`entry_len` bytes): record number (`u32` LE),
//! identifier length (`u16` LE), identifier bytes, zero padding. Fixed width
//! gives direct access to the i-th entry while keeping the write order.

use serde::{Deserialize, Serialize};

use crate::errors::{ShapefileError, ShapefileResult};
use crate::files::FileType;

pub const MAGIC: u32 = 0x4649_5846; // "FIXF"
pub const END_MAGIC: u32 = 0x4649_5845; // "FIXE"
pub const VERSION: u32 = 1;
pub const HEADER_LEN: u64 = 32;
pub const TRAILER_LEN: u64 = 12;
/// Record number plus identifier length
pub const ENTRY_PREFIX_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixHeader {
    pub magic: u32,
    pub version: u32,
    /// Set only once the trailer has been written
    pub complete: bool,
    pub entry_count: u64,
    /// Numeric suffix the next new feature will receive
    pub next_id: u64,
    pub entry_len: u32,
}

impl FixHeader {
    pub fn new(entry_count: u64, next_id: u64, entry_len: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            complete: false,
            entry_count,
            next_id,
            entry_len,
        }
    }

    /// Checks the header and that `file_len` matches the layout it describes.
    pub fn validate(&self, file_len: u64) -> ShapefileResult<()> {
        if self.magic != MAGIC {
            return Err(ShapefileError::corrupt(FileType::Fix, "bad magic"));
        }
        if self.version != VERSION {
            return Err(ShapefileError::corrupt(
                FileType::Fix,
                format!("unsupported version {}", self.version),
            ));
        }
        if !self.complete {
            return Err(ShapefileError::corrupt(FileType::Fix, "incomplete index"));
        }
        if self.entry_count > 0 && (self.entry_len as usize) < ENTRY_PREFIX_LEN {
            return Err(ShapefileError::corrupt(FileType::Fix, "bad entry length"));
        }
        let expected = self
            .entry_count
            .checked_mul(self.entry_len as u64)
            .and_then(|n| n.checked_add(HEADER_LEN + TRAILER_LEN));
        if expected != Some(file_len) {
            return Err(ShapefileError::corrupt(
                FileType::Fix,
                "file length does not match entry count",
            ));
        }
        Ok(())
    }

    pub(crate) fn entry_offset(&self, index: u64) -> u64 {
        HEADER_LEN + index * self.entry_len as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixTrailer {
    pub end_magic: u32,
    pub entry_count: u64,
}

impl FixTrailer {
    pub fn new(entry_count: u64) -> Self {
        Self {
            end_magic: END_MAGIC,
            entry_count,
        }
    }

    pub fn validate(&self, header: &FixHeader) -> ShapefileResult<()> {
        if self.end_magic != END_MAGIC {
            return Err(ShapefileError::corrupt(FileType::Fix, "missing end marker"));
        }
        if self.entry_count != header.entry_count {
            return Err(ShapefileError::corrupt(
                FileType::Fix,
                "trailer count does not match header",
            ));
        }
        Ok(())
    }
}

/// One `(identifier, record number)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixEntry {
    pub fid: String,
    pub record_number: u32,
}

impl FixEntry {
    pub(crate) fn encode_into(&self, entry_len: usize, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&self.record_number.to_le_bytes());
        out.extend_from_slice(&(self.fid.len() as u16).to_le_bytes());
        out.extend_from_slice(self.fid.as_bytes());
        out.resize(start + entry_len, 0);
    }

    pub(crate) fn decode(bytes: &[u8]) -> ShapefileResult<FixEntry> {
        if bytes.len() < ENTRY_PREFIX_LEN {
            return Err(ShapefileError::corrupt(FileType::Fix, "short entry"));
        }
        let record_number = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let fid_len = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
        let fid_bytes = bytes
            .get(ENTRY_PREFIX_LEN..ENTRY_PREFIX_LEN + fid_len)
            .ok_or_else(|| ShapefileError::corrupt(FileType::Fix, "identifier overflows entry"))?;
        let fid = std::str::from_utf8(fid_bytes)
            .map_err(|_| ShapefileError::corrupt(FileType::Fix, "identifier is not UTF-8"))?
            .to_string();
        Ok(FixEntry { fid, record_number })
    }
}
