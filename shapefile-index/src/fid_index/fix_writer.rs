use std::fs::File;
use std::io::{BufWriter, Write};

use super::fix_types::{FixEntry, FixHeader, FixTrailer, ENTRY_PREFIX_LEN, HEADER_LEN};
use crate::codec::{encode, encode_padded};
use crate::errors::{ShapefileError, ShapefileResult};
use crate::fid::FeatureId;

/// Collects `(identifier, record number)` pairs in write order and writes a
/// complete `.fix` on [`finish`](FidWriter::finish). Nothing reaches the
/// file before that, so an abandoned writer never leaves a usable index.
#[derive(Debug, Default)]
pub struct FidWriter {
    entries: Vec<FixEntry>,
    max_fid_len: usize,
    next_id: u64,
}

impl FidWriter {
    /// `next_id` is the counter to persist; it only ever grows.
    pub fn new(next_id: u64) -> Self {
        Self {
            entries: Vec::new(),
            max_fid_len: 0,
            next_id,
        }
    }

    pub fn append(&mut self, fid: &FeatureId, record_number: u32) -> ShapefileResult<()> {
        let len = fid.as_str().len();
        if len > u16::MAX as usize {
            return Err(ShapefileError::InvalidOperation(format!(
                "Feature id of {} bytes is too long to index",
                len
            )));
        }
        self.max_fid_len = self.max_fid_len.max(len);
        self.entries.push(FixEntry {
            fid: fid.as_str().to_string(),
            record_number,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn bump_next_id(&mut self, at_least: u64) {
        self.next_id = self.next_id.max(at_least);
    }

    pub fn finish(self, file: File) -> ShapefileResult<FixHeader> {
        let entry_len = ENTRY_PREFIX_LEN + self.max_fid_len;
        let mut header = FixHeader::new(self.entries.len() as u64, self.next_id, entry_len as u32);
        header.complete = true;

        let mut out = BufWriter::new(file);
        out.write_all(&encode_padded(&header, HEADER_LEN as usize)?)?;
        let mut buf = Vec::with_capacity(entry_len);
        for entry in &self.entries {
            buf.clear();
            entry.encode_into(entry_len, &mut buf);
            out.write_all(&buf)?;
        }
        out.write_all(&encode(&FixTrailer::new(header.entry_count))?)?;
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(header)
    }
}
