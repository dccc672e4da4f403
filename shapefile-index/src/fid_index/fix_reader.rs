use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};

use super::fix_types::{FixEntry, FixHeader, FixTrailer, HEADER_LEN, TRAILER_LEN};
use crate::codec::decode;
use crate::errors::{ShapefileError, ShapefileResult};
use crate::fid::FeatureId;
use crate::files::{FileReadGuard, FileType, ShpFiles};

/// Reader over a validated `.fix` file. Holds the `.fix` read lock for its
/// lifetime.
///
/// Lookups by identifier scan forward from where the previous lookup
/// stopped and wrap around once, so a batch of identifiers sorted in file
/// order costs a single pass while an unsorted batch is still answered
/// correctly.
#[derive(Debug)]
pub struct IndexedFidReader {
    input: BufReader<File>,
    header: FixHeader,
    /// Index of the entry the stream is positioned at
    cursor: u64,
    buf: Vec<u8>,
    _guard: FileReadGuard,
}

impl IndexedFidReader {
    pub fn open(files: &ShpFiles) -> ShapefileResult<Self> {
        let guard = files.acquire_read(FileType::Fix);
        let mut file = files.open_read(FileType::Fix)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_LEN + TRAILER_LEN {
            return Err(ShapefileError::corrupt(FileType::Fix, "truncated file"));
        }

        let mut header_buf = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header_buf)?;
        let header: FixHeader = decode(&header_buf)?;
        header.validate(file_len)?;

        file.seek(SeekFrom::Start(file_len - TRAILER_LEN))?;
        let mut trailer_buf = [0u8; TRAILER_LEN as usize];
        file.read_exact(&mut trailer_buf)?;
        let trailer: FixTrailer = decode(&trailer_buf)?;
        trailer.validate(&header)?;

        file.seek(SeekFrom::Start(HEADER_LEN))?;
        Ok(Self {
            input: BufReader::new(file),
            header,
            cursor: 0,
            buf: vec![0u8; header.entry_len as usize],
            _guard: guard,
        })
    }

    pub fn header(&self) -> &FixHeader {
        &self.header
    }

    pub fn entry_count(&self) -> u64 {
        self.header.entry_count
    }

    /// Numeric suffix the next new feature receives.
    pub fn next_id(&self) -> u64 {
        self.header.next_id
    }

    fn read_at(&mut self, index: u64) -> ShapefileResult<FixEntry> {
        if index != self.cursor {
            self.input
                .seek(SeekFrom::Start(self.header.entry_offset(index)))?;
        }
        self.input.read_exact(&mut self.buf)?;
        self.cursor = index + 1;
        FixEntry::decode(&self.buf)
    }

    /// Scans at most one full cycle from the cursor for the first entry
    /// matching `predicate`.
    fn scan<F>(&mut self, mut predicate: F) -> ShapefileResult<Option<FixEntry>>
    where
        F: FnMut(&FixEntry) -> bool,
    {
        let n = self.header.entry_count;
        let mut index = self.cursor;
        for _ in 0..n {
            if index >= n {
                index = 0;
            }
            let entry = self.read_at(index)?;
            if predicate(&entry) {
                return Ok(Some(entry));
            }
            index += 1;
        }
        Ok(None)
    }

    /// Record number stored for `fid`, if present.
    pub fn find_record_number(&mut self, fid: &str) -> ShapefileResult<Option<u32>> {
        Ok(self.scan(|e| e.fid == fid)?.map(|e| e.record_number))
    }

    /// Identifier stored for `record_number`, if present. Entries written in
    /// record order are found with a single direct read.
    pub fn fid_for_record(&mut self, record_number: u32) -> ShapefileResult<Option<FeatureId>> {
        let n = self.header.entry_count;
        if record_number >= 1 && record_number as u64 <= n {
            let entry = self.read_at(record_number as u64 - 1)?;
            if entry.record_number == record_number {
                return Ok(Some(FeatureId::new(entry.fid)));
            }
        }
        Ok(self
            .scan(|e| e.record_number == record_number)?
            .map(|e| FeatureId::new(e.fid)))
    }

    /// Reads every entry in file order.
    pub fn entries(&mut self) -> ShapefileResult<Vec<FixEntry>> {
        let n = self.header.entry_count;
        (0..n).map(|i| self.read_at(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fid_index::FidWriter;
    use std::fs;
    use tempfile::tempdir;

    fn write_index(files: &ShpFiles, fids: &[(&str, u32)], next_id: u64) {
        let mut writer = FidWriter::new(next_id);
        for (fid, n) in fids {
            writer.append(&FeatureId::from(*fid), *n).unwrap();
        }
        writer
            .finish(File::create(files.path(FileType::Fix)).unwrap())
            .unwrap();
    }

    fn sequential(n: u32) -> Vec<(String, u32)> {
        (1..=n).map(|i| (format!("t.{}", i), i)).collect()
    }

    #[test]
    fn test_find_sorted_batch() {
        let dir = tempdir().unwrap();
        let files = ShpFiles::new(dir.path().join("t.shp")).unwrap();
        let fids = sequential(50);
        let refs: Vec<(&str, u32)> = fids.iter().map(|(f, n)| (f.as_str(), *n)).collect();
        write_index(&files, &refs, 51);

        let mut reader = IndexedFidReader::open(&files).unwrap();
        assert_eq!(reader.entry_count(), 50);
        assert_eq!(reader.next_id(), 51);
        assert_eq!(reader.find_record_number("t.3").unwrap(), Some(3));
        assert_eq!(reader.find_record_number("t.17").unwrap(), Some(17));
        assert_eq!(reader.find_record_number("t.49").unwrap(), Some(49));
    }

    #[test]
    fn test_find_unsorted_batch_wraps() {
        let dir = tempdir().unwrap();
        let files = ShpFiles::new(dir.path().join("t.shp")).unwrap();
        let fids = sequential(20);
        let refs: Vec<(&str, u32)> = fids.iter().map(|(f, n)| (f.as_str(), *n)).collect();
        write_index(&files, &refs, 21);

        let mut reader = IndexedFidReader::open(&files).unwrap();
        assert_eq!(reader.find_record_number("t.18").unwrap(), Some(18));
        assert_eq!(reader.find_record_number("t.2").unwrap(), Some(2));
        assert_eq!(reader.find_record_number("t.20").unwrap(), Some(20));
        assert_eq!(reader.find_record_number("t.1").unwrap(), Some(1));
    }

    #[test]
    fn test_missing_fid() {
        let dir = tempdir().unwrap();
        let files = ShpFiles::new(dir.path().join("t.shp")).unwrap();
        write_index(&files, &[("t.1", 1), ("t.2", 2)], 3);

        let mut reader = IndexedFidReader::open(&files).unwrap();
        assert_eq!(reader.find_record_number("t.9").unwrap(), None);
        assert_eq!(reader.find_record_number("t.2").unwrap(), Some(2));
    }

    #[test]
    fn test_fid_for_record() {
        let dir = tempdir().unwrap();
        let files = ShpFiles::new(dir.path().join("t.shp")).unwrap();
        // record 2 was removed and renumbered, so ids no longer line up
        write_index(&files, &[("t.1", 1), ("t.3", 2), ("t.7", 3)], 8);

        let mut reader = IndexedFidReader::open(&files).unwrap();
        assert_eq!(reader.fid_for_record(2).unwrap(), Some(FeatureId::from("t.3")));
        assert_eq!(reader.fid_for_record(3).unwrap(), Some(FeatureId::from("t.7")));
        assert_eq!(reader.fid_for_record(4).unwrap(), None);
    }

    #[test]
    fn test_out_of_order_entries() {
        let dir = tempdir().unwrap();
        let files = ShpFiles::new(dir.path().join("t.shp")).unwrap();
        write_index(&files, &[("a", 3), ("b", 1), ("c", 2)], 1);

        let mut reader = IndexedFidReader::open(&files).unwrap();
        assert_eq!(reader.fid_for_record(1).unwrap(), Some(FeatureId::from("b")));
        assert_eq!(reader.fid_for_record(3).unwrap(), Some(FeatureId::from("a")));
        assert_eq!(reader.entries().unwrap().len(), 3);
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let files = ShpFiles::new(dir.path().join("t.shp")).unwrap();
        write_index(&files, &[("t.1", 1), ("t.2", 2)], 3);
        let path = files.path(FileType::Fix);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        let err = IndexedFidReader::open(&files).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_missing_end_marker() {
        let dir = tempdir().unwrap();
        let files = ShpFiles::new(dir.path().join("t.shp")).unwrap();
        write_index(&files, &[("t.1", 1)], 2);
        let path = files.path(FileType::Fix);
        let mut bytes = fs::read(&path).unwrap();
        let trailer_start = bytes.len() - TRAILER_LEN as usize;
        bytes[trailer_start] = 0;
        fs::write(&path, &bytes).unwrap();

        let err = IndexedFidReader::open(&files).unwrap_err();
        assert_eq!(err.to_string(), "Corrupt fix file: missing end marker");
    }

    #[test]
    fn test_holds_read_lock() {
        let dir = tempdir().unwrap();
        let files = ShpFiles::new(dir.path().join("t.shp")).unwrap();
        write_index(&files, &[("t.1", 1)], 2);
        let reader = IndexedFidReader::open(&files).unwrap();
        assert!(files.try_acquire_write(FileType::Fix).is_none());
        drop(reader);
        assert!(files.try_acquire_write(FileType::Fix).is_some());
    }
}
