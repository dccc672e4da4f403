//! Geometry (`.shp`) and offset (`.shx`) files.
//!
//! `.shp` layout: a 64-byte header followed by records. Each record is a
//! fixed 40-byte header (record number, payload length, envelope) and a
//! bincode-encoded [`Shape`] payload. Because the envelope sits in the record
//! header, a reader can reject a record without decoding its geometry.
//!
//! `.shx` layout: a 16-byte header followed by one 12-byte
//! `(offset, length)` entry per record, giving random access by record number.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use serde::{Deserialize, Serialize};

use crate::codec::{decode, encode, encode_padded};
use crate::envelope::Envelope;
use crate::errors::{ShapefileError, ShapefileResult};
use crate::fid::RecordLocation;
use crate::files::{FileReadGuard, FileType, ShpFiles};
use crate::geometry::{Shape, ShapeType};

const SHP_MAGIC: u32 = 0x5348_5046; // "SHPF"
const SHX_MAGIC: u32 = 0x5348_5846; // "SHXF"
const FORMAT_VERSION: u32 = 1;

pub const SHP_HEADER_LEN: u64 = 64;
pub const RECORD_HEADER_LEN: u64 = 40;
const SHX_HEADER_LEN: u64 = 16;
const SHX_ENTRY_LEN: u64 = 12;

/// Forward skips shorter than this reuse the read buffer.
const RELATIVE_SEEK_LIMIT: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShpHeader {
    magic: u32,
    version: u32,
    pub shape_type: ShapeType,
    pub record_count: u32,
    pub bounds: Envelope,
    /// Lowest synthesized id number never handed out for this set.
    pub next_id: u64,
}

impl ShpHeader {
    fn new(shape_type: ShapeType) -> Self {
        Self {
            magic: SHP_MAGIC,
            version: FORMAT_VERSION,
            shape_type,
            record_count: 0,
            bounds: Envelope::null(),
            next_id: 1,
        }
    }

    fn validate(&self) -> ShapefileResult<()> {
        if self.magic != SHP_MAGIC {
            return Err(ShapefileError::corrupt(FileType::Shp, "bad magic"));
        }
        if self.version != FORMAT_VERSION {
            return Err(ShapefileError::corrupt(
                FileType::Shp,
                format!("unsupported version {}", self.version),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RecordHeader {
    number: u32,
    length: u32,
    envelope: Envelope,
}

/// Header of one geometry record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record {
    /// 1-based record number
    pub number: u32,
    /// Offset of the record header
    pub offset: u64,
    /// Payload length in bytes
    pub length: u32,
    pub envelope: Envelope,
}

impl Record {
    pub fn location(&self) -> RecordLocation {
        RecordLocation::new(self.number, self.offset)
    }

    fn payload_offset(&self) -> u64 {
        self.offset + RECORD_HEADER_LEN
    }

    fn end(&self) -> u64 {
        self.payload_offset() + self.length as u64
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Sequential cursor over `.shp` records. Holds the `.shp` read lock for its
/// whole lifetime.
pub struct ShpReader {
    input: BufReader<File>,
    header: ShpHeader,
    file_len: u64,
    stream_pos: u64,
    next_offset: u64,
    current: Option<Record>,
    _guard: FileReadGuard,
}

impl ShpReader {
    pub fn open(files: &ShpFiles) -> ShapefileResult<ShpReader> {
        let guard = files.acquire_read(FileType::Shp);
        let file = files.open_read(FileType::Shp)?;
        let file_len = file.metadata()?.len();
        if file_len < SHP_HEADER_LEN {
            return Err(ShapefileError::corrupt(FileType::Shp, "truncated header"));
        }

        let mut input = BufReader::new(file);
        let mut buf = [0u8; SHP_HEADER_LEN as usize];
        input.read_exact(&mut buf)?;
        let header: ShpHeader = decode(&buf)?;
        header.validate()?;

        Ok(ShpReader {
            input,
            header,
            file_len,
            stream_pos: SHP_HEADER_LEN,
            next_offset: SHP_HEADER_LEN,
            current: None,
            _guard: guard,
        })
    }

    pub fn header(&self) -> &ShpHeader {
        &self.header
    }

    pub fn has_next(&self) -> bool {
        self.next_offset + RECORD_HEADER_LEN <= self.file_len
    }

    /// Reads the next record header without touching its payload.
    pub fn next_header(&mut self) -> ShapefileResult<Record> {
        if !self.has_next() {
            return Err(ShapefileError::NoSuchElement);
        }
        let offset = self.next_offset;
        self.seek_to(offset)?;

        let mut buf = [0u8; RECORD_HEADER_LEN as usize];
        self.read_exact(&mut buf)?;
        let rh: RecordHeader = decode(&buf)?;
        let record = Record {
            number: rh.number,
            offset,
            length: rh.length,
            envelope: rh.envelope,
        };
        if record.end() > self.file_len {
            return Err(ShapefileError::corrupt(
                FileType::Shp,
                format!("record {} runs past end of file", record.number),
            ));
        }

        self.next_offset = record.end();
        self.current = Some(record);
        Ok(record)
    }

    /// Decodes the geometry of the record last returned by `next_header`.
    pub fn read_shape(&mut self) -> ShapefileResult<Shape> {
        let record = self.current.ok_or_else(|| {
            ShapefileError::InvalidOperation("No current record to read".into())
        })?;
        self.seek_to(record.payload_offset())?;
        let mut buf = vec![0u8; record.length as usize];
        self.read_exact(&mut buf)?;
        decode(&buf)
    }

    /// Decodes the current geometry generalized to `distance`.
    pub fn read_simplified(&mut self, distance: f64) -> ShapefileResult<Shape> {
        Ok(self.read_shape()?.generalized(distance))
    }

    /// Positions the cursor so the next `next_header` reads the record at `offset`.
    pub fn goto(&mut self, offset: u64) -> ShapefileResult<()> {
        if offset < SHP_HEADER_LEN || offset > self.file_len {
            return Err(ShapefileError::InvalidOperation(format!(
                "Offset {} outside geometry file",
                offset
            )));
        }
        self.next_offset = offset;
        self.current = None;
        Ok(())
    }

    fn seek_to(&mut self, pos: u64) -> ShapefileResult<()> {
        if pos == self.stream_pos {
            return Ok(());
        }
        if pos > self.stream_pos && pos - self.stream_pos < RELATIVE_SEEK_LIMIT {
            self.input.seek_relative((pos - self.stream_pos) as i64)?;
        } else {
            self.input.seek(SeekFrom::Start(pos))?;
        }
        self.stream_pos = pos;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> ShapefileResult<()> {
        self.input.read_exact(buf)?;
        self.stream_pos += buf.len() as u64;
        Ok(())
    }
}

impl std::fmt::Debug for ShpReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShpReader")
            .field("header", &self.header)
            .field("next_offset", &self.next_offset)
            .finish()
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Appends records to a `.shp`/`.shx` pair. Headers are rewritten by `finish`.
pub struct ShpWriter {
    shp: BufWriter<File>,
    shx: BufWriter<File>,
    header: ShpHeader,
    offset: u64,
}

impl ShpWriter {
    pub fn new(shp: File, shx: File, shape_type: ShapeType) -> ShapefileResult<ShpWriter> {
        let header = ShpHeader::new(shape_type);
        let mut shp = BufWriter::new(shp);
        let mut shx = BufWriter::new(shx);
        shp.write_all(&encode_padded(&header, SHP_HEADER_LEN as usize)?)?;
        shx.write_all(&encode_padded(&ShxHeader::new(0), SHX_HEADER_LEN as usize)?)?;
        Ok(ShpWriter {
            shp,
            shx,
            header,
            offset: SHP_HEADER_LEN,
        })
    }

    pub fn record_count(&self) -> u32 {
        self.header.record_count
    }

    pub fn bounds(&self) -> Envelope {
        self.header.bounds
    }

    /// Records the id counter written into the header by `finish`.
    pub fn set_next_id(&mut self, next_id: u64) {
        self.header.next_id = next_id.max(1);
    }

    /// Appends `shape` as the next record and returns where it landed.
    pub fn write(&mut self, shape: &Shape) -> ShapefileResult<RecordLocation> {
        let declared = self.header.shape_type;
        if !shape.is_null() && declared != ShapeType::Null && shape.shape_type() != declared {
            return Err(ShapefileError::Schema(format!(
                "Cannot write {:?} into a {:?} file",
                shape.shape_type(),
                declared
            )));
        }

        let payload = encode(shape)?;
        let envelope = shape.envelope();
        let number = self.header.record_count + 1;
        let rh = RecordHeader {
            number,
            length: payload.len() as u32,
            envelope,
        };
        let rh_bytes = encode_padded(&rh, RECORD_HEADER_LEN as usize)?;

        let location = RecordLocation::new(number, self.offset);
        self.shp.write_all(&rh_bytes)?;
        self.shp.write_all(&payload)?;
        self.shx.write_all(&encode_padded(
            &ShxEntry {
                offset: self.offset,
                length: payload.len() as u32,
            },
            SHX_ENTRY_LEN as usize,
        )?)?;

        self.offset += RECORD_HEADER_LEN + payload.len() as u64;
        self.header.record_count = number;
        self.header.bounds.expand_to_include_envelope(&envelope);
        Ok(location)
    }

    /// Flushes both files and rewrites their headers.
    pub fn finish(self) -> ShapefileResult<()> {
        let mut shp = self.shp.into_inner().map_err(|e| e.into_error())?;
        shp.seek(SeekFrom::Start(0))?;
        shp.write_all(&encode_padded(&self.header, SHP_HEADER_LEN as usize)?)?;
        shp.sync_all()?;

        let mut shx = self.shx.into_inner().map_err(|e| e.into_error())?;
        shx.seek(SeekFrom::Start(0))?;
        let shx_header = ShxHeader::new(self.header.record_count as u64);
        shx.write_all(&encode_padded(&shx_header, SHX_HEADER_LEN as usize)?)?;
        shx.sync_all()?;
        Ok(())
    }
}

// ============================================================================
// Offset file
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ShxHeader {
    magic: u32,
    version: u32,
    record_count: u64,
}

impl ShxHeader {
    fn new(record_count: u64) -> Self {
        Self {
            magic: SHX_MAGIC,
            version: FORMAT_VERSION,
            record_count,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ShxEntry {
    offset: u64,
    length: u32,
}

/// Random access from record number to byte offset.
pub struct ShxReader {
    file: File,
    record_count: u64,
    _guard: FileReadGuard,
}

impl ShxReader {
    pub fn open(files: &ShpFiles) -> ShapefileResult<ShxReader> {
        let guard = files.acquire_read(FileType::Shx);
        let mut file = files.open_read(FileType::Shx)?;
        let file_len = file.metadata()?.len();
        if file_len < SHX_HEADER_LEN {
            return Err(ShapefileError::corrupt(FileType::Shx, "truncated header"));
        }

        let mut buf = [0u8; SHX_HEADER_LEN as usize];
        file.read_exact(&mut buf)?;
        let header: ShxHeader = decode(&buf)?;
        if header.magic != SHX_MAGIC || header.version != FORMAT_VERSION {
            return Err(ShapefileError::corrupt(FileType::Shx, "bad magic"));
        }
        if SHX_HEADER_LEN + header.record_count * SHX_ENTRY_LEN > file_len {
            return Err(ShapefileError::corrupt(
                FileType::Shx,
                "fewer entries than the header claims",
            ));
        }

        Ok(ShxReader {
            file,
            record_count: header.record_count,
            _guard: guard,
        })
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Byte offset of the 1-based `record_number` in the geometry file.
    pub fn offset_of(&mut self, record_number: u32) -> ShapefileResult<u64> {
        if record_number == 0 || record_number as u64 > self.record_count {
            return Err(ShapefileError::InvalidOperation(format!(
                "Record {} out of range 1..={}",
                record_number, self.record_count
            )));
        }
        let pos = SHX_HEADER_LEN + (record_number as u64 - 1) * SHX_ENTRY_LEN;
        self.file.seek(SeekFrom::Start(pos))?;
        let mut buf = [0u8; SHX_ENTRY_LEN as usize];
        self.file.read_exact(&mut buf)?;
        let entry: ShxEntry = decode(&buf)?;
        Ok(entry.offset)
    }
}

/// Writes an empty `.shp`/`.shx` pair declaring `shape_type`.
pub(crate) fn write_empty(shp: File, shx: File, shape_type: ShapeType) -> ShapefileResult<()> {
    ShpWriter::new(shp, shx, shape_type)?.finish()
}
