//! Attribute (`.dbf`) file.
//!
//! Layout: a 20-byte prefix (magic, version, header length, row count, row
//! length), the bincode-encoded field descriptors, then fixed-width rows.
//! Each row starts with a flag byte followed by every field as
//! space-padded text. A blank field reads back as [`Value::Null`].

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::codec::{decode, encode, encode_padded};
use crate::errors::{ShapefileError, ShapefileResult};
use crate::files::{FileReadGuard, FileType, ShpFiles};
use crate::schema::{AttributeDescriptor, AttributeKind, Value};

const DBF_MAGIC: u32 = 0x4442_4646; // "DBFF"
const FORMAT_VERSION: u32 = 1;
const PREFIX_LEN: u64 = 20;

const ROW_LIVE: u8 = b' ';
const ROW_DELETED: u8 = b'*';

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct DbfPrefix {
    magic: u32,
    version: u32,
    header_len: u32,
    row_count: u32,
    row_len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Text,
    Integer,
    Float,
}

/// One fixed-width column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbfField {
    pub name: String,
    pub kind: FieldKind,
    pub length: u16,
}

impl DbfField {
    /// Column for a row attribute; `None` for the geometry attribute.
    pub fn from_descriptor(descriptor: &AttributeDescriptor) -> Option<DbfField> {
        let (kind, length) = match descriptor.kind {
            AttributeKind::Geometry(_) => return None,
            AttributeKind::Text { length } => (FieldKind::Text, length),
            AttributeKind::Integer { length } => (FieldKind::Integer, length),
            AttributeKind::Float { length } => (FieldKind::Float, length),
        };
        Some(DbfField {
            name: descriptor.name.clone(),
            kind,
            length,
        })
    }

    pub fn to_descriptor(&self) -> AttributeDescriptor {
        let length = self.length;
        let kind = match self.kind {
            FieldKind::Text => AttributeKind::Text { length },
            FieldKind::Integer => AttributeKind::Integer { length },
            FieldKind::Float => AttributeKind::Float { length },
        };
        AttributeDescriptor {
            name: self.name.clone(),
            kind,
        }
    }

    fn parse(&self, raw: &[u8]) -> ShapefileResult<Value> {
        let text = std::str::from_utf8(raw).map_err(|_| {
            ShapefileError::corrupt(FileType::Dbf, format!("field {} is not UTF-8", self.name))
        })?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Value::Null);
        }
        let bad_number =
            || ShapefileError::corrupt(FileType::Dbf, format!("bad number in field {}", self.name));
        match self.kind {
            FieldKind::Text => Ok(Value::Text(text.trim_end().to_string())),
            FieldKind::Integer => trimmed.parse().map(Value::Integer).map_err(|_| bad_number()),
            FieldKind::Float => trimmed.parse().map(Value::Float).map_err(|_| bad_number()),
        }
    }

    fn format_into(&self, value: &Value, out: &mut Vec<u8>) -> ShapefileResult<()> {
        let width = self.length as usize;
        let text = match (self.kind, value) {
            (_, Value::Null) => String::new(),
            (FieldKind::Text, v) => v.to_string(),
            (FieldKind::Integer, Value::Integer(i)) => format!("{:>width$}", i, width = width),
            (FieldKind::Float, Value::Float(_) | Value::Integer(_)) => {
                let f = value.as_f64().unwrap_or_default();
                format!("{:>width$}", f, width = width)
            }
            (kind, v) => {
                return Err(ShapefileError::Schema(format!(
                    "Value {:?} does not fit {:?} field {}",
                    v, kind, self.name
                )))
            }
        };
        if text.len() > width {
            return Err(ShapefileError::Schema(format!(
                "Value {} overflows field {} of width {}",
                text, self.name, width
            )));
        }
        out.extend_from_slice(text.as_bytes());
        out.resize(out.len() + width - text.len(), b' ');
        Ok(())
    }
}

fn row_len(fields: &[DbfField]) -> u32 {
    1 + fields.iter().map(|f| f.length as u32).sum::<u32>()
}

// ============================================================================
// Reader
// ============================================================================

/// Row cursor over a `.dbf` file. Holds the `.dbf` read lock for its lifetime.
#[derive(Debug)]
pub struct DbfReader {
    input: BufReader<File>,
    fields: Vec<DbfField>,
    header_len: u64,
    row_len: u64,
    row_count: u32,
    row: u32,
    stream_pos: u64,
    buf: Vec<u8>,
    _guard: FileReadGuard,
}

impl DbfReader {
    pub fn open(files: &ShpFiles) -> ShapefileResult<DbfReader> {
        let guard = files.acquire_read(FileType::Dbf);
        let file = files.open_read(FileType::Dbf)?;
        let file_len = file.metadata()?.len();
        if file_len < PREFIX_LEN {
            return Err(ShapefileError::corrupt(FileType::Dbf, "truncated header"));
        }

        let mut input = BufReader::new(file);
        let mut prefix_buf = [0u8; PREFIX_LEN as usize];
        input.read_exact(&mut prefix_buf)?;
        let prefix: DbfPrefix = decode(&prefix_buf)?;
        if prefix.magic != DBF_MAGIC || prefix.version != FORMAT_VERSION {
            return Err(ShapefileError::corrupt(FileType::Dbf, "bad magic"));
        }
        let header_len = prefix.header_len as u64;
        if header_len < PREFIX_LEN || header_len > file_len {
            return Err(ShapefileError::corrupt(FileType::Dbf, "bad header length"));
        }

        let mut field_buf = vec![0u8; (header_len - PREFIX_LEN) as usize];
        input.read_exact(&mut field_buf)?;
        let fields: Vec<DbfField> = decode(&field_buf)?;
        if row_len(&fields) != prefix.row_len {
            return Err(ShapefileError::corrupt(FileType::Dbf, "row length mismatch"));
        }
        let row_len = prefix.row_len as u64;
        if header_len + prefix.row_count as u64 * row_len > file_len {
            return Err(ShapefileError::corrupt(
                FileType::Dbf,
                "fewer rows than the header claims",
            ));
        }

        Ok(DbfReader {
            input,
            fields,
            header_len,
            row_len,
            row_count: prefix.row_count,
            row: 0,
            stream_pos: header_len,
            buf: vec![0u8; row_len as usize],
            _guard: guard,
        })
    }

    pub fn fields(&self) -> &[DbfField] {
        &self.fields
    }

    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    pub fn has_next(&self) -> bool {
        self.row < self.row_count
    }

    /// Advances past the next row without reading it.
    pub fn skip(&mut self) -> ShapefileResult<()> {
        if !self.has_next() {
            return Err(ShapefileError::NoSuchElement);
        }
        self.row += 1;
        Ok(())
    }

    pub fn read_row(&mut self) -> ShapefileResult<IndexMap<String, Value>> {
        if !self.has_next() {
            return Err(ShapefileError::NoSuchElement);
        }
        let pos = self.header_len + self.row as u64 * self.row_len;
        if pos != self.stream_pos {
            self.input.seek(SeekFrom::Start(pos))?;
        }
        self.input.read_exact(&mut self.buf)?;
        self.stream_pos = pos + self.row_len;
        self.row += 1;

        match self.buf[0] {
            ROW_LIVE | ROW_DELETED => {}
            other => {
                return Err(ShapefileError::corrupt(
                    FileType::Dbf,
                    format!("bad row flag {:#x} at row {}", other, self.row),
                ))
            }
        }

        let mut values = IndexMap::with_capacity(self.fields.len());
        let mut start = 1;
        for field in &self.fields {
            let end = start + field.length as usize;
            values.insert(field.name.clone(), field.parse(&self.buf[start..end])?);
            start = end;
        }
        Ok(values)
    }

    /// Positions the cursor so the next `read_row` returns the 1-based
    /// `record_number`.
    pub fn seek_to_row(&mut self, record_number: u32) -> ShapefileResult<()> {
        if record_number == 0 || record_number > self.row_count {
            return Err(ShapefileError::InvalidOperation(format!(
                "Row {} out of range 1..={}",
                record_number, self.row_count
            )));
        }
        self.row = record_number - 1;
        Ok(())
    }
}

// ============================================================================
// Writer
// ============================================================================

pub struct DbfWriter {
    out: BufWriter<File>,
    fields: Vec<DbfField>,
    header_len: u32,
    row_count: u32,
    row: Vec<u8>,
}

impl DbfWriter {
    pub fn new(file: File, fields: Vec<DbfField>) -> ShapefileResult<DbfWriter> {
        let field_bytes = encode(&fields)?;
        let header_len = PREFIX_LEN as u32 + field_bytes.len() as u32;
        let mut writer = DbfWriter {
            out: BufWriter::new(file),
            fields,
            header_len,
            row_count: 0,
            row: Vec::new(),
        };
        let prefix = writer.prefix();
        writer
            .out
            .write_all(&encode_padded(&prefix, PREFIX_LEN as usize)?)?;
        writer.out.write_all(&field_bytes)?;
        Ok(writer)
    }

    fn prefix(&self) -> DbfPrefix {
        DbfPrefix {
            magic: DBF_MAGIC,
            version: FORMAT_VERSION,
            header_len: self.header_len,
            row_count: self.row_count,
            row_len: row_len(&self.fields),
        }
    }

    pub fn fields(&self) -> &[DbfField] {
        &self.fields
    }

    /// Appends a row. Missing attributes are written blank.
    pub fn write_row(&mut self, values: &IndexMap<String, Value>) -> ShapefileResult<()> {
        self.row.clear();
        self.row.push(ROW_LIVE);
        for field in &self.fields {
            let value = values.get(&field.name).unwrap_or(&Value::Null);
            field.format_into(value, &mut self.row)?;
        }
        self.out.write_all(&self.row)?;
        self.row_count += 1;
        Ok(())
    }

    pub fn finish(self) -> ShapefileResult<()> {
        let prefix = self.prefix();
        let mut file = self.out.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&encode_padded(&prefix, PREFIX_LEN as usize)?)?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fields() -> Vec<DbfField> {
        vec![
            DbfField {
                name: "name".into(),
                kind: FieldKind::Text,
                length: 8,
            },
            DbfField {
                name: "lanes".into(),
                kind: FieldKind::Integer,
                length: 4,
            },
            DbfField {
                name: "speed".into(),
                kind: FieldKind::Float,
                length: 10,
            },
        ]
    }

    fn row(name: &str, lanes: i64, speed: f64) -> IndexMap<String, Value> {
        let mut values = IndexMap::new();
        values.insert("name".to_string(), Value::from(name));
        values.insert("lanes".to_string(), Value::from(lanes));
        values.insert("speed".to_string(), Value::from(speed));
        values
    }

    fn write_rows(files: &ShpFiles, rows: &[IndexMap<String, Value>]) {
        let file = File::create(files.path(FileType::Dbf)).unwrap();
        let mut writer = DbfWriter::new(file, fields()).unwrap();
        for r in rows {
            writer.write_row(r).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_prefix_size() {
        let prefix = DbfPrefix {
            magic: DBF_MAGIC,
            version: 1,
            header_len: 0,
            row_count: 0,
            row_len: 0,
        };
        assert_eq!(encode(&prefix).unwrap().len(), PREFIX_LEN as usize);
    }

    #[test]
    fn test_write_and_read_rows() {
        let dir = tempdir().unwrap();
        let files = ShpFiles::new(dir.path().join("roads.shp")).unwrap();
        write_rows(&files, &[row("main", 2, 50.5), row("high", 4, 120.0)]);

        let mut reader = DbfReader::open(&files).unwrap();
        assert_eq!(reader.fields(), fields().as_slice());
        assert_eq!(reader.row_count(), 2);
        assert_eq!(reader.read_row().unwrap(), row("main", 2, 50.5));
        assert_eq!(reader.read_row().unwrap(), row("high", 4, 120.0));
        assert!(!reader.has_next());
        assert!(matches!(reader.read_row(), Err(ShapefileError::NoSuchElement)));
    }

    #[test]
    fn test_skip_and_seek() {
        let dir = tempdir().unwrap();
        let files = ShpFiles::new(dir.path().join("roads.shp")).unwrap();
        let rows: Vec<_> = (0..10).map(|i| row(&format!("r{}", i), i, i as f64)).collect();
        write_rows(&files, &rows);

        let mut reader = DbfReader::open(&files).unwrap();
        reader.skip().unwrap();
        reader.skip().unwrap();
        assert_eq!(reader.read_row().unwrap(), rows[2]);

        reader.seek_to_row(8).unwrap();
        assert_eq!(reader.read_row().unwrap(), rows[7]);
        reader.seek_to_row(1).unwrap();
        assert_eq!(reader.read_row().unwrap(), rows[0]);
        assert!(reader.seek_to_row(11).is_err());
    }

    #[test]
    fn test_missing_values_read_as_null() {
        let dir = tempdir().unwrap();
        let files = ShpFiles::new(dir.path().join("roads.shp")).unwrap();
        let mut partial = IndexMap::new();
        partial.insert("name".to_string(), Value::from("x"));
        write_rows(&files, &[partial]);

        let mut reader = DbfReader::open(&files).unwrap();
        let values = reader.read_row().unwrap();
        assert_eq!(values.get("name"), Some(&Value::from("x")));
        assert_eq!(values.get("lanes"), Some(&Value::Null));
        assert_eq!(values.get("speed"), Some(&Value::Null));
    }

    #[test]
    fn test_text_overflow_is_rejected() {
        let dir = tempdir().unwrap();
        let file = File::create(dir.path().join("x.dbf")).unwrap();
        let mut writer = DbfWriter::new(file, fields()).unwrap();
        let err = writer
            .write_row(&row("a very long street name", 1, 1.0))
            .unwrap_err();
        assert!(matches!(err, ShapefileError::Schema(_)));
        // multi-byte text is measured in bytes
        assert!(writer.write_row(&row("ééééé", 1, 1.0)).is_err());
        writer.write_row(&row("éééé", 1, 1.0)).unwrap();
    }

    #[test]
    fn test_number_overflow_is_rejected() {
        let dir = tempdir().unwrap();
        let file = File::create(dir.path().join("x.dbf")).unwrap();
        let mut writer = DbfWriter::new(file, fields()).unwrap();
        let err = writer.write_row(&row("a", 123_456, 1.0)).unwrap_err();
        assert!(matches!(err, ShapefileError::Schema(_)));
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let file = File::create(dir.path().join("x.dbf")).unwrap();
        let mut writer = DbfWriter::new(file, fields()).unwrap();
        let mut values = IndexMap::new();
        values.insert("lanes".to_string(), Value::from("two"));
        assert!(writer.write_row(&values).is_err());
    }

    #[test]
    fn test_truncated_rows_detected() {
        let dir = tempdir().unwrap();
        let files = ShpFiles::new(dir.path().join("roads.shp")).unwrap();
        write_rows(&files, &[row("a", 1, 1.0), row("b", 2, 2.0)]);
        let path = files.path(FileType::Dbf);
        let len = std::fs::metadata(&path).unwrap().len();
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 3).unwrap();
        drop(f);

        let err = DbfReader::open(&files).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_descriptor_mapping() {
        let field = &fields()[1];
        let descriptor = field.to_descriptor();
        assert_eq!(DbfField::from_descriptor(&descriptor).as_ref(), Some(field));
    }
}
