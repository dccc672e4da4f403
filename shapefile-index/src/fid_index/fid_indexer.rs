use super::fix_reader::IndexedFidReader;
use super::fix_types::FixHeader;
use super::fix_writer::FidWriter;
use crate::dbf::DbfReader;
use crate::errors::{ShapefileError, ShapefileResult};
use crate::fid::FeatureId;
use crate::files::{FileType, ShpFiles};
use crate::schema::Value;
use crate::shp::ShpReader;

/// Rebuilds the identity index of a shapefile set from its current contents.
pub struct FidIndexer;

impl FidIndexer {
    /// Regenerates the `.fix` of `files`.
    ///
    /// Identifiers come from `fid_column` when given and non-blank, otherwise
    /// they are synthesized as `<type>.<record number>`. The persisted
    /// next-id counter never decreases: it is the larger of the previous
    /// counter (when the old index is still readable), the counter kept in
    /// the `.shp` header and one past the highest numeric suffix carrying the
    /// type prefix.
    pub fn generate(files: &ShpFiles, fid_column: Option<&str>) -> ShapefileResult<FixHeader> {
        let previous_next_id = match IndexedFidReader::open(files) {
            Ok(reader) => reader.next_id(),
            Err(_) => 1,
        };
        let recorded_next_id = ShpReader::open(files)?.header().next_id;

        let ids = collect_ids(files, fid_column)?;

        let type_name = files.type_name();
        let mut writer = FidWriter::new(previous_next_id.max(recorded_next_id).max(1));
        for (fid, record_number) in &ids {
            if let Some((prefix, n)) = fid.split() {
                if prefix == type_name {
                    writer.bump_next_id(n.saturating_add(1));
                }
            }
            writer.append(fid, *record_number)?;
        }

        let _guard = files.try_acquire_write(FileType::Fix).ok_or_else(|| {
            ShapefileError::InvalidOperation(format!(
                "Identity index of {} is in use",
                type_name
            ))
        })?;
        let storage = files.storage_file(FileType::Fix)?;
        let header = writer.finish(storage.reopen()?)?;
        files.persist_all(vec![storage])?;
        log::debug!(
            "Built identity index for {} with {} entries, next id {}",
            type_name,
            header.entry_count,
            header.next_id
        );
        Ok(header)
    }
}

/// Reads `(identifier, record number)` for every record, in file order.
fn collect_ids(
    files: &ShpFiles,
    fid_column: Option<&str>,
) -> ShapefileResult<Vec<(FeatureId, u32)>> {
    let type_name = files.type_name();
    let mut shp = ShpReader::open(files)?;
    let mut dbf = match fid_column {
        Some(column) => {
            let dbf = DbfReader::open(files)?;
            if !dbf.fields().iter().any(|f| f.name == column) {
                return Err(ShapefileError::Schema(format!(
                    "No attribute named {} in {}",
                    column, type_name
                )));
            }
            Some((dbf, column))
        }
        None => None,
    };

    let mut ids = Vec::with_capacity(shp.header().record_count as usize);
    while shp.has_next() {
        let record = shp.next_header()?;
        let fid = match dbf.as_mut() {
            Some((dbf, column)) => {
                let mut row = dbf.read_row()?;
                match row.swap_remove(*column) {
                    Some(Value::Null) | None => {
                        FeatureId::synthesize(type_name, record.number as u64)
                    }
                    Some(Value::Text(s)) => FeatureId::new(s),
                    Some(other) => FeatureId::new(other.to_string()),
                }
            }
            None => FeatureId::synthesize(type_name, record.number as u64),
        };
        ids.push((fid, record.number));
    }
    Ok(ids)
}
