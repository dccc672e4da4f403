//! Copy-on-write feature writer.
//!
//! Every session writes a complete new `.shp`, `.shx`, `.dbf` and `.fix`
//! into temp files next to the originals. Existing features stream through
//! a full-scan reader and are copied, replaced or dropped; new features are
//! appended after them. `close` swaps the temp files in under write locks
//! and deletes the spatial index. A writer dropped without `close` leaves
//! the originals untouched.

use indexmap::IndexMap;

use crate::dbf::{DbfField, DbfReader, DbfWriter};
use crate::errors::{ShapefileError, ShapefileResult};
use crate::feature::Feature;
use crate::fid::FeatureId;
use crate::fid_index::{FidWriter, IndexedFidReader};
use crate::files::{FileType, ShpFiles, StorageFile};
use crate::geometry::Shape;
use crate::index_manager::IndexManager;
use crate::reader::{FeatureReader, Source};
use crate::schema::FeatureType;
use crate::shp::{ShpReader, ShpWriter};

/// How a writer treats the features already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Keep every existing feature; `next` only hands out new ones
    Append,
    /// Walk the existing features, each may be replaced or removed; nothing
    /// can be added
    Update,
    /// Walk the existing features, then hand out new ones
    Mixed,
}

struct PendingFeature {
    feature: Feature,
    existing: bool,
}

struct WriteSession {
    delegate: Option<FeatureReader>,
    shp_storage: StorageFile,
    shx_storage: StorageFile,
    dbf_storage: StorageFile,
    fix_storage: StorageFile,
    shp: ShpWriter,
    dbf: DbfWriter,
    fids: FidWriter,
    current: Option<PendingFeature>,
    written: u32,
}

pub struct FeatureWriter {
    files: ShpFiles,
    index_manager: IndexManager,
    schema: FeatureType,
    mode: WriteMode,
    session: Option<WriteSession>,
}

impl FeatureWriter {
    pub fn open(
        index_manager: IndexManager,
        schema: FeatureType,
        mode: WriteMode,
    ) -> ShapefileResult<FeatureWriter> {
        let files = index_manager.files().clone();
        index_manager.ensure_identity_index(index_manager.config().create_index());

        // read locks in file-type order
        let shp_reader = ShpReader::open(&files)?;
        let dbf_reader = if files.exists(FileType::Dbf) {
            Some(DbfReader::open(&files)?)
        } else {
            None
        };
        let (fid_reader, fix_next_id) = if index_manager.index_usable(FileType::Fix) {
            let reader = IndexedFidReader::open(&files)?;
            let next_id = reader.next_id();
            (Some(reader), next_id)
        } else {
            // a stale index still remembers the counter
            let next_id = IndexedFidReader::open(&files)
                .map(|reader| reader.next_id())
                .unwrap_or(1);
            (None, next_id)
        };
        let next_id = fix_next_id.max(shp_reader.header().next_id).max(1);
        let mut delegate = FeatureReader::new(schema.clone(), shp_reader, dbf_reader, Source::FullScan);
        if let Some(fid_reader) = fid_reader {
            delegate = delegate.with_fid_reader(fid_reader);
        }

        let shp_storage = files.storage_file(FileType::Shp)?;
        let shx_storage = files.storage_file(FileType::Shx)?;
        let dbf_storage = files.storage_file(FileType::Dbf)?;
        let fix_storage = files.storage_file(FileType::Fix)?;

        let shp = ShpWriter::new(
            shp_storage.reopen()?,
            shx_storage.reopen()?,
            schema.geometry_type(),
        )?;
        let fields: Vec<DbfField> = schema
            .row_attributes()
            .filter_map(DbfField::from_descriptor)
            .collect();
        let dbf = DbfWriter::new(dbf_storage.reopen()?, fields)?;

        let mut writer = FeatureWriter {
            files,
            index_manager,
            schema,
            mode,
            session: Some(WriteSession {
                delegate: Some(delegate),
                shp_storage,
                shx_storage,
                dbf_storage,
                fix_storage,
                shp,
                dbf,
                fids: FidWriter::new(next_id),
                current: None,
                written: 0,
            }),
        };

        if mode == WriteMode::Append {
            writer.copy_remaining()?;
        }
        log::debug!(
            "Opened {:?} writer on {}",
            mode,
            writer.files.type_name()
        );
        Ok(writer)
    }

    pub fn schema(&self) -> &FeatureType {
        &self.schema
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_none()
    }

    /// Identifier suffix the next new feature will receive.
    pub fn next_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.fids.next_id())
    }

    fn session_mut(&mut self) -> ShapefileResult<&mut WriteSession> {
        self.session
            .as_mut()
            .ok_or(ShapefileError::Closed("Feature writer"))
    }

    /// True if an existing feature is still to be visited. Always false in
    /// append mode.
    pub fn has_next(&mut self) -> ShapefileResult<bool> {
        if self.mode == WriteMode::Append {
            return Ok(false);
        }
        match self.session_mut()?.delegate.as_mut() {
            Some(delegate) => delegate.has_next(),
            None => Ok(false),
        }
    }

    /// Moves to the next feature: the next existing one while any remain
    /// (update and mixed modes), otherwise a new blank feature carrying a
    /// fresh identifier (append and mixed modes).
    ///
    /// An existing feature left without `write` or `remove` is kept as is;
    /// a new feature left without `write` is discarded.
    pub fn next(&mut self) -> ShapefileResult<&mut Feature> {
        self.flush_current()?;
        let mode = self.mode;
        let type_name = self.schema.type_name().to_string();
        let session = self.session_mut()?;

        let mut existing = None;
        if mode != WriteMode::Append {
            if let Some(delegate) = session.delegate.as_mut() {
                if delegate.has_next()? {
                    existing = Some(delegate.next_feature()?);
                } else {
                    session.delegate = None;
                }
            }
        }

        let pending = match existing {
            Some(feature) => PendingFeature {
                feature,
                existing: true,
            },
            None if mode == WriteMode::Update => return Err(ShapefileError::NoSuchElement),
            None => {
                let id = session.fids.next_id();
                session.fids.bump_next_id(id.saturating_add(1));
                PendingFeature {
                    feature: Feature::new(
                        FeatureId::synthesize(&type_name, id),
                        Shape::Null,
                        IndexMap::new(),
                    ),
                    existing: false,
                }
            }
        };
        Ok(&mut session.current.insert(pending).feature)
    }

    /// Stores the current feature with its current geometry and attributes.
    pub fn write(&mut self) -> ShapefileResult<()> {
        let type_name = self.schema.type_name().to_string();
        let session = self.session_mut()?;
        let pending = session.current.take().ok_or_else(|| {
            ShapefileError::InvalidOperation("No current feature to write".into())
        })?;
        session.append(&type_name, &pending.feature)
    }

    /// Drops the current feature from the store.
    pub fn remove(&mut self) -> ShapefileResult<()> {
        let session = self.session_mut()?;
        let pending = session.current.take().ok_or_else(|| {
            ShapefileError::InvalidOperation("No current feature to remove".into())
        })?;
        log::trace!("Removed feature {}", pending.feature.id());
        Ok(())
    }

    fn flush_current(&mut self) -> ShapefileResult<()> {
        let type_name = self.schema.type_name().to_string();
        let session = self.session_mut()?;
        match session.current.take() {
            Some(pending) if pending.existing => session.append(&type_name, &pending.feature),
            _ => Ok(()),
        }
    }

    fn copy_remaining(&mut self) -> ShapefileResult<()> {
        let type_name = self.schema.type_name().to_string();
        let session = self.session_mut()?;
        if let Some(mut delegate) = session.delegate.take() {
            while delegate.has_next()? {
                let feature = delegate.next_feature()?;
                session.append(&type_name, &feature)?;
            }
        }
        Ok(())
    }

    /// Commits the session: flushes the current feature, copies the
    /// untouched remainder, replaces the originals and deletes the spatial
    /// index.
    pub fn close(&mut self) -> ShapefileResult<()> {
        if self.session.is_none() {
            return Ok(());
        }
        self.flush_current()?;
        self.copy_remaining()?;

        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let WriteSession {
            shp_storage,
            shx_storage,
            dbf_storage,
            fix_storage,
            mut shp,
            dbf,
            fids,
            written,
            ..
        } = session;

        shp.set_next_id(fids.next_id());
        shp.finish()?;
        dbf.finish()?;
        let header = fids.finish(fix_storage.reopen()?)?;

        self.files
            .replace_originals(vec![shp_storage, shx_storage, dbf_storage, fix_storage])?;
        if let Err(e) = self.index_manager.invalidate_spatial_index() {
            log::warn!(
                "Could not delete spatial index of {}: {}",
                self.files.type_name(),
                e
            );
        }
        log::debug!(
            "Committed {} features to {}, next id {}",
            written,
            self.files.type_name(),
            header.next_id
        );
        Ok(())
    }
}

impl WriteSession {
    fn append(&mut self, type_name: &str, feature: &Feature) -> ShapefileResult<()> {
        let location = self.shp.write(feature.geometry())?;
        self.dbf.write_row(feature.attributes())?;
        self.fids.append(feature.id(), location.record_number)?;
        if let Some((prefix, n)) = feature.id().split() {
            if prefix == type_name {
                self.fids.bump_next_id(n.saturating_add(1));
            }
        }
        self.written += 1;
        Ok(())
    }
}

impl Drop for FeatureWriter {
    fn drop(&mut self) {
        if self.session.take().is_some() {
            log::warn!(
                "Feature writer on {} dropped without close, changes discarded",
                self.files.type_name()
            );
        }
    }
}

impl std::fmt::Debug for FeatureWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureWriter")
            .field("type_name", &self.schema.type_name())
            .field("mode", &self.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}
