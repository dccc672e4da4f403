//! Store facade over one shapefile set.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::config::ShapefileConfig;
use crate::dbf::{DbfField, DbfReader, DbfWriter};
use crate::envelope::Envelope;
use crate::errors::{ShapefileError, ShapefileResult};
use crate::fid::FeatureId;
use crate::fid_index::{FidWriter, IndexedFidReader};
use crate::files::{FileType, ShpFiles};
use crate::geometry::ShapeType;
use crate::index_manager::IndexManager;
use crate::iterators::CandidateIterator;
use crate::reader::{FeatureReader, Source};
use crate::schema::{AttributeDescriptor, AttributeKind, FeatureType};
use crate::screen_map::ScreenMap;
use crate::shp::{self, ShpReader};
use crate::writer::{FeatureWriter, WriteMode};

/// Which features a query selects.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    /// Features whose envelope intersects the window
    Bbox(Envelope),
    /// Features carrying one of the identifiers
    Ids(HashSet<FeatureId>),
    /// Nothing
    Exclude,
}

/// A read request: a filter plus per-query rendering hints.
#[derive(Debug, Clone)]
pub struct Query {
    pub filter: Filter,
    pub include_attributes: bool,
    pub simplification_distance: Option<f64>,
    pub screen_map: Option<ScreenMap>,
}

impl Query {
    pub fn new(filter: Filter) -> Query {
        Query {
            filter,
            include_attributes: true,
            simplification_distance: None,
            screen_map: None,
        }
    }

    pub fn all() -> Query {
        Query::new(Filter::All)
    }

    pub fn bbox(bbox: Envelope) -> Query {
        Query::new(Filter::Bbox(bbox))
    }

    pub fn ids<I, T>(ids: I) -> Query
    where
        I: IntoIterator<Item = T>,
        T: Into<FeatureId>,
    {
        Query::new(Filter::Ids(ids.into_iter().map(Into::into).collect()))
    }

    pub fn exclude() -> Query {
        Query::new(Filter::Exclude)
    }

    /// Skips the attribute file entirely.
    pub fn without_attributes(mut self) -> Self {
        self.include_attributes = false;
        self
    }

    pub fn with_simplification(mut self, distance: f64) -> Self {
        self.simplification_distance = Some(distance);
        self
    }

    pub fn with_screen_map(mut self, screen_map: ScreenMap) -> Self {
        self.screen_map = Some(screen_map);
        self
    }
}

impl Default for Query {
    fn default() -> Self {
        Query::all()
    }
}

/// Entry point for reading, writing and indexing one shapefile set.
///
/// Cloning is cheap; clones share the index manager and its cached tree.
#[derive(Clone)]
pub struct ShapefileStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    files: ShpFiles,
    config: ShapefileConfig,
    index_manager: IndexManager,
}

impl ShapefileStore {
    /// Opens the set `path` belongs to. The files need not exist yet; see
    /// [`create_schema`](Self::create_schema).
    pub fn open(path: impl AsRef<Path>, config: ShapefileConfig) -> ShapefileResult<ShapefileStore> {
        Self::with_files(ShpFiles::new(path)?, config)
    }

    /// Opens a set that must not be modified. Existing indexes are used but
    /// never built.
    pub fn open_remote(
        path: impl AsRef<Path>,
        config: ShapefileConfig,
    ) -> ShapefileResult<ShapefileStore> {
        Self::with_files(ShpFiles::remote(path)?, config)
    }

    fn with_files(files: ShpFiles, config: ShapefileConfig) -> ShapefileResult<ShapefileStore> {
        log::debug!("Opening shapefile store {} with {:?}", files.type_name(), config);
        let index_manager = IndexManager::new(files.clone(), config.clone());
        Ok(ShapefileStore {
            inner: Arc::new(StoreInner {
                files,
                config,
                index_manager,
            }),
        })
    }

    pub fn files(&self) -> &ShpFiles {
        &self.inner.files
    }

    pub fn config(&self) -> &ShapefileConfig {
        &self.inner.config
    }

    pub fn index_manager(&self) -> &IndexManager {
        &self.inner.index_manager
    }

    pub fn type_name(&self) -> &str {
        self.inner.files.type_name()
    }

    /// Replaces the set with an empty one described by `schema`. The type
    /// name always comes from the file name.
    pub fn create_schema(&self, schema: &FeatureType) -> ShapefileResult<()> {
        schema.validate()?;
        let files = &self.inner.files;
        if !files.is_local() {
            return Err(ShapefileError::InvalidOperation(format!(
                "Cannot create {} on a read-only set",
                files.type_name()
            )));
        }

        let shp_storage = files.storage_file(FileType::Shp)?;
        let shx_storage = files.storage_file(FileType::Shx)?;
        shp::write_empty(
            shp_storage.reopen()?,
            shx_storage.reopen()?,
            schema.geometry_type(),
        )?;

        let dbf_storage = files.storage_file(FileType::Dbf)?;
        let fields: Vec<DbfField> = schema
            .row_attributes()
            .filter_map(DbfField::from_descriptor)
            .collect();
        DbfWriter::new(dbf_storage.reopen()?, fields)?.finish()?;

        let fix_storage = files.storage_file(FileType::Fix)?;
        FidWriter::new(1).finish(fix_storage.reopen()?)?;

        let mut storage = vec![shp_storage, shx_storage, dbf_storage, fix_storage];
        match schema.crs() {
            Some(crs) => {
                let mut prj_storage = files.storage_file(FileType::Prj)?;
                prj_storage.file_mut().write_all(crs.as_bytes())?;
                storage.push(prj_storage);
            }
            None => {
                files.delete(FileType::Prj)?;
            }
        }

        files.replace_originals(storage)?;
        self.inner.index_manager.invalidate_spatial_index()?;
        log::debug!("Created schema {}", files.type_name());
        Ok(())
    }

    /// Reads the schema back from the geometry, attribute and projection
    /// files.
    pub fn schema(&self) -> ShapefileResult<FeatureType> {
        let files = &self.inner.files;
        let shape_type: ShapeType = ShpReader::open(files)?.header().shape_type;

        let mut attributes = vec![AttributeDescriptor {
            name: "the_geom".to_string(),
            kind: AttributeKind::Geometry(shape_type),
        }];
        if files.exists(FileType::Dbf) {
            let dbf = DbfReader::open(files)?;
            attributes.extend(dbf.fields().iter().map(DbfField::to_descriptor));
        }

        let crs = if files.exists(FileType::Prj) {
            Some(fs::read_to_string(files.path(FileType::Prj))?.trim().to_string())
        } else {
            None
        };
        Ok(FeatureType::from_parts(files.type_name(), attributes, crs))
    }

    /// Streams the features selected by `query`, through an index whenever
    /// one narrows the scan.
    pub fn reader(&self, query: &Query) -> ShapefileResult<FeatureReader> {
        let files = &self.inner.files;
        let manager = &self.inner.index_manager;
        let schema = self.schema()?;

        let mut id_filter = None;
        let source = match &query.filter {
            Filter::All => Source::FullScan,
            Filter::Exclude => Source::Indexed(CandidateIterator::from_locations(Vec::new())),
            Filter::Bbox(bbox) => match manager.query_by_bounds(bbox) {
                Some(candidates) => Source::Indexed(candidates),
                None => Source::FullScan,
            },
            Filter::Ids(ids) => match manager.query_by_identifiers(ids)? {
                Some(locations) => Source::Indexed(CandidateIterator::from_locations(locations)),
                None => {
                    id_filter = Some(ids.clone());
                    Source::FullScan
                }
            },
        };

        let shp = ShpReader::open(files)?;
        let dbf = if query.include_attributes
            && schema.has_row_attributes()
            && files.exists(FileType::Dbf)
        {
            Some(DbfReader::open(files)?)
        } else {
            None
        };
        let fids = if manager.index_usable(FileType::Fix) {
            IndexedFidReader::open(files).ok()
        } else {
            None
        };

        let mut reader = FeatureReader::new(schema, shp, dbf, source);
        if let Filter::Bbox(bbox) = &query.filter {
            reader = reader.with_bbox(*bbox);
        }
        if let Some(distance) = query.simplification_distance {
            reader = reader.with_simplification(distance, query.screen_map.clone());
        }
        if let Some(fids) = fids {
            reader = reader.with_fid_reader(fids);
        }
        if let Some(ids) = id_filter {
            reader = reader.with_id_filter(ids);
        }
        Ok(reader)
    }

    /// Opens a copy-on-write writer. Close every reader of this set on the
    /// current thread before closing the writer.
    pub fn writer(&self, mode: WriteMode) -> ShapefileResult<FeatureWriter> {
        FeatureWriter::open(self.inner.index_manager.clone(), self.schema()?, mode)
    }

    /// Number of features `query` selects. Unfiltered counts come straight
    /// from the geometry header.
    pub fn count(&self, query: &Query) -> ShapefileResult<usize> {
        if query.filter == Filter::All && query.simplification_distance.is_none() {
            return Ok(ShpReader::open(&self.inner.files)?.header().record_count as usize);
        }
        let query = query.clone().without_attributes();
        let mut count = 0;
        for feature in self.reader(&query)? {
            feature?;
            count += 1;
        }
        Ok(count)
    }

    /// Union of every feature envelope.
    pub fn bounds(&self) -> ShapefileResult<Envelope> {
        Ok(ShpReader::open(&self.inner.files)?.header().bounds)
    }

    /// Drops in-memory index state. Files are left as they are.
    pub fn dispose(&self) {
        self.inner.index_manager.dispose();
    }
}

impl std::fmt::Debug for ShapefileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShapefileStore")
            .field("files", &self.inner.files)
            .field("index_manager", &self.inner.index_manager)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Shape;
    use crate::schema::Value;
    use tempfile::tempdir;

    fn roads() -> FeatureType {
        FeatureType::new("ignored", ShapeType::LineString)
            .with_text("name", 16)
            .with_integer("lanes", 2)
            .with_crs("EPSG:4326")
    }

    fn populate(store: &ShapefileStore, n: usize) {
        let mut writer = store.writer(WriteMode::Append).unwrap();
        for i in 0..n {
            let feature = writer.next().unwrap();
            let x = i as f64;
            feature.set_geometry(Shape::line(&[(x, 0.0), (x + 0.5, 1.0)]));
            feature.set_attribute("name", format!("road {}", i));
            feature.set_attribute("lanes", (i % 4) as i64);
            writer.write().unwrap();
        }
        writer.close().unwrap();
    }

    #[test]
    fn test_create_schema_round_trip() {
        let dir = tempdir().unwrap();
        let store = ShapefileStore::open(dir.path().join("roads.shp"), ShapefileConfig::new()).unwrap();
        store.create_schema(&roads()).unwrap();

        let schema = store.schema().unwrap();
        assert_eq!(schema.type_name(), "roads");
        assert_eq!(schema.geometry_type(), ShapeType::LineString);
        assert_eq!(schema.attributes().len(), 3);
        assert_eq!(schema.crs(), Some("EPSG:4326"));
        assert_eq!(store.count(&Query::all()).unwrap(), 0);
        assert!(store.bounds().unwrap().is_null());
        assert!(store.files().exists(FileType::Fix));
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let store = ShapefileStore::open(dir.path().join("roads.shp"), ShapefileConfig::new()).unwrap();
        store.create_schema(&roads()).unwrap();
        populate(&store, 5);

        let features: Vec<_> = store
            .reader(&Query::all())
            .unwrap()
            .map(|f| f.unwrap())
            .collect();
        assert_eq!(features.len(), 5);
        assert_eq!(features[0].id().as_str(), "roads.1");
        assert_eq!(features[4].id().as_str(), "roads.5");
        assert_eq!(features[2].attribute("name"), Some(&Value::from("road 2")));
        assert_eq!(store.bounds().unwrap(), Envelope::new(0.0, 0.0, 4.5, 1.0));
    }

    #[test]
    fn test_bbox_query() {
        let dir = tempdir().unwrap();
        let store = ShapefileStore::open(dir.path().join("roads.shp"), ShapefileConfig::new()).unwrap();
        store.create_schema(&roads()).unwrap();
        populate(&store, 20);

        let query = Query::bbox(Envelope::new(3.2, 0.2, 6.1, 0.4));
        let reader = store.reader(&query).unwrap();
        assert!(reader.is_indexed());
        let mut ids: Vec<String> = reader.map(|f| f.unwrap().id().to_string()).collect();
        ids.sort();
        // lines starting at x = 3, 4, 5, 6
        assert_eq!(ids, vec!["roads.4", "roads.5", "roads.6", "roads.7"]);
        assert_eq!(store.count(&query).unwrap(), 4);
    }

    #[test]
    fn test_id_query_and_exclude() {
        let dir = tempdir().unwrap();
        let store = ShapefileStore::open(dir.path().join("roads.shp"), ShapefileConfig::new()).unwrap();
        store.create_schema(&roads()).unwrap();
        populate(&store, 10);

        let reader = store
            .reader(&Query::ids(["roads.9", "roads.2", "roads.77"]))
            .unwrap();
        let ids: Vec<String> = reader.map(|f| f.unwrap().id().to_string()).collect();
        assert_eq!(ids, vec!["roads.2", "roads.9"]);

        assert_eq!(store.count(&Query::exclude()).unwrap(), 0);
    }

    #[test]
    fn test_update_and_remove() {
        let dir = tempdir().unwrap();
        let store = ShapefileStore::open(dir.path().join("roads.shp"), ShapefileConfig::new()).unwrap();
        store.create_schema(&roads()).unwrap();
        populate(&store, 4);

        let mut writer = store.writer(WriteMode::Update).unwrap();
        while writer.has_next().unwrap() {
            let feature = writer.next().unwrap();
            let id = feature.id().to_string();
            match id.as_str() {
                "roads.2" => writer.remove().unwrap(),
                "roads.3" => {
                    feature.set_attribute("lanes", 9i64);
                    writer.write().unwrap();
                }
                _ => {}
            }
        }
        assert!(matches!(writer.next(), Err(ShapefileError::NoSuchElement)));
        writer.close().unwrap();

        let features: Vec<_> = store
            .reader(&Query::all())
            .unwrap()
            .map(|f| f.unwrap())
            .collect();
        let ids: Vec<&str> = features.iter().map(|f| f.id().as_str()).collect();
        assert_eq!(ids, vec!["roads.1", "roads.3", "roads.4"]);
        assert_eq!(features[1].attribute("lanes"), Some(&Value::Integer(9)));
    }

    #[test]
    fn test_mixed_mode_never_reuses_ids() {
        let dir = tempdir().unwrap();
        let store = ShapefileStore::open(dir.path().join("roads.shp"), ShapefileConfig::new()).unwrap();
        store.create_schema(&roads()).unwrap();
        populate(&store, 3);

        let mut writer = store.writer(WriteMode::Mixed).unwrap();
        while writer.has_next().unwrap() {
            let id = writer.next().unwrap().id().to_string();
            if id == "roads.3" {
                writer.remove().unwrap();
            }
        }
        let added = writer.next().unwrap();
        assert_eq!(added.id().as_str(), "roads.4");
        added.set_geometry(Shape::line(&[(50.0, 50.0), (51.0, 51.0)]));
        writer.write().unwrap();
        writer.close().unwrap();

        let ids: Vec<String> = store
            .reader(&Query::all())
            .unwrap()
            .map(|f| f.unwrap().id().to_string())
            .collect();
        assert_eq!(ids, vec!["roads.1", "roads.2", "roads.4"]);
    }

    #[test]
    fn test_unclosed_writer_discards_changes() {
        let dir = tempdir().unwrap();
        let store = ShapefileStore::open(dir.path().join("roads.shp"), ShapefileConfig::new()).unwrap();
        store.create_schema(&roads()).unwrap();
        populate(&store, 2);
        let before = std::fs::read(store.files().path(FileType::Shp)).unwrap();

        {
            let mut writer = store.writer(WriteMode::Append).unwrap();
            let feature = writer.next().unwrap();
            feature.set_geometry(Shape::line(&[(9.0, 9.0), (10.0, 10.0)]));
            writer.write().unwrap();
        }

        assert_eq!(std::fs::read(store.files().path(FileType::Shp)).unwrap(), before);
        assert_eq!(store.count(&Query::all()).unwrap(), 2);
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_writer_invalidates_spatial_index() {
        let dir = tempdir().unwrap();
        let config = ShapefileConfig::builder().max_qix_cache_size(1 << 30).build();
        let store = ShapefileStore::open(dir.path().join("roads.shp"), config).unwrap();
        store.create_schema(&roads()).unwrap();
        populate(&store, 10);

        let window = Query::bbox(Envelope::new(100.0, 100.0, 101.0, 101.0));
        assert_eq!(store.count(&window).unwrap(), 0);
        assert!(store.index_manager().has_cached_tree());

        let mut writer = store.writer(WriteMode::Append).unwrap();
        let feature = writer.next().unwrap();
        feature.set_geometry(Shape::line(&[(100.2, 100.2), (100.4, 100.4)]));
        writer.write().unwrap();
        writer.close().unwrap();

        assert!(!store.index_manager().has_cached_tree());
        assert!(!store.files().exists(FileType::Qix));
        assert_eq!(store.count(&window).unwrap(), 1);
    }

    #[test]
    fn test_remote_store_reads_without_indexes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("roads.shp");
        let store = ShapefileStore::open(&path, ShapefileConfig::new()).unwrap();
        store.create_schema(&roads()).unwrap();
        populate(&store, 6);
        store.index_manager().invalidate_spatial_index().unwrap();

        let remote = ShapefileStore::open_remote(&path, ShapefileConfig::new()).unwrap();
        let query = Query::bbox(Envelope::new(0.0, 0.0, 2.2, 1.0));
        let reader = remote.reader(&query).unwrap();
        assert!(!reader.is_indexed());
        assert_eq!(reader.count(), 3);
        assert!(!remote.files().exists(FileType::Qix));
        assert!(remote.create_schema(&roads()).is_err());
    }
}
