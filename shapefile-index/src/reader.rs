//! Streaming feature reader.
//!
//! Records come either from an index (candidate locations, visited by
//! seeking) or from a sequential scan. Each record is judged on its header
//! envelope before any geometry is decoded:
//!
//! 1. outside the query window: skipped, attribute cursor kept in step
//! 2. smaller than the simplification distance: dropped if its screen-map
//!    pixel is already painted, otherwise decoded generalized
//! 3. otherwise decoded in full

use std::collections::HashSet;

use indexmap::IndexMap;
use roaring::RoaringBitmap;

use crate::dbf::DbfReader;
use crate::envelope::Envelope;
use crate::errors::{ShapefileError, ShapefileResult};
use crate::feature::Feature;
use crate::fid::FeatureId;
use crate::fid_index::IndexedFidReader;
use crate::iterators::{CandidateIterator, CloseableIterator};
use crate::schema::{FeatureType, Value};
use crate::screen_map::ScreenMap;
use crate::shp::{Record, ShpReader, SHP_HEADER_LEN};

/// Where the next record position comes from.
#[derive(Debug)]
pub enum Source {
    /// Candidate locations from the spatial or identity index
    Indexed(CandidateIterator),
    /// Every record, in file order
    FullScan,
}

impl Source {
    fn is_indexed(&self) -> bool {
        matches!(self, Source::Indexed(_))
    }
}

pub struct FeatureReader {
    schema: FeatureType,
    shp: Option<ShpReader>,
    dbf: Option<DbfReader>,
    source: Source,
    fids: Option<IndexedFidReader>,
    bbox: Option<Envelope>,
    simplification_distance: Option<f64>,
    screen_map: Option<ScreenMap>,
    id_filter: Option<HashSet<FeatureId>>,
    /// Look-ahead slot filled by `has_next`
    next_feature: Option<Feature>,
    /// Records yielded from an index, skipped if the scan has to restart
    emitted: RoaringBitmap,
}

impl FeatureReader {
    /// `dbf` may be omitted when no attributes are wanted.
    pub fn new(
        schema: FeatureType,
        shp: ShpReader,
        dbf: Option<DbfReader>,
        source: Source,
    ) -> FeatureReader {
        FeatureReader {
            schema,
            shp: Some(shp),
            dbf,
            source,
            fids: None,
            bbox: None,
            simplification_distance: None,
            screen_map: None,
            id_filter: None,
            next_feature: None,
            emitted: RoaringBitmap::new(),
        }
    }

    /// Rejects records whose envelope does not intersect `bbox`.
    pub fn with_bbox(mut self, bbox: Envelope) -> Self {
        self.bbox = Some(bbox);
        self
    }

    /// Generalizes records smaller than `distance` and, when a screen map is
    /// given, drops those landing on an already painted pixel.
    pub fn with_simplification(mut self, distance: f64, screen_map: Option<ScreenMap>) -> Self {
        if distance > 0.0 {
            self.simplification_distance = Some(distance);
            self.screen_map = screen_map;
        }
        self
    }

    /// Takes identifiers from the identity index instead of synthesizing them.
    pub fn with_fid_reader(mut self, fids: IndexedFidReader) -> Self {
        self.fids = Some(fids);
        self
    }

    /// Only yields features whose identifier is in `ids`.
    pub fn with_id_filter(mut self, ids: HashSet<FeatureId>) -> Self {
        self.id_filter = Some(ids);
        self
    }

    pub fn schema(&self) -> &FeatureType {
        &self.schema
    }

    pub fn is_indexed(&self) -> bool {
        self.source.is_indexed()
    }

    pub fn is_closed(&self) -> bool {
        self.shp.is_none()
    }

    /// True if another feature is available. Repeated calls without `next`
    /// do not advance the underlying cursors.
    pub fn has_next(&mut self) -> ShapefileResult<bool> {
        if self.next_feature.is_some() {
            return Ok(true);
        }
        if self.is_closed() {
            return Ok(false);
        }
        match self.read_ahead() {
            Ok(Some(feature)) => {
                self.next_feature = Some(feature);
                Ok(true)
            }
            Ok(None) => {
                self.close();
                Ok(false)
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Returns the next feature, or `NoSuchElement` when exhausted.
    pub fn next_feature(&mut self) -> ShapefileResult<Feature> {
        if !self.has_next()? {
            return Err(ShapefileError::NoSuchElement);
        }
        self.next_feature.take().ok_or(ShapefileError::NoSuchElement)
    }

    /// Releases every file handle and lock. Idempotent.
    pub fn close(&mut self) {
        if let Source::Indexed(candidates) = &mut self.source {
            candidates.close();
        }
        self.shp = None;
        self.dbf = None;
        self.fids = None;
        self.next_feature = None;
    }

    fn read_ahead(&mut self) -> ShapefileResult<Option<Feature>> {
        loop {
            let Some(record) = self.next_record()? else {
                return Ok(None);
            };

            if self.source.is_indexed() {
                self.emitted.insert(record.number);
            } else if self.emitted.contains(record.number) {
                self.skip_attributes()?;
                continue;
            }

            if let Some(bbox) = self.bbox {
                if !record.envelope.intersects(&bbox) {
                    self.skip_attributes()?;
                    continue;
                }
            }

            let fid = self.fid_of(record.number);
            let wanted = self
                .id_filter
                .as_ref()
                .map_or(true, |ids| ids.contains(&fid));
            if !wanted {
                self.skip_attributes()?;
                continue;
            }

            let geometry = match self.simplification_distance {
                Some(d) if record.envelope.width() < d && record.envelope.height() < d => {
                    let covered = self
                        .screen_map
                        .as_ref()
                        .map_or(false, |map| map.check_and_set(&record.envelope));
                    if covered {
                        self.skip_attributes()?;
                        continue;
                    }
                    self.shp_mut()?.read_simplified(d)?
                }
                _ => self.shp_mut()?.read_shape()?,
            };

            let attributes = self.read_attributes(&record)?;
            return Ok(Some(Feature::new(fid, geometry, attributes)));
        }
    }

    fn shp_mut(&mut self) -> ShapefileResult<&mut ShpReader> {
        self.shp.as_mut().ok_or(ShapefileError::Closed("Feature reader"))
    }

    /// Header of the next record to judge, from the index or the scan. An
    /// index that fails mid-stream is abandoned for a scan that skips the
    /// records already yielded.
    fn next_record(&mut self) -> ShapefileResult<Option<Record>> {
        loop {
            if !self.source.is_indexed() {
                let shp = self.shp_mut()?;
                if !shp.has_next() {
                    return Ok(None);
                }
                return shp.next_header().map(Some);
            }
            let candidate = match &mut self.source {
                Source::Indexed(candidates) => candidates.next(),
                Source::FullScan => None,
            };

            let error = match candidate {
                None => return Ok(None),
                Some(Ok(location)) => {
                    let shp = self.shp_mut()?;
                    shp.goto(location.byte_offset)?;
                    let record = shp.next_header()?;
                    if record.number == location.record_number {
                        return Ok(Some(record));
                    }
                    ShapefileError::InvalidOperation(format!(
                        "index points record {} at offset {} holding record {}",
                        location.record_number, location.byte_offset, record.number
                    ))
                }
                Some(Err(e)) => e,
            };
            self.fall_back_to_scan(error)?;
        }
    }

    fn fall_back_to_scan(&mut self, cause: ShapefileError) -> ShapefileResult<()> {
        log::warn!(
            "Index of {} failed, scanning instead: {}",
            self.schema.type_name(),
            cause
        );
        if let Source::Indexed(candidates) = &mut self.source {
            candidates.close();
        }
        self.source = Source::FullScan;
        self.shp_mut()?.goto(SHP_HEADER_LEN)?;
        if let Some(dbf) = self.dbf.as_mut() {
            if dbf.row_count() > 0 {
                dbf.seek_to_row(1)?;
            }
        }
        Ok(())
    }

    fn skip_attributes(&mut self) -> ShapefileResult<()> {
        if self.source.is_indexed() {
            return Ok(());
        }
        match self.dbf.as_mut() {
            Some(dbf) => dbf.skip(),
            None => Ok(()),
        }
    }

    fn read_attributes(&mut self, record: &Record) -> ShapefileResult<IndexMap<String, Value>> {
        let indexed = self.source.is_indexed();
        match self.dbf.as_mut() {
            Some(dbf) => {
                if indexed {
                    dbf.seek_to_row(record.number)?;
                }
                dbf.read_row()
            }
            None => Ok(IndexMap::new()),
        }
    }

    fn fid_of(&mut self, record_number: u32) -> FeatureId {
        if let Some(fids) = self.fids.as_mut() {
            match fids.fid_for_record(record_number) {
                Ok(Some(fid)) => return fid,
                Ok(None) => {}
                Err(e) => {
                    log::warn!(
                        "Identity index of {} unreadable, synthesizing ids: {}",
                        self.schema.type_name(),
                        e
                    );
                    self.fids = None;
                }
            }
        }
        FeatureId::synthesize(self.schema.type_name(), record_number as u64)
    }
}

impl Iterator for FeatureReader {
    type Item = ShapefileResult<Feature>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.has_next() {
            Ok(true) => self.next_feature.take().map(Ok),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl std::fmt::Debug for FeatureReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureReader")
            .field("type_name", &self.schema.type_name())
            .field("source", &self.source)
            .field("bbox", &self.bbox)
            .field("closed", &self.is_closed())
            .finish()
    }
}
