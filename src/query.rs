//! Read-side façade over a shapefile and its sidecar indexes.
//!
//! [`ShapeStore`] probes for index files once, at open time, and prefers the
//! quad-tree over the R-tree when both exist. Spatial queries consult the
//! selected index for candidates and verify each candidate's actual extent;
//! any index failure downgrades the query to a full sequential scan rather
//! than surfacing an error, since the scan always produces correct results.

use crate::error::{Result, ShapeError};
use crate::fid::FidSearcher;
use crate::index::{IndexEntry, QuadTreeIndex, RTreeIndex, SpatialIndex};
use crate::shp::{ShpHeader, ShpReader, ShpRecord, ShxReader};
use crate::types::BoundingBox;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Which spatial index the store resolved at open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSelection {
    /// No index file found; spatial queries scan the geometry file.
    None,
    /// A quad-tree index (`.qix`) will serve spatial queries.
    QuadTree(PathBuf),
    /// An R-tree index (`.grx`) will serve spatial queries.
    RTree(PathBuf),
}

impl IndexSelection {
    fn probe(shp_path: &Path) -> Self {
        let qix = shp_path.with_extension("qix");
        if qix.exists() {
            return Self::QuadTree(qix);
        }
        let grx = shp_path.with_extension("grx");
        if grx.exists() {
            return Self::RTree(grx);
        }
        Self::None
    }
}

/// Summary of a store's files, mainly for tooling output.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub shape_type: crate::types::ShapeType,
    pub bounds: BoundingBox,
    /// Record count from the `.shx` sidecar, when one exists.
    pub record_count: Option<u32>,
    pub index: IndexSelection,
}

/// An opened shapefile with whatever sidecar indexes exist beside it.
pub struct ShapeStore {
    shp_path: PathBuf,
    header: ShpHeader,
    selection: IndexSelection,
}

impl ShapeStore {
    /// Open `<path>.shp`, validate its header, and probe for sidecar
    /// indexes. The probe happens exactly once; indexes created later are
    /// picked up by reopening the store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let shp_path = path.as_ref().to_path_buf();
        let reader = ShpReader::open(&shp_path)?;
        let header = *reader.header();
        let selection = IndexSelection::probe(&shp_path);
        log::debug!(
            "opened {} with index selection {:?}",
            shp_path.display(),
            selection
        );
        Ok(Self {
            shp_path,
            header,
            selection,
        })
    }

    /// The geometry file's validated header.
    pub fn header(&self) -> &ShpHeader {
        &self.header
    }

    /// Path of the geometry file.
    pub fn path(&self) -> &Path {
        &self.shp_path
    }

    /// The index resolved at open time.
    pub fn selection(&self) -> &IndexSelection {
        &self.selection
    }

    /// File-level summary for tooling.
    pub fn stats(&self) -> Result<StoreStats> {
        let shx_path = self.shp_path.with_extension("shx");
        let record_count = if shx_path.exists() {
            Some(ShxReader::open(&shx_path)?.record_count())
        } else {
            None
        };
        Ok(StoreStats {
            shape_type: self.header.shape_type,
            bounds: self.header.bbox,
            record_count,
            index: self.selection.clone(),
        })
    }

    /// Iterate records, optionally restricted to those whose extent
    /// intersects `filter`. Records come back in ascending record order
    /// whether or not an index serves the query.
    pub fn records(&self, filter: Option<BoundingBox>) -> Result<RecordIter> {
        let reader = ShpReader::open(&self.shp_path)?;

        let filter = match filter {
            Some(bbox) if !bbox.is_finite() => {
                log::warn!("non-finite query box, scanning the whole file instead");
                None
            }
            other => other,
        };

        let mode = match filter {
            None => IterMode::Scan { filter: None },
            Some(bbox) => match self.query_index(&bbox) {
                Some(candidates) => IterMode::Indexed {
                    candidates,
                    next: 0,
                    filter: bbox,
                },
                None => IterMode::Scan { filter: Some(bbox) },
            },
        };

        Ok(RecordIter {
            reader,
            mode,
            current: None,
        })
    }

    /// Candidates from the selected index, or `None` to fall back to a scan.
    fn query_index(&self, bbox: &BoundingBox) -> Option<Vec<IndexEntry>> {
        let loaded: Result<Option<Box<dyn SpatialIndex>>> = match &self.selection {
            IndexSelection::None => return None,
            IndexSelection::QuadTree(path) => {
                QuadTreeIndex::open(path).map(|t| t.map(|t| Box::new(t) as Box<dyn SpatialIndex>))
            }
            IndexSelection::RTree(path) => {
                RTreeIndex::open(path).map(|t| t.map(|t| Box::new(t) as Box<dyn SpatialIndex>))
            }
        };

        let index = match loaded {
            Ok(Some(index)) => index,
            Ok(None) => {
                log::warn!("index file vanished since open, falling back to scan");
                return None;
            }
            Err(e) => {
                log::warn!("failed to load index ({e}), falling back to scan");
                return None;
            }
        };

        match index.query(bbox) {
            Ok(candidates) => Some(candidates),
            Err(e) => {
                log::warn!("index query failed ({e}), falling back to scan");
                None
            }
        }
    }

    /// Random access to a record by its 1-based number, via the `.shx`
    /// sidecar. Without a `.shx` there is no offset information, so this
    /// operation is unsupported rather than silently linear.
    pub fn record_at(&self, record_number: u32) -> Result<ShpRecord> {
        let shx_path = self.shp_path.with_extension("shx");
        if !shx_path.exists() {
            return Err(ShapeError::UnsupportedOperation(format!(
                "random record access needs {}, which does not exist",
                shx_path.display()
            )));
        }

        let (offset, _) = ShxReader::open(&shx_path)?.entry(record_number)?;
        let mut reader = ShpReader::open(&self.shp_path)?;
        reader.read_record_at(offset)
    }

    /// Resolve a `<typeName>.<n>` feature id to its record via the `.fix`
    /// index. A missing index or an unknown feature yields `None`.
    pub fn record_for_fid(&self, fid: &str) -> Result<Option<ShpRecord>> {
        let fix_path = self.shp_path.with_extension("fix");
        if !fix_path.exists() {
            log::debug!("no fid index at {}", fix_path.display());
            return Ok(None);
        }

        let Some(record_number) = FidSearcher::open(&fix_path)?.find_fid(fid)? else {
            return Ok(None);
        };
        self.record_at(record_number).map(Some)
    }
}

enum IterMode {
    /// Sequential scan, with an optional exact extent filter.
    Scan { filter: Option<BoundingBox> },
    /// Jump between index candidates, verifying each extent.
    Indexed {
        candidates: Vec<IndexEntry>,
        next: usize,
        filter: BoundingBox,
    },
}

/// Iterator over store records in ascending record order.
pub struct RecordIter {
    reader: ShpReader<BufReader<File>>,
    mode: IterMode,
    current: Option<u32>,
}

impl RecordIter {
    /// Record number of the most recently yielded record.
    pub fn current_record_number(&self) -> Option<u32> {
        self.current
    }

    fn next_scan(&mut self) -> Result<Option<ShpRecord>> {
        let IterMode::Scan { filter } = &self.mode else {
            unreachable!()
        };
        let filter = *filter;
        while let Some(record) = self.reader.read_record()? {
            match filter {
                None => return Ok(Some(record)),
                Some(bbox) => {
                    if let Some(extent) = record.bbox()? {
                        if extent.intersects(&bbox) {
                            return Ok(Some(record));
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    fn next_indexed(&mut self) -> Result<Option<ShpRecord>> {
        loop {
            let (offset, filter) = {
                let IterMode::Indexed {
                    candidates,
                    next,
                    filter,
                } = &mut self.mode
                else {
                    unreachable!()
                };
                let Some(candidate) = candidates.get(*next) else {
                    return Ok(None);
                };
                *next += 1;
                (candidate.offset, *filter)
            };

            let record = self.reader.read_record_at(offset)?;
            if let Some(extent) = record.bbox()? {
                if extent.intersects(&filter) {
                    return Ok(Some(record));
                }
            }
        }
    }
}

impl Iterator for RecordIter {
    type Item = Result<ShpRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = match self.mode {
            IterMode::Scan { .. } => self.next_scan(),
            IterMode::Indexed { .. } => self.next_indexed(),
        };
        match result {
            Ok(Some(record)) => {
                self.current = Some(record.number);
                Some(Ok(record))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fid::FidWriter;
    use crate::index::{IndexBuilder, IndexKind};
    use crate::shp::ShpWriter;
    use crate::types::ShapeType;
    use tempfile::tempdir;

    fn three_points(dir: &Path) -> PathBuf {
        let path = dir.join("points.shp");
        let mut writer = ShpWriter::create(&path, ShapeType::Point).unwrap();
        writer.append_point(0.5, 0.5).unwrap();
        writer.append_point(5.5, 5.5).unwrap();
        writer.append_point(10.5, 10.5).unwrap();
        writer.finalize().unwrap();
        path
    }

    fn numbers(iter: RecordIter) -> Vec<u32> {
        iter.map(|r| r.unwrap().number).collect()
    }

    #[test]
    fn test_scan_without_index() {
        let dir = tempdir().unwrap();
        let path = three_points(dir.path());

        let store = ShapeStore::open(&path).unwrap();
        assert_eq!(store.selection(), &IndexSelection::None);

        let all = numbers(store.records(None).unwrap());
        assert_eq!(all, vec![1, 2, 3]);

        let hit = numbers(
            store
                .records(Some(BoundingBox::new(4.0, 4.0, 7.0, 7.0)))
                .unwrap(),
        );
        assert_eq!(hit, vec![2]);
    }

    #[test]
    fn test_quadtree_query_matches_scan() {
        let dir = tempdir().unwrap();
        let path = three_points(dir.path());
        IndexBuilder::new(IndexKind::QuadTree).build(&path).unwrap();

        let store = ShapeStore::open(&path).unwrap();
        assert!(matches!(store.selection(), IndexSelection::QuadTree(_)));

        let hit = numbers(
            store
                .records(Some(BoundingBox::new(4.0, 4.0, 7.0, 7.0)))
                .unwrap(),
        );
        assert_eq!(hit, vec![2]);

        let all = numbers(
            store
                .records(Some(BoundingBox::new(-1.0, -1.0, 20.0, 20.0)))
                .unwrap(),
        );
        assert_eq!(all, vec![1, 2, 3]);
    }

    #[test]
    fn test_quadtree_preferred_over_rtree() {
        let dir = tempdir().unwrap();
        let path = three_points(dir.path());
        IndexBuilder::new(IndexKind::RTree).build(&path).unwrap();
        IndexBuilder::new(IndexKind::QuadTree).build(&path).unwrap();

        let store = ShapeStore::open(&path).unwrap();
        assert!(matches!(store.selection(), IndexSelection::QuadTree(_)));
    }

    #[test]
    fn test_corrupt_index_falls_back_to_scan() {
        let dir = tempdir().unwrap();
        let path = three_points(dir.path());
        let result = IndexBuilder::new(IndexKind::RTree).build(&path).unwrap();
        std::fs::write(&result.index_path, b"garbage").unwrap();

        let store = ShapeStore::open(&path).unwrap();
        let hit = numbers(
            store
                .records(Some(BoundingBox::new(4.0, 4.0, 7.0, 7.0)))
                .unwrap(),
        );
        assert_eq!(hit, vec![2]);
    }

    #[test]
    fn test_non_finite_query_scans_everything() {
        let dir = tempdir().unwrap();
        let path = three_points(dir.path());

        let store = ShapeStore::open(&path).unwrap();
        let all = numbers(
            store
                .records(Some(BoundingBox::new(f64::NAN, 0.0, 1.0, 1.0)))
                .unwrap(),
        );
        assert_eq!(all, vec![1, 2, 3]);
    }

    #[test]
    fn test_record_at_via_shx() {
        let dir = tempdir().unwrap();
        let path = three_points(dir.path());

        let store = ShapeStore::open(&path).unwrap();
        let record = store.record_at(2).unwrap();
        assert_eq!(record.number, 2);
        assert_eq!(
            record.bbox().unwrap().unwrap(),
            BoundingBox::new(5.5, 5.5, 5.5, 5.5)
        );
    }

    #[test]
    fn test_record_at_without_shx_unsupported() {
        let dir = tempdir().unwrap();
        let path = three_points(dir.path());
        std::fs::remove_file(path.with_extension("shx")).unwrap();

        let store = ShapeStore::open(&path).unwrap();
        let err = store.record_at(1).unwrap_err();
        assert!(matches!(err, ShapeError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_record_for_fid() {
        let dir = tempdir().unwrap();
        let path = three_points(dir.path());

        let mut fix = FidWriter::create(path.with_extension("fix")).unwrap();
        fix.append(10, 1).unwrap();
        fix.append(20, 2).unwrap();
        fix.append(30, 3).unwrap();
        fix.finalize().unwrap();
        drop(fix);

        let store = ShapeStore::open(&path).unwrap();
        let record = store.record_for_fid("points.20").unwrap().unwrap();
        assert_eq!(record.number, 2);
        assert_eq!(store.record_for_fid("points.25").unwrap(), None);
    }

    #[test]
    fn test_record_for_fid_missing_index_is_none() {
        let dir = tempdir().unwrap();
        let path = three_points(dir.path());

        let store = ShapeStore::open(&path).unwrap();
        assert_eq!(store.record_for_fid("points.1").unwrap(), None);
    }

    #[test]
    fn test_current_record_number_tracks_iteration() {
        let dir = tempdir().unwrap();
        let path = three_points(dir.path());

        let store = ShapeStore::open(&path).unwrap();
        let mut iter = store.records(None).unwrap();
        assert_eq!(iter.current_record_number(), None);
        iter.next().unwrap().unwrap();
        assert_eq!(iter.current_record_number(), Some(1));
        iter.next().unwrap().unwrap();
        assert_eq!(iter.current_record_number(), Some(2));
    }

    #[test]
    fn test_stats() {
        let dir = tempdir().unwrap();
        let path = three_points(dir.path());
        IndexBuilder::new(IndexKind::RTree).build(&path).unwrap();

        let store = ShapeStore::open(&path).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.shape_type, ShapeType::Point);
        assert_eq!(stats.record_count, Some(3));
        assert!(matches!(stats.index, IndexSelection::RTree(_)));
    }
}
