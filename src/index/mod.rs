//! On-disk spatial indexes over shapefile records.
//!
//! Two interchangeable tree structures implement [`SpatialIndex`]: an R-tree
//! (`.grx`) and a quad-tree (`.qix`). Both are built by a full scan of the
//! geometry file, persisted, and loaded read-only at query time. Queries
//! always deliver candidates in ascending record-number order so consumers
//! can scan the geometry file forward without backtracking.

pub mod builder;
pub mod quadtree;
pub mod rtree;

pub use builder::{BuildResult, IndexBuilder, IndexKind};
pub use quadtree::QuadTreeIndex;
pub use rtree::RTreeIndex;

use crate::error::{Result, ShapeError};
use crate::types::{BoundingBox, ByteOrder};
use bytes::{BufMut, BytesMut};

/// One index hit: a record and where to find it in the geometry file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// 1-based record number
    pub record_number: u32,
    /// Absolute byte offset of the record in the `.shp` file
    pub offset: u64,
}

/// Common capability of the persisted tree indexes.
pub trait SpatialIndex {
    /// Envelope covering every indexed record.
    fn bounds(&self) -> BoundingBox;

    /// Number of indexed records.
    fn len(&self) -> usize;

    /// Whether the index holds no records.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Candidate records whose bounding boxes may intersect `bbox`, sorted
    /// ascending by record number. May return a superset of the exact
    /// matches (in particular when `bbox` contains the whole index), never
    /// a subset.
    fn query(&self, bbox: &BoundingBox) -> Result<Vec<IndexEntry>>;
}

/// Sort candidates into the ascending record order the query contract
/// guarantees, regardless of tree traversal order.
pub(crate) fn sort_candidates(entries: &mut [IndexEntry]) {
    entries.sort_unstable_by_key(|e| e.record_number);
}

/// Close-like cleanup that must not fail the surrounding operation.
/// Failures are logged at debug severity and dropped.
pub(crate) fn best_effort<T>(result: Result<T>, what: &str) {
    if let Err(e) = result {
        log::debug!("ignoring {what} failure: {e}");
    }
}

/// Byte-order-aware encoder used by the index file formats.
pub(crate) struct Encoder {
    order: ByteOrder,
    pub buf: BytesMut,
}

impl Encoder {
    pub fn new(order: ByteOrder) -> Self {
        Self {
            order,
            buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        match self.order {
            ByteOrder::BigEndian => self.buf.put_u32(v),
            ByteOrder::LittleEndian => self.buf.put_u32_le(v),
        }
    }

    pub fn put_u64(&mut self, v: u64) {
        match self.order {
            ByteOrder::BigEndian => self.buf.put_u64(v),
            ByteOrder::LittleEndian => self.buf.put_u64_le(v),
        }
    }

    pub fn put_f64(&mut self, v: f64) {
        match self.order {
            ByteOrder::BigEndian => self.buf.put_f64(v),
            ByteOrder::LittleEndian => self.buf.put_f64_le(v),
        }
    }

    pub fn put_bbox(&mut self, bbox: &BoundingBox) {
        self.put_f64(bbox.min_x());
        self.put_f64(bbox.min_y());
        self.put_f64(bbox.max_x());
        self.put_f64(bbox.max_y());
    }
}

/// Byte-order-aware decoder over an in-memory index file image.
pub(crate) struct Decoder<'a> {
    order: ByteOrder,
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(order: ByteOrder, data: &'a [u8]) -> Self {
        Self {
            order,
            data,
            pos: 0,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(ShapeError::Format(format!(
                "index file truncated at byte {}, needed {n} more bytes",
                self.pos
            )));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32> {
        let raw: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(match self.order {
            ByteOrder::BigEndian => u32::from_be_bytes(raw),
            ByteOrder::LittleEndian => u32::from_le_bytes(raw),
        })
    }

    pub fn u64(&mut self) -> Result<u64> {
        let raw: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(match self.order {
            ByteOrder::BigEndian => u64::from_be_bytes(raw),
            ByteOrder::LittleEndian => u64::from_le_bytes(raw),
        })
    }

    pub fn f64(&mut self) -> Result<f64> {
        let raw: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(match self.order {
            ByteOrder::BigEndian => f64::from_be_bytes(raw),
            ByteOrder::LittleEndian => f64::from_le_bytes(raw),
        })
    }

    pub fn bbox(&mut self) -> Result<BoundingBox> {
        let min_x = self.f64()?;
        let min_y = self.f64()?;
        let max_x = self.f64()?;
        let max_y = self.f64()?;
        Ok(BoundingBox::new(min_x, min_y, max_x, max_y))
    }
}
