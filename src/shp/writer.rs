//! Two-phase writer for the geometry file and its offset index.

use super::record::{content_bbox, content_shape_type, point_content};
use super::{HEADER_LEN, ShpHeader};
use crate::error::{Result, ShapeError};
use crate::types::{BoundingBox, ShapeType};
use bytes::{BufMut, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Appending writer that maintains a `.shp` file and its `.shx` sidecar
/// in lockstep.
///
/// Creation writes placeholder headers; the true extent, record count, and
/// file lengths are only known after all records are written, so
/// [`finalize`](ShpWriter::finalize) rewrites both headers in place.
/// Finalize is idempotent: repeated calls with unchanged state produce
/// byte-identical headers.
pub struct ShpWriter {
    shp: BufWriter<File>,
    shx: BufWriter<File>,
    shp_path: PathBuf,
    shape_type: ShapeType,
    record_count: u32,
    /// Byte offset where the next record header lands
    next_offset: u64,
    bbox: Option<BoundingBox>,
    scratch: BytesMut,
}

impl ShpWriter {
    /// Create `<path>` and its `.shx` sibling, truncating any existing files,
    /// and write placeholder headers.
    pub fn create<P: AsRef<Path>>(path: P, shape_type: ShapeType) -> Result<Self> {
        let shp_path = path.as_ref().to_path_buf();
        let shx_path = shp_path.with_extension("shx");

        let mut shp = BufWriter::new(open_truncated(&shp_path)?);
        let mut shx = BufWriter::new(open_truncated(&shx_path)?);

        let placeholder = ShpHeader::placeholder(shape_type);
        placeholder.write_to(&mut shp)?;
        placeholder.write_to(&mut shx)?;

        Ok(Self {
            shp,
            shx,
            shp_path,
            shape_type,
            record_count: 0,
            next_offset: HEADER_LEN as u64,
            bbox: None,
            scratch: BytesMut::with_capacity(256),
        })
    }

    /// Path of the geometry file being written.
    pub fn path(&self) -> &Path {
        &self.shp_path
    }

    /// Number of records appended so far.
    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// Append one record. `content` is the full little-endian record content,
    /// shape type tag included. Returns the assigned 1-based record number.
    pub fn append(&mut self, content: &[u8]) -> Result<u32> {
        if content.len() % 2 != 0 {
            return Err(ShapeError::Format(format!(
                "record content length {} is not a whole number of 16-bit words",
                content.len()
            )));
        }

        let shape_type = content_shape_type(content)?;
        if shape_type != ShapeType::Null && shape_type != self.shape_type {
            return Err(ShapeError::Format(format!(
                "record shape type {:?} does not match file shape type {:?}",
                shape_type, self.shape_type
            )));
        }

        if let Some(bbox) = content_bbox(content)? {
            self.bbox = Some(match self.bbox {
                Some(acc) => acc.union(&bbox),
                None => bbox,
            });
        }

        let number = self.record_count + 1;
        let content_words = (content.len() / 2) as i32;

        // Record header is big-endian; content passes through verbatim.
        self.scratch.clear();
        self.scratch.put_i32(number as i32);
        self.scratch.put_i32(content_words);
        self.scratch.put_slice(content);
        self.shp.write_all(&self.scratch)?;

        self.scratch.clear();
        self.scratch.put_i32((self.next_offset / 2) as i32);
        self.scratch.put_i32(content_words);
        self.shx.write_all(&self.scratch)?;

        self.next_offset += 8 + content.len() as u64;
        self.record_count = number;
        Ok(number)
    }

    /// Append a 2D point record.
    pub fn append_point(&mut self, x: f64, y: f64) -> Result<u32> {
        self.append(&point_content(x, y))
    }

    /// Rewrite both headers with the final extent and lengths, then flush
    /// and sync to disk.
    pub fn finalize(&mut self) -> Result<()> {
        let bbox = self
            .bbox
            .unwrap_or_else(|| BoundingBox::new(0.0, 0.0, 0.0, 0.0));

        let shp_header = ShpHeader {
            shape_type: self.shape_type,
            bbox,
            z_range: (0.0, 0.0),
            m_range: (0.0, 0.0),
            file_length_words: (self.next_offset / 2) as i32,
        };
        let shx_len = HEADER_LEN as u64 + self.record_count as u64 * 8;
        let shx_header = ShpHeader {
            file_length_words: (shx_len / 2) as i32,
            ..shp_header
        };

        self.shp.seek(SeekFrom::Start(0))?;
        shp_header.write_to(&mut self.shp)?;
        self.shp.seek(SeekFrom::Start(self.next_offset))?;
        self.shp.flush()?;
        self.shp.get_ref().sync_all()?;

        self.shx.seek(SeekFrom::Start(0))?;
        shx_header.write_to(&mut self.shx)?;
        self.shx.seek(SeekFrom::Start(shx_len))?;
        self.shx.flush()?;
        self.shx.get_ref().sync_all()?;

        Ok(())
    }
}

impl Drop for ShpWriter {
    fn drop(&mut self) {
        // Best effort flush on drop, ignore errors
        let _ = self.shp.flush();
        let _ = self.shx.flush();
    }
}

fn open_truncated(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .truncate(true)
        .open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shp::{ShpReader, ShxReader};
    use tempfile::tempdir;

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.shp");

        let mut writer = ShpWriter::create(&path, ShapeType::Point).unwrap();
        assert_eq!(writer.append_point(0.5, 0.5).unwrap(), 1);
        assert_eq!(writer.append_point(5.5, 5.5).unwrap(), 2);
        assert_eq!(writer.append_point(10.5, 10.5).unwrap(), 3);
        writer.finalize().unwrap();

        let mut reader = ShpReader::open(&path).unwrap();
        assert_eq!(reader.header().shape_type, ShapeType::Point);
        assert_eq!(
            reader.header().bbox,
            BoundingBox::new(0.5, 0.5, 10.5, 10.5)
        );

        let records: Vec<_> = reader.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 3);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.number, i as u32 + 1);
        }
        assert_eq!(records[1].content, point_content(5.5, 5.5));
    }

    #[test]
    fn test_shx_entries_match_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.shp");

        let mut writer = ShpWriter::create(&path, ShapeType::Point).unwrap();
        for i in 0..4 {
            writer.append_point(i as f64, i as f64).unwrap();
        }
        writer.finalize().unwrap();

        let mut shx = ShxReader::open(path.with_extension("shx")).unwrap();
        assert_eq!(shx.record_count(), 4);

        let mut shp = ShpReader::open(&path).unwrap();
        for number in 1..=4 {
            let (offset, length) = shx.entry(number).unwrap();
            let record = shp.read_record_at(offset).unwrap();
            assert_eq!(record.number, number);
            assert_eq!(record.content.len(), length);
        }
    }

    #[test]
    fn test_finalize_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.shp");

        let mut writer = ShpWriter::create(&path, ShapeType::Point).unwrap();
        writer.append_point(1.0, 2.0).unwrap();
        writer.finalize().unwrap();
        let first = std::fs::read(&path).unwrap();
        writer.finalize().unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_mismatched_shape_type_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("polys.shp");

        let mut writer = ShpWriter::create(&path, ShapeType::Polygon).unwrap();
        let err = writer.append(&point_content(1.0, 1.0)).unwrap_err();
        assert!(matches!(err, ShapeError::Format(_)));
    }

    #[test]
    fn test_truncated_record_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.shp");

        let mut writer = ShpWriter::create(&path, ShapeType::Point).unwrap();
        writer.append_point(1.0, 2.0).unwrap();
        writer.finalize().unwrap();
        drop(writer);

        // Chop the last record short.
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 6]).unwrap();

        let mut reader = ShpReader::open(&path).unwrap();
        let err = reader.read_record().unwrap_err();
        assert!(matches!(err, ShapeError::TruncatedRecord { .. }));
    }
}
