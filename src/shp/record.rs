//! Geometry records and bounding-box extraction from raw record content.

use crate::error::{Result, ShapeError};
use crate::types::{BoundingBox, ShapeType};
use bytes::Bytes;

/// A single geometry record read from a `.shp` file.
///
/// The content is kept as raw little-endian bytes (shape type tag included);
/// full geometry materialization happens downstream of this crate. Only the
/// bounding box is decoded here, because the spatial indexes need it.
#[derive(Debug, Clone, PartialEq)]
pub struct ShpRecord {
    /// 1-based sequential record number
    pub number: u32,
    /// Absolute byte offset of the record header within the file
    pub offset: u64,
    /// Geometry type of this record
    pub shape_type: ShapeType,
    /// Raw little-endian record content, shape type tag included
    pub content: Bytes,
}

impl ShpRecord {
    /// Content length in 16-bit words, as stored in the record header.
    pub fn content_length_words(&self) -> i32 {
        (self.content.len() / 2) as i32
    }

    /// Geometry payload after the 4-byte shape type tag.
    pub fn payload(&self) -> &[u8] {
        &self.content[4..]
    }

    /// Bounding box of the geometry, `None` for null shapes.
    pub fn bbox(&self) -> Result<Option<BoundingBox>> {
        content_bbox(&self.content)
    }
}

/// Decode the bounding box embedded in raw record content.
///
/// Point shapes carry a bare coordinate pair; all other non-null shapes
/// store xmin/ymin/xmax/ymax right after the type tag.
pub(crate) fn content_bbox(content: &[u8]) -> Result<Option<BoundingBox>> {
    let shape_type = content_shape_type(content)?;

    match shape_type {
        ShapeType::Null => Ok(None),
        t if t.is_point() => {
            let x = read_f64_le(content, 4)?;
            let y = read_f64_le(content, 12)?;
            Ok(Some(BoundingBox::new(x, y, x, y)))
        }
        _ => {
            let min_x = read_f64_le(content, 4)?;
            let min_y = read_f64_le(content, 12)?;
            let max_x = read_f64_le(content, 20)?;
            let max_y = read_f64_le(content, 28)?;
            Ok(Some(BoundingBox::new(min_x, min_y, max_x, max_y)))
        }
    }
}

/// Decode the little-endian shape type tag at the start of record content.
pub(crate) fn content_shape_type(content: &[u8]) -> Result<ShapeType> {
    if content.len() < 4 {
        return Err(ShapeError::Format(format!(
            "record content is {} bytes, too short for a shape type tag",
            content.len()
        )));
    }
    let code = i32::from_le_bytes(content[0..4].try_into().unwrap());
    ShapeType::from_code(code)
}

fn read_f64_le(content: &[u8], at: usize) -> Result<f64> {
    let end = at + 8;
    if content.len() < end {
        return Err(ShapeError::Format(format!(
            "record content is {} bytes, too short for an ordinate at offset {at}",
            content.len()
        )));
    }
    Ok(f64::from_le_bytes(content[at..end].try_into().unwrap()))
}

/// Build record content for a 2D point, the simplest shape to synthesize.
pub(crate) fn point_content(x: f64, y: f64) -> Bytes {
    let mut buf = Vec::with_capacity(20);
    buf.extend_from_slice(&ShapeType::Point.code().to_le_bytes());
    buf.extend_from_slice(&x.to_le_bytes());
    buf.extend_from_slice(&y.to_le_bytes());
    Bytes::from(buf)
}
