//! The 100-byte file header shared by `.shp` and `.shx`.

use super::{FILE_CODE, FILE_VERSION, HEADER_LEN, read_fully};
use crate::error::{Result, ShapeError};
use crate::types::{BoundingBox, ShapeType};
use bytes::{BufMut, BytesMut};
use std::io::{Read, Write};

/// Decoded file header.
///
/// The header layout (byte offsets):
///
/// | 0..4    | magic 9994           | big-endian    |
/// | 4..24   | unused               | zero          |
/// | 24..28  | file length in words | big-endian    |
/// | 28..32  | version 1000         | little-endian |
/// | 32..36  | shape type           | little-endian |
/// | 36..100 | xmin ymin xmax ymax zmin zmax mmin mmax | little-endian f64 |
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShpHeader {
    /// Geometry type of every non-null record in the file
    pub shape_type: ShapeType,
    /// Extent of all geometries in the file
    pub bbox: BoundingBox,
    /// Z range, zero for 2D shape types
    pub z_range: (f64, f64),
    /// M range, zero when no measures are present
    pub m_range: (f64, f64),
    /// Total file length in 16-bit words, header included
    pub file_length_words: i32,
}

impl ShpHeader {
    /// A placeholder header written before any records exist. The true
    /// extent and length are only known after all records are written, so
    /// [`crate::ShpWriter::finalize`] overwrites these fields later.
    pub fn placeholder(shape_type: ShapeType) -> Self {
        Self {
            shape_type,
            bbox: BoundingBox::new(0.0, 0.0, 0.0, 0.0),
            z_range: (0.0, 0.0),
            m_range: (0.0, 0.0),
            file_length_words: (HEADER_LEN / 2) as i32,
        }
    }

    /// Total file length in bytes.
    pub fn file_length_bytes(&self) -> u64 {
        self.file_length_words as u64 * 2
    }

    /// Read and validate a header from the start of a stream.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut raw = [0u8; HEADER_LEN];
        let n = read_fully(reader, &mut raw)?;
        if n < HEADER_LEN {
            return Err(ShapeError::Format(format!(
                "file header is {n} bytes, expected {HEADER_LEN}"
            )));
        }
        Self::decode(&raw)
    }

    /// Decode and validate a raw 100-byte header.
    pub fn decode(raw: &[u8; HEADER_LEN]) -> Result<Self> {
        let magic = i32::from_be_bytes(raw[0..4].try_into().unwrap());
        if magic != FILE_CODE {
            return Err(ShapeError::Format(format!(
                "bad magic word {magic}, expected {FILE_CODE}"
            )));
        }

        let version = i32::from_le_bytes(raw[28..32].try_into().unwrap());
        if version != FILE_VERSION {
            return Err(ShapeError::Format(format!(
                "unsupported shapefile version {version}, expected {FILE_VERSION}"
            )));
        }

        let file_length_words = i32::from_be_bytes(raw[24..28].try_into().unwrap());
        let shape_code = i32::from_le_bytes(raw[32..36].try_into().unwrap());
        let shape_type = ShapeType::from_code(shape_code)?;

        let mut doubles = [0f64; 8];
        for (i, d) in doubles.iter_mut().enumerate() {
            let start = 36 + i * 8;
            *d = f64::from_le_bytes(raw[start..start + 8].try_into().unwrap());
        }

        Ok(Self {
            shape_type,
            bbox: BoundingBox::new(doubles[0], doubles[1], doubles[2], doubles[3]),
            z_range: (doubles[4], doubles[5]),
            m_range: (doubles[6], doubles[7]),
            file_length_words,
        })
    }

    /// Encode to the exact 100-byte on-disk form.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_i32(FILE_CODE);
        buf.put_bytes(0, 20);
        buf.put_i32(self.file_length_words);
        buf.put_i32_le(FILE_VERSION);
        buf.put_i32_le(self.shape_type.code());
        buf.put_f64_le(self.bbox.min_x());
        buf.put_f64_le(self.bbox.min_y());
        buf.put_f64_le(self.bbox.max_x());
        buf.put_f64_le(self.bbox.max_y());
        buf.put_f64_le(self.z_range.0);
        buf.put_f64_le(self.z_range.1);
        buf.put_f64_le(self.m_range.0);
        buf.put_f64_le(self.m_range.1);
        debug_assert_eq!(buf.len(), HEADER_LEN);
        buf
    }

    /// Write the encoded header to a stream.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode())?;
        Ok(())
    }
}
