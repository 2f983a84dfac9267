//! Readers for the geometry file and its offset index sidecar.

use super::record::content_shape_type;
use super::{HEADER_LEN, RECORD_HEADER_LEN, SHX_ENTRY_LEN, ShpHeader, ShpRecord, read_fully};
use crate::error::{Result, ShapeError};
use bytes::Bytes;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Forward reader over a `.shp` geometry file.
///
/// Works on any byte stream for sequential scans; absolute-offset record
/// access additionally requires [`Seek`], which restricts it to file-backed
/// streams at compile time.
pub struct ShpReader<R> {
    inner: R,
    header: ShpHeader,
    /// Byte offset of the next sequential read
    pos: u64,
    /// Expected number of the next sequential record, for error reporting
    next_number: u32,
}

impl ShpReader<BufReader<File>> {
    /// Open a `.shp` file and validate its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read> ShpReader<R> {
    /// Wrap a stream positioned at the start of the file.
    pub fn new(mut inner: R) -> Result<Self> {
        let header = ShpHeader::read_from(&mut inner)?;
        Ok(Self {
            inner,
            header,
            pos: HEADER_LEN as u64,
            next_number: 1,
        })
    }

    /// The validated file header.
    pub fn header(&self) -> &ShpHeader {
        &self.header
    }

    /// Read the next record, or `None` at a clean end of file.
    pub fn read_record(&mut self) -> Result<Option<ShpRecord>> {
        let offset = self.pos;
        let mut head = [0u8; RECORD_HEADER_LEN];
        let n = read_fully(&mut self.inner, &mut head)?;
        if n == 0 {
            return Ok(None);
        }
        if n < RECORD_HEADER_LEN {
            return Err(ShapeError::TruncatedRecord {
                record_number: self.next_number,
                expected: RECORD_HEADER_LEN,
                actual: n,
            });
        }

        let record = decode_record(&mut self.inner, &head, offset)?;
        self.pos = offset + RECORD_HEADER_LEN as u64 + record.content.len() as u64;
        self.next_number = record.number + 1;
        Ok(Some(record))
    }
}

impl<R: Read + Seek> ShpReader<R> {
    /// Read the record starting at an absolute byte offset.
    pub fn read_record_at(&mut self, offset: u64) -> Result<ShpRecord> {
        self.inner.seek(SeekFrom::Start(offset))?;
        let mut head = [0u8; RECORD_HEADER_LEN];
        let n = read_fully(&mut self.inner, &mut head)?;
        if n < RECORD_HEADER_LEN {
            return Err(ShapeError::TruncatedRecord {
                record_number: 0,
                expected: RECORD_HEADER_LEN,
                actual: n,
            });
        }

        let record = decode_record(&mut self.inner, &head, offset)?;
        self.pos = offset + RECORD_HEADER_LEN as u64 + record.content.len() as u64;
        self.next_number = record.number + 1;
        Ok(record)
    }
}

impl<R: Read> Iterator for ShpReader<R> {
    type Item = Result<ShpRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}

fn decode_record<R: Read>(
    reader: &mut R,
    head: &[u8; RECORD_HEADER_LEN],
    offset: u64,
) -> Result<ShpRecord> {
    // Record headers are big-endian: number, then content length in words.
    let number = i32::from_be_bytes(head[0..4].try_into().unwrap());
    let content_words = i32::from_be_bytes(head[4..8].try_into().unwrap());
    if number < 1 || content_words < 2 {
        return Err(ShapeError::Format(format!(
            "invalid record header at offset {offset}: number {number}, length {content_words} words"
        )));
    }
    let number = number as u32;

    let content_len = content_words as usize * 2;
    let mut content = vec![0u8; content_len];
    let n = read_fully(reader, &mut content)?;
    if n < content_len {
        return Err(ShapeError::TruncatedRecord {
            record_number: number,
            expected: content_len,
            actual: n,
        });
    }

    let shape_type = content_shape_type(&content)?;
    Ok(ShpRecord {
        number,
        offset,
        shape_type,
        content: Bytes::from(content),
    })
}

/// Reader over a `.shx` offset index file.
///
/// Entry *i* maps record *i + 1* to its byte offset and length in the
/// geometry file.
pub struct ShxReader<R> {
    inner: R,
    header: ShpHeader,
    count: u32,
}

impl ShxReader<BufReader<File>> {
    /// Open a `.shx` file and validate its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> ShxReader<R> {
    /// Wrap a stream positioned at the start of the file.
    pub fn new(mut inner: R) -> Result<Self> {
        let header = ShpHeader::read_from(&mut inner)?;
        let body = header.file_length_bytes().saturating_sub(HEADER_LEN as u64);
        Ok(Self {
            inner,
            header,
            count: (body / SHX_ENTRY_LEN as u64) as u32,
        })
    }

    /// The validated file header.
    pub fn header(&self) -> &ShpHeader {
        &self.header
    }

    /// Number of records in the geometry file.
    pub fn record_count(&self) -> u32 {
        self.count
    }

    /// Byte offset and length of a record in the `.shp` file.
    pub fn entry(&mut self, record_number: u32) -> Result<(u64, usize)> {
        if record_number < 1 || record_number > self.count {
            return Err(ShapeError::Format(format!(
                "record number {record_number} out of range, index has {} entries",
                self.count
            )));
        }

        let at = HEADER_LEN as u64 + (record_number as u64 - 1) * SHX_ENTRY_LEN as u64;
        self.inner.seek(SeekFrom::Start(at))?;

        let mut raw = [0u8; SHX_ENTRY_LEN];
        let n = read_fully(&mut self.inner, &mut raw)?;
        if n < SHX_ENTRY_LEN {
            return Err(ShapeError::TruncatedRecord {
                record_number,
                expected: SHX_ENTRY_LEN,
                actual: n,
            });
        }

        let offset_words = i32::from_be_bytes(raw[0..4].try_into().unwrap());
        let length_words = i32::from_be_bytes(raw[4..8].try_into().unwrap());
        Ok((offset_words as u64 * 2, length_words as usize * 2))
    }

    /// All (offset, length) pairs in record order.
    pub fn read_all(&mut self) -> Result<Vec<(u64, usize)>> {
        let mut entries = Vec::with_capacity(self.count as usize);
        for number in 1..=self.count {
            entries.push(self.entry(number)?);
        }
        Ok(entries)
    }
}
