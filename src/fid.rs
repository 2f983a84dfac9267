//! The feature-ID index file (`.fix`).
//!
//! An append-ordered binary log mapping feature IDs to `.shx` record numbers.
//! Feature IDs are strictly increasing in append order, but once features
//! have been edited or removed the record numbers they map to are not
//! monotonic, and the sequence may contain gaps. Point lookups therefore use
//! a predictive interpolation search that degrades to a linear scan on small
//! windows.
//!
//! Forward iteration and random-access search are separate types so neither
//! has to account for the other moving the stream position: [`FidReader`] is
//! a forward-only cursor, [`FidSearcher`] a stateless random-access searcher.
//! Sharing one instance across threads is unsupported; open one per caller.

use crate::error::{Result, ShapeError};
use crate::shp::read_fully;
use bytes::{BufMut, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// On-disk format version this crate reads and writes.
pub const FID_FORMAT_VERSION: u8 = 1;

/// Header: version (u8) + record count (u64) + removed count (u32).
const FID_HEADER_LEN: usize = 13;

/// Entry: feature id (i64) + shx record number (i32), big-endian.
const FID_ENTRY_LEN: usize = 12;

/// Window size below which the interpolation search steps linearly instead.
/// Preserved from existing tooling rather than tuned.
pub const DEFAULT_LINEAR_THRESHOLD: u32 = 10;

/// Decoded `.fix` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FidHeader {
    /// Number of entries in the file
    pub record_count: u64,
    /// Features removed since the last full regeneration; a staleness signal
    pub removed_count: u32,
}

impl FidHeader {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut raw = [0u8; FID_HEADER_LEN];
        let n = read_fully(reader, &mut raw)?;
        if n < FID_HEADER_LEN {
            return Err(ShapeError::Format(format!(
                "fid index header is {n} bytes, expected {FID_HEADER_LEN}"
            )));
        }
        if raw[0] != FID_FORMAT_VERSION {
            return Err(ShapeError::Format(format!(
                "unsupported fid index version {}, expected {FID_FORMAT_VERSION}",
                raw[0]
            )));
        }
        Ok(Self {
            record_count: u64::from_be_bytes(raw[1..9].try_into().unwrap()),
            removed_count: u32::from_be_bytes(raw[9..13].try_into().unwrap()),
        })
    }

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FID_HEADER_LEN);
        buf.put_u8(FID_FORMAT_VERSION);
        buf.put_u64(self.record_count);
        buf.put_u32(self.removed_count);
        buf
    }
}

/// One entry of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FidEntry {
    /// Feature id, the numeric suffix of `<typeName>.<n>`
    pub fid: i64,
    /// 1-based record number in the `.shx`/`.shp` files
    pub shx_record: u32,
}

fn decode_entry(raw: &[u8; FID_ENTRY_LEN]) -> FidEntry {
    FidEntry {
        fid: i64::from_be_bytes(raw[0..8].try_into().unwrap()),
        shx_record: i32::from_be_bytes(raw[8..12].try_into().unwrap()) as u32,
    }
}

/// Appending writer for a `.fix` file.
///
/// Writes a placeholder header on creation; [`finalize`](FidWriter::finalize)
/// rewrites the true counts.
pub struct FidWriter {
    inner: BufWriter<File>,
    record_count: u64,
    removed_count: u32,
    last_fid: Option<i64>,
}

impl FidWriter {
    /// Create `path`, truncating any existing file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut inner = BufWriter::new(file);

        let placeholder = FidHeader {
            record_count: 0,
            removed_count: 0,
        };
        inner.write_all(&placeholder.encode())?;

        Ok(Self {
            inner,
            record_count: 0,
            removed_count: 0,
            last_fid: None,
        })
    }

    /// Append one entry. Feature ids must be strictly increasing.
    pub fn append(&mut self, fid: i64, shx_record: u32) -> Result<()> {
        if let Some(last) = self.last_fid {
            if fid <= last {
                return Err(ShapeError::Format(format!(
                    "feature id {fid} not strictly greater than previous id {last}"
                )));
            }
        }

        let mut buf = BytesMut::with_capacity(FID_ENTRY_LEN);
        buf.put_i64(fid);
        buf.put_i32(shx_record as i32);
        self.inner.write_all(&buf)?;

        self.record_count += 1;
        self.last_fid = Some(fid);
        Ok(())
    }

    /// Record that a feature was removed since the last full regeneration.
    pub fn record_removed(&mut self) {
        self.removed_count += 1;
    }

    /// Rewrite the header with the final counts, flush, and sync.
    pub fn finalize(&mut self) -> Result<()> {
        let header = FidHeader {
            record_count: self.record_count,
            removed_count: self.removed_count,
        };
        self.inner.seek(SeekFrom::Start(0))?;
        self.inner.write_all(&header.encode())?;
        self.inner
            .seek(SeekFrom::Start(FID_HEADER_LEN as u64 + self.record_count * FID_ENTRY_LEN as u64))?;
        self.inner.flush()?;
        self.inner.get_ref().sync_all()?;
        Ok(())
    }

    /// Regenerate a fid index with the identity mapping `n -> record n`,
    /// the state after a full rebuild against an unedited geometry file.
    pub fn regenerate<P: AsRef<Path>>(path: P, record_count: u32) -> Result<()> {
        let mut writer = Self::create(path)?;
        for number in 1..=record_count {
            writer.append(number as i64, number)?;
        }
        writer.finalize()
    }
}

impl Drop for FidWriter {
    fn drop(&mut self) {
        // Best effort flush on drop, ignore errors
        let _ = self.inner.flush();
    }
}

/// Forward-only cursor over a `.fix` file.
#[derive(Debug)]
pub struct FidReader<R> {
    inner: R,
    header: FidHeader,
    position: u64,
}

impl FidReader<BufReader<File>> {
    /// Open a `.fix` file and validate its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read> FidReader<R> {
    /// Wrap a stream positioned at the start of the file.
    pub fn new(mut inner: R) -> Result<Self> {
        let header = FidHeader::read_from(&mut inner)?;
        Ok(Self {
            inner,
            header,
            position: 0,
        })
    }

    /// The validated header.
    pub fn header(&self) -> &FidHeader {
        &self.header
    }

    /// Whether another entry is available.
    pub fn has_next(&self) -> bool {
        self.position < self.header.record_count
    }

    /// Read the next entry.
    pub fn next_entry(&mut self) -> Result<FidEntry> {
        let mut raw = [0u8; FID_ENTRY_LEN];
        let n = read_fully(&mut self.inner, &mut raw)?;
        if n < FID_ENTRY_LEN {
            return Err(ShapeError::TruncatedRecord {
                record_number: self.position as u32 + 1,
                expected: FID_ENTRY_LEN,
                actual: n,
            });
        }
        self.position += 1;
        Ok(decode_entry(&raw))
    }
}

impl<R: Read> Iterator for FidReader<R> {
    type Item = Result<FidEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.has_next() {
            Some(self.next_entry())
        } else {
            None
        }
    }
}

/// Random-access point-lookup over a `.fix` file using predictive
/// interpolation search.
///
/// Feature ids are dense and roughly uniform relative to record number in
/// the common unedited case, so linear extrapolation converges faster than
/// bisection; small windows degrade to a step-by-one scan to avoid
/// interpolation overshoot thrashing where edits broke the uniformity.
pub struct FidSearcher<R> {
    inner: R,
    header: FidHeader,
    linear_threshold: u32,
}

impl FidSearcher<BufReader<File>> {
    /// Open a `.fix` file and validate its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> FidSearcher<R> {
    /// Wrap a stream positioned at the start of the file.
    pub fn new(mut inner: R) -> Result<Self> {
        let header = FidHeader::read_from(&mut inner)?;
        Ok(Self {
            inner,
            header,
            linear_threshold: DEFAULT_LINEAR_THRESHOLD,
        })
    }

    /// The validated header.
    pub fn header(&self) -> &FidHeader {
        &self.header
    }

    /// Override the window size below which the search scans linearly.
    pub fn with_linear_threshold(mut self, threshold: u32) -> Self {
        self.linear_threshold = threshold.max(2);
        self
    }

    /// Resolve a `<typeName>.<n>` feature id string to its record number.
    ///
    /// Lookups are best-effort: a malformed id or an absent feature yields
    /// `None`, logged, never an error.
    pub fn find_fid(&mut self, fid: &str) -> Result<Option<u32>> {
        let Some((_, suffix)) = fid.rsplit_once('.') else {
            log::warn!("malformed feature id {fid:?}: no numeric suffix");
            return Ok(None);
        };
        let desired: i64 = match suffix.parse() {
            Ok(n) => n,
            Err(_) => {
                log::warn!("malformed feature id {fid:?}: suffix {suffix:?} is not numeric");
                return Ok(None);
            }
        };
        self.search(desired)
    }

    /// Find the record number for a numeric feature id.
    pub fn search(&mut self, desired: i64) -> Result<Option<u32>> {
        let count = self.header.record_count as i64;
        if count == 0 {
            return Ok(None);
        }

        // Initial guess assumes the unedited identity mapping fid == record.
        let predicted = (desired - 1).clamp(0, count - 1);
        self.search_window(desired, -1, count, predicted)
    }

    /// Search the open window `(min, max)` of entry indices.
    fn search_window(&mut self, desired: i64, min: i64, max: i64, predicted: i64) -> Result<Option<u32>> {
        if max - min < self.linear_threshold as i64 {
            return self.linear_scan(desired, min, max);
        }

        let predicted = predicted.clamp(min + 1, max - 1);
        let entry = self.entry_at(predicted)?;
        if entry.fid == desired {
            return Ok(Some(entry.shx_record));
        }

        // Linear extrapolation, clamped by bisecting toward the violated bound.
        let mut next = predicted + (desired - entry.fid);
        if next <= min {
            next = min + (predicted - min) / 2;
        }
        if next >= max {
            next = max - (max - predicted) / 2;
        }
        if next == predicted {
            return Ok(None);
        }

        if next < predicted {
            self.search_window(desired, min, predicted, next)
        } else {
            self.search_window(desired, predicted, max, next)
        }
    }

    fn linear_scan(&mut self, desired: i64, min: i64, max: i64) -> Result<Option<u32>> {
        for index in (min + 1)..max {
            let entry = self.entry_at(index)?;
            if entry.fid == desired {
                return Ok(Some(entry.shx_record));
            }
            if entry.fid > desired {
                // Ids are sorted; overshooting means absence.
                break;
            }
        }
        Ok(None)
    }

    fn entry_at(&mut self, index: i64) -> Result<FidEntry> {
        debug_assert!(index >= 0 && index < self.header.record_count as i64);
        let at = FID_HEADER_LEN as u64 + index as u64 * FID_ENTRY_LEN as u64;
        self.inner.seek(SeekFrom::Start(at))?;

        let mut raw = [0u8; FID_ENTRY_LEN];
        let n = read_fully(&mut self.inner, &mut raw)?;
        if n < FID_ENTRY_LEN {
            return Err(ShapeError::TruncatedRecord {
                record_number: index as u32 + 1,
                expected: FID_ENTRY_LEN,
                actual: n,
            });
        }
        Ok(decode_entry(&raw))
    }
}
