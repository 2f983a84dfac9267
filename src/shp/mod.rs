//! Binary codec for the shapefile geometry file (`.shp`) and its offset
//! index sidecar (`.shx`).
//!
//! Both files share a 100-byte header with format-mandated mixed endianness:
//! the leading magic word and the file length are big-endian, the version,
//! shape type, and bounding box are little-endian. Record headers are
//! big-endian; record content is little-endian. The encoding is reproduced
//! bit-exactly for interoperability with the existing shapefile ecosystem.

mod header;
mod record;
mod reader;
mod writer;

pub use header::ShpHeader;
pub use record::ShpRecord;
pub use reader::{ShpReader, ShxReader};
pub use writer::ShpWriter;

use std::io::Read;

/// Size of the fixed file header shared by `.shp` and `.shx`.
pub const HEADER_LEN: usize = 100;

/// Magic constant in the first header word (big-endian).
pub const FILE_CODE: i32 = 9994;

/// Shapefile format version (little-endian, header byte 28).
pub const FILE_VERSION: i32 = 1000;

/// Size of the per-record header (record number + content length).
pub const RECORD_HEADER_LEN: usize = 8;

/// Fixed-width `.shx` entry: (offset in words, length in words).
pub const SHX_ENTRY_LEN: usize = 8;

/// Read into `buf`, retrying partial reads until the buffer is full or the
/// stream ends. Returns the number of bytes actually read.
pub(crate) fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_fully_short_stream() {
        let data = [1u8, 2, 3];
        let mut buf = [0u8; 8];
        let n = read_fully(&mut &data[..], &mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_read_fully_exact() {
        let data = [9u8; 16];
        let mut buf = [0u8; 16];
        let n = read_fully(&mut &data[..], &mut buf).unwrap();
        assert_eq!(n, 16);
        assert_eq!(buf, data);
    }
}
