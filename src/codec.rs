//! Shared wire primitives for the on-disk artifacts.
//!
//! Every file this crate reads or writes is framed the same way: a codec
//! header carrying a magic word, a codec name, a format version, a 16-byte
//! segment ID and a suffix string; and a 16-byte footer whose CRC32 covers
//! every preceding byte including the footer magic. All multi-byte scalars
//! are little-endian regardless of host byte order.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{ReorderError, Result};

/// Magic word opening every codec header.
pub const CODEC_MAGIC: u32 = 0x3fd7_6c17;
/// Magic word opening every footer (bitwise complement of the header magic).
pub const FOOTER_MAGIC: u32 = !CODEC_MAGIC;
/// Footer length: magic(4) + algorithm(4) + checksum(8).
pub const FOOTER_LEN: u64 = 16;

/// Serialized length of a codec header for the given name and suffix.
pub fn header_len(codec: &str, suffix: &str) -> u64 {
    4 + 2 + codec.len() as u64 + 4 + 16 + 2 + suffix.len() as u64
}

/// Write a codec header: magic, name, version, segment ID, suffix.
pub fn write_header<W: Write>(
    w: &mut W,
    codec: &str,
    version: u32,
    segment_id: &[u8; 16],
    suffix: &str,
) -> io::Result<()> {
    w.write_u32::<LittleEndian>(CODEC_MAGIC)?;
    write_string(w, codec)?;
    w.write_u32::<LittleEndian>(version)?;
    w.write_all(segment_id)?;
    write_string(w, suffix)
}

/// Check a codec header, returning the stored format version.
///
/// The version must fall within `[min_version, max_version]`; anything
/// else is an [`ReorderError::UnsupportedVersion`].
pub fn check_header<R: Read>(
    r: &mut R,
    file: &Path,
    codec: &str,
    min_version: u32,
    max_version: u32,
) -> Result<u32> {
    let magic = r.read_u32::<LittleEndian>().map_err(truncated(file))?;
    if magic != CODEC_MAGIC {
        return Err(ReorderError::format(
            file,
            format!("bad codec magic {magic:#010x}, expected {CODEC_MAGIC:#010x}"),
        ));
    }
    let name = read_string(r).map_err(truncated(file))?;
    if name != codec {
        return Err(ReorderError::format(
            file,
            format!("codec name mismatch: expected {codec:?}, got {name:?}"),
        ));
    }
    let version = r.read_u32::<LittleEndian>().map_err(truncated(file))?;
    if version < min_version || version > max_version {
        return Err(ReorderError::UnsupportedVersion {
            file: file.display().to_string(),
            version,
        });
    }
    let mut segment_id = [0u8; 16];
    r.read_exact(&mut segment_id).map_err(truncated(file))?;
    let _suffix = read_string(r).map_err(truncated(file))?;
    Ok(version)
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    debug_assert!(s.len() <= u16::MAX as usize);
    w.write_u16::<LittleEndian>(s.len() as u16)?;
    w.write_all(s.as_bytes())
}

fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let len = r.read_u16::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Map a truncated read into a `Format` error for the given file.
///
/// A short read inside a structured section means the stream ended where
/// the format promised more bytes, which is corruption, not an I/O fault.
pub fn truncated(file: &Path) -> impl Fn(io::Error) -> ReorderError + '_ {
    move |e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ReorderError::format(file, "truncated stream")
        } else {
            ReorderError::Io(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Variable-width integers
// ---------------------------------------------------------------------------

/// Write an LEB128 variable-width unsigned integer.
pub fn write_vu64<W: Write>(w: &mut W, mut value: u64) -> io::Result<()> {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            return w.write_all(&[byte]);
        }
        w.write_all(&[byte | 0x80])?;
    }
}

/// Read an LEB128 variable-width unsigned integer.
pub fn read_vu64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = r.read_u8()?;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "varint longer than 64 bits",
            ));
        }
    }
}

pub fn write_vu32<W: Write>(w: &mut W, value: u32) -> io::Result<()> {
    write_vu64(w, u64::from(value))
}

pub fn read_vu32<R: Read>(r: &mut R) -> io::Result<u32> {
    let v = read_vu64(r)?;
    u32::try_from(v).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "varint overflows u32"))
}

// ---------------------------------------------------------------------------
// Checksummed output
// ---------------------------------------------------------------------------

/// Writer wrapper that hashes every byte it passes through.
///
/// Footers must be computed over exactly the bytes that reached the file,
/// so all content writes go through this and the footer helper below.
pub struct ChecksumWriter<W: Write> {
    inner: W,
    hasher: Hasher,
    written: u64,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
            written: 0,
        }
    }

    /// Bytes written so far.
    pub fn position(&self) -> u64 {
        self.written
    }

    /// CRC32 of everything written so far.
    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Write the integrity footer.
///
/// The CRC covers all content plus the footer magic and algorithm word,
/// never the checksum field itself.
pub fn write_footer<W: Write>(w: &mut ChecksumWriter<W>) -> io::Result<()> {
    w.write_u32::<LittleEndian>(FOOTER_MAGIC)?;
    w.write_u32::<LittleEndian>(0)?; // checksum algorithm: 0 = CRC32
    let checksum = w.checksum();
    w.get_mut().write_u64::<LittleEndian>(u64::from(checksum))
}

/// Verify the integrity footer of a whole file.
///
/// Reads every byte once, recomputes the CRC over `[0, len - 8)` and
/// compares it with the stored value. Fatal on magic, algorithm or
/// checksum mismatch.
pub fn verify_footer<R: Read + Seek>(r: &mut R, file: &Path) -> Result<()> {
    let len = r.seek(SeekFrom::End(0))?;
    if len < FOOTER_LEN {
        return Err(ReorderError::format(file, "file shorter than footer"));
    }
    r.seek(SeekFrom::Start(0))?;

    let mut hasher = Hasher::new();
    let mut remaining = len - 8;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        r.read_exact(&mut buf[..want]).map_err(truncated(file))?;
        hasher.update(&buf[..want]);
        remaining -= want as u64;
    }
    let actual = hasher.finalize();

    r.seek(SeekFrom::Start(len - FOOTER_LEN))?;
    let magic = r.read_u32::<LittleEndian>().map_err(truncated(file))?;
    if magic != FOOTER_MAGIC {
        return Err(ReorderError::format(
            file,
            format!("bad footer magic {magic:#010x}"),
        ));
    }
    let algorithm = r.read_u32::<LittleEndian>().map_err(truncated(file))?;
    if algorithm != 0 {
        return Err(ReorderError::format(
            file,
            format!("unknown checksum algorithm {algorithm}"),
        ));
    }
    let expected = r.read_u64::<LittleEndian>().map_err(truncated(file))? as u32;
    if expected != actual {
        return Err(ReorderError::ChecksumMismatch {
            file: file.display().to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Verify the footer of the file at `path`.
pub fn verify_file_footer(path: &Path) -> Result<()> {
    let mut file = crate::storage::open_read(path)?;
    verify_footer(&mut file, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn varint_round_trip() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_vu64(&mut buf, v).unwrap();
            assert_eq!(read_vu64(&mut Cursor::new(&buf)).unwrap(), v);
        }
    }

    #[test]
    fn header_round_trip() {
        let mut buf = Vec::new();
        let id = [7u8; 16];
        write_header(&mut buf, "TestCodec", 3, &id, "sfx").unwrap();
        assert_eq!(buf.len() as u64, header_len("TestCodec", "sfx"));
        let version = check_header(
            &mut Cursor::new(&buf),
            Path::new("mem"),
            "TestCodec",
            0,
            5,
        )
        .unwrap();
        assert_eq!(version, 3);
    }

    #[test]
    fn header_rejects_wrong_codec() {
        let mut buf = Vec::new();
        write_header(&mut buf, "A", 0, &[0; 16], "").unwrap();
        let err = check_header(&mut Cursor::new(&buf), Path::new("mem"), "B", 0, 0).unwrap_err();
        assert!(matches!(err, ReorderError::Format { .. }));
    }

    #[test]
    fn footer_verifies_and_detects_corruption() {
        let mut w = ChecksumWriter::new(Vec::new());
        w.write_all(b"payload bytes").unwrap();
        write_footer(&mut w).unwrap();
        let mut bytes = w.into_inner();

        verify_footer(&mut Cursor::new(&mut bytes), Path::new("mem")).unwrap();

        bytes[3] ^= 0xff;
        let err = verify_footer(&mut Cursor::new(&mut bytes), Path::new("mem")).unwrap_err();
        assert!(matches!(err, ReorderError::ChecksumMismatch { .. }));
    }
}
