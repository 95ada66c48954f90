//! Auxiliary document→ordinal sidecar for the forced-dense strategy.
//!
//! When the primary metadata declares a dense mapping after a reorder,
//! the declaration is a lie relative to true document identity; this file
//! carries the truth. `mapping[doc_id] = ordinal`, valid only when the
//! document set is exactly `[0, count)`. Consumers that resolve "vector
//! for document X" read this first; consumers that only index by ordinal
//! never open it.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::path::Path;
use tracing::debug;

use crate::codec::{self, ChecksumWriter};
use crate::error::{ReorderError, Result};
use crate::storage::{self, AtomicFile};

pub const DOCMAP_CODEC: &str = "LocalityDocOrdinalMap";
pub const DOCMAP_VERSION: u32 = 1;

/// Write the sidecar: versioned header, count, mapping, checksum footer.
pub fn write(
    path: &Path,
    segment_id: &[u8; 16],
    suffix: &str,
    doc_to_ord: &[i32],
) -> Result<()> {
    let count = i32::try_from(doc_to_ord.len()).map_err(|_| {
        ReorderError::Invariant(format!("{} documents overflow i32 count", doc_to_ord.len()))
    })?;
    let mut out = AtomicFile::create(path)?;
    let mut w = ChecksumWriter::new(out.writer());
    codec::write_header(&mut w, DOCMAP_CODEC, DOCMAP_VERSION, segment_id, suffix)?;
    w.write_i32::<LittleEndian>(count)?;
    for &ord in doc_to_ord {
        w.write_i32::<LittleEndian>(ord)?;
    }
    codec::write_footer(&mut w)?;
    drop(w);
    out.commit()?;
    debug!(file = %path.display(), count, "wrote document-ordinal sidecar");
    Ok(())
}

/// Read and verify the sidecar.
pub fn read(path: &Path) -> Result<Vec<i32>> {
    codec::verify_file_footer(path)?;
    let mut r = storage::open_read(path)?;
    codec::check_header(&mut r, path, DOCMAP_CODEC, DOCMAP_VERSION, DOCMAP_VERSION)?;
    let count = r.read_i32::<LittleEndian>().map_err(codec::truncated(path))?;
    if count < 0 {
        return Err(ReorderError::format(path, format!("negative count {count}")));
    }
    let mut mapping = vec![0i32; count as usize];
    r.read_i32_into::<LittleEndian>(&mut mapping)
        .map_err(codec::truncated(path))?;
    Ok(mapping)
}
