//! Raw vector-data file: random-access reads and permuted rewrites.
//!
//! Rows are fixed-width little-endian f32, located by the (offset,
//! length, dimension, count) descriptor from the metadata sidecar. A
//! rewrite copies every byte before and after the data region unchanged
//! and emits the rows in permuted order; only the trailing checksum is
//! recomputed.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::meta::{FieldMeta, SparseSections};
use crate::codec::{self, ChecksumWriter, FOOTER_LEN};
use crate::error::{ReorderError, Result};
use crate::permutation::Permutation;
use crate::storage::{self, AtomicFile};

pub const DATA_CODEC: &str = "LocalityVectorsData";
pub const DATA_VERSION: u32 = 1;

/// Random-access reader over one field's rows.
pub struct VectorReader {
    reader: BufReader<File>,
    path: PathBuf,
    data_offset: u64,
    dimension: usize,
    count: usize,
}

impl VectorReader {
    /// Open the data file at `path` for the field described by `field`.
    pub fn open(path: &Path, field: &FieldMeta) -> Result<Self> {
        let mut reader = storage::open_read(path)?;
        let file_len = reader.seek(SeekFrom::End(0))?;
        let expected = field.count as u64 * field.dimension as u64 * 4;
        if field.data_length != expected {
            return Err(ReorderError::format(
                path,
                format!(
                    "data length {} disagrees with {} rows of {} dims",
                    field.data_length, field.count, field.dimension
                ),
            ));
        }
        if field.data_offset + field.data_length > file_len {
            return Err(ReorderError::format(
                path,
                format!(
                    "data region [{}, {}) extends past file end {file_len}",
                    field.data_offset,
                    field.data_offset + field.data_length
                ),
            ));
        }
        Ok(Self {
            reader,
            path: path.to_path_buf(),
            data_offset: field.data_offset,
            dimension: field.dimension,
            count: field.count,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Read the raw bytes of the row at `ord`.
    pub fn read_row_bytes(&mut self, ord: usize, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.dimension * 4);
        if ord >= self.count {
            return Err(ReorderError::Invariant(format!(
                "ordinal {ord} out of range for {} vectors",
                self.count
            )));
        }
        self.reader.seek(SeekFrom::Start(
            self.data_offset + ord as u64 * self.dimension as u64 * 4,
        ))?;
        self.reader
            .read_exact(buf)
            .map_err(codec::truncated(&self.path))
    }

    /// Read the row at `ord` as floats.
    pub fn read_row(&mut self, ord: usize) -> Result<Vec<f32>> {
        if ord >= self.count {
            return Err(ReorderError::Invariant(format!(
                "ordinal {ord} out of range for {} vectors",
                self.count
            )));
        }
        self.reader.seek(SeekFrom::Start(
            self.data_offset + ord as u64 * self.dimension as u64 * 4,
        ))?;
        let mut row = vec![0f32; self.dimension];
        self.reader
            .read_f32_into::<LittleEndian>(&mut row)
            .map_err(codec::truncated(&self.path))?;
        Ok(row)
    }

    /// Load every row into one flat `count * dimension` array.
    pub fn load_all(&mut self) -> Result<Vec<f32>> {
        self.reader.seek(SeekFrom::Start(self.data_offset))?;
        let mut all = vec![0f32; self.count * self.dimension];
        self.reader
            .read_f32_into::<LittleEndian>(&mut all)
            .map_err(codec::truncated(&self.path))?;
        Ok(all)
    }
}

/// Rewrite `src` into `dst` with rows in permuted order.
///
/// Bytes before the data region and between the data region and the
/// footer are copied unchanged. When `ord_to_doc` is given, the
/// sparse-sorted mapping structures are appended after the copied
/// trailer and their sections returned for the metadata rewriter.
pub fn write_reordered(
    src: &Path,
    dst: &Path,
    field: &FieldMeta,
    perm: &Permutation,
    ord_to_doc: Option<&[i32]>,
) -> Result<Option<SparseSections>> {
    if perm.len() != field.count {
        return Err(ReorderError::Invariant(format!(
            "permutation covers {} items but field holds {}",
            perm.len(),
            field.count
        )));
    }
    if let Some(mapping) = ord_to_doc {
        if mapping.len() != field.count {
            return Err(ReorderError::Invariant(format!(
                "ordinal-to-document mapping has {} entries for {} vectors",
                mapping.len(),
                field.count
            )));
        }
    }

    let mut reader = storage::open_read(src)?;
    let file_len = reader.seek(SeekFrom::End(0))?;
    let data_end = field.data_offset + field.data_length;
    if data_end + FOOTER_LEN > file_len {
        return Err(ReorderError::format(
            src,
            format!("data region ends at {data_end} but file holds {file_len} bytes"),
        ));
    }

    let mut out = AtomicFile::create(dst)?;
    let mut w = ChecksumWriter::new(out.writer());

    copy_range(&mut reader, &mut w, 0, field.data_offset)?;

    let row_bytes = field.dimension * 4;
    let mut row = vec![0u8; row_bytes];
    for new_ord in 0..field.count {
        let old_ord = perm.old_of(new_ord) as u64;
        reader.seek(SeekFrom::Start(field.data_offset + old_ord * row_bytes as u64))?;
        reader.read_exact(&mut row).map_err(codec::truncated(src))?;
        w.write_all(&row)?;
    }

    // Header/trailer bytes carry metadata unaffected by row order.
    copy_range(&mut reader, &mut w, data_end, file_len - FOOTER_LEN - data_end)?;

    let sections = match ord_to_doc {
        Some(mapping) => Some(append_sparse_sections(&mut w, mapping)?),
        None => None,
    };

    codec::write_footer(&mut w)?;
    drop(w);
    out.commit()?;

    info!(
        src = %src.display(),
        dst = %dst.display(),
        count = field.count,
        sparse = sections.is_some(),
        "rewrote vector data file"
    );
    Ok(sections)
}

/// Write a fresh data file from in-memory vectors in permuted order.
///
/// Returns the field's `(data_offset, data_length)`.
pub fn write_fresh(
    dst: &Path,
    segment_id: &[u8; 16],
    suffix: &str,
    vectors: &[f32],
    dimension: usize,
    perm: &Permutation,
) -> Result<(u64, u64)> {
    if dimension == 0 || vectors.len() % dimension != 0 {
        return Err(ReorderError::Invariant(format!(
            "{} floats do not divide into {dimension}-dim rows",
            vectors.len()
        )));
    }
    let count = vectors.len() / dimension;
    if perm.len() != count {
        return Err(ReorderError::Invariant(format!(
            "permutation covers {} items but {count} vectors supplied",
            perm.len()
        )));
    }

    let mut out = AtomicFile::create(dst)?;
    let mut w = ChecksumWriter::new(out.writer());
    codec::write_header(&mut w, DATA_CODEC, DATA_VERSION, segment_id, suffix)?;
    let data_offset = w.position();
    for new_ord in 0..count {
        let old_ord = perm.old_of(new_ord);
        for &v in &vectors[old_ord * dimension..(old_ord + 1) * dimension] {
            w.write_f32::<LittleEndian>(v)?;
        }
    }
    let data_length = w.position() - data_offset;
    codec::write_footer(&mut w)?;
    drop(w);
    out.commit()?;
    debug!(file = %dst.display(), count, "wrote fresh vector data file");
    Ok((data_offset, data_length))
}

/// Append the sparse-sorted mapping structures: a bitset of present
/// documents, then the ordinal for each present document in ascending
/// document order.
fn append_sparse_sections<W: Write>(
    w: &mut ChecksumWriter<W>,
    ord_to_doc: &[i32],
) -> Result<SparseSections> {
    let mut pairs: Vec<(i32, u32)> = ord_to_doc
        .iter()
        .enumerate()
        .map(|(ord, &doc)| (doc, ord as u32))
        .collect();
    pairs.sort_unstable();
    for pair in pairs.windows(2) {
        if pair[0].0 == pair[1].0 {
            return Err(ReorderError::Invariant(format!(
                "document id {} mapped by more than one ordinal",
                pair[0].0
            )));
        }
    }
    if pairs.first().map(|&(doc, _)| doc < 0).unwrap_or(false) {
        return Err(ReorderError::Invariant(
            "negative document id in ordinal mapping".to_string(),
        ));
    }
    let max_doc = pairs.last().map(|&(doc, _)| doc as u32).unwrap_or(0);

    let docs_offset = w.position();
    let mut bitset = vec![0u8; (max_doc as usize + 8) / 8];
    for &(doc, _) in &pairs {
        bitset[doc as usize / 8] |= 1 << (doc as usize % 8);
    }
    w.write_all(&bitset)?;
    let docs_length = w.position() - docs_offset;

    let ords_offset = w.position();
    for &(_, ord) in &pairs {
        w.write_i32::<LittleEndian>(ord as i32)?;
    }
    let ords_length = w.position() - ords_offset;

    Ok(SparseSections {
        docs_offset,
        docs_length,
        ords_offset,
        ords_length,
        max_doc,
    })
}

/// Resolve a document to its ordinal through the sparse-sorted sections
/// of a data file.
///
/// Returns `None` when the document has no vector.
pub fn resolve_sparse(path: &Path, sections: &SparseSections, doc: u32) -> Result<Option<u32>> {
    if doc > sections.max_doc {
        return Ok(None);
    }
    let mut reader = storage::open_read(path)?;

    reader.seek(SeekFrom::Start(sections.docs_offset))?;
    let mut bitset = vec![0u8; sections.docs_length as usize];
    reader
        .read_exact(&mut bitset)
        .map_err(codec::truncated(path))?;
    if bitset[doc as usize / 8] & (1 << (doc as usize % 8)) == 0 {
        return Ok(None);
    }

    // Rank of `doc` among present documents selects its slot.
    let mut rank = 0u64;
    for byte_idx in 0..doc as usize / 8 {
        rank += u64::from(bitset[byte_idx].count_ones());
    }
    rank += u64::from((bitset[doc as usize / 8] & ((1 << (doc as usize % 8)) - 1)).count_ones());

    reader.seek(SeekFrom::Start(sections.ords_offset + rank * 4))?;
    let ord = reader
        .read_i32::<LittleEndian>()
        .map_err(codec::truncated(path))?;
    Ok(Some(ord as u32))
}

fn copy_range<R: Read + Seek, W: Write>(
    reader: &mut R,
    writer: &mut W,
    start: u64,
    len: u64,
) -> Result<()> {
    reader.seek(SeekFrom::Start(start))?;
    let mut remaining = len;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..want])?;
        writer.write_all(&buf[..want])?;
        remaining -= want as u64;
    }
    Ok(())
}
