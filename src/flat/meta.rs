//! Metadata sidecar: field descriptors and the ordinal→document mapping.
//!
//! The mapping representation is the delicate part. The dense form stores
//! nothing (ordinal == document ID). A reorder permutation generally
//! destroys that equivalence, and the degraded form is recorded behind an
//! explicit kind flag so the two resolution strategies can never be
//! confused:
//!
//! - **forced-dense**: the sidecar still declares dense — which is a lie
//!   relative to true document identity — and the true document→ordinal
//!   mapping lives in the auxiliary [`docmap`](super::docmap) file.
//!   Consumers resolving "vector for document X" must go through the
//!   auxiliary file; consumers resolving "vector at ordinal i" must not.
//! - **sparse-sorted**: self-contained. A bitset of present documents and
//!   an ordinal-for-each-document array (keyed by ascending document ID)
//!   are appended to the data file and their sections recorded here.
//!
//! Within one reorder pass dense may degrade to either form; never the
//! reverse.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;
use std::path::Path;
use tracing::debug;

use crate::codec::{self, ChecksumWriter};
use crate::error::{ReorderError, Result};
use crate::permutation::Permutation;
use crate::storage::{self, AtomicFile};

pub const META_CODEC: &str = "LocalityVectorsMeta";
pub const META_VERSION: u32 = 1;

const KIND_DENSE: u8 = 0;
const KIND_FORCED_DENSE: u8 = 1;
const KIND_SPARSE_SORTED: u8 = 2;
const KIND_EMPTY: u8 = 3;

/// Byte regions of the sparse-sorted structures inside the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseSections {
    pub docs_offset: u64,
    pub docs_length: u64,
    pub ords_offset: u64,
    pub ords_length: u64,
    /// Highest document ID present.
    pub max_doc: u32,
}

/// How ordinals map to document IDs for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrdinalMap {
    /// Ordinal and document ID are numerically identical.
    Dense,
    /// No vectors for this field.
    Empty,
    /// Declared dense on disk; the truth is in the auxiliary sidecar.
    ForcedDense,
    /// Explicit bitset + ordinal-by-document-rank structures.
    SparseSorted(SparseSections),
}

/// One field's descriptor from the metadata sidecar.
#[derive(Debug, Clone)]
pub struct FieldMeta {
    pub field_id: i32,
    pub encoding: i32,
    pub similarity: i32,
    /// Offset of the row data inside the data file.
    pub data_offset: u64,
    pub data_length: u64,
    pub dimension: usize,
    pub count: usize,
    pub ordinal_map: OrdinalMap,
}

/// Read all field descriptors from the sidecar at `path`.
pub fn read_metadata(path: &Path) -> Result<Vec<FieldMeta>> {
    let mut r = storage::open_read(path)?;
    codec::check_header(&mut r, path, META_CODEC, META_VERSION, META_VERSION)?;

    let mut fields = Vec::new();
    loop {
        let field_id = r.read_i32::<LittleEndian>().map_err(codec::truncated(path))?;
        if field_id == -1 {
            break;
        }
        let encoding = r.read_i32::<LittleEndian>().map_err(codec::truncated(path))?;
        let similarity = r.read_i32::<LittleEndian>().map_err(codec::truncated(path))?;
        let data_offset = codec::read_vu64(&mut r).map_err(codec::truncated(path))?;
        let data_length = codec::read_vu64(&mut r).map_err(codec::truncated(path))?;
        let dimension = codec::read_vu32(&mut r).map_err(codec::truncated(path))? as usize;
        let count = r.read_i32::<LittleEndian>().map_err(codec::truncated(path))?;
        if count < 0 {
            return Err(ReorderError::format(
                path,
                format!("negative vector count {count} for field {field_id}"),
            ));
        }

        let kind = r.read_u8().map_err(codec::truncated(path))?;
        let ordinal_map = match kind {
            KIND_DENSE => OrdinalMap::Dense,
            KIND_FORCED_DENSE => OrdinalMap::ForcedDense,
            KIND_EMPTY => OrdinalMap::Empty,
            KIND_SPARSE_SORTED => {
                let docs_offset = r.read_u64::<LittleEndian>().map_err(codec::truncated(path))?;
                let docs_length = r.read_u64::<LittleEndian>().map_err(codec::truncated(path))?;
                let ords_offset = r.read_u64::<LittleEndian>().map_err(codec::truncated(path))?;
                let ords_length = r.read_u64::<LittleEndian>().map_err(codec::truncated(path))?;
                let max_doc = r.read_u32::<LittleEndian>().map_err(codec::truncated(path))?;
                OrdinalMap::SparseSorted(SparseSections {
                    docs_offset,
                    docs_length,
                    ords_offset,
                    ords_length,
                    max_doc,
                })
            }
            other => {
                return Err(ReorderError::format(
                    path,
                    format!("unknown ordinal-map kind {other} for field {field_id}"),
                ));
            }
        };

        fields.push(FieldMeta {
            field_id,
            encoding,
            similarity,
            data_offset,
            data_length,
            dimension,
            count: count as usize,
            ordinal_map,
        });
    }

    debug!(file = %path.display(), fields = fields.len(), "read vector metadata");
    Ok(fields)
}

/// Write a metadata sidecar describing `fields`.
pub fn write_metadata(
    path: &Path,
    segment_id: &[u8; 16],
    suffix: &str,
    fields: &[FieldMeta],
) -> Result<()> {
    let mut out = AtomicFile::create(path)?;
    let mut w = ChecksumWriter::new(out.writer());
    codec::write_header(&mut w, META_CODEC, META_VERSION, segment_id, suffix)?;

    for field in fields {
        w.write_i32::<LittleEndian>(field.field_id)?;
        w.write_i32::<LittleEndian>(field.encoding)?;
        w.write_i32::<LittleEndian>(field.similarity)?;
        codec::write_vu64(&mut w, field.data_offset)?;
        codec::write_vu64(&mut w, field.data_length)?;
        codec::write_vu32(&mut w, field.dimension as u32)?;
        w.write_i32::<LittleEndian>(field.count as i32)?;
        match field.ordinal_map {
            OrdinalMap::Dense => w.write_u8(KIND_DENSE)?,
            OrdinalMap::ForcedDense => w.write_u8(KIND_FORCED_DENSE)?,
            OrdinalMap::Empty => w.write_u8(KIND_EMPTY)?,
            OrdinalMap::SparseSorted(s) => {
                w.write_u8(KIND_SPARSE_SORTED)?;
                w.write_u64::<LittleEndian>(s.docs_offset)?;
                w.write_u64::<LittleEndian>(s.docs_length)?;
                w.write_u64::<LittleEndian>(s.ords_offset)?;
                w.write_u64::<LittleEndian>(s.ords_length)?;
                w.write_u32::<LittleEndian>(s.max_doc)?;
            }
        }
    }
    w.write_i32::<LittleEndian>(-1)?;

    codec::write_footer(&mut w)?;
    drop(w);
    out.commit()
}

/// Build the reordered ordinal→document mapping.
///
/// `old_ord_to_doc` is `None` for a dense source (old ordinal == document
/// ID). The result follows the composition rule: the document at new
/// ordinal `i` is whatever document the old ordinal `perm.old_of(i)` held.
pub fn new_ord_to_doc(perm: &Permutation, old_ord_to_doc: Option<&[i32]>) -> Result<Vec<i32>> {
    if let Some(old) = old_ord_to_doc {
        if old.len() != perm.len() {
            return Err(ReorderError::Invariant(format!(
                "ordinal-to-document mapping has {} entries but permutation covers {}",
                old.len(),
                perm.len()
            )));
        }
    }
    Ok((0..perm.len())
        .map(|new_ord| {
            let old_ord = perm.old_of(new_ord);
            match old_ord_to_doc {
                Some(old) => old[old_ord],
                None => old_ord as i32,
            }
        })
        .collect())
}

/// Invert an ordinal→document mapping into document→ordinal.
///
/// Only valid when the document set is exactly `[0, n)`, which is the
/// forced-dense precondition; anything else must use the sparse-sorted
/// representation.
pub fn doc_to_ord(ord_to_doc: &[i32]) -> Result<Vec<i32>> {
    let n = ord_to_doc.len();
    let mut mapping = vec![-1i32; n];
    for (ord, &doc) in ord_to_doc.iter().enumerate() {
        if doc < 0 || doc as usize >= n {
            return Err(ReorderError::Invariant(format!(
                "document id {doc} outside the dense range [0, {n}); use the sparse-sorted mapping"
            )));
        }
        if mapping[doc as usize] != -1 {
            return Err(ReorderError::Invariant(format!(
                "document id {doc} mapped by more than one ordinal"
            )));
        }
        mapping[doc as usize] = ord as i32;
    }
    Ok(mapping)
}
