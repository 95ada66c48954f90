//! Segment reorder orchestration.
//!
//! Ties the pieces together for one field of one segment: verify the
//! input files, load the vectors, compute a permutation, then rewrite the
//! index, data, and metadata files side by side in a destination
//! directory. Inputs are never modified; every output appears at its
//! final path only after its checksum is written.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::codec;
use crate::error::{ReorderError, Result};
use crate::flat::meta::{self, FieldMeta, OrdinalMap, SparseSections};
use crate::flat::{data, docmap, VectorReader};
use crate::graph::{permute_index, IndexLayout};
use crate::permutation::Permutation;
use crate::quantization::{self, OneBitState};
use crate::storage;

/// Computes the new vector order for a field.
///
/// Implementations must return a valid permutation over exactly `count`
/// ordinals; callers validate nothing beyond what [`Permutation`] itself
/// enforces.
pub trait PermutationSource {
    fn permutation(&self, vectors: &[f32], count: usize, dimension: usize)
        -> Result<Permutation>;
}

/// Builds a fresh index file from pre-encoded rows.
///
/// Seam for the quantized rebuild path, where permuting the existing file
/// is not enough because the codes themselves must be re-emitted.
pub trait IndexBuilder {
    fn build(
        &self,
        dst: &Path,
        codes: &[Vec<u8>],
        id_mapping: &[i64],
        params: &GraphParams,
    ) -> Result<()>;
}

/// Graph construction parameters recovered from an existing index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphParams {
    /// Max connections per node above level 0; level 0 allows double.
    pub m: i32,
    pub ef_construction: i32,
    pub ef_search: i32,
}

impl GraphParams {
    pub fn from_layout(layout: &IndexLayout) -> Result<Self> {
        // Level-0 capacity is 2 * m.
        let level0 = layout.cum_degree.get(1).copied().ok_or_else(|| {
            ReorderError::Invariant("cumulative degree array has no level 0".to_string())
        })?;
        Ok(Self {
            m: level0 / 2,
            ef_construction: layout.ef_construction,
            ef_search: layout.ef_search,
        })
    }
}

/// How to record the ordinal→document mapping after a reorder breaks the
/// dense equivalence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingStrategy {
    /// Declare dense in the primary metadata and write the truth to the
    /// auxiliary sidecar. Only valid when the document set is `[0, n)`.
    ForcedDense,
    /// Append the self-contained bitset + ordinal structures to the data
    /// file.
    SparseSorted,
}

/// The files making up one segment's vector artifacts.
#[derive(Debug, Clone)]
pub struct SegmentFiles {
    pub index: PathBuf,
    pub data: PathBuf,
    pub meta: PathBuf,
    /// Document→ordinal sidecar, present when a previous reorder chose
    /// the forced-dense strategy.
    pub docmap: Option<PathBuf>,
    /// Quantization state sidecar, present for quantized fields.
    pub qstate: Option<PathBuf>,
    pub segment_id: [u8; 16],
    pub suffix: String,
}

impl SegmentFiles {
    fn dst(&self, dst_dir: &Path, src: &Path) -> Result<PathBuf> {
        let name = src.file_name().ok_or_else(|| {
            ReorderError::Invariant(format!("{} has no file name", src.display()))
        })?;
        Ok(dst_dir.join(name))
    }
}

/// What a reorder pass produced.
#[derive(Debug)]
pub struct ReorderReport {
    pub field_id: i32,
    pub count: usize,
    /// Mapping representation recorded in the rewritten metadata.
    pub ordinal_map: OrdinalMap,
    /// Auxiliary sidecar written for the forced-dense strategy.
    pub docmap: Option<PathBuf>,
    /// Graph construction parameters recovered from the source index,
    /// for callers that rebuild instead of permute.
    pub graph_params: GraphParams,
}

/// Reorder one field of a segment into `dst_dir`.
///
/// Every input checksum is verified before any output is created. The
/// permutation from `source` drives three rewrites that must agree: the
/// index file (graph and storage rows), the data file (float rows), and
/// the metadata (ordinal→document mapping, degraded per `strategy` when
/// the result is no longer the identity).
pub fn reorder_segment(
    files: &SegmentFiles,
    dst_dir: &Path,
    field_id: i32,
    source: &dyn PermutationSource,
    strategy: MappingStrategy,
) -> Result<ReorderReport> {
    codec::verify_file_footer(&files.index)?;
    codec::verify_file_footer(&files.data)?;
    codec::verify_file_footer(&files.meta)?;
    if let Some(qstate) = &files.qstate {
        codec::verify_file_footer(qstate)?;
    }

    let mut fields = meta::read_metadata(&files.meta)?;
    let field_pos = fields
        .iter()
        .position(|f| f.field_id == field_id)
        .ok_or_else(|| {
            ReorderError::format(&files.meta, format!("no field {field_id} in metadata"))
        })?;
    let field = fields[field_pos].clone();

    if matches!(field.ordinal_map, OrdinalMap::Empty) || field.count == 0 {
        warn!(field = field_id, "field has no vectors; nothing to reorder");
        return Err(ReorderError::Invariant(format!(
            "field {field_id} has no vectors to reorder"
        )));
    }

    let mut reader = VectorReader::open(&files.data, &field)?;
    let vectors = reader.load_all()?;
    let perm = source.permutation(&vectors, field.count, field.dimension)?;
    if perm.len() != field.count {
        return Err(ReorderError::Invariant(format!(
            "permutation covers {} items but field holds {}",
            perm.len(),
            field.count
        )));
    }

    let old_ord_to_doc = load_ord_to_doc(files, &field)?;
    let new_map = meta::new_ord_to_doc(&perm, old_ord_to_doc.as_deref())?;

    let dst_index = files.dst(dst_dir, &files.index)?;
    let layout = permute_index(&files.index, &dst_index, &perm)?;
    let graph_params = GraphParams::from_layout(&layout)?;

    // A mapping that is still the identity needs no degradation.
    let still_dense = new_map
        .iter()
        .enumerate()
        .all(|(ord, &doc)| doc == ord as i32);

    let dst_data = files.dst(dst_dir, &files.data)?;
    let (ordinal_map, docmap_path) = if still_dense {
        data::write_reordered(&files.data, &dst_data, &field, &perm, None)?;
        (OrdinalMap::Dense, None)
    } else {
        match strategy {
            MappingStrategy::ForcedDense => {
                let doc_to_ord = meta::doc_to_ord(&new_map)?;
                data::write_reordered(&files.data, &dst_data, &field, &perm, None)?;
                let dst_docmap = dst_dir.join(docmap_file_name(&files.data)?);
                docmap::write(&dst_docmap, &files.segment_id, &files.suffix, &doc_to_ord)?;
                (OrdinalMap::ForcedDense, Some(dst_docmap))
            }
            MappingStrategy::SparseSorted => {
                let sections =
                    data::write_reordered(&files.data, &dst_data, &field, &perm, Some(&new_map))?
                        .ok_or_else(|| {
                            ReorderError::Invariant(
                                "sparse rewrite produced no sections".to_string(),
                            )
                        })?;
                (OrdinalMap::SparseSorted(sections), None)
            }
        }
    };

    fields[field_pos].ordinal_map = ordinal_map;
    let dst_meta = files.dst(dst_dir, &files.meta)?;
    meta::write_metadata(&dst_meta, &files.segment_id, &files.suffix, &fields)?;

    // Quantization thresholds are order-independent; the sidecar carries
    // forward byte-identical, through a temporary like every other output.
    if let Some(qstate) = &files.qstate {
        storage::atomic_copy(qstate, &files.dst(dst_dir, qstate)?)?;
    }

    info!(
        field = field_id,
        count = field.count,
        dense = still_dense,
        "reordered segment field"
    );
    Ok(ReorderReport {
        field_id,
        count: field.count,
        ordinal_map,
        docmap: docmap_path,
        graph_params,
    })
}

/// Re-encode vectors in permuted order and hand them to `builder`.
///
/// Used when the field is quantized and the stored codes must be emitted
/// fresh rather than byte-moved: each row is encoded from the float
/// source, and the external-ID array is composed with the permutation so
/// new ordinal `i` keeps the ID old ordinal `perm.old_of(i)` held.
pub fn rebuild_quantized(
    dst: &Path,
    vectors: &[f32],
    perm: &Permutation,
    old_mapping: &[i64],
    state: &OneBitState,
    builder: &dyn IndexBuilder,
    params: &GraphParams,
) -> Result<()> {
    let dimension = state.dimension();
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

    let mut codes = Vec::with_capacity(count);
    for new_ord in 0..count {
        let old_ord = perm.old_of(new_ord);
        let row = &vectors[old_ord * dimension..(old_ord + 1) * dimension];
        codes.push(quantization::encode(row, state)?);
    }
    let composed = perm.compose_mapping(old_mapping)?;
    builder.build(dst, &codes, &composed, params)
}

fn load_ord_to_doc(files: &SegmentFiles, field: &FieldMeta) -> Result<Option<Vec<i32>>> {
    match field.ordinal_map {
        OrdinalMap::Dense => Ok(None),
        OrdinalMap::Empty => Ok(None),
        OrdinalMap::ForcedDense => {
            let path = files.docmap.as_ref().ok_or_else(|| {
                ReorderError::Invariant(format!(
                    "field {} declares a forced-dense mapping but no sidecar was supplied",
                    field.field_id
                ))
            })?;
            let doc_to_ord = docmap::read(path)?;
            let mut ord_to_doc = vec![-1i32; doc_to_ord.len()];
            for (doc, &ord) in doc_to_ord.iter().enumerate() {
                if ord < 0 || ord as usize >= ord_to_doc.len() {
                    return Err(ReorderError::format(
                        path,
                        format!("ordinal {ord} out of range for document {doc}"),
                    ));
                }
                ord_to_doc[ord as usize] = doc as i32;
            }
            Ok(Some(ord_to_doc))
        }
        OrdinalMap::SparseSorted(sections) => {
            Ok(Some(load_sparse_ord_to_doc(&files.data, &sections, field.count)?))
        }
    }
}

/// Materialize the full ordinal→document mapping from the sparse-sorted
/// sections of a data file.
fn load_sparse_ord_to_doc(
    path: &Path,
    sections: &SparseSections,
    count: usize,
) -> Result<Vec<i32>> {
    use byteorder::{LittleEndian, ReadBytesExt};

    let mut reader = storage::open_read(path)?;
    reader.seek(SeekFrom::Start(sections.docs_offset))?;
    let mut bitset = vec![0u8; sections.docs_length as usize];
    reader
        .read_exact(&mut bitset)
        .map_err(codec::truncated(path))?;

    reader.seek(SeekFrom::Start(sections.ords_offset))?;
    let mut ords = vec![0i32; (sections.ords_length / 4) as usize];
    reader
        .read_i32_into::<LittleEndian>(&mut ords)
        .map_err(codec::truncated(path))?;

    let mut ord_to_doc = vec![-1i32; count];
    let mut rank = 0usize;
    for doc in 0..=sections.max_doc as usize {
        if bitset[doc / 8] & (1 << (doc % 8)) != 0 {
            let ord = *ords.get(rank).ok_or_else(|| {
                ReorderError::format(path, "bitset population exceeds ordinal array")
            })?;
            if ord < 0 || ord as usize >= count {
                return Err(ReorderError::format(
                    path,
                    format!("ordinal {ord} out of range for {count} vectors"),
                ));
            }
            ord_to_doc[ord as usize] = doc as i32;
            rank += 1;
        }
    }
    if rank != ords.len() {
        return Err(ReorderError::format(
            path,
            format!("{} ordinals stored but {rank} documents present", ords.len()),
        ));
    }
    Ok(ord_to_doc)
}

fn docmap_file_name(data: &Path) -> Result<std::ffi::OsString> {
    let stem = data.file_stem().ok_or_else(|| {
        ReorderError::Invariant(format!("{} has no file name", data.display()))
    })?;
    let mut name = stem.to_os_string();
    name.push(".vord");
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flat::data::write_fresh;
    use crate::flat::meta::write_metadata;

    #[test]
    fn sparse_mapping_round_trips_through_data_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.vdata");
        let dst = dir.path().join("dst.vdata");
        let vectors: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let (off, len) =
            write_fresh(&src, &[0; 16], "", &vectors, 2, &Permutation::identity(4)).unwrap();
        let field = FieldMeta {
            field_id: 0,
            encoding: 0,
            similarity: 1,
            data_offset: off,
            data_length: len,
            dimension: 2,
            count: 4,
            ordinal_map: OrdinalMap::Dense,
        };

        let perm = Permutation::new(vec![3, 1, 0, 2]).unwrap();
        let new_map = meta::new_ord_to_doc(&perm, None).unwrap();
        let sections = data::write_reordered(&src, &dst, &field, &perm, Some(&new_map))
            .unwrap()
            .unwrap();

        let loaded = load_sparse_ord_to_doc(&dst, &sections, 4).unwrap();
        assert_eq!(loaded, new_map);
    }

    #[test]
    fn forced_dense_requires_sidecar_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let meta_path = dir.path().join("seg.vmeta");
        let field = FieldMeta {
            field_id: 7,
            encoding: 0,
            similarity: 1,
            data_offset: 0,
            data_length: 16,
            dimension: 2,
            count: 2,
            ordinal_map: OrdinalMap::ForcedDense,
        };
        write_metadata(&meta_path, &[0; 16], "", std::slice::from_ref(&field)).unwrap();

        let files = SegmentFiles {
            index: dir.path().join("seg.faiss"),
            data: dir.path().join("seg.vdata"),
            meta: meta_path,
            docmap: None,
            qstate: None,
            segment_id: [0; 16],
            suffix: String::new(),
        };
        assert!(load_ord_to_doc(&files, &field).is_err());
    }

    #[test]
    fn quantized_rebuild_composes_ids_and_encodes_in_new_order() {
        struct Capture(std::cell::RefCell<(Vec<Vec<u8>>, Vec<i64>)>);
        impl IndexBuilder for Capture {
            fn build(
                &self,
                _dst: &Path,
                codes: &[Vec<u8>],
                id_mapping: &[i64],
                _params: &GraphParams,
            ) -> Result<()> {
                *self.0.borrow_mut() = (codes.to_vec(), id_mapping.to_vec());
                Ok(())
            }
        }

        let state = OneBitState {
            quantizer_type: 0,
            random_rotation: false,
            adc: false,
            thresholds: vec![0.0, 0.0],
            rotation: None,
        };
        // Rows: [1,1] -> 0b11000000, [-1,1] -> 0b01000000, [1,-1] -> 0b10000000.
        let vectors = [1.0, 1.0, -1.0, 1.0, 1.0, -1.0];
        let perm = Permutation::new(vec![2, 0, 1]).unwrap();
        let params = GraphParams {
            m: 16,
            ef_construction: 100,
            ef_search: 100,
        };

        let capture = Capture(std::cell::RefCell::new((Vec::new(), Vec::new())));
        rebuild_quantized(
            Path::new("unused"),
            &vectors,
            &perm,
            &[10, 11, 12],
            &state,
            &capture,
            &params,
        )
        .unwrap();

        let (codes, ids) = capture.0.into_inner();
        assert_eq!(codes, vec![vec![0b1000_0000], vec![0b1100_0000], vec![0b0100_0000]]);
        assert_eq!(ids, vec![12, 10, 11]);
    }
}
