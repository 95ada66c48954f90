//! Binary layout parser for the composite index file.
//!
//! Walks the file strictly top-down, recording the byte offset of every
//! section boundary and the scalar graph metadata, without allocating
//! anything proportional to vector data. The result is an immutable
//! [`IndexLayout`] that downstream components only read; rewrites always
//! stream a new file.
//!
//! File shape (all scalars little-endian):
//!
//! ```text
//! tag[4]                      IxMp (float) | IBMp (binary)
//! common header               family-specific widths
//!   tag[4]                    IHNf | IHNs (float) | IBHf (binary)
//!   common header
//!   assign probas             i64 count + f64[count]
//!   cumulative degrees        i64 count + i32[count]
//!   levels                    i64 count + i32[count]       (count = n)
//!   neighbor offsets          i64 count + i64[count]       (count = n + 1)
//!   neighbor ids              i64 count + i32[count]
//!   entry, max level, ef construction, ef search, reserved   i32 each
//!     tag[4]                  IxF2 | IxFI | IxSQ (float) | IBxF (binary)
//!     common header
//!     element count           i64
//!     row-major data          f32 rows | code bytes
//! external ids                i64 count + i64[count]
//! footer                      magic + algorithm + crc32
//! ```

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

use crate::codec::{self, FOOTER_LEN};
use crate::error::{ReorderError, Result};
use crate::storage;

pub(crate) const TAG_ID_MAP_FLOAT: [u8; 4] = *b"IxMp";
pub(crate) const TAG_ID_MAP_BINARY: [u8; 4] = *b"IBMp";
pub(crate) const TAG_HNSW_FLAT: [u8; 4] = *b"IHNf";
pub(crate) const TAG_HNSW_SQ: [u8; 4] = *b"IHNs";
pub(crate) const TAG_HNSW_BINARY: [u8; 4] = *b"IBHf";
pub(crate) const TAG_FLAT_L2: [u8; 4] = *b"IxF2";
pub(crate) const TAG_FLAT_IP: [u8; 4] = *b"IxFI";
pub(crate) const TAG_FLAT_SQ: [u8; 4] = *b"IxSQ";
pub(crate) const TAG_FLAT_BINARY: [u8; 4] = *b"IBxF";

/// Top-level index family, from the outermost type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFamily {
    /// ID-map wrapper over float rows.
    Float,
    /// ID-map wrapper over fixed-width binary codes.
    Binary,
}

/// Nested graph family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFamily {
    FloatFlat,
    ScalarQuantized,
    BinaryFlat,
}

/// Innermost flat-storage family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFamily {
    FlatL2,
    FlatInnerProduct,
    FlatScalarQuantized,
    BinaryFlat,
}

/// Common header shared by every nesting level, with family-specific
/// field widths.
#[derive(Debug, Clone, Copy)]
struct CommonHeader {
    dimension: u32,
    count: u64,
    code_size: Option<u32>,
    metric: i32,
}

/// Parsed, immutable description of one index file's byte regions.
#[derive(Debug, Clone)]
pub struct IndexLayout {
    pub family: IndexFamily,
    pub graph_family: GraphFamily,
    pub storage_family: StorageFamily,

    /// Vector dimensionality (bit dimensionality for the binary family).
    pub dimension: usize,
    /// Number of stored vectors.
    pub count: usize,
    /// Bytes per stored row: `dimension * 4` for floats, the declared code
    /// size for binary codes.
    pub row_bytes: usize,
    /// Metric code as stored; opaque to the permuter.
    pub metric: i32,

    // Section boundaries, absolute byte offsets.
    pub header_end: u64,
    pub graph_header_end: u64,
    pub assign_probas_end: u64,
    pub cum_degree_end: u64,
    pub levels_start: u64,
    pub levels_end: u64,
    pub offsets_start: u64,
    pub offsets_end: u64,
    pub neighbors_start: u64,
    pub neighbors_end: u64,
    pub params_end: u64,
    pub storage_start: u64,
    /// Start of the raw row data within the storage section.
    pub data_start: u64,
    pub storage_end: u64,
    pub id_map_start: u64,
    pub footer_start: u64,
    pub file_end: u64,

    /// Cumulative neighbor capacity per level: a node at level `l` owns
    /// `cum_degree[l + 1]` neighbor slots.
    pub cum_degree: Vec<i32>,
    pub entry_point: i32,
    pub max_level: i32,
    pub ef_construction: i32,
    pub ef_search: i32,
}

impl IndexLayout {
    /// Parse the layout of the index file at `path`.
    pub fn parse_file(path: &Path) -> Result<Self> {
        let mut reader = storage::open_read(path)?;
        Self::parse(&mut reader, path)
    }

    /// Parse the layout from a seekable reader.
    ///
    /// `file` is only used to label errors.
    pub fn parse<R: Read + Seek>(r: &mut R, file: &Path) -> Result<Self> {
        let file_end = r.seek(SeekFrom::End(0))?;
        r.seek(SeekFrom::Start(0))?;

        let family = match read_tag(r, file)? {
            TAG_ID_MAP_FLOAT => IndexFamily::Float,
            TAG_ID_MAP_BINARY => IndexFamily::Binary,
            tag => return Err(unexpected_tag(file, "id-map wrapper", tag)),
        };
        let outer = read_common_header(r, file, family)?;
        let header_end = r.stream_position()?;

        let graph_family = match (family, read_tag(r, file)?) {
            (IndexFamily::Float, TAG_HNSW_FLAT) => GraphFamily::FloatFlat,
            (IndexFamily::Float, TAG_HNSW_SQ) => GraphFamily::ScalarQuantized,
            (IndexFamily::Binary, TAG_HNSW_BINARY) => GraphFamily::BinaryFlat,
            (_, tag) => return Err(unexpected_tag(file, "graph", tag)),
        };
        let graph = read_common_header(r, file, family)?;
        if graph.dimension != outer.dimension || graph.count != outer.count {
            return Err(ReorderError::format(
                file,
                format!(
                    "graph header disagrees with wrapper: dim {} vs {}, count {} vs {}",
                    graph.dimension, outer.dimension, graph.count, outer.count
                ),
            ));
        }
        let graph_header_end = r.stream_position()?;

        let n = usize::try_from(outer.count)
            .map_err(|_| ReorderError::format(file, "item count does not fit in memory"))?;

        // assign probas: shape metadata, skipped but bounded.
        let probas_count = read_len(r, file, "assign probas")?;
        r.seek(SeekFrom::Current(probas_count as i64 * 8))?;
        let assign_probas_end = r.stream_position()?;

        let cum_count = read_len(r, file, "cumulative degrees")?;
        // Bound before allocating: a corrupt count must fail as a format
        // error, not an allocation abort.
        let remaining = file_end.saturating_sub(r.stream_position()?);
        if cum_count.saturating_mul(4) > remaining {
            return Err(ReorderError::format(
                file,
                format!("cumulative degree count {cum_count} overruns file of {file_end} bytes"),
            ));
        }
        let mut cum_degree = vec![0i32; cum_count as usize];
        r.read_i32_into::<LittleEndian>(&mut cum_degree)
            .map_err(codec::truncated(file))?;
        let cum_degree_end = r.stream_position()?;

        let levels_start = cum_degree_end;
        let levels_count = read_len(r, file, "levels")?;
        if levels_count != outer.count {
            return Err(ReorderError::format(
                file,
                format!("levels array has {levels_count} entries for {n} vectors"),
            ));
        }
        r.seek(SeekFrom::Current(levels_count as i64 * 4))?;
        let levels_end = r.stream_position()?;

        let offsets_start = levels_end;
        let offsets_count = read_len(r, file, "neighbor offsets")?;
        if offsets_count != outer.count + 1 {
            return Err(ReorderError::format(
                file,
                format!("offset array has {offsets_count} entries for {n} vectors"),
            ));
        }
        r.seek(SeekFrom::Current(offsets_count as i64 * 8))?;
        let offsets_end = r.stream_position()?;

        let neighbors_start = offsets_end;
        let neighbors_count = read_len(r, file, "neighbor ids")?;
        r.seek(SeekFrom::Current(neighbors_count as i64 * 4))?;
        let neighbors_end = r.stream_position()?;

        let entry_point = r.read_i32::<LittleEndian>().map_err(codec::truncated(file))?;
        let max_level = r.read_i32::<LittleEndian>().map_err(codec::truncated(file))?;
        let ef_construction = r.read_i32::<LittleEndian>().map_err(codec::truncated(file))?;
        let ef_search = r.read_i32::<LittleEndian>().map_err(codec::truncated(file))?;
        let _reserved = r.read_i32::<LittleEndian>().map_err(codec::truncated(file))?;
        let params_end = r.stream_position()?;

        let storage_start = params_end;
        let storage_family = match (family, read_tag(r, file)?) {
            (IndexFamily::Float, TAG_FLAT_L2) => StorageFamily::FlatL2,
            (IndexFamily::Float, TAG_FLAT_IP) => StorageFamily::FlatInnerProduct,
            (IndexFamily::Float, TAG_FLAT_SQ) => StorageFamily::FlatScalarQuantized,
            (IndexFamily::Binary, TAG_FLAT_BINARY) => StorageFamily::BinaryFlat,
            (_, tag) => return Err(unexpected_tag(file, "flat storage", tag)),
        };
        let inner = read_common_header(r, file, family)?;
        if inner.dimension != outer.dimension || inner.count != outer.count {
            return Err(ReorderError::format(
                file,
                format!(
                    "storage header disagrees with wrapper: dim {} vs {}, count {} vs {}",
                    inner.dimension, outer.dimension, inner.count, outer.count
                ),
            ));
        }

        let row_bytes = match family {
            IndexFamily::Float => outer.dimension as usize * 4,
            IndexFamily::Binary => {
                let code_size = outer.code_size.unwrap_or(0) as usize;
                if code_size != (outer.dimension as usize + 7) / 8 {
                    return Err(ReorderError::format(
                        file,
                        format!(
                            "code size {code_size} inconsistent with {} bit dimensions",
                            outer.dimension
                        ),
                    ));
                }
                code_size
            }
        };

        let elems = read_len(r, file, "storage elements")?;
        let expected_elems = match family {
            IndexFamily::Float => outer.count * u64::from(outer.dimension),
            IndexFamily::Binary => outer.count * row_bytes as u64,
        };
        if elems != expected_elems {
            return Err(ReorderError::format(
                file,
                format!("storage holds {elems} elements, expected {expected_elems}"),
            ));
        }
        let elem_bytes = match family {
            IndexFamily::Float => elems * 4,
            IndexFamily::Binary => elems,
        };
        let data_start = r.stream_position()?;
        r.seek(SeekFrom::Current(elem_bytes as i64))?;
        let storage_end = r.stream_position()?;

        let id_map_start = storage_end;
        let id_count = read_len(r, file, "external ids")?;
        if id_count != outer.count {
            return Err(ReorderError::format(
                file,
                format!("external-id array has {id_count} entries for {n} vectors"),
            ));
        }
        r.seek(SeekFrom::Current(id_count as i64 * 8))?;
        let footer_start = r.stream_position()?;

        if footer_start + FOOTER_LEN != file_end {
            return Err(ReorderError::format(
                file,
                format!(
                    "trailing bytes: footer expected at {}, file ends at {file_end}",
                    footer_start
                ),
            ));
        }

        debug!(
            file = %file.display(),
            ?family,
            dimension = outer.dimension,
            count = n,
            neighbors = neighbors_count,
            max_level,
            "parsed index layout"
        );

        Ok(IndexLayout {
            family,
            graph_family,
            storage_family,
            dimension: outer.dimension as usize,
            count: n,
            row_bytes,
            metric: outer.metric,
            header_end,
            graph_header_end,
            assign_probas_end,
            cum_degree_end,
            levels_start,
            levels_end,
            offsets_start,
            offsets_end,
            neighbors_start,
            neighbors_end,
            params_end,
            storage_start,
            data_start,
            storage_end,
            id_map_start,
            footer_start,
            file_end,
            cum_degree,
            entry_point,
            max_level,
            ef_construction,
            ef_search,
        })
    }

    /// Neighbor slot capacity of a node at `level`.
    pub fn capacity_at_level(&self, level: i32) -> Result<u64> {
        let slot = level
            .checked_add(1)
            .filter(|&l| l >= 0 && (l as usize) < self.cum_degree.len());
        match slot {
            Some(l) => Ok(self.cum_degree[l as usize] as u64),
            None => Err(ReorderError::Invariant(format!(
                "node level {level} outside cumulative degree table of {} entries",
                self.cum_degree.len()
            ))),
        }
    }
}

/// Read the external-ID array from the index file at `path`.
///
/// `mapping[ordinal] = external document id`.
pub fn read_id_mapping(path: &Path) -> Result<Vec<i64>> {
    let layout = IndexLayout::parse_file(path)?;
    let mut reader = storage::open_read(path)?;
    reader.seek(SeekFrom::Start(layout.id_map_start))?;
    let count = reader
        .read_u64::<LittleEndian>()
        .map_err(codec::truncated(path))?;
    let mut mapping = vec![0i64; count as usize];
    reader
        .read_i64_into::<LittleEndian>(&mut mapping)
        .map_err(codec::truncated(path))?;
    Ok(mapping)
}

fn read_tag<R: Read>(r: &mut R, file: &Path) -> Result<[u8; 4]> {
    let mut tag = [0u8; 4];
    r.read_exact(&mut tag).map_err(codec::truncated(file))?;
    Ok(tag)
}

fn read_common_header<R: Read>(r: &mut R, file: &Path, family: IndexFamily) -> Result<CommonHeader> {
    let err = codec::truncated(file);
    match family {
        IndexFamily::Float => {
            let dimension = r.read_u32::<LittleEndian>().map_err(&err)?;
            let count = r.read_u64::<LittleEndian>().map_err(&err)?;
            let _reserved0 = r.read_u64::<LittleEndian>().map_err(&err)?;
            let _reserved1 = r.read_u64::<LittleEndian>().map_err(&err)?;
            let _trained = r.read_u8().map_err(&err)?;
            let metric = r.read_i32::<LittleEndian>().map_err(&err)?;
            Ok(CommonHeader {
                dimension,
                count,
                code_size: None,
                metric,
            })
        }
        IndexFamily::Binary => {
            let dimension = r.read_u32::<LittleEndian>().map_err(&err)?;
            let code_size = r.read_u32::<LittleEndian>().map_err(&err)?;
            let count = r.read_u64::<LittleEndian>().map_err(&err)?;
            let _trained = r.read_u8().map_err(&err)?;
            let metric = r.read_i32::<LittleEndian>().map_err(&err)?;
            Ok(CommonHeader {
                dimension,
                count,
                code_size: Some(code_size),
                metric,
            })
        }
    }
}

fn read_len<R: Read>(r: &mut R, file: &Path, what: &str) -> Result<u64> {
    let v = r.read_i64::<LittleEndian>().map_err(codec::truncated(file))?;
    u64::try_from(v)
        .map_err(|_| ReorderError::format(file, format!("negative {what} count {v}")))
}

fn unexpected_tag(file: &Path, section: &str, tag: [u8; 4]) -> ReorderError {
    ReorderError::format(
        file,
        format!(
            "unexpected {section} type tag {:?}",
            String::from_utf8_lossy(&tag)
        ),
    )
}
