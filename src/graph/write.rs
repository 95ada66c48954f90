//! Serializer for the composite index file.
//!
//! Takes fully explicit arrays (no graph construction happens here) and
//! emits a file the [`layout`](super::layout) parser accepts. This is the
//! sink for the rebuild-from-scratch path and the fixture builder for
//! format tests.

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;
use std::path::Path;
use tracing::debug;

use super::layout::{
    IndexFamily, TAG_FLAT_BINARY, TAG_FLAT_IP, TAG_FLAT_L2, TAG_HNSW_BINARY, TAG_HNSW_FLAT,
    TAG_ID_MAP_BINARY, TAG_ID_MAP_FLOAT,
};
use crate::codec::{self, ChecksumWriter};
use crate::error::{ReorderError, Result};
use crate::storage::AtomicFile;

/// Everything needed to serialize one index file.
///
/// `levels[i]` is node `i`'s top level; its neighbor slot capacity is
/// `cum_degree[levels[i] + 1]`, and `neighbors` holds the concatenated
/// capacity-sized rows in ordinal order, `-1`-padded past the used slots.
#[derive(Debug, Clone)]
pub struct IndexFileSpec {
    pub family: IndexFamily,
    pub metric: i32,
    /// Vector dimensionality; bit dimensionality for the binary family.
    pub dimension: usize,
    pub assign_probas: Vec<f64>,
    pub cum_degree: Vec<i32>,
    pub levels: Vec<i32>,
    pub neighbors: Vec<i32>,
    pub entry_point: i32,
    pub max_level: i32,
    pub ef_construction: i32,
    pub ef_search: i32,
    /// Row-major storage bytes: little-endian f32 rows, or code bytes.
    pub data: Vec<u8>,
    pub id_mapping: Vec<i64>,
}

impl IndexFileSpec {
    fn row_bytes(&self) -> usize {
        match self.family {
            IndexFamily::Float => self.dimension * 4,
            IndexFamily::Binary => (self.dimension + 7) / 8,
        }
    }

    fn validate(&self) -> Result<()> {
        let n = self.levels.len();
        if self.id_mapping.len() != n {
            return Err(ReorderError::Invariant(format!(
                "id mapping has {} entries for {n} nodes",
                self.id_mapping.len()
            )));
        }
        if self.data.len() != n * self.row_bytes() {
            return Err(ReorderError::Invariant(format!(
                "storage holds {} bytes, expected {} rows of {} bytes",
                self.data.len(),
                n,
                self.row_bytes()
            )));
        }
        let mut slots = 0u64;
        for &level in &self.levels {
            let slot = level + 1;
            if slot < 0 || slot as usize >= self.cum_degree.len() {
                return Err(ReorderError::Invariant(format!(
                    "node level {level} outside cumulative degree table"
                )));
            }
            slots += self.cum_degree[slot as usize] as u64;
        }
        if self.neighbors.len() as u64 != slots {
            return Err(ReorderError::Invariant(format!(
                "neighbor array has {} entries, levels require {slots}",
                self.neighbors.len()
            )));
        }
        Ok(())
    }
}

/// Serialize `spec` to `path` through a temporary file.
pub fn write_index(path: &Path, spec: &IndexFileSpec) -> Result<()> {
    spec.validate()?;
    let n = spec.levels.len();

    let mut out = AtomicFile::create(path)?;
    let mut w = ChecksumWriter::new(out.writer());

    let (wrapper_tag, graph_tag, storage_tag) = match (spec.family, spec.metric) {
        (IndexFamily::Float, 0) => (TAG_ID_MAP_FLOAT, TAG_HNSW_FLAT, TAG_FLAT_IP),
        (IndexFamily::Float, _) => (TAG_ID_MAP_FLOAT, TAG_HNSW_FLAT, TAG_FLAT_L2),
        (IndexFamily::Binary, _) => (TAG_ID_MAP_BINARY, TAG_HNSW_BINARY, TAG_FLAT_BINARY),
    };

    w.write_all(&wrapper_tag)?;
    write_common_header(&mut w, spec, n)?;

    w.write_all(&graph_tag)?;
    write_common_header(&mut w, spec, n)?;

    w.write_i64::<LittleEndian>(spec.assign_probas.len() as i64)?;
    for &p in &spec.assign_probas {
        w.write_f64::<LittleEndian>(p)?;
    }

    w.write_i64::<LittleEndian>(spec.cum_degree.len() as i64)?;
    for &c in &spec.cum_degree {
        w.write_i32::<LittleEndian>(c)?;
    }

    w.write_i64::<LittleEndian>(n as i64)?;
    for &level in &spec.levels {
        w.write_i32::<LittleEndian>(level)?;
    }

    // Offsets are derived, not part of the spec: prefix sums of per-node
    // capacity.
    w.write_i64::<LittleEndian>(n as i64 + 1)?;
    let mut offset = 0i64;
    w.write_i64::<LittleEndian>(0)?;
    for &level in &spec.levels {
        offset += i64::from(spec.cum_degree[(level + 1) as usize]);
        w.write_i64::<LittleEndian>(offset)?;
    }

    w.write_i64::<LittleEndian>(spec.neighbors.len() as i64)?;
    for &id in &spec.neighbors {
        w.write_i32::<LittleEndian>(id)?;
    }

    w.write_i32::<LittleEndian>(spec.entry_point)?;
    w.write_i32::<LittleEndian>(spec.max_level)?;
    w.write_i32::<LittleEndian>(spec.ef_construction)?;
    w.write_i32::<LittleEndian>(spec.ef_search)?;
    w.write_i32::<LittleEndian>(0)?;

    w.write_all(&storage_tag)?;
    write_common_header(&mut w, spec, n)?;
    let elems = match spec.family {
        IndexFamily::Float => (n * spec.dimension) as i64,
        IndexFamily::Binary => spec.data.len() as i64,
    };
    w.write_i64::<LittleEndian>(elems)?;
    w.write_all(&spec.data)?;

    w.write_i64::<LittleEndian>(n as i64)?;
    for &id in &spec.id_mapping {
        w.write_i64::<LittleEndian>(id)?;
    }

    codec::write_footer(&mut w)?;
    drop(w);
    out.commit()?;
    debug!(file = %path.display(), count = n, "wrote index file");
    Ok(())
}

fn write_common_header<W: Write>(
    w: &mut W,
    spec: &IndexFileSpec,
    count: usize,
) -> std::io::Result<()> {
    match spec.family {
        IndexFamily::Float => {
            w.write_u32::<LittleEndian>(spec.dimension as u32)?;
            w.write_u64::<LittleEndian>(count as u64)?;
            w.write_u64::<LittleEndian>(0)?;
            w.write_u64::<LittleEndian>(0)?;
            w.write_u8(1)?;
            w.write_i32::<LittleEndian>(spec.metric)
        }
        IndexFamily::Binary => {
            w.write_u32::<LittleEndian>(spec.dimension as u32)?;
            w.write_u32::<LittleEndian>(((spec.dimension + 7) / 8) as u32)?;
            w.write_u64::<LittleEndian>(count as u64)?;
            w.write_u8(1)?;
            w.write_i32::<LittleEndian>(spec.metric)
        }
    }
}
