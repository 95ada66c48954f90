//! Index permuter: rewrite every section of a composite index file under
//! a validated permutation.
//!
//! The output is the same family and the same size-class as the source;
//! only row order and ID values change. In file order:
//!
//! 1. header bytes through the cumulative-degree array copy unchanged
//!    (aggregate graph shape is permutation-invariant);
//! 2. the per-node level array is permuted;
//! 3. the neighbor-offset array is rebuilt from the permuted levels —
//!    per-node capacity is `cum_degree[level + 1]`, so the array is only
//!    byte-stable under a permutation that preserves each ordinal's
//!    level;
//! 4. each node's neighbor row moves with it, with every stored ID
//!    translated through the inverse permutation (negative sentinels pass
//!    through);
//! 5. the entry point is translated the same way;
//! 6. storage rows are permuted row-major;
//! 7. the external-ID array is composed with the permutation;
//! 8. the footer is recomputed over the newly written bytes.
//!
//! The source file is never modified; the destination only appears at its
//! final path on success.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, info};

use super::layout::IndexLayout;
use crate::codec::{self, ChecksumWriter};
use crate::error::{ReorderError, Result};
use crate::permutation::Permutation;
use crate::storage::{self, AtomicFile};

/// Permute the index file at `src` into `dst`.
///
/// The external-ID array is row-reordered: the stored mapping is composed
/// with `perm`, so `new_ids[new_ord] = stored_ids[perm.old_of(new_ord)]`.
pub fn permute_index(src: &Path, dst: &Path, perm: &Permutation) -> Result<IndexLayout> {
    permute_inner(src, dst, perm, None)
}

/// Permute the index file at `src` into `dst`, writing a caller-supplied
/// pre-existing external-ID mapping composed with the permutation instead
/// of the one stored in the file.
pub fn permute_index_with_mapping(
    src: &Path,
    dst: &Path,
    perm: &Permutation,
    old_mapping: &[i64],
) -> Result<IndexLayout> {
    permute_inner(src, dst, perm, Some(old_mapping))
}

fn permute_inner(
    src: &Path,
    dst: &Path,
    perm: &Permutation,
    old_mapping: Option<&[i64]>,
) -> Result<IndexLayout> {
    let layout = IndexLayout::parse_file(src)?;
    let n = layout.count;

    // Everything that can be rejected is rejected before the destination
    // exists.
    if perm.len() != n {
        return Err(ReorderError::Invariant(format!(
            "permutation covers {} items but index holds {n}",
            perm.len()
        )));
    }
    if let Some(mapping) = old_mapping {
        if mapping.len() != n {
            return Err(ReorderError::Invariant(format!(
                "supplied id mapping has {} entries but index holds {n}",
                mapping.len()
            )));
        }
    }
    let inverse = perm.inverse();

    let mut reader = storage::open_read(src)?;

    // Graph metadata is loaded whole; it is proportional to node count,
    // never to vector data.
    let levels = read_i32_section(&mut reader, src, layout.levels_start, n)?;
    let old_offsets = read_i64_section(&mut reader, src, layout.offsets_start, n + 1)?;
    for (ord, pair) in old_offsets.windows(2).enumerate() {
        let capacity = layout.capacity_at_level(levels[ord])? as i64;
        if pair[1] - pair[0] != capacity {
            return Err(ReorderError::format(
                src,
                format!(
                    "offset span {} for node {ord} disagrees with level {} capacity {capacity}",
                    pair[1] - pair[0],
                    levels[ord]
                ),
            ));
        }
    }
    let total_slots = old_offsets[n] as usize;
    let stored_slots = (layout.neighbors_end - layout.neighbors_start - 8) / 4;
    if stored_slots != total_slots as u64 {
        return Err(ReorderError::format(
            src,
            format!("neighbor array holds {stored_slots} slots, offsets require {total_slots}"),
        ));
    }
    let neighbors = read_i32_section(&mut reader, src, layout.neighbors_start, total_slots)?;

    reader.seek(SeekFrom::Start(layout.neighbors_end + 16))?;
    let reserved = reader
        .read_i32::<LittleEndian>()
        .map_err(codec::truncated(src))?;

    let stored_mapping;
    let effective_mapping: &[i64] = match old_mapping {
        Some(mapping) => mapping,
        None => {
            stored_mapping = read_i64_section(&mut reader, src, layout.id_map_start, n)?;
            &stored_mapping
        }
    };

    let mut out = AtomicFile::create(dst)?;
    let mut w = ChecksumWriter::new(out.writer());

    // 1. prefix: wrapper header, graph header, assign probas, cumulative
    // degrees.
    copy_range(&mut reader, &mut w, 0, layout.cum_degree_end)?;

    // 2. levels.
    w.write_i64::<LittleEndian>(n as i64)?;
    for new_ord in 0..n {
        w.write_i32::<LittleEndian>(levels[perm.old_of(new_ord)])?;
    }

    // 3. offsets, rebuilt from the permuted levels.
    w.write_i64::<LittleEndian>(n as i64 + 1)?;
    let mut offset = 0i64;
    w.write_i64::<LittleEndian>(0)?;
    for new_ord in 0..n {
        offset += layout.capacity_at_level(levels[perm.old_of(new_ord)])? as i64;
        w.write_i64::<LittleEndian>(offset)?;
    }

    // 4. neighbor rows, moved and remapped.
    w.write_i64::<LittleEndian>(total_slots as i64)?;
    for new_ord in 0..n {
        let old_ord = perm.old_of(new_ord);
        let row = &neighbors[old_offsets[old_ord] as usize..old_offsets[old_ord + 1] as usize];
        for &id in row {
            let mapped = if id >= 0 && (id as usize) < n {
                inverse[id as usize] as i32
            } else {
                id
            };
            w.write_i32::<LittleEndian>(mapped)?;
        }
    }

    // 5. entry point and scalar parameters.
    let entry = layout.entry_point;
    let new_entry = if entry >= 0 && (entry as usize) < n {
        inverse[entry as usize] as i32
    } else {
        entry
    };
    w.write_i32::<LittleEndian>(new_entry)?;
    w.write_i32::<LittleEndian>(layout.max_level)?;
    w.write_i32::<LittleEndian>(layout.ef_construction)?;
    w.write_i32::<LittleEndian>(layout.ef_search)?;
    w.write_i32::<LittleEndian>(reserved)?;

    // 6. storage: header copied, rows permuted.
    copy_range(
        &mut reader,
        &mut w,
        layout.storage_start,
        layout.data_start - layout.storage_start,
    )?;
    let mut row = vec![0u8; layout.row_bytes];
    for new_ord in 0..n {
        let old_ord = perm.old_of(new_ord) as u64;
        reader.seek(SeekFrom::Start(
            layout.data_start + old_ord * layout.row_bytes as u64,
        ))?;
        reader.read_exact(&mut row).map_err(codec::truncated(src))?;
        w.write_all(&row)?;
    }

    // 7. external IDs, composed.
    w.write_i64::<LittleEndian>(n as i64)?;
    for new_ord in 0..n {
        w.write_i64::<LittleEndian>(effective_mapping[perm.old_of(new_ord)])?;
    }

    // 8. footer over the new content.
    codec::write_footer(&mut w)?;
    debug!(bytes = w.position(), "permuted index content written");
    drop(w);
    out.commit()?;

    info!(
        src = %src.display(),
        dst = %dst.display(),
        count = n,
        "permuted index file"
    );
    Ok(layout)
}

fn read_i32_section(
    reader: &mut BufReader<File>,
    file: &Path,
    section_start: u64,
    expected: usize,
) -> Result<Vec<i32>> {
    reader.seek(SeekFrom::Start(section_start))?;
    let count = reader
        .read_i64::<LittleEndian>()
        .map_err(codec::truncated(file))?;
    if count != expected as i64 {
        return Err(ReorderError::format(
            file,
            format!("section holds {count} entries, expected {expected}"),
        ));
    }
    check_section_fits(reader, file, section_start, expected as u64 * 4)?;
    let mut values = vec![0i32; expected];
    reader
        .read_i32_into::<LittleEndian>(&mut values)
        .map_err(codec::truncated(file))?;
    Ok(values)
}

fn read_i64_section(
    reader: &mut BufReader<File>,
    file: &Path,
    section_start: u64,
    expected: usize,
) -> Result<Vec<i64>> {
    reader.seek(SeekFrom::Start(section_start))?;
    let count = reader
        .read_i64::<LittleEndian>()
        .map_err(codec::truncated(file))?;
    if count != expected as i64 {
        return Err(ReorderError::format(
            file,
            format!("section holds {count} entries, expected {expected}"),
        ));
    }
    check_section_fits(reader, file, section_start, expected as u64 * 8)?;
    let mut values = vec![0i64; expected];
    reader
        .read_i64_into::<LittleEndian>(&mut values)
        .map_err(codec::truncated(file))?;
    Ok(values)
}

/// Reject a section that cannot fit in the file before allocating for it.
fn check_section_fits(
    reader: &BufReader<File>,
    file: &Path,
    section_start: u64,
    body_bytes: u64,
) -> Result<()> {
    let file_len = reader.get_ref().metadata()?.len();
    if section_start + 8 + body_bytes > file_len {
        return Err(ReorderError::format(
            file,
            format!("section at {section_start} needs {body_bytes} bytes past the file end"),
        ));
    }
    Ok(())
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
