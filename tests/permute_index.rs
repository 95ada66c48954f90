//! Index permuter behavior on hand-built files.

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::BTreeSet;
use std::io::{Seek, SeekFrom};
use std::path::Path;

use locality::graph::layout::read_id_mapping;
use locality::graph::{
    permute_index, permute_index_with_mapping, write_index, IndexFamily, IndexFileSpec,
    IndexLayout,
};
use locality::Permutation;

/// Four nodes, two levels, non-uniform: nodes 0 and 3 reach level 1.
///
/// Per-node capacity is 4 slots at level 0, plus 2 for level 1, so the
/// neighbor array concatenates rows of 6, 4, 4, 6 slots.
fn fixture() -> IndexFileSpec {
    IndexFileSpec {
        family: IndexFamily::Float,
        metric: 1,
        dimension: 2,
        assign_probas: vec![0.9, 0.1],
        cum_degree: vec![0, 4, 6],
        levels: vec![1, 0, 0, 1],
        neighbors: vec![
            1, 2, -1, -1, 3, -1, // node 0
            0, 2, -1, -1, // node 1
            0, 1, 3, -1, // node 2
            2, -1, -1, -1, 0, -1, // node 3
        ],
        entry_point: 0,
        max_level: 1,
        ef_construction: 100,
        ef_search: 64,
        data: rows(&[[0.0, 10.0], [1.0, 11.0], [2.0, 12.0], [3.0, 13.0]]),
        id_mapping: vec![100, 101, 102, 103],
    }
}

fn rows(vectors: &[[f32; 2]]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for row in vectors {
        for v in row {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
    }
    bytes
}

/// Neighbor rows keyed by external ID, each row's IDs also externalized.
///
/// External IDs survive any relabeling, so two files describe the same
/// logical graph exactly when these maps agree.
fn logical_graph(path: &Path) -> Vec<(i64, i32, BTreeSet<i64>)> {
    let layout = IndexLayout::parse_file(path).unwrap();
    let n = layout.count;
    let mut r = std::io::BufReader::new(std::fs::File::open(path).unwrap());

    r.seek(SeekFrom::Start(layout.levels_start + 8)).unwrap();
    let mut levels = vec![0i32; n];
    r.read_i32_into::<LittleEndian>(&mut levels).unwrap();

    r.seek(SeekFrom::Start(layout.offsets_start + 8)).unwrap();
    let mut offsets = vec![0i64; n + 1];
    r.read_i64_into::<LittleEndian>(&mut offsets).unwrap();

    r.seek(SeekFrom::Start(layout.neighbors_start + 8)).unwrap();
    let mut neighbors = vec![0i32; offsets[n] as usize];
    r.read_i32_into::<LittleEndian>(&mut neighbors).unwrap();

    let ids = read_id_mapping(path).unwrap();

    let mut graph = Vec::with_capacity(n);
    for ord in 0..n {
        let row = &neighbors[offsets[ord] as usize..offsets[ord + 1] as usize];
        let externalized: BTreeSet<i64> = row
            .iter()
            .filter(|&&id| id >= 0)
            .map(|&id| ids[id as usize])
            .collect();
        graph.push((ids[ord], levels[ord], externalized));
    }
    graph.sort();
    graph
}

#[test]
fn identity_permutation_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.faiss");
    let dst = dir.path().join("dst.faiss");
    write_index(&src, &fixture()).unwrap();

    permute_index(&src, &dst, &Permutation::identity(4)).unwrap();
    assert_eq!(std::fs::read(&src).unwrap(), std::fs::read(&dst).unwrap());
}

#[test]
fn permute_then_inverse_restores_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.faiss");
    let mid = dir.path().join("mid.faiss");
    let back = dir.path().join("back.faiss");
    write_index(&src, &fixture()).unwrap();

    let perm = Permutation::new(vec![2, 0, 3, 1]).unwrap();
    permute_index(&src, &mid, &perm).unwrap();
    permute_index(&mid, &back, &perm.inverted()).unwrap();

    assert_eq!(std::fs::read(&src).unwrap(), std::fs::read(&back).unwrap());
}

#[test]
fn permuted_file_preserves_the_logical_graph() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.faiss");
    let dst = dir.path().join("dst.faiss");
    write_index(&src, &fixture()).unwrap();

    // Non-uniform levels: rows change size-class position, offsets must
    // be rebuilt rather than copied.
    let perm = Permutation::new(vec![1, 3, 0, 2]).unwrap();
    permute_index(&src, &dst, &perm).unwrap();

    assert_eq!(logical_graph(&src), logical_graph(&dst));

    // The entry point still names the same logical node.
    let src_layout = IndexLayout::parse_file(&src).unwrap();
    let dst_layout = IndexLayout::parse_file(&dst).unwrap();
    let src_ids = read_id_mapping(&src).unwrap();
    let dst_ids = read_id_mapping(&dst).unwrap();
    assert_eq!(
        src_ids[src_layout.entry_point as usize],
        dst_ids[dst_layout.entry_point as usize]
    );
}

#[test]
fn storage_rows_follow_their_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.faiss");
    let dst = dir.path().join("dst.faiss");
    write_index(&src, &fixture()).unwrap();

    let perm = Permutation::new(vec![3, 0, 1, 2]).unwrap();
    permute_index(&src, &dst, &perm).unwrap();

    let layout = IndexLayout::parse_file(&dst).unwrap();
    let bytes = std::fs::read(&dst).unwrap();
    let row = |ord: usize| {
        let start = layout.data_start as usize + ord * layout.row_bytes;
        &bytes[start..start + layout.row_bytes]
    };
    // New ordinal 0 holds old node 3's vector [3.0, 13.0].
    assert_eq!(row(0), rows(&[[3.0, 13.0]]).as_slice());
    assert_eq!(row(1), rows(&[[0.0, 10.0]]).as_slice());
}

#[test]
fn supplied_mapping_is_composed_not_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.faiss");
    let dst = dir.path().join("dst.faiss");
    write_index(&src, &fixture()).unwrap();

    let perm = Permutation::new(vec![2, 0, 1, 3]).unwrap();
    let external = vec![40, 41, 42, 43];
    permute_index_with_mapping(&src, &dst, &perm, &external).unwrap();

    // new_ids[i] = external[perm.old_of(i)], never perm.old_of(i) itself.
    assert_eq!(read_id_mapping(&dst).unwrap(), vec![42, 40, 41, 43]);
}

#[test]
fn wrong_length_permutation_rejected_before_any_write() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.faiss");
    let dst = dir.path().join("dst.faiss");
    write_index(&src, &fixture()).unwrap();

    let perm = Permutation::identity(3);
    assert!(permute_index(&src, &dst, &perm).is_err());
    assert!(!dst.exists());
}

/// Three nodes of 10-bit codes (two bytes per row), uniform level 0.
fn binary_fixture() -> IndexFileSpec {
    IndexFileSpec {
        family: IndexFamily::Binary,
        metric: 1,
        dimension: 10,
        assign_probas: vec![1.0],
        cum_degree: vec![0, 4],
        levels: vec![0; 3],
        neighbors: vec![
            1, 2, -1, -1, // node 0
            0, 2, -1, -1, // node 1
            0, 1, -1, -1, // node 2
        ],
        entry_point: 0,
        max_level: 0,
        ef_construction: 80,
        ef_search: 40,
        data: vec![0xaa, 0x01, 0xbb, 0x02, 0xcc, 0x03],
        id_mapping: vec![7, 8, 9],
    }
}

#[test]
fn binary_family_round_trips_through_permute() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.faissb");
    let mid = dir.path().join("mid.faissb");
    let back = dir.path().join("back.faissb");
    write_index(&src, &binary_fixture()).unwrap();

    let layout = IndexLayout::parse_file(&src).unwrap();
    assert_eq!(layout.family, IndexFamily::Binary);
    assert_eq!(layout.row_bytes, 2);
    assert_eq!(layout.count, 3);

    let perm = Permutation::new(vec![2, 0, 1]).unwrap();
    permute_index(&src, &mid, &perm).unwrap();

    // Code rows are byte rows, not f32 rows: new ordinal 0 holds old
    // node 2's code, and the external IDs compose.
    let mid_layout = IndexLayout::parse_file(&mid).unwrap();
    let bytes = std::fs::read(&mid).unwrap();
    let data = mid_layout.data_start as usize;
    assert_eq!(&bytes[data..data + 2], &[0xcc, 0x03]);
    assert_eq!(&bytes[data + 2..data + 4], &[0xaa, 0x01]);
    assert_eq!(read_id_mapping(&mid).unwrap(), vec![9, 7, 8]);

    permute_index(&mid, &back, &perm.inverted()).unwrap();
    assert_eq!(std::fs::read(&src).unwrap(), std::fs::read(&back).unwrap());
}

#[test]
fn oversized_section_count_is_a_format_error() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.faiss");
    write_index(&src, &fixture()).unwrap();

    // Corrupt the cumulative-degree count to a value no file could hold;
    // parsing must fail cleanly instead of attempting the allocation.
    let layout = IndexLayout::parse_file(&src).unwrap();
    let mut bytes = std::fs::read(&src).unwrap();
    let at = layout.assign_probas_end as usize;
    bytes[at..at + 8].copy_from_slice(&(1i64 << 60).to_le_bytes());
    std::fs::write(&src, &bytes).unwrap();

    assert!(IndexLayout::parse_file(&src).is_err());
}

#[test]
fn truncated_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.faiss");
    write_index(&src, &fixture()).unwrap();

    let bytes = std::fs::read(&src).unwrap();
    std::fs::write(&src, &bytes[..bytes.len() - 20]).unwrap();
    assert!(IndexLayout::parse_file(&src).is_err());
}
