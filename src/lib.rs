//! locality: cache-aware reordering of ANN index artifacts.
//!
//! Graph-based indexes store vectors in insertion order, which scatters
//! the neighborhoods a search traverses across the whole file. This crate
//! rewrites a segment's vector artifacts so vectors likely to be visited
//! together sit together on disk:
//!
//! - `graph/`: binary layout parser and permuter for the composite index
//!   file (ID-map wrapper, HNSW graph, flat storage)
//! - `flat/`: vector data file rewriter and metadata/ordinal-mapping
//!   rewriter
//! - `quantization/`: 1-bit scalar quantization codec and its persisted
//!   state sidecar
//! - `cluster`: k-means clustering and the cluster-sorted permutation
//! - `reorder`: the orchestrator that applies one permutation to every
//!   artifact consistently
//!
//! # Critical Nuances
//!
//! ## Two ID spaces
//!
//! Every array in an index file is keyed by **ordinal** (storage slot);
//! the external-ID array translates ordinals to **document IDs**. A
//! permutation relabels ordinals, so stored ordinals (neighbor lists, the
//! entry point) go through the inverse permutation while the external-ID
//! array is *composed*: the ID at new ordinal `i` is whatever ID the old
//! ordinal `P[i]` held. Mixing the two directions corrupts the index
//! silently — searches still run, they just return the wrong documents.
//!
//! ## Why reordering helps
//!
//! HNSW neighborhoods are small-world: a query touches a few hundred
//! nodes that cluster tightly in vector space but are uniformly scattered
//! in insertion order. After a cluster sort, those touches collapse onto
//! a handful of pages.

pub mod cluster;
pub mod codec;
pub mod error;
pub mod flat;
pub mod graph;
pub mod permutation;
pub mod quantization;
pub mod reorder;
pub mod storage;

pub use cluster::{ClusterReorder, KMeans, Metric};
pub use error::{ReorderError, Result};
pub use flat::{FieldMeta, OrdinalMap, VectorReader};
pub use graph::{permute_index, permute_index_with_mapping, IndexLayout};
pub use permutation::Permutation;
pub use quantization::OneBitState;
pub use reorder::{
    reorder_segment, GraphParams, IndexBuilder, MappingStrategy, PermutationSource,
    ReorderReport, SegmentFiles,
};
