//! The composite graph index file: parser, writer, permuter.
//!
//! The file is a nested, tagged container: an ID-map wrapper around an
//! HNSW graph around flat row storage, followed by the external-ID array
//! and an integrity footer. Two families exist, distinguished by 4-byte
//! type tags at every nesting level: float rows and fixed-width binary
//! codes. [`layout`] recovers the exact byte layout without building any
//! in-memory graph; [`permute`] streams a new file under a validated
//! permutation; [`write`] serializes a file from explicit arrays.

pub mod layout;
pub mod permute;
pub mod write;

pub use layout::{GraphFamily, IndexFamily, IndexLayout, StorageFamily};
pub use permute::{permute_index, permute_index_with_mapping};
pub use write::{write_index, IndexFileSpec};
