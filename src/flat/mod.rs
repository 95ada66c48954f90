//! The raw vector-data file and its metadata sidecar.
//!
//! The data file holds fixed-width little-endian f32 rows between a codec
//! header and an integrity footer; the metadata sidecar describes where
//! the rows live, their shape, and how ordinals map to document IDs. A
//! reorder permutes the rows and degrades a dense ordinal→document
//! mapping into one of two explicit representations ([`meta::OrdinalMap`]).

pub mod data;
pub mod docmap;
pub mod meta;

pub use data::VectorReader;
pub use meta::{FieldMeta, OrdinalMap, SparseSections};
