//! Validated ordinal permutations.
//!
//! A reorder is described by an array `new_to_old` where
//! `new_to_old[new_ordinal] = old_ordinal`. Three index spaces meet here:
//! storage ordinals (positions in the flat arrays), graph-internal IDs
//! (neighbor entries, entry point), and external document IDs. The
//! permutation acts on ordinals; graph IDs are translated through the
//! [`inverse`](Permutation::inverse) (`old -> new`), and document IDs are
//! never permuted, only carried along by [`compose_mapping`]
//! (Permutation::compose_mapping).

use crate::error::{ReorderError, Result};

/// A bijective reordering of ordinals `[0, n)`.
///
/// Construction validates bijectivity; a `Permutation` that exists is
/// always safe to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permutation {
    new_to_old: Vec<u32>,
}

impl Permutation {
    /// Create a permutation from `new_to_old[new_pos] = old_pos`.
    ///
    /// Rejects out-of-range entries and duplicates. This runs before any
    /// file is mutated, so a violated permutation can never reach a
    /// writer.
    pub fn new(new_to_old: Vec<u32>) -> Result<Self> {
        let n = new_to_old.len();
        let mut seen = vec![false; n];
        for (new_pos, &old_pos) in new_to_old.iter().enumerate() {
            let old = old_pos as usize;
            if old >= n {
                return Err(ReorderError::Invariant(format!(
                    "permutation entry {old_pos} at position {new_pos} is out of range for {n} items"
                )));
            }
            if seen[old] {
                return Err(ReorderError::Invariant(format!(
                    "permutation entry {old_pos} appears more than once"
                )));
            }
            seen[old] = true;
        }
        Ok(Self { new_to_old })
    }

    /// The identity permutation over `n` items.
    pub fn identity(n: usize) -> Self {
        Self {
            new_to_old: (0..n as u32).collect(),
        }
    }

    /// Number of items covered.
    pub fn len(&self) -> usize {
        self.new_to_old.len()
    }

    pub fn is_empty(&self) -> bool {
        self.new_to_old.is_empty()
    }

    /// Old ordinal of the item now stored at `new_pos`.
    #[inline]
    pub fn old_of(&self, new_pos: usize) -> usize {
        self.new_to_old[new_pos] as usize
    }

    /// The raw `new_to_old` array.
    pub fn as_slice(&self) -> &[u32] {
        &self.new_to_old
    }

    /// Build the inverse array `inverse[old_pos] = new_pos`.
    ///
    /// Required whenever old-space identifiers (neighbor IDs, the entry
    /// point) must be translated into new-space identifiers.
    pub fn inverse(&self) -> Vec<u32> {
        let mut inverse = vec![0u32; self.new_to_old.len()];
        for (new_pos, &old_pos) in self.new_to_old.iter().enumerate() {
            inverse[old_pos as usize] = new_pos as u32;
        }
        inverse
    }

    /// The inverse permutation as a `Permutation`.
    ///
    /// Applying `self` then `inverted()` restores the original order.
    pub fn inverted(&self) -> Self {
        Self {
            new_to_old: self.inverse(),
        }
    }

    /// Compose this permutation with a pre-existing external-ID mapping.
    ///
    /// `composed[new_ord] = old_mapping[new_to_old[new_ord]]`. The new
    /// mapping is always defined in terms of the old ordinal space; it is
    /// never `new_to_old[new_ord]` itself. Confusing the two produces a
    /// file that parses but silently corrupts document associations.
    pub fn compose_mapping(&self, old_mapping: &[i64]) -> Result<Vec<i64>> {
        if old_mapping.len() != self.new_to_old.len() {
            return Err(ReorderError::Invariant(format!(
                "id mapping has {} entries but permutation covers {} items",
                old_mapping.len(),
                self.new_to_old.len()
            )));
        }
        Ok(self
            .new_to_old
            .iter()
            .map(|&old| old_mapping[old as usize])
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_permutation() {
        let p = Permutation::new(vec![2, 0, 1]).unwrap();
        assert_eq!(p.len(), 3);
        assert_eq!(p.old_of(0), 2);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(Permutation::new(vec![0, 3, 1]).is_err());
    }

    #[test]
    fn rejects_duplicates() {
        assert!(Permutation::new(vec![0, 1, 1]).is_err());
    }

    #[test]
    fn inverse_round_trips() {
        let p = Permutation::new(vec![3, 1, 0, 2]).unwrap();
        let inv = p.inverse();
        for new_pos in 0..p.len() {
            assert_eq!(inv[p.old_of(new_pos)] as usize, new_pos);
        }
    }

    #[test]
    fn compose_uses_old_ordinal_space() {
        // old_mapping[old_ord] = doc id; docs deliberately non-identity
        let p = Permutation::new(vec![2, 0, 1]).unwrap();
        let old_mapping = vec![10, 20, 30];
        let composed = p.compose_mapping(&old_mapping).unwrap();
        assert_eq!(composed, vec![30, 10, 20]);
    }

    #[test]
    fn compose_rejects_length_mismatch() {
        let p = Permutation::identity(3);
        assert!(p.compose_mapping(&[1, 2]).is_err());
    }
}
