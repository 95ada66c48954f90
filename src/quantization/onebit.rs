//! 1-bit scalar quantization codec.

use super::state::OneBitState;
use crate::error::{ReorderError, Result};

/// Encode a float vector into a bit-packed code.
///
/// When a rotation matrix is present the vector is rotated first (dense
/// matrix-vector product). Bit `j` is set MSB-first — byte `j / 8`, bit
/// position `7 - (j % 8)` — when the (rotated) component exceeds its
/// threshold. Output length is `ceil(dimension / 8)` bytes. Deterministic:
/// the same input always produces the same code.
pub fn encode(vector: &[f32], state: &OneBitState) -> Result<Vec<u8>> {
    if vector.len() != state.dimension() {
        return Err(ReorderError::Invariant(format!(
            "vector has {} dims but quantization state expects {}",
            vector.len(),
            state.dimension()
        )));
    }

    let rotated;
    let v: &[f32] = match &state.rotation {
        Some(matrix) => {
            rotated = rotate(vector, matrix);
            &rotated
        }
        None => vector,
    };

    let mut code = vec![0u8; state.code_bytes()];
    for (j, (&value, &threshold)) in v.iter().zip(&state.thresholds).enumerate() {
        if value > threshold {
            code[j / 8] |= 1 << (7 - (j % 8));
        }
    }
    Ok(code)
}

fn rotate(vector: &[f32], matrix: &[Vec<f32>]) -> Vec<f32> {
    matrix
        .iter()
        .map(|row| row.iter().zip(vector).map(|(&m, &v)| m * v).sum())
        .collect()
}
