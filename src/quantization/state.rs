//! Versioned quantization-state sidecar.
//!
//! One file holds the state for every quantized field of a segment,
//! indexed by field number. Layout:
//!
//! ```text
//! codec header
//! per-field state blobs
//! field index         num_fields:i32, then {field:i32, length:i32, position:varint}
//! index start         i64
//! file version        i32
//! footer              magic + algorithm + crc32
//! ```
//!
//! Blobs are self-describing and version-gated: field *presence*, not
//! just meaning, depends on the version marker, so the reader must branch
//! before consuming subsequent fields. Version 1 carries thresholds only;
//! version 2 adds two boolean flags and the optional rotation matrix.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

use crate::codec::{self, ChecksumWriter, FOOTER_LEN};
use crate::error::{ReorderError, Result};
use crate::storage::{self, AtomicFile};

pub const QSTATE_CODEC: &str = "LocalityQuantizationState";
pub const QSTATE_FILE_VERSION: u32 = 1;

/// Blob version carrying thresholds only.
pub const STATE_VERSION_THRESHOLDS: u32 = 1;
/// Blob version adding the boolean flags and the rotation matrix.
pub const STATE_VERSION_ROTATION: u32 = 2;

/// Per-field 1-bit scalar quantization state.
#[derive(Debug, Clone, PartialEq)]
pub struct OneBitState {
    pub quantizer_type: u32,
    pub random_rotation: bool,
    pub adc: bool,
    /// One threshold per dimension.
    pub thresholds: Vec<f32>,
    /// Optional square rotation matrix, `dimension x dimension`, applied
    /// before thresholding.
    pub rotation: Option<Vec<Vec<f32>>>,
}

impl OneBitState {
    pub fn dimension(&self) -> usize {
        self.thresholds.len()
    }

    /// Encoded code width: `ceil(dimension / 8)` bytes.
    pub fn code_bytes(&self) -> usize {
        (self.thresholds.len() + 7) / 8
    }

    fn validate(&self, file: &Path) -> Result<()> {
        if let Some(matrix) = &self.rotation {
            if matrix.len() != self.thresholds.len()
                || matrix.iter().any(|row| row.len() != self.thresholds.len())
            {
                return Err(ReorderError::format(
                    file,
                    format!(
                        "rotation matrix is not square of dimension {}",
                        self.thresholds.len()
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Read the state for `field_number` from the sidecar at `path`.
///
/// Verifies the file checksum before trusting any offset in it.
pub fn read_state(path: &Path, field_number: i32) -> Result<OneBitState> {
    codec::verify_file_footer(path)?;

    let mut r = storage::open_read(path)?;
    let file_len = r.seek(SeekFrom::End(0))?;
    if file_len < FOOTER_LEN + 12 {
        return Err(ReorderError::format(path, "file too short for field index"));
    }
    r.seek(SeekFrom::Start(file_len - FOOTER_LEN - 12))?;
    let index_start = r.read_i64::<LittleEndian>().map_err(codec::truncated(path))?;
    let file_version = r.read_i32::<LittleEndian>().map_err(codec::truncated(path))?;
    if file_version != QSTATE_FILE_VERSION as i32 {
        return Err(ReorderError::UnsupportedVersion {
            file: path.display().to_string(),
            version: file_version as u32,
        });
    }
    if index_start < 0 || index_start as u64 >= file_len {
        return Err(ReorderError::format(
            path,
            format!("field index position {index_start} outside file"),
        ));
    }

    r.seek(SeekFrom::Start(index_start as u64))?;
    let num_fields = r.read_i32::<LittleEndian>().map_err(codec::truncated(path))?;
    let mut found: Option<(u64, usize)> = None;
    for _ in 0..num_fields {
        let field = r.read_i32::<LittleEndian>().map_err(codec::truncated(path))?;
        let length = r.read_i32::<LittleEndian>().map_err(codec::truncated(path))?;
        let position = codec::read_vu64(&mut r).map_err(codec::truncated(path))?;
        if field == field_number {
            // Bound before allocating: a corrupt length must fail as a
            // format error, not an allocation abort.
            if length < 0 || position.saturating_add(length as u64) > file_len {
                return Err(ReorderError::format(
                    path,
                    format!("state blob [{position}, +{length}) outside file of {file_len} bytes"),
                ));
            }
            found = Some((position, length as usize));
            break;
        }
    }
    let (position, length) = found.ok_or_else(|| {
        ReorderError::format(
            path,
            format!("field {field_number} not found in quantization state"),
        )
    })?;

    r.seek(SeekFrom::Start(position))?;
    let mut blob = vec![0u8; length];
    r.read_exact(&mut blob).map_err(codec::truncated(path))?;
    let state = parse_blob(&blob, path)?;
    debug!(
        file = %path.display(),
        field = field_number,
        dimension = state.dimension(),
        rotated = state.rotation.is_some(),
        "read quantization state"
    );
    Ok(state)
}

/// Write a sidecar holding `states`, one `(field_number, state)` each.
pub fn write_states(
    path: &Path,
    segment_id: &[u8; 16],
    suffix: &str,
    states: &[(i32, OneBitState)],
) -> Result<()> {
    for (_, state) in states {
        state.validate(path)?;
    }

    let mut out = AtomicFile::create(path)?;
    let mut w = ChecksumWriter::new(out.writer());
    codec::write_header(&mut w, QSTATE_CODEC, QSTATE_FILE_VERSION, segment_id, suffix)?;

    let mut index = Vec::with_capacity(states.len());
    for (field, state) in states {
        let position = w.position();
        let blob = encode_blob(state);
        w.write_all(&blob)?;
        index.push((*field, blob.len() as i32, position));
    }

    let index_start = w.position() as i64;
    w.write_i32::<LittleEndian>(states.len() as i32)?;
    for (field, length, position) in index {
        w.write_i32::<LittleEndian>(field)?;
        w.write_i32::<LittleEndian>(length)?;
        codec::write_vu64(&mut w, position)?;
    }
    w.write_i64::<LittleEndian>(index_start)?;
    w.write_i32::<LittleEndian>(QSTATE_FILE_VERSION as i32)?;

    codec::write_footer(&mut w)?;
    drop(w);
    out.commit()
}

fn parse_blob(blob: &[u8], file: &Path) -> Result<OneBitState> {
    let mut r = Cursor::new(blob);
    let version = codec::read_vu32(&mut r).map_err(codec::truncated(file))?;
    if version != STATE_VERSION_THRESHOLDS && version != STATE_VERSION_ROTATION {
        return Err(ReorderError::UnsupportedVersion {
            file: file.display().to_string(),
            version,
        });
    }
    let quantizer_type = codec::read_vu32(&mut r).map_err(codec::truncated(file))?;

    let (random_rotation, adc) = if version >= STATE_VERSION_ROTATION {
        let rr = r.read_u8().map_err(codec::truncated(file))? != 0;
        let adc = r.read_u8().map_err(codec::truncated(file))? != 0;
        (rr, adc)
    } else {
        (false, false)
    };

    let thresholds = read_float_array(&mut r, file, blob.len())?;

    let rotation = if version >= STATE_VERSION_ROTATION
        && r.read_u8().map_err(codec::truncated(file))? != 0
    {
        let rows = codec::read_vu32(&mut r).map_err(codec::truncated(file))? as usize;
        if rows > blob.len() {
            return Err(ReorderError::format(
                file,
                format!("rotation row count {rows} exceeds {}-byte state blob", blob.len()),
            ));
        }
        let mut matrix = Vec::with_capacity(rows);
        for _ in 0..rows {
            matrix.push(read_float_array(&mut r, file, blob.len())?);
        }
        Some(matrix)
    } else {
        None
    };

    let state = OneBitState {
        quantizer_type,
        random_rotation,
        adc,
        thresholds,
        rotation,
    };
    state.validate(file)?;
    Ok(state)
}

fn encode_blob(state: &OneBitState) -> Vec<u8> {
    // Infallible: writing to a Vec cannot fail.
    let mut w = Vec::new();
    let version = if state.rotation.is_some() || state.random_rotation || state.adc {
        STATE_VERSION_ROTATION
    } else {
        STATE_VERSION_THRESHOLDS
    };
    codec::write_vu32(&mut w, version).unwrap();
    codec::write_vu32(&mut w, state.quantizer_type).unwrap();
    if version >= STATE_VERSION_ROTATION {
        w.push(state.random_rotation as u8);
        w.push(state.adc as u8);
    }
    write_float_array(&mut w, &state.thresholds);
    if version >= STATE_VERSION_ROTATION {
        match &state.rotation {
            Some(matrix) => {
                w.push(1);
                codec::write_vu32(&mut w, matrix.len() as u32).unwrap();
                for row in matrix {
                    write_float_array(&mut w, row);
                }
            }
            None => w.push(0),
        }
    }
    w
}

fn read_float_array<R: Read>(r: &mut R, file: &Path, blob_len: usize) -> Result<Vec<f32>> {
    let len = codec::read_vu32(r).map_err(codec::truncated(file))? as usize;
    // Four bytes per float: any declared length past this is corrupt.
    if len > blob_len / 4 {
        return Err(ReorderError::format(
            file,
            format!("float array of {len} entries exceeds {blob_len}-byte state blob"),
        ));
    }
    let mut values = vec![0f32; len];
    r.read_f32_into::<LittleEndian>(&mut values)
        .map_err(codec::truncated(file))?;
    Ok(values)
}

fn write_float_array(w: &mut Vec<u8>, values: &[f32]) {
    codec::write_vu32(w, values.len() as u32).unwrap();
    for &v in values {
        w.write_f32::<LittleEndian>(v).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds_only() -> OneBitState {
        OneBitState {
            quantizer_type: 0,
            random_rotation: false,
            adc: false,
            thresholds: vec![0.5, -1.0, 2.0],
            rotation: None,
        }
    }

    fn with_rotation() -> OneBitState {
        OneBitState {
            quantizer_type: 0,
            random_rotation: true,
            adc: false,
            thresholds: vec![0.0, 1.0],
            rotation: Some(vec![vec![0.0, 1.0], vec![1.0, 0.0]]),
        }
    }

    #[test]
    fn round_trip_both_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.qstate");
        write_states(
            &path,
            &[5; 16],
            "q",
            &[(0, thresholds_only()), (3, with_rotation())],
        )
        .unwrap();

        assert_eq!(read_state(&path, 0).unwrap(), thresholds_only());
        assert_eq!(read_state(&path, 3).unwrap(), with_rotation());
    }

    #[test]
    fn version_1_blob_omits_flags_and_rotation() {
        let blob = encode_blob(&thresholds_only());
        // version, type, then the bare float array: no flag bytes.
        assert_eq!(blob.len(), 1 + 1 + 1 + 3 * 4);
        let parsed = parse_blob(&blob, Path::new("mem")).unwrap();
        assert_eq!(parsed, thresholds_only());
    }

    #[test]
    fn unknown_version_is_fatal() {
        let mut blob = Vec::new();
        codec::write_vu32(&mut blob, 9).unwrap();
        let err = parse_blob(&blob, Path::new("mem")).unwrap_err();
        assert!(matches!(err, ReorderError::UnsupportedVersion { version: 9, .. }));
    }

    #[test]
    fn missing_field_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.qstate");
        write_states(&path, &[0; 16], "", &[(1, thresholds_only())]).unwrap();
        assert!(read_state(&path, 2).is_err());
    }

    #[test]
    fn oversized_threshold_count_is_a_format_error() {
        // version 1, type 0, then a threshold count far beyond the blob.
        let mut blob = Vec::new();
        codec::write_vu32(&mut blob, STATE_VERSION_THRESHOLDS).unwrap();
        codec::write_vu32(&mut blob, 0).unwrap();
        codec::write_vu32(&mut blob, u32::MAX).unwrap();
        let err = parse_blob(&blob, Path::new("mem")).unwrap_err();
        assert!(matches!(err, ReorderError::Format { .. }));
    }

    #[test]
    fn oversized_blob_length_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.qstate");
        write_states(&path, &[0; 16], "", &[(0, thresholds_only())]).unwrap();

        // Patch field 0's blob length in the tail index, then restore the
        // footer checksum so only the length bound can reject the file.
        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        let index_start =
            i64::from_le_bytes(bytes[len - 28..len - 20].try_into().unwrap()) as usize;
        bytes[index_start + 8..index_start + 12].copy_from_slice(&i32::MAX.to_le_bytes());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[..len - 8]);
        let checksum = u64::from(hasher.finalize());
        bytes[len - 8..].copy_from_slice(&checksum.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let err = read_state(&path, 0).unwrap_err();
        assert!(matches!(err, ReorderError::Format { .. }));
    }

    #[test]
    fn non_square_rotation_rejected() {
        let mut bad = with_rotation();
        bad.rotation = Some(vec![vec![1.0, 0.0]]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.qstate");
        assert!(write_states(&path, &[0; 16], "", &[(0, bad)]).is_err());
    }
}
