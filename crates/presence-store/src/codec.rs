//! Embedding blob encoding.
//!
//! Vectors are stored as raw little-endian f32 bytes next to explicit
//! `embedding_dim` and `embedding_dtype` columns, so a decode can verify
//! exactly what it is reading. Round trips are bit-exact.

use crate::StoreError;
use presence_core::types::EMBEDDING_DTYPE_F32LE;

const F32_BYTES: usize = std::mem::size_of::<f32>();

pub fn encode_f32le(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * F32_BYTES);
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn decode_f32le(blob: &[u8], dim: usize, dtype: &str) -> Result<Vec<f32>, StoreError> {
    if dtype != EMBEDDING_DTYPE_F32LE {
        return Err(StoreError::InvalidEmbedding(format!(
            "unsupported dtype {dtype:?}"
        )));
    }
    let expected = dim
        .checked_mul(F32_BYTES)
        .ok_or_else(|| StoreError::InvalidEmbedding(format!("dimension {dim} overflows")))?;
    if blob.len() != expected {
        return Err(StoreError::InvalidEmbedding(format!(
            "expected {expected} bytes for dim {dim}, got {}",
            blob.len()
        )));
    }

    Ok(blob
        .chunks_exact(F32_BYTES)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Reject vectors that must never reach the gallery.
pub fn validate(values: &[f32]) -> Result<(), StoreError> {
    if values.is_empty() {
        return Err(StoreError::InvalidEmbedding("vector is empty".into()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidEmbedding(
            "vector contains non-finite values".into(),
        ));
    }
    Ok(())
}
