// Vector Codec
//
// Embedding vectors are persisted as little-endian IEEE-754 float32 BLOBs,
// tightly packed with no header; the dimension is implied by the byte length.

use crate::error::RagError;

/// Encode a float vector as a little-endian float32 BLOB.
pub fn encode(vec: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vec.len() * 4);
    for value in vec {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a little-endian float32 BLOB back into a vector.
/// The blob length must be a multiple of 4 (`dim = len / 4`).
pub fn decode(blob: &[u8]) -> Result<Vec<f32>, RagError> {
    if blob.len() % 4 != 0 {
        return Err(RagError::InvalidVector(format!(
            "blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect())
}
