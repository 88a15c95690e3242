//! Binary layout of a persisted vector.
//!
//! - length: i32 (little-endian), number of elements
//! - values: [f32; length] (little-endian IEEE-754)
//!
//! No padding, no checksum.

/// Size of the length prefix in bytes
const LENGTH_SIZE: usize = 4;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Truncated vector: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("Negative vector length: {0}")]
    NegativeLength(i32),

    #[error("Trailing bytes after vector: {0}")]
    TrailingBytes(usize),
}

/// Encode a vector into its persisted byte form.
pub fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(LENGTH_SIZE + vector.len() * 4);
    bytes.extend_from_slice(&(vector.len() as i32).to_le_bytes());
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a vector from its persisted byte form.
pub fn bytes_to_vector(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() < LENGTH_SIZE {
        return Err(CodecError::Truncated {
            needed: LENGTH_SIZE,
            got: bytes.len(),
        });
    }

    let mut len_bytes = [0u8; LENGTH_SIZE];
    len_bytes.copy_from_slice(&bytes[..LENGTH_SIZE]);
    let len = i32::from_le_bytes(len_bytes);
    if len < 0 {
        return Err(CodecError::NegativeLength(len));
    }

    let payload = &bytes[LENGTH_SIZE..];
    let needed = len as usize * 4;
    if payload.len() < needed {
        return Err(CodecError::Truncated {
            needed: LENGTH_SIZE + needed,
            got: bytes.len(),
        });
    }
    if payload.len() > needed {
        return Err(CodecError::TrailingBytes(payload.len() - needed));
    }

    Ok(payload
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let bytes = vector_to_bytes(&[1.0, -2.5]);
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..4], &2i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[8..], &(-2.5f32).to_le_bytes());
    }

    #[test]
    fn test_roundtrip_is_bit_exact() {
        let vector = vec![
            0.1f32,
            -0.0,
            f32::MIN_POSITIVE,
            f32::MAX,
            f32::NEG_INFINITY,
            f32::NAN,
            1.0e-40,
        ];
        let decoded = bytes_to_vector(&vector_to_bytes(&vector)).unwrap();
        assert_eq!(decoded.len(), vector.len());
        for (a, b) in vector.iter().zip(&decoded) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_truncated_input() {
        assert_eq!(
            bytes_to_vector(&[1, 0]),
            Err(CodecError::Truncated { needed: 4, got: 2 })
        );

        let mut bytes = vector_to_bytes(&[1.0, 2.0]);
        bytes.pop();
        assert!(matches!(
            bytes_to_vector(&bytes),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_rejects_negative_length_and_trailing_bytes() {
        assert_eq!(
            bytes_to_vector(&(-1i32).to_le_bytes()),
            Err(CodecError::NegativeLength(-1))
        );

        let mut bytes = vector_to_bytes(&[1.0]);
        bytes.push(0);
        assert_eq!(bytes_to_vector(&bytes), Err(CodecError::TrailingBytes(1)));
    }
}
