//! bincode helpers shared by every on-disk structure.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::ShapefileResult;

/// Upper bound on a single decoded value, so a damaged length prefix fails
/// instead of allocating.
const DECODE_LIMIT: usize = 1 << 28;

pub(crate) fn encode<T: Serialize>(value: &T) -> ShapefileResult<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(
        value,
        bincode::config::legacy(),
    )?)
}

/// Encodes `value` and zero-pads it to exactly `len` bytes.
pub(crate) fn encode_padded<T: Serialize>(value: &T, len: usize) -> ShapefileResult<Vec<u8>> {
    let mut bytes = encode(value)?;
    if bytes.len() > len {
        return Err(crate::errors::ShapefileError::Serialization(format!(
            "Encoded size {} exceeds reserved {} bytes",
            bytes.len(),
            len
        )));
    }
    bytes.resize(len, 0);
    Ok(bytes)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> ShapefileResult<T> {
    let config = bincode::config::legacy().with_limit::<DECODE_LIMIT>();
    let (value, _) = bincode::serde::decode_from_slice(bytes, config)?;
    Ok(value)
}
