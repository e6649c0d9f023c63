//! Serialization of code objects, for shipping rewritten units between
//! processes or persisting them. The payload is bincode wrapped in lz4.

use lz4_flex::block::DecompressError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::code::CodeObject;

#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("unable to decompress bytecode payload: {0}")]
    Decompress(#[from] DecompressError),
    #[error("invalid bytecode payload: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("unable to serialize code object: {0}")]
    Encode(#[from] bincode::error::EncodeError),
}

impl CodeObject {
    /// Serialize this bytecode for storage or transfer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MarshalError> {
        let data = bincode::serde::encode_to_vec(self, bincode::config::legacy())?;
        Ok(lz4_flex::compress_prepend_size(&data))
    }

    /// Deserialize a code object produced by [`CodeObject::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> Result<Self, MarshalError> {
        let raw = lz4_flex::decompress_size_prepended(data)?;
        let (code, _) = bincode::serde::decode_from_slice(&raw, bincode::config::legacy())?;
        Ok(code)
    }
}

/// Serialize any serde value with the same framing as code objects.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, MarshalError> {
    let data = bincode::serde::encode_to_vec(value, bincode::config::legacy())?;
    Ok(lz4_flex::compress_prepend_size(&data))
}

/// Inverse of [`serialize`].
pub fn deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, MarshalError> {
    let raw = lz4_flex::decompress_size_prepended(data)?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::legacy())?;
    Ok(value)
}
