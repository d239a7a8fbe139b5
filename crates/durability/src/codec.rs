//! Storage codec seam.
//!
//! Every payload that reaches a replay log segment passes through a
//! [`StorageCodec`]. The only codec shipped today is [`IdentityCodec`];
//! the seam exists so encryption or compression can be added without
//! touching the record framing.

/// Storage codec trait.
///
/// Codecs must be `Send + Sync`: one log can be read and appended from
/// different threads.
pub trait StorageCodec: Send + Sync {
    /// Encode bytes for storage.
    fn encode(&self, data: &[u8]) -> Vec<u8>;

    /// Decode bytes read back from storage.
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Unique codec identifier.
    fn codec_id(&self) -> &str;
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Decoding failed.
    #[error("decode error (codec={codec_id}, data_len={data_len}): {detail}")]
    DecodeError {
        /// Human-readable error description
        detail: String,
        /// Codec ID that attempted the decode
        codec_id: String,
        /// Length of the data that failed to decode
        data_len: usize,
    },

    /// Unknown codec identifier.
    #[error("unknown codec: {0}")]
    UnknownCodec(String),
}

/// Pass-through codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl StorageCodec for IdentityCodec {
    fn encode(&self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }

    fn codec_id(&self) -> &str {
        "identity"
    }
}

/// Resolve a codec by its identifier.
pub fn get_codec(codec_id: &str) -> Result<Box<dyn StorageCodec>, CodecError> {
    match codec_id {
        "identity" => Ok(Box::new(IdentityCodec)),
        other => Err(CodecError::UnknownCodec(other.to_string())),
    }
}
