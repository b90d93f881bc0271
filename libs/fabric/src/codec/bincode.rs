use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Codec;
use crate::error::{Error, Result};

/// Bincode codec for binary serialization
///
/// Uses the same fixed-int layout as `bincode::serialize`. An optional limit
/// bounds the size of encoded and decoded payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec {
    limit: Option<u64>,
}

impl BincodeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject payloads larger than `bytes` on both encode and decode
    pub fn with_limit(bytes: u64) -> Self {
        Self { limit: Some(bytes) }
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

impl Codec for BincodeCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self.limit {
            Some(limit) => options().with_limit(limit).serialize(value),
            None => options().serialize(value),
        }
        .map_err(|e| Error::Codec(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self.limit {
            Some(limit) => options().with_limit(limit).deserialize(bytes),
            None => options().deserialize(bytes),
        }
        .map_err(|e| Error::Codec(e.to_string()))
    }
}
