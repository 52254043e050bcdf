use std::fmt;

use serde::{Serialize, de::DeserializeOwned};

use crate::error::ProtoError;

/// Body encoding used by a connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Codec {
    /// Compact schema-binary encoding (postcard).
    #[default]
    Binary,
    /// Structured text encoding (JSON).
    Text,
}

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Binary => "postcard",
            Codec::Text => "json",
        }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, ProtoError> {
        match self {
            Codec::Binary => Ok(postcard::to_stdvec(value)?),
            Codec::Text => Ok(serde_json::to_vec(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ProtoError> {
        match self {
            Codec::Binary => Ok(postcard::from_bytes(bytes)?),
            Codec::Text => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
