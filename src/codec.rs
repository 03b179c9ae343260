//! Value Codec
//!
//! Byte-level encode/decode pair used beneath the encryption layer. The
//! codec is fixed per cache instance.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, Result};

/// Serialization format for stored values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// Textual JSON via `serde_json`
    #[default]
    Json,
    /// Compact MessagePack via `rmp-serde`
    MsgPack,
}

impl Codec {
    /// Serializes a value to bytes.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Codec::Json => serde_json::to_vec(value).map_err(|e| CacheError::Codec(e.to_string())),
            // Named fields keep structs decodable into serde_json::Value for hooks
            Codec::MsgPack => {
                rmp_serde::to_vec_named(value).map_err(|e| CacheError::Codec(e.to_string()))
            }
        }
    }

    /// Deserializes bytes produced by [`Codec::encode`].
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Codec::Json => {
                serde_json::from_slice(bytes).map_err(|e| CacheError::Codec(e.to_string()))
            }
            Codec::MsgPack => {
                rmp_serde::from_slice(bytes).map_err(|e| CacheError::Codec(e.to_string()))
            }
        }
    }
}

impl FromStr for Codec {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Codec::Json),
            "msgpack" | "messagepack" => Ok(Codec::MsgPack),
            other => Err(CacheError::Configuration(format!(
                "unsupported codec: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Json => write!(f, "json"),
            Codec::MsgPack => write!(f, "msgpack"),
        }
    }
}
