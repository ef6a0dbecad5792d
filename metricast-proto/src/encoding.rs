use std::{fmt, str::FromStr};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, de};

use crate::Sample;

/// Wire format used to hand samples to subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// JSON text frames, the dashboard compatibility format
    #[default]
    Json,
    /// Compact postcard binary frames
    Postcard,
}

/// A serialized sample, ready to be written to any number of subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

impl Encoding {
    pub fn encode(self, sample: &Sample) -> Result<Payload, EncodeError> {
        match self {
            Encoding::Json => Ok(Payload::Text(serde_json::to_string(sample)?)),
            Encoding::Postcard => {
                // a sample is well under 64 bytes unless the hostname is long
                let buf = BytesMut::with_capacity(64);
                Ok(Payload::Binary(postcard::to_extend(sample, buf)?.freeze()))
            }
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<Sample, EncodeError> {
        match self {
            Encoding::Json => Ok(serde_json::from_slice(bytes)?),
            Encoding::Postcard => Ok(postcard::from_bytes(bytes)?),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Json => write!(f, "json"),
            Encoding::Postcard => write!(f, "postcard"),
        }
    }
}

impl FromStr for Encoding {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Encoding::Json),
            "postcard" => Ok(Encoding::Postcard),
            _ => Err("encoding must be either `json` or `postcard`"),
        }
    }
}

// accepts any casing, and works with deserializers that only hand out strings
impl<'de> Deserialize<'de> for Encoding {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
