//! Gzip-compressed JSON payloads for caches holding large values.

use std::io::Write;
use std::sync::Arc;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Error, Result};

/// A JSON value stored gzip-compressed. Clones share the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedJson {
    bytes: Arc<[u8]>,
}

impl CompressedJson {
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        serde_json::to_writer(&mut encoder, value)?;
        encoder.flush()?;
        let bytes = encoder.finish()?;
        Ok(Self {
            bytes: bytes.into(),
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let decoder = GzDecoder::new(&self.bytes[..]);
        serde_json::from_reader(decoder).map_err(|e| Error::Json(e.to_string()))
    }

    /// Size of the compressed payload in bytes.
    pub fn compressed_len(&self) -> usize {
        self.bytes.len()
    }
}
