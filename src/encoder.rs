//! Task payload encoding: a serializer paired with an optional compressor.
//!
//! The broker never looks inside queue entries; everything that crosses the
//! connector boundary is the byte output of an [`Encoder`]. Both halves are
//! pure transforms, so any serializer/compressor pair round-trips any task,
//! and producers and workers only need to agree on the pair in their
//! configuration.

use crate::{Result, error::TaskmillError};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Serialize, de::DeserializeOwned};
use std::io::{Read, Write};

/// Wire serialization format for task payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Serializer {
    #[default]
    Json,
    MessagePack,
}

/// Byte compression applied after serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Compressor {
    #[default]
    None,
    Gzip,
}

/// A serializer/compressor pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct Encoder {
    #[serde(default)]
    pub serializer: Serializer,
    #[serde(default)]
    pub compressor: Compressor,
}

impl Encoder {
    pub fn new(serializer: Serializer, compressor: Compressor) -> Self {
        Self {
            serializer,
            compressor,
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let serialized = match self.serializer {
            Serializer::Json => serde_json::to_vec(value)?,
            Serializer::MessagePack => rmp_serde::to_vec_named(value)?,
        };

        match self.compressor {
            Compressor::None => Ok(serialized),
            Compressor::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&serialized)?;
                Ok(encoder.finish()?)
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        let decompressed = match self.compressor {
            Compressor::None => bytes.to_vec(),
            Compressor::Gzip => {
                let mut decoder = GzDecoder::new(bytes);
                let mut buf = Vec::new();
                decoder.read_to_end(&mut buf)?;
                buf
            }
        };

        match self.serializer {
            Serializer::Json => {
                serde_json::from_slice(&decompressed).map_err(TaskmillError::from)
            }
            Serializer::MessagePack => {
                rmp_serde::from_slice(&decompressed).map_err(TaskmillError::from)
            }
        }
    }
}
