//! Batch sample codec.
//!
//! A batch on the wire is an opaque blob as far as the broker is concerned.
//! The parties that *create* or *transform* batches (the server's dataloader
//! driver, worker perturbation glue, client-side merge/split) encode them as
//! a bincode `Vec<Sample>` of already-serialized `(input, label)` pairs.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::wire::WireError;

/// One `(input, label)` pair in serialized form. The tensor encoding inside
/// the two byte vectors is chosen by the surrounding ML stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub input: Vec<u8>,
    pub label: Vec<u8>,
}

impl Sample {
    pub fn new(input: impl Into<Vec<u8>>, label: impl Into<Vec<u8>>) -> Self {
        Self {
            input: input.into(),
            label: label.into(),
        }
    }
}

pub fn encode_batch(samples: &[Sample]) -> Result<Bytes, WireError> {
    Ok(Bytes::from(bincode::serialize(samples)?))
}

pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Sample>, WireError> {
    Ok(bincode::deserialize(bytes)?)
}
