//! Byte-level framing for the broker endpoints.

use crate::factory::FactorySpec;

pub const EP_DATASET: &str = "/dataset";
pub const EP_DATALOADER: &str = "/dataloader";
pub const EP_ATTACK: &str = "/attack";
pub const EP_MODEL: &str = "/model";
pub const EP_MODEL_STATE: &str = "/model_state";
pub const EP_PARAMETERS: &str = "/parameters";
pub const EP_RESET: &str = "/reset";
pub const EP_NUM_BATCHES: &str = "/num_batches";
pub const EP_IDS: &str = "/ids";
pub const EP_CLEAN_BATCH: &str = "/clean_batch";
pub const EP_ADV_BATCH: &str = "/adv_batch";

/// Telemetry header attached to `/adv_batch` GET responses.
pub const EXTRA_DATA_HEADER: &str = "x-extra-data";

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("truncated payload: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("invalid factory spec: {0}")]
    BadSpec(#[from] serde_json::Error),
    #[error("batch codec: {0}")]
    Codec(#[from] bincode::Error),
}

pub fn decode_u64(bytes: &[u8]) -> Result<u64, WireError> {
    let arr: [u8; 8] = bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or(WireError::Truncated {
            expected: 8,
            got: bytes.len(),
        })?;
    Ok(u64::from_be_bytes(arr))
}

/// Splits an `id:u64-BE ∥ payload` body as used by `/clean_batch` responses
/// and `/adv_batch POST` requests.
pub fn split_id_prefix(body: &[u8]) -> Result<(u64, &[u8]), WireError> {
    let id = decode_u64(body)?;
    Ok((id, &body[8..]))
}

pub fn join_id_prefix(id: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Splits the 1-byte new-architecture flag off a `/model POST` body.
pub fn split_arch_flag(body: &[u8]) -> Result<(bool, &[u8]), WireError> {
    let flag = *body.first().ok_or(WireError::Truncated {
        expected: 1,
        got: 0,
    })?;
    Ok((flag != 0, &body[1..]))
}

pub fn join_arch_flag(new_architecture: bool, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(u8::from(new_architecture));
    out.extend_from_slice(payload);
    out
}

/// The three artifact counters served by `/ids` as 24 big-endian bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionTriple {
    pub attack_id: u64,
    pub model_arch_id: u64,
    pub model_state_id: u64,
}

impl VersionTriple {
    pub fn encode(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[..8].copy_from_slice(&self.attack_id.to_be_bytes());
        out[8..16].copy_from_slice(&self.model_arch_id.to_be_bytes());
        out[16..].copy_from_slice(&self.model_state_id.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < 24 {
            return Err(WireError::Truncated {
                expected: 24,
                got: bytes.len(),
            });
        }
        Ok(Self {
            attack_id: decode_u64(&bytes[..8])?,
            model_arch_id: decode_u64(&bytes[8..16])?,
            model_state_id: decode_u64(&bytes[16..24])?,
        })
    }
}

/// Broker tuning knobs carried by `/parameters POST` as 16 big-endian bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameters {
    /// Staleness threshold in model-state-version ticks.
    pub max_patience: u64,
    /// Soft upper bound on the done queue.
    pub queue_limit: u64,
}

impl Parameters {
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.max_patience.to_be_bytes());
        out[8..].copy_from_slice(&self.queue_limit.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < 16 {
            return Err(WireError::Truncated {
                expected: 16,
                got: bytes.len(),
            });
        }
        Ok(Self {
            max_patience: decode_u64(&bytes[..8])?,
            queue_limit: decode_u64(&bytes[8..16])?,
        })
    }
}

/// `/dataloader POST` body: the dataloader factory spec as JSON, followed by
/// `max_patience ∥ queue_limit` as the final 16 bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct DataloaderPayload {
    pub spec: FactorySpec,
    pub params: Parameters,
}

impl DataloaderPayload {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = serde_json::to_vec(&self.spec)?;
        out.extend_from_slice(&self.params.encode());
        Ok(out)
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        if body.len() < 16 {
            return Err(WireError::Truncated {
                expected: 16,
                got: body.len(),
            });
        }
        let (spec_bytes, param_bytes) = body.split_at(body.len() - 16);
        Ok(Self {
            spec: FactorySpec::from_bytes(spec_bytes)?,
            params: Parameters::decode(param_bytes)?,
        })
    }
}
