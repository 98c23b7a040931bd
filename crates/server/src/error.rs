//! Broker error taxonomy.
//!
//! Stale, dropped and unknown submissions are not errors (the queue handles
//! them silently); what remains is malformed input and factory failures.

use advtrain_proto::WireError;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("unknown {kind} factory {name:?}")]
    UnknownFactory { kind: &'static str, name: String },
    #[error("{kind} factory {name:?}: {reason}")]
    Factory {
        kind: &'static str,
        name: String,
        reason: String,
    },
    #[error("dataset is empty; dataloader cannot produce a batch")]
    EmptyDataset,
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl BrokerError {
    /// Malformed request bodies are the caller's fault; everything else is a
    /// server-side failure.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, BrokerError::Wire(_))
    }
}
