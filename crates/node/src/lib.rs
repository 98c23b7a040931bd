//! Worker node: pulls clean batches from the execution server, perturbs them
//! against the current attack/model pair, and pushes the adversarial results
//! back.

pub mod config;
pub mod registry;
pub mod worker;

pub use config::{Device, NodeConfig};
pub use worker::NodeContext;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("invalid server address {0:?}")]
    BadHost(String),
    #[error(transparent)]
    Transport(#[from] advtrain_proto::http::TransportError),
    #[error(transparent)]
    Wire(#[from] advtrain_proto::WireError),
    #[error("unknown {kind} factory {name:?}")]
    UnknownFactory { kind: &'static str, name: String },
    #[error("{kind} factory {name:?}: {reason}")]
    Factory {
        kind: &'static str,
        name: String,
        reason: String,
    },
    #[error("{0} not initialised")]
    NotInitialized(&'static str),
    #[error("http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
