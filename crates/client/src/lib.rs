//! Training-side adversarial batch loader.
//!
//! Wraps the execution server in an iterable: background downloader tasks
//! prefetch adversarial batches into a bounded buffer, a dedicated uploader
//! pushes coalesced weight snapshots, and the training loop pulls exactly
//! `num_batches` batches per epoch.

mod engine;
mod scale;

use bytes::Bytes;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use advtrain_proto::FactorySpec;
use advtrain_proto::http::TransportError;
use advtrain_proto::wire::WireError;

pub use engine::AdvBatchLoader;

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("batch_scale must be a positive finite number, got {0}")]
    BadScale(f64),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("batch downloaders stopped")]
    Closed,
}

/// Configuration for [`AdvBatchLoader::start`].
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Execution server base URL (e.g. `http://127.0.0.1:8080`).
    pub host: Url,

    /// Dataset factory installed on the server.
    pub dataset: FactorySpec,

    /// Dataloader factory installed on the server.
    pub dataloader: FactorySpec,

    /// Attack factory the worker fleet should run.
    pub attack: FactorySpec,

    /// Model factory the worker fleet should build.
    pub model: FactorySpec,

    /// Initial weight snapshot uploaded during setup.
    pub initial_model_state: Vec<u8>,

    /// Staleness threshold in model-state-version ticks.
    pub max_patience: u64,

    /// Soft bound on the server-side done queue.
    pub queue_limit: u64,

    /// Number of concurrent batch-downloader tasks.
    pub num_fetchers: usize,

    /// Capacity of the prefetch buffer consumed by the training loop.
    pub buffer_size: usize,

    /// `k ≥ 1` merges `k` adjacent fetched batches into one; `0 < k < 1`
    /// splits each fetched batch into `round(1/k)` slices.
    pub batch_scale: f64,

    /// Transport retry cap (`None` retries forever).
    pub max_retries: Option<u32>,
}

impl LoaderConfig {
    /// Default number of downloader tasks.
    pub const DEFAULT_NUM_FETCHERS: usize = 2;

    /// Default prefetch buffer capacity.
    pub const DEFAULT_BUFFER_SIZE: usize = 5;

    pub fn new(host: Url) -> Self {
        Self {
            host,
            dataset: FactorySpec::default(),
            dataloader: FactorySpec::default(),
            attack: FactorySpec::default(),
            model: FactorySpec::default(),
            initial_model_state: Vec::new(),
            max_patience: 300,
            queue_limit: 10,
            num_fetchers: Self::DEFAULT_NUM_FETCHERS,
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
            batch_scale: 1.0,
            max_retries: None,
        }
    }
}

/// Loader event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum LoaderEvent {
    /// Setup finished; downloaders and the uploader are running.
    Started,
    /// A coalesced weight snapshot reached the server.
    ModelStateUploaded,
    /// A non-fatal problem (e.g. a failed weight upload).
    Warning {
        /// Warning message.
        message: String,
    },
    /// A downloader gave up after exhausting its retries.
    Error {
        /// Error message.
        message: String,
    },
    /// The loader shut down.
    Stopped,
}

/// One adversarial batch as delivered to the training loop.
pub type AdvBatch = Bytes;
