//! Dataset/dataloader registry and the driver that feeds the free queue.
//!
//! Wire payloads name a factory instead of shipping code; the registries map
//! those names to constructors. The reference factories below cover testing
//! and synthetic workloads; real deployments register their own alongside.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::Deserialize;

use advtrain_proto::{FactorySpec, Sample};

use crate::error::BrokerError;

pub trait Dataset: Send + Sync + std::fmt::Debug {
    fn len(&self) -> u64;
    fn sample(&self, index: u64) -> Sample;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A batching iterator over a dataset. `next_batch` returns `None` at the
/// end of an epoch; the driver resets and pulls again, cycling forever.
pub trait Dataloader: Send {
    fn num_batches(&self) -> u64;
    fn next_batch(&mut self) -> Option<Vec<Sample>>;
    fn reset(&mut self);
}

// ---- reference datasets ----

/// Samples supplied inline in the factory kwargs, base64-encoded.
#[derive(Debug)]
struct InlineDataset {
    samples: Vec<Sample>,
}

#[derive(Deserialize)]
struct InlineSampleSpec {
    input: String,
    label: String,
}

impl InlineDataset {
    fn build(spec: &FactorySpec) -> Result<Self, BrokerError> {
        let raw = spec.kwargs.get("samples").cloned().ok_or(BrokerError::Factory {
            kind: "dataset",
            name: spec.name.clone(),
            reason: "missing \"samples\" kwarg".to_string(),
        })?;
        let specs: Vec<InlineSampleSpec> =
            serde_json::from_value(raw).map_err(|err| BrokerError::Factory {
                kind: "dataset",
                name: spec.name.clone(),
                reason: format!("bad \"samples\" kwarg: {err}"),
            })?;

        let mut samples = Vec::with_capacity(specs.len());
        for s in specs {
            let input = B64.decode(s.input).map_err(|err| BrokerError::Factory {
                kind: "dataset",
                name: spec.name.clone(),
                reason: format!("bad base64 input: {err}"),
            })?;
            let label = B64.decode(s.label).map_err(|err| BrokerError::Factory {
                kind: "dataset",
                name: spec.name.clone(),
                reason: format!("bad base64 label: {err}"),
            })?;
            samples.push(Sample::new(input, label));
        }
        Ok(Self { samples })
    }
}

impl Dataset for InlineDataset {
    fn len(&self) -> u64 {
        self.samples.len() as u64
    }

    fn sample(&self, index: u64) -> Sample {
        self.samples[index as usize].clone()
    }
}

/// Deterministic generated samples, for smoke tests and load drills.
#[derive(Debug)]
struct SyntheticDataset {
    len: u64,
    sample_len: usize,
    num_classes: u64,
}

impl SyntheticDataset {
    fn build(spec: &FactorySpec) -> Result<Self, BrokerError> {
        let len = spec.kwarg_u64("len").ok_or(BrokerError::Factory {
            kind: "dataset",
            name: spec.name.clone(),
            reason: "missing \"len\" kwarg".to_string(),
        })?;
        Ok(Self {
            len,
            sample_len: spec.kwarg_u64("sample_len").unwrap_or(32) as usize,
            num_classes: spec.kwarg_u64("num_classes").unwrap_or(10).max(1),
        })
    }
}

impl Dataset for SyntheticDataset {
    fn len(&self) -> u64 {
        self.len
    }

    fn sample(&self, index: u64) -> Sample {
        // Tiny multiplicative generator; stable across runs for a given index.
        let mut state = index.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(1);
        let input = (0..self.sample_len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 56) as u8
            })
            .collect::<Vec<u8>>();
        Sample::new(input, (index % self.num_classes).to_be_bytes().to_vec())
    }
}

// ---- reference dataloader ----

/// Chunks a dataset into fixed-size batches in index order.
struct BatchedLoader {
    dataset: Arc<dyn Dataset>,
    batch_size: u64,
    drop_last: bool,
    cursor: u64,
}

impl BatchedLoader {
    fn build(dataset: Arc<dyn Dataset>, spec: &FactorySpec) -> Result<Self, BrokerError> {
        let batch_size = spec.kwarg_u64("batch_size").unwrap_or(1).max(1);
        Ok(Self {
            dataset,
            batch_size,
            drop_last: spec.kwarg_bool("drop_last").unwrap_or(false),
            cursor: 0,
        })
    }
}

impl Dataloader for BatchedLoader {
    fn num_batches(&self) -> u64 {
        let len = self.dataset.len();
        if self.drop_last {
            len / self.batch_size
        } else {
            len.div_ceil(self.batch_size)
        }
    }

    fn next_batch(&mut self) -> Option<Vec<Sample>> {
        let len = self.dataset.len();
        if self.cursor >= len {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(len);
        if self.drop_last && end - self.cursor < self.batch_size {
            return None;
        }
        let batch = (self.cursor..end).map(|i| self.dataset.sample(i)).collect();
        self.cursor = end;
        Some(batch)
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}

// ---- registries ----

type DatasetCtor = fn(&FactorySpec) -> Result<Arc<dyn Dataset>, BrokerError>;
type DataloaderCtor = fn(Arc<dyn Dataset>, &FactorySpec) -> Result<Box<dyn Dataloader>, BrokerError>;

pub struct Registries {
    datasets: HashMap<&'static str, DatasetCtor>,
    dataloaders: HashMap<&'static str, DataloaderCtor>,
}

impl Default for Registries {
    fn default() -> Self {
        let mut datasets: HashMap<&'static str, DatasetCtor> = HashMap::new();
        datasets.insert("inline", |spec| Ok(Arc::new(InlineDataset::build(spec)?)));
        datasets.insert("synthetic", |spec| Ok(Arc::new(SyntheticDataset::build(spec)?)));

        let mut dataloaders: HashMap<&'static str, DataloaderCtor> = HashMap::new();
        dataloaders.insert("batched", |dataset, spec| {
            Ok(Box::new(BatchedLoader::build(dataset, spec)?))
        });

        Self { datasets, dataloaders }
    }
}

impl Registries {
    pub fn build_dataset(&self, spec: &FactorySpec) -> Result<Arc<dyn Dataset>, BrokerError> {
        let ctor = self.datasets.get(spec.name.as_str()).ok_or_else(|| {
            BrokerError::UnknownFactory {
                kind: "dataset",
                name: spec.name.clone(),
            }
        })?;
        ctor(spec)
    }

    pub fn build_dataloader(
        &self,
        dataset: Arc<dyn Dataset>,
        spec: &FactorySpec,
    ) -> Result<Box<dyn Dataloader>, BrokerError> {
        let ctor = self.dataloaders.get(spec.name.as_str()).ok_or_else(|| {
            BrokerError::UnknownFactory {
                kind: "dataloader",
                name: spec.name.clone(),
            }
        })?;
        ctor(dataset, spec)
    }
}

// ---- driver ----

/// Wraps the installed dataloader with infinite wrap-around. Id allocation
/// and store/queue insertion live in the core state, which owns the counter.
pub struct DataloaderDriver {
    loader: Box<dyn Dataloader>,
}

impl DataloaderDriver {
    pub fn new(loader: Box<dyn Dataloader>) -> Self {
        Self { loader }
    }

    pub fn num_batches(&self) -> u64 {
        self.loader.num_batches()
    }

    /// Pulls the next clean batch, restarting the epoch on exhaustion.
    pub fn pull(&mut self) -> Result<Vec<Sample>, BrokerError> {
        if let Some(batch) = self.loader.next_batch() {
            return Ok(batch);
        }
        self.loader.reset();
        self.loader.next_batch().ok_or(BrokerError::EmptyDataset)
    }
}
