//! Loader runtime: setup posts, downloader pool and the coalescing weight
//! uploader.

use bytes::Bytes;
use reqwest::Url;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;

use advtrain_proto::batch::{decode_batch, encode_batch};
use advtrain_proto::http::{endpoint, get_data, send_data};
use advtrain_proto::wire::{self, DataloaderPayload};
use advtrain_proto::Parameters;

use crate::scale::BatchScale;
use crate::{LoaderConfig, LoaderError, LoaderEvent};

/// Handle to a running loader. Dropping it stops the background tasks; call
/// [`AdvBatchLoader::stop`] for an orderly shutdown.
pub struct AdvBatchLoader {
    batch_rx: mpsc::Receiver<Bytes>,
    model_tx: watch::Sender<Option<Vec<u8>>>,
    event_tx: broadcast::Sender<LoaderEvent>,
    stop_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
    num_batches: u64,
    pulled_this_epoch: u64,
}

impl AdvBatchLoader {
    /// Posts the full server setup (dataset, dataloader, attack, model,
    /// weights, parameters), fetches the epoch length, and spawns the
    /// downloader pool plus the weight uploader.
    pub async fn start(mut config: LoaderConfig) -> Result<Self, LoaderError> {
        let scale = BatchScale::from_factor(config.batch_scale)?;
        config.num_fetchers = config.num_fetchers.max(1);
        config.buffer_size = config.buffer_size.max(1);

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        let base = config.host.clone();
        let retries = config.max_retries;

        let post = |path: &'static str, body: Vec<u8>| {
            let http = http.clone();
            let url = endpoint(&base, path);
            async move { send_data(&http, url, body.into(), retries).await }
        };

        let params = Parameters {
            max_patience: config.max_patience,
            queue_limit: config.queue_limit,
        };
        post(wire::EP_DATASET, config.dataset.to_bytes()?).await?;
        post(
            wire::EP_DATALOADER,
            DataloaderPayload { spec: config.dataloader.clone(), params }.encode()?,
        )
        .await?;
        post(wire::EP_ATTACK, config.attack.to_bytes()?).await?;
        post(
            wire::EP_MODEL,
            wire::join_arch_flag(false, &config.model.to_bytes()?),
        )
        .await?;
        post(wire::EP_MODEL_STATE, config.initial_model_state.clone()).await?;
        post(wire::EP_PARAMETERS, params.encode().to_vec()).await?;

        let raw = get_data(&http, endpoint(&base, wire::EP_NUM_BATCHES), retries).await?;
        let source_num_batches = wire::decode_u64(&raw)?;
        let num_batches = scale.scaled_num_batches(source_num_batches);

        let (batch_tx, batch_rx) = mpsc::channel::<Bytes>(config.buffer_size);
        let (model_tx, model_rx) = watch::channel::<Option<Vec<u8>>>(None);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (event_tx, _) = broadcast::channel::<LoaderEvent>(64);

        let mut tasks = JoinSet::new();
        for _ in 0..config.num_fetchers {
            tasks.spawn(run_fetcher(
                http.clone(),
                base.clone(),
                scale,
                batch_tx.clone(),
                event_tx.clone(),
                stop_rx.clone(),
                retries,
            ));
        }
        tasks.spawn(run_uploader(
            http.clone(),
            base.clone(),
            model_rx,
            event_tx.clone(),
            stop_rx.clone(),
            retries,
        ));

        let _ = event_tx.send(LoaderEvent::Started);

        Ok(Self {
            batch_rx,
            model_tx,
            event_tx,
            stop_tx,
            tasks,
            num_batches,
            pulled_this_epoch: 0,
        })
    }

    /// Epoch length after batch rescaling.
    pub fn num_batches(&self) -> u64 {
        self.num_batches
    }

    /// Next adversarial batch, or `None` at the epoch boundary. The counter
    /// resets on `None`, so the next call starts a fresh epoch.
    pub async fn next_batch(&mut self) -> Result<Option<Bytes>, LoaderError> {
        if self.pulled_this_epoch >= self.num_batches {
            self.pulled_this_epoch = 0;
            return Ok(None);
        }
        match self.batch_rx.recv().await {
            Some(bytes) => {
                self.pulled_this_epoch += 1;
                Ok(Some(bytes))
            }
            None => Err(LoaderError::Closed),
        }
    }

    /// Queues a weight snapshot for upload. Bursts coalesce: only the most
    /// recent snapshot is uploaded once the uploader catches up.
    pub fn update_model_state(&self, weights: Vec<u8>) {
        let _ = self.model_tx.send(Some(weights));
    }

    /// Subscribe to the loader event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<LoaderEvent> {
        self.event_tx.subscribe()
    }

    /// Orderly shutdown: signals every task, unblocks pending sends, and
    /// waits for them to finish.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        self.batch_rx.close();
        while self.tasks.join_next().await.is_some() {}
        let _ = self.event_tx.send(LoaderEvent::Stopped);
    }
}

async fn run_fetcher(
    http: reqwest::Client,
    base: Url,
    scale: BatchScale,
    batch_tx: mpsc::Sender<Bytes>,
    event_tx: broadcast::Sender<LoaderEvent>,
    mut stop_rx: watch::Receiver<bool>,
    retries: Option<u32>,
) {
    loop {
        let fetched = tokio::select! {
            _ = stop_rx.wait_for(|stopped| *stopped) => return,
            res = fetch_scaled(&http, &base, scale, retries) => res,
        };
        match fetched {
            Ok(batches) => {
                for bytes in batches {
                    if batch_tx.send(bytes).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                let _ = event_tx.send(LoaderEvent::Error {
                    message: format!("batch fetch failed: {err}"),
                });
                return;
            }
        }
    }
}

/// One downloader step: a single fetch, `k` merged fetches, or one fetch cut
/// into slices. Merge decodes and re-encodes; the plain path stays opaque.
async fn fetch_scaled(
    http: &reqwest::Client,
    base: &Url,
    scale: BatchScale,
    retries: Option<u32>,
) -> Result<Vec<Bytes>, LoaderError> {
    let url = endpoint(base, wire::EP_ADV_BATCH);
    match scale {
        BatchScale::Merge(1) => Ok(vec![get_data(http, url, retries).await?]),
        BatchScale::Merge(k) => {
            let mut merged = Vec::new();
            for _ in 0..k {
                let blob = get_data(http, url.clone(), retries).await?;
                merged.extend(decode_batch(&blob)?);
            }
            Ok(vec![encode_batch(&merged)?])
        }
        BatchScale::Split(m) => {
            let blob = get_data(http, url, retries).await?;
            let samples = decode_batch(&blob)?;
            crate::scale::split_slices(&samples, m)
                .into_iter()
                .map(|slice| encode_batch(slice).map_err(LoaderError::from))
                .collect()
        }
    }
}

async fn run_uploader(
    http: reqwest::Client,
    base: Url,
    mut model_rx: watch::Receiver<Option<Vec<u8>>>,
    event_tx: broadcast::Sender<LoaderEvent>,
    mut stop_rx: watch::Receiver<bool>,
    retries: Option<u32>,
) {
    let url = endpoint(&base, wire::EP_MODEL_STATE);
    loop {
        tokio::select! {
            _ = stop_rx.wait_for(|stopped| *stopped) => return,
            changed = model_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }

        // Latest snapshot only; anything older was superseded while waiting.
        let Some(weights) = model_rx.borrow_and_update().clone() else {
            continue;
        };

        let upload = tokio::select! {
            _ = stop_rx.wait_for(|stopped| *stopped) => return,
            res = send_data(&http, url.clone(), weights.into(), retries) => res,
        };
        match upload {
            Ok(()) => {
                let _ = event_tx.send(LoaderEvent::ModelStateUploaded);
            }
            Err(err) => {
                let _ = event_tx.send(LoaderEvent::Warning {
                    message: format!("weight upload failed: {err}"),
                });
            }
        }
    }
}
