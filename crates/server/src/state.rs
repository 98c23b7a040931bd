//! Shared broker state.
//!
//! One coarse mutex guards everything the handlers mutate: store, shadow
//! store, queue, version counters, artifacts, parameters and the dataloader
//! driver. Handlers hold it only across synchronous sections and wait on the
//! notify (with a poll fallback) whenever data is not ready yet.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use advtrain_proto::batch::encode_batch;
use advtrain_proto::wire::{self, DataloaderPayload};
use advtrain_proto::{FactorySpec, Parameters, VersionTriple};

use crate::data::{DataloaderDriver, Dataset, Registries};
use crate::error::BrokerError;
use crate::queue::{BatchQueue, SubmitOutcome};
use crate::store::BatchStore;
use crate::versions::VersionRegistry;

pub struct ServerState {
    pub core: Mutex<CoreState>,
    pub registries: Registries,
    /// Woken after every mutation that can unblock a waiting handler.
    pub notify: Notify,
}

impl ServerState {
    pub fn new(registries: Registries) -> Arc<Self> {
        Arc::new(Self {
            core: Mutex::new(CoreState::default()),
            registries,
            notify: Notify::new(),
        })
    }
}

pub struct CoreState {
    store: BatchStore,
    /// Clean bytes of every batch from first dispatch until its adversarial
    /// result is consumed; replayed after attack/architecture swaps.
    shadow: BatchStore,
    queue: BatchQueue,
    versions: VersionRegistry,
    params: Parameters,
    dataset: Option<Arc<dyn Dataset>>,
    driver: Option<DataloaderDriver>,
    attack: Option<Bytes>,
    model: Option<Bytes>,
    model_state: Option<Bytes>,
    /// Dispatch-time state version of each done batch, for telemetry.
    done_meta: HashMap<u64, u64>,
    next_id: u64,
}

impl Default for CoreState {
    fn default() -> Self {
        Self {
            store: BatchStore::default(),
            shadow: BatchStore::default(),
            queue: BatchQueue::default(),
            versions: VersionRegistry::default(),
            params: Parameters {
                max_patience: 300,
                queue_limit: 10,
            },
            dataset: None,
            driver: None,
            attack: None,
            model: None,
            model_state: None,
            done_meta: HashMap::new(),
            next_id: 0,
        }
    }
}

impl CoreState {
    // ---- setup endpoints ----

    /// `/dataset POST`: installs the dataset and clears all batch state; the
    /// old pipeline's ids are dead, but the id counter keeps climbing so
    /// in-flight submissions from before the swap stay unknown.
    pub fn install_dataset(
        &mut self,
        body: &[u8],
        registries: &Registries,
    ) -> Result<(), BrokerError> {
        let spec = FactorySpec::from_bytes(body)?;
        let dataset = registries.build_dataset(&spec)?;
        self.dataset = Some(dataset);
        self.driver = None;
        self.clear_batches();
        Ok(())
    }

    /// `/dataloader POST`: rebuilds the iterator and primes the free queue.
    /// Returns `Ok(false)` while no dataset is installed so the handler can
    /// block-poll instead of erroring. All fallible work (decode, build,
    /// priming pulls) happens before any mutation, so a dataloader that
    /// cannot produce leaves the previous pipeline untouched.
    pub fn try_install_dataloader(
        &mut self,
        body: &[u8],
        registries: &Registries,
    ) -> Result<bool, BrokerError> {
        let Some(dataset) = self.dataset.clone() else {
            return Ok(false);
        };
        let payload = DataloaderPayload::decode(body)?;
        let loader = registries.build_dataloader(dataset, &payload.spec)?;
        let mut driver = DataloaderDriver::new(loader);

        let mut primed = Vec::with_capacity(payload.params.queue_limit as usize);
        for _ in 0..payload.params.queue_limit {
            let samples = driver.pull()?;
            primed.push(encode_batch(&samples)?);
        }

        self.params = payload.params;
        self.driver = Some(driver);
        self.clear_batches();
        for bytes in primed {
            self.enqueue_batch(bytes);
        }
        Ok(true)
    }

    /// `/attack POST`: cached in-flight results are useless under the new
    /// attack, so every live id goes back to `free`.
    pub fn install_attack(&mut self, body: Bytes) -> u64 {
        self.attack = Some(body);
        let id = self.versions.bump_attack();
        self.reassign_all_to_free();
        id
    }

    /// `/model POST`: leading flag byte marks an architecture change, which
    /// additionally recycles all live ids.
    pub fn install_model(&mut self, body: &[u8]) -> Result<(u64, bool), BrokerError> {
        let (new_architecture, payload) = wire::split_arch_flag(body)?;
        self.model = Some(Bytes::copy_from_slice(payload));
        let id = self.versions.bump_model_arch();
        if new_architecture {
            self.reassign_all_to_free();
        }
        Ok((id, new_architecture))
    }

    /// `/model_state POST`: weight updates never invalidate in-flight work;
    /// the patience check catches stragglers at submission time.
    pub fn install_model_state(&mut self, body: Bytes) -> u64 {
        self.model_state = Some(body);
        self.versions.bump_model_state()
    }

    pub fn set_parameters(&mut self, params: Parameters) {
        self.params = params;
    }

    pub fn reset(&mut self) {
        *self = CoreState::default();
    }

    // ---- artifact reads ----

    pub fn attack(&self) -> Option<Bytes> {
        self.attack.clone()
    }

    pub fn model(&self) -> Option<Bytes> {
        self.model.clone()
    }

    pub fn model_state(&self) -> Option<Bytes> {
        self.model_state.clone()
    }

    pub fn version_triple(&self) -> VersionTriple {
        self.versions.triple()
    }

    pub fn num_batches(&self) -> Option<u64> {
        self.driver.as_ref().map(DataloaderDriver::num_batches)
    }

    // ---- batch flow ----

    /// Dispatches the smallest free id, pinning the current model state
    /// version and capturing the clean shadow copy on first dispatch.
    pub fn claim_clean(&mut self) -> Option<(u64, Bytes)> {
        let id = self.queue.claim_clean(self.versions.model_state_id())?;
        let bytes = self.store.peek(id).cloned()?;
        self.shadow.insert_if_absent(id, bytes.clone());
        Some((id, bytes))
    }

    /// Handles an `/adv_batch POST`. Accepted results replace the stored
    /// bytes and trigger a one-in-one-out refill of the free queue.
    pub fn submit_adv(&mut self, id: u64, body: Bytes) -> Result<SubmitOutcome, BrokerError> {
        let dispatched_at = self.queue.dispatch_version(id);
        let outcome = self.queue.admit_adv(
            id,
            self.versions.model_state_id(),
            self.params.max_patience,
            self.params.queue_limit,
        );
        if outcome == SubmitOutcome::Accepted {
            self.store.replace(id, body);
            if let Some(version) = dispatched_at {
                self.done_meta.insert(id, version);
            }
            if self.driver.is_some() {
                self.produce_one()?;
            }
        }
        Ok(outcome)
    }

    /// Pops the smallest done id and destroys it: bytes, shadow copy and
    /// telemetry all leave with the result.
    pub fn take_done(&mut self) -> Option<(u64, Bytes, Option<u64>)> {
        let id = self.queue.take_done()?;
        let bytes = self.store.take(id)?;
        self.shadow.take(id);
        let dispatched_at = self.done_meta.remove(&id);
        Some((id, bytes, dispatched_at))
    }

    pub fn reap_stale(&mut self) -> usize {
        self.queue
            .reap_stale(self.versions.model_state_id(), self.params.max_patience)
            .len()
    }

    fn produce_one(&mut self) -> Result<(), BrokerError> {
        let Some(driver) = self.driver.as_mut() else {
            return Ok(());
        };
        let samples = driver.pull()?;
        let bytes = encode_batch(&samples)?;
        self.enqueue_batch(bytes);
        Ok(())
    }

    fn enqueue_batch(&mut self, bytes: Bytes) {
        let id = self.next_id;
        self.next_id += 1;
        self.store.insert(id, bytes);
        self.queue.enqueue_free(id);
    }

    /// Recycles every live id back to `free`. Ids that had reached `done`
    /// carry adversarial bytes, so their clean shadow copies are restored
    /// before they are handed out again.
    fn reassign_all_to_free(&mut self) {
        for id in self.queue.reassign_all_to_free() {
            if let Some(clean) = self.shadow.peek(id).cloned() {
                self.store.replace(id, clean);
            }
            self.done_meta.remove(&id);
        }
    }

    fn clear_batches(&mut self) {
        self.store.clear();
        self.shadow.clear();
        self.queue.clear();
        self.done_meta.clear();
    }

    #[cfg(test)]
    pub(crate) fn queue_lens(&self) -> (usize, usize, usize) {
        (self.queue.free_len(), self.queue.working_len(), self.queue.done_len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use advtrain_proto::Sample;
    use advtrain_proto::batch::decode_batch;

    fn setup_core(num_samples: u64, queue_limit: u64, max_patience: u64) -> CoreState {
        let registries = Registries::default();
        let mut core = CoreState::default();
        let dataset = FactorySpec::new("synthetic").kwarg("len", num_samples);
        core.install_dataset(&dataset.to_bytes().unwrap(), &registries).unwrap();

        let payload = DataloaderPayload {
            spec: FactorySpec::new("batched").kwarg("batch_size", 1),
            params: Parameters { max_patience, queue_limit },
        };
        assert!(core.try_install_dataloader(&payload.encode().unwrap(), &registries).unwrap());
        core
    }

    #[test]
    fn dataloader_install_primes_queue_limit_batches() {
        let core = setup_core(10, 3, 10);
        assert_eq!(core.queue_lens(), (3, 0, 0));
    }

    #[test]
    fn dataloader_install_blocks_without_dataset() {
        let registries = Registries::default();
        let mut core = CoreState::default();
        let payload = DataloaderPayload {
            spec: FactorySpec::new("batched"),
            params: Parameters { max_patience: 10, queue_limit: 2 },
        };
        assert!(!core.try_install_dataloader(&payload.encode().unwrap(), &registries).unwrap());
    }

    #[test]
    fn failed_dataloader_install_leaves_the_old_pipeline_untouched() {
        let registries = Registries::default();
        let mut core = setup_core(2, 2, 10);
        assert_eq!(core.queue_lens(), (2, 0, 0));

        // drop_last with an oversized batch size yields zero batches, so the
        // first priming pull fails.
        let bad = DataloaderPayload {
            spec: FactorySpec::new("batched").kwarg("batch_size", 4).kwarg("drop_last", true),
            params: Parameters { max_patience: 1, queue_limit: 5 },
        };
        let err = core
            .try_install_dataloader(&bad.encode().unwrap(), &registries)
            .unwrap_err();
        assert!(matches!(err, BrokerError::EmptyDataset));

        // Previous driver, parameters and primed batches still serve.
        assert_eq!(core.queue_lens(), (2, 0, 0));
        assert_eq!(core.num_batches(), Some(2));
        let (id, _) = core.claim_clean().unwrap();
        assert_eq!(id, 0);
        let outcome = core.submit_adv(id, Bytes::from_static(b"adv")).unwrap();
        assert_eq!(outcome, SubmitOutcome::Accepted);
    }

    #[test]
    fn accepted_submission_refills_the_free_queue() {
        let mut core = setup_core(10, 2, 10);
        let (id, _) = core.claim_clean().unwrap();
        assert_eq!(core.queue_lens(), (1, 1, 0));

        let outcome = core.submit_adv(id, Bytes::from_static(b"adv")).unwrap();
        assert_eq!(outcome, SubmitOutcome::Accepted);
        // One in, one out: the accepted batch is replaced by a fresh one.
        assert_eq!(core.queue_lens(), (2, 0, 1));
    }

    #[test]
    fn architecture_swap_replays_clean_bytes() {
        let mut core = setup_core(4, 4, 10);

        let mut clean = HashMap::new();
        for _ in 0..4 {
            let (id, bytes) = core.claim_clean().unwrap();
            clean.insert(id, bytes);
        }
        core.submit_adv(2, Bytes::from_static(b"adv2")).unwrap();
        core.submit_adv(3, Bytes::from_static(b"adv3")).unwrap();

        core.install_model(&wire::join_arch_flag(true, b"resnet")).unwrap();

        // Ids 0..3 come back in order, all carrying their original bytes.
        for expected in 0..4u64 {
            let (id, bytes) = core.claim_clean().unwrap();
            assert_eq!(id, expected);
            if let Some(original) = clean.get(&id) {
                assert_eq!(&bytes, original);
            }
        }
    }

    #[test]
    fn attack_swap_recycles_all_live_ids() {
        let mut core = setup_core(4, 3, 10);
        let (id, _) = core.claim_clean().unwrap();
        core.submit_adv(id, Bytes::from_static(b"adv")).unwrap();
        core.claim_clean().unwrap();

        core.install_attack(Bytes::from_static(b"pgd"));
        let (free, working, done) = core.queue_lens();
        assert_eq!((working, done), (0, 0));
        assert_eq!(free, 4);
    }

    #[test]
    fn stale_submission_keeps_clean_bytes() {
        let mut core = setup_core(4, 3, 1);
        let (id, clean) = core.claim_clean().unwrap();
        for _ in 0..4 {
            core.install_model_state(Bytes::from_static(b"w"));
        }

        let outcome = core.submit_adv(id, Bytes::from_static(b"adv")).unwrap();
        assert_eq!(outcome, SubmitOutcome::Stale);

        let (again, bytes) = core.claim_clean().unwrap();
        assert_eq!(again, id);
        assert_eq!(bytes, clean);
    }

    #[test]
    fn take_done_destroys_the_id() {
        let mut core = setup_core(4, 3, 10);
        let (id, _) = core.claim_clean().unwrap();
        core.submit_adv(id, Bytes::from_static(b"adv")).unwrap();

        let (done_id, bytes, dispatched_at) = core.take_done().unwrap();
        assert_eq!(done_id, id);
        assert_eq!(bytes.as_ref(), b"adv");
        assert_eq!(dispatched_at, Some(0));
        assert!(core.take_done().is_none());
    }

    #[test]
    fn unknown_submission_is_dropped_silently() {
        let mut core = setup_core(4, 3, 10);
        let before = core.queue_lens();
        let outcome = core.submit_adv(999, Bytes::from_static(b"adv")).unwrap();
        assert_eq!(outcome, SubmitOutcome::Unknown);
        assert_eq!(core.queue_lens(), before);
    }

    #[test]
    fn reset_restores_fresh_process_state() {
        let mut core = setup_core(4, 3, 10);
        core.install_attack(Bytes::from_static(b"pgd"));
        core.claim_clean().unwrap();

        core.reset();
        assert_eq!(core.queue_lens(), (0, 0, 0));
        assert_eq!(core.version_triple(), VersionTriple::default());
        assert!(core.num_batches().is_none());
        assert!(core.attack().is_none());

        // Ids restart from zero after a full re-setup.
        let registries = Registries::default();
        let dataset = FactorySpec::new("synthetic").kwarg("len", 4);
        core.install_dataset(&dataset.to_bytes().unwrap(), &registries).unwrap();
        let payload = DataloaderPayload {
            spec: FactorySpec::new("batched").kwarg("batch_size", 1),
            params: Parameters { max_patience: 10, queue_limit: 2 },
        };
        core.try_install_dataloader(&payload.encode().unwrap(), &registries).unwrap();
        assert_eq!(core.claim_clean().unwrap().0, 0);
    }

    #[test]
    fn produced_batches_decode_to_dataset_samples() {
        let registries = Registries::default();
        let mut core = CoreState::default();
        let samples: Vec<serde_json::Value> = [("x0", "y0"), ("x1", "y1")]
            .iter()
            .map(|(x, y)| {
                use base64::Engine as _;
                use base64::engine::general_purpose::STANDARD as B64;
                serde_json::json!({ "input": B64.encode(x), "label": B64.encode(y) })
            })
            .collect();
        let dataset = FactorySpec::new("inline").kwarg("samples", samples);
        core.install_dataset(&dataset.to_bytes().unwrap(), &registries).unwrap();
        let payload = DataloaderPayload {
            spec: FactorySpec::new("batched").kwarg("batch_size", 2),
            params: Parameters { max_patience: 10, queue_limit: 1 },
        };
        core.try_install_dataloader(&payload.encode().unwrap(), &registries).unwrap();

        let (_, bytes) = core.claim_clean().unwrap();
        let decoded = decode_batch(&bytes).unwrap();
        assert_eq!(
            decoded,
            vec![Sample::new(b"x0".as_slice(), b"y0".as_slice()), Sample::new(b"x1".as_slice(), b"y1".as_slice())]
        );
    }
}
