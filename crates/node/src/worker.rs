//! The worker loop: poll versions, refresh artifacts, pull, perturb, push.

use reqwest::Url;

use advtrain_proto::batch::{decode_batch, encode_batch};
use advtrain_proto::http::{endpoint, get_data, send_data};
use advtrain_proto::{FactorySpec, VersionTriple, wire};

use crate::NodeError;
use crate::config::Device;
use crate::registry::{Attack, Model, NodeRegistry};

/// All mutable worker state, threaded through the loop instead of living in
/// globals: the pinned device, the current attack/model pair, and the cached
/// version triple that decides which artifacts to refetch.
pub struct NodeContext {
    http: reqwest::Client,
    base: Url,
    device: Device,
    registry: NodeRegistry,
    attack: Option<Box<dyn Attack>>,
    model: Option<Box<dyn Model>>,
    cached: VersionTriple,
    max_retries: Option<u32>,
}

impl NodeContext {
    pub fn connect(
        host: &str,
        device: Device,
        max_retries: Option<u32>,
    ) -> Result<Self, NodeError> {
        let base = Url::parse(&format!("http://{host}/"))
            .map_err(|_| NodeError::BadHost(host.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base,
            device,
            registry: NodeRegistry::default(),
            attack: None,
            model: None,
            cached: VersionTriple::default(),
            max_retries,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn url(&self, path: &str) -> Url {
        endpoint(&self.base, path)
    }

    async fn get(&self, path: &str) -> Result<bytes::Bytes, NodeError> {
        Ok(get_data(&self.http, self.url(path), self.max_retries).await?)
    }

    /// Compares the server's version triple against the cached one and
    /// refetches whatever moved. A rebuilt model always reloads weights,
    /// since a fresh build starts uninitialized.
    pub async fn refresh_artifacts(&mut self) -> Result<(), NodeError> {
        let ids = VersionTriple::decode(&self.get(wire::EP_IDS).await?)?;

        if self.attack.is_none() || ids.attack_id != self.cached.attack_id {
            let spec = FactorySpec::from_bytes(&self.get(wire::EP_ATTACK).await?)?;
            self.attack = Some(self.registry.build_attack(&spec)?);
            self.cached.attack_id = ids.attack_id;
            tracing::info!(attack = %spec.name, attack_id = ids.attack_id, "attack rebuilt");
        }

        let mut model_rebuilt = false;
        if self.model.is_none() || ids.model_arch_id != self.cached.model_arch_id {
            let spec = FactorySpec::from_bytes(&self.get(wire::EP_MODEL).await?)?;
            self.model = Some(self.registry.build_model(&spec)?);
            self.cached.model_arch_id = ids.model_arch_id;
            model_rebuilt = true;
            tracing::info!(model = %spec.name, model_arch_id = ids.model_arch_id, "model rebuilt");
        }

        if model_rebuilt || ids.model_state_id != self.cached.model_state_id {
            let state = self.get(wire::EP_MODEL_STATE).await?;
            if let Some(model) = self.model.as_mut() {
                model.load_state(&state)?;
            }
            self.cached.model_state_id = ids.model_state_id;
            tracing::debug!(model_state_id = ids.model_state_id, "weights loaded");
        }

        Ok(())
    }

    /// One full iteration. Returns the processed batch id.
    pub async fn run_once(&mut self) -> Result<u64, NodeError> {
        self.refresh_artifacts().await?;

        let body = self.get(wire::EP_CLEAN_BATCH).await?;
        let (id, payload) = wire::split_id_prefix(&body)?;
        let samples = decode_batch(payload)?;

        let attack = self.attack.as_deref().ok_or(NodeError::NotInitialized("attack"))?;
        let model = self.model.as_deref().ok_or(NodeError::NotInitialized("model"))?;
        let adv = attack.perturb(model, &samples);

        let out = encode_batch(&adv)?;
        send_data(
            &self.http,
            self.url(wire::EP_ADV_BATCH),
            wire::join_id_prefix(id, &out).into(),
            self.max_retries,
        )
        .await?;
        tracing::debug!(id, batch_samples = adv.len(), "adversarial batch submitted");
        Ok(id)
    }

    pub async fn run(&mut self) -> Result<(), NodeError> {
        loop {
            self.run_once().await?;
        }
    }
}
