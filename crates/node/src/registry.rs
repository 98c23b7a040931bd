//! Node-side attack and model registry.
//!
//! Mirrors the server's dataset registry: the wire carries factory names,
//! the node maps them to constructors. The reference factories below are
//! deterministic byte-level stand-ins; a real deployment registers its
//! tensor-aware attacks (PGD and friends) and model builders next to them.

use std::collections::HashMap;

use advtrain_proto::{FactorySpec, Sample};

use crate::NodeError;

/// A classifier under attack. Only the weight-loading seam matters to the
/// worker loop; everything else is between the model and the attack.
pub trait Model: Send + Sync {
    fn load_state(&mut self, state: &[u8]) -> Result<(), NodeError>;
    fn state(&self) -> &[u8];
}

/// Adversarial perturbation against a specific model.
pub trait Attack: Send + Sync {
    fn perturb(&self, model: &dyn Model, samples: &[Sample]) -> Vec<Sample>;
}

/// Opaque weight holder; stands in for an actual network.
struct LinearModel {
    weights: Vec<u8>,
}

impl Model for LinearModel {
    fn load_state(&mut self, state: &[u8]) -> Result<(), NodeError> {
        self.weights = state.to_vec();
        Ok(())
    }

    fn state(&self) -> &[u8] {
        &self.weights
    }
}

/// Returns batches unchanged. Useful for measuring pipeline overhead.
struct IdentityAttack;

impl Attack for IdentityAttack {
    fn perturb(&self, _model: &dyn Model, samples: &[Sample]) -> Vec<Sample> {
        samples.to_vec()
    }
}

/// Flips every input bit, leaving labels untouched. A maximal deterministic
/// perturbation that makes end-to-end tests self-checking.
struct InvertAttack;

impl Attack for InvertAttack {
    fn perturb(&self, _model: &dyn Model, samples: &[Sample]) -> Vec<Sample> {
        samples
            .iter()
            .map(|s| Sample::new(s.input.iter().map(|b| !b).collect::<Vec<u8>>(), s.label.clone()))
            .collect()
    }
}

type AttackCtor = fn(&FactorySpec) -> Result<Box<dyn Attack>, NodeError>;
type ModelCtor = fn(&FactorySpec) -> Result<Box<dyn Model>, NodeError>;

pub struct NodeRegistry {
    attacks: HashMap<&'static str, AttackCtor>,
    models: HashMap<&'static str, ModelCtor>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        let mut attacks: HashMap<&'static str, AttackCtor> = HashMap::new();
        attacks.insert("identity", |_spec| Ok(Box::new(IdentityAttack)));
        attacks.insert("invert", |_spec| Ok(Box::new(InvertAttack)));

        let mut models: HashMap<&'static str, ModelCtor> = HashMap::new();
        models.insert("linear", |_spec| Ok(Box::new(LinearModel { weights: Vec::new() })));

        Self { attacks, models }
    }
}

impl NodeRegistry {
    pub fn build_attack(&self, spec: &FactorySpec) -> Result<Box<dyn Attack>, NodeError> {
        let ctor = self.attacks.get(spec.name.as_str()).ok_or_else(|| {
            NodeError::UnknownFactory {
                kind: "attack",
                name: spec.name.clone(),
            }
        })?;
        ctor(spec)
    }

    pub fn build_model(&self, spec: &FactorySpec) -> Result<Box<dyn Model>, NodeError> {
        let ctor = self.models.get(spec.name.as_str()).ok_or_else(|| {
            NodeError::UnknownFactory {
                kind: "model",
                name: spec.name.clone(),
            }
        })?;
        ctor(spec)
    }
}
