//! Model resolution

use cobalt_types::{CobaltError, ModelId, ModelSpec, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Resolves a model id to its location, footprint and shape
pub trait ModelRegistry: Send + Sync {
    /// `path_hint` overrides the registered path when given.
    fn resolve(&self, model_id: &ModelId, path_hint: Option<&str>) -> Result<ModelSpec>;
}

/// In-memory registry with per-model entries and an optional fallback spec
#[derive(Debug, Default)]
pub struct StaticModelRegistry {
    fallback: Option<ModelSpec>,
    models: RwLock<HashMap<ModelId, ModelSpec>>,
}

impl StaticModelRegistry {
    /// Registry that knows only explicitly registered models
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry answering unknown ids with `spec` (path derived from the id)
    pub fn with_fallback(spec: ModelSpec) -> Self {
        Self {
            fallback: Some(spec),
            models: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, model_id: impl Into<ModelId>, spec: ModelSpec) -> Result<()> {
        let model_id = model_id.into();
        spec.validate()?;
        debug!("registered model {} at {}", model_id, spec.path);
        self.models.write().insert(model_id, spec);
        Ok(())
    }

    pub fn contains(&self, model_id: &ModelId) -> bool {
        self.models.read().contains_key(model_id)
    }
}

impl ModelRegistry for StaticModelRegistry {
    fn resolve(&self, model_id: &ModelId, path_hint: Option<&str>) -> Result<ModelSpec> {
        let mut spec = match self.models.read().get(model_id) {
            Some(spec) => spec.clone(),
            None => {
                let mut spec = self.fallback.clone().ok_or_else(|| {
                    CobaltError::not_found(format!("model {} is not registered", model_id))
                })?;
                spec.path = format!("models/{}", model_id);
                spec
            }
        };
        if let Some(path) = path_hint.filter(|p| !p.is_empty()) {
            spec.path = path.to_string();
        }
        Ok(spec)
    }
}
