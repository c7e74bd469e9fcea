//! ModelRegistry for mapping model names to ModelDescriptor implementations.

use crate::domain::model::{DynamicModel, ModelDescriptor, ModelError};
use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// A registry that maps model names to their descriptors.
#[derive(Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<dyn ModelDescriptor>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M: ModelDescriptor + 'static>(&mut self, model: M) {
        self.models.insert(model.name().to_string(), Arc::new(model));
    }

    /// Returns None if the model is not registered. `public.x` and `x` name the same model.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ModelDescriptor>> {
        let name = name.strip_prefix("public.").unwrap_or(name);
        self.models.get(name).cloned()
    }

    pub fn list_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.keys().cloned().collect();
        names.sort();
        names
    }

    /// Introspects every model referenced by a stored feature type.
    ///
    /// This gives a warm start: the first request after a restart does not pay
    /// for introspection. Models that fail to load are skipped and retried on
    /// first use.
    pub async fn load_from_db(pool: &PgPool) -> anyhow::Result<Self> {
        let names: Vec<String> = match sqlx::query_scalar(
            "SELECT DISTINCT model FROM wfs_featuretype WHERE model IS NOT NULL AND model <> '' ORDER BY model",
        )
        .fetch_all(pool)
        .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "cannot list published models, starting with an empty registry");
                return Ok(ModelRegistry::new());
            }
        };

        let mut reg = ModelRegistry::new();
        for name in names {
            match DynamicModel::introspect(pool, &name).await {
                Ok(model) => reg.register(model),
                Err(e) => warn!(model = %name, error = %e, "skipping model at startup"),
            }
        }
        info!(models = reg.models.len(), "model registry loaded");
        Ok(reg)
    }
}

/// Resolves model names for the feature engine.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn model(&self, name: &str) -> Result<Arc<dyn ModelDescriptor>, ModelError>;
}

/// Registry behind a lock that introspects unknown models on first use.
pub struct SharedModelRegistry {
    registry: RwLock<ModelRegistry>,
    pool: Option<PgPool>,
}

impl SharedModelRegistry {
    pub fn new(registry: ModelRegistry, pool: Option<PgPool>) -> Self {
        Self {
            registry: RwLock::new(registry),
            pool,
        }
    }

    pub async fn list_models(&self) -> Vec<String> {
        self.registry.read().await.list_models()
    }
}

#[async_trait]
impl ModelProvider for SharedModelRegistry {
    async fn model(&self, name: &str) -> Result<Arc<dyn ModelDescriptor>, ModelError> {
        {
            let registry = self.registry.read().await;
            if let Some(m) = registry.get(name) {
                return Ok(m);
            }
        }

        let Some(pool) = &self.pool else {
            return Err(ModelError::UnknownModel(name.to_string()));
        };
        let model = DynamicModel::introspect(pool, name).await?;

        let mut registry = self.registry.write().await;
        if let Some(m) = registry.get(name) {
            return Ok(m);
        }
        registry.register(model);
        registry
            .get(name)
            .ok_or_else(|| ModelError::UnknownModel(name.to_string()))
    }
}
