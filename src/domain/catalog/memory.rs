use super::{Catalog, CatalogError, FeatureType, Service};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Entries {
    services: BTreeMap<i64, Service>,
    feature_types: Vec<FeatureType>,
}

/// Catalog held in process memory; used by tests and embedders.
#[derive(Default)]
pub struct InMemoryCatalog {
    entries: RwLock<Entries>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: Service) -> Self {
        self.entries.get_mut().services.insert(service.id, service);
        self
    }

    pub fn with_feature_type(mut self, feature_type: FeatureType) -> Self {
        let entries = self.entries.get_mut();
        let id = entries.feature_types.len() as i64 + 1;
        let mut feature_type = feature_type;
        feature_type.id.get_or_insert(id);
        entries.feature_types.push(feature_type);
        self
    }

    /// Inserts or replaces by id; a model change clears the stored field list.
    pub async fn save_feature_type(&self, mut feature_type: FeatureType) -> i64 {
        let mut entries = self.entries.write().await;
        let next_id = entries.feature_types.iter().filter_map(|f| f.id).max().unwrap_or(0) + 1;
        let id = *feature_type.id.get_or_insert(next_id);

        match entries.feature_types.iter_mut().find(|f| f.id == Some(id)) {
            Some(stored) => {
                if stored.model() != feature_type.model() {
                    feature_type.set_fields(Vec::new());
                }
                *stored = feature_type;
            }
            None => entries.feature_types.push(feature_type),
        }
        id
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn service(&self, id: i64) -> Result<Option<Service>, CatalogError> {
        Ok(self.entries.read().await.services.get(&id).cloned())
    }

    async fn feature_types(&self, service_id: i64) -> Result<Vec<FeatureType>, CatalogError> {
        let entries = self.entries.read().await;
        let mut types: Vec<FeatureType> = entries
            .feature_types
            .iter()
            .filter(|ft| ft.service_id == service_id)
            .cloned()
            .collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(types)
    }
}
