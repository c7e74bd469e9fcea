//! Services and feature types published over WFS.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryCatalog;
pub use postgres::PgCatalog;

use crate::domain::crs::{Crs, CrsError};
use async_trait::async_trait;
use std::sync::LazyLock;
use thiserror::Error;

static COMMA_SPLIT: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\s*,\s*").expect("static comma regex"));

/// Splits a stored comma list; surrounding whitespace is dropped and an empty string yields no items.
pub fn split_comma_separated(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    COMMA_SPLIT.split(trimmed).map(str::to_string).collect()
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub title: String,
    pub keywords: Vec<String>,
    pub abstract_text: String,
    pub fees: String,
    pub access_constraints: String,
}

impl Service {
    pub fn new(id: i64, name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            title: title.into(),
            keywords: Vec::new(),
            abstract_text: String::new(),
            fees: String::new(),
            access_constraints: String::new(),
        }
    }

    /// `{base}/{id}/`
    pub fn online_resource(&self, base_url: &str) -> String {
        format!("{}/{}/", base_url.trim_end_matches('/'), self.id)
    }
}

/// Extra predicate applied from `min_resolution` upwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionFilter {
    pub min_resolution: f64,
    /// SQL condition for raw types, JSON filter document for model types.
    pub query: String,
}

/// Static extent advertised in the capabilities document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundingBox {
    pub minx: String,
    pub miny: String,
    pub maxx: String,
    pub maxy: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureType {
    pub id: Option<i64>,
    pub service_id: i64,
    pub name: String,
    pub title: String,
    pub keywords: Vec<String>,
    pub abstract_text: String,
    pub srs: String,
    pub other_srs: Vec<String>,
    model: Option<String>,
    fields: Vec<String>,
    pub query: String,
    resolution_filters: Vec<ResolutionFilter>,
    pub bounding_boxes: Vec<BoundingBox>,
    pub metadata_urls: Vec<MetadataUrl>,
}

impl FeatureType {
    pub fn new(service_id: i64, name: impl Into<String>) -> Self {
        Self {
            id: None,
            service_id,
            name: name.into(),
            title: String::new(),
            keywords: Vec::new(),
            abstract_text: String::new(),
            srs: "EPSG:4326".to_string(),
            other_srs: vec!["EPSG:3857".to_string()],
            model: None,
            fields: Vec::new(),
            query: "{}".to_string(),
            resolution_filters: Vec::new(),
            bounding_boxes: Vec::new(),
            metadata_urls: Vec::new(),
        }
    }

    /// Raw SQL feature types have no model and store a SELECT in `query`.
    pub fn raw_sql(service_id: i64, name: impl Into<String>, sql: impl Into<String>) -> Self {
        let mut ft = Self::new(service_id, name);
        ft.query = sql.into();
        ft
    }

    pub fn model_backed(service_id: i64, name: impl Into<String>, model: impl Into<String>) -> Self {
        let mut ft = Self::new(service_id, name);
        ft.model = Some(model.into());
        ft
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn is_raw_sql(&self) -> bool {
        self.model.is_none()
    }

    /// Changing the model invalidates the field list, whose names belong to the old model.
    pub fn set_model(&mut self, model: Option<String>) {
        if self.model != model {
            self.fields.clear();
        }
        self.model = model;
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn set_fields(&mut self, fields: Vec<String>) {
        self.fields = fields;
    }

    pub fn resolution_filters(&self) -> &[ResolutionFilter] {
        &self.resolution_filters
    }

    pub fn add_resolution_filter(&mut self, min_resolution: f64, query: impl Into<String>) {
        self.resolution_filters.push(ResolutionFilter {
            min_resolution,
            query: query.into(),
        });
        self.resolution_filters
            .sort_by(|a, b| a.min_resolution.total_cmp(&b.min_resolution));
    }

    /// The filter with the greatest threshold not above `resolution`.
    pub fn resolution_filter(&self, resolution: f64) -> Option<&ResolutionFilter> {
        self.resolution_filters
            .iter()
            .filter(|f| f.min_resolution <= resolution)
            .max_by(|a, b| a.min_resolution.total_cmp(&b.min_resolution))
    }

    pub fn crs(&self) -> Result<Crs, CrsError> {
        Crs::parse(&self.srs)
    }

    pub fn srid(&self) -> Result<i32, CrsError> {
        Ok(self.crs()?.srid())
    }

    /// Primary SRS followed by the alternates.
    pub fn srs_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.srs.as_str()).chain(self.other_srs.iter().map(String::as_str))
    }
}

/// Read access to the published services.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn service(&self, id: i64) -> Result<Option<Service>, CatalogError>;

    /// Feature types of a service, ordered by name.
    async fn feature_types(&self, service_id: i64) -> Result<Vec<FeatureType>, CatalogError>;

    /// Case-insensitive lookup by name.
    async fn feature_type(
        &self,
        service_id: i64,
        name: &str,
    ) -> Result<Option<FeatureType>, CatalogError> {
        Ok(self
            .feature_types(service_id)
            .await?
            .into_iter()
            .find(|ft| ft.name.eq_ignore_ascii_case(name)))
    }
}
