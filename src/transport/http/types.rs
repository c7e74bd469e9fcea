use crate::app::wfs_service::WfsService;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

#[derive(Clone)]
pub struct AppState {
    pub wfs: Arc<WfsService>,
    /// Pinged by `/health`; absent when the service runs without a database.
    pub pool: Option<PgPool>,
    pub legacy_version_negotiation: bool,
}

impl AppState {
    pub fn new(wfs: WfsService, pool: Option<PgPool>) -> Self {
        Self {
            wfs: Arc::new(wfs),
            pool,
            legacy_version_negotiation: false,
        }
    }

    pub fn with_legacy_version_negotiation(mut self, enabled: bool) -> Self {
        self.legacy_version_negotiation = enabled;
        self
    }
}

#[derive(Serialize, Debug, ToSchema)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// WFS key-value parameters. Keys are matched case-insensitively, so this
/// struct documents the surface rather than being used for extraction.
#[allow(dead_code)]
#[derive(Deserialize, Debug, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct WfsParams {
    /// `GetCapabilities`, `DescribeFeatureType` or `GetFeature`.
    pub request: String,
    /// Always `WFS`.
    pub service: String,
    /// `1.0.0` or `1.1.0` (default).
    pub version: Option<String>,
    /// Comma separated feature type names.
    pub typename: Option<String>,
    /// `xmlschema` for DescribeFeatureType; `json` or `gml` families for GetFeature.
    pub outputformat: Option<String>,
    /// `typename.id[,typename.id...]`.
    pub featureid: Option<String>,
    /// `minx,miny,maxx,maxy[,crs]`.
    pub bbox: Option<String>,
    pub srsname: Option<String>,
    pub resolution: Option<f64>,
    /// Simplification tolerance.
    pub precision: Option<f64>,
    pub maxfeatures: Option<u64>,
}

#[allow(dead_code)]
#[derive(Deserialize, Debug, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RelatedParams {
    /// `typename.id` of the feature owning the relation.
    pub id: String,
    /// Name of the one-to-many relation field.
    pub field: String,
}
