use crate::app::wfs_service::{OutputFormat, ServiceError};
use crate::transport::http::geojson::GeoJsonWriter;
use crate::transport::http::handlers::common::{json_stream_response, service_error_response};
use crate::transport::http::params::{scan_describe, scan_get_feature, scan_request, KvpParams, RequestKind};
use crate::transport::http::types::{AppState, WfsParams};
use crate::transport::http::xml::{self, FeatureCollectionView};
use axum::extract::{Path, Query, State};
use axum::http::{Method, Uri};
use axum::response::Response;
use tracing::{debug, instrument};

#[utoipa::path(
    get,
    path = "/{service_id}/",
    params(
        ("service_id" = String, Path, description = "Id of the published service"),
        WfsParams
    ),
    responses(
        (status = 200, description = "Capabilities, schema, GML feature collection or exception report (text/xml); GeoJSON feature collection (application/json)")
    )
)]
#[instrument(skip_all, fields(service_id = %service_id))]
pub async fn wfs_handler(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
    method: Method,
    uri: Uri,
    Query(query): Query<Vec<(String, String)>>,
) -> Response {
    let params = KvpParams::new(query);
    match dispatch(&state, &service_id, &params).await {
        Ok(response) => response,
        Err(e) => service_error_response(e, &method, &uri),
    }
}

async fn dispatch(state: &AppState, service_id: &str, params: &KvpParams) -> Result<Response, ServiceError> {
    let service = state.wfs.service(service_id).await?;
    let request = scan_request(params, state.legacy_version_negotiation)?;
    debug!(request = ?request.request, version = request.version.as_str(), "dispatching");

    match request.request {
        RequestKind::GetCapabilities => {
            let caps = state.wfs.get_capabilities(service, request.version).await?;
            Ok(xml::capabilities(&caps))
        }
        RequestKind::DescribeFeatureType => {
            let type_names = scan_describe(params)?;
            let schemas = state
                .wfs
                .describe_feature_type(&service, type_names.as_deref(), request.version)
                .await?;
            Ok(xml::describe_feature_type(&schemas))
        }
        RequestKind::GetFeature => {
            let feature_request = scan_get_feature(params, request.version)?;
            let collection = state.wfs.get_feature(&service, feature_request).await?;
            match collection.output {
                OutputFormat::Json => Ok(json_stream_response(GeoJsonWriter::new(collection).into_stream())),
                OutputFormat::Gml => {
                    let crs = collection.crs.to_legacy();
                    let features = collection
                        .stream
                        .collect()
                        .await
                        .map_err(|e| ServiceError::Query(e.into()))?;
                    Ok(xml::render_template(FeatureCollectionView::new(
                        features,
                        collection.bbox,
                        crs,
                        &collection.version,
                    )))
                }
            }
        }
    }
}
