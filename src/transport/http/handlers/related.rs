use crate::app::wfs_service::ServiceError;
use crate::transport::http::geojson::RelatedJsonWriter;
use crate::transport::http::handlers::common::{json_stream_response, service_error_response};
use crate::transport::http::params::KvpParams;
use crate::transport::http::types::{AppState, RelatedParams};
use axum::extract::{Path, Query, State};
use axum::http::{Method, Uri};
use axum::response::Response;
use tracing::instrument;

#[utoipa::path(
    get,
    path = "/{service_id}/related/",
    params(
        ("service_id" = String, Path, description = "Id of the published service"),
        RelatedParams
    ),
    responses(
        (status = 200, description = "Related objects as a RelationCollection (application/json) or an exception report (text/xml)")
    )
)]
#[instrument(skip_all, fields(service_id = %service_id))]
pub async fn related_handler(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
    method: Method,
    uri: Uri,
    Query(query): Query<Vec<(String, String)>>,
) -> Response {
    let params = KvpParams::new(query);
    let result: Result<Response, ServiceError> = async {
        let service = state.wfs.service(&service_id).await?;
        let related = state
            .wfs
            .related(&service, params.get("id"), params.get("field"))
            .await?;
        Ok(json_stream_response(RelatedJsonWriter::new(related).into_stream()))
    }
    .await;

    match result {
        Ok(response) => response,
        Err(e) => service_error_response(e, &method, &uri),
    }
}
