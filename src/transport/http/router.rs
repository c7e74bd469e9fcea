use crate::transport::http::handlers::{health, related, wfs};
use crate::transport::http::types::ApiResponse;
use axum::routing::get;
use axum::Router;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        health::healthcheck_handler,
        wfs::wfs_handler,
        related::related_handler
    ),
    components(schemas(ApiResponse))
)]
#[allow(dead_code)]
pub struct ApiDoc;

pub fn create_router(app_state: crate::transport::http::types::AppState) -> Router {
    Router::new()
        .route("/health", get(health::healthcheck_handler))
        .route("/:service_id", get(wfs::wfs_handler))
        .route("/:service_id/", get(wfs::wfs_handler))
        .route("/:service_id/related", get(related::related_handler))
        .route("/:service_id/related/", get(related::related_handler))
        .with_state(app_state)
}
