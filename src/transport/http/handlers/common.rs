use crate::app::wfs_service::ServiceError;
use crate::error::WfsException;
use crate::storage::cursor::CursorError;
use crate::transport::http::xml::exception_response;
use axum::body::Body;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use tracing::error;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Maps a service failure to its exception report. Query faults are logged
/// with the request line and never expose their detail to the client.
pub fn service_error_response(err: ServiceError, method: &Method, uri: &Uri) -> Response {
    match err {
        ServiceError::Protocol(e) => exception_response(&e),
        ServiceError::Query(e) => {
            error!(error = %e, "caught exception in request [{} {}]", method, uri);
            exception_response(&WfsException::malformed_json_query())
        }
        ServiceError::Internal(e) => {
            error!(error = %e, "internal failure in request [{} {}]", method, uri);
            exception_response(&WfsException::unknown_error())
        }
    }
}

pub fn json_stream_response<S>(chunks: S) -> Response
where
    S: Stream<Item = Result<String, CursorError>> + Send + 'static,
{
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, JSON_CONTENT_TYPE)],
        Body::from_stream(chunks),
    )
        .into_response()
}
