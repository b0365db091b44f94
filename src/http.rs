//! HTTP boundary for device uploads.
//!
//! Two routes, matching what the companion app expects:
//!
//! - `GET /fitbit-ping` answers `FITBIT_HOST` so the app can discover the server.
//! - `POST /fitbit-endpoint` takes one upload. Attributes travel in headers
//!   (`X_FITBIT_FILENAME`, `X_FITBIT_BATCH_SIZE`, `X_FITBIT_ENCODING`, plus the
//!   standard `Content-Length`), the payload in the body.
//!
//! Both accept a trailing slash. Responses are plain text.

use std::sync::Arc;

use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::{get, post};
use bytes::Bytes;

use crate::error::Error;
use crate::ingest::{Ingestor, Upload};

/// Token returned by the liveness check.
pub const PING_TOKEN: &str = "FITBIT_HOST";

/// Header carrying the recording name.
pub const FILENAME_HEADER: &str = "x_fitbit_filename";

/// Header carrying the number of samples per axis (motion only).
pub const BATCH_SIZE_HEADER: &str = "x_fitbit_batch_size";

/// Header selecting the axis encoding (`int16` or `float32`).
pub const ENCODING_HEADER: &str = "x_fitbit_encoding";

/// Map a domain error to an HTTP status code and a short text body.
///
/// Client errors map to `400` with the terse bodies the companion app knows;
/// everything else is a `500`.
///
/// # Arguments
///
/// * `err` - The domain error to convert.
///
/// # Returns
///
/// The status code and response body.
pub fn error_to_response(err: &Error) -> (StatusCode, String) {
    match err {
        Error::MissingAttribute(_) => (StatusCode::BAD_REQUEST, "Missing headers".into()),
        Error::InvalidAttribute { .. } => (StatusCode::BAD_REQUEST, "Bad request".into()),
        Error::UnknownRecordingKind(_) => (StatusCode::BAD_REQUEST, "Unknown file type".into()),
        Error::SizeMismatch { expected, actual } => (
            StatusCode::BAD_REQUEST,
            format!("Size mismatch: expected {expected} bytes, got {actual}"),
        ),
        Error::MalformedFrame(detail) => {
            (StatusCode::BAD_REQUEST, format!("Malformed frame: {detail}"))
        }
        Error::InvalidRecordingName(_) => {
            (StatusCode::BAD_REQUEST, "Invalid file name".into())
        }
        Error::Storage(_) | Error::CorruptLog { .. } | Error::WriterClosed => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Server error: {err}"),
        ),
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
}

/// Collect the upload attributes from request headers.
fn upload_from_request(headers: &HeaderMap, body: Bytes) -> Upload {
    Upload {
        recording_name: header_string(headers, FILENAME_HEADER),
        content_length: header_string(headers, header::CONTENT_LENGTH.as_str()),
        batch_size: header_string(headers, BATCH_SIZE_HEADER),
        encoding: header_string(headers, ENCODING_HEADER),
        body,
    }
}

async fn ping() -> &'static str {
    PING_TOKEN
}

async fn upload(
    State(ingestor): State<Arc<Ingestor>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    match ingestor.ingest(upload_from_request(&headers, body)).await {
        Ok(outcome) => (StatusCode::OK, outcome.body()),
        Err(e) => error_to_response(&e),
    }
}

/// Build the axum [`Router`] serving the ping and upload routes.
///
/// # Arguments
///
/// * `ingestor` - Shared ingestion coordinator.
/// * `max_upload_bytes` - Request body limit; larger uploads get `413`.
pub fn router(ingestor: Arc<Ingestor>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/fitbit-ping", get(ping))
        .route("/fitbit-ping/", get(ping))
        .route("/fitbit-endpoint", post(upload))
        .route("/fitbit-endpoint/", post(upload))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(ingestor)
}
